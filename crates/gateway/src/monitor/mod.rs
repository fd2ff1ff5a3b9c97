//! Fleet health monitor
//!
//! Probes every listed instance on a fixed interval, keeps the latest
//! health record per instance, and hands unhealthy instances to the
//! recovery manager.

pub mod probe;
pub mod recovery;

use crate::config::MonitorConfig;
use crate::directory::InstanceDirectory;
use chrono::{DateTime, Utc};
use loco_common::{
    Error, FailureType, HealthRecord, HealthStatus, Result, SubsystemStatus,
};
use parking_lot::{Mutex, RwLock};
use probe::{classify, Prober};
use recovery::{RecoveryManager, RecoveryOutcome, RecoveryStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deep-health breakdown keyed by subsystem
pub type DeepHealth = BTreeMap<String, SubsystemStatus>;

/// Aggregate view over the latest records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySummary {
    pub monitoring: bool,
    pub cycles: u64,
    pub last_cycle: Option<DateTime<Utc>>,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub average_latency: Option<f64>,
    pub average_audio_quality: Option<f64>,
    pub average_video_quality: Option<f64>,
    pub failures: BTreeMap<String, usize>,
}

pub struct HealthMonitor {
    directory: Arc<InstanceDirectory>,
    prober: Arc<Prober>,
    recovery: Arc<RecoveryManager>,
    config: MonitorConfig,
    records: RwLock<HashMap<String, HealthRecord>>,
    running: Mutex<Option<CancellationToken>>,
    cycles: AtomicU64,
    last_cycle: RwLock<Option<DateTime<Utc>>>,
}

impl HealthMonitor {
    pub fn new(
        directory: Arc<InstanceDirectory>,
        recovery: Arc<RecoveryManager>,
        config: MonitorConfig,
    ) -> Result<Self> {
        Ok(Self {
            prober: Arc::new(Prober::new(&config)?),
            directory,
            recovery,
            config,
            records: RwLock::new(HashMap::new()),
            running: Mutex::new(None),
            cycles: AtomicU64::new(0),
            last_cycle: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Completed probe cycles since creation
    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Start the probe loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());
        drop(running);

        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.run(token).await;
        });

        info!(
            "Health monitor started (interval {}s)",
            self.config.interval().as_secs()
        );
        true
    }

    /// Stop the probe loop. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(token) => {
                token.cancel();
                info!("Health monitor stopped");
                true
            }
            None => false,
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_cycle().await;
        }
        debug!("Health monitor loop exited");
    }

    /// Probe every listed instance once and act on the results
    pub async fn run_cycle(&self) {
        let instances = self.directory.get_instances().await;
        let listed: HashSet<String> = instances.iter().map(|i| i.id.clone()).collect();

        let mut probes = JoinSet::new();
        for instance in instances {
            let prober = self.prober.clone();
            let thresholds = self.config.thresholds.clone();
            probes.spawn(async move {
                let result = prober.probe(&instance).await;
                classify(&instance.id, result, &thresholds)
            });
        }

        let mut fresh = HashMap::with_capacity(listed.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(record) => {
                    fresh.insert(record.instance_id.clone(), record);
                }
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }

        {
            let mut records = self.records.write();
            // Keep the previous record of a listed instance whose probe died
            for (id, old) in records.drain() {
                if listed.contains(&id) && !fresh.contains_key(&id) {
                    fresh.insert(id, old);
                }
            }
            *records = fresh.clone();
        }
        self.recovery.retain(|id| listed.contains(id));

        let mut counts = [0usize; 3];
        for record in fresh.values() {
            match record.status {
                HealthStatus::Healthy => {
                    counts[0] += 1;
                    self.recovery.reset(&record.instance_id);
                }
                HealthStatus::Degraded => counts[1] += 1,
                _ => counts[2] += 1,
            }

            if record.recovery_needed {
                self.maybe_recover(record);
            }
        }

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_cycle.write() = Some(Utc::now());
        info!(
            "Health cycle {}: {} healthy, {} degraded, {} unhealthy",
            cycle, counts[0], counts[1], counts[2]
        );
    }

    fn maybe_recover(&self, record: &HealthRecord) {
        let id = &record.instance_id;
        if !self.config.auto_recovery {
            debug!("{} needs recovery, auto recovery disabled", id);
            return;
        }
        if !self.recovery.can_recover(id) {
            warn!(
                "{} still {} after {} recovery attempts",
                id,
                record.failure_type,
                self.recovery.attempts(id)
            );
            return;
        }
        if self.recovery.is_in_flight(id) {
            return;
        }

        let recovery = self.recovery.clone();
        let id = id.clone();
        let failure = record.failure_type;
        tokio::spawn(async move {
            recovery.execute_recovery_strategy(&id, failure).await;
        });
    }

    pub fn get_all_metrics(&self) -> BTreeMap<String, HealthRecord> {
        self.records
            .read()
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    pub fn get_instance_metrics(&self, id: &str) -> Option<HealthRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn get_deep_health(&self) -> BTreeMap<String, DeepHealth> {
        self.records
            .read()
            .iter()
            .map(|(id, r)| (id.clone(), r.deep_health.clone()))
            .collect()
    }

    pub fn get_instance_deep_health(&self, id: &str) -> Option<DeepHealth> {
        self.records.read().get(id).map(|r| r.deep_health.clone())
    }

    pub fn get_quality_summary(&self) -> QualitySummary {
        let records = self.records.read();
        let mut summary = QualitySummary {
            monitoring: self.is_running(),
            cycles: self.cycle_count(),
            last_cycle: *self.last_cycle.read(),
            total: records.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unknown: 0,
            average_latency: None,
            average_audio_quality: None,
            average_video_quality: None,
            failures: BTreeMap::new(),
        };

        let mut latencies = Vec::new();
        for record in records.values() {
            match record.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
            if record.failure_type != FailureType::None {
                *summary
                    .failures
                    .entry(record.failure_type.to_string())
                    .or_default() += 1;
            }
            if let Some(ms) = record.quality.latency {
                latencies.push(ms as f64);
            }
        }

        summary.average_latency = mean(latencies.into_iter());
        summary.average_audio_quality = mean(records.values().map(|r| r.quality.audio_quality));
        summary.average_video_quality = mean(records.values().map(|r| r.quality.video_quality));
        summary
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.recovery.status()
    }

    /// Manually trigger recovery of a listed instance.
    ///
    /// Uses the latest record's failure type. `force` resets the attempt
    /// counter and treats a missing or clean record as `mixed`.
    pub async fn recover(&self, id: &str, force: bool) -> Result<RecoveryOutcome> {
        self.directory.get_instance_by_id(id).await?;

        let failure = self.get_instance_metrics(id).map(|r| r.failure_type);
        if force {
            let failure = match failure {
                None | Some(FailureType::None) => FailureType::Mixed,
                Some(f) => f,
            };
            return Ok(self.recovery.force_recovery(id, failure).await);
        }

        let Some(failure) = failure else {
            return Err(Error::NoHealthData { id: id.to_string() });
        };
        match self.recovery.execute_recovery_strategy(id, failure).await {
            RecoveryOutcome::Refused { attempts } => Err(Error::RecoveryExhausted {
                id: id.to_string(),
                attempts,
            }),
            outcome => Ok(outcome),
        }
    }

    #[cfg(test)]
    fn insert_record(&self, record: HealthRecord) {
        self.records
            .write()
            .insert(record.instance_id.clone(), record);
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_common::{Availability, Instance, InstanceSource, Quality};
    use recovery::UnmanagedController;
    use std::time::Duration;

    fn instance(id: &str, vnc_target: &str) -> Instance {
        Instance {
            id: id.to_string(),
            display_name: id.to_string(),
            vnc_target: vnc_target.to_string(),
            stream_url: String::new(),
            provisioned: true,
            source: InstanceSource::Static,
            ready: true,
            pod_name: None,
            description: None,
            endpoint: None,
        }
    }

    fn monitor(instances: Vec<Instance>, auto_recovery: bool) -> Arc<HealthMonitor> {
        let directory = Arc::new(InstanceDirectory::new(instances, Duration::from_secs(10)));
        let recovery = Arc::new(RecoveryManager::new(
            directory.clone(),
            Arc::new(UnmanagedController),
            2,
        ));
        let config = MonitorConfig {
            interval_secs: 60,
            probe_timeout_ms: 300,
            deep_health: false,
            auto_recovery,
            max_recovery_attempts: 2,
            ..Default::default()
        };
        Arc::new(HealthMonitor::new(directory, recovery, config).unwrap())
    }

    fn record(id: &str, status: HealthStatus, failure: FailureType) -> HealthRecord {
        HealthRecord {
            instance_id: id.to_string(),
            timestamp: Utc::now(),
            status,
            availability: Availability::default(),
            quality: Quality {
                latency: Some(20),
                audio_quality: 1.0,
                video_quality: 0.5,
            },
            deep_health: DeepHealth::new(),
            failure_type: failure,
            recovery_needed: status == HealthStatus::Unhealthy,
            errors: vec![],
        }
    }

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let mon = monitor(vec![], false);
        assert!(mon.start());
        assert!(!mon.start());
        assert!(mon.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mon.cycle_count(), 1);

        assert!(mon.stop());
        assert!(!mon.stop());
        assert!(!mon.is_running());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mon = monitor(vec![], false);
        assert!(!mon.stop());
        assert_eq!(mon.cycle_count(), 0);
    }

    #[tokio::test]
    async fn test_cycle_records_and_prunes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        let down = closed_port().await;

        let mon = monitor(
            vec![instance("instance-0", &up), instance("instance-1", &down)],
            false,
        );
        mon.insert_record(record("retired", HealthStatus::Healthy, FailureType::None));

        mon.run_cycle().await;

        let all = mon.get_all_metrics();
        assert_eq!(all.len(), 2);
        assert!(!all.contains_key("retired"));
        assert_eq!(all["instance-0"].status, HealthStatus::Healthy);
        assert_eq!(all["instance-1"].failure_type, FailureType::VncDown);
        assert!(all["instance-1"].recovery_needed);

        let summary = mon.get_quality_summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.failures["vnc-down"], 1);
        assert_eq!(summary.cycles, 1);
    }

    #[tokio::test]
    async fn test_auto_recovery_is_capped() {
        let down = closed_port().await;
        let mon = monitor(vec![instance("instance-0", &down)], true);

        for _ in 0..4 {
            mon.run_cycle().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let status = mon.recovery_status();
        assert_eq!(status.max_attempts, 2);
        assert_eq!(status.instances["instance-0"].attempts, 2);
        assert!(!status.instances["instance-0"].can_recover);
    }

    #[tokio::test]
    async fn test_manual_recover() {
        let mon = monitor(vec![instance("instance-0", "127.0.0.1:1")], false);

        assert!(matches!(
            mon.recover("ghost", false).await,
            Err(Error::InstanceNotFound { .. })
        ));
        assert!(matches!(
            mon.recover("instance-0", false).await,
            Err(Error::NoHealthData { .. })
        ));

        // Forced with no data escalates
        let outcome = mon.recover("instance-0", true).await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Failed { attempts: 1, .. }));

        mon.insert_record(record(
            "instance-0",
            HealthStatus::Unhealthy,
            FailureType::VncDown,
        ));
        mon.recover("instance-0", false).await.unwrap();
        assert!(matches!(
            mon.recover("instance-0", false).await,
            Err(Error::RecoveryExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_deep_health_reads() {
        let mon = monitor(vec![], false);
        let mut rec = record("instance-0", HealthStatus::Healthy, FailureType::None);
        rec.deep_health
            .insert("video".to_string(), SubsystemStatus::Ok);
        mon.insert_record(rec);

        assert_eq!(
            mon.get_instance_deep_health("instance-0").unwrap()["video"],
            SubsystemStatus::Ok
        );
        assert!(mon.get_instance_deep_health("instance-9").is_none());
        assert_eq!(mon.get_deep_health().len(), 1);
        assert_eq!(mon.get_quality_summary().average_latency, Some(20.0));
    }
}
