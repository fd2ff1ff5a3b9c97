//! Instance directory
//!
//! Resolves instance ids to connection targets. The live orchestrator view
//! is merged over the static instance file; when the live source is
//! unavailable or empty the static list is served unchanged.

pub mod kubernetes;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::bridge::BridgeTarget;
use loco_common::{
    DiscoveryMode, Error, FailureType, HealthRecord, HealthStatus, Instance, InstanceSource,
    Result, StaticInstanceConfig, TargetRef,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a live source looks for instances (reported, not interpreted)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryScope {
    pub namespace: String,
    pub service: String,
    pub label_selector: String,
}

/// Result of one live query
#[derive(Debug, Clone)]
pub struct Discovered {
    /// Which API answered
    pub mode: DiscoveryMode,
    pub instances: Vec<Instance>,
}

/// A runtime source of live instances
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn scope(&self) -> DiscoveryScope {
        DiscoveryScope::default()
    }

    /// Query the current instance set
    async fn discover(&self) -> Result<Discovered>;
}

struct LiveSource {
    source: Arc<dyn DiscoverySource>,
    timeout: Duration,
}

/// One resolved view of the fleet
#[derive(Debug, Clone)]
struct Snapshot {
    instances: Vec<Instance>,
    mode: DiscoveryMode,
    live_count: usize,
    refreshed_at: Option<Instant>,
    updated: DateTime<Utc>,
    last_error: Option<String>,
}

/// Discovery observability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryInfo {
    pub mode: DiscoveryMode,
    pub kubernetes_configured: bool,
    pub using_kubernetes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    pub live_instances: usize,
    pub static_instances: usize,
    pub total_instances: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStats {
    pub total: usize,
    pub ready: usize,
    pub not_ready: usize,
}

/// Fleet view with readiness counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveView {
    pub mode: DiscoveryMode,
    pub stats: LiveStats,
    pub instances: Vec<LiveInstance>,
    pub last_update: DateTime<Utc>,
}

/// Readiness combined with the latest probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiveStatus {
    Ready,
    Degraded,
    NotReady,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveAddresses {
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    pub hostname: Option<String>,
    pub dns_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveHealth {
    /// Orchestrator readiness
    pub ready: bool,
    /// Latest monitor status, `unknown` before the first probe
    pub status: HealthStatus,
    pub failure_type: FailureType,
    pub details: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveKubernetes {
    pub namespace: String,
    pub target_ref: Option<TargetRef>,
}

/// One instance as shown on the live view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveInstance {
    pub id: String,
    pub display_name: String,
    pub status: LiveStatus,
    pub provisioned: bool,
    pub source: InstanceSource,
    pub vnc_target: String,
    pub stream_url: String,
    pub pod_name: Option<String>,
    pub addresses: LiveAddresses,
    pub ports: BTreeMap<String, u16>,
    pub health: LiveHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<LiveKubernetes>,
}

impl LiveInstance {
    pub fn new(instance: Instance, record: Option<&HealthRecord>) -> Self {
        let status = match record.map(|r| r.status) {
            _ if !instance.ready => LiveStatus::NotReady,
            Some(HealthStatus::Degraded | HealthStatus::Unhealthy) => LiveStatus::Degraded,
            _ => LiveStatus::Ready,
        };
        let health = LiveHealth {
            ready: instance.ready,
            status: record.map(|r| r.status).unwrap_or_default(),
            failure_type: record.map(|r| r.failure_type).unwrap_or_default(),
            details: record
                .filter(|r| !r.errors.is_empty())
                .map(|r| r.errors.join("; ")),
            last_check: record.map(|r| r.timestamp),
        };

        let (addresses, ports, kubernetes) = match instance.endpoint {
            Some(meta) => (
                LiveAddresses {
                    pod_ip: meta.pod_ip,
                    hostname: meta.hostname,
                    dns_name: meta.dns_name,
                },
                meta.ports,
                Some(LiveKubernetes {
                    namespace: meta.namespace,
                    target_ref: meta.target_ref,
                }),
            ),
            None => match BridgeTarget::parse(&instance.vnc_target) {
                Ok(target) => (
                    LiveAddresses {
                        pod_ip: target.host,
                        ..Default::default()
                    },
                    BTreeMap::from([("vnc".to_string(), target.port)]),
                    None,
                ),
                Err(_) => (LiveAddresses::default(), BTreeMap::new(), None),
            },
        };

        Self {
            id: instance.id,
            display_name: instance.display_name,
            status,
            provisioned: instance.provisioned,
            source: instance.source,
            vnc_target: instance.vnc_target,
            stream_url: instance.stream_url,
            pod_name: instance.pod_name,
            addresses,
            ports,
            health,
            kubernetes,
        }
    }
}

/// Instance directory with cached live discovery
pub struct InstanceDirectory {
    static_instances: Vec<Instance>,
    live: Option<LiveSource>,
    ttl: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    refresh_lock: Mutex<()>,
}

impl InstanceDirectory {
    /// Directory serving only `static_instances`
    pub fn new(static_instances: Vec<Instance>, ttl: Duration) -> Self {
        let static_instances = dedup_by_id(static_instances);
        let snapshot = Snapshot {
            instances: static_instances.clone(),
            mode: DiscoveryMode::Static,
            live_count: 0,
            refreshed_at: None,
            updated: Utc::now(),
            last_error: None,
        };
        Self {
            static_instances,
            live: None,
            ttl,
            snapshot: RwLock::new(Arc::new(snapshot)),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Attach a live source queried with the given timeout
    pub fn with_live_source(mut self, source: Arc<dyn DiscoverySource>, timeout: Duration) -> Self {
        self.live = Some(LiveSource { source, timeout });
        self
    }

    pub fn static_instances(&self) -> &[Instance] {
        &self.static_instances
    }

    /// Merged instance list. Never fails.
    pub async fn get_instances(&self) -> Vec<Instance> {
        if self.live.is_none() {
            return self.static_instances.clone();
        }

        let current = self.current();
        if self.is_fresh(&current) {
            return current.instances.clone();
        }
        self.refresh_since(None).await.instances.clone()
    }

    /// Instances marked provisioned
    pub async fn get_provisioned_instances(&self) -> Vec<Instance> {
        self.get_instances()
            .await
            .into_iter()
            .filter(|i| i.provisioned)
            .collect()
    }

    pub async fn get_instance_by_id(&self, id: &str) -> Result<Instance> {
        self.get_instances()
            .await
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| Error::instance_not_found(id))
    }

    /// Re-query the live source now, bypassing the cache
    pub async fn refresh_discovery(&self) -> Vec<Instance> {
        if self.live.is_none() {
            return self.static_instances.clone();
        }
        self.refresh_since(Some(Instant::now()))
            .await
            .instances
            .clone()
    }

    /// True when live discovery is configured and currently authoritative
    pub fn is_using_kubernetes_discovery(&self) -> bool {
        self.live.is_some() && self.current().mode != DiscoveryMode::Static
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.current().mode
    }

    pub fn discovery_info(&self) -> DiscoveryInfo {
        let snapshot = self.current();
        let scope = self.live.as_ref().map(|l| l.source.scope());
        DiscoveryInfo {
            mode: snapshot.mode,
            kubernetes_configured: self.live.is_some(),
            using_kubernetes: self.is_using_kubernetes_discovery(),
            namespace: scope.as_ref().map(|s| s.namespace.clone()),
            service: scope.as_ref().map(|s| s.service.clone()),
            label_selector: scope.map(|s| s.label_selector),
            live_instances: snapshot.live_count,
            static_instances: self.static_instances.len(),
            total_instances: snapshot.instances.len(),
            last_refresh: snapshot.refreshed_at.map(|_| snapshot.updated),
            last_error: snapshot.last_error.clone(),
            cache_ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Current instance list with readiness counts.
    ///
    /// `health` looks up the latest monitor record of an instance.
    pub async fn live_view<F>(&self, health: F) -> LiveView
    where
        F: Fn(&str) -> Option<HealthRecord>,
    {
        let instances = self.get_instances().await;
        let ready = instances.iter().filter(|i| i.ready).count();
        let total = instances.len();
        let snapshot = self.current();
        let instances = instances
            .into_iter()
            .map(|i| {
                let record = health(&i.id);
                LiveInstance::new(i, record.as_ref())
            })
            .collect();
        LiveView {
            mode: snapshot.mode,
            stats: LiveStats {
                total,
                ready,
                not_ready: total - ready,
            },
            instances,
            last_update: snapshot.updated,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        snapshot
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Single-flight refresh.
    ///
    /// `forced_at` is when a forced refresh was requested; a snapshot taken
    /// after that point by a concurrent caller satisfies it.
    async fn refresh_since(&self, forced_at: Option<Instant>) -> Arc<Snapshot> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current();
        let satisfied = match forced_at {
            Some(requested) => current.refreshed_at.is_some_and(|at| at >= requested),
            None => self.is_fresh(&current),
        };
        if satisfied {
            return current;
        }

        let Some(live) = &self.live else {
            return current;
        };

        let (discovered, last_error) =
            match tokio::time::timeout(live.timeout, live.source.discover()).await {
                Ok(Ok(discovered)) => (discovered, None),
                Ok(Err(e)) => {
                    warn!("Live discovery failed, serving static instances: {}", e);
                    (Discovered::empty(), Some(e.to_string()))
                }
                Err(_) => {
                    let e = Error::DiscoveryUnavailable(format!(
                        "query timed out after {}ms",
                        live.timeout.as_millis()
                    ));
                    warn!("{}", e);
                    (Discovered::empty(), Some(e.to_string()))
                }
            };

        let snapshot = Arc::new(self.merge(discovered, last_error));
        if snapshot.mode != current.mode {
            info!(
                "Discovery mode {} -> {} ({} instances)",
                current.mode,
                snapshot.mode,
                snapshot.instances.len()
            );
        } else {
            debug!(
                "Discovery refreshed: {} instances ({} live)",
                snapshot.instances.len(),
                snapshot.live_count
            );
        }

        *self.snapshot.write() = snapshot.clone();
        snapshot
    }

    fn merge(&self, discovered: Discovered, last_error: Option<String>) -> Snapshot {
        let live_mode = discovered.mode;
        let live = dedup_by_id(discovered.instances);
        let live_count = live.len();

        let (instances, mode) = if live.is_empty() {
            (self.static_instances.clone(), DiscoveryMode::Static)
        } else {
            let live_ids: HashSet<String> = live.iter().map(|i| i.id.clone()).collect();
            let mut merged = live;
            merged.extend(
                self.static_instances
                    .iter()
                    .filter(|i| !live_ids.contains(&i.id))
                    .cloned(),
            );
            (merged, live_mode)
        };

        Snapshot {
            instances,
            mode,
            live_count,
            refreshed_at: Some(Instant::now()),
            updated: Utc::now(),
            last_error,
        }
    }
}

impl Discovered {
    fn empty() -> Self {
        Self {
            mode: DiscoveryMode::Static,
            instances: Vec::new(),
        }
    }
}

fn dedup_by_id(instances: Vec<Instance>) -> Vec<Instance> {
    let mut seen = HashSet::new();
    instances
        .into_iter()
        .filter(|i| {
            let fresh = seen.insert(i.id.clone());
            if !fresh {
                warn!("Duplicate instance id {} ignored", i.id);
            }
            fresh
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StaticFile {
    List(Vec<StaticInstanceConfig>),
    Wrapped { instances: Vec<StaticInstanceConfig> },
}

/// Load the static instance file
pub fn load_static_instances(path: &Path) -> Result<Vec<Instance>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::ConfigNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let entries = match serde_json::from_str::<StaticFile>(&content) {
        Ok(StaticFile::List(entries)) | Ok(StaticFile::Wrapped { instances: entries }) => entries,
        Err(e) => {
            return Err(Error::InvalidConfig(format!(
                "{}: {}",
                path.display(),
                e
            )))
        }
    };

    Ok(entries.into_iter().map(Instance::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_common::{Availability, EndpointMeta, Quality};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn static_instance(id: &str, provisioned: bool) -> Instance {
        Instance {
            id: id.to_string(),
            display_name: id.to_string(),
            vnc_target: format!("{id}.static:5901"),
            stream_url: String::new(),
            provisioned,
            source: InstanceSource::Static,
            ready: true,
            pod_name: None,
            description: None,
            endpoint: None,
        }
    }

    fn live_instance(id: &str) -> Instance {
        Instance {
            vnc_target: format!("10.0.0.{}:5901", id.len()),
            source: InstanceSource::Live,
            provisioned: true,
            pod_name: Some(format!("pod-{id}")),
            ..static_instance(id, true)
        }
    }

    struct FakeSource {
        result: parking_lot::Mutex<Result<Vec<Instance>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeSource {
        fn new(result: Result<Vec<Instance>>) -> Arc<Self> {
            Arc::new(Self {
                result: parking_lot::Mutex::new(result),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DiscoverySource for FakeSource {
        async fn discover(&self) -> Result<Discovered> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &*self.result.lock() {
                Ok(list) => Ok(Discovered {
                    mode: DiscoveryMode::KubernetesEndpoints,
                    instances: list.clone(),
                }),
                Err(e) => Err(Error::DiscoveryUnavailable(e.to_string())),
            }
        }
    }

    fn directory(source: Arc<FakeSource>) -> InstanceDirectory {
        InstanceDirectory::new(
            vec![static_instance("instance-0", true), static_instance("local", false)],
            Duration::from_secs(60),
        )
        .with_live_source(source, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_static_only() {
        let dir = InstanceDirectory::new(
            vec![static_instance("a", true), static_instance("b", false)],
            Duration::from_secs(10),
        );
        assert_eq!(dir.get_instances().await.len(), 2);
        assert_eq!(dir.get_provisioned_instances().await.len(), 1);
        assert_eq!(dir.mode(), DiscoveryMode::Static);
        assert!(!dir.is_using_kubernetes_discovery());
        assert!(matches!(
            dir.get_instance_by_id("zzz").await,
            Err(Error::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failing_live_source_falls_back_to_static() {
        let source = FakeSource::new(Err(Error::DiscoveryUnavailable("api down".into())));
        let dir = directory(source);

        let instances = dir.get_instances().await;
        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|i| i.source == InstanceSource::Static));
        assert!(!dir.is_using_kubernetes_discovery());
        assert!(dir.discovery_info().last_error.is_some());
    }

    #[tokio::test]
    async fn test_empty_live_source_falls_back_to_static() {
        let dir = directory(FakeSource::new(Ok(vec![])));
        assert_eq!(dir.get_instances().await.len(), 2);
        assert_eq!(dir.mode(), DiscoveryMode::Static);
    }

    #[tokio::test]
    async fn test_slow_live_source_times_out() {
        let source = Arc::new(FakeSource {
            result: parking_lot::Mutex::new(Ok(vec![live_instance("instance-1")])),
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(5),
        });
        let dir = directory(source);
        let instances = dir.get_instances().await;
        assert!(instances.iter().all(|i| i.source == InstanceSource::Static));
    }

    #[tokio::test]
    async fn test_live_wins_on_collision() {
        let source = FakeSource::new(Ok(vec![
            live_instance("instance-0"),
            live_instance("instance-1"),
        ]));
        let dir = directory(source);

        let instances = dir.get_instances().await;
        let ids: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["instance-0", "instance-1", "local"]);

        let zero = dir.get_instance_by_id("instance-0").await.unwrap();
        assert_eq!(zero.source, InstanceSource::Live);
        assert!(dir.is_using_kubernetes_discovery());
    }

    #[tokio::test]
    async fn test_lookup_matches_listing() {
        let dir = directory(FakeSource::new(Ok(vec![live_instance("instance-7")])));
        for inst in dir.get_instances().await {
            let found = dir.get_instance_by_id(&inst.id).await.unwrap();
            assert_eq!(found.vnc_target, inst.vnc_target);
        }
    }

    #[tokio::test]
    async fn test_cache_and_forced_refresh() {
        let source = FakeSource::new(Ok(vec![live_instance("instance-0")]));
        let dir = directory(source.clone());

        dir.get_instances().await;
        dir.get_instances().await;
        assert_eq!(source.calls(), 1);

        *source.result.lock() = Ok(vec![live_instance("instance-0"), live_instance("instance-2")]);
        let refreshed = dir.refresh_discovery().await;
        assert_eq!(source.calls(), 2);
        assert!(refreshed.iter().any(|i| i.id == "instance-2"));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_query() {
        let source = Arc::new(FakeSource {
            result: parking_lot::Mutex::new(Ok(vec![live_instance("instance-0")])),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let dir = Arc::new(directory(source.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.get_instances().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_live_view_counts_readiness() {
        let mut pending = live_instance("instance-1");
        pending.ready = false;
        let dir = directory(FakeSource::new(Ok(vec![live_instance("instance-0"), pending])));

        let view = dir.live_view(|_| None).await;
        assert_eq!(view.mode, DiscoveryMode::KubernetesEndpoints);
        assert_eq!(
            view.stats,
            LiveStats {
                total: 3,
                ready: 2,
                not_ready: 1
            }
        );
    }

    fn record(id: &str, status: HealthStatus) -> HealthRecord {
        HealthRecord {
            instance_id: id.to_string(),
            timestamp: Utc::now(),
            status,
            availability: Availability::default(),
            quality: Quality::default(),
            deep_health: BTreeMap::new(),
            failure_type: FailureType::StreamDegraded,
            recovery_needed: false,
            errors: vec!["stream slow".to_string()],
        }
    }

    #[tokio::test]
    async fn test_live_view_instance_shape() {
        let mut placed = live_instance("instance-0");
        placed.endpoint = Some(EndpointMeta {
            pod_ip: "10.1.0.5".to_string(),
            hostname: Some("loco-loco-emulator-0".to_string()),
            dns_name: Some("loco-loco-emulator-0.loco-loco-emulator.loco.svc.cluster.local".to_string()),
            namespace: "loco".to_string(),
            target_ref: Some(TargetRef {
                kind: Some("Pod".to_string()),
                name: Some("loco-loco-emulator-0".to_string()),
                ..Default::default()
            }),
            ports: BTreeMap::from([("vnc".to_string(), 5901), ("stream".to_string(), 6080)]),
        });
        let dir = directory(FakeSource::new(Ok(vec![placed])));

        let view = dir
            .live_view(|id| (id == "instance-0").then(|| record(id, HealthStatus::Degraded)))
            .await;
        let body = serde_json::to_value(&view).unwrap();
        let zero = &body["instances"][0];

        assert_eq!(zero["status"], "degraded");
        assert_eq!(zero["addresses"]["podIP"], "10.1.0.5");
        assert_eq!(zero["addresses"]["hostname"], "loco-loco-emulator-0");
        assert!(zero["addresses"]["dnsName"].as_str().unwrap().ends_with(".svc.cluster.local"));
        assert_eq!(zero["ports"], json!({"stream": 6080, "vnc": 5901}));
        assert_eq!(zero["podName"], "pod-instance-0");
        assert_eq!(zero["kubernetes"]["namespace"], "loco");
        assert_eq!(zero["kubernetes"]["targetRef"]["kind"], "Pod");
        assert_eq!(zero["health"]["ready"], true);
        assert_eq!(zero["health"]["status"], "degraded");
        assert_eq!(zero["health"]["failureType"], "stream-degraded");
        assert_eq!(zero["health"]["details"], "stream slow");

        // Static entry: address from the VNC target, never probed
        let local = &body["instances"][1];
        assert_eq!(local["id"], "local");
        assert_eq!(local["status"], "ready");
        assert_eq!(local["addresses"]["podIP"], "local.static");
        assert_eq!(local["ports"], json!({"vnc": 5901}));
        assert_eq!(local["health"]["status"], "unknown");
        assert!(local.get("kubernetes").is_none());

        let ready = view.instances.iter().filter(|i| i.health.ready).count();
        assert_eq!(view.stats.ready, ready);
    }

    #[test]
    fn test_not_ready_wins_over_monitor_status() {
        let mut pending = live_instance("instance-3");
        pending.ready = false;
        let healthy = record("instance-3", HealthStatus::Healthy);
        let live = LiveInstance::new(pending, Some(&healthy));
        assert_eq!(live.status, LiveStatus::NotReady);
        assert!(!live.health.ready);
        assert_eq!(live.health.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_load_static_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "instance-0", "vncTarget": "10.0.0.10:5901", "streamUrl": "http://10.0.0.10:6080/", "provisioned": true},
                {"id": "instance-1", "vnc": "vnc://10.0.0.11", "name": "Spare"}
            ]"#,
        )
        .unwrap();

        let instances = load_static_instances(&path).unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances[0].provisioned);
        assert_eq!(instances[1].display_name, "Spare");

        std::fs::write(&path, r#"{"instances": [{"id": "x", "vncTarget": "h:1"}]}"#).unwrap();
        assert_eq!(load_static_instances(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_load_static_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_static_instances(&missing),
            Err(Error::ConfigNotFound { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{").unwrap();
        assert!(matches!(
            load_static_instances(&bad),
            Err(Error::InvalidConfig(_))
        ));
    }
}
