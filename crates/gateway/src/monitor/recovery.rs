//! Attempt-limited recovery strategies

use crate::directory::InstanceDirectory;
use async_trait::async_trait;
use dashmap::DashMap;
use loco_common::{Error, FailureType, Instance, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Restarts an instance through whatever manages it
#[async_trait]
pub trait InstanceController: Send + Sync {
    async fn restart(&self, instance: &Instance) -> Result<()>;
}

/// Controller for instances nothing in reach can restart
pub struct UnmanagedController;

#[async_trait]
impl InstanceController for UnmanagedController {
    async fn restart(&self, instance: &Instance) -> Result<()> {
        Err(Error::RestartUnsupported {
            id: instance.id.clone(),
        })
    }
}

/// Remediation chosen for a failure type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    RefreshDiscovery,
    Restart,
    /// Refresh, then restart
    Escalate,
}

impl RecoveryAction {
    pub fn for_failure(failure: FailureType) -> Option<Self> {
        match failure {
            FailureType::None => None,
            FailureType::StreamDegraded => Some(RecoveryAction::RefreshDiscovery),
            FailureType::VncDown | FailureType::ResourceExhausted => Some(RecoveryAction::Restart),
            FailureType::Mixed => Some(RecoveryAction::Escalate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RecoveryOutcome {
    Succeeded {
        action: RecoveryAction,
        attempts: u32,
    },
    Failed {
        action: RecoveryAction,
        attempts: u32,
        error: String,
    },
    /// Attempt budget spent, nothing was run
    Refused { attempts: u32 },
    NotNeeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecoveryStatus {
    pub attempts: u32,
    pub can_recover: bool,
    pub in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    pub max_attempts: u32,
    pub instances: BTreeMap<String, InstanceRecoveryStatus>,
}

#[derive(Default)]
struct RecoverySlot {
    flight: Mutex<()>,
    attempts: AtomicU32,
}

/// Per-instance attempt counters and single-flight execution
pub struct RecoveryManager {
    directory: Arc<InstanceDirectory>,
    controller: Arc<dyn InstanceController>,
    max_attempts: u32,
    slots: DashMap<String, Arc<RecoverySlot>>,
}

impl RecoveryManager {
    pub fn new(
        directory: Arc<InstanceDirectory>,
        controller: Arc<dyn InstanceController>,
        max_attempts: u32,
    ) -> Self {
        Self {
            directory,
            controller,
            max_attempts,
            slots: DashMap::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn slot(&self, id: &str) -> Arc<RecoverySlot> {
        self.slots.entry(id.to_string()).or_default().clone()
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.slots
            .get(id)
            .map(|s| s.attempts.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn can_recover(&self, id: &str) -> bool {
        self.attempts(id) < self.max_attempts
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .is_some_and(|s| s.flight.try_lock().is_err())
    }

    /// Zero the counter after a healthy probe. Skipped while a recovery runs.
    pub fn reset(&self, id: &str) {
        let Some(slot) = self.slots.get(id).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let Ok(_guard) = slot.flight.try_lock() else {
            debug!("Recovery in flight for {}, counter kept", id);
            return;
        };
        if slot.attempts.swap(0, Ordering::SeqCst) > 0 {
            info!("Instance {} healthy again, recovery counter reset", id);
        }
    }

    /// Drop state of instances that are no longer listed.
    ///
    /// A slot still held elsewhere (a pending or running recovery) is kept,
    /// so its attempt count survives.
    pub fn retain(&self, listed: impl Fn(&str) -> bool) {
        self.slots
            .retain(|id, slot| listed(id) || Arc::strong_count(slot) > 1);
    }

    pub fn status(&self) -> RecoveryStatus {
        let instances = self
            .slots
            .iter()
            .map(|entry| {
                let attempts = entry.attempts.load(Ordering::SeqCst);
                (
                    entry.key().clone(),
                    InstanceRecoveryStatus {
                        attempts,
                        can_recover: attempts < self.max_attempts,
                        in_flight: entry.flight.try_lock().is_err(),
                    },
                )
            })
            .collect();
        RecoveryStatus {
            max_attempts: self.max_attempts,
            instances,
        }
    }

    /// Run the remediation for `failure` unless the budget is spent
    pub async fn execute_recovery_strategy(&self, id: &str, failure: FailureType) -> RecoveryOutcome {
        self.run(id, failure, false).await
    }

    /// Reset the counter, then run the remediation
    pub async fn force_recovery(&self, id: &str, failure: FailureType) -> RecoveryOutcome {
        self.run(id, failure, true).await
    }

    async fn run(&self, id: &str, failure: FailureType, force: bool) -> RecoveryOutcome {
        let Some(action) = RecoveryAction::for_failure(failure) else {
            return RecoveryOutcome::NotNeeded;
        };

        let slot = self.slot(id);
        let _flight = slot.flight.lock().await;

        if force {
            slot.attempts.store(0, Ordering::SeqCst);
        }

        let previous = slot.attempts.load(Ordering::SeqCst);
        if previous >= self.max_attempts {
            warn!(
                "Recovery refused for {}: {} of {} attempts used",
                id, previous, self.max_attempts
            );
            return RecoveryOutcome::Refused { attempts: previous };
        }
        let attempts = slot.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            "Recovering {} ({}) with {:?}, attempt {}/{}",
            id, failure, action, attempts, self.max_attempts
        );

        match self.apply(id, action).await {
            Ok(()) => {
                info!("Recovery of {} succeeded", id);
                RecoveryOutcome::Succeeded { action, attempts }
            }
            Err(e) => {
                if matches!(e, Error::RestartUnsupported { .. }) {
                    error!("Recovery of {} needs manual intervention: {}", id, e);
                } else {
                    warn!("Recovery of {} failed: {}", id, e);
                }
                RecoveryOutcome::Failed {
                    action,
                    attempts,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn apply(&self, id: &str, action: RecoveryAction) -> Result<()> {
        match action {
            RecoveryAction::RefreshDiscovery => self.refresh(id).await,
            RecoveryAction::Restart => self.restart(id).await,
            RecoveryAction::Escalate => {
                if let Err(e) = self.refresh(id).await {
                    debug!("Refresh step for {} failed: {}", id, e);
                }
                self.restart(id).await
            }
        }
    }

    async fn refresh(&self, id: &str) -> Result<()> {
        let instances = self.directory.refresh_discovery().await;
        if instances.iter().any(|i| i.id == id) {
            Ok(())
        } else {
            Err(Error::instance_not_found(id))
        }
    }

    async fn restart(&self, id: &str) -> Result<()> {
        let instance = self.directory.get_instance_by_id(id).await?;
        self.controller.restart(&instance).await?;
        self.directory.refresh_discovery().await;
        Ok(())
    }
}
