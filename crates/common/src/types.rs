//! Core types for the Loco fleet

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of instances that can be in focus at once (the UI grid).
pub const MAX_ACTIVE_INSTANCES: usize = 9;

// ============================================================================
// Instances
// ============================================================================

/// Where an instance entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceSource {
    Live,
    Static,
}

impl std::fmt::Display for InstanceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceSource::Live => write!(f, "live"),
            InstanceSource::Static => write!(f, "static"),
        }
    }
}

/// A game instance reachable through the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub display_name: String,
    /// `host:port` or a URL-like string
    pub vnc_target: String,
    pub stream_url: String,
    pub provisioned: bool,
    pub source: InstanceSource,
    /// Orchestrator readiness. Static entries are always ready.
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Orchestrator metadata, live entries only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointMeta>,
}

/// Where the orchestrator placed a live instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointMeta {
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    pub hostname: Option<String>,
    pub dns_name: Option<String>,
    pub namespace: String,
    pub target_ref: Option<TargetRef>,
    /// Named container ports
    pub ports: BTreeMap<String, u16>,
}

/// Reference to the object backing an endpoint, normally a Pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
}

/// One entry of the static instance configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticInstanceConfig {
    pub id: String,
    #[serde(alias = "vnc")]
    pub vnc_target: String,
    #[serde(default)]
    pub stream_url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub provisioned: bool,
}

impl From<StaticInstanceConfig> for Instance {
    fn from(cfg: StaticInstanceConfig) -> Self {
        Self {
            display_name: cfg.name.unwrap_or_else(|| cfg.id.clone()),
            id: cfg.id,
            vnc_target: cfg.vnc_target,
            stream_url: cfg.stream_url,
            provisioned: cfg.provisioned,
            source: InstanceSource::Static,
            ready: true,
            pod_name: None,
            description: cfg.description,
            endpoint: None,
        }
    }
}

/// Which source is currently authoritative for the instance list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    KubernetesEndpoints,
    /// Pods matched by label selector, used when the Endpoints object is missing
    KubernetesPods,
    Static,
}

impl std::fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryMode::KubernetesEndpoints => write!(f, "kubernetes-endpoints"),
            DiscoveryMode::KubernetesPods => write!(f, "kubernetes-pods"),
            DiscoveryMode::Static => write!(f, "static"),
        }
    }
}

// ============================================================================
// Active focus
// ============================================================================

/// A normalized "id or list of ids" selection.
///
/// Inbound payloads use any of `{"ids": ..}`, `{"id": ..}` or `{"active": ..}`
/// (first key present wins) where the value is `null`, a single id, or a list
/// of ids. `null` clears the selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "ActiveIds")]
pub struct ActiveSelection(Vec<String>);

const SELECTION_KEYS: [&str; 3] = ["ids", "id", "active"];

impl ActiveSelection {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn into_ids(self) -> Vec<String> {
        self.0
    }

    /// Clamp to the grid size, keeping order.
    pub fn truncated(mut self) -> Self {
        self.0.truncate(MAX_ACTIVE_INSTANCES);
        self
    }

    /// Normalize a bare id value: `null`, a scalar, or a list.
    pub fn from_ids_value(value: &serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(Self::default()),
            Value::String(s) if s.is_empty() => Ok(Self::default()),
            Value::String(s) => Ok(Self(vec![s.clone()])),
            Value::Number(n) => Ok(Self(vec![n.to_string()])),
            Value::Array(items) => Ok(Self(
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) if !s.is_empty() => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect(),
            )),
            other => Err(format!("unsupported id value: {other}")),
        }
    }
}

impl TryFrom<serde_json::Value> for ActiveSelection {
    type Error = String;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let obj = value
            .as_object()
            .ok_or_else(|| "expected a JSON object".to_string())?;

        SELECTION_KEYS
            .iter()
            .find_map(|key| obj.get(*key))
            .ok_or_else(|| "expected one of `ids`, `id` or `active`".to_string())
            .and_then(Self::from_ids_value)
    }
}

/// Serialized form of an active selection, also the persisted file shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveIds {
    pub active: Vec<String>,
}

impl From<ActiveSelection> for ActiveIds {
    fn from(sel: ActiveSelection) -> Self {
        Self { active: sel.0 }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Coarse per-instance health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Failure classification of a probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureType {
    #[default]
    None,
    VncDown,
    StreamDegraded,
    ResourceExhausted,
    Mixed,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureType::None => write!(f, "none"),
            FailureType::VncDown => write!(f, "vnc-down"),
            FailureType::StreamDegraded => write!(f, "stream-degraded"),
            FailureType::ResourceExhausted => write!(f, "resource-exhausted"),
            FailureType::Mixed => write!(f, "mixed"),
        }
    }
}

/// Status of one subsystem in a deep-health breakdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemStatus {
    Ok,
    Degraded,
    Down,
    Unknown,
}

impl SubsystemStatus {
    /// `Ok` when both signals hold, `Degraded` when one does, `Down` otherwise.
    pub fn from_pair(a: bool, b: bool) -> Self {
        match (a, b) {
            (true, true) => SubsystemStatus::Ok,
            (false, false) => SubsystemStatus::Down,
            _ => SubsystemStatus::Degraded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Availability {
    pub vnc: bool,
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quality {
    /// VNC connect latency in milliseconds
    pub latency: Option<u64>,
    pub audio_quality: f64,
    pub video_quality: f64,
}

/// Latest probe result for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub availability: Availability,
    pub quality: Quality,
    pub deep_health: BTreeMap<String, SubsystemStatus>,
    pub failure_type: FailureType,
    pub recovery_needed: bool,
    pub errors: Vec<String>,
}

impl HealthRecord {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
