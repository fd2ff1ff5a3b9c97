//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path where the orchestrator mounts the instance list ConfigMap.
pub const CLUSTER_INSTANCES_PATH: &str = "/config/instances.json";

/// Instance list used when nothing else is configured.
pub const DEFAULT_INSTANCES_PATH: &str = "config/instances.json";

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP / WebSocket listen address
    pub listen: SocketAddr,

    /// Optional directory of dashboard assets served for non-API paths
    pub static_dir: Option<PathBuf>,

    /// Persisted active-focus state file
    pub active_state_path: PathBuf,

    /// Instance directory configuration
    pub instances: InstancesConfig,

    /// Live discovery configuration
    pub kubernetes: KubernetesConfig,

    /// Health monitor configuration
    pub monitor: MonitorConfig,

    /// VNC bridge configuration
    pub bridge: BridgeConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3001)),
            static_dir: None,
            active_state_path: PathBuf::from("data/active.json"),
            instances: InstancesConfig::default(),
            kubernetes: KubernetesConfig::default(),
            monitor: MonitorConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Static instance list and directory cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancesConfig {
    /// Explicit override for the static instance list
    pub config_path: Option<PathBuf>,

    /// Orchestrator-provided mount path, used when it exists at startup
    pub cluster_config_path: PathBuf,

    /// Fallback path
    pub default_config_path: PathBuf,

    /// How long a discovery snapshot is served before re-querying
    pub cache_ttl_secs: u64,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            cluster_config_path: PathBuf::from(CLUSTER_INSTANCES_PATH),
            default_config_path: PathBuf::from(DEFAULT_INSTANCES_PATH),
            cache_ttl_secs: 10,
        }
    }
}

/// Where the static instance list was resolved from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticConfigSource {
    Explicit(PathBuf),
    Cluster(PathBuf),
    Default(PathBuf),
}

impl StaticConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            StaticConfigSource::Explicit(p)
            | StaticConfigSource::Cluster(p)
            | StaticConfigSource::Default(p) => p,
        }
    }
}

impl InstancesConfig {
    /// Resolve the static config path.
    ///
    /// Precedence: explicit override, then the cluster mount if present,
    /// then the default path. Called once at startup.
    pub fn resolve_static_path(&self) -> StaticConfigSource {
        if let Some(path) = &self.config_path {
            return StaticConfigSource::Explicit(path.clone());
        }
        if self.cluster_config_path.exists() {
            return StaticConfigSource::Cluster(self.cluster_config_path.clone());
        }
        StaticConfigSource::Default(self.default_config_path.clone())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Kubernetes live discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// `None` enables discovery when running inside a cluster
    pub enabled: Option<bool>,

    /// API server base URL
    pub api_url: String,

    pub namespace: String,

    /// Headless service fronting the emulator StatefulSet
    pub service_name: String,

    /// Label selector of emulator pods, queried when the Endpoints object is missing
    pub label_selector: String,

    /// DNS suffix used to build per-pod service names
    pub cluster_domain: String,

    pub token_path: PathBuf,

    pub ca_path: PathBuf,

    /// Default VNC port when the endpoint has no `vnc` port
    pub vnc_port: u16,

    /// Default stream port when the endpoint has no `stream` port
    pub stream_port: u16,

    pub stream_path: String,

    pub request_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            api_url: "https://kubernetes.default.svc".to_string(),
            namespace: "loco".to_string(),
            service_name: "loco-loco-emulator".to_string(),
            label_selector: "app.kubernetes.io/component=emulator".to_string(),
            cluster_domain: "cluster.local".to_string(),
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            vnc_port: 5901,
            stream_port: 6080,
            stream_path: "/".to_string(),
            request_timeout_secs: 5,
        }
    }
}

impl KubernetesConfig {
    /// Decide once whether live discovery is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
            .unwrap_or_else(|| std::env::var_os("KUBERNETES_SERVICE_HOST").is_some())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Health monitor and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Start probing at boot
    pub autostart: bool,

    pub interval_secs: u64,

    /// Bound on every individual network step of a probe
    pub probe_timeout_ms: u64,

    /// Query the in-instance health endpoint
    pub deep_health: bool,

    pub deep_health_port: u16,

    pub deep_health_path: String,

    /// Run recovery automatically for unhealthy instances
    pub auto_recovery: bool,

    pub max_recovery_attempts: u32,

    pub thresholds: Thresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            interval_secs: 30,
            probe_timeout_ms: 5000,
            deep_health: true,
            deep_health_port: 8080,
            deep_health_path: "/health".to_string(),
            auto_recovery: true,
            max_recovery_attempts: 3,
            thresholds: Thresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Classification thresholds for probe measurements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// VNC connect latency above which the stream counts as degraded
    pub latency_degraded_ms: u64,

    /// CPU usage percentage treated as exhausted
    pub cpu_exhausted_percent: f64,

    /// Memory usage percentage treated as exhausted
    pub memory_exhausted_percent: f64,

    /// Video score below which the stream counts as degraded
    pub min_video_quality: f64,

    /// Frame rate that maps to a full video score
    pub full_quality_fps: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            latency_degraded_ms: 500,
            cpu_exhausted_percent: 95.0,
            memory_exhausted_percent: 95.0,
            min_video_quality: 0.3,
            full_quality_fps: 15.0,
        }
    }
}

/// VNC bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub connect_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
        }
    }
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl GatewayConfig {
    /// Load configuration from file, defaults when the file is absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
