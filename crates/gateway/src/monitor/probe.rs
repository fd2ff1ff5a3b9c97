//! Instance probes and health classification

use crate::bridge::BridgeTarget;
use crate::config::{MonitorConfig, Thresholds};
use chrono::Utc;
use loco_common::{
    Availability, Error, FailureType, HealthRecord, HealthStatus, Instance, Quality, Result,
    SubsystemStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Report served by the in-instance health agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepHealthReport {
    pub overall_status: Option<String>,
    pub qemu_healthy: bool,
    pub video: VideoHealth,
    pub audio: AudioHealth,
    pub performance: PerformanceHealth,
    pub network: NetworkHealth,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoHealth {
    pub vnc_available: bool,
    pub display_active: bool,
    pub estimated_frame_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioHealth {
    pub pulse_running: bool,
    pub audio_devices: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceHealth {
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkHealth {
    pub bridge_up: bool,
    pub tap_up: bool,
}

/// Raw measurements of one probe
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    /// VNC connect latency; `None` when unreachable
    pub vnc_latency_ms: Option<u64>,
    pub stream_available: bool,
    /// `Some(None)` when deep health was attempted but unavailable
    pub deep: Option<Option<DeepHealthReport>>,
    pub errors: Vec<String>,
}

/// Runs the network side of a probe
pub struct Prober {
    http: reqwest::Client,
    timeout: Duration,
    deep_health: bool,
    deep_health_port: u16,
    deep_health_path: String,
}

impl Prober {
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("probe http client: {e}")))?;
        Ok(Self {
            http,
            timeout: config.probe_timeout(),
            deep_health: config.deep_health,
            deep_health_port: config.deep_health_port,
            deep_health_path: config.deep_health_path.clone(),
        })
    }

    /// Probe one instance. Every network step is bounded by the probe timeout.
    pub async fn probe(&self, instance: &Instance) -> ProbeResult {
        let mut result = ProbeResult::default();

        let target = match BridgeTarget::parse(&instance.vnc_target) {
            Ok(target) => Some(target),
            Err(e) => {
                result.errors.push(e.to_string());
                None
            }
        };

        let vnc = async {
            let target = target.as_ref()?;
            let started = Instant::now();
            match target.connect(self.timeout).await {
                Ok(_stream) => Some(Ok(started.elapsed().as_millis() as u64)),
                Err(e) => Some(Err(format!("vnc: {e}"))),
            }
        };
        let deep = async {
            if !self.deep_health {
                return None;
            }
            let target = target.as_ref()?;
            Some(self.deep_health(&target.host).await)
        };
        let (vnc, stream, deep) = tokio::join!(vnc, self.stream(&instance.stream_url), deep);

        match vnc {
            Some(Ok(ms)) => result.vnc_latency_ms = Some(ms),
            Some(Err(e)) => result.errors.push(e),
            None => {}
        }
        match stream {
            Ok(()) => result.stream_available = true,
            Err(e) => result.errors.push(e),
        }
        result.deep = deep.map(|deep| match deep {
            Ok(report) => Some(report),
            Err(e) => {
                result.errors.push(e);
                None
            }
        });

        trace!(
            "Probed {}: latency={:?} stream={}",
            instance.id,
            result.vnc_latency_ms,
            result.stream_available
        );
        result
    }

    async fn stream(&self, url: &str) -> std::result::Result<(), String> {
        if url.is_empty() {
            return Ok(());
        }
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_server_error() => {
                Err(format!("stream: HTTP {}", resp.status()))
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_timeout() => Err(format!(
                "stream: timed out after {}ms",
                self.timeout.as_millis()
            )),
            Err(e) => Err(format!("stream: {e}")),
        }
    }

    async fn deep_health(&self, host: &str) -> std::result::Result<DeepHealthReport, String> {
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let url = format!("http://{}:{}{}", host, self.deep_health_port, self.deep_health_path);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("deep health: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("deep health: HTTP {}", resp.status()));
        }
        resp.json::<DeepHealthReport>()
            .await
            .map_err(|e| format!("deep health: {e}"))
    }
}

/// Video score in 0..=1
fn video_quality(result: &ProbeResult, thresholds: &Thresholds) -> f64 {
    match &result.deep {
        Some(Some(report)) if report.video.display_active => {
            let fps = report.video.estimated_frame_rate;
            if fps > 0.0 && thresholds.full_quality_fps > 0.0 {
                (fps / thresholds.full_quality_fps).min(1.0)
            } else {
                0.5
            }
        }
        Some(Some(_)) => 0.0,
        _ if result.stream_available => 1.0,
        _ => 0.0,
    }
}

/// Audio score in 0..=1
fn audio_quality(result: &ProbeResult) -> f64 {
    match &result.deep {
        Some(Some(report)) => match (report.audio.pulse_running, report.audio.audio_devices > 0) {
            (true, true) => 1.0,
            (true, false) => 0.5,
            _ => 0.0,
        },
        _ if result.stream_available => 1.0,
        _ => 0.0,
    }
}

fn deep_health_map(deep: &Option<Option<DeepHealthReport>>) -> BTreeMap<String, SubsystemStatus> {
    let mut map = BTreeMap::new();
    match deep {
        None => {}
        Some(None) => {
            for name in ["process", "video", "audio", "network"] {
                map.insert(name.to_string(), SubsystemStatus::Unknown);
            }
        }
        Some(Some(r)) => {
            let process = if r.qemu_healthy {
                SubsystemStatus::Ok
            } else {
                SubsystemStatus::Down
            };
            map.insert("process".to_string(), process);
            map.insert(
                "video".to_string(),
                SubsystemStatus::from_pair(r.video.vnc_available, r.video.display_active),
            );
            map.insert(
                "audio".to_string(),
                SubsystemStatus::from_pair(r.audio.pulse_running, r.audio.audio_devices > 0),
            );
            map.insert(
                "network".to_string(),
                SubsystemStatus::from_pair(r.network.bridge_up, r.network.tap_up),
            );
        }
    }
    map
}

/// Turn raw probe measurements into a health record
pub fn classify(instance_id: &str, result: ProbeResult, thresholds: &Thresholds) -> HealthRecord {
    let report = match &result.deep {
        Some(Some(report)) => Some(report),
        _ => None,
    };

    let vnc_up = result.vnc_latency_ms.is_some();
    let video = video_quality(&result, thresholds);
    let audio = audio_quality(&result);

    let vnc_down = !vnc_up || report.is_some_and(|r| !r.qemu_healthy);
    let exhausted = report.is_some_and(|r| {
        r.performance.cpu_usage >= thresholds.cpu_exhausted_percent
            || r.performance.memory_usage >= thresholds.memory_exhausted_percent
    });
    let slow = result
        .vnc_latency_ms
        .is_some_and(|ms| ms > thresholds.latency_degraded_ms);
    let stream_degraded = !result.stream_available
        || slow
        || (report.is_some() && video < thresholds.min_video_quality);

    let categories: Vec<FailureType> = [
        (vnc_down, FailureType::VncDown),
        (exhausted, FailureType::ResourceExhausted),
        (stream_degraded, FailureType::StreamDegraded),
    ]
    .into_iter()
    .filter_map(|(hit, kind)| hit.then_some(kind))
    .collect();

    let failure_type = match categories.as_slice() {
        [] => FailureType::None,
        [single] => *single,
        _ => FailureType::Mixed,
    };

    let status = if categories.is_empty() {
        HealthStatus::Healthy
    } else if vnc_down || exhausted || !result.stream_available {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    };

    HealthRecord {
        instance_id: instance_id.to_string(),
        timestamp: Utc::now(),
        status,
        availability: Availability {
            vnc: vnc_up,
            stream: result.stream_available,
        },
        quality: Quality {
            latency: result.vnc_latency_ms,
            audio_quality: audio,
            video_quality: video,
        },
        deep_health: deep_health_map(&result.deep),
        failure_type,
        recovery_needed: status == HealthStatus::Unhealthy,
        errors: result.errors,
    }
}
