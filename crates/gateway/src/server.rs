//! Gateway HTTP server
//!
//! One listener serves the JSON control plane, the optional dashboard
//! assets, and the three WebSocket sub-protocols. Connections are served
//! through hyper directly so the upgrade gate can refuse a connection
//! before any response is written.

use crate::active::ActiveFocusStore;
use crate::bridge::BridgeSession;
use crate::config::{BridgeConfig, GatewayConfig};
use crate::directory::kubernetes::KubeClient;
use crate::directory::{self, InstanceDirectory};
use crate::monitor::recovery::{
    InstanceController, RecoveryManager, RecoveryOutcome, UnmanagedController,
};
use crate::monitor::HealthMonitor;
use crate::signaling::SignalingRelay;
use crate::upgrade::{self, ResolvedVnc};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    handler::HandlerWithoutStateExt,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use loco_common::{ActiveIds, ActiveSelection, Error};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared state behind every handler
pub struct GatewayState {
    pub directory: Arc<InstanceDirectory>,
    pub active: Arc<ActiveFocusStore>,
    pub signaling: Arc<SignalingRelay>,
    pub monitor: Arc<HealthMonitor>,
    pub bridge: BridgeConfig,
    pub static_dir: Option<PathBuf>,
    pub started: Instant,
}

impl GatewayState {
    /// Wire every component from configuration
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        let source = config.instances.resolve_static_path();
        let static_instances = match directory::load_static_instances(source.path()) {
            Ok(instances) => {
                info!(
                    "Loaded {} static instances from {}",
                    instances.len(),
                    source.path().display()
                );
                instances
            }
            Err(e) => {
                warn!("{}; continuing without static instances", e);
                Vec::new()
            }
        };

        let mut directory = InstanceDirectory::new(static_instances, config.instances.cache_ttl());
        let controller: Arc<dyn InstanceController> = if config.kubernetes.is_enabled() {
            let kube = Arc::new(KubeClient::new(config.kubernetes.clone())?);
            info!(
                "Kubernetes discovery enabled: {}/{}",
                config.kubernetes.namespace, config.kubernetes.service_name
            );
            directory = directory.with_live_source(kube.clone(), config.kubernetes.request_timeout());
            kube
        } else {
            info!("Kubernetes discovery disabled, using static instances");
            Arc::new(UnmanagedController)
        };
        let directory = Arc::new(directory);

        let recovery = Arc::new(RecoveryManager::new(
            directory.clone(),
            controller,
            config.monitor.max_recovery_attempts,
        ));
        let monitor = Arc::new(HealthMonitor::new(
            directory.clone(),
            recovery,
            config.monitor.clone(),
        )?);

        Ok(Self {
            directory,
            active: Arc::new(ActiveFocusStore::new(config.active_state_path.clone())),
            signaling: Arc::new(SignalingRelay::new()),
            monitor,
            bridge: config.bridge.clone(),
            static_dir: config.static_dir.clone(),
            started: Instant::now(),
        })
    }
}

/// Gateway server
#[derive(Clone)]
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    pub fn new(state: GatewayState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Create router
    pub fn router(&self) -> Router {
        let router = Router::new()
            // Health
            .route("/health", get(health_handler))
            .route("/api/status", get(status_handler))
            // Instance directory
            .route("/api/instances", get(list_instances_handler))
            .route("/api/instances/provisioned", get(provisioned_instances_handler))
            .route("/api/instances/live", get(live_instances_handler))
            .route("/api/instances/discovery-info", get(discovery_info_handler))
            .route("/api/instances/refresh", post(refresh_instances_handler))
            // Active focus
            .route("/api/active", get(get_active_handler).post(set_active_handler))
            // Quality and recovery
            .route("/api/quality/metrics", get(all_metrics_handler))
            .route("/api/quality/metrics/:instance_id", get(instance_metrics_handler))
            .route("/api/quality/summary", get(quality_summary_handler))
            .route("/api/quality/deep-health", get(all_deep_health_handler))
            .route("/api/quality/deep-health/:instance_id", get(instance_deep_health_handler))
            .route("/api/quality/recover/:instance_id", post(recover_handler))
            .route("/api/quality/recovery-status", get(recovery_status_handler))
            .route("/api/quality/monitor/:action", post(monitor_action_handler))
            // WebSocket sub-protocols, reached through the upgrade gate
            .route("/signal", get(signal_ws_handler))
            .route("/active", get(active_ws_handler))
            .route("/proxy/vnc/:instance_id", get(vnc_ws_handler))
            .route("/proxy/vnc/:instance_id/", get(vnc_ws_handler))
            .route("/proxy/vnc/:instance_id/*rest", get(vnc_ws_handler));

        let router = match &self.state.static_dir {
            Some(dir) => router.fallback_service(
                ServeDir::new(dir).not_found_service(not_found_handler.into_service()),
            ),
            None => router.fallback(not_found_handler),
        };

        router
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind and serve until the task is dropped
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on http://{}", listener.local_addr()?);
        self.serve_listener(listener).await
    }

    /// Serve connections accepted on `listener`
    pub async fn serve_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let router = self.router();
        let directory = self.state.directory.clone();

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let router = router.clone();
            let directory = directory.clone();
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                    upgrade::gate(req, router.clone(), directory.clone())
                });

                let builder = auto::Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                if let Err(e) = conn.await {
                    debug!("Connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error response with a JSON `{"error": ..}` body
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InstanceNotFound { .. } | Error::ConfigNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidConfig(_) | Error::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            Error::RecoveryExhausted { .. } => StatusCode::CONFLICT,
            e if e.is_soft() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.0.to_string())
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "loco-gateway"
    }))
}

async fn status_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": loco_common::VERSION,
        "uptimeSeconds": state.started.elapsed().as_secs(),
        "monitoring": state.monitor.is_running(),
        "discoveryMode": state.directory.mode(),
        "activeSubscribers": state.active.subscriber_count(),
        "signalingPeers": state.signaling.peer_count(),
    }))
}

async fn list_instances_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.directory.get_instances().await)
}

async fn provisioned_instances_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.directory.get_provisioned_instances().await)
}

async fn live_instances_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let view = state
        .directory
        .live_view(|id| state.monitor.get_instance_metrics(id))
        .await;
    Json(view)
}

async fn discovery_info_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.directory.discovery_info())
}

async fn refresh_instances_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let instances = state.directory.refresh_discovery().await;
    Json(json!({
        "success": true,
        "instances": instances,
        "mode": state.directory.mode(),
    }))
}

async fn get_active_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(ActiveIds {
        active: state.active.read().await,
    })
}

async fn set_active_handler(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let selection = match ActiveSelection::try_from(body) {
        Ok(selection) => selection,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.active.write(selection).await {
        Ok(active) => Json(ActiveIds { active }).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn all_metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let metrics = state.monitor.get_all_metrics();
    if metrics.is_empty() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No health data available yet",
        );
    }
    Json(metrics).into_response()
}

async fn instance_metrics_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.monitor.get_instance_metrics(&instance_id) {
        Some(record) => Json(record).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("Instance {instance_id} is not monitored"),
        ),
    }
}

async fn quality_summary_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.monitor.get_quality_summary())
}

async fn all_deep_health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.monitor.get_deep_health())
}

async fn instance_deep_health_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.monitor.get_instance_deep_health(&instance_id) {
        Some(deep) => Json(deep).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("Instance {instance_id} is not monitored"),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RecoverRequest {
    force_recovery: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecoverResponse {
    instance_id: String,
    forced: bool,
    #[serde(flatten)]
    outcome: RecoveryOutcome,
}

async fn recover_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance_id): Path<String>,
    body: Option<Json<RecoverRequest>>,
) -> ApiResult<RecoverResponse> {
    let force = body.map(|Json(req)| req.force_recovery).unwrap_or(false);
    let outcome = state.monitor.recover(&instance_id, force).await?;
    Ok(Json(RecoverResponse {
        instance_id,
        forced: force,
        outcome,
    }))
}

async fn recovery_status_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.monitor.recovery_status())
}

async fn monitor_action_handler(
    State(state): State<Arc<GatewayState>>,
    Path(action): Path<String>,
) -> Response {
    let changed = match action.as_str() {
        "start" => state.monitor.start(),
        "stop" => state.monitor.stop(),
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Unknown monitor action: {other}"),
            )
        }
    };
    Json(json!({
        "action": action,
        "running": state.monitor.is_running(),
        "changed": changed,
    }))
    .into_response()
}

async fn not_found_handler() -> impl IntoResponse {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

// ============================================================================
// WebSocket handlers
// ============================================================================

async fn signal_ws_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let relay = state.signaling.clone();
    ws.on_upgrade(move |socket| relay.serve(socket))
}

async fn active_ws_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let store = state.active.clone();
    ws.on_upgrade(move |socket| store.serve(socket))
}

async fn vnc_ws_handler(
    State(state): State<Arc<GatewayState>>,
    resolved: Option<Extension<ResolvedVnc>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    // Only the upgrade gate attaches a resolved target
    let (Some(Extension(resolved)), Some(ws)) = (resolved, ws) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "VNC proxy requires a WebSocket upgrade",
        );
    };
    let session = BridgeSession::new(
        resolved.instance_id,
        resolved.target,
        state.bridge.connect_timeout(),
    );
    ws.on_upgrade(move |socket| async move {
        session.run(socket).await;
    })
}
