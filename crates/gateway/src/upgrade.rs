//! Upgrade routing
//!
//! Every request passes through [`gate`] before reaching the router.
//! Protocol-upgrade requests are routed by path; an upgrade that has no
//! route, or names a VNC instance that cannot be resolved, fails the
//! connection without a handshake.

use crate::bridge::BridgeTarget;
use crate::directory::InstanceDirectory;
use axum::body::{Bytes, HttpBody};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use std::sync::Arc;
use tower::ServiceExt;
use tracing::{debug, warn};

const VNC_PREFIX: &str = "/proxy/vnc/";

/// Sub-protocol an upgrade request is routed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeRoute {
    Vnc { instance_id: String },
    Signal,
    Active,
    Reject,
}

/// Classify an upgrade path. Checked in order: VNC proxy, signaling, active.
pub fn classify(path: &str) -> UpgradeRoute {
    if let Some(rest) = path.strip_prefix(VNC_PREFIX) {
        let id = rest.split('/').next().unwrap_or_default();
        if id.is_empty() {
            return UpgradeRoute::Reject;
        }
        return UpgradeRoute::Vnc {
            instance_id: id.to_string(),
        };
    }

    match path {
        "/signal" => UpgradeRoute::Signal,
        "/active" => UpgradeRoute::Active,
        _ => UpgradeRoute::Reject,
    }
}

/// `Connection: upgrade` together with an `Upgrade` header
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// VNC target resolved by the gate, read by the bridge handler
#[derive(Debug, Clone)]
pub struct ResolvedVnc {
    pub instance_id: String,
    pub target: BridgeTarget,
}

/// Reasons the gate drops a connection
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no upgrade route for {0}")]
    UnroutableUpgrade(String),

    #[error("cannot bridge instance {id}: {source}")]
    UnresolvedInstance {
        id: String,
        #[source]
        source: loco_common::Error,
    },

    #[error("upgrade for {path} answered with {status}")]
    UpgradeNotAccepted { path: String, status: StatusCode },
}

/// Route one request.
///
/// Returning an error makes hyper close the transport without writing a
/// response, which is how refused upgrades are destroyed.
pub async fn gate<B>(
    mut req: Request<B>,
    router: Router,
    directory: Arc<InstanceDirectory>,
) -> Result<Response, GatewayError>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    if !is_upgrade_request(req.headers()) {
        return match router.oneshot(req).await {
            Ok(resp) => Ok(resp),
            Err(never) => match never {},
        };
    }

    let path = req.uri().path().to_string();
    match classify(&path) {
        UpgradeRoute::Vnc { instance_id } => {
            let resolved = resolve_vnc(&directory, &instance_id).await?;
            debug!("Bridging {} to {}", instance_id, resolved.target);
            req.extensions_mut().insert(resolved);
        }
        UpgradeRoute::Signal | UpgradeRoute::Active => {}
        UpgradeRoute::Reject => {
            debug!("Destroying upgrade for {}", path);
            return Err(GatewayError::UnroutableUpgrade(path));
        }
    }

    let resp = match router.oneshot(req).await {
        Ok(resp) => resp,
        Err(never) => match never {},
    };

    // An upgrade is either switched or destroyed, never answered
    if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!("Destroying upgrade for {}: {}", path, resp.status());
        return Err(GatewayError::UpgradeNotAccepted {
            path,
            status: resp.status(),
        });
    }
    Ok(resp)
}

async fn resolve_vnc(
    directory: &InstanceDirectory,
    instance_id: &str,
) -> Result<ResolvedVnc, GatewayError> {
    let failed = |source: loco_common::Error| {
        warn!("Refusing VNC upgrade for {}: {}", instance_id, source);
        GatewayError::UnresolvedInstance {
            id: instance_id.to_string(),
            source,
        }
    };

    let instance = directory
        .get_instance_by_id(instance_id)
        .await
        .map_err(failed)?;
    let target = BridgeTarget::parse(&instance.vnc_target).map_err(failed)?;

    Ok(ResolvedVnc {
        instance_id: instance.id,
        target,
    })
}
