//! Loco Gateway
//!
//! Connection gateway for a fleet of remote-desktop game instances: VNC
//! WebSocket bridging, peer signaling, shared active focus, instance
//! discovery, and health monitoring with bounded recovery.

pub mod active;
pub mod bridge;
pub mod config;
pub mod directory;
pub mod monitor;
pub mod server;
pub mod signaling;
pub mod upgrade;

pub use active::ActiveFocusStore;
pub use bridge::{BridgeSession, BridgeState, BridgeTarget};
pub use config::GatewayConfig;
pub use directory::{DiscoverySource, InstanceDirectory};
pub use monitor::recovery::{InstanceController, RecoveryManager, RecoveryOutcome};
pub use monitor::HealthMonitor;
pub use server::{GatewayServer, GatewayState};
pub use signaling::SignalingRelay;
