//! Loco Gateway binary

use clap::Parser;
use loco_gateway::{GatewayConfig, GatewayServer, GatewayState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "loco-gateway")]
#[command(about = "Loco fleet gateway - VNC bridge, signaling and health control loop")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LOCO_CONFIG", default_value = "config/gateway.toml")]
    config: PathBuf,

    /// HTTP / WebSocket listen address
    #[arg(short, long, env = "LOCO_LISTEN")]
    listen: Option<SocketAddr>,

    /// Static instance list, overriding the mounted and default paths
    #[arg(long, env = "LOCO_INSTANCES_CONFIG")]
    instances_config: Option<PathBuf>,

    /// Active-focus state file
    #[arg(long, env = "LOCO_ACTIVE_FILE")]
    active_file: Option<PathBuf>,

    /// Dashboard asset directory
    #[arg(long, env = "LOCO_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Do not start the health monitor at boot
    #[arg(long, env = "LOCO_NO_MONITOR")]
    no_monitor: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOCO_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(path) = &self.instances_config {
            config.instances.config_path = Some(path.clone());
        }
        if let Some(path) = &self.active_file {
            config.active_state_path = path.clone();
        }
        if let Some(dir) = &self.static_dir {
            config.static_dir = Some(dir.clone());
        }
        if self.no_monitor {
            config.monitor.autostart = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    // Supervisor restarts the process
    std::panic::set_hook(Box::new(|panic| {
        error!("Fatal: {}", panic);
        std::process::exit(1);
    }));

    info!("Loco gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load(&cli.config)?;
    cli.apply(&mut config);

    let server = GatewayServer::new(GatewayState::from_config(&config)?);
    let monitor = server.state().monitor.clone();
    if config.monitor.autostart {
        monitor.start();
    }

    let server_handle = tokio::spawn(server.serve(config.listen));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Gateway server error: {}", e),
                Err(e) => error!("Gateway server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    monitor.stop();
    info!("Gateway shutdown complete");
    Ok(())
}
