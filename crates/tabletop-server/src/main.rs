//! Session server entry point.
//!
//! Reads `server.toml` (or the file given with `--config`), lets a few
//! command-line flags override it, then runs the coordinator until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tabletop_server::application::coordinator::ConnectionCoordinator;
use tabletop_server::infrastructure::network::{DirectSocketTransport, RelayTransport};
use tabletop_server::infrastructure::storage::assets::DirectoryAssetStore;
use tabletop_server::infrastructure::storage::config::{
    config_file_path, load_config, save_config, ServerConfig,
};

/// Virtual tabletop session server.
#[derive(Debug, Parser)]
#[command(
    name = "tabletop-server",
    about = "Hosts a virtual tabletop session over TCP and/or a relay service",
    version
)]
struct Cli {
    /// Configuration file; defaults to `server.toml` in the platform config directory.
    #[arg(long, env = "TABLETOP_CONFIG")]
    config: Option<PathBuf>,

    /// Name announced to the relay service.
    #[arg(long, env = "TABLETOP_NAME")]
    name: Option<String>,

    #[arg(long, env = "TABLETOP_BIND")]
    bind: Option<String>,

    #[arg(long, env = "TABLETOP_PORT")]
    port: Option<u16>,

    #[arg(long, env = "TABLETOP_PLAYER_PASSWORD", hide_env_values = true)]
    player_password: Option<String>,

    #[arg(long, env = "TABLETOP_GM_PASSWORD", hide_env_values = true)]
    gm_password: Option<String>,

    /// Signaling service URL; setting it enables the relay transport.
    #[arg(long, env = "TABLETOP_RELAY_URL")]
    relay_url: Option<String>,

    /// Directory of assets served to clients.
    #[arg(long, env = "TABLETOP_ASSET_DIR")]
    asset_dir: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "TABLETOP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Write the effective configuration back to the config file and exit.
    #[arg(long)]
    save_config: bool,
}

impl Cli {
    /// Overlays the flags that were given onto `config`.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(name) = &self.name {
            config.server.name = name.clone();
        }
        if let Some(bind) = &self.bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(password) = &self.player_password {
            config.server.player_password = password.clone();
        }
        if let Some(password) = &self.gm_password {
            config.server.gm_password = password.clone();
        }
        if let Some(url) = &self.relay_url {
            config.relay.enabled = true;
            config.relay.signaling_url = url.clone();
        }
        if let Some(dir) = &self.asset_dir {
            config.network.asset_dir = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.server.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_file_path().context("cannot locate the config directory")?,
    };
    let mut config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    cli.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    if cli.save_config {
        save_config(&config_path, &config)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        info!("configuration written to {}", config_path.display());
        return Ok(());
    }

    if config.server.player_password.is_empty() && config.server.gm_password.is_empty() {
        warn!("no passwords configured; only authorized keys can log in");
    }

    let validator = config
        .validator()
        .context("invalid handshake configuration")?;
    let coordinator = ConnectionCoordinator::new(
        config.coordinator_config(),
        validator,
        config.policy.clone(),
    );

    let socket_config = config.socket_config().context("invalid network section")?;
    coordinator.add_transport(Arc::new(DirectSocketTransport::new(socket_config)));
    if let Some(relay_config) = config.relay_config() {
        let relay = RelayTransport::with_current_runtime(relay_config)
            .context("cannot create the relay transport")?;
        coordinator.add_transport(Arc::new(relay));
    }
    if let Some(dir) = &config.network.asset_dir {
        info!("serving assets from {}", dir.display());
        coordinator.set_asset_store(Arc::new(DirectoryAssetStore::new(dir.clone())));
    }

    // Starting binds sockets and spawns threads; keep it off the runtime workers.
    let starter = Arc::clone(&coordinator);
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .context("start task panicked")?
        .context("failed to start the session server")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("received Ctrl+C; shutting down");

    let stopper = Arc::clone(&coordinator);
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("stop task panicked")?
        .context("failed to stop the session server")?;
    Ok(())
}
