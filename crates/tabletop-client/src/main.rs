//! Command-line tabletop client.
//!
//! Joins a session, logs what happens in it and downloads the assets named
//! on the command line.  Runs until the server closes the session or Ctrl+C.
//!
//! `--generate-keys` writes a fresh key pair to the config directory and
//! prints the public key so the GM can add it to the server's
//! `[[authorized_keys]]`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tabletop_client::infrastructure::network::{ClientConfig, ClientEvent, SessionClient};
use tabletop_core::cipher::asymmetric::{public_key_fingerprint, KeyPairStore};
use tabletop_core::paths::{asset_cache_dir, platform_config_dir};
use tabletop_core::{AssetId, Role};

#[derive(Debug, Parser)]
#[command(
    name = "tabletop-client",
    about = "Joins a virtual tabletop session from the command line",
    version
)]
struct Cli {
    /// Server address, e.g. `192.168.1.10:51234`.
    #[arg(long, env = "TABLETOP_SERVER", required_unless_present = "generate_keys")]
    server: Option<SocketAddr>,

    #[arg(long, env = "TABLETOP_PLAYER", required_unless_present = "generate_keys")]
    name: Option<String>,

    #[arg(long, env = "TABLETOP_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// `GM` or `PLAYER`.
    #[arg(long, default_value = "PLAYER")]
    role: Role,

    /// Version reported to the server.
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    client_version: String,

    /// Log in with the stored key pair instead of a password.
    #[arg(long)]
    use_key: bool,

    /// Generate a new key pair, print its public key and exit.
    #[arg(long)]
    generate_keys: bool,

    /// Where downloaded assets are written.
    #[arg(long, env = "TABLETOP_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Asset ids to download after joining.
    #[arg(long = "asset")]
    assets: Vec<String>,

    #[arg(long, default_value_t = 10)]
    heartbeat_secs: u64,

    #[arg(long, env = "TABLETOP_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn key_store() -> anyhow::Result<KeyPairStore> {
    let dir = platform_config_dir().context("cannot locate the config directory")?;
    Ok(KeyPairStore::in_dir(&dir))
}

fn generate_keys() -> anyhow::Result<()> {
    let store = key_store()?;
    let pair = store.regenerate().context("failed to write the key pair")?;
    let public = pair.public_key_text()?;
    println!("{public}");
    println!("fingerprint: {}", public_key_fingerprint(&public)?);
    println!("written to {}", store.public_path().display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    if cli.generate_keys {
        return generate_keys();
    }

    let server = cli.server.context("--server is required")?;
    let name = cli.name.clone().context("--name is required")?;
    let key_pair = if cli.use_key {
        Some(key_store()?.read().context("no usable key pair; run --generate-keys")?)
    } else {
        None
    };

    let mut config = ClientConfig::new(server, name, cli.role);
    config.password = cli.password.clone();
    config.version = cli.client_version.clone();
    config.heartbeat_interval = Duration::from_secs(cli.heartbeat_secs.max(1));
    if let Some(dir) = cli.download_dir.clone().or_else(asset_cache_dir) {
        config.download_dir = dir;
    }

    let (client, events) = tokio::task::spawn_blocking(move || {
        SessionClient::connect(config, key_pair.as_ref())
    })
    .await
    .context("connect task panicked")?
    .context("failed to join the session")?;
    let client = Arc::new(client);

    for asset in &cli.assets {
        client
            .request_asset(&AssetId::new(asset.as_str()))
            .with_context(|| format!("failed to request asset {asset}"))?;
    }

    let mut event_loop = tokio::task::spawn_blocking(move || {
        for event in events.iter() {
            match event {
                ClientEvent::PlayerJoined(player) => info!("{player} joined"),
                ClientEvent::PlayerLeft(player) => info!("{player} left"),
                ClientEvent::CampaignChanged(snapshot) => {
                    info!("campaign updated ({} bytes)", snapshot.len());
                }
                ClientEvent::PolicyChanged(policy) => info!("policy changed: {policy:?}"),
                ClientEvent::AssetProgress {
                    id,
                    received,
                    total,
                } => info!("asset {id}: {received}/{total} bytes"),
                ClientEvent::AssetReady { name, path, .. } => {
                    info!("asset {name} saved to {}", path.display());
                }
                ClientEvent::Booted { reason } => warn!("removed from the session: {reason}"),
                ClientEvent::Disconnected => break,
            }
        }
    });

    tokio::select! {
        _ = &mut event_loop => info!("session ended"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            info!("received Ctrl+C; leaving the session");
        }
    }

    let closing = Arc::clone(&client);
    tokio::task::spawn_blocking(move || closing.disconnect())
        .await
        .context("disconnect task panicked")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_is_parsed_case_insensitively() {
        let cli = Cli::parse_from([
            "tabletop-client",
            "--server",
            "127.0.0.1:51234",
            "--name",
            "Alice",
            "--role",
            "gm",
        ]);

        assert_eq!(cli.role, Role::Gm);
        assert_eq!(cli.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_generate_keys_needs_no_server() {
        let cli = Cli::try_parse_from(["tabletop-client", "--generate-keys"]).unwrap();

        assert!(cli.generate_keys);
        assert!(cli.server.is_none());
    }

    #[test]
    fn test_server_is_required_for_joining() {
        assert!(Cli::try_parse_from(["tabletop-client", "--name", "Alice"]).is_err());
    }

    #[test]
    fn test_assets_may_repeat() {
        let cli = Cli::parse_from([
            "tabletop-client",
            "--server",
            "127.0.0.1:51234",
            "--name",
            "Alice",
            "--asset",
            "aa11",
            "--asset",
            "bb22",
        ]);

        assert_eq!(cli.assets, vec!["aa11".to_string(), "bb22".to_string()]);
    }
}
