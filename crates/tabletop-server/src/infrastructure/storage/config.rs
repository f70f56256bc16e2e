//! TOML configuration for the session server.
//!
//! Stored as `server.toml` in the platform config directory:
//! - Windows:  `%APPDATA%\Tabletop\server.toml`
//! - Linux:    `~/.config/tabletop/server.toml`
//! - macOS:    `~/Library/Application Support/Tabletop/server.toml`
//!
//! ```toml
//! [server]
//! name = "friday-campaign"
//! version = "1.0"
//! player_password = "correct"
//! gm_password = "dungeon"
//!
//! [network]
//! port = 51234
//!
//! [relay]
//! enabled = true
//! signaling_url = "wss://relay.example.org/signal"
//!
//! [policy]
//! movement_locked = true
//!
//! [[authorized_keys]]
//! name = "Alice"
//! role = "PLAYER"
//! public_key = """
//! -----BEGIN PUBLIC KEY-----
//! ...
//! -----END PUBLIC KEY-----
//! """
//! ```
//!
//! Every field has a serde default, so a missing file or a file written by
//! an older version still yields a working configuration.  The passwords
//! only live here; [`ServerConfig::validator`] turns them into salted MACs.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabletop_core::cipher::CipherError;
use tabletop_core::domain::player::UnknownRole;
use tabletop_core::paths::platform_config_dir;
use tabletop_core::{Role, ServerPolicy};
use thiserror::Error;

use crate::application::coordinator::{CoordinatorConfig, ASSET_CHUNK_SIZE, ASSET_QUEUE_LIMIT};
use crate::application::handshake::HandshakeValidator;
use crate::infrastructure::network::{RelayConfig, SocketConfig};

pub const CONFIG_FILE_NAME: &str = "server.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid bind address '{0}'")]
    BindAddress(String),

    #[error("authorized key for {name}: {source}")]
    AuthorizedKey {
        name: String,
        #[source]
        source: CipherError,
    },

    #[error(transparent)]
    Role(#[from] UnknownRole),
}

// ── Schema ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub policy: ServerPolicy,
    #[serde(default)]
    pub authorized_keys: Vec<AuthorizedKeyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Name announced to the relay service.
    #[serde(default = "default_name")]
    pub name: String,
    /// Clients must report exactly this version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Client versions accepted besides `version`, e.g. development builds.
    #[serde(default)]
    pub version_bypass: Vec<String>,
    /// Empty disables password login for players.
    #[serde(default)]
    pub player_password: String,
    /// Empty disables password login for the GM.
    #[serde(default)]
    pub gm_password: String,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often clients send a heartbeat.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// A socket read times out after this many heartbeat intervals of silence.
    #[serde(default = "default_read_timeout_heartbeats")]
    pub read_timeout_heartbeats: u32,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_asset_chunk_size")]
    pub asset_chunk_size: usize,
    #[serde(default = "default_asset_poll_interval_ms")]
    pub asset_poll_interval_ms: u64,
    /// Chunks allowed to wait in one client's image queue before the asset
    /// pump skips that client.
    #[serde(default = "default_asset_queue_limit")]
    pub asset_queue_limit: usize,
    /// Files served to clients that request assets by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub signaling_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// A player allowed to log in with a key pair instead of a password.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorizedKeyEntry {
    pub name: String,
    /// `GM` or `PLAYER`.
    pub role: String,
    /// PEM text; several keys may be concatenated.
    pub public_key: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "tabletop".to_string()
}
fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    51234
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_read_timeout_heartbeats() -> u32 {
    3
}
fn default_reap_interval_secs() -> u64 {
    5
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_asset_chunk_size() -> usize {
    ASSET_CHUNK_SIZE
}
fn default_asset_poll_interval_ms() -> u64 {
    500
}
fn default_asset_queue_limit() -> usize {
    ASSET_QUEUE_LIMIT
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            version_bypass: Vec::new(),
            player_password: String::new(),
            gm_password: String::new(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            read_timeout_heartbeats: default_read_timeout_heartbeats(),
            reap_interval_secs: default_reap_interval_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            asset_chunk_size: default_asset_chunk_size(),
            asset_poll_interval_ms: default_asset_poll_interval_ms(),
            asset_queue_limit: default_asset_queue_limit(),
            asset_dir: None,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            signaling_url: String::new(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

// ── Derived settings ──────────────────────────────────────────────────────────

impl ServerConfig {
    /// Builds the handshake rules: hashes the passwords and parses every
    /// authorized key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Role`] or [`ConfigError::AuthorizedKey`] for a
    /// bad `[[authorized_keys]]` entry.
    pub fn validator(&self) -> Result<HandshakeValidator, ConfigError> {
        let mut validator = HandshakeValidator::new(&self.server.version)
            .with_password(Role::Player, &self.server.player_password)
            .with_password(Role::Gm, &self.server.gm_password)
            .with_version_bypass(self.server.version_bypass.clone());

        for entry in &self.authorized_keys {
            let role: Role = entry.role.parse()?;
            for key in tabletop_core::cipher::asymmetric::split_public_keys(&entry.public_key) {
                validator
                    .authorize_key(&entry.name, role, &key)
                    .map_err(|source| ConfigError::AuthorizedKey {
                        name: entry.name.clone(),
                        source,
                    })?;
            }
        }
        Ok(validator)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout_secs),
            reap_interval: Duration::from_secs(self.network.reap_interval_secs),
            asset_chunk_size: self.network.asset_chunk_size.max(1),
            asset_poll_interval: Duration::from_millis(self.network.asset_poll_interval_ms),
            asset_queue_limit: self.network.asset_queue_limit.max(1),
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::BindAddress`] if `bind_address` is not an IP address.
    pub fn socket_config(&self) -> Result<SocketConfig, ConfigError> {
        let ip: IpAddr = self
            .network
            .bind_address
            .parse()
            .map_err(|_| ConfigError::BindAddress(self.network.bind_address.clone()))?;
        Ok(SocketConfig {
            bind_address: SocketAddr::new(ip, self.network.port),
            read_timeout: self.read_timeout(),
        })
    }

    /// Silence on a socket longer than this means the peer is gone.
    pub fn read_timeout(&self) -> Duration {
        let heartbeats = u64::from(self.network.read_timeout_heartbeats.max(1));
        Duration::from_secs(self.network.heartbeat_interval_secs.max(1) * heartbeats)
    }

    /// `None` unless the relay is enabled and has a URL.
    pub fn relay_config(&self) -> Option<RelayConfig> {
        if !self.relay.enabled || self.relay.signaling_url.is_empty() {
            return None;
        }
        Some(RelayConfig {
            signaling_url: self.relay.signaling_url.clone(),
            server_name: self.server.name.clone(),
            max_retries: self.relay.max_retries.max(1),
            initial_backoff: Duration::from_millis(self.relay.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.relay.max_backoff_ms),
        })
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads the configuration at `path`, or the defaults if there is no file.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletop_core::cipher::KeyPair;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tabletop-config-{}", uuid::Uuid::new_v4()))
            .join(CONFIG_FILE_NAME)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        // Act
        let config = load_config(&temp_path()).unwrap();

        // Assert
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.network.port, 51234);
        assert!(!config.relay.enabled);
        assert!(config.policy.include_owned_npcs);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        // Arrange
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "[server]\nplayer_password = \"correct\"\n\n[policy]\nmovement_locked = true\n",
        )
        .unwrap();

        // Act
        let config = load_config(&path).unwrap();

        // Assert
        assert_eq!(config.server.player_password, "correct");
        assert_eq!(config.server.name, "tabletop");
        assert!(config.policy.movement_locked);
        assert!(config.policy.include_owned_npcs);
        assert_eq!(config.network.handshake_timeout_secs, 10);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_save_then_load_preserves_values() {
        // Arrange
        let path = temp_path();
        let mut config = ServerConfig::default();
        config.server.version_bypass = vec!["DEVELOPMENT".to_string()];
        config.relay.enabled = true;
        config.relay.signaling_url = "ws://localhost:9000".to_string();

        // Act
        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();

        // Assert
        assert_eq!(loaded, config);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[network\nport = ").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_read_timeout_is_heartbeat_multiple() {
        let mut config = ServerConfig::default();
        config.network.heartbeat_interval_secs = 4;
        config.network.read_timeout_heartbeats = 3;

        assert_eq!(config.read_timeout(), Duration::from_secs(12));
    }

    #[test]
    fn test_socket_config_rejects_hostname() {
        let mut config = ServerConfig::default();
        config.network.bind_address = "localhost".to_string();

        assert!(matches!(
            config.socket_config(),
            Err(ConfigError::BindAddress(_))
        ));
    }

    #[test]
    fn test_relay_config_requires_enabled_and_url() {
        let mut config = ServerConfig::default();
        assert!(config.relay_config().is_none());

        config.relay.enabled = true;
        assert!(config.relay_config().is_none());

        config.relay.signaling_url = "ws://relay".to_string();
        let relay = config.relay_config().unwrap();
        assert_eq!(relay.server_name, "tabletop");
    }

    #[test]
    fn test_validator_uses_passwords_and_keys() {
        // Arrange
        let pair = KeyPair::generate();
        let mut config = ServerConfig::default();
        config.server.version = "1.0".to_string();
        config.server.player_password = "correct".to_string();
        config.authorized_keys.push(AuthorizedKeyEntry {
            name: "Alice".to_string(),
            role: "player".to_string(),
            public_key: pair.public_key_text().unwrap(),
        });
        let fingerprint = tabletop_core::cipher::asymmetric::public_key_fingerprint(
            &pair.public_key_text().unwrap(),
        )
        .unwrap();

        // Act
        let validator = config.validator().unwrap();

        // Assert
        assert!(validator.password_matches(Role::Player, "correct"));
        assert!(!validator.password_matches(Role::Gm, ""));
        assert!(validator.key_for("alice", &fingerprint).is_some());
    }

    #[test]
    fn test_validator_rejects_bad_role_and_bad_key() {
        let mut config = ServerConfig::default();
        config.authorized_keys.push(AuthorizedKeyEntry {
            name: "Alice".to_string(),
            role: "wizard".to_string(),
            public_key: String::new(),
        });
        assert!(matches!(config.validator(), Err(ConfigError::Role(_))));

        config.authorized_keys[0].role = "GM".to_string();
        config.authorized_keys[0].public_key =
            "-----BEGIN PUBLIC KEY-----\nnot base64!\n-----END PUBLIC KEY-----".to_string();
        assert!(matches!(
            config.validator(),
            Err(ConfigError::AuthorizedKey { .. })
        ));
    }
}
