//! Configuration Vault – reads/writes `~/.diagstream/config.toml`.

use diagstream_middleware::{API_BASE_URL_ENV, DEFAULT_API_BASE_URL, DEFAULT_EMIT_MESSAGE};
use diagstream_types::DiagError;
use diagstream_viewer::DEFAULT_LOG_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PORT_ENV: &str = "DIAGSTREAM_PORT";
pub const ENV_ENV: &str = "DIAGSTREAM_ENV";
pub const LOG_CAPACITY_ENV: &str = "DIAGSTREAM_LOG_CAPACITY";

/// Persisted user configuration stored in `~/.diagstream/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Backend base URL; trailing slashes are ignored.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Port for `/serve`.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Deployment environment reported by `/serve` (`production` disables CORS).
    #[serde(default = "default_env")]
    pub env: String,

    /// Events retained by the viewer.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Message sent by a bare `/emit`.
    #[serde(default = "default_emit_message")]
    pub emit_message: String,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}
fn default_server_port() -> u16 {
    diagstream_cockpit::DEFAULT_PORT
}
fn default_env() -> String {
    "development".to_string()
}
fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}
fn default_emit_message() -> String {
    DEFAULT_EMIT_MESSAGE.to_string()
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            server_port: default_server_port(),
            env: default_env(),
            log_capacity: default_log_capacity(),
            emit_message: default_emit_message(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Config {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms))
    }
}

/// Return the path to `~/.diagstream/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".diagstream").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, DiagError> {
    load_from(&config_path())
}

/// Saved config (or defaults) with env overrides applied.
pub fn load_or_default() -> Result<Config, DiagError> {
    match load()? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, DiagError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        DiagError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| DiagError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `DIAGSTREAM_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DIAGSTREAM_API_BASE_URL` | `api_base_url` |
/// | `DIAGSTREAM_PORT` | `server_port` |
/// | `DIAGSTREAM_ENV` | `env` |
/// | `DIAGSTREAM_LOG_CAPACITY` | `log_capacity` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var(API_BASE_URL_ENV)
        && !v.trim().is_empty()
    {
        cfg.api_base_url = v.trim().to_string();
    }
    if let Ok(v) = std::env::var(PORT_ENV)
        && let Ok(port) = v.trim().parse::<u16>()
    {
        cfg.server_port = port;
    }
    if let Ok(v) = std::env::var(ENV_ENV)
        && !v.trim().is_empty()
    {
        cfg.env = v.trim().to_string();
    }
    if let Ok(v) = std::env::var(LOG_CAPACITY_ENV)
        && let Ok(cap) = v.trim().parse::<usize>()
        && cap > 0
    {
        cfg.log_capacity = cap;
    }
}

/// Save the config to disk, creating `~/.diagstream/` if necessary.
pub fn save(cfg: &Config) -> Result<(), DiagError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), DiagError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            DiagError::Config(format!("failed to create config directory: {e}"))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                DiagError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| DiagError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| DiagError::Config(format!("failed to write config at {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
