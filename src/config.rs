use crate::core::{BridgeError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "SQLBRIDGE_CONFIG";

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub heartbeat: HeartbeatConfig,
    pub diagnostics: DiagnosticsConfig,
    /// Named data sources, keyed by DSN name.
    pub dsn: BTreeMap<String, DsnConfig>,
}

/// Connection-related configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub default_dsn: String,
    pub default_schema: String,
    /// Backend text meaning the connection died underneath us.
    pub dead_connection_patterns: Vec<String>,
    /// Connect-time text meaning the tunnel to the backend is down.
    pub tunnel_error_patterns: Vec<String>,
    pub tunnel_hint: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            default_dsn: "Hermes".to_string(),
            default_schema: "main".to_string(),
            dead_connection_patterns: vec![
                "Invalid SessionHandle".to_string(),
                "Invalid OperationHandle".to_string(),
                "Broken pipe".to_string(),
                "Connection reset by peer".to_string(),
                "Socket closed".to_string(),
            ],
            tunnel_error_patterns: vec![
                "Connection refused".to_string(),
                "Could not connect to".to_string(),
                "No route to host".to_string(),
                "Failed to establish connection with the host".to_string(),
            ],
            tunnel_hint: "Hint: the tunnel to the cluster appears to be down. \
                          Check that the SSH tunnel is running and the forwarded port is open, then reconnect."
                .to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Whether `text` carries the dead-connection signature.
    pub fn is_dead_connection(&self, text: &str) -> bool {
        contains_any(text, &self.dead_connection_patterns)
    }

    /// Whether `text` carries the broken-tunnel signature.
    pub fn is_broken_tunnel(&self, text: &str) -> bool {
        contains_any(text, &self.tunnel_error_patterns)
    }
}

/// Heartbeat-related configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: f64,
    pub grace_secs: f64,
    pub keepalive_sql: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_secs: 120.0,
            grace_secs: 30.0,
            keepalive_sql: "SELECT 1".to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs.max(0.001))
    }

    /// Idle time after which a tick sends a keepalive statement.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs_f64((self.interval_secs - self.grace_secs).max(0.0))
    }
}

/// Error classification limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub max_message_len: usize,
    pub snippet_len: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        DiagnosticsConfig {
            max_message_len: 500,
            snippet_len: 200,
        }
    }
}

/// DSN name that opens the seeded demo database even when not configured.
pub const MOCK_DSN: &str = "Mock";

/// Delay applied to `SLOW_QUERY` statements on a seeded DSN by default.
pub const DEFAULT_SLOW_QUERY_MS: u64 = 10_000;

/// One named data source.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DsnConfig {
    /// Database file, or `:memory:`
    pub path: String,
    pub schema: Option<String>,
    /// Load the demo tables on connect and honor the `SLOW_QUERY` marker
    #[serde(default)]
    pub seed: bool,
    /// Delay for statements containing `SLOW_QUERY`, seeded DSNs only
    #[serde(default)]
    pub slow_query_ms: Option<u64>,
}

impl DsnConfig {
    /// A plain database at `path`.
    pub fn at_path(path: &str) -> Self {
        DsnConfig {
            path: path.to_string(),
            schema: None,
            seed: false,
            slow_query_ms: None,
        }
    }

    /// The in-memory demo database behind [`MOCK_DSN`].
    pub fn mock() -> Self {
        DsnConfig {
            seed: true,
            ..DsnConfig::at_path(":memory:")
        }
    }

    /// How long a `SLOW_QUERY` statement waits before running, if at all.
    pub fn slow_query_delay(&self) -> Option<Duration> {
        self.seed
            .then(|| Duration::from_millis(self.slow_query_ms.unwrap_or(DEFAULT_SLOW_QUERY_MS)))
    }
}

impl Config {
    /// Schema to select for `dsn`: the DSN's own, else the default.
    pub fn schema_for(&self, dsn: &str) -> String {
        self.dsn
            .get(dsn)
            .and_then(|entry| entry.schema.clone())
            .unwrap_or_else(|| self.connection.default_schema.clone())
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = sqlbridge::config::load_config("config.toml").expect("Failed to load config");
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))
}

/// Finds the configuration file to use.
///
/// An explicit path wins, then `$SQLBRIDGE_CONFIG`, then
/// `<config dir>/sqlbridge/config.toml` if it exists.
pub fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join("sqlbridge").join("config.toml"))
        .filter(|path| path.is_file())
}

/// Loads the located configuration, or defaults when there is none.
pub fn load_or_default(explicit: Option<&Path>) -> Result<Config> {
    match locate_config(explicit) {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

fn contains_any(text: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && text.contains(pattern.as_str()))
}
