#![deny(unsafe_code)]

//! Configuration loading and validation for warden.
//!
//! [`AppConfig`] covers the daemon's sockets, the network override, remote
//! command sessions, and logging. Every field has a default, so an empty file
//! is a valid configuration; [`AppConfig::validate`] rejects combinations the
//! daemon cannot run with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Signals that can only kill or stop a process and are never forwarded.
pub const KILL_ONLY_SIGNALS: [&str; 2] = ["SIGKILL", "SIGSTOP"];

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon process and control socket configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Network override configuration.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Remote command session configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the daemon process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path of the control socket the daemon listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Path of the downstream (connector) daemon's socket. Its presence
    /// means a dependent session is active.
    #[serde(default = "default_connector_socket_path")]
    pub connector_socket_path: PathBuf,

    /// Upper bound on the best-effort `quit` sent to the downstream daemon.
    #[serde(default = "default_cascade_timeout_secs")]
    pub cascade_timeout_secs: u64,

    /// Refuse to start unless running with elevated privilege.
    #[serde(default = "default_require_root")]
    pub require_root: bool,
}

impl DaemonConfig {
    pub fn cascade_timeout(&self) -> Duration {
        Duration::from_secs(self.cascade_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connector_socket_path: default_connector_socket_path(),
            cascade_timeout_secs: default_cascade_timeout_secs(),
            require_root: default_require_root(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/warden-daemon.socket")
}

fn default_connector_socket_path() -> PathBuf {
    PathBuf::from("/tmp/warden-connector.socket")
}

fn default_cascade_timeout_secs() -> u64 {
    3
}

fn default_require_root() -> bool {
    true
}

/// Network override configuration.
///
/// The values are handed to the override installer untouched; the daemon
/// itself only cares whether an override is installed and healthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Install the override as soon as the control socket is listening.
    #[serde(default = "default_install_on_start")]
    pub install_on_start: bool,

    /// DNS server the override should route lookups to (empty = system default).
    #[serde(default)]
    pub dns: String,

    /// Fallback DNS server used when the primary one is unreachable.
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            install_on_start: default_install_on_start(),
            dns: String::new(),
            fallback: default_fallback(),
        }
    }
}

fn default_install_on_start() -> bool {
    true
}

fn default_fallback() -> String {
    "8.8.8.8".to_string()
}

/// Configuration for client-side remote command sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds to wait after a soft cancel before tearing the session down.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Maximum number of stdin bytes forwarded per data frame.
    #[serde(default = "default_stdin_chunk_size")]
    pub stdin_chunk_size: usize,

    /// Signals that trigger a soft cancel of the remote command.
    #[serde(default = "default_forward_signals")]
    pub forward_signals: Vec<String>,
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            stdin_chunk_size: default_stdin_chunk_size(),
            forward_signals: default_forward_signals(),
        }
    }
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_stdin_chunk_size() -> usize {
    1024
}

fn default_forward_signals() -> Vec<String> {
    ["SIGINT", "SIGTERM", "SIGHUP"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "daemon.socket_path must not be empty".to_string(),
            ));
        }
        if self.daemon.connector_socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "daemon.connector_socket_path must not be empty".to_string(),
            ));
        }
        if self.daemon.socket_path == self.daemon.connector_socket_path {
            return Err(ConfigError::Validation(format!(
                "daemon.socket_path and daemon.connector_socket_path must differ, both are {:?}",
                self.daemon.socket_path
            )));
        }
        if self.daemon.cascade_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon.cascade_timeout_secs must be non-zero".to_string(),
            ));
        }

        if self.session.grace_period_secs == 0 {
            return Err(ConfigError::Validation(
                "session.grace_period_secs must be non-zero".to_string(),
            ));
        }
        if self.session.stdin_chunk_size == 0 {
            return Err(ConfigError::Validation(
                "session.stdin_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.session.forward_signals.is_empty() {
            return Err(ConfigError::Validation(
                "session.forward_signals must name at least one signal".to_string(),
            ));
        }
        for (i, name) in self.session.forward_signals.iter().enumerate() {
            if KILL_ONLY_SIGNALS.contains(&name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "session.forward_signals[{i}] cannot be forwarded: {name:?}"
                )));
            }
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                LOG_LEVELS, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(
            config.daemon.socket_path,
            PathBuf::from("/var/run/warden-daemon.socket")
        );
        assert!(config.daemon.require_root);
        assert!(config.network.install_on_start);
        assert_eq!(config.session.grace_period(), Duration::from_secs(5));
        assert_eq!(config.session.stdin_chunk_size, 1024);
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.daemon.cascade_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.session.forward_signals,
            vec!["SIGINT", "SIGTERM", "SIGHUP"]
        );
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [daemon]
            socket_path = "/run/warden/daemon.sock"
            connector_socket_path = "/run/warden/connector.sock"
            cascade_timeout_secs = 1
            require_root = false

            [network]
            install_on_start = false
            dns = "10.0.0.10"
            fallback = "1.1.1.1"

            [session]
            grace_period_secs = 2
            stdin_chunk_size = 4096
            forward_signals = ["SIGINT"]

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(
            config.daemon.connector_socket_path,
            PathBuf::from("/run/warden/connector.sock")
        );
        assert!(!config.daemon.require_root);
        assert!(!config.network.install_on_start);
        assert_eq!(config.network.dns, "10.0.0.10");
        assert_eq!(config.network.fallback, "1.1.1.1");
        assert_eq!(config.session.grace_period(), Duration::from_secs(2));
        assert_eq!(config.session.stdin_chunk_size, 4096);
        assert_eq!(config.session.forward_signals, vec!["SIGINT"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_same_socket_paths() {
        let toml = r#"
            [daemon]
            socket_path = "/tmp/same.sock"
            connector_socket_path = "/tmp/same.sock"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_socket_path() {
        let toml = r#"
            [daemon]
            socket_path = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_cascade_timeout() {
        let toml = r#"
            [daemon]
            cascade_timeout_secs = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_grace_period() {
        let toml = r#"
            [session]
            grace_period_secs = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_chunk_size() {
        let toml = r#"
            [session]
            stdin_chunk_size = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_kill_only_signals() {
        for signal in KILL_ONLY_SIGNALS {
            let toml = format!("[session]\nforward_signals = [\"SIGINT\", \"{signal}\"]\n");
            let err = AppConfig::parse(&toml).unwrap_err();
            assert!(err.to_string().contains(signal));
        }
    }

    #[test]
    fn test_validation_rejects_empty_signal_list() {
        let toml = r#"
            [session]
            forward_signals = []
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let toml = r#"
            [logging]
            level = "verbose"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("warden.toml");
        tokio::fs::write(
            &path,
            b"[daemon]\nrequire_root = false\n\n[session]\ngrace_period_secs = 9\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert!(!config.daemon.require_root);
        assert_eq!(config.session.grace_period_secs, 9);
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = AppConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("connector_socket_path"));
        let reparsed = AppConfig::parse(&rendered).unwrap();
        assert_eq!(reparsed.daemon.socket_path, config.daemon.socket_path);
    }
}
