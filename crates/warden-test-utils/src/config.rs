//! Configuration builders for tests.
//!
//! [`TestConfigBuilder`] places both sockets inside a caller-owned directory
//! and turns off the root requirement, so a daemon can run unprivileged.

use std::path::{Path, PathBuf};

use warden_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let dir = tempfile::tempdir()?;
/// let config = TestConfigBuilder::new(dir.path())
///     .install_on_start(false)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    /// Sockets go to `socket_dir/daemon.sock` and `socket_dir/connector.sock`.
    pub fn new(socket_dir: &Path) -> Self {
        let mut config = AppConfig::default();
        config.daemon.socket_path = socket_dir.join("daemon.sock");
        config.daemon.connector_socket_path = socket_dir.join("connector.sock");
        config.daemon.require_root = false;
        config.daemon.cascade_timeout_secs = 1;
        Self { config }
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.daemon.socket_path = path.into();
        self
    }

    pub fn connector_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.daemon.connector_socket_path = path.into();
        self
    }

    pub fn install_on_start(mut self, install: bool) -> Self {
        self.config.network.install_on_start = install;
        self
    }

    pub fn grace_period_secs(mut self, secs: u64) -> Self {
        self.config.session.grace_period_secs = secs;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}
