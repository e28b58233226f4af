//! Daemon test helpers.
//!
//! [`TestDaemon`] runs a real [`Daemon`] on sockets inside a temporary
//! directory and hands back a connected [`IpcClient`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use warden_config::AppConfig;
use warden_core::network::OverrideInstaller;
use warden_core::{Daemon, DaemonError, IpcClient};

use crate::config::TestConfigBuilder;

const START_TIMEOUT: Duration = Duration::from_secs(5);

/// A running daemon scoped to a test.
///
/// The temp directory is deleted automatically when this value is dropped,
/// guaranteeing cleanup even on panic.
pub struct TestDaemon {
    pub config: AppConfig,
    pub client: IpcClient,
    handle: JoinHandle<Result<(), DaemonError>>,
    _temp_dir: Option<TempDir>,
}

impl TestDaemon {
    /// Start a daemon with default test config in a fresh temp directory.
    pub async fn start(installer: Arc<dyn OverrideInstaller>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = TestConfigBuilder::new(temp_dir.path()).build();
        let mut daemon = Self::start_with_config(config, installer).await;
        daemon._temp_dir = Some(temp_dir);
        daemon
    }

    /// Start a daemon with the given config. The caller owns the socket paths.
    pub async fn start_with_config(
        config: AppConfig,
        installer: Arc<dyn OverrideInstaller>,
    ) -> Self {
        let client = IpcClient::new(&config.daemon.socket_path);
        let daemon = Daemon::new(config.clone()).with_installer(installer);
        let handle = tokio::spawn(daemon.run());

        wait_until_serving(&client).await;

        Self {
            config,
            client,
            handle,
            _temp_dir: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.daemon.socket_path
    }

    pub fn connector_socket_path(&self) -> PathBuf {
        self.config.daemon.connector_socket_path.clone()
    }

    /// Wait for the daemon to exit and return its result.
    pub async fn join(self) -> Result<(), DaemonError> {
        tokio::time::timeout(START_TIMEOUT, self.handle)
            .await
            .expect("daemon did not exit in time")
            .expect("daemon task panicked")
    }
}

async fn wait_until_serving(client: &IpcClient) {
    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if client.version().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon did not start serving within {START_TIMEOUT:?}");
}

/// Poll `check` until it returns `true` or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
