//! Daemon assembly: privilege check, supervised workers, lifecycle logging.
//!
//! ```text
//!   network ──ready──▶ ipc (bind 0777, serve) ──ready──▶ setup (initial resume)
//! ```
//!
//! The IPC worker serves until the [`ShutdownCoordinator`] sees a termination
//! signal or a supervisor shutdown (e.g. `quit`), then cascades the quit to a
//! downstream daemon and removes its socket.

use std::sync::Arc;

use tracing::{debug, info, info_span};

use warden_config::AppConfig;

use crate::build_info;
use crate::identity::LocalIdentity;
use crate::ipc::server::{self, IpcState};
use crate::network::{NetworkService, NoopInstaller, OverrideInstaller};
use crate::shutdown::ShutdownCoordinator;
use crate::supervisor::{BoxError, Supervisor, SupervisorError, Worker};

/// The warden daemon.
pub struct Daemon {
    config: AppConfig,
    installer: Arc<dyn OverrideInstaller>,
}

impl Daemon {
    /// Create a daemon using the no-op override installer.
    pub fn new(config: AppConfig) -> Self {
        let installer = Arc::new(NoopInstaller::new(&config.network));
        Self { config, installer }
    }

    /// Use `installer` to create network overrides.
    pub fn with_installer(mut self, installer: Arc<dyn OverrideInstaller>) -> Self {
        self.installer = installer;
        self
    }

    /// Get a reference to the daemon's configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run the daemon until it shuts down.
    ///
    /// Never returns `Ok`: a daemon that stops has exited, and the returned
    /// [`DaemonError::Exited`] carries the workers' terminal errors.
    pub async fn run(self) -> Result<(), DaemonError> {
        if self.config.daemon.require_root {
            check_privilege(&LocalIdentity::detect())?;
        }

        info!("---");
        info!(
            version = %build_info::version_string(),
            pid = std::process::id(),
            installer = self.installer.name(),
            "Warden daemon starting"
        );

        let Daemon { config, installer } = self;
        let mut supervisor = Supervisor::new(info_span!("daemon"));
        let shutdown = supervisor.shutdown_handle();

        let (service, network) =
            NetworkService::new(installer, &config.daemon.connector_socket_path);

        let network_id = supervisor.supervise(Worker::new("network", move |process| async move {
            process.ready();
            service.run(process.shutdown().clone()).await;
            Ok::<_, BoxError>(())
        }))?;

        let state = Arc::new(IpcState {
            network: network.clone(),
            shutdown: shutdown.clone(),
        });
        let coordinator = ShutdownCoordinator::new(
            shutdown.clone(),
            &config.daemon.connector_socket_path,
            config.daemon.cascade_timeout(),
        );
        let socket_path = config.daemon.socket_path.clone();
        let ipc_id = supervisor.supervise(
            Worker::new("ipc", move |process| async move {
                let listener = server::bind(&socket_path)?;
                process.ready();

                let stop = coordinator.clone();
                let served = server::serve(listener, state, async move { stop.wait().await }).await;

                coordinator.cascade().await;
                if let Err(e) = std::fs::remove_file(&socket_path) {
                    debug!(error = %e, "failed to remove control socket");
                }
                served?;
                Ok::<_, BoxError>(())
            })
            .requires(network_id),
        )?;

        let install_on_start = config.network.install_on_start;
        supervisor.supervise(
            Worker::new("setup", move |process| async move {
                if install_on_start {
                    network.resume().await?;
                    info!("Initial network override installed");
                } else {
                    info!("Initial network override installation skipped");
                }
                process.ready();
                Ok::<_, BoxError>(())
            })
            .requires(ipc_id),
        )?;

        let errors = supervisor.run().await;

        info!(errors = errors.len(), "Warden daemon exiting");
        for err in &errors {
            info!(worker = err.worker(), error = %err, "worker error");
        }
        info!("Warden daemon is done");

        Err(DaemonError::Exited { errors })
    }
}

fn check_privilege(identity: &LocalIdentity) -> Result<(), DaemonError> {
    if identity.is_privileged {
        return Ok(());
    }
    Err(DaemonError::NotPrivileged {
        user: identity.username.clone(),
        uid: identity.uid,
    })
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("the daemon must run as root (running as {user}, uid {uid})")]
    NotPrivileged { user: String, uid: u32 },

    #[error("daemon startup failed: {0}")]
    Startup(#[from] SupervisorError),

    #[error("daemon has exited ({} worker errors)", errors.len())]
    Exited { errors: Vec<SupervisorError> },
}

impl DaemonError {
    /// Worker errors collected before the daemon exited.
    pub fn worker_errors(&self) -> &[SupervisorError] {
        match self {
            Self::Exited { errors } => errors,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ipc::{DaemonStatus, IpcClient};

    fn test_config(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.daemon.socket_path = dir.path().join("daemon.sock");
        config.daemon.connector_socket_path = dir.path().join("connector.sock");
        config.daemon.require_root = false;
        config
    }

    async fn wait_for_socket(client: &IpcClient) {
        for _ in 0..100 {
            if client.status().await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("daemon did not start listening");
    }

    #[test]
    fn test_privilege_check() {
        assert!(check_privilege(&LocalIdentity::from_parts("root", 0)).is_ok());

        let err = check_privilege(&LocalIdentity::from_parts("alice", 1000)).unwrap_err();
        assert!(matches!(err, DaemonError::NotPrivileged { uid: 1000, .. }));
        assert!(err.to_string().contains("alice"));
    }

    #[tokio::test]
    async fn test_daemon_creation() {
        let daemon = Daemon::new(AppConfig::default());
        assert!(daemon.config().daemon.require_root);
        assert_eq!(daemon.installer.name(), "noop");
    }

    #[test_log::test(tokio::test)]
    async fn test_quit_stops_daemon_and_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let socket = config.daemon.socket_path.clone();
        let daemon = tokio::spawn(Daemon::new(config).run());

        let client = IpcClient::new(&socket);
        wait_for_socket(&client).await;
        // Setup installs the override right after the server is ready.
        let mut status = client.status().await.unwrap().status;
        for _ in 0..50 {
            if status == DaemonStatus::Ok {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = client.status().await.unwrap().status;
        }
        assert_eq!(status, DaemonStatus::Ok);

        assert!(client.quit().await.unwrap().acknowledged);

        let result = tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .unwrap()
            .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, DaemonError::Exited { .. }));
        assert!(err.worker_errors().is_empty());
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_install_on_start_can_be_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.network.install_on_start = false;
        let socket = config.daemon.socket_path.clone();
        let daemon = tokio::spawn(Daemon::new(config).run());

        let client = IpcClient::new(&socket);
        wait_for_socket(&client).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.status().await.unwrap().status, DaemonStatus::Paused);

        client.quit().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), daemon).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported_as_worker_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut config = test_config(&dir);
        config.daemon.socket_path = blocker.join("daemon.sock");

        let result = tokio::time::timeout(Duration::from_secs(5), Daemon::new(config).run())
            .await
            .unwrap();
        let err = result.unwrap_err();
        let errors = err.worker_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].worker(), "ipc");
    }
}
