//! Network override actor, the single owner of the daemon's override.
//!
//! Every request that reads or mutates the override goes through the
//! [`NetworkService`] command channel, so concurrent `status`, `pause`, and
//! `resume` calls are applied one at a time in arrival order.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::ipc::socket_exists;
use crate::ipc::types::{DaemonStatus, PauseError, ResumeError};
use crate::supervisor::Shutdown;

use super::{NetworkOverride, OverrideInstaller};

const SERVICE_STOPPED: &str = "network service is shutting down";

/// Requests handled by the [`NetworkService`].
enum Command {
    Status(oneshot::Sender<DaemonStatus>),
    Pause(oneshot::Sender<Result<(), PauseError>>),
    Resume(oneshot::Sender<Result<(), ResumeError>>),
}

/// The actor owning the network override.
pub struct NetworkService {
    command_rx: mpsc::Receiver<Command>,
    installer: Arc<dyn OverrideInstaller>,
    connector_socket: PathBuf,
    network: Option<Box<dyn NetworkOverride>>,
}

/// Handle for talking to a running [`NetworkService`].
#[derive(Clone)]
pub struct NetworkHandle {
    command_tx: mpsc::Sender<Command>,
}

impl NetworkHandle {
    /// Current override health. Reports `Paused` once the service has stopped.
    pub async fn status(&self) -> DaemonStatus {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Status(tx)).await.is_err() {
            return DaemonStatus::Paused;
        }
        rx.await.unwrap_or(DaemonStatus::Paused)
    }

    /// Release the override.
    pub async fn pause(&self) -> Result<(), PauseError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Pause(tx))
            .await
            .map_err(|_| PauseError::Unexpected(SERVICE_STOPPED.to_string()))?;
        rx.await
            .unwrap_or_else(|_| Err(PauseError::Unexpected(SERVICE_STOPPED.to_string())))
    }

    /// Install a new override if none is held.
    pub async fn resume(&self) -> Result<(), ResumeError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Resume(tx))
            .await
            .map_err(|_| ResumeError::Unexpected(SERVICE_STOPPED.to_string()))?;
        rx.await
            .unwrap_or_else(|_| Err(ResumeError::Unexpected(SERVICE_STOPPED.to_string())))
    }
}

impl NetworkService {
    /// Create the service and a handle for sending it requests.
    ///
    /// The service starts paused; the daemon's setup worker performs the
    /// initial installation through [`NetworkHandle::resume`].
    pub fn new(
        installer: Arc<dyn OverrideInstaller>,
        connector_socket: impl Into<PathBuf>,
    ) -> (Self, NetworkHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);

        let service = Self {
            command_rx,
            installer,
            connector_socket: connector_socket.into(),
            network: None,
        };

        (service, NetworkHandle { command_tx })
    }

    /// Serve requests until shutdown or until every handle is dropped, then
    /// release the override if one is still held.
    pub async fn run(mut self, shutdown: Shutdown) {
        info!(installer = self.installer.name(), "Network service started");

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }

        if let Some(network) = self.network.take() {
            info!("Releasing network override");
            if let Err(e) = network.close().await {
                error!(error = %e, "failed to release network override on exit");
            }
        }
        info!("Network service stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause().await);
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume().await);
            }
        }
    }

    fn status(&self) -> DaemonStatus {
        match &self.network {
            None => DaemonStatus::Paused,
            Some(network) if !network.is_okay() => DaemonStatus::NoNetwork,
            Some(_) => DaemonStatus::Ok,
        }
    }

    async fn pause(&mut self) -> Result<(), PauseError> {
        if socket_exists(&self.connector_socket) {
            debug!(socket = %self.connector_socket.display(), "pause rejected: connector is running");
            return Err(PauseError::ConnectedToCluster);
        }
        let Some(network) = self.network.take() else {
            debug!("pause rejected: already paused");
            return Err(PauseError::AlreadyPaused);
        };

        // The reference is dropped whether or not close succeeds.
        match network.close().await {
            Ok(()) => {
                info!("Network override paused");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "pause");
                Err(PauseError::Unexpected(e.to_string()))
            }
        }
    }

    async fn resume(&mut self) -> Result<(), ResumeError> {
        if let Some(network) = &self.network {
            return if network.is_okay() {
                debug!("resume rejected: not paused");
                Err(ResumeError::NotPaused)
            } else {
                warn!("resume rejected: override is unhealthy and being re-established");
                Err(ResumeError::ReEstablishing)
            };
        }

        match self.installer.install().await {
            Ok(network) => {
                self.network = Some(network);
                info!("Network override installed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "resume");
                Err(ResumeError::Unexpected(e.to_string()))
            }
        }
    }
}
