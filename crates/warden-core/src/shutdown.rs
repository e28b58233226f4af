//! Shutdown coordination for the IPC server and the downstream daemon.

use std::path::PathBuf;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::ipc::{IpcClient, socket_exists};
use crate::supervisor::Shutdown;

/// Decides when the IPC server stops and cascades the stop downstream.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown: Shutdown,
    downstream_socket: PathBuf,
    cascade_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        shutdown: Shutdown,
        downstream_socket: impl Into<PathBuf>,
        cascade_timeout: Duration,
    ) -> Self {
        Self {
            shutdown,
            downstream_socket: downstream_socket.into(),
            cascade_timeout,
        }
    }

    /// Resolve on `SIGINT`/`SIGTERM` or on a supervisor shutdown, whichever
    /// comes first. A signal triggers the supervisor shutdown as well.
    pub async fn wait(&self) {
        tokio::select! {
            name = termination_signal() => {
                info!(signal = name, "Termination signal received, shutting down");
                self.shutdown.trigger();
            }
            _ = self.shutdown.wait() => {
                debug!("supervisor shutdown observed");
            }
        }
    }

    /// Ask the downstream daemon to quit if its socket is present.
    ///
    /// Best effort: failures and timeouts are logged and ignored. Returns
    /// whether the downstream daemon acknowledged.
    pub async fn cascade(&self) -> bool {
        if !socket_exists(&self.downstream_socket) {
            debug!(socket = %self.downstream_socket.display(), "no downstream daemon");
            return false;
        }

        info!(socket = %self.downstream_socket.display(), "Asking downstream daemon to quit");
        let client = IpcClient::new(&self.downstream_socket);
        match tokio::time::timeout(self.cascade_timeout, client.quit()).await {
            Ok(Ok(resp)) => resp.acknowledged,
            Ok(Err(e)) => {
                debug!(error = %e, "downstream quit failed");
                false
            }
            Err(_) => {
                debug!(timeout = ?self.cascade_timeout, "downstream quit timed out");
                false
            }
        }
    }
}

async fn termination_signal() -> &'static str {
    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "cannot listen for termination signals");
                return std::future::pending().await;
            }
        };

    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}
