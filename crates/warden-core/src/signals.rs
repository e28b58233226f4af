//! Fan-out of forwardable process signals.
//!
//! A [`SignalForwarder`] installs one OS handler per configured signal and
//! rebroadcasts every delivery, so each remote command session can hold its
//! own subscription without stealing signals from the others.

use std::str::FromStr;

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 16;

/// Errors from resolving forwardable signal names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("unknown signal name: {0}")]
    Unknown(String),

    #[error("{0} cannot be caught and is never forwarded")]
    KillOnly(String),
}

/// Resolve configured signal names, rejecting signals that cannot be caught.
pub fn parse_forwardable(names: &[String]) -> Result<Vec<Signal>, SignalError> {
    names
        .iter()
        .map(|name| {
            let signal =
                Signal::from_str(name).map_err(|_| SignalError::Unknown(name.clone()))?;
            match signal {
                Signal::SIGKILL | Signal::SIGSTOP => Err(SignalError::KillOnly(name.clone())),
                signal => Ok(signal),
            }
        })
        .collect()
}

/// Broadcasts forwardable signals to any number of subscribers.
#[derive(Clone)]
pub struct SignalForwarder {
    tx: broadcast::Sender<Signal>,
}

impl Default for SignalForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalForwarder {
    /// A forwarder with no OS handlers; deliveries come only from [`forward`].
    ///
    /// [`forward`]: SignalForwarder::forward
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Install OS handlers for `signals` and rebroadcast their deliveries.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(signals: &[Signal]) -> std::io::Result<Self> {
        let forwarder = Self::new();
        for &sig in signals {
            let mut stream = signal(SignalKind::from_raw(sig as i32))?;
            let tx = forwarder.tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    debug!(signal = sig.as_str(), "forwardable signal received");
                    let _ = tx.send(sig);
                }
            });
        }
        Ok(forwarder)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    /// Deliver `signal` to current subscribers. Returns how many received it.
    pub fn forward(&self, signal: Signal) -> usize {
        self.tx.send(signal).unwrap_or(0)
    }
}
