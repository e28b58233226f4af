//! Network override resource.
//!
//! A network override is an installed, OS-level change to DNS and routing
//! state. How it is installed is not this crate's concern: the daemon only
//! sees the [`NetworkOverride`] handle (liveness check and release) produced
//! by an [`OverrideInstaller`].
//!
//! The daemon owns at most one override at a time. Ownership lives inside
//! the [`service::NetworkService`] actor so that status, pause, and resume
//! requests are serialized.
//!
//! ```text
//!   IPC handlers ──▶ NetworkHandle ──mpsc──▶ NetworkService
//!                                              │ owns Option<Box<dyn NetworkOverride>>
//!                                              ▼
//!                                       OverrideInstaller::install()
//! ```

pub mod noop;
pub mod service;

use crate::BoxFuture;

pub use noop::{NoopInstaller, NoopOverride};
pub use service::{NetworkHandle, NetworkService};

/// Errors from installing or releasing a network override.
#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("failed to install network override: {0}")]
    Install(String),

    #[error("failed to release network override: {0}")]
    Release(String),
}

/// An active network override.
pub trait NetworkOverride: Send + Sync {
    /// Whether the override is still in effect and healthy.
    fn is_okay(&self) -> bool;

    /// Remove the override. The handle is consumed even when removal fails.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), OverrideError>>;
}

/// Creates network overrides.
pub trait OverrideInstaller: Send + Sync {
    /// Human-readable name of this installer (e.g. "noop").
    fn name(&self) -> &str;

    /// Install a new override.
    fn install(&self) -> BoxFuture<'_, Result<Box<dyn NetworkOverride>, OverrideError>>;
}
