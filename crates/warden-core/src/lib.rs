#![deny(unsafe_code)]

//! Warden core daemon runtime.
//!
//! A privileged daemon that owns a host network override, exposes
//! pause/resume/quit control over a local socket, and runs commands on
//! behalf of unprivileged clients while streaming their stdio. Startup and
//! shutdown are driven by a dependency-ordered worker supervisor, and a
//! shutdown cascades to a downstream daemon when one is running.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future: the return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Daemon assembly and lifecycle.
pub mod daemon;
/// Daemon side of remote command execution.
pub mod exec;
/// Effective-uid identity and privilege detection.
pub mod identity;
/// Control-plane IPC over a Unix socket.
pub mod ipc;
/// Network override resource and its pause/resume actor.
pub mod network;
/// Client side of remote command execution.
pub mod session;
/// Shutdown coordination and downstream cascade.
pub mod shutdown;
/// Forwardable-signal fan-out.
pub mod signals;
/// Dependency-ordered worker supervisor.
pub mod supervisor;

pub use daemon::{Daemon, DaemonError};
pub use identity::LocalIdentity;
pub use ipc::IpcClient;
pub use network::{NetworkOverride, OverrideError, OverrideInstaller};
pub use session::{RemoteCommandSession, SessionError, Termination};
pub use shutdown::ShutdownCoordinator;
pub use signals::SignalForwarder;
pub use supervisor::{Process, Shutdown, Supervisor, SupervisorError, Worker, WorkerId};
