//! Daemon IPC: HTTP over a Unix domain socket.
//!
//! The daemon exposes a small HTTP/1.1 API on a world-connectable Unix
//! socket. Unary calls carry JSON bodies; `logger` streams newline-separated
//! text up to the daemon, and `run-command` streams newline-delimited JSON
//! frames in both directions on a single exchange.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐        Unix socket         ┌──────────────┐
//! │ warden CLI   │───────────────────────────▶│  IPC Server  │
//! │ (IpcClient)  │  HTTP/1.1 + JSON / NDJSON  │  (axum)      │
//! └──────┬───────┘                            └──────┬───────┘
//!        │ CommandStream                             │ CommandPeer
//! ┌──────▼───────┐                            ┌──────▼───────┐
//! │   Session    │                            │   Executor   │
//! └──────────────┘                            └──────────────┘
//! ```

pub mod client;
pub mod frame;
pub mod server;
pub mod stream;
pub mod types;

use std::os::unix::fs::FileTypeExt;
use std::path::Path;

pub use client::{IpcClient, IpcClientError};
pub use server::IpcState;
pub use stream::{CommandPeer, CommandStream, StreamError, duplex};
pub use types::*;

/// Whether a Unix socket file currently exists at `path`.
///
/// A missing or unreadable path counts as "no socket".
pub fn socket_exists(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}
