//! Local process identity.
//!
//! The daemon changes host-wide network state and therefore only runs with
//! elevated privilege. [`LocalIdentity::detect`] reads the effective uid of
//! the current process so startup can refuse to continue otherwise.

use nix::unistd::{Uid, User};

/// The OS identity the current process runs as.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// OS username (e.g. "alice", "root").
    pub username: String,
    /// Effective user ID.
    pub uid: u32,
    /// Whether this identity has elevated privileges (effective uid 0).
    pub is_privileged: bool,
}

impl LocalIdentity {
    /// Detect the identity of the current process.
    pub fn detect() -> Self {
        let euid = nix::unistd::geteuid();
        let username = User::from_uid(euid)
            .ok()
            .flatten()
            .map(|user| user.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| format!("uid:{euid}"));
        Self::from_parts(username, euid.as_raw())
    }

    /// Construct a `LocalIdentity` from explicit values.
    pub fn from_parts(username: impl Into<String>, uid: u32) -> Self {
        Self {
            username: username.into(),
            uid,
            is_privileged: Uid::from_raw(uid).is_root(),
        }
    }
}
