//! No-op (development) network override.
//!
//! Installs nothing. The configured DNS servers are logged so the daemon can
//! be exercised end to end on machines where touching the resolver is not
//! wanted. **Never use in production.**

use warden_config::NetworkConfig;

use crate::BoxFuture;

use super::{NetworkOverride, OverrideError, OverrideInstaller};

/// Installer producing [`NoopOverride`]s.
pub struct NoopInstaller {
    dns: String,
    fallback: String,
}

impl NoopInstaller {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            dns: config.dns.clone(),
            fallback: config.fallback.clone(),
        }
    }
}

impl OverrideInstaller for NoopInstaller {
    fn name(&self) -> &str {
        "noop"
    }

    fn install(&self) -> BoxFuture<'_, Result<Box<dyn NetworkOverride>, OverrideError>> {
        Box::pin(async move {
            tracing::warn!(
                installer = "noop",
                dns = %self.dns,
                fallback = %self.fallback,
                "Network override NOT installed (development mode)"
            );
            Ok(Box::new(NoopOverride) as Box<dyn NetworkOverride>)
        })
    }
}

/// An override that is always healthy and releases instantly.
pub struct NoopOverride;

impl NetworkOverride for NoopOverride {
    fn is_okay(&self) -> bool {
        true
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), OverrideError>> {
        Box::pin(async { Ok(()) })
    }
}
