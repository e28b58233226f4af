//! Scriptable network override for tests.
//!
//! A [`FakeInstaller`] hands out [`FakeOverride`]s that share one
//! [`FakeNetwork`] control block, so a test can flip health, inject install
//! or release failures, and count calls while the daemon owns the override.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use warden_core::BoxFuture;
use warden_core::network::{NetworkOverride, OverrideError, OverrideInstaller};

/// Shared controls and counters for fake overrides.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    unhealthy: AtomicBool,
    fail_install: AtomicBool,
    fail_release: AtomicBool,
    installs: AtomicUsize,
    releases: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every live override report itself broken (or healthy again).
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn fail_install(&self, fail: bool) {
        self.fail_install.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Successful installs so far.
    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// Release attempts so far, failed ones included.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Installer producing [`FakeOverride`]s.
pub struct FakeInstaller {
    network: Arc<FakeNetwork>,
}

impl FakeInstaller {
    pub fn new(network: Arc<FakeNetwork>) -> Arc<Self> {
        Arc::new(Self { network })
    }
}

impl OverrideInstaller for FakeInstaller {
    fn name(&self) -> &str {
        "fake"
    }

    fn install(&self) -> BoxFuture<'_, Result<Box<dyn NetworkOverride>, OverrideError>> {
        Box::pin(async move {
            if self.network.fail_install.load(Ordering::SeqCst) {
                return Err(OverrideError::Install("injected install failure".into()));
            }
            self.network.installs.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeOverride {
                network: self.network.clone(),
            }) as Box<dyn NetworkOverride>)
        })
    }
}

/// An override whose behaviour is driven by its [`FakeNetwork`].
pub struct FakeOverride {
    network: Arc<FakeNetwork>,
}

impl NetworkOverride for FakeOverride {
    fn is_okay(&self) -> bool {
        !self.network.unhealthy.load(Ordering::SeqCst)
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), OverrideError>> {
        Box::pin(async move {
            self.network.releases.fetch_add(1, Ordering::SeqCst);
            if self.network.fail_release.load(Ordering::SeqCst) {
                return Err(OverrideError::Release("injected release failure".into()));
            }
            Ok(())
        })
    }
}
