#![deny(unsafe_code)]

//! Shared test utilities for the warden workspace.
//!
//! Provides reusable fixtures, config builders, fake network overrides, and
//! tracing helpers so that integration tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! warden-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod log_capture;
pub mod network;
pub mod tracing_setup;
