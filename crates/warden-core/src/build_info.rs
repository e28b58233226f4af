//! Build-time metadata embedded by the build script.
//!
//! Provides the semantic version, the control-plane API version, and the
//! git commit hash for the `version` call, logging, and diagnostics.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("WARDEN_GIT_HASH");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("WARDEN_BUILD_PROFILE");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the control-plane API. Bumped whenever a route or frame shape
/// changes incompatibly.
pub const API_VERSION: u32 = 1;

/// Return a formatted version string including git hash and profile.
///
/// Example: `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_carries_every_part() {
        let v = version_string();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(GIT_HASH));
        assert!(v.ends_with(&format!("{BUILD_PROFILE})")));
    }

    #[test]
    fn test_api_version_is_set() {
        assert_eq!(API_VERSION, 1);
        assert!(!GIT_HASH.is_empty());
    }
}
