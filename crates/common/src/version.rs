use std::fmt;

use serde::Serialize;

/// Build metadata baked in at compile time
///
/// Binaries export `REPO_VERSION`, `BUILD_PROFILE`, `BUILD_FEATURES` and
/// `BUILD_TIMESTAMP` from their build script; anything missing falls back to
/// the package version or "unknown".
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub build_profile: String,
    pub build_features: String,
    pub build_timestamp: String,
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, features: {}, built {})",
            self.version, self.build_profile, self.build_features, self.build_timestamp
        )
    }
}

/// Collect [`BuildInfo`] for the crate the macro is expanded in
#[macro_export]
macro_rules! build_info {
    () => {
        $crate::version::BuildInfo {
            version: option_env!("REPO_VERSION")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_string(),
            build_profile: option_env!("BUILD_PROFILE")
                .unwrap_or("unknown")
                .to_string(),
            build_features: option_env!("BUILD_FEATURES")
                .unwrap_or("none")
                .to_string(),
            build_timestamp: option_env!("BUILD_TIMESTAMP")
                .unwrap_or("unknown")
                .to_string(),
        }
    };
}

/// Build info of this library
pub fn build_info() -> BuildInfo {
    build_info!()
}
