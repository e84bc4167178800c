//! Version string embedded by the build script

/// e.g. `0.1.0 (1a2b3c4d, built 2026-10-19)`; also what `--version` shows
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("XCP_COMMIT"),
    ", built ",
    env!("XCP_BUILD_DATE"),
    ")"
);

pub const TARGET: &str = env!("XCP_TARGET");
pub const PROFILE: &str = env!("XCP_PROFILE");

/// What `xcp version` prints
pub fn report() -> String {
    format!("xcp {}\ntarget: {} ({})\n", VERSION, TARGET, PROFILE)
}
