//! Exit codes of the `packwarden` binary
//!
//! These follow sysexits.h where applicable.

/// General error
pub const ERROR: i32 = 1;

/// Invalid arguments or options
pub const USAGE_ERROR: i32 = 64;

/// The debug socket or the cluster could not be reached
pub const UNAVAILABLE: i32 = 69;

/// Invalid configuration
pub const CONFIG_ERROR: i32 = 78;
