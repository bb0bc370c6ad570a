// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Environment switches understood by both the driver and the preloaded
//! runtime. Lookups are cached; the switches are read once per process.

use std::path::PathBuf;
use std::sync::OnceLock;

pub const ENV_DEBUG: &str = "QUAPI_DEBUG";
pub const ENV_TRACE: &str = "QUAPI_TRACE";
pub const ENV_TIMING: &str = "QUAPI_TIMING";
pub const ENV_PRELOAD_PATH: &str = "QUAPI_PRELOAD_PATH";
pub const ENV_ALLOW_MISSING_UNIVERSAL_ASSUMPTIONS: &str =
    "QUAPI_ALLOW_MISSING_UNIVERSAL_ASSUMPTIONS";

fn flag(cell: &'static OnceLock<bool>, name: &str) -> bool {
    *cell.get_or_init(|| std::env::var_os(name).is_some())
}

/// `QUAPI_DEBUG` enables debug logging on stderr.
pub fn debug_enabled() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    flag(&CELL, ENV_DEBUG)
}

/// `QUAPI_TRACE` enables trace logging on stderr.
pub fn trace_enabled() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    flag(&CELL, ENV_TRACE)
}

/// `QUAPI_TIMING` enables ns-resolution checkpoints printed from the
/// preloaded runtime.
pub fn timing_enabled() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    flag(&CELL, ENV_TIMING)
}

/// `QUAPI_ALLOW_MISSING_UNIVERSAL_ASSUMPTIONS` relaxes the check that every
/// leading universal quantifier is bound by an assumption before solving.
pub fn allow_missing_universal_assumptions() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    flag(&CELL, ENV_ALLOW_MISSING_UNIVERSAL_ASSUMPTIONS)
}

/// `QUAPI_PRELOAD_PATH` overrides the lookup of the preload shared object.
pub fn preload_path_override() -> Option<PathBuf> {
    std::env::var_os(ENV_PRELOAD_PATH).map(PathBuf::from)
}
