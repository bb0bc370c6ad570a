// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Locates the preload shared object that is injected into the solver.

use log::{debug, trace};
use quapi_common::{env, Error, Result};
use std::path::{Path, PathBuf};

const PRELOAD_LIB: &str = "libquapi_preload.so";

/// Fallback locations probed after the explicit override, the environment
/// and the executable's own directory.
const CANDIDATE_PATHS: &[&str] = &[
    "./libquapi_preload.so",
    "../libquapi_preload.so",
    "../quapi/build/libquapi_preload.so",
    "./quapi/libquapi_preload.so",
    "./third_party/quapi/libquapi_preload.so",
    "/usr/local/lib/libquapi_preload.so",
    "/usr/lib/libquapi_preload.so",
];

pub(crate) fn find_preload_object(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Parameter(format!(
            "configured preload object {} does not exist",
            path.display()
        )));
    }

    if let Some(path) = env::preload_path_override() {
        if path.is_file() {
            return Ok(path);
        }
        debug!(
            "{} from {} does not exist, continuing lookup",
            path.display(),
            env::ENV_PRELOAD_PATH
        );
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(PRELOAD_LIB);
            trace!("probing {}", candidate.display());
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    for candidate in CANDIDATE_PATHS {
        if Path::new(candidate).is_file() {
            return Ok(PathBuf::from(candidate));
        }
    }

    Err(Error::other(format!(
        "cannot locate {PRELOAD_LIB}; set {} to its path",
        env::ENV_PRELOAD_PATH
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_must_exist() {
        assert!(find_preload_object(Some(Path::new("/nonexistent/libfoo.so"))).is_err());
    }

    #[test]
    fn explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PRELOAD_LIB);
        std::fs::write(&path, b"").unwrap();
        let found = find_preload_object(Some(&path)).unwrap();
        assert_eq!(found, path);
    }
}
