// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Abstraction over compilation with cargo for testing full binaries and
//! dynamic libraries instead of just rust static libraries.
//!
//! The end-to-end tests need the real `libquapi_preload.so` next to a real
//! driver process; [`preload_artifact`] builds the cdylib through cargo and
//! returns its path. Builds are cached between invocations so multiple
//! tests can share the artifact without doing expensive work twice.
//!
//! It is assumed that functions in this crate are invoked in the context of
//! a cargo `#[test]` item, to be able to locate artifacts built by cargo
//! from the position of the current binary.

use std::{collections::HashMap, env, ops::DerefMut, path::PathBuf, process, sync::Mutex};

use anyhow::Ok;
use once_cell::sync::OnceCell;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ArtifactType {
    Bin,
    CDylib,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum BuildProfile {
    Debug,
    Release,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct ArtifactsBuild {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub build_profile: BuildProfile,
    pub triple_target: Option<String>,
}

/// The preload runtime artifact used by every end-to-end test.
pub fn preload_artifact() -> PathBuf {
    let build = ArtifactsBuild {
        name: "quapi-preload".to_owned(),
        artifact_type: ArtifactType::CDylib,
        build_profile: BuildProfile::Debug,
        triple_target: None,
    };
    #[allow(clippy::expect_used)]
    build_artifacts(&[&build])
        .expect("building libquapi_preload.so failed")
        .remove(&build)
        .expect("artifact path missing after build")
}

fn inner_build_artifact(c: &ArtifactsBuild) -> anyhow::Result<PathBuf> {
    let mut build_cmd = process::Command::new(env!("CARGO"));
    build_cmd.arg("build");
    if let BuildProfile::Release = c.build_profile {
        build_cmd.arg("--release");
    }
    match c.artifact_type {
        ArtifactType::CDylib => build_cmd.arg("-p"),
        ArtifactType::Bin => build_cmd.arg("--bin"),
    };
    build_cmd.arg(&c.name);

    let output = build_cmd.output()?;
    if !output.status.success() {
        anyhow::bail!(
            "Cargo build failed: status code {:?}\nstderr:\n {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// This static variable contains the path in which cargo puts its build
    /// artifacts. It relies on the assumption that the current binary has
    /// not been moved out of its directory.
    static ARTIFACT_DIR: OnceCell<PathBuf> = OnceCell::new();
    let artifact_dir = ARTIFACT_DIR.get_or_init(|| {
        let test_bin_location = PathBuf::from(env::args().next().unwrap_or_default());
        let mut location_components = test_bin_location.components().rev().peekable();
        loop {
            let Some(c) = location_components.peek() else {
                break;
            };
            if c.as_os_str() == "target" {
                break;
            }
            location_components.next();
        }
        location_components.rev().collect::<PathBuf>()
    });

    let mut artifact_path = artifact_dir.clone();
    artifact_path.push(match c.build_profile {
        BuildProfile::Debug => "debug",
        BuildProfile::Release => "release",
    });

    match c.artifact_type {
        ArtifactType::Bin => artifact_path.push(&c.name),
        ArtifactType::CDylib => {
            let name = "lib".to_owned()
                + &c.name.replace('-', "_")
                + "."
                + shared_lib_extension(
                    c.triple_target
                        .as_deref()
                        .unwrap_or(current_platform::CURRENT_PLATFORM),
                )?;
            artifact_path.push(name);
        }
    };
    Ok(artifact_path)
}

/// Caches and returns the paths of the artifacts built by cargo.
/// This function should only be called from cargo tests.
pub fn build_artifacts<'b>(
    crates: &[&'b ArtifactsBuild],
) -> anyhow::Result<HashMap<&'b ArtifactsBuild, PathBuf>> {
    static ARTIFACTS: OnceCell<Mutex<HashMap<ArtifactsBuild, PathBuf>>> = OnceCell::new();

    let mut res = HashMap::new();

    let artifacts = ARTIFACTS.get_or_init(|| Mutex::new(HashMap::new()));
    for &c in crates {
        let mut artifacts = artifacts.lock().unwrap_or_else(|e| e.into_inner());
        let artifacts = artifacts.deref_mut();

        if let Some(path) = artifacts.get(c) {
            res.insert(c, path.clone());
        } else {
            let p = inner_build_artifact(c)?;
            res.insert(c, p.clone());
            artifacts.insert(c.clone(), p);
        }
    }

    Ok(res)
}

fn shared_lib_extension(triple_target: &str) -> anyhow::Result<&'static str> {
    let (_arch, rest) = triple_target
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("malformed triple target {}", triple_target))?;
    Ok(if rest.contains("linux") {
        "so"
    } else if rest.starts_with("pc-windows") {
        "dll"
    } else if rest.starts_with("apple-darwin") {
        "dylib"
    } else {
        return Err(anyhow::anyhow!(
            "unrecognized triple-target {}",
            triple_target
        ));
    })
}
