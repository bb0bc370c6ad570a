// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! End-to-end runs against a real SAT solver. The tests are skipped
//! gracefully when CaDiCaL is not installed.

#![cfg(target_os = "linux")]

use bin_tests::preload_artifact;
use quapi::{Solver, SolverConfig};
use std::path::Path;

const CADICAL: &str = "/usr/local/bin/cadical";

fn cadical_or_skip() -> bool {
    if Path::new(CADICAL).is_file() {
        return true;
    }
    eprintln!("CaDiCaL not found in {CADICAL}, skipping");
    false
}

fn add_example_formula(solver: &mut Solver) {
    for clause in [[1, 2], [2, 3], [1, 3], [2, -3]] {
        for lit in clause {
            solver.add(lit).unwrap();
        }
        solver.add(0).unwrap();
    }
}

#[test]
fn cadical_with_regexes() {
    if !cadical_or_skip() {
        return;
    }
    let config = SolverConfig::new(CADICAL, 4, 4, 1)
        .args(["--quiet"])
        .regexes("s SATISFIABLE", "s UNSATISFIABLE")
        .preload_path(preload_artifact());
    let mut solver = Solver::init(config).unwrap();

    add_example_formula(&mut solver);

    solver.assume(2).unwrap();
    assert_eq!(solver.solve(), 10);

    solver.assume(1).unwrap();
    assert_eq!(solver.solve(), 10);
}

#[test]
fn cadical_exit_code_mode() {
    if !cadical_or_skip() {
        return;
    }
    let config = SolverConfig::new(CADICAL, 4, 4, 1)
        .args(["--quiet"])
        .preload_path(preload_artifact());
    let mut solver = Solver::init(config).unwrap();

    add_example_formula(&mut solver);

    solver.assume(2).unwrap();
    assert_eq!(solver.solve(), 10);

    solver.assume(1).unwrap();
    assert_eq!(solver.solve(), 10);
}

#[test]
fn cadical_without_assumptions() {
    if !cadical_or_skip() {
        return;
    }
    let config = SolverConfig::new(CADICAL, 4, 4, 1)
        .args(["--quiet"])
        .preload_path(preload_artifact());
    let mut solver = Solver::init(config).unwrap();

    add_example_formula(&mut solver);

    assert_eq!(solver.solve(), 10);
}
