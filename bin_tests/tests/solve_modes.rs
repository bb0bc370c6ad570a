// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! End-to-end checks of the solve result arbitration: exit codes, output
//! regexes, the stdout callback and asynchronous termination, with `bash`
//! scripts standing in for solvers.

#![cfg(target_os = "linux")]

use bin_tests::preload_artifact;
use quapi::{Solver, SolverConfig, SolverState};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

/// A solver script that consumes all of stdin first; the runtime only
/// advances while the solver reads.
fn consume_stdin_then(then: &str) -> String {
    format!("while read line; do :; done; {then}")
}

fn bash_config(script: String, literals: i32, clauses: i32, prefixdepth: i32) -> SolverConfig {
    SolverConfig::new("bash", literals, clauses, prefixdepth)
        .args(["-c".to_string(), script])
        .preload_path(preload_artifact())
}

#[test]
fn exit_code_is_the_result_without_regexes() {
    let config = bash_config(consume_stdin_then("exit 42"), 1, 1, 1);
    let mut solver = Solver::init(config).unwrap();

    solver.add(1).unwrap();
    solver.add(0).unwrap();
    solver.assume(1).unwrap();

    assert_eq!(solver.solve(), 42);
    assert_eq!(solver.state(), SolverState::InputLiterals);
}

#[test]
fn sat_regex_wins_over_the_exit_code() {
    // The script exits 3 after printing; the regex result must be returned.
    let config = bash_config(
        consume_stdin_then("echo \"s SATISFIABLE\"; exit 3"),
        1,
        1,
        1,
    )
    .regexes("s SATISFIABLE", "s UNSATISFIABLE");
    let mut solver = Solver::init(config).unwrap();

    solver.add(1).unwrap();
    solver.add(0).unwrap();
    solver.assume(1).unwrap();

    assert_eq!(solver.solve(), 10);
}

#[test]
fn unsat_regex_maps_to_twenty() {
    let config = bash_config(consume_stdin_then("echo \"s UNSATISFIABLE\""), 1, 1, 1)
        .regexes("s SATISFIABLE", "s UNSATISFIABLE");
    let mut solver = Solver::init(config).unwrap();

    solver.add(1).unwrap();
    solver.add(0).unwrap();
    solver.assume(1).unwrap();

    assert_eq!(solver.solve(), 20);
}

#[test]
fn a_second_assumption_set_reuses_the_formula() {
    let config = bash_config(consume_stdin_then("echo \"s SATISFIABLE\""), 3, 4, 1)
        .regexes("s SATISFIABLE", "s UNSATISFIABLE");
    let mut solver = Solver::init(config).unwrap();

    for clause in [[1, 2], [2, 3], [1, 3], [2, -3]] {
        for lit in clause {
            solver.add(lit).unwrap();
        }
        solver.add(0).unwrap();
    }

    solver.assume(2).unwrap();
    assert_eq!(solver.solve(), 10);

    solver.assume(1).unwrap();
    assert_eq!(solver.solve(), 10);
}

#[test]
fn solve_without_assumptions_forks_as_well() {
    let config = bash_config(consume_stdin_then("echo \"s SATISFIABLE\""), 3, 1, 1)
        .regexes("s SATISFIABLE", "s UNSATISFIABLE");
    let mut solver = Solver::init(config).unwrap();

    solver.add(1).unwrap();
    solver.add(2).unwrap();
    solver.add(0).unwrap();

    assert_eq!(solver.solve(), 10);
    assert_eq!(solver.state(), SolverState::InputLiterals);
}

#[test]
fn stdout_callback_supersedes_exit_code_zero() {
    let config = bash_config(consume_stdin_then("echo test"), 1, 1, 1);
    let mut solver = Solver::init(config).unwrap();

    solver.add(1).unwrap();
    solver.add(0).unwrap();

    let seen = Arc::new(AtomicBool::new(false));
    let seen_in_cb = Arc::clone(&seen);
    solver.set_stdout_callback(move |line| {
        if line == "test" {
            seen_in_cb.store(true, SeqCst);
            1
        } else {
            0
        }
    });

    solver.assume(1).unwrap();

    assert_eq!(solver.solve(), 1);
    assert!(seen.load(SeqCst));
}

#[test]
fn assumptions_beyond_prefixdepth_are_rejected() {
    let config = bash_config(consume_stdin_then("exit 0"), 2, 1, 1);
    let mut solver = Solver::init(config).unwrap();

    solver.add(1).unwrap();
    solver.add(2).unwrap();
    solver.add(0).unwrap();

    solver.assume(1).unwrap();
    assert!(solver.assume(2).is_err());

    // The reserved slot is still intact and the solve proceeds normally.
    assert_eq!(solver.solve(), 0);
    assert_eq!(solver.state(), SolverState::InputLiterals);
}

#[test]
fn terminate_during_solve_returns_zero() {
    // The solver consumes the formula and then blocks; only the concurrent
    // terminate gets the solve back.
    let config = bash_config(
        "while read line; do :; done < \"${1:-/dev/stdin}\"; sleep 10".to_string(),
        3,
        1,
        1,
    );
    let mut solver = Solver::init(config).unwrap();

    solver.quantify(1).unwrap();
    solver.quantify(-2).unwrap();

    solver.add(1).unwrap();
    solver.add(2).unwrap();
    solver.add(0).unwrap();

    solver.assume(3).unwrap();

    let terminator = solver.terminator();
    let aborter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        terminator.terminate();
    });

    assert_eq!(solver.solve(), 0);
    assert_eq!(solver.state(), SolverState::InputLiterals);

    aborter.join().unwrap();
}

#[test]
fn reset_assumptions_behaves_like_a_fresh_solve() {
    // The script decides SAT/UNSAT from whether the assumption -1 made it
    // into its input, so a leaked stale assumption would flip the result.
    let script = "found=0; \
                  while read line; do if [ \"$line\" = \"-1 0\" ]; then found=1; fi; done; \
                  if [ \"$found\" = 1 ]; then echo \"s UNSATISFIABLE\"; \
                  else echo \"s SATISFIABLE\"; fi"
        .to_string();
    let make = || {
        let config = bash_config(script.clone(), 1, 1, 1)
            .regexes("s SATISFIABLE", "s UNSATISFIABLE");
        let mut solver = Solver::init(config).unwrap();
        solver.add(1).unwrap();
        solver.add(0).unwrap();
        solver
    };

    // Sanity: the stand-in solver reacts to the assumption.
    let mut fresh_unsat = make();
    fresh_unsat.assume(-1).unwrap();
    assert_eq!(fresh_unsat.solve(), 20);

    let mut fresh_sat = make();
    fresh_sat.assume(1).unwrap();
    assert_eq!(fresh_sat.solve(), 10);

    // Replacing -1 by 1 via reset_assumptions matches the fresh result.
    let mut reset = make();
    reset.assume(-1).unwrap();
    // Give the forked child time to consume the pending assumption before
    // it is killed.
    std::thread::sleep(Duration::from_millis(150));
    reset.reset_assumptions();
    assert_eq!(reset.state(), SolverState::InputLiterals);

    reset.assume(1).unwrap();
    assert_eq!(reset.solve(), 10);
}
