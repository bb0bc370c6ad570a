// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! End-to-end checks of the synthesized (Q)DIMACS stream: `bash` plays the
//! solver and copies everything it reads from stdin into a file, which is
//! then compared against the expected formula text.

#![cfg(target_os = "linux")]

use bin_tests::preload_artifact;
use quapi::{Result, Solver, SolverConfig};
use std::fs;
use std::path::Path;

struct Scenario {
    literals: i32,
    clauses: i32,
    prefixdepth: i32,
    feed: fn(&mut Solver) -> Result<()>,
    expected: String,
}

fn recording_config(scenario: &Scenario, outfile: &Path) -> SolverConfig {
    let script = format!(
        "while read line; do echo \"$line\" >> {}; done < \"${{1:-/dev/stdin}}\"",
        outfile.display()
    );
    SolverConfig::new(
        "bash",
        scenario.literals,
        scenario.clauses,
        scenario.prefixdepth,
    )
    .args(["-c".to_string(), script])
    .preload_path(preload_artifact())
}

fn run(scenario: Scenario) {
    let dir = tempfile::tempdir().unwrap();
    let outfile = dir.path().join("seen_by_solver.txt");

    let mut solver = Solver::init(recording_config(&scenario, &outfile)).unwrap();
    (scenario.feed)(&mut solver).unwrap();

    let retcode = solver.solve();
    assert_eq!(retcode, 0, "the recording solver exits cleanly");

    let seen = fs::read_to_string(&outfile).unwrap();
    assert_eq!(seen, scenario.expected);
}

#[test]
fn universal_block_with_assumption() {
    run(Scenario {
        literals: 2,
        clauses: 1,
        prefixdepth: 1,
        feed: |s| {
            s.quantify(1)?;
            s.quantify(-2)?;

            s.add(1)?;
            s.add(2)?;
            s.add(0)?;

            s.assume(-1)
        },
        expected: "p cnf 2 2\ne 1 0\na 2 0\n1 2 0\n-1 0\n".into(),
    });
}

#[test]
fn plain_exists_prefix() {
    run(Scenario {
        literals: 3,
        clauses: 1,
        prefixdepth: 1,
        feed: |s| {
            s.quantify(1)?;
            s.quantify(2)?;

            s.add(1)?;
            s.add(2)?;
            s.add(3)?;
            s.add(0)?;

            s.assume(1)
        },
        expected: "p cnf 3 2\ne 1 2 0\n1 2 3 0\n1 0\n".into(),
    });
}

#[test]
fn universal_inside_the_assumption_window_is_promoted() {
    run(Scenario {
        literals: 2,
        clauses: 1,
        prefixdepth: 2,
        feed: |s| {
            s.quantify(1)?;
            s.quantify(-2)?;

            s.add(1)?;
            s.add(2)?;
            s.add(0)?;

            s.assume(-1)?;
            s.assume(2)
        },
        expected: "p cnf 2 3\ne 1 2 0\n1 2 0\n-1 0\n2 0\n".into(),
    });
}

#[test]
fn one_missing_assumption_is_padded() {
    run(Scenario {
        literals: 3,
        clauses: 1,
        prefixdepth: 2,
        feed: |s| {
            s.quantify(1)?;
            s.quantify(2)?;

            s.add(1)?;
            s.add(2)?;
            s.add(3)?;
            s.add(0)?;

            s.assume(1)
        },
        expected: "p cnf 3 3\ne 1 2 0\n1 2 3 0\n1 0\n1 -1 0\n".into(),
    });
}

#[test]
fn several_missing_assumptions_are_padded() {
    run(Scenario {
        literals: 3,
        clauses: 1,
        prefixdepth: 3,
        feed: |s| {
            s.quantify(1)?;
            s.quantify(2)?;

            s.add(1)?;
            s.add(2)?;
            s.add(3)?;
            s.add(0)?;

            s.assume(1)
        },
        expected: "p cnf 3 4\ne 1 2 0\n1 2 3 0\n1 0\n1 -1 0\n1 -1 0\n".into(),
    });
}

#[test]
fn zero_variable_formula() {
    run(Scenario {
        literals: 0,
        clauses: 0,
        prefixdepth: 1,
        feed: |_| Ok(()),
        expected: "p cnf 0 1\n0\n".into(),
    });
}

#[test]
fn more_than_one_hundred_alternating_blocks() {
    let mut expected = String::from("p cnf 300 2\n");
    for block in 0..3 {
        expected.push(if block % 2 == 0 { 'e' } else { 'a' });
        for var in block * 100 + 1..=block * 100 + 100 {
            expected.push_str(&format!(" {var}"));
        }
        expected.push_str(" 0\n");
    }
    expected.push_str("1 2 0\n-1 0\n");

    run(Scenario {
        literals: 300,
        clauses: 1,
        prefixdepth: 1,
        feed: |s| {
            for var in 1..=100 {
                s.quantify(var)?;
            }
            for var in 101..=200 {
                s.quantify(-var)?;
            }
            for var in 201..=300 {
                s.quantify(var)?;
            }

            s.add(1)?;
            s.add(2)?;
            s.add(0)?;

            s.assume(-1)
        },
        expected,
    });
}
