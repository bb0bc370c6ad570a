// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Incremental solving under assumptions on top of external SAT and QBF
//! solvers that were not written to accept assumptions incrementally.
//!
//! The driver launches the solver as a child process with a shared object
//! preloaded into it that intercepts the solver's input reading. Formula
//! and assumptions are streamed to that runtime as typed messages; the
//! solver child is forked once the formula body is complete, so every new
//! assumption set is evaluated without re-parsing the formula.
//!
//! ```no_run
//! use quapi::{Solver, SolverConfig};
//!
//! let config = SolverConfig::new("/usr/local/bin/cadical", 3, 2, 1)
//!     .args(["--quiet"])
//!     .regexes("s SATISFIABLE", "s UNSATISFIABLE");
//! let mut solver = Solver::init(config).unwrap();
//! solver.add(1).unwrap();
//! solver.add(2).unwrap();
//! solver.add(0).unwrap();
//! solver.assume(-1).unwrap();
//! assert_eq!(solver.solve(), 10);
//! ```

#![cfg(unix)]

mod handles;
mod preload;
mod solve_loop;
mod solver;

pub use quapi_common::{Error, Result, SolverState, API_VERSION};
pub use solver::{Solver, SolverConfig, StdoutCallback, Terminator};

/// Name and version of the incremental solving library.
pub fn signature() -> &'static str {
    concat!("QuAPI ", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    #[test]
    fn signature_names_the_library() {
        assert!(super::signature().starts_with("QuAPI"));
    }
}
