// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! quapify — apply assumptions to (non-assuming) SAT or QBF solvers.
//!
//! Parses the input formula twice: the first pass only sizes the solver
//! (variable and clause counts), the second streams the formula into the
//! driver, so the formula is never held in memory. Every assumption group
//! is then solved in its own forked solver child and reported as one line
//! of `SOLVERSTATUS SOLVETIME ASSUMPTION`.

mod parser;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use parser::{parse_qdimacs, DimacsSink, Strictness};
use quapi::{Solver, SolverConfig};
use std::io::Read;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "quapify",
    about = "Apply assumptions to (non-assuming) SAT or QBF solvers",
    after_help = "OUTPUT FORMAT:\n  Space separated fields: SOLVERSTATUS SOLVETIME[s] ASSUMPTION\n\n\
EXAMPLES:\n  quapify input.cnf -a 1 -a -1 -- ./solver --cnf\n  \
quapify input.cnf -a 1 0 -1 0 -- ./solver --cnf"
)]
struct Cli {
    /// Input formula; `-` reads from stdin.
    input: String,

    /// Add an explicit assumption to be computed (literals, groups split on
    /// 0; repeatable).
    #[arg(
        short = 'a',
        value_name = "LIT",
        num_args = 1..,
        allow_negative_numbers = true,
        action = ArgAction::Append,
        required = true
    )]
    assume: Vec<Vec<i32>>,

    /// Print the whole assumption, not just its index.
    #[arg(short = 'p')]
    print_assumptions: bool,

    /// Verbose output.
    #[arg(short = 'v')]
    verbose: bool,

    /// Set parsing to relaxed (default is normal).
    #[arg(short = 'r', conflicts_with = "pedantic")]
    relaxed: bool,

    /// Set parsing to strict/pedantic (default is normal).
    #[arg(short = 's')]
    pedantic: bool,

    /// Solver executable and its arguments.
    #[arg(last = true, required = true, value_name = "SOLVER")]
    solver: Vec<String>,
}

/// First pass: determine the variable and clause counts of the matrix.
#[derive(Default)]
struct CountingSink {
    varcount: i32,
    clausecount: i32,
}

impl DimacsSink for CountingSink {
    fn problem_line(&mut self, _vars: i32, _clauses: i32) -> Result<()> {
        Ok(())
    }

    fn quantifier(&mut self, _lit: i32) -> Result<()> {
        Ok(())
    }

    fn literal(&mut self, lit: i32) -> Result<()> {
        if lit == 0 {
            self.clausecount += 1;
        } else {
            self.varcount = self.varcount.max(lit.abs());
        }
        Ok(())
    }
}

/// Second pass: stream the formula into the driver.
struct DriverSink<'s> {
    solver: &'s mut Solver,
}

impl DimacsSink for DriverSink<'_> {
    fn problem_line(&mut self, _vars: i32, _clauses: i32) -> Result<()> {
        Ok(())
    }

    fn quantifier(&mut self, lit: i32) -> Result<()> {
        self.solver.quantify(lit)?;
        Ok(())
    }

    fn literal(&mut self, lit: i32) -> Result<()> {
        self.solver.add(lit)?;
        Ok(())
    }
}

/// Splits the raw `-a` groups on their `0` separators; a group without a
/// trailing zero is closed implicitly.
fn collect_assumptions(raw: &[Vec<i32>]) -> Result<Vec<Vec<i32>>> {
    let mut assumptions = Vec::new();
    for group in raw {
        let mut current = Vec::new();
        for &lit in group {
            if lit == 0 {
                assumptions.push(std::mem::take(&mut current));
            } else {
                current.push(lit);
            }
        }
        if !current.is_empty() {
            assumptions.push(current);
        }
    }
    if assumptions.is_empty() {
        bail!("need to supply at least one assumption with `-a`");
    }
    Ok(assumptions)
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("could not read the formula from stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("could not read the formula from \"{input}\""))
    }
}

fn format_assumption(assumption: &[i32]) -> String {
    assumption
        .iter()
        .map(|lit| lit.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    quapi_common::log::init();

    let strictness = if cli.relaxed {
        Strictness::Relaxed
    } else if cli.pedantic {
        Strictness::Pedantic
    } else {
        Strictness::Normal
    };

    let assumptions = collect_assumptions(&cli.assume)?;
    let max_assumption_len = assumptions.iter().map(Vec::len).max().unwrap_or(0);

    let text = read_input(&cli.input)?;

    // First pass sizes the solver and validates the input before a child is
    // ever spawned.
    let mut counts = CountingSink::default();
    parse_qdimacs(&text, strictness, &mut counts)?;

    if cli.verbose {
        eprintln!("[QUAPIFY] Assumptions:");
        for assumption in &assumptions {
            eprintln!("[QUAPIFY]   {}", format_assumption(assumption));
        }
        eprintln!("[QUAPIFY] Max Assumption Length: {max_assumption_len}");
        eprintln!(
            "[QUAPIFY] Input: \"{}\" ({} variables, {} clauses)",
            cli.input, counts.varcount, counts.clausecount
        );
        eprintln!("[QUAPIFY] Solver: \"{}\"", cli.solver[0]);
    }

    let config = SolverConfig::new(
        &cli.solver[0],
        counts.varcount,
        counts.clausecount,
        max_assumption_len as i32,
    )
    .args(cli.solver.iter().cloned());
    let mut solver = Solver::init(config).context("could not initialize the solver")?;

    let mut driver = DriverSink {
        solver: &mut solver,
    };
    parse_qdimacs(&text, strictness, &mut driver)?;

    for (index, assumption) in assumptions.iter().enumerate() {
        for &lit in assumption {
            solver
                .assume(lit)
                .with_context(|| format!("could not assume literal {lit}"))?;
        }

        let before = Instant::now();
        let result = solver.solve();
        let elapsed = before.elapsed().as_secs_f64();

        if cli.print_assumptions {
            println!("{result} {elapsed:.6} {}", format_assumption(assumption));
        } else {
            println!("{result} {elapsed:.6} {index}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assumption_groups_split_on_zero() {
        let groups = collect_assumptions(&[vec![1, 0, -1, 0]]).unwrap();
        assert_eq!(groups, vec![vec![1], vec![-1]]);
    }

    #[test]
    fn open_group_is_closed_implicitly() {
        let groups = collect_assumptions(&[vec![1, 2], vec![-3]]).unwrap();
        assert_eq!(groups, vec![vec![1, 2], vec![-3]]);
    }

    #[test]
    fn empty_assumptions_are_rejected() {
        assert!(collect_assumptions(&[]).is_err());
    }

    #[test]
    fn counting_sink_sizes_the_matrix() {
        let mut counts = CountingSink::default();
        parse_qdimacs(
            "p cnf 4 2\ne 1 2 0\n1 -4 0\n2 3 0\n",
            Strictness::Normal,
            &mut counts,
        )
        .unwrap();
        assert_eq!(counts.varcount, 4);
        assert_eq!(counts.clausecount, 2);
    }

    #[test]
    fn cli_parses_the_original_shapes() {
        let cli = Cli::try_parse_from([
            "quapify", "input.cnf", "-a", "1", "0", "-1", "0", "--", "./solver", "--cnf",
        ])
        .unwrap();
        assert_eq!(collect_assumptions(&cli.assume).unwrap(), vec![vec![1], vec![-1]]);
        assert_eq!(cli.solver, vec!["./solver", "--cnf"]);

        let cli = Cli::try_parse_from([
            "quapify", "input.cnf", "-a", "1", "-a", "-1", "--", "solver",
        ])
        .unwrap();
        assert_eq!(collect_assumptions(&cli.assume).unwrap(), vec![vec![1], vec![-1]]);
    }
}
