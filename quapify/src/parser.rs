// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Streaming QDIMACS parser. Events are pushed into a [`DimacsSink`] so the
//! formula is never materialized; quapify runs two passes over the input,
//! one to size the solver and one to feed it.

use anyhow::{bail, Context, Result};
use pest::Parser;

#[derive(pest_derive::Parser)]
#[grammar = "../pest/qdimacs.pest"]
struct QdimacsParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Tolerate a missing final clause terminator and undeclared variables.
    Relaxed,
    Normal,
    /// Additionally enforce the declared variable and clause counts.
    Pedantic,
}

/// Receives the parsed formula as a stream of events. `quantifier` and
/// `literal` follow the DIMACS convention of `0` as the block and clause
/// terminator.
pub trait DimacsSink {
    fn problem_line(&mut self, vars: i32, clauses: i32) -> Result<()>;
    fn quantifier(&mut self, lit: i32) -> Result<()>;
    fn literal(&mut self, lit: i32) -> Result<()>;
}

pub fn parse_qdimacs(
    input: &str,
    strictness: Strictness,
    sink: &mut impl DimacsSink,
) -> Result<()> {
    let mut pairs =
        QdimacsParser::parse(Rule::file, input).context("input is not valid (Q)DIMACS")?;
    let file = pairs
        .next()
        .context("input is not valid (Q)DIMACS: empty parse")?;

    let mut declared_vars: i32 = 0;
    let mut declared_clauses: i32 = 0;
    let mut seen_clauses: i32 = 0;
    let mut max_var: i32 = 0;

    for item in file.into_inner() {
        match item.as_rule() {
            Rule::problem => {
                let mut counts = item.into_inner();
                declared_vars = parse_count(counts.next().map(|p| p.as_str()))?;
                declared_clauses = parse_count(counts.next().map(|p| p.as_str()))?;
                sink.problem_line(declared_vars, declared_clauses)?;
            }
            Rule::exists | Rule::forall => {
                let universal = item.as_rule() == Rule::forall;
                for entry in item.into_inner() {
                    match entry.as_rule() {
                        Rule::nonzero => {
                            let var: i32 = entry
                                .as_str()
                                .parse()
                                .with_context(|| format!("bad variable \"{}\"", entry.as_str()))?;
                            if var < 0 {
                                bail!("negative variable {var} in a quantifier block");
                            }
                            max_var = max_var.max(var);
                            sink.quantifier(if universal { -var } else { var })?;
                        }
                        Rule::zero => sink.quantifier(0)?,
                        _ => {}
                    }
                }
            }
            Rule::clause => {
                let mut terminated = false;
                for entry in item.into_inner() {
                    match entry.as_rule() {
                        Rule::nonzero => {
                            let lit: i32 = entry
                                .as_str()
                                .parse()
                                .with_context(|| format!("bad literal \"{}\"", entry.as_str()))?;
                            max_var = max_var.max(lit.abs());
                            if strictness == Strictness::Pedantic && lit.abs() > declared_vars {
                                bail!(
                                    "literal {lit} exceeds the declared variable count \
                                     {declared_vars}"
                                );
                            }
                            sink.literal(lit)?;
                        }
                        Rule::zero => {
                            terminated = true;
                            sink.literal(0)?;
                        }
                        _ => {}
                    }
                }
                if !terminated {
                    if strictness == Strictness::Relaxed {
                        sink.literal(0)?;
                    } else {
                        bail!("clause {} is missing its terminating zero", seen_clauses + 1);
                    }
                }
                seen_clauses += 1;
                if strictness == Strictness::Pedantic && seen_clauses > declared_clauses {
                    bail!("more clauses than the declared count of {declared_clauses}");
                }
            }
            Rule::EOI => {}
            _ => {}
        }
    }

    if strictness == Strictness::Pedantic {
        if seen_clauses != declared_clauses {
            bail!("expected {declared_clauses} clauses, found {seen_clauses}");
        }
        if max_var > declared_vars {
            bail!("variable {max_var} exceeds the declared count of {declared_vars}");
        }
    }

    Ok(())
}

fn parse_count(text: Option<&str>) -> Result<i32> {
    text.context("missing count in the problem line")?
        .parse()
        .context("count in the problem line does not fit an i32")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        problem: Option<(i32, i32)>,
        quantifiers: Vec<i32>,
        literals: Vec<i32>,
    }

    impl DimacsSink for RecordingSink {
        fn problem_line(&mut self, vars: i32, clauses: i32) -> Result<()> {
            self.problem = Some((vars, clauses));
            Ok(())
        }

        fn quantifier(&mut self, lit: i32) -> Result<()> {
            self.quantifiers.push(lit);
            Ok(())
        }

        fn literal(&mut self, lit: i32) -> Result<()> {
            self.literals.push(lit);
            Ok(())
        }
    }

    #[test]
    fn parses_a_plain_cnf() {
        let mut sink = RecordingSink::default();
        parse_qdimacs(
            "c a comment\np cnf 3 2\n1 -3 0\n2 3 0\n",
            Strictness::Normal,
            &mut sink,
        )
        .unwrap();
        assert_eq!(sink.problem, Some((3, 2)));
        assert!(sink.quantifiers.is_empty());
        assert_eq!(sink.literals, vec![1, -3, 0, 2, 3, 0]);
    }

    #[test]
    fn parses_quantifier_blocks() {
        let mut sink = RecordingSink::default();
        parse_qdimacs(
            "p cnf 3 1\ne 1 2 0\na 3 0\n1 2 3 0\n",
            Strictness::Normal,
            &mut sink,
        )
        .unwrap();
        assert_eq!(sink.quantifiers, vec![1, 2, 0, -3, 0]);
        assert_eq!(sink.literals, vec![1, 2, 3, 0]);
    }

    #[test]
    fn clauses_may_span_lines() {
        let mut sink = RecordingSink::default();
        parse_qdimacs("p cnf 2 1\n1\n2\n0\n", Strictness::Normal, &mut sink).unwrap();
        assert_eq!(sink.literals, vec![1, 2, 0]);
    }

    #[test]
    fn relaxed_tolerates_a_missing_final_zero() {
        let mut sink = RecordingSink::default();
        parse_qdimacs("p cnf 2 1\n1 2\n", Strictness::Relaxed, &mut sink).unwrap();
        assert_eq!(sink.literals, vec![1, 2, 0]);

        let mut sink = RecordingSink::default();
        assert!(parse_qdimacs("p cnf 2 1\n1 2\n", Strictness::Normal, &mut sink).is_err());
    }

    #[test]
    fn pedantic_enforces_declared_counts() {
        let mut sink = RecordingSink::default();
        assert!(parse_qdimacs("p cnf 2 2\n1 2 0\n", Strictness::Pedantic, &mut sink).is_err());

        let mut sink = RecordingSink::default();
        assert!(parse_qdimacs("p cnf 1 1\n1 2 0\n", Strictness::Pedantic, &mut sink).is_err());

        let mut sink = RecordingSink::default();
        parse_qdimacs("p cnf 2 1\n1 -2 0\n", Strictness::Pedantic, &mut sink).unwrap();
    }

    #[test]
    fn rejects_negative_quantified_variables() {
        let mut sink = RecordingSink::default();
        assert!(parse_qdimacs("p cnf 1 1\ne -1 0\n1 0\n", Strictness::Normal, &mut sink).is_err());
    }

    #[test]
    fn empty_clause_is_valid() {
        let mut sink = RecordingSink::default();
        parse_qdimacs("p cnf 1 1\n0\n", Strictness::Normal, &mut sink).unwrap();
        assert_eq!(sink.literals, vec![0]);
    }
}
