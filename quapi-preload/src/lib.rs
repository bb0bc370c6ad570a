// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! The preloaded runtime ("shim").
//!
//! Injected into the solver process via `LD_PRELOAD`, this library replaces
//! the solver's input-reading entry points and feeds it a synthesized
//! (Q)DIMACS stream built from typed messages the driver sends over the
//! solver's stdin pipe. On a FORK message the process forks; the parent
//! keeps seeding further forks while the child completes the formula with
//! one assumption set and runs the actual solver algorithm.

#![cfg(unix)]
// The interception layer and the load hooks only exist in the cdylib; unit
// tests drive the runtime directly and would otherwise see them as unused.
#![cfg_attr(test, allow(dead_code))]

#[cfg(not(test))]
mod entry;
#[cfg(not(test))]
mod intercept;
mod runtime;
mod syms;
mod timing;
