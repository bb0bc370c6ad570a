// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Optional ns-resolution checkpoints, enabled with `QUAPI_TIMING`. The
//! line is printed once the first message after the header arrives, which
//! is when the synthesized stream is known to flow.

use nix::time::{clock_gettime, ClockId};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering::Relaxed};

static CONSTRUCT: AtomicI64 = AtomicI64::new(0);
static FIRST_READ: AtomicI64 = AtomicI64::new(0);
static HEADER: AtomicI64 = AtomicI64::new(0);
static AFTER_HEADER: AtomicI64 = AtomicI64::new(0);

static FIRST_READ_SEEN: AtomicBool = AtomicBool::new(false);
static AFTER_HEADER_SEEN: AtomicBool = AtomicBool::new(false);

fn now_nanos() -> i64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() * 1_000_000_000 + ts.tv_nsec(),
        Err(e) => {
            log::error!("clock_gettime(CLOCK_MONOTONIC) failed: {e}");
            0
        }
    }
}

pub(crate) fn construct() {
    if quapi_common::env::timing_enabled() {
        CONSTRUCT.store(now_nanos(), Relaxed);
    }
}

pub(crate) fn first_read() {
    if quapi_common::env::timing_enabled() && !FIRST_READ_SEEN.swap(true, Relaxed) {
        FIRST_READ.store(now_nanos(), Relaxed);
    }
}

pub(crate) fn header() {
    if quapi_common::env::timing_enabled() {
        HEADER.store(now_nanos(), Relaxed);
    }
}

pub(crate) fn msg_after_header() {
    if !quapi_common::env::timing_enabled() || AFTER_HEADER_SEEN.swap(true, Relaxed) {
        return;
    }
    AFTER_HEADER.store(now_nanos(), Relaxed);

    let construct = CONSTRUCT.load(Relaxed);
    let first_read = FIRST_READ.load(Relaxed);
    let header = HEADER.load(Relaxed);
    let after_header = AFTER_HEADER.load(Relaxed);
    eprintln!(
        "[QuAPI] [Timing] {} {} {} {} {} {} {}",
        construct,
        first_read,
        header,
        after_header,
        first_read - construct,
        header - first_read,
        after_header - header
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }
}
