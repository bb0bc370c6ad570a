// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Stderr logger behind the `log` facade, shared by the driver process and
//! the preloaded runtime. Lines carry the emitting pid so interleaved output
//! of the three processes stays readable.

use log::{Level, LevelFilter, Metadata, Record};

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        eprintln!("[QuAPI] [{}] [{}] {}", level, pid, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Installs the stderr logger unless the host application already installed
/// one; the level is driven by `QUAPI_DEBUG` / `QUAPI_TRACE`. Idempotent.
pub fn init() {
    let level = if crate::env::trace_enabled() {
        LevelFilter::Trace
    } else if crate::env::debug_enabled() {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
