// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Load- and unload-time hooks of the preloaded runtime.
//!
//! Initialization must run before the solver's first read: symbols are
//! resolved before the input stream opens, and the stream opens before any
//! interposed entry point can fire. Teardown closes the input stream first
//! and then reports DESTRUCTED, unless the fork protocol suppressed it in
//! favor of an EXIT CODE message.

use crate::runtime::{self, Runtime, READ_DETECTED, SEND_DESTRUCTED};
use crate::{intercept, syms, timing};
use log::{debug, error};
use quapi_common::fdio::FdWriter;
use quapi_common::message::{write_msg, Message};
use std::sync::atomic::Ordering::SeqCst;

extern "C" fn shim_init() {
    quapi_common::log::init();

    if let Ok(exe) = std::env::current_exe() {
        debug!("initiating preloaded runtime in executable {}", exe.display());
    }

    timing::construct();

    let resolved = *syms::syms();
    intercept::record_default_stdin();
    runtime::install(Runtime::new(resolved));

    debug!("done initiating, waiting for reads");
}

extern "C" fn shim_fini() {
    if !READ_DETECTED.load(SeqCst) {
        error!(
            "no supported read call was wrapped or no read on stdin ever happened; check how \
             the solver reads its input"
        );
        return;
    }

    let Some(rt) = runtime::take() else {
        return;
    };
    let report_fd = rt.report_pipe_fd();
    // Dropping the runtime closes the input stream before anything else
    // tears down.
    drop(rt);

    if SEND_DESTRUCTED.load(SeqCst) {
        if let Some(fd) = report_fd {
            let mut writer = FdWriter(fd);
            if let Err(e) = write_msg(&mut writer, &Message::Destructed, None) {
                error!("could not send DESTRUCTED to the driver: {e}");
            }
        }
    }
}

#[used]
#[link_section = ".init_array"]
static SHIM_INIT: extern "C" fn() = shim_init;

#[used]
#[link_section = ".fini_array"]
static SHIM_FINI: extern "C" fn() = shim_fini;
