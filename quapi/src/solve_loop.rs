// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! The driver-side solve loop: arbitrates the result of a running solver
//! child from three event sources polled without timeout.
//!
//! 1. The report pipe carries EXIT CODE and DESTRUCTED messages from the
//!    seed child and the preloaded runtime.
//! 2. The eventfd is armed by [`crate::Terminator`] to abort the solve.
//! 3. The solver child's stdout is matched line by line against the SAT and
//!    UNSAT regexes and handed to the stdout callback.

use crate::solver::StdoutCallback;
use log::{debug, error};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use quapi_common::fdio::FdReader;
use quapi_common::message::{read_msg, Message};
use regex::Regex;
use std::os::unix::io::{BorrowedFd, RawFd};

pub(crate) struct SolveLoop<'s> {
    pub report_fd: RawFd,
    pub event_fd: RawFd,
    pub stdout_fd: RawFd,
    pub watch_stdout: bool,
    pub re_sat: Option<&'s Regex>,
    pub re_unsat: Option<&'s Regex>,
    pub stdout_cb: Option<&'s mut StdoutCallback>,
    pub solver_child: Option<Pid>,
    pub line_buf: Vec<u8>,
    pub retcode: i32,
}

impl SolveLoop<'_> {
    pub fn run(mut self) -> i32 {
        let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        loop {
            // SAFETY: the descriptors outlive the loop; they are owned by
            // the solver object borrowed for the whole solve.
            let (report, event, stdout) = unsafe {
                (
                    BorrowedFd::borrow_raw(self.report_fd),
                    BorrowedFd::borrow_raw(self.event_fd),
                    BorrowedFd::borrow_raw(self.stdout_fd),
                )
            };
            let stdout_events = if self.watch_stdout {
                PollFlags::POLLIN
            } else {
                PollFlags::empty()
            };
            let mut fds = [
                PollFd::new(report, PollFlags::POLLIN),
                PollFd::new(event, PollFlags::POLLIN),
                PollFd::new(stdout, stdout_events),
            ];

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => {
                    debug!("poll returned EINTR, repeating");
                    continue;
                }
                Err(e) => {
                    error!("poll failed during solve: {e}");
                    return 0;
                }
            }

            let revents: Vec<PollFlags> = fds
                .iter()
                .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
                .collect();

            // All latched events are drained before polling again.
            if revents[0].intersects(ready) {
                if let Some(code) = self.handle_report() {
                    return code;
                }
            }
            if revents[1].intersects(ready) {
                return self.handle_abort();
            }
            if revents[2].intersects(ready) {
                if let Some(code) = self.handle_stdout() {
                    return code;
                }
            }
        }
    }

    /// Handles one message from the seed child or the preloaded runtime.
    /// Returns the solve result once one is decided.
    fn handle_report(&mut self) -> Option<i32> {
        let mut reader = FdReader(self.report_fd);
        match read_msg(&mut reader) {
            Ok(Some((Message::Destructed, _))) => {
                debug!("solver child was destructed before a result was read from stdout");
                Some(0)
            }
            Ok(Some((Message::ExitCode { exit_code }, _))) => {
                debug!("solver child exited with code {exit_code}");
                if exit_code == 0 && self.retcode == 0 && self.stdout_cb.is_some() {
                    // The real result comes from the callback; keep reading
                    // stdout until it yields a nonzero code.
                    debug!("stdout callback registered, continuing to read output");
                    None
                } else {
                    Some(exit_code)
                }
            }
            Ok(Some((other, _))) => {
                error!(
                    "unsupported message {} on the report pipe during solve",
                    other.type_str()
                );
                Some(0)
            }
            Ok(None) => {
                debug!("report pipe closed during solve");
                Some(0)
            }
            Err(e) => {
                error!("could not read from the report pipe: {e}");
                Some(0)
            }
        }
    }

    fn handle_abort(&mut self) -> i32 {
        debug!("received abort via eventfd");
        let mut buf = [0u8; 8];
        // SAFETY: buf is a valid 8 byte buffer; eventfd reads are 8 bytes.
        unsafe { libc::read(self.event_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if let Some(pid) = self.solver_child {
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                error!("could not kill solver child {pid}: {e}");
            }
        }
        0
    }

    /// Drains the solver child's stdout and applies regexes and the
    /// callback per completed line.
    fn handle_stdout(&mut self) -> Option<i32> {
        let mut chunk = [0u8; 1024];
        loop {
            // SAFETY: chunk is a valid writable buffer; the fd is
            // nonblocking.
            let n = unsafe { libc::read(self.stdout_fd, chunk.as_mut_ptr().cast(), chunk.len()) };
            if n > 0 {
                self.line_buf.extend_from_slice(&chunk[..n as usize]);
                continue;
            }
            if n == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EINTR) => continue,
                _ => {
                    error!("could not read solver child stdout: {err}");
                    break;
                }
            }
        }

        while let Some(end) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.line_buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line_bytes[..end]);

            if let Some(re) = self.re_sat {
                if re.is_match(&line) {
                    return Some(10);
                }
            }
            if let Some(re) = self.re_unsat {
                if re.is_match(&line) {
                    return Some(20);
                }
            }
            if let Some(cb) = self.stdout_cb.as_mut() {
                let ret = cb(&line);
                if ret != 0 {
                    return Some(ret);
                }
            }
        }
        None
    }
}
