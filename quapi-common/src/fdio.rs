// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Unbuffered `Read`/`Write` adapters over raw file descriptors. Used for
//! the report pipe, where messages must be observed immediately and are
//! always written with a single syscall.
//!
//! These intentionally bypass `std::fs::File` so the preloaded runtime can
//! use them on descriptors it does not own (it shares stdio with the
//! solver), and so writes never go through interposable stdio paths.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

/// Reads directly from a borrowed descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdReader(pub RawFd);

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for buf.len() writable bytes.
            let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Writes directly to a borrowed descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdWriter(pub RawFd);

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for buf.len() readable bytes.
            let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
