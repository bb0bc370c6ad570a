// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Buffered transports for the message pipes.
//!
//! On Linux (with the `zerocopy` feature, the default) the fast path avoids
//! `read`/`write` copies entirely: the writer gifts page-aligned buffers to
//! the pipe with `vmsplice(SPLICE_F_GIFT)` and the reader splices them into
//! a `memfd`-backed mapping. Everywhere else the transport degrades to plain
//! buffered pipe I/O.
//!
//! The first `size_of::<usize>()` bytes of every transported buffer carry
//! the number of payload bytes that follow; the reader trusts that length
//! and treats anything larger than the buffer as corruption.

use crate::error::Result;
use std::os::unix::io::OwnedFd;

/// Size of one transport buffer. Buffers are aligned to their size so they
/// can be gifted to the kernel page-wise.
pub const BUF_SIZE: usize = 1 << 16;

/// Length prefix stored at the start of each buffer.
pub const LEN_PREFIX: usize = std::mem::size_of::<usize>();

/// Largest payload a single buffer can carry.
pub const MAX_PAYLOAD: usize = BUF_SIZE - LEN_PREFIX - 1;

#[cfg(all(target_os = "linux", feature = "zerocopy"))]
pub use splice::{SpliceReader, SpliceWriter};

/// Buffered writer type used for driver-side message pipes.
#[cfg(all(target_os = "linux", feature = "zerocopy"))]
pub type MsgWriter = SpliceWriter;
#[cfg(not(all(target_os = "linux", feature = "zerocopy")))]
pub type MsgWriter = std::io::BufWriter<std::fs::File>;

/// Wraps the write end of a pipe in the buffered message transport.
pub fn writer_from_fd(fd: OwnedFd) -> Result<MsgWriter> {
    #[cfg(all(target_os = "linux", feature = "zerocopy"))]
    {
        SpliceWriter::new(fd)
    }
    #[cfg(not(all(target_os = "linux", feature = "zerocopy")))]
    {
        Ok(std::io::BufWriter::new(std::fs::File::from(fd)))
    }
}

#[cfg(all(target_os = "linux", feature = "zerocopy"))]
mod splice {
    use super::{BUF_SIZE, LEN_PREFIX, MAX_PAYLOAD};
    use crate::error::{Error, Result};
    use log::trace;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use nix::sys::mman::{madvise, mmap, munmap, MapFlags, MmapAdvise, ProtFlags};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::ffi::c_void;
    use std::io;
    use std::num::NonZeroUsize;
    use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
    use std::ptr::NonNull;

    fn buffer_layout() -> Result<Layout> {
        Layout::from_size_align(BUF_SIZE, BUF_SIZE)
            .map_err(|e| Error::Alloc(format!("invalid buffer layout: {e}")))
    }

    fn wait_for(fd: BorrowedFd<'_>, events: PollFlags) -> Result<()> {
        let mut fds = [PollFd::new(fd, events)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(Error::other(format!("poll on pipe failed: {e}"))),
            }
        }
    }

    /// Double-buffered pipe writer that gifts full buffers to the kernel.
    pub struct SpliceWriter {
        fd: OwnedFd,
        bufs: [NonNull<u8>; 2],
        current: usize,
    }

    // The buffers are exclusively owned by the writer.
    unsafe impl Send for SpliceWriter {}

    impl SpliceWriter {
        pub fn new(fd: OwnedFd) -> Result<Self> {
            let layout = buffer_layout()?;
            let mut bufs = [NonNull::dangling(); 2];
            for buf in &mut bufs {
                // SAFETY: layout has non-zero size.
                let ptr = unsafe { alloc_zeroed(layout) };
                let Some(ptr) = NonNull::new(ptr) else {
                    return Err(Error::Alloc(format!(
                        "aligned_alloc({BUF_SIZE}, {BUF_SIZE}) failed for pipe buffer"
                    )));
                };
                // SAFETY: ptr covers BUF_SIZE freshly allocated bytes.
                if let Err(e) =
                    unsafe { madvise(ptr.cast::<c_void>(), BUF_SIZE, MmapAdvise::MADV_HUGEPAGE) }
                {
                    trace!("madvise(MADV_HUGEPAGE) failed: {e}");
                }
                *buf = ptr;
            }
            Ok(SpliceWriter {
                fd,
                bufs,
                current: 0,
            })
        }

        fn written(&self) -> usize {
            // SAFETY: the buffer starts with a usize length prefix and is
            // aligned far stronger than usize.
            unsafe { *(self.bufs[self.current].as_ptr() as *const usize) }
        }

        fn set_written(&mut self, value: usize) {
            // SAFETY: as in written().
            unsafe { *(self.bufs[self.current].as_ptr() as *mut usize) = value }
        }

        fn payload_ptr(&self) -> *mut u8 {
            // SAFETY: LEN_PREFIX < BUF_SIZE.
            unsafe { self.bufs[self.current].as_ptr().add(LEN_PREFIX) }
        }

        fn fits(&self, extra: usize) -> bool {
            self.written() + extra + LEN_PREFIX < BUF_SIZE
        }

        /// Gifts the current buffer to the pipe and switches to the other
        /// buffer. The full buffer is always transferred; the embedded
        /// length prefix tells the reader how much of it is payload.
        fn gift_current(&mut self) -> Result<()> {
            let written = self.written();
            if written > MAX_PAYLOAD {
                return Err(Error::other(
                    "pipe buffer length prefix exceeds the buffer size",
                ));
            }

            let mut base = self.bufs[self.current].as_ptr() as *const u8;
            let mut remaining = BUF_SIZE;
            while remaining > 0 {
                wait_for(self.fd.as_fd(), PollFlags::POLLOUT | PollFlags::POLLWRBAND)?;
                let iov = libc::iovec {
                    iov_base: base as *mut c_void,
                    iov_len: remaining,
                };
                // SAFETY: iov describes live memory owned by this writer.
                let ret = unsafe {
                    libc::vmsplice(self.fd.as_raw_fd(), &iov, 1, libc::SPLICE_F_GIFT)
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => continue,
                        Some(libc::EPIPE) => {
                            log::error!("peer closed the pipe, cannot gift buffer");
                            return Err(Error::Write(err));
                        }
                        _ => return Err(Error::Write(err)),
                    }
                }
                // SAFETY: ret <= remaining, so base stays inside the buffer.
                base = unsafe { base.add(ret as usize) };
                remaining -= ret as usize;
            }

            trace!(
                "gifted buffer {} with {} payload bytes into the pipe",
                self.current,
                written
            );

            self.current ^= 1;
            self.set_written(0);
            Ok(())
        }

        /// Copies `data` into the current buffer, gifting it first if the
        /// data would not fit.
        pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
            for chunk in data.chunks(MAX_PAYLOAD) {
                if !self.fits(chunk.len()) {
                    self.gift_current()?;
                }
                let written = self.written();
                // SAFETY: fits() guarantees chunk.len() bytes of room after
                // the already written payload.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        chunk.as_ptr(),
                        self.payload_ptr().add(written),
                        chunk.len(),
                    );
                }
                self.set_written(written + chunk.len());
            }
            Ok(())
        }

        /// Returns a mutable slice inside the current buffer for the caller
        /// to fill in place; nothing is sent until `commit`.
        pub fn prepare(&mut self, len: usize) -> Result<&mut [u8]> {
            if len > MAX_PAYLOAD {
                return Err(Error::Parameter(format!(
                    "prepared write of {len} bytes exceeds the buffer capacity"
                )));
            }
            if !self.fits(len) {
                self.gift_current()?;
            }
            let written = self.written();
            // SAFETY: fits() guarantees len bytes of room.
            Ok(unsafe { std::slice::from_raw_parts_mut(self.payload_ptr().add(written), len) })
        }

        /// Advances the payload length after an in-place fill obtained from
        /// `prepare`.
        pub fn commit(&mut self, len: usize) {
            debug_assert!(self.written() + len + LEN_PREFIX < BUF_SIZE);
            let written = self.written();
            self.set_written(written + len);
        }

        /// Gifts the current buffer if it holds any payload.
        pub fn flush_buffer(&mut self) -> Result<()> {
            if self.written() > 0 {
                self.gift_current()?;
            }
            Ok(())
        }
    }

    impl io::Write for SpliceWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_bytes(buf)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flush_buffer()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }
    }

    impl Drop for SpliceWriter {
        fn drop(&mut self) {
            if let Ok(layout) = buffer_layout() {
                for buf in self.bufs {
                    // SAFETY: allocated with the same layout in new().
                    unsafe { dealloc(buf.as_ptr(), layout) };
                }
            }
        }
    }

    /// Pipe reader over a `memfd`-backed mapping refilled with `splice`.
    ///
    /// The reader borrows the descriptor (the preloaded runtime reads from
    /// fd 0, which it does not own) and never closes it.
    pub struct SpliceReader {
        fd: RawFd,
        memfd: OwnedFd,
        map: NonNull<c_void>,
        read_pos: usize,
        eof: bool,
    }

    unsafe impl Send for SpliceReader {}

    impl SpliceReader {
        pub fn new(fd: RawFd) -> Result<Self> {
            let memfd = memfd_create(c"quapi-zerocopy-pipe", MemFdCreateFlag::empty())
                .map_err(|e| Error::other(format!("memfd_create failed: {e}")))?;

            // Seed the length prefix so the first read observes an empty
            // buffer instead of unmapped pages.
            let zero = 0usize.to_ne_bytes();
            // SAFETY: zero is a valid buffer of LEN_PREFIX bytes.
            let ret =
                unsafe { libc::write(memfd.as_raw_fd(), zero.as_ptr().cast(), zero.len()) };
            if ret != zero.len() as isize {
                return Err(Error::Write(io::Error::last_os_error()));
            }

            let len = NonZeroUsize::new(BUF_SIZE)
                .ok_or_else(|| Error::Alloc("zero-sized pipe buffer".into()))?;
            // SAFETY: mapping a fresh memfd we exclusively own.
            let map = unsafe {
                mmap(
                    None,
                    len,
                    ProtFlags::PROT_READ,
                    MapFlags::MAP_SHARED,
                    &memfd,
                    0,
                )
            }
            .map_err(|e| Error::other(format!("mmap of pipe memfd failed: {e}")))?;

            Ok(SpliceReader {
                fd,
                memfd,
                map,
                read_pos: 0,
                eof: false,
            })
        }

        fn written(&self) -> usize {
            // SAFETY: the mapping starts with the usize length prefix.
            unsafe { *(self.map.as_ptr() as *const usize) }
        }

        fn payload_ptr(&self) -> *const u8 {
            // SAFETY: LEN_PREFIX < BUF_SIZE.
            unsafe { (self.map.as_ptr() as *const u8).add(LEN_PREFIX) }
        }

        /// Splices the next buffer from the pipe into the mapping. Returns
        /// false on end of stream.
        fn refill(&mut self) -> Result<bool> {
            if self.eof {
                return Ok(false);
            }
            // SAFETY: self.fd stays open for the lifetime of the reader.
            let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
            wait_for(fd, PollFlags::POLLIN | PollFlags::POLLPRI)?;

            loop {
                let mut offout: libc::loff_t = 0;
                nix::unistd::ftruncate(&self.memfd, 0)
                    .map_err(|e| Error::other(format!("ftruncate of pipe memfd failed: {e}")))?;
                // SAFETY: both descriptors are valid; offout is a live
                // out-parameter.
                let ret = unsafe {
                    libc::splice(
                        self.fd,
                        std::ptr::null_mut(),
                        self.memfd.as_raw_fd(),
                        &mut offout,
                        BUF_SIZE,
                        libc::SPLICE_F_MOVE,
                    )
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EAGAIN) {
                        continue;
                    }
                    return Err(Error::other(format!(
                        "splice from pipe into memfd failed: {err}"
                    )));
                }
                if offout == 0 {
                    // The file was truncated for the refill; restore the
                    // length prefix so later accesses do not fault on an
                    // empty mapping.
                    let zero = 0usize.to_ne_bytes();
                    // SAFETY: writing LEN_PREFIX bytes at offset 0.
                    unsafe {
                        libc::pwrite(
                            self.memfd.as_raw_fd(),
                            zero.as_ptr().cast(),
                            zero.len(),
                            0,
                        )
                    };
                    self.read_pos = 0;
                    self.eof = true;
                    return Ok(false);
                }
                trace!(
                    "spliced buffer with {} payload bytes out of the pipe",
                    self.written()
                );
                return Ok(true);
            }
        }

        fn available(&self) -> usize {
            self.written().saturating_sub(self.read_pos)
        }

        /// Returns the next `len` payload bytes without copying, refilling
        /// from the pipe when the current buffer is exhausted. `None` on end
        /// of stream.
        pub fn read_slice(&mut self, len: usize) -> Result<Option<&[u8]>> {
            if len > MAX_PAYLOAD {
                return Err(Error::Parameter(format!(
                    "read of {len} bytes exceeds the buffer capacity"
                )));
            }
            if self.available() < len {
                // Records never straddle buffers: the writer only gifts
                // whole records.
                debug_assert_eq!(self.available(), 0);
                if !self.refill()? {
                    return Ok(None);
                }
                self.read_pos = 0;
                if self.written() > MAX_PAYLOAD {
                    return Err(Error::other(
                        "pipe buffer length prefix exceeds the buffer size",
                    ));
                }
            }
            // SAFETY: read_pos + len <= written <= MAX_PAYLOAD.
            let slice =
                unsafe { std::slice::from_raw_parts(self.payload_ptr().add(self.read_pos), len) };
            self.read_pos += len;
            Ok(Some(slice))
        }
    }

    impl io::Read for SpliceReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if out.is_empty() {
                return Ok(0);
            }
            if self.available() == 0 {
                match self.refill() {
                    Ok(true) => {
                        self.read_pos = 0;
                        if self.written() > MAX_PAYLOAD {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "pipe buffer length prefix exceeds the buffer size",
                            ));
                        }
                    }
                    Ok(false) => return Ok(0),
                    Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
                }
            }
            let n = self.available().min(out.len());
            // SAFETY: read_pos + n <= written.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.payload_ptr().add(self.read_pos),
                    out.as_mut_ptr(),
                    n,
                );
            }
            self.read_pos += n;
            Ok(n)
        }
    }

    impl Drop for SpliceReader {
        fn drop(&mut self) {
            // SAFETY: map was returned by mmap with length BUF_SIZE and is
            // unmapped exactly once.
            if let Err(e) = unsafe { munmap(self.map, BUF_SIZE) } {
                log::error!("munmap of pipe buffer failed: {e}");
            }
        }
    }
}

#[cfg(all(test, target_os = "linux", feature = "zerocopy"))]
mod tests {
    use super::*;
    use crate::message::{read_msg, write_msg, HeaderData, Message};
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn messages_roundtrip_through_splice_pipe() {
        let (rx, tx) = nix::unistd::pipe().unwrap();

        let header = HeaderData {
            literals: 2,
            clauses: 3,
            prefixdepth: 1,
            forked_child_read_pipe: [3, 4],
            forked_child_write_pipe: [5, 6],
            message_to_parent_pipe: [7, 8],
        };
        let messages = vec![
            Message::Header { api_version: 3 },
            Message::Quantifier { lit: 1 },
            Message::Quantifier { lit: -2 },
            Message::Literal { lit: 1 },
            Message::Literal { lit: 0 },
            Message::Fork {
                wait_for_exit_code_and_report: false,
            },
            Message::Solve,
        ];

        let sent = messages.clone();
        let writer = std::thread::spawn(move || {
            let mut w = SpliceWriter::new(tx).unwrap();
            for msg in &sent {
                write_msg(&mut w, msg, Some(&header)).unwrap();
            }
            w.flush_buffer().unwrap();
        });

        let mut r = SpliceReader::new(rx.as_raw_fd()).unwrap();
        for expected in &messages {
            let (msg, hdr) = read_msg(&mut r).unwrap().unwrap();
            assert_eq!(&msg, expected);
            if let Message::Header { .. } = expected {
                assert_eq!(hdr, Some(header));
            }
        }
        writer.join().unwrap();
        drop(rx);
    }

    #[test]
    fn bulk_data_survives_buffer_switches() {
        let (rx, tx) = nix::unistd::pipe().unwrap();

        let total = 3 * BUF_SIZE + 1234;
        let pattern: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        let expected = pattern.clone();
        let writer = std::thread::spawn(move || {
            let mut w = SpliceWriter::new(tx).unwrap();
            for chunk in expected.chunks(1000) {
                w.write_bytes(chunk).unwrap();
            }
            w.flush_buffer().unwrap();
        });

        let mut r = SpliceReader::new(rx.as_raw_fd()).unwrap();
        let mut got = Vec::with_capacity(total);
        let mut buf = [0u8; 4096];
        loop {
            let n = r.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();
        assert_eq!(got, pattern);
        drop(rx);
    }

    #[test]
    fn prepare_commit_fills_in_place() {
        let (rx, tx) = nix::unistd::pipe().unwrap();

        let writer = std::thread::spawn(move || {
            let mut w = SpliceWriter::new(tx).unwrap();
            let slot = w.prepare(5).unwrap();
            slot.copy_from_slice(b"quapi");
            w.commit(5);
            w.flush_buffer().unwrap();
        });

        let mut r = SpliceReader::new(rx.as_raw_fd()).unwrap();
        let got = r.read_slice(5).unwrap().unwrap().to_vec();
        assert_eq!(&got, b"quapi");
        writer.join().unwrap();
        drop(rx);
    }
}
