// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Replacement symbols for the solver's input-reading entry points.
//!
//! Everything aimed at stdin is routed into the runtime's synthesized
//! stream: raw `read(0, …)`, stdio byte readers (including the unlocked
//! variants glibc inlines against the `FILE` internals, which is why
//! `__uflow` is overridden as well), `fread`, `/dev/stdin` opened as a
//! regular file, and zlib `gzread` on an fd-0 gzFile. Anything else is
//! forwarded to the original symbols saved at load time.
//!
//! This is the one deliberately glibc-specific corner of the codebase; the
//! `FILE` prefix layout below mirrors glibc's `_IO_FILE`.

use crate::runtime::{self, READ_DETECTED};
use crate::syms::{syms, GzShell};
use libc::{c_char, c_int, c_uint, c_void, size_t, ssize_t, FILE};
use log::debug;
use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering::SeqCst};

const EOF: c_int = -1;

/// Refill granularity of the `__uflow` buffer.
const UFLOW_BUF_LEN: usize = 64;

/// Allocation size of the mocked `/dev/stdin` FILE; larger than glibc's
/// `_IO_FILE` so field accesses by stdio helpers stay in bounds.
const MOCK_FILE_SIZE: usize = 512;

/// Leading fields of glibc's `_IO_FILE`, used for the buffered byte-read
/// fast path.
#[repr(C)]
struct GlibcFile {
    _flags: c_int,
    _io_read_ptr: *mut c_char,
    _io_read_end: *mut c_char,
    _io_read_base: *mut c_char,
}

extern "C" {
    #[link_name = "stdin"]
    static mut libc_stdin: *mut FILE;
}

static DEFAULT_STDIN: AtomicPtr<FILE> = AtomicPtr::new(ptr::null_mut());
static MOCK_STDIN: AtomicPtr<FILE> = AtomicPtr::new(ptr::null_mut());
static MOCK_GZ: AtomicPtr<GzShell> = AtomicPtr::new(ptr::null_mut());

static ENTRY_FGETC: AtomicBool = AtomicBool::new(false);
static ENTRY_FGETC_UNLOCKED: AtomicBool = AtomicBool::new(false);
static ENTRY_GETC: AtomicBool = AtomicBool::new(false);
static ENTRY_GETC_UNLOCKED: AtomicBool = AtomicBool::new(false);
static ENTRY_READ: AtomicBool = AtomicBool::new(false);
static ENTRY_FREAD: AtomicBool = AtomicBool::new(false);
static ENTRY_UFLOW: AtomicBool = AtomicBool::new(false);
static ENTRY_GZREAD: AtomicBool = AtomicBool::new(false);

/// Remembers the `stdin` FILE of this process so the stdio entry points can
/// recognize it. Called once at load time.
pub(crate) fn record_default_stdin() {
    // SAFETY: reading the libc global.
    DEFAULT_STDIN.store(unsafe { libc_stdin }, SeqCst);
}

fn report_entry(name: &'static str, seen: &AtomicBool) {
    READ_DETECTED.store(true, SeqCst);
    if !seen.swap(true, SeqCst) {
        debug!("entered preloaded runtime through {name}");
    }
}

fn is_shim_stdin(stream: *mut FILE) -> bool {
    if stream.is_null() {
        return false;
    }
    stream == DEFAULT_STDIN.load(SeqCst) || stream == MOCK_STDIN.load(SeqCst)
}

/// The body glibc inlines for `getc_unlocked`: serve from the FILE buffer,
/// refill through `__uflow` when it runs dry.
unsafe fn buffered_byte(stream: *mut FILE) -> c_int {
    let f = stream as *mut GlibcFile;
    if (*f)._io_read_ptr >= (*f)._io_read_end {
        __uflow(stream)
    } else {
        let c = *(*f)._io_read_ptr as u8;
        (*f)._io_read_ptr = (*f)._io_read_ptr.add(1);
        c as c_int
    }
}

#[no_mangle]
pub unsafe extern "C" fn fgetc(stream: *mut FILE) -> c_int {
    if is_shim_stdin(stream) {
        report_entry("fgetc", &ENTRY_FGETC);
        buffered_byte(stream)
    } else if let Some(orig) = syms().fgetc {
        orig(stream)
    } else {
        EOF
    }
}

#[no_mangle]
pub unsafe extern "C" fn fgetc_unlocked(stream: *mut FILE) -> c_int {
    if is_shim_stdin(stream) {
        report_entry("fgetc_unlocked", &ENTRY_FGETC_UNLOCKED);
        buffered_byte(stream)
    } else if let Some(orig) = syms().fgetc_unlocked {
        orig(stream)
    } else {
        EOF
    }
}

#[no_mangle]
pub unsafe extern "C" fn getc(stream: *mut FILE) -> c_int {
    if is_shim_stdin(stream) {
        report_entry("getc", &ENTRY_GETC);
        buffered_byte(stream)
    } else if let Some(orig) = syms().getc {
        orig(stream)
    } else {
        EOF
    }
}

#[no_mangle]
pub unsafe extern "C" fn getc_unlocked(stream: *mut FILE) -> c_int {
    if is_shim_stdin(stream) {
        report_entry("getc_unlocked", &ENTRY_GETC_UNLOCKED);
        buffered_byte(stream)
    } else if let Some(orig) = syms().getc_unlocked {
        orig(stream)
    } else {
        EOF
    }
}

/// glibc refills inlined byte readers through `__uflow`; serving it keeps
/// solvers working whose `getc_unlocked` never goes through the PLT.
#[no_mangle]
pub unsafe extern "C" fn __uflow(stream: *mut FILE) -> c_int {
    if !is_shim_stdin(stream) {
        return match syms().uflow {
            Some(orig) => orig(stream),
            None => EOF,
        };
    }
    report_entry("__uflow", &ENTRY_UFLOW);

    let f = stream as *mut GlibcFile;
    if (*f)._io_read_base.is_null() {
        (*f)._io_read_base = libc::malloc(UFLOW_BUF_LEN) as *mut c_char;
        if (*f)._io_read_base.is_null() {
            return EOF;
        }
    }
    let buf = std::slice::from_raw_parts_mut((*f)._io_read_base as *mut u8, UFLOW_BUF_LEN);
    let n = runtime::shim_read(buf);
    if n <= 0 {
        libc::free((*f)._io_read_base as *mut c_void);
        (*f)._io_read_base = ptr::null_mut();
        (*f)._io_read_ptr = ptr::null_mut();
        (*f)._io_read_end = ptr::null_mut();
        return EOF;
    }
    (*f)._io_read_ptr = (*f)._io_read_base;
    (*f)._io_read_end = (*f)._io_read_base.add(n as usize);
    let c = *(*f)._io_read_ptr as u8;
    (*f)._io_read_ptr = (*f)._io_read_ptr.add(1);
    c as c_int
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, data: *mut c_void, len: size_t) -> ssize_t {
    if fd == libc::STDIN_FILENO {
        report_entry("read", &ENTRY_READ);
        if data.is_null() {
            return -1;
        }
        let out = std::slice::from_raw_parts_mut(data as *mut u8, len);
        runtime::shim_read(out)
    } else if let Some(orig) = syms().read {
        orig(fd, data, len)
    } else {
        -1
    }
}

#[no_mangle]
pub unsafe extern "C" fn fread(
    ptr_arg: *mut c_void,
    size: size_t,
    nmemb: size_t,
    stream: *mut FILE,
) -> size_t {
    let reads_stdin = is_shim_stdin(stream)
        || (!stream.is_null() && libc::fileno(stream) == libc::STDIN_FILENO);
    if reads_stdin {
        report_entry("fread", &ENTRY_FREAD);
        let total = size.saturating_mul(nmemb);
        if total == 0 || ptr_arg.is_null() {
            return 0;
        }
        let out = std::slice::from_raw_parts_mut(ptr_arg as *mut u8, total);
        let n = runtime::shim_read(out);
        if n <= 0 {
            0
        } else {
            n as size_t / size
        }
    } else if let Some(orig) = syms().fread {
        orig(ptr_arg, size, nmemb, stream)
    } else {
        0
    }
}

/// Solvers that open `/dev/stdin` as a regular file get an empty FILE
/// shell; all byte readers on it funnel through `__uflow` into the runtime.
#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    if !path.is_null() && CStr::from_ptr(path).to_bytes() == b"/dev/stdin" {
        debug!("fopen(\"/dev/stdin\") served by the preloaded runtime");
        let shell = libc::calloc(1, MOCK_FILE_SIZE) as *mut FILE;
        if !shell.is_null() {
            MOCK_STDIN.store(shell, SeqCst);
        }
        return shell;
    }
    match syms().fopen {
        Some(orig) => orig(path, mode),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn fclose(stream: *mut FILE) -> c_int {
    if !stream.is_null() && stream == MOCK_STDIN.load(SeqCst) {
        let f = stream as *mut GlibcFile;
        if !(*f)._io_read_base.is_null() {
            libc::free((*f)._io_read_base as *mut c_void);
        }
        MOCK_STDIN.store(ptr::null_mut(), SeqCst);
        libc::free(stream as *mut c_void);
        return 0;
    }
    match syms().fclose {
        Some(orig) => orig(stream),
        None => EOF,
    }
}

#[no_mangle]
pub unsafe extern "C" fn gzdopen(fd: c_int, mode: *const c_char) -> *mut GzShell {
    if fd == libc::STDIN_FILENO {
        debug!("gzdopen(0) served by the preloaded runtime");
        let shell = libc::calloc(1, std::mem::size_of::<GzShell>()) as *mut GzShell;
        if !shell.is_null() {
            MOCK_GZ.store(shell, SeqCst);
        }
        return shell;
    }
    match syms().gzdopen {
        Some(orig) => orig(fd, mode),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn gzread(file: *mut GzShell, buf: *mut c_char, len: c_uint) -> c_int {
    if !file.is_null() && file == MOCK_GZ.load(SeqCst) {
        report_entry("gzread", &ENTRY_GZREAD);
        if buf.is_null() {
            return -1;
        }
        let out = std::slice::from_raw_parts_mut(buf as *mut u8, len as usize);
        runtime::shim_read(out) as c_int
    } else if let Some(orig) = syms().gzread {
        orig(file, buf, len)
    } else {
        -1
    }
}

#[no_mangle]
pub unsafe extern "C" fn gzclose(file: *mut GzShell) -> c_int {
    if !file.is_null() && file == MOCK_GZ.load(SeqCst) {
        MOCK_GZ.store(ptr::null_mut(), SeqCst);
        libc::free(file as *mut c_void);
        return 0;
    }
    match syms().gzclose {
        Some(orig) => orig(file),
        None => -1,
    }
}
