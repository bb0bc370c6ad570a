// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Resolution of the original I/O symbols the runtime interposes.
//!
//! Every replacement entry point forwards non-stdin traffic to the symbol
//! that would have been bound without the preload, looked up once at load
//! time via `dlsym(RTLD_NEXT)`. The runtime's own message input also goes
//! through the saved `read`, never through the PLT, which would loop back
//! into the interposed symbol.

use libc::{c_char, c_int, c_uchar, c_uint, c_void, size_t, ssize_t, FILE};
use log::debug;
use std::ffi::CStr;
use std::sync::OnceLock;

/// Shell of a zlib `gzFile`. Only ever allocated for the fd-0 mock; real
/// gzFiles pass through opaquely.
#[repr(C)]
pub(crate) struct GzShell {
    pub have: c_uint,
    pub next: *mut c_uchar,
    pub pos: i64,
}

pub(crate) type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub(crate) type FreadFn = unsafe extern "C" fn(*mut c_void, size_t, size_t, *mut FILE) -> size_t;
pub(crate) type FopenFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE;
pub(crate) type FcloseFn = unsafe extern "C" fn(*mut FILE) -> c_int;
pub(crate) type GetcFn = unsafe extern "C" fn(*mut FILE) -> c_int;
pub(crate) type GzdopenFn = unsafe extern "C" fn(c_int, *const c_char) -> *mut GzShell;
pub(crate) type GzreadFn = unsafe extern "C" fn(*mut GzShell, *mut c_char, c_uint) -> c_int;
pub(crate) type GzcloseFn = unsafe extern "C" fn(*mut GzShell) -> c_int;

#[derive(Clone, Copy, Default)]
pub(crate) struct OrigSyms {
    pub fopen: Option<FopenFn>,
    pub fclose: Option<FcloseFn>,
    pub read: Option<ReadFn>,
    pub fread: Option<FreadFn>,
    pub getc: Option<GetcFn>,
    pub fgetc: Option<GetcFn>,
    pub getc_unlocked: Option<GetcFn>,
    pub fgetc_unlocked: Option<GetcFn>,
    pub uflow: Option<GetcFn>,
    pub gzdopen: Option<GzdopenFn>,
    pub gzread: Option<GzreadFn>,
    pub gzclose: Option<GzcloseFn>,
}

/// Looks up `name` past the preload in the symbol search order.
///
/// SAFETY: the caller must pick `F` to match the actual signature of the
/// symbol.
unsafe fn sym<F>(name: &CStr) -> Option<F> {
    let ptr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if ptr.is_null() {
        None
    } else {
        debug!(
            "resolved original function {}: {:p}",
            name.to_string_lossy(),
            ptr
        );
        Some(std::mem::transmute_copy::<*mut c_void, F>(&ptr))
    }
}

fn resolve() -> OrigSyms {
    // SAFETY: the chosen function types match the glibc / zlib prototypes.
    unsafe {
        OrigSyms {
            fopen: sym(c"fopen"),
            fclose: sym(c"fclose"),
            read: sym(c"read"),
            fread: sym(c"fread"),
            getc: sym(c"getc"),
            fgetc: sym(c"fgetc"),
            getc_unlocked: sym(c"getc_unlocked"),
            fgetc_unlocked: sym(c"fgetc_unlocked"),
            uflow: sym(c"__uflow"),
            gzdopen: sym(c"gzdopen"),
            gzread: sym(c"gzread"),
            gzclose: sym(c"gzclose"),
        }
    }
}

static SYMS: OnceLock<OrigSyms> = OnceLock::new();

pub(crate) fn syms() -> &'static OrigSyms {
    SYMS.get_or_init(resolve)
}
