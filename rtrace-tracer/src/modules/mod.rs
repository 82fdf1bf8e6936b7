// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing modules. Each module interposes one family of
//! resource-lifecycle functions and reports events through the runtime;
//! [`memory`] is the canonical instance of the wrapper shape.

#[cfg(target_os = "linux")]
pub mod memory;

#[cfg(target_os = "linux")]
use core::sync::atomic::{AtomicUsize, Ordering};

/// `dlopen` is interposed by the core so the pre-processor can rescan the
/// target's memory maps when new code is loaded.
#[cfg(target_os = "linux")]
static REAL_DLOPEN: AtomicUsize = AtomicUsize::new(0);

#[cfg(target_os = "linux")]
type DlopenFn =
    unsafe extern "C" fn(*const libc::c_char, libc::c_int) -> *mut libc::c_void;

/// # Safety
///
/// Standard `dlopen` contract; `filename` is null or a valid C string.
#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn dlopen(
    filename: *const libc::c_char,
    flags: libc::c_int,
) -> *mut libc::c_void {
    let mut real = REAL_DLOPEN.load(Ordering::Acquire);
    if real == 0 {
        real = crate::module::resolve_next(c"dlopen");
        if real == 0 {
            return core::ptr::null_mut();
        }
        REAL_DLOPEN.store(real, Ordering::Release);
    }
    let real: DlopenFn = core::mem::transmute(real);
    let handle = real(filename, flags);
    if !handle.is_null() && crate::runtime::tracing_enabled() && !filename.is_null() {
        if let Ok(path) = core::ffi::CStr::from_ptr(filename).to_str() {
            crate::runtime::write_new_library(path);
        }
    }
    handle
}
