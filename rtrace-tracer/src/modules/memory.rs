// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory allocation tracing module.
//!
//! Interposes `malloc`, `calloc`, `realloc`, `posix_memalign` and `free`.
//! While the dynamic loader is still resolving the originals the wrappers
//! serve from the scratch region, because the loader itself allocates
//! during `dlsym`. Scratch pointers are recognized by address range for
//! the rest of the process lifetime.

use crate::module::{resolve_next, ModuleDecl, ModuleState, ResolvedSymbol, StateCell};
use crate::runtime;
use crate::scratch;
use crate::unwind;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use libc::size_t;
use rtrace_common::record::CallKind;

static STATE: StateCell = StateCell::new();
/// Tracing table flag, flipped by the runtime on toggle.
static TRACING: AtomicBool = AtomicBool::new(false);
/// Guards the one-time registration step of the Loaded -> Ready move.
static REGISTERING: AtomicBool = AtomicBool::new(false);
static RESOURCE_ID: AtomicU32 = AtomicU32::new(0);

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
type MemalignFn = unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> libc::c_int;
type FreeFn = unsafe extern "C" fn(*mut c_void);

static SYMBOLS: [ResolvedSymbol; 5] = [
    ResolvedSymbol {
        name: "malloc",
        addr: &REAL_MALLOC,
    },
    ResolvedSymbol {
        name: "calloc",
        addr: &REAL_CALLOC,
    },
    ResolvedSymbol {
        name: "realloc",
        addr: &REAL_REALLOC,
    },
    ResolvedSymbol {
        name: "posix_memalign",
        addr: &REAL_POSIX_MEMALIGN,
    },
    ResolvedSymbol {
        name: "free",
        addr: &REAL_FREE,
    },
];

static DECL: ModuleDecl = ModuleDecl {
    name: "memory",
    vmajor: 2,
    vminor: 0,
    enable: set_tracing,
    symbols: &SYMBOLS,
};

fn set_tracing(value: bool) {
    TRACING.store(value, Ordering::Release);
}

fn resolve_symbols() {
    // SAFETY: literal C strings.
    unsafe {
        REAL_MALLOC.store(resolve_next(c"malloc"), Ordering::Release);
        REAL_FREE.store(resolve_next(c"free"), Ordering::Release);
        REAL_CALLOC.store(resolve_next(c"calloc"), Ordering::Release);
        REAL_REALLOC.store(resolve_next(c"realloc"), Ordering::Release);
        REAL_POSIX_MEMALIGN.store(resolve_next(c"posix_memalign"), Ordering::Release);
    }
}

/// Drives the module state machine forward; called on every wrapper
/// entry until the module is ready.
fn ensure_initialized() {
    match STATE.get() {
        ModuleState::Uninitialized => {
            if STATE.advance(ModuleState::Uninitialized, ModuleState::Resolving) {
                resolve_symbols();
                STATE.advance(ModuleState::Resolving, ModuleState::Loaded);
                try_ready();
            }
        }
        ModuleState::Loaded => try_ready(),
        _ => {}
    }
}

fn try_ready() {
    if !runtime::initialize() || STATE.get() != ModuleState::Loaded {
        return;
    }
    if REGISTERING.swap(true, Ordering::AcqRel) {
        return;
    }
    // The resource id must be in place before calls can hit the tracing
    // path, so registration precedes the Ready transition.
    RESOURCE_ID.store(
        runtime::register_resource("memory", "memory allocation in bytes", 0),
        Ordering::Release,
    );
    runtime::register_module(&DECL);
    STATE.advance(ModuleState::Loaded, ModuleState::Ready);
}

#[inline]
fn traced_path() -> bool {
    STATE.get() == ModuleState::Ready && TRACING.load(Ordering::Acquire)
}

#[inline]
fn resource_id() -> u32 {
    RESOURCE_ID.load(Ordering::Acquire)
}

fn real_malloc() -> MallocFn {
    // SAFETY: slot was stored from dlsym and verified at registration.
    unsafe { core::mem::transmute(REAL_MALLOC.load(Ordering::Acquire)) }
}

fn real_calloc() -> CallocFn {
    // SAFETY: as real_malloc.
    unsafe { core::mem::transmute(REAL_CALLOC.load(Ordering::Acquire)) }
}

fn real_realloc() -> ReallocFn {
    // SAFETY: as real_malloc.
    unsafe { core::mem::transmute(REAL_REALLOC.load(Ordering::Acquire)) }
}

fn real_posix_memalign() -> MemalignFn {
    // SAFETY: as real_malloc.
    unsafe { core::mem::transmute(REAL_POSIX_MEMALIGN.load(Ordering::Acquire)) }
}

fn real_free() -> FreeFn {
    // SAFETY: as real_malloc.
    unsafe { core::mem::transmute(REAL_FREE.load(Ordering::Acquire)) }
}

/// # Safety
///
/// Standard `malloc` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    ensure_initialized();
    if STATE.get() == ModuleState::Resolving {
        return scratch::alloc(size, 8) as *mut c_void;
    }
    if unwind::lock_held() || !traced_path() {
        return real_malloc()(size);
    }
    let rc = real_malloc()(size);
    unwind::clear_lock();
    if !rc.is_null() {
        runtime::write_function_call(
            CallKind::Alloc,
            resource_id(),
            "malloc",
            size as u32,
            rc as usize,
            None,
        );
        runtime::store_heap_info();
    }
    rc
}

/// # Safety
///
/// Standard `calloc` contract.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    ensure_initialized();
    if STATE.get() == ModuleState::Resolving {
        return scratch::alloc_zeroed(nmemb.saturating_mul(size)) as *mut c_void;
    }
    if unwind::lock_held() || !traced_path() {
        return real_calloc()(nmemb, size);
    }
    let rc = real_calloc()(nmemb, size);
    unwind::clear_lock();
    if !rc.is_null() {
        runtime::write_function_call(
            CallKind::Alloc,
            resource_id(),
            "calloc",
            nmemb.saturating_mul(size) as u32,
            rc as usize,
            None,
        );
        runtime::store_heap_info();
    }
    rc
}

/// # Safety
///
/// Standard `realloc` contract.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    ensure_initialized();
    // Blocks handed out before symbol resolution migrate to the real heap
    // on their first reallocation.
    if scratch::contains(ptr as *const u8) {
        if STATE.get() == ModuleState::Resolving {
            return scratch::realloc(ptr as *mut u8, size) as *mut c_void;
        }
        let new_ptr = malloc(size);
        if !new_ptr.is_null() && !ptr.is_null() {
            let old_size = scratch::size_of(ptr as *const u8);
            core::ptr::copy_nonoverlapping(
                ptr as *const u8,
                new_ptr as *mut u8,
                old_size.min(size),
            );
            scratch::free(ptr as *mut u8);
        }
        return new_ptr;
    }
    if STATE.get() == ModuleState::Resolving {
        return scratch::realloc(ptr as *mut u8, size) as *mut c_void;
    }
    if unwind::lock_held() || !traced_path() {
        return real_realloc()(ptr, size);
    }
    let rc = real_realloc()(ptr, size);
    unwind::clear_lock();
    // A successful reallocation (or a release via size 0) frees the old
    // block; a successful one allocates the new block. Both events carry
    // the wrapped function's name.
    if (!rc.is_null() || size == 0) && !ptr.is_null() {
        runtime::write_function_call(
            CallKind::Free,
            resource_id(),
            "realloc",
            0,
            ptr as usize,
            None,
        );
    }
    if !rc.is_null() {
        runtime::write_function_call(
            CallKind::Alloc,
            resource_id(),
            "realloc",
            size as u32,
            rc as usize,
            None,
        );
        runtime::store_heap_info();
    }
    rc
}

/// # Safety
///
/// Standard `posix_memalign` contract.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> libc::c_int {
    ensure_initialized();
    if STATE.get() == ModuleState::Resolving {
        if alignment == 0 || !alignment.is_power_of_two() || alignment % core::mem::size_of::<usize>() != 0 {
            return libc::EINVAL;
        }
        *memptr = scratch::alloc(size, alignment) as *mut c_void;
        return 0;
    }
    if unwind::lock_held() || !traced_path() {
        return real_posix_memalign()(memptr, alignment, size);
    }
    let rc = real_posix_memalign()(memptr, alignment, size);
    if rc == 0 {
        runtime::write_function_call(
            CallKind::Alloc,
            resource_id(),
            "posix_memalign",
            size as u32,
            *memptr as usize,
            None,
        );
        runtime::store_heap_info();
    }
    rc
}

/// # Safety
///
/// Standard `free` contract.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // Scratch blocks never reach the real allocator.
    if scratch::contains(ptr as *const u8) {
        scratch::free(ptr as *mut u8);
        return;
    }
    ensure_initialized();
    if STATE.get() == ModuleState::Resolving {
        return;
    }
    if unwind::lock_held() || !traced_path() {
        return real_free()(ptr);
    }
    real_free()(ptr);
    unwind::clear_lock();
    runtime::write_function_call(CallKind::Free, resource_id(), "free", 0, ptr as usize, None);
    runtime::store_heap_info();
}
