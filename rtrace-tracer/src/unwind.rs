// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack capture and the per-thread re-entry lock.
//!
//! The unwinder itself calls wrapped allocation and IO functions, so every
//! wrapper consults [`lock_held`] on entry and short-circuits to the
//! original while a capture is in flight on the same thread. The lock is
//! per-thread; a process-wide lock would serialize every wrapped call.

use core::cell::Cell;

/// Leading frames belonging to the tracer itself, stripped from every
/// capture.
pub const SKIP_TOP: usize = 3;

/// Upper bound of one raw capture, before depth clamping.
pub const MAX_FRAMES: usize = 256;

thread_local! {
    static BACKTRACE_LOCK: Cell<bool> = const { Cell::new(false) };
}

/// True when the current thread is inside a stack capture.
#[inline]
pub fn lock_held() -> bool {
    // During thread teardown the TLS slot may already be gone; treating
    // that as locked keeps the wrapper on the untraced path.
    BACKTRACE_LOCK.try_with(|lock| lock.get()).unwrap_or(true)
}

#[inline]
pub fn set_lock() {
    let _ = BACKTRACE_LOCK.try_with(|lock| lock.set(true));
}

/// Wrappers clear the lock after invoking the original and before calling
/// the event emitter.
#[inline]
pub fn clear_lock() {
    let _ = BACKTRACE_LOCK.try_with(|lock| lock.set(false));
}

/// Which mechanism walks the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwinder {
    /// `backtrace::trace_unsynchronized`, the default.
    Backtrace,
    /// Raw frame-pointer chain walking; needs code compiled with frame
    /// pointers but works where unwind tables are missing.
    FramePointers,
}

/// Captures up to `depth` return addresses into `frames`, skipping the
/// tracer's own leading frames. Returns the number of frames stored.
///
/// The caller must hold the re-entry lock for the duration of the call:
/// the unwinder may call wrapped functions, and the lock is what routes
/// those to the originals.
pub fn capture(unwinder: Unwinder, frames: &mut [usize], depth: usize) -> usize {
    let depth = depth.min(frames.len());
    if depth == 0 {
        return 0;
    }
    match unwinder {
        Unwinder::Backtrace => capture_unwinder(frames, depth),
        Unwinder::FramePointers => capture_frame_pointers(frames, depth),
    }
}

fn capture_unwinder(frames: &mut [usize], depth: usize) -> usize {
    let mut skipped = 0;
    let mut count = 0;
    // SAFETY: the per-thread lock is held, so no concurrent unsynchronized
    // trace runs on this thread; trace_unsynchronized itself is safe to
    // call from regular (non-signal) context, which is where wrappers run.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if skipped < SKIP_TOP {
                skipped += 1;
                return true;
            }
            frames[count] = frame.ip() as usize;
            count += 1;
            count < depth
        });
    }
    count
}

#[inline]
fn likely_valid(addr: usize) -> bool {
    if addr < 4096 || addr % core::mem::size_of::<usize>() != 0 {
        return false;
    }
    #[cfg(target_pointer_width = "64")]
    if addr > 0x0000_7fff_ffff_ffff {
        return false;
    }
    true
}

/// Frame-pointer chain walk starting from this function's own frame.
/// Reads are validated before dereferencing so a broken chain ends the
/// capture instead of faulting.
fn capture_frame_pointers(frames: &mut [usize], depth: usize) -> usize {
    let mut bp = frame_pointer();
    let mut count = 0;
    let mut skipped = 0;
    while count < depth {
        if !likely_valid(bp) {
            break;
        }
        // Frame record layout: [saved bp][return address].
        let return_addr = unsafe { *((bp + core::mem::size_of::<usize>()) as *const usize) };
        if return_addr == 0 || !likely_valid(return_addr) {
            break;
        }
        if skipped < SKIP_TOP {
            skipped += 1;
        } else {
            frames[count] = return_addr;
            count += 1;
        }
        let saved_bp = unsafe { *(bp as *const usize) };
        // The chain must move toward the stack base.
        if saved_bp <= bp {
            break;
        }
        bp = saved_bp;
    }
    count
}

#[cfg(target_arch = "x86_64")]
fn frame_pointer() -> usize {
    let bp: usize;
    // SAFETY: reading a register has no side effects.
    unsafe { core::arch::asm!("mov {}, rbp", out(reg) bp) };
    bp
}

#[cfg(target_arch = "aarch64")]
fn frame_pointer() -> usize {
    let bp: usize;
    // SAFETY: reading a register has no side effects.
    unsafe { core::arch::asm!("mov {}, x29", out(reg) bp) };
    bp
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn frame_pointer() -> usize {
    0
}
