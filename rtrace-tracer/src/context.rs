// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Call contexts.
//!
//! A context is a single named bit that wrapped regions of user code push
//! and pop; the bitmask OR of the contexts active on a thread is stamped
//! into every call record that thread emits.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

pub const MAX_CONTEXTS: u32 = 32;

/// Bits handed out so far (bit N set = context N registered).
static REGISTERED: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static CURRENT_MASK: Cell<u32> = const { Cell::new(0) };
}

/// Allocates the next free context bit and reports it to the runtime.
/// Returns 0 when the registry is full.
pub fn create(name: &str) -> u32 {
    let mut registered = REGISTERED.load(Ordering::Relaxed);
    loop {
        let bit_index = registered.trailing_ones();
        if bit_index >= MAX_CONTEXTS {
            return 0;
        }
        let id = 1 << bit_index;
        match REGISTERED.compare_exchange(
            registered,
            registered | id,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                crate::runtime::write_context_registry(id, name);
                return id;
            }
            Err(current) => registered = current,
        }
    }
}

/// Sets the context bit in the calling thread's mask.
pub fn enter(id: u32) {
    let _ = CURRENT_MASK.try_with(|mask| mask.set(mask.get() | id));
}

/// Clears the context bit from the calling thread's mask.
pub fn exit(id: u32) {
    let _ = CURRENT_MASK.try_with(|mask| mask.set(mask.get() & !id));
}

/// Mask stamped into call records emitted by this thread.
#[inline]
pub fn current_mask() -> u32 {
    CURRENT_MASK.try_with(Cell::get).unwrap_or(0)
}
