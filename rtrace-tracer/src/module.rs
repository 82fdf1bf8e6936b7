// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wrapper-module machinery shared by every tracing module.
//!
//! A module intercepts a family of functions. Its lifecycle is one-way:
//! `Uninitialized` (symbols not resolved yet; allocation-like wrappers
//! serve from the scratch region), `Loaded` (originals resolved but the
//! tracing path not yet safe), `Ready` (events are emitted while tracing
//! is enabled).

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleState {
    Uninitialized = 0,
    /// Symbol resolution in flight; re-entered allocation calls are
    /// served from the scratch region.
    Resolving = 1,
    Loaded = 2,
    Ready = 3,
}

/// Atomic holder of the module lifecycle state.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(ModuleState::Uninitialized as u8))
    }

    pub fn get(&self) -> ModuleState {
        match self.0.load(Ordering::Acquire) {
            0 => ModuleState::Uninitialized,
            1 => ModuleState::Resolving,
            2 => ModuleState::Loaded,
            _ => ModuleState::Ready,
        }
    }

    /// One-way transition; returns false when another thread got there
    /// first.
    pub fn advance(&self, from: ModuleState, to: ModuleState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// One resolved original-function slot. Zero means unresolved, which
/// fails module registration.
pub struct ResolvedSymbol {
    pub name: &'static str,
    pub addr: &'static AtomicUsize,
}

/// Registration record a module hands to the runtime.
pub struct ModuleDecl {
    pub name: &'static str,
    pub vmajor: u16,
    pub vminor: u16,
    /// Flips the module's tracing function table.
    pub enable: fn(bool),
    /// Original-function slots the runtime verifies at registration.
    pub symbols: &'static [ResolvedSymbol],
}

/// Resolves `name` against the next object in the lookup order.
///
/// # Safety
///
/// `name` must be a null-terminated C string literal.
pub unsafe fn resolve_next(name: &'static core::ffi::CStr) -> usize {
    libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_are_one_way() {
        let state = StateCell::new();
        assert_eq!(ModuleState::Uninitialized, state.get());
        assert!(state.advance(ModuleState::Uninitialized, ModuleState::Resolving));
        assert!(state.advance(ModuleState::Resolving, ModuleState::Loaded));
        // A stale transition is refused.
        assert!(!state.advance(ModuleState::Uninitialized, ModuleState::Resolving));
        assert!(state.advance(ModuleState::Loaded, ModuleState::Ready));
        assert_eq!(ModuleState::Ready, state.get());
    }
}
