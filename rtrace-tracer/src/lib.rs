// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process resource tracer.
//!
//! Built as a cdylib and force-loaded into the target with `LD_PRELOAD`,
//! this crate interposes resource-lifecycle functions, stamps each call
//! with a backtrace and streams binary event packets to the pre-processor
//! pipe. The hot paths run inside wrapped allocation functions and inside
//! a signal handler, so they must not allocate, must not take blocking
//! locks, and must survive re-entry from the stack unwinder; see the
//! module docs of [`runtime`] and [`unwind`] for the discipline.

#![cfg(unix)]

pub mod context;
pub mod filter;
pub mod module;
pub mod modules;
pub mod options;
pub mod runtime;
pub mod scratch;
pub mod unwind;

/// Registers the toggle-signal handler and attempts runtime
/// initialization as soon as the library is mapped. Initialization is
/// retried from the first wrapped call if the environment is not staged
/// yet.
#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static TRACER_CTOR: extern "C" fn() = tracer_ctor;

#[cfg(target_os = "linux")]
extern "C" fn tracer_ctor() {
    runtime::initialize();
    runtime::install_toggle_handler();
}

/// Flushes and closes the pipe when the target exits while tracing.
#[cfg(target_os = "linux")]
#[used]
#[link_section = ".fini_array"]
static TRACER_DTOR: extern "C" fn() = tracer_dtor;

#[cfg(target_os = "linux")]
extern "C" fn tracer_dtor() {
    runtime::shutdown();
}
