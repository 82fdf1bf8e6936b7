// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Definitions shared by every rtrace role: the binary packet protocol
//! spoken over the pre-processor pipe, the record model it transports, and
//! the text report format the post-processor reads and writes.

pub mod format;
pub mod header;
pub mod output;
pub mod parse;
pub mod proto;
pub mod record;

/// Template of the pre-processor named pipe path; the target pid is
/// appended.
pub const PIPE_PATH_PATTERN: &str = "/tmp/rtrace-";

/// Binary trace files are named `<pid>-<n>.rtrace`.
pub const BINARY_FILE_SUFFIX: &str = "rtrace";

/// Text reports are named `<pid>-<n>.rtrace.txt`.
pub const TEXT_FILE_SUFFIX: &str = "rtrace.txt";

/// Origin tag written into process-info records produced by this tool.
pub const TRACE_ORIGIN: &str = concat!("rtrace-", env!("CARGO_PKG_VERSION"));

/// Returns the pre-processor pipe path for the given pid.
pub fn pipe_path(pid: u32) -> String {
    format!("{PIPE_PATH_PATTERN}{pid}")
}

/// Environment variables recognized by the tracer module.
pub mod env {
    /// Set by the pre-processor once the rest of the environment is staged;
    /// the tracer refuses to initialize before it appears.
    pub const READY: &str = "SP_RTRACE_READY";
    pub const START_DIR: &str = "SP_RTRACE_START_DIR";
    pub const OUTPUT_DIR: &str = "SP_RTRACE_OUTPUT_DIR";
    pub const BACKTRACE_DEPTH: &str = "SP_RTRACE_BACKTRACE_DEPTH";
    pub const BACKTRACE_ALL: &str = "SP_RTRACE_BACKTRACE_ALL";
    pub const DISABLE_TIMESTAMPS: &str = "SP_RTRACE_DISABLE_TIMESTAMPS";
    pub const DISABLE_PACKET_BUFFERING: &str = "SP_RTRACE_DISABLE_PACKET_BUFFERING";
    pub const MANAGE_PREPROC: &str = "SP_RTRACE_MANAGE_PREPROC";
    pub const POSTPROC: &str = "SP_RTRACE_POSTPROC";
    pub const TOGGLE_SIGNAL: &str = "SP_RTRACE_TOGGLE_SIGNAL";
    pub const LIBUNWIND: &str = "SP_RTRACE_LIBUNWIND";
    pub const MONITOR_SIZE: &str = "SP_RTRACE_MONITOR_SIZE";
    pub const START: &str = "SP_RTRACE_START";
}
