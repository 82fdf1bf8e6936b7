// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Text report record formatting. The forms written here are exactly the
//! forms [`crate::parse`] accepts, so a written report parses back into an
//! equal model.

use crate::header::Header;
use crate::record::{
    resource_flags, ArgRecord, Attachment, CallKind, CallRecord, ContextInfo, MemoryMap,
    ResourceInfo,
};
use std::io::{self, Write};

pub fn print_header(w: &mut impl Write, header: &Header) -> io::Result<()> {
    w.write_all(header.to_line().as_bytes())
}

pub fn print_mmap(w: &mut impl Write, mmap: &MemoryMap) -> io::Result<()> {
    writeln!(w, ": {} => 0x{:x}-0x{:x}", mmap.module, mmap.from, mmap.to)
}

pub fn print_context(w: &mut impl Write, context: &ContextInfo) -> io::Result<()> {
    writeln!(w, "@ {:x} : {}", context.id, context.name)
}

pub fn print_resource(w: &mut impl Write, resource: &ResourceInfo) -> io::Result<()> {
    write!(
        w,
        "<{:x}> : {} ({})",
        resource.bit(),
        resource.type_name,
        resource.desc
    )?;
    if resource.flags != 0 {
        let tags: Vec<&str> = resource_flags::NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| resource.flags & (1 << bit) != 0)
            .map(|(_, tag)| *tag)
            .collect();
        write!(w, " [{}]", tags.join("|"))?;
    }
    writeln!(w)
}

/// Writes a call record. `res_name` carries the resource annotation to
/// print, already resolved by the caller; a hidden resource type passes
/// `None`.
pub fn print_call(w: &mut impl Write, call: &CallRecord, res_name: Option<&str>) -> io::Result<()> {
    write!(w, "{}. ", call.index)?;
    if call.context != 0 {
        write!(w, "@{:x} ", call.context)?;
    }
    if call.timestamp != 0 {
        let ms = call.timestamp;
        write!(
            w,
            "[{:02}:{:02}:{:02}.{:03}] ",
            ms / 3_600_000,
            ms / 60_000 % 60,
            ms / 1000 % 60,
            ms % 1000
        )?;
    }
    write!(w, "{}", call.name)?;
    if let Some(res_name) = res_name {
        write!(w, "<{res_name}>")?;
    }
    match call.kind {
        CallKind::Alloc => writeln!(w, "({}) = 0x{:x}", call.res_size, call.res_id),
        CallKind::Free => writeln!(w, "(0x{:x})", call.res_id),
    }
}

/// Writes one backtrace frame line.
pub fn print_trace_step(w: &mut impl Write, addr: u64, resolved: Option<&str>) -> io::Result<()> {
    match resolved {
        Some(name) => writeln!(w, "\t0x{addr:x} {name}"),
        None => writeln!(w, "\t0x{addr:x}"),
    }
}

/// Writes a full backtrace followed by the terminating blank line.
pub fn print_trace(
    w: &mut impl Write,
    frames: &[u64],
    resolved: Option<&[Option<String>]>,
) -> io::Result<()> {
    for (idx, addr) in frames.iter().enumerate() {
        let name = resolved.and_then(|names| names.get(idx)).and_then(|n| n.as_deref());
        print_trace_step(w, *addr, name)?;
    }
    writeln!(w)
}

pub fn print_args(w: &mut impl Write, args: &[ArgRecord]) -> io::Result<()> {
    for arg in args {
        writeln!(w, "\t${} = {}", arg.name, arg.value)?;
    }
    Ok(())
}

pub fn print_attachment(w: &mut impl Write, attachment: &Attachment) -> io::Result<()> {
    writeln!(w, "& {} : {}", attachment.name, attachment.path)
}

/// Comments are preserved verbatim; the caller includes any leading `#`.
pub fn print_comment(w: &mut impl Write, text: &str) -> io::Result<()> {
    writeln!(w, "{text}")
}
