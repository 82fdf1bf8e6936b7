// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical text report writer. Emits exactly the forms the parser
//! accepts, preserving call indices and comment positions, so a written
//! report parses back into an equal model.

use crate::data::{Call, TraceData};
use crate::leaks_sort::{aggregate, LeakSort};
use chrono::{Local, TimeZone};
use rtrace_common::format;
use rtrace_common::header::{Field, Header};
use rtrace_common::proto;
use rtrace_common::record::{CallKind, HeapInfo};
use std::io::{self, Write};

/// Writer-side options: whether to group calls by backtrace, in which
/// order, and which filter mask to record in the header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    pub compress: bool,
    pub sort: LeakSort,
    /// Filter mask reflecting the transforms applied this run, merged
    /// with the permanent bits carried over from the input.
    pub filter_mask: u32,
}

fn build_header(data: &TraceData, filter_mask: u32) -> Header {
    let mut header = Header::default();
    let (vmajor, vminor) = match &data.handshake {
        Some(hs) => (hs.vmajor, hs.vminor),
        None => (proto::VERSION_MAJOR, proto::VERSION_MINOR),
    };
    header.set(Field::Version, Some(format!("{vmajor}.{vminor}")));
    if let Some(hs) = &data.handshake {
        if !hs.arch.is_empty() {
            header.set(Field::Arch, Some(hs.arch.clone()));
        }
    }
    if let Some(pinfo) = &data.pinfo {
        let timestamp = if pinfo.timestamp_sec != 0 {
            Local
                .timestamp_opt(pinfo.timestamp_sec as i64, 0)
                .earliest()
        } else {
            Some(Local::now())
        };
        if let Some(timestamp) = timestamp {
            header.set(
                Field::Timestamp,
                Some(
                    timestamp
                        .format(crate::parse_text::HEADER_TIME_FORMAT)
                        .to_string(),
                ),
            );
        }
        if !pinfo.name.is_empty() {
            header.set(Field::Process, Some(pinfo.name.clone()));
        }
        header.set(Field::Pid, Some(pinfo.pid.to_string()));
        if pinfo.backtrace_depth >= 0 {
            header.set(
                Field::BacktraceDepth,
                Some(pinfo.backtrace_depth.to_string()),
            );
        }
        if !pinfo.trace_origin.is_empty() {
            header.set(Field::Origin, Some(pinfo.trace_origin.clone()));
        }
    }
    header.set_filter(filter_mask);
    header
}

fn write_heap_information(w: &mut impl Write, hinfo: &HeapInfo) -> io::Result<()> {
    writeln!(w, "## heap status information:")?;
    writeln!(w, "##   heap bottom 0x{:x}", hinfo.heap_bottom)?;
    writeln!(w, "##   heap top 0x{:x}", hinfo.heap_top)?;
    writeln!(w, "##   lowest block 0x{:x}", hinfo.lowest_block)?;
    writeln!(w, "##   highest block 0x{:x}", hinfo.highest_block)?;
    writeln!(w, "##   non-mapped space allocated from system {}", hinfo.arena)?;
    writeln!(w, "##   number of free chunks {}", hinfo.ordblks)?;
    writeln!(w, "##   number of fastbin blocks {}", hinfo.smblks)?;
    writeln!(w, "##   number of mapped regions {}", hinfo.hblks)?;
    writeln!(w, "##   space in mapped regions {}", hinfo.hblkhd)?;
    writeln!(w, "##   maximum total allocated space {}", hinfo.usmblks)?;
    writeln!(
        w,
        "##   space available in freed fastbin blocks {}",
        hinfo.fsmblks
    )?;
    writeln!(w, "##   total allocated space {}", hinfo.uordblks)?;
    writeln!(w, "##   total free space {}", hinfo.fordblks)?;
    writeln!(
        w,
        "##   top-most, releasable (via malloc_trim) space {}",
        hinfo.keepcost
    )
}

/// Tracks the comment list position so comments keep their place relative
/// to the call indices.
struct CommentCursor {
    next: usize,
}

impl CommentCursor {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn write_before(
        &mut self,
        w: &mut impl Write,
        data: &TraceData,
        call_index: u32,
    ) -> io::Result<()> {
        while let Some(comment) = data.comments.get(self.next) {
            if comment.index >= call_index {
                break;
            }
            format::print_comment(w, &comment.text)?;
            self.next += 1;
        }
        Ok(())
    }

    fn write_rest(&mut self, w: &mut impl Write, data: &TraceData) -> io::Result<()> {
        while let Some(comment) = data.comments.get(self.next) {
            format::print_comment(w, &comment.text)?;
            self.next += 1;
        }
        Ok(())
    }
}

fn resource_annotation<'a>(data: &'a TraceData, call: &Call) -> Option<&'a str> {
    let id = call.res_type_id()?;
    let resource = data.resource_by_id(id)?;
    if resource.hidden {
        None
    } else {
        Some(resource.info.type_name.as_str())
    }
}

fn write_call_record(
    w: &mut impl Write,
    data: &TraceData,
    cursor: &mut CommentCursor,
    call: &Call,
) -> io::Result<()> {
    cursor.write_before(w, data, call.record.index)?;
    format::print_call(w, &call.record, resource_annotation(data, call))?;
    format::print_args(w, &call.args)?;
    Ok(())
}

/// Writes the environment part of the report: header, heap information,
/// module infos, context and resource registries and memory maps.
fn write_environment(
    w: &mut impl Write,
    data: &TraceData,
    options: &ReportOptions,
) -> io::Result<()> {
    let header = build_header(data, options.filter_mask);
    format::print_header(w, &header)?;

    if let Some(hinfo) = &data.hinfo {
        write_heap_information(w, hinfo)?;
    }
    for minfo in &data.minfo {
        writeln!(
            w,
            "## tracing module: [{:x}] {} ({}.{})",
            minfo.id, minfo.name, minfo.vmajor, minfo.vminor
        )?;
    }
    for context in &data.contexts {
        format::print_context(w, context)?;
    }
    for resource in &data.resources {
        format::print_resource(w, &resource.info)?;
    }
    for mmap in &data.mmaps {
        format::print_mmap(w, mmap)?;
    }
    Ok(())
}

fn write_plain_calls(
    w: &mut impl Write,
    data: &TraceData,
    cursor: &mut CommentCursor,
) -> io::Result<()> {
    for call in data.calls.values() {
        write_call_record(w, data, cursor, call)?;
        if let Some(trace) = call.trace.and_then(|id| data.traces.get(id)) {
            format::print_trace(w, trace.frames(), trace.resolved())?;
        }
    }
    Ok(())
}

fn write_compressed_calls(
    w: &mut impl Write,
    data: &TraceData,
    cursor: &mut CommentCursor,
    sort: LeakSort,
) -> io::Result<()> {
    for group in aggregate(data, sort) {
        let Some(trace) = data.traces.get(group.trace) else {
            continue;
        };
        for seq in trace.calls() {
            if let Some(call) = data.calls.get(&seq) {
                write_call_record(w, data, cursor, call)?;
            }
        }
        writeln!(
            w,
            "# allocation summary: {} block(s) with total size {}",
            group.leak_count, group.leak_size
        )?;
        format::print_trace(w, trace.frames(), trace.resolved())?;
    }
    Ok(())
}

/// Writes the complete report.
pub fn write_report(
    w: &mut impl Write,
    data: &TraceData,
    options: &ReportOptions,
) -> io::Result<()> {
    write_environment(w, data, options)?;
    let mut cursor = CommentCursor::new();
    if options.compress {
        write_compressed_calls(w, data, &mut cursor, options.sort)?;
    } else {
        write_plain_calls(w, data, &mut cursor)?;
    }
    cursor.write_rest(w, data)?;
    for attachment in &data.attachments {
        format::print_attachment(w, attachment)?;
    }
    Ok(())
}

/// Appends the per-resource leak totals as comment records.
pub fn write_leak_summary(w: &mut impl Write, data: &TraceData) -> io::Result<()> {
    for resource in &data.resources {
        let mut count = 0u64;
        let mut total = 0u64;
        for call in data.calls.values() {
            if call.record.kind == CallKind::Alloc
                && call.res_type_id() == Some(resource.info.id)
            {
                count += 1;
                total += call.record.res_size as u64;
            }
        }
        writeln!(
            w,
            "# Resource - {} ({}):",
            resource.info.type_name, resource.info.desc
        )?;
        writeln!(
            w,
            "# {count} block(s) leaked with total size of {total} bytes"
        )?;
    }
    Ok(())
}
