// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Text report parser.
//!
//! Lines are matched by the shared record grammar; a call record collects
//! the trace frames and argument lines that follow it until a blank line
//! or any non-trace, non-argument record closes it. Consecutive call
//! records without an intervening backtrace share the next backtrace,
//! which is how compressed reports parse back into the grouped model.

use crate::data::{Seq, TraceData};
use chrono::{Local, NaiveDateTime, TimeZone};
use rtrace_common::header::{Field, Header};
use rtrace_common::parse::{parse_record, Record};
use rtrace_common::proto::Handshake;
use rtrace_common::record::{
    ArgRecord, FrameRecord, ProcessInfo, ResTypeRef,
};
use std::io::BufRead;
use tracing::warn;

/// Timestamp format of the report header.
pub const HEADER_TIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

fn parse_header(data: &mut TraceData, line: &str) {
    let header = Header::parse(line);

    let mut handshake = Handshake::new(header.get(Field::Arch).unwrap_or(""));
    if let Some((major, minor)) = header
        .get(Field::Version)
        .and_then(|v| v.split_once('.'))
        .and_then(|(ma, mi)| Some((ma.parse().ok()?, mi.parse().ok()?)))
    {
        handshake.vmajor = major;
        handshake.vminor = minor;
    }

    let mut pinfo = ProcessInfo {
        pid: 0,
        timestamp_sec: 0,
        timestamp_usec: 0,
        backtrace_depth: -1,
        name: String::new(),
        trace_origin: String::new(),
    };
    if let Some(timestamp) = header.get(Field::Timestamp) {
        if let Ok(naive) = NaiveDateTime::parse_from_str(timestamp, HEADER_TIME_FORMAT) {
            if let Some(local) = Local.from_local_datetime(&naive).earliest() {
                pinfo.timestamp_sec = local.timestamp() as u32;
            }
        }
    }
    if let Some(process) = header.get(Field::Process) {
        pinfo.name = process.to_string();
    }
    if let Some(origin) = header.get(Field::Origin) {
        pinfo.trace_origin = origin.to_string();
    }
    if let Some(pid) = header.get(Field::Pid) {
        pinfo.pid = pid.parse().unwrap_or(0);
    }
    if let Some(depth) = header.get(Field::BacktraceDepth) {
        pinfo.backtrace_depth = depth.parse().unwrap_or(-1);
    }
    data.filter = header.filter();
    data.handshake = Some(handshake);
    data.pinfo = Some(pinfo);
}

struct TextParser {
    data: TraceData,
    /// Calls waiting for their shared backtrace.
    pending: Vec<Seq>,
    frames: Vec<FrameRecord>,
    args: Vec<ArgRecord>,
    /// Index of the last seen call, used to anchor comment ordering.
    comment_index: u32,
}

impl TextParser {
    fn new() -> Self {
        Self {
            data: TraceData::new(),
            pending: Vec::new(),
            frames: Vec::new(),
            args: Vec::new(),
            comment_index: 0,
        }
    }

    fn flush_args(&mut self) {
        if self.args.is_empty() {
            return;
        }
        let args = std::mem::take(&mut self.args);
        if let Some(seq) = self.pending.last() {
            if let Some(call) = self.data.calls.get_mut(seq) {
                call.args = args;
            }
        }
    }

    /// Assigns the collected frames to every pending call and clears both.
    fn flush_trace(&mut self) {
        let frames = std::mem::take(&mut self.frames);
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return;
        }
        let addrs: Vec<u64> = frames.iter().map(|f| f.addr).collect();
        let resolved = if frames.iter().any(|f| f.name.is_some()) {
            Some(frames.into_iter().map(|f| f.name).collect())
        } else {
            None
        };
        self.data.set_calls_trace(&pending, addrs, resolved);
    }

    fn process_line(&mut self, line: &str) {
        // Temporary comments are regenerated on output, never preserved.
        if line.starts_with("# ") {
            return;
        }
        if line.trim_end().is_empty() {
            self.flush_args();
            self.flush_trace();
            return;
        }

        match parse_record(line) {
            Record::Frame(frame) => {
                if self.pending.is_empty() {
                    warn!("found a backtrace record without a preceding function call record");
                } else {
                    self.frames.push(frame);
                }
            }
            Record::Arg(arg) => {
                if self.pending.is_empty() {
                    warn!("found a function argument record without a preceding function call record");
                } else {
                    self.args.push(arg);
                }
            }
            Record::Call(mut record) => {
                self.flush_args();
                // A buffered backtrace closes the previous group; without
                // one the new call joins it and shares the next backtrace.
                if !self.frames.is_empty() {
                    self.flush_trace();
                }
                record.res_type = match record.res_type {
                    ResTypeRef::Name(name) => match self.data.resource_by_name(&name) {
                        Some(res) => ResTypeRef::Id(res.info.id),
                        None => {
                            warn!("call #{} references unknown resource type {name}", record.index);
                            ResTypeRef::None
                        }
                    },
                    // Without an annotation the stream has a single
                    // resource type; bind to it when registered.
                    ResTypeRef::None => match self.data.resources.first() {
                        Some(res) => ResTypeRef::Id(res.info.id),
                        None => ResTypeRef::None,
                    },
                    other => other,
                };
                self.comment_index = record.index;
                let seq = self.data.add_call(record);
                self.pending.push(seq);
            }
            other => {
                self.flush_args();
                self.flush_trace();
                match other {
                    Record::Mmap(mmap) => self.data.add_mmap(mmap),
                    Record::Context(context) => self.data.contexts.push(context),
                    Record::Resource(resource) => self.data.add_resource(resource),
                    Record::Attachment(attachment) => self.data.attachments.push(attachment),
                    Record::Comment(text) => {
                        self.data.comments.push(crate::data::Comment {
                            index: self.comment_index,
                            text,
                        });
                    }
                    Record::Frame(_) | Record::Arg(_) | Record::Call(_) => unreachable!(),
                }
            }
        }
    }
}

/// Parses a complete text report, header line included.
pub fn parse_stream(input: &mut impl BufRead) -> anyhow::Result<TraceData> {
    let mut parser = TextParser::new();

    let mut header_line = String::new();
    input.read_line(&mut header_line)?;
    if header_line.is_empty() {
        return Ok(parser.data);
    }
    parse_header(&mut parser.data, &header_line);

    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        parser.process_line(&line);
    }
    parser.flush_args();
    parser.flush_trace();

    parser.data.sort_calls_by_time();
    Ok(parser.data)
}
