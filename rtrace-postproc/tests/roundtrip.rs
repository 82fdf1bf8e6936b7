// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end checks over the public pipeline: binary stream in, model,
//! transforms, text report out, and back again.

use rtrace_common::header::filter_mask;
use rtrace_common::proto::{Handshake, PacketType, PayloadWriter};
use rtrace_common::record::CallKind;
use rtrace_postproc::data::TraceData;
use rtrace_postproc::leaks_sort::LeakSort;
use rtrace_postproc::writer::{write_report, ReportOptions};
use rtrace_postproc::{filter, parse_binary, parse_text};

struct StreamBuilder {
    buf: Vec<u8>,
}

impl StreamBuilder {
    fn new() -> Self {
        let mut buf = vec![0u8; 64];
        let size = Handshake::new(std::env::consts::ARCH)
            .encode(&mut buf)
            .unwrap();
        buf.truncate(size);
        Self { buf }
    }

    fn packet(mut self, ptype: PacketType, fill: impl FnOnce(&mut PayloadWriter)) -> Self {
        let mut scratch = vec![0u8; 4096];
        let mut w = PayloadWriter::new(&mut scratch);
        let at = w.start_packet(ptype).unwrap();
        fill(&mut w);
        w.finish_packet(at);
        let written = w.written();
        self.buf.extend_from_slice(&scratch[..written]);
        self
    }

    fn process_info(self, pid: u32) -> Self {
        self.packet(PacketType::ProcessInfo, |w| {
            w.put_u32(pid).unwrap();
            w.put_u32(1_700_000_000).unwrap();
            w.put_u32(0).unwrap();
            w.put_u32(10).unwrap();
            w.put_str("sample").unwrap();
        })
    }

    fn module(self, id: u32, name: &str) -> Self {
        self.packet(PacketType::ModuleInfo, |w| {
            w.put_u32(id).unwrap();
            w.put_u32(1 << 16).unwrap();
            w.put_str(name).unwrap();
        })
    }

    fn resource(self, id: u32, name: &str, flags: u32) -> Self {
        self.packet(PacketType::ResourceRegistry, |w| {
            w.put_u32(id).unwrap();
            w.put_u32(flags).unwrap();
            w.put_str(name).unwrap();
            w.put_str("traced resource").unwrap();
        })
    }

    fn call(self, kind: CallKind, res_type: u32, res_id: u64, size: u32) -> Self {
        self.packet(PacketType::FunctionCall, |w| {
            w.put_u32(res_type).unwrap();
            w.put_u32(0).unwrap();
            w.put_u32(0).unwrap();
            w.put_u32(kind as u32).unwrap();
            w.put_str(if kind == CallKind::Alloc { "malloc" } else { "free" })
                .unwrap();
            w.put_u32(size).unwrap();
            w.put_pointer(res_id).unwrap();
        })
    }

    fn backtrace(self, frames: &[u64]) -> Self {
        self.packet(PacketType::Backtrace, |w| {
            w.put_u32(frames.len() as u32).unwrap();
            for frame in frames {
                w.put_pointer(*frame).unwrap();
            }
        })
    }

    fn parse(self) -> TraceData {
        parse_binary::parse_stream(&mut self.buf.as_slice()).unwrap()
    }
}

fn render(data: &TraceData, options: &ReportOptions) -> String {
    let mut out = Vec::new();
    write_report(&mut out, data, options).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn binary_to_text_roundtrip_is_a_fixed_point() {
    // Scenario: H, MI(mem,1.0), PI(pid=42), RR(1,mem), FC#1 alloc 0x100/8
    // type=1, BT[0xa,0xb].
    let mut data = StreamBuilder::new()
        .module(1, "mem")
        .process_info(42)
        .resource(1, "memory", 0)
        .call(CallKind::Alloc, 1, 0x100, 8)
        .backtrace(&[0xa, 0xb])
        .parse();
    filter::update_resource_visibility(&mut data);

    let report = render(&data, &ReportOptions::default());
    let mut reparsed = parse_text::parse_stream(&mut report.as_bytes()).unwrap();
    // Visibility is re-derived on every run of the pipeline.
    filter::update_resource_visibility(&mut reparsed);
    let rewritten = render(&reparsed, &ReportOptions::default());
    assert_eq!(report, rewritten);

    assert_eq!(1, reparsed.calls.len());
    let call = reparsed.calls.values().next().unwrap();
    assert_eq!(1, call.record.index);
    assert_eq!(0x100, call.record.res_id);
    let trace = reparsed.traces.get(call.trace.unwrap()).unwrap();
    assert_eq!(&[0xa, 0xb], trace.frames());
}

#[test]
fn binary_conversion_is_deterministic() {
    let build = || {
        StreamBuilder::new()
            .process_info(7)
            .resource(1, "memory", 0)
            .call(CallKind::Alloc, 1, 0x10, 8)
            .backtrace(&[0x1, 0x2, 0x3])
            .call(CallKind::Free, 1, 0x10, 0)
            .backtrace(&[])
            .parse()
    };
    let first = render(&build(), &ReportOptions::default());
    let second = render(&build(), &ReportOptions::default());
    assert_eq!(first, second);
}

#[test]
fn leak_filter_keeps_unmatched_allocation() {
    let mut data = StreamBuilder::new()
        .process_info(1)
        .resource(1, "memory", 0)
        .call(CallKind::Alloc, 1, 0x10, 8)
        .call(CallKind::Alloc, 1, 0x20, 16)
        .call(CallKind::Free, 1, 0x10, 0)
        .parse();

    filter::filter_leaks(&mut data);

    assert_eq!(1, data.calls.len());
    let survivor = data.calls.values().next().unwrap();
    assert_eq!(0x20, survivor.record.res_id);
    assert_eq!(16, survivor.record.res_size);
}

#[test]
fn refcounted_allocations_stack() {
    use rtrace_common::record::resource_flags::REFCOUNT;
    let mut data = StreamBuilder::new()
        .process_info(1)
        .resource(1, "gobject", REFCOUNT)
        .call(CallKind::Alloc, 1, 0x1, 4)
        .call(CallKind::Alloc, 1, 0x1, 4)
        .call(CallKind::Free, 1, 0x1, 0)
        .parse();

    filter::filter_leaks(&mut data);

    // allocs - matched frees = 2 - 1.
    assert_eq!(1, data.calls.len());
    assert_eq!(1, data.calls.values().next().unwrap().record.index);
}

#[test]
fn compression_groups_by_backtrace() {
    let mut data = StreamBuilder::new()
        .process_info(1)
        .resource(1, "memory", 0)
        .call(CallKind::Alloc, 1, 0x10, 10)
        .backtrace(&[0xaa, 0xbb])
        .call(CallKind::Alloc, 1, 0x20, 20)
        .backtrace(&[0xaa, 0xbb])
        .call(CallKind::Alloc, 1, 0x30, 30)
        .backtrace(&[0xaa, 0xbb])
        .parse();
    filter::update_resource_visibility(&mut data);

    let report = render(
        &data,
        &ReportOptions {
            compress: true,
            sort: LeakSort::SizeAsc,
            filter_mask: filter_mask::COMPRESS,
        },
    );
    assert!(report.contains("# allocation summary: 3 block(s) with total size 60\n"));
    // The grouped trace is emitted once, after the summary line.
    assert_eq!(1, report.matches("\t0xaa\n").count());
    let summary_at = report.find("# allocation summary").unwrap();
    let trace_at = report.find("\t0xaa").unwrap();
    assert!(summary_at < trace_at);

    // Re-parsing the compressed report restores the grouped model.
    let reparsed = parse_text::parse_stream(&mut report.as_bytes()).unwrap();
    assert_eq!(3, reparsed.calls.len());
    assert_eq!(1, reparsed.traces.len());
}

#[test]
fn depth_trim_keeps_leading_frames() {
    let mut data = StreamBuilder::new()
        .process_info(1)
        .resource(1, "memory", 0)
        .call(CallKind::Alloc, 1, 0x10, 8)
        .backtrace(&[1, 2, 3, 4, 5])
        .parse();

    let before = data.calls.values().next().unwrap().record.clone();
    filter::trim_backtraces(&mut data, 3);
    let after = data.calls.values().next().unwrap();

    assert_eq!(before, after.record);
    let trace = data.traces.get(after.trace.unwrap()).unwrap();
    assert_eq!(&[1, 2, 3], trace.frames());
    assert_eq!(3, data.pinfo.as_ref().unwrap().backtrace_depth);
}

#[test]
fn context_filter_keeps_intersecting_calls() {
    let mut data = TraceData::new();
    for (index, context) in [(1u32, 0b01u32), (2, 0b10), (3, 0b11)] {
        data.add_call(rtrace_common::record::CallRecord {
            index,
            context,
            timestamp: 0,
            kind: CallKind::Alloc,
            name: "malloc".into(),
            res_type: rtrace_common::record::ResTypeRef::None,
            res_id: index as u64 * 0x10,
            res_size: 8,
        });
    }
    filter::filter_context(&mut data, 0b10);
    let surviving: Vec<u32> = data.calls.values().map(|c| c.record.index).collect();
    assert_eq!(vec![2, 3], surviving);
}

#[test]
fn heap_scan_reflects_surviving_allocations() {
    let mut data = StreamBuilder::new()
        .process_info(1)
        .resource(1, "memory", 0)
        .call(CallKind::Alloc, 1, 0x500, 8)
        .call(CallKind::Alloc, 1, 0x100, 8)
        .call(CallKind::Free, 1, 0x500, 0)
        .packet(PacketType::HeapInfo, |w| {
            w.put_pointer(0x100).unwrap();
            w.put_pointer(0x10000).unwrap();
            for counter in 0..10u32 {
                w.put_u32(counter).unwrap();
            }
        })
        .parse();

    filter::filter_leaks(&mut data);
    filter::find_lowhigh_blocks(&mut data);
    let hinfo = data.hinfo.as_ref().unwrap();
    assert_eq!(0x100, hinfo.lowest_block);
    assert_eq!(0x100, hinfo.highest_block);
}
