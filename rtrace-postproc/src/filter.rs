// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transform pipeline. The transforms are applied in a fixed order:
//! backtrace-depth trim, resource-type filter, leak filter, index
//! include/exclude, context filter, heap low/high scan, resource
//! visibility.

use crate::data::{Seq, TraceData};
use anyhow::Context;
use rtrace_common::record::{CallKind, Pointer};
use std::collections::{BTreeSet, HashMap};
use std::io::BufRead;
use std::path::Path;

/// Clamps every backtrace to `depth` frames in place and records the new
/// depth in the process info.
pub fn trim_backtraces(data: &mut TraceData, depth: u32) {
    if let Some(pinfo) = data.pinfo.as_mut() {
        pinfo.backtrace_depth = depth as i32;
    }
    let ids: Vec<_> = data.traces.iter().map(|(id, _)| id).collect();
    for id in ids {
        if let Some(trace) = data.traces.get_mut(id) {
            trace.trim(depth as usize);
        }
    }
}

/// Removes resource types whose bit is not in `mask`, and the calls that
/// reference them.
pub fn filter_resource(data: &mut TraceData, mask: u32) {
    data.resources
        .retain(|res| res.info.bit() & mask != 0);
    let doomed: Vec<Seq> = data
        .calls
        .iter()
        .filter(|(_, call)| match call.res_type_id() {
            Some(id) => (1 << (id - 1)) & mask == 0,
            None => false,
        })
        .map(|(seq, _)| *seq)
        .collect();
    for seq in doomed {
        data.remove_call(seq);
    }
}

/// Removes context registry records not matching `mask`, then keeps calls
/// whose context intersects it. A zero mask keeps only context-free calls.
pub fn filter_context(data: &mut TraceData, mask: u32) {
    data.contexts.retain(|context| context.id & mask != 0);
    let doomed: Vec<Seq> = data
        .calls
        .iter()
        .filter(|(_, call)| {
            let context = call.record.context;
            (mask != 0 && context & mask == 0) || (mask == 0 && context != 0)
        })
        .map(|(seq, _)| *seq)
        .collect();
    for seq in doomed {
        data.remove_call(seq);
    }
}

/// Cancels matched allocation/release pairs, leaving the net-unmatched
/// allocations.
///
/// Allocations of a reference-counted resource stack on the live entry
/// instead of shadowing it; each release drops the count and the
/// allocation is removed only when it reaches zero. Release events are
/// never retained. Resource types without the `refcount` flag collapse to
/// 1-to-1 matching.
pub fn filter_leaks(data: &mut TraceData) {
    struct LiveRes {
        seq: Seq,
        ref_count: u32,
    }
    let mut live: HashMap<(u32, Pointer), LiveRes> = HashMap::new();

    let seqs: Vec<Seq> = data.calls.keys().copied().collect();
    for seq in seqs {
        let Some(call) = data.calls.get(&seq) else {
            continue;
        };
        let res_type = call.res_type_id().unwrap_or(0);
        let refcounted = data
            .resource_by_id(res_type)
            .is_some_and(|res| res.info.is_refcounted());
        let key = (res_type, call.record.res_id);
        match call.record.kind {
            CallKind::Alloc => {
                if refcounted {
                    if let Some(entry) = live.get_mut(&key) {
                        entry.ref_count += 1;
                        data.remove_call(seq);
                        continue;
                    }
                }
                // A plain re-allocation of a live id shadows the stored
                // entry; the earlier call stays in the event list.
                live.insert(key, LiveRes { seq, ref_count: 1 });
            }
            CallKind::Free => {
                if let Some(entry) = live.get_mut(&key) {
                    entry.ref_count -= 1;
                    if entry.ref_count == 0 || !refcounted {
                        let matched = entry.seq;
                        live.remove(&key);
                        data.remove_call(matched);
                    }
                }
                // Release events are never retained.
                data.remove_call(seq);
            }
        }
    }
}

/// Loads one call index per line; lines that do not start with a number
/// are skipped.
pub fn load_index_file(path: &Path) -> anyhow::Result<BTreeSet<u32>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open event index file {}", path.display()))?;
    let mut indices = BTreeSet::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let text = line.trim();
        let parsed = if let Some(hex) = text.strip_prefix("0x") {
            u32::from_str_radix(hex, 16).ok()
        } else {
            text.parse().ok()
        };
        if let Some(index) = parsed {
            indices.insert(index);
        }
    }
    Ok(indices)
}

/// Keeps (include) or drops (exclude) the calls whose index is listed.
pub fn filter_index(data: &mut TraceData, indices: &BTreeSet<u32>, include: bool) {
    let doomed: Vec<Seq> = data
        .calls
        .iter()
        .filter(|(_, call)| indices.contains(&call.record.index) != include)
        .map(|(seq, _)| *seq)
        .collect();
    for seq in doomed {
        data.remove_call(seq);
    }
}

/// Recomputes the lowest and highest allocation blocks over the surviving
/// allocation calls.
pub fn find_lowhigh_blocks(data: &mut TraceData) {
    let Some(hinfo) = data.hinfo.as_mut() else {
        return;
    };
    hinfo.lowest_block = Pointer::MAX;
    hinfo.highest_block = 0;
    for call in data.calls.values() {
        if call.record.kind == CallKind::Alloc {
            hinfo.lowest_block = hinfo.lowest_block.min(call.record.res_id);
            hinfo.highest_block = hinfo.highest_block.max(call.record.res_id);
        }
    }
}

/// When a single resource type remains it is renumbered to 1 and hidden,
/// so the writer omits the annotation from call records.
pub fn update_resource_visibility(data: &mut TraceData) {
    if let [res] = data.resources.as_mut_slice() {
        let old_id = res.info.id;
        res.hidden = true;
        res.info.id = 1;
        if old_id != 1 {
            for call in data.calls.values_mut() {
                if call.res_type_id() == Some(old_id) {
                    call.record.res_type = rtrace_common::record::ResTypeRef::Id(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtrace_common::record::{resource_flags, CallRecord, ResTypeRef, ResourceInfo};

    fn data_with_resource(flags: u32) -> TraceData {
        let mut data = TraceData::new();
        data.add_resource(ResourceInfo {
            id: 1,
            type_name: "memory".into(),
            desc: "memory allocation in bytes".into(),
            flags,
        });
        data
    }

    fn push_call(
        data: &mut TraceData,
        index: u32,
        kind: CallKind,
        res_id: Pointer,
        res_size: u32,
    ) -> Seq {
        push_call_ctx(data, index, kind, res_id, res_size, 0)
    }

    fn push_call_ctx(
        data: &mut TraceData,
        index: u32,
        kind: CallKind,
        res_id: Pointer,
        res_size: u32,
        context: u32,
    ) -> Seq {
        data.add_call(CallRecord {
            index,
            context,
            timestamp: 0,
            kind,
            name: (if kind == CallKind::Alloc { "malloc" } else { "free" }).into(),
            res_type: ResTypeRef::Id(1),
            res_id,
            res_size,
        })
    }

    fn surviving_indices(data: &TraceData) -> Vec<u32> {
        data.calls.values().map(|c| c.record.index).collect()
    }

    #[test]
    fn test_leak_filter_pairwise() {
        let mut data = data_with_resource(0);
        push_call(&mut data, 1, CallKind::Alloc, 0x10, 8);
        push_call(&mut data, 2, CallKind::Alloc, 0x20, 16);
        push_call(&mut data, 3, CallKind::Free, 0x10, 0);

        filter_leaks(&mut data);

        assert_eq!(vec![2], surviving_indices(&data));
        let survivor = data.calls.values().next().unwrap();
        assert_eq!(0x20, survivor.record.res_id);
        assert_eq!(16, survivor.record.res_size);
    }

    #[test]
    fn test_leak_filter_refcounted_collapse() {
        let mut data = data_with_resource(resource_flags::REFCOUNT);
        push_call(&mut data, 1, CallKind::Alloc, 0x1, 4);
        push_call(&mut data, 2, CallKind::Alloc, 0x1, 4);
        push_call(&mut data, 3, CallKind::Free, 0x1, 0);

        filter_leaks(&mut data);

        // The repeated ref stacked on the first allocation; one release
        // only dropped the count to one, so the first allocation survives.
        assert_eq!(vec![1], surviving_indices(&data));
    }

    #[test]
    fn test_leak_filter_refcounted_full_release() {
        let mut data = data_with_resource(resource_flags::REFCOUNT);
        push_call(&mut data, 1, CallKind::Alloc, 0x1, 4);
        push_call(&mut data, 2, CallKind::Alloc, 0x1, 4);
        push_call(&mut data, 3, CallKind::Free, 0x1, 0);
        push_call(&mut data, 4, CallKind::Free, 0x1, 0);

        filter_leaks(&mut data);
        assert!(data.calls.is_empty());
    }

    #[test]
    fn test_leak_filter_is_idempotent() {
        let mut data = data_with_resource(0);
        push_call(&mut data, 1, CallKind::Alloc, 0x10, 8);
        push_call(&mut data, 2, CallKind::Free, 0x10, 0);
        push_call(&mut data, 3, CallKind::Alloc, 0x30, 24);

        filter_leaks(&mut data);
        let first = surviving_indices(&data);
        filter_leaks(&mut data);
        assert_eq!(first, surviving_indices(&data));
        assert_eq!(vec![3], first);
    }

    #[test]
    fn test_leak_filter_releases_backtraces() {
        let mut data = data_with_resource(0);
        let a = push_call(&mut data, 1, CallKind::Alloc, 0x10, 8);
        let f = push_call(&mut data, 2, CallKind::Free, 0x10, 0);
        data.set_calls_trace(&[a], vec![0x1, 0x2], None);
        data.set_calls_trace(&[f], vec![0x3], None);

        filter_leaks(&mut data);
        assert!(data.calls.is_empty());
        assert!(data.traces.is_empty());
    }

    #[test]
    fn test_free_without_alloc_is_dropped() {
        let mut data = data_with_resource(0);
        push_call(&mut data, 1, CallKind::Free, 0x99, 0);
        filter_leaks(&mut data);
        assert!(data.calls.is_empty());
    }

    #[test]
    fn test_context_filter() {
        let mut data = data_with_resource(0);
        data.contexts.push(rtrace_common::record::ContextInfo {
            id: 0b01,
            name: "load".into(),
        });
        data.contexts.push(rtrace_common::record::ContextInfo {
            id: 0b10,
            name: "render".into(),
        });
        push_call_ctx(&mut data, 1, CallKind::Alloc, 0x10, 8, 0b01);
        push_call_ctx(&mut data, 2, CallKind::Alloc, 0x20, 8, 0b10);
        push_call_ctx(&mut data, 3, CallKind::Alloc, 0x30, 8, 0b11);

        filter_context(&mut data, 0b10);

        assert_eq!(vec![2, 3], surviving_indices(&data));
        assert_eq!(1, data.contexts.len());
        assert_eq!("render", data.contexts[0].name);
    }

    #[test]
    fn test_context_filter_zero_mask_keeps_plain_calls() {
        let mut data = data_with_resource(0);
        push_call_ctx(&mut data, 1, CallKind::Alloc, 0x10, 8, 0);
        push_call_ctx(&mut data, 2, CallKind::Alloc, 0x20, 8, 0b1);
        filter_context(&mut data, 0);
        assert_eq!(vec![1], surviving_indices(&data));
    }

    #[test]
    fn test_resource_filter() {
        let mut data = data_with_resource(0);
        data.add_resource(ResourceInfo {
            id: 2,
            type_name: "fd".into(),
            desc: "file descriptor".into(),
            flags: 0,
        });
        push_call(&mut data, 1, CallKind::Alloc, 0x10, 8);
        let fd_call = data.add_call(CallRecord {
            index: 2,
            context: 0,
            timestamp: 0,
            kind: CallKind::Alloc,
            name: "open".into(),
            res_type: ResTypeRef::Id(2),
            res_id: 7,
            res_size: 1,
        });
        let _ = fd_call;

        filter_resource(&mut data, 0b10);
        assert_eq!(vec![2], surviving_indices(&data));
        assert_eq!(1, data.resources.len());
        assert_eq!("fd", data.resources[0].info.type_name);
    }

    #[test]
    fn test_index_filters() {
        let mut data = data_with_resource(0);
        for index in 1..=5 {
            push_call(&mut data, index, CallKind::Alloc, 0x10 * index as u64, 8);
        }
        let picked = BTreeSet::from([2, 4]);

        filter_index(&mut data, &picked, true);
        assert_eq!(vec![2, 4], surviving_indices(&data));

        let mut data = data_with_resource(0);
        for index in 1..=5 {
            push_call(&mut data, index, CallKind::Alloc, 0x10 * index as u64, 8);
        }
        filter_index(&mut data, &picked, false);
        assert_eq!(vec![1, 3, 5], surviving_indices(&data));
    }

    #[test]
    fn test_load_index_file_skips_junk() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "12").unwrap();
        writeln!(file, "0x1f").unwrap();
        writeln!(file, "# not an index").unwrap();
        writeln!(file, "  7  ").unwrap();
        file.flush().unwrap();

        let indices = load_index_file(file.path()).unwrap();
        assert_eq!(BTreeSet::from([7, 12, 31]), indices);
    }

    #[test]
    fn test_trim_backtraces() {
        let mut data = data_with_resource(0);
        let a = push_call(&mut data, 1, CallKind::Alloc, 0x10, 8);
        data.set_calls_trace(&[a], vec![1, 2, 3, 4, 5], None);

        trim_backtraces(&mut data, 3);
        let trace = data.traces.get(data.calls[&a].trace.unwrap()).unwrap();
        assert_eq!(&[1, 2, 3], trace.frames());

        // Trimming deeper than the trace leaves it untouched.
        trim_backtraces(&mut data, 10);
        let trace = data.traces.get(data.calls[&a].trace.unwrap()).unwrap();
        assert_eq!(3, trace.frames().len());
    }

    #[test]
    fn test_lowhigh_blocks() {
        let mut data = data_with_resource(0);
        data.hinfo = Some(Default::default());
        push_call(&mut data, 1, CallKind::Alloc, 0x500, 8);
        push_call(&mut data, 2, CallKind::Alloc, 0x100, 8);
        push_call(&mut data, 3, CallKind::Alloc, 0x900, 8);

        find_lowhigh_blocks(&mut data);
        let hinfo = data.hinfo.as_ref().unwrap();
        assert_eq!(0x100, hinfo.lowest_block);
        assert_eq!(0x900, hinfo.highest_block);
    }

    #[test]
    fn test_single_resource_hidden() {
        let mut data = TraceData::new();
        data.add_resource(ResourceInfo {
            id: 3,
            type_name: "memory".into(),
            desc: "bytes".into(),
            flags: 0,
        });
        let seq = data.add_call(CallRecord {
            index: 1,
            context: 0,
            timestamp: 0,
            kind: CallKind::Alloc,
            name: "malloc".into(),
            res_type: ResTypeRef::Id(3),
            res_id: 0x10,
            res_size: 8,
        });

        update_resource_visibility(&mut data);
        assert!(data.resources[0].hidden);
        assert_eq!(1, data.resources[0].info.id);
        assert_eq!(Some(1), data.calls[&seq].res_type_id());
    }
}
