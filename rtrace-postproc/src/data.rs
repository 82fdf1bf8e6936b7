// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory event model.
//!
//! `TraceData` owns every entity parsed from a stream except backtraces,
//! which live in the `BacktraceIndex` slab. Calls refer to backtraces by
//! `TraceId`; each backtrace keeps the set of referring call sequence
//! numbers and a reference count, and is released when the count reaches
//! zero. Keeping both sides as plain indices avoids ownership cycles while
//! making per-backtrace aggregation cheap.

use rtrace_common::proto::Handshake;
use rtrace_common::record::{
    ArgRecord, Attachment, CallRecord, ContextInfo, HeapInfo, MemoryMap, ModuleInfo, Pointer,
    ProcessInfo, ResTypeRef, ResourceInfo,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Internal ordering key of the event list. Distinct from the call index,
/// which is assigned by the tracer and preserved verbatim.
pub type Seq = u64;

/// Stable handle of an interned backtrace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId(usize);

/// A call event with its attached arguments and backtrace link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub record: CallRecord,
    pub trace: Option<TraceId>,
    pub args: Vec<ArgRecord>,
}

impl Call {
    /// Dense resource-type id the call was resolved against, if any.
    pub fn res_type_id(&self) -> Option<u32> {
        match self.record.res_type {
            ResTypeRef::Id(id) => Some(id),
            _ => None,
        }
    }
}

/// An interned backtrace shared by all calls with the identical frame
/// sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<Pointer>,
    /// Depth trimming clamps this without touching the allocation; frames
    /// beyond it are unreachable.
    nframes: usize,
    resolved: Option<Vec<Option<String>>>,
    ref_count: usize,
    calls: BTreeSet<Seq>,
    /// Fold hash at interning time; kept so removal finds the bucket even
    /// after the frame count was trimmed.
    bucket: u64,
}

impl Backtrace {
    pub fn frames(&self) -> &[Pointer] {
        &self.frames[..self.nframes]
    }

    pub fn resolved(&self) -> Option<&[Option<String>]> {
        self.resolved.as_deref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn calls(&self) -> impl Iterator<Item = Seq> + '_ {
        self.calls.iter().copied()
    }

    pub fn trim(&mut self, depth: usize) {
        if self.nframes > depth {
            self.nframes = depth;
        }
    }
}

/// Cheap xor-shift fold over the frame words; collision tolerance is all
/// the interning table needs.
fn fold_hash(frames: &[Pointer]) -> u64 {
    let mut hash = 0u64;
    for frame in frames {
        let mut value = *frame;
        while value != 0 {
            hash ^= value & 0xffff;
            value >>= 3;
        }
    }
    hash
}

/// Content-addressed backtrace store.
#[derive(Debug, Default)]
pub struct BacktraceIndex {
    slab: Vec<Option<Backtrace>>,
    buckets: HashMap<u64, Vec<TraceId>>,
}

impl BacktraceIndex {
    /// Interns `frames` for the call `seq`. An equivalent stored backtrace
    /// absorbs the reference (adopting resolved names it lacks); otherwise
    /// a new entry is created with a reference count of one.
    pub fn intern(
        &mut self,
        frames: Vec<Pointer>,
        resolved: Option<Vec<Option<String>>>,
        seq: Seq,
    ) -> TraceId {
        let bucket = fold_hash(&frames);
        if let Some(candidates) = self.buckets.get(&bucket) {
            for id in candidates {
                let Some(entry) = self.slab[id.0].as_mut() else {
                    continue;
                };
                if entry.frames() != frames.as_slice() {
                    continue;
                }
                if entry.resolved.is_none() {
                    entry.resolved = resolved;
                }
                entry.ref_count += 1;
                entry.calls.insert(seq);
                return *id;
            }
        }
        let id = TraceId(self.slab.len());
        let nframes = frames.len();
        self.slab.push(Some(Backtrace {
            frames,
            nframes,
            resolved,
            ref_count: 1,
            calls: BTreeSet::from([seq]),
            bucket,
        }));
        self.buckets.entry(bucket).or_default().push(id);
        id
    }

    /// Attaches one more call to an already interned backtrace.
    pub fn attach(&mut self, id: TraceId, seq: Seq) {
        if let Some(entry) = self.slab[id.0].as_mut() {
            entry.ref_count += 1;
            entry.calls.insert(seq);
        }
    }

    /// Drops one call reference; the backtrace is destroyed at zero.
    pub fn detach(&mut self, id: TraceId, seq: Seq) {
        let Some(entry) = self.slab[id.0].as_mut() else {
            return;
        };
        entry.calls.remove(&seq);
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let bucket = entry.bucket;
            self.slab[id.0] = None;
            if let Some(candidates) = self.buckets.get_mut(&bucket) {
                candidates.retain(|candidate| *candidate != id);
            }
        }
    }

    pub fn get(&self, id: TraceId) -> Option<&Backtrace> {
        self.slab.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: TraceId) -> Option<&mut Backtrace> {
        self.slab.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    /// Live backtraces in slab order.
    pub fn iter(&self) -> impl Iterator<Item = (TraceId, &Backtrace)> {
        self.slab
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|entry| (TraceId(idx), entry)))
    }

    pub fn len(&self) -> usize {
        self.slab.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remap_calls(&mut self, remap: &HashMap<Seq, Seq>) {
        for slot in self.slab.iter_mut().flatten() {
            slot.calls = slot.calls.iter().map(|seq| remap[seq]).collect();
        }
    }
}

/// A preserved comment line, ordered before the call whose index exceeds
/// `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub index: u32,
    pub text: String,
}

/// A registered resource type plus its report visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub info: ResourceInfo,
    /// Set when it is the only remaining type, so call records omit the
    /// annotation.
    pub hidden: bool,
}

/// Everything parsed from one event stream.
#[derive(Debug, Default)]
pub struct TraceData {
    pub handshake: Option<Handshake>,
    pub pinfo: Option<ProcessInfo>,
    pub minfo: Vec<ModuleInfo>,
    pub mmaps: Vec<MemoryMap>,
    pub contexts: Vec<ContextInfo>,
    pub resources: Vec<Resource>,
    pub calls: BTreeMap<Seq, Call>,
    pub traces: BacktraceIndex,
    pub comments: Vec<Comment>,
    pub hinfo: Option<HeapInfo>,
    pub attachments: Vec<Attachment>,
    /// Mask of filters already applied to this data (header `filter`
    /// field).
    pub filter: u32,
    next_seq: Seq,
}

impl TraceData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory maps are de-duplicated by (module, from, to); an overlapping
    /// range replaces the cached entry.
    pub fn add_mmap(&mut self, mmap: MemoryMap) {
        if let Some(existing) = self
            .mmaps
            .iter_mut()
            .find(|m| m.from <= mmap.to && m.to >= mmap.from)
        {
            if *existing == mmap {
                return;
            }
            *existing = mmap;
            return;
        }
        self.mmaps.push(mmap);
    }

    /// Appends a call to the event list, returning its sequence number.
    pub fn add_call(&mut self, record: CallRecord) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.calls.insert(
            seq,
            Call {
                record,
                trace: None,
                args: Vec::new(),
            },
        );
        seq
    }

    /// Interns `frames` and links them to every call in `seqs`.
    pub fn set_calls_trace(
        &mut self,
        seqs: &[Seq],
        frames: Vec<Pointer>,
        resolved: Option<Vec<Option<String>>>,
    ) {
        let Some((first, rest)) = seqs.split_first() else {
            return;
        };
        let id = self.traces.intern(frames, resolved, *first);
        if let Some(call) = self.calls.get_mut(first) {
            call.trace = Some(id);
        }
        for seq in rest {
            self.traces.attach(id, *seq);
            if let Some(call) = self.calls.get_mut(seq) {
                call.trace = Some(id);
            }
        }
    }

    /// Removes a call and releases its backtrace reference.
    pub fn remove_call(&mut self, seq: Seq) {
        if let Some(call) = self.calls.remove(&seq) {
            if let Some(id) = call.trace {
                self.traces.detach(id, seq);
            }
        }
    }

    pub fn resource_by_id(&self, id: u32) -> Option<&Resource> {
        self.resources.iter().find(|res| res.info.id == id)
    }

    pub fn resource_by_name(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|res| res.info.type_name == name)
    }

    /// Registers a resource type unless the tag is already known.
    pub fn add_resource(&mut self, info: ResourceInfo) {
        if self.resource_by_name(&info.type_name).is_none() {
            self.resources.push(Resource {
                info,
                hidden: false,
            });
        }
    }

    /// Reorders the event list by (timestamp, index) while keeping each
    /// backtrace's call set consistent. Text input may interleave events
    /// from several streams; binary input is already ordered.
    pub fn sort_calls_by_time(&mut self) {
        let mut entries: Vec<(Seq, Call)> = std::mem::take(&mut self.calls).into_iter().collect();
        entries.sort_by_key(|(seq, call)| (call.record.timestamp, call.record.index, *seq));
        let mut remap = HashMap::with_capacity(entries.len());
        let mut calls = BTreeMap::new();
        for (new_seq, (old_seq, call)) in entries.into_iter().enumerate() {
            remap.insert(old_seq, new_seq as Seq);
            calls.insert(new_seq as Seq, call);
        }
        self.next_seq = calls.len() as Seq;
        self.calls = calls;
        self.traces.remap_calls(&remap);
    }

    /// Checks the backtrace reference invariant: every call's backtrace is
    /// present, and each backtrace's reference count equals the number of
    /// referring calls.
    #[cfg(test)]
    pub fn verify_trace_refs(&self) {
        use std::collections::HashMap as Map;
        let mut counts: Map<TraceId, usize> = Map::new();
        for (seq, call) in &self.calls {
            if let Some(id) = call.trace {
                let entry = self.traces.get(id).expect("call references a live trace");
                assert!(entry.calls.contains(seq));
                *counts.entry(id).or_default() += 1;
            }
        }
        for (id, entry) in self.traces.iter() {
            assert_eq!(
                counts.get(&id).copied().unwrap_or(0),
                entry.ref_count(),
                "refcount mismatch for {id:?}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtrace_common::record::CallKind;

    fn call(index: u32, kind: CallKind, res_id: Pointer, res_size: u32) -> CallRecord {
        CallRecord {
            index,
            context: 0,
            timestamp: 0,
            kind,
            name: "malloc".into(),
            res_type: ResTypeRef::Id(1),
            res_id,
            res_size,
        }
    }

    #[test]
    fn test_interning_shares_identical_frames() {
        let mut data = TraceData::new();
        let a = data.add_call(call(1, CallKind::Alloc, 0x10, 8));
        let b = data.add_call(call(2, CallKind::Alloc, 0x20, 8));
        let c = data.add_call(call(3, CallKind::Alloc, 0x30, 8));

        data.set_calls_trace(&[a], vec![0x1, 0x2], None);
        data.set_calls_trace(&[b], vec![0x1, 0x2], None);
        data.set_calls_trace(&[c], vec![0x1, 0x3], None);

        assert_eq!(2, data.traces.len());
        assert_eq!(data.calls[&a].trace, data.calls[&b].trace);
        assert_ne!(data.calls[&a].trace, data.calls[&c].trace);
        let shared = data.traces.get(data.calls[&a].trace.unwrap()).unwrap();
        assert_eq!(2, shared.ref_count());
        data.verify_trace_refs();
    }

    #[test]
    fn test_backtrace_released_at_zero_refcount() {
        let mut data = TraceData::new();
        let a = data.add_call(call(1, CallKind::Alloc, 0x10, 8));
        let b = data.add_call(call(2, CallKind::Alloc, 0x20, 8));
        data.set_calls_trace(&[a, b], vec![0xabc, 0xdef], None);

        let id = data.calls[&a].trace.unwrap();
        data.remove_call(a);
        assert!(data.traces.get(id).is_some());
        data.remove_call(b);
        assert!(data.traces.get(id).is_none());
        assert!(data.traces.is_empty());
        data.verify_trace_refs();
    }

    #[test]
    fn test_interning_adopts_resolved_names() {
        let mut data = TraceData::new();
        let a = data.add_call(call(1, CallKind::Alloc, 0x10, 8));
        let b = data.add_call(call(2, CallKind::Alloc, 0x20, 8));
        data.set_calls_trace(&[a], vec![0x1], None);
        data.set_calls_trace(&[b], vec![0x1], Some(vec![Some("main".into())]));

        let trace = data.traces.get(data.calls[&a].trace.unwrap()).unwrap();
        assert_eq!(Some(&[Some("main".to_string())][..]), trace.resolved());
    }

    #[test]
    fn test_mmap_dedup_and_replacement() {
        let mut data = TraceData::new();
        let map = MemoryMap {
            from: 0x1000,
            to: 0x2000,
            module: "/lib/a.so".into(),
        };
        data.add_mmap(map.clone());
        data.add_mmap(map.clone());
        assert_eq!(1, data.mmaps.len());

        data.add_mmap(MemoryMap {
            from: 0x1000,
            to: 0x3000,
            module: "/lib/a.so".into(),
        });
        assert_eq!(1, data.mmaps.len());
        assert_eq!(0x3000, data.mmaps[0].to);
    }

    #[test]
    fn test_sort_calls_by_time_remaps_trace_sets() {
        let mut data = TraceData::new();
        let mut rec_a = call(2, CallKind::Alloc, 0x10, 8);
        rec_a.timestamp = 200;
        let mut rec_b = call(1, CallKind::Alloc, 0x20, 8);
        rec_b.timestamp = 100;
        let a = data.add_call(rec_a);
        let b = data.add_call(rec_b);
        data.set_calls_trace(&[a], vec![0x1], None);
        data.set_calls_trace(&[b], vec![0x1], None);

        data.sort_calls_by_time();
        let order: Vec<u32> = data.calls.values().map(|c| c.record.index).collect();
        assert_eq!(vec![1, 2], order);
        data.verify_trace_refs();
    }
}
