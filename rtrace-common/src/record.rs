// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record model transported by the packet protocol and the text format.

/// Resource identifiers and code addresses are pointer-width integers on
/// the wire; they are widened to 64 bits in memory so reports from any
/// supported target fit the same model.
pub type Pointer = u64;

/// Resource-type behaviour flags.
pub mod resource_flags {
    /// The resource is reference counted: repeated allocations of the same
    /// id stack, and only the release dropping the count to zero frees it.
    pub const REFCOUNT: u32 = 1 << 0;

    pub const ALL: u32 = REFCOUNT;

    /// Textual tags in flag-bit order, as printed inside `[..]` in resource
    /// registry records.
    pub const NAMES: [&str; 1] = ["refcount"];
}

/// Kind of a traced call, matching the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CallKind {
    Free = 1,
    Alloc = 2,
}

impl CallKind {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(CallKind::Free),
            2 => Some(CallKind::Alloc),
            _ => None,
        }
    }
}

/// How a call record references its resource type. Binary streams carry
/// the registry id; text records carry the type name or omit it entirely
/// when only one (hidden) type exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResTypeRef {
    None,
    Id(u32),
    Name(String),
}

/// One invocation of a wrapped function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Stable index assigned by the tracer and preserved by every
    /// transform.
    pub index: u32,
    /// Bitmask OR of the call contexts active on the emitting thread.
    pub context: u32,
    /// Milliseconds of day; zero when timestamps are disabled.
    pub timestamp: u32,
    pub kind: CallKind,
    pub name: String,
    pub res_type: ResTypeRef,
    pub res_id: Pointer,
    /// Allocation size; zero for free calls.
    pub res_size: u32,
}

/// One backtrace frame: a return address plus an optional resolved name
/// carried by text input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub addr: Pointer,
    pub name: Option<String>,
}

/// A single `name = value` function argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgRecord {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Wall clock (seconds, microseconds); zero means "fill in at first
    /// relay".
    pub timestamp_sec: u32,
    pub timestamp_usec: u32,
    /// Negative when the stream did not carry a depth setting.
    pub backtrace_depth: i32,
    pub name: String,
    pub trace_origin: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Bitmask position; module 0 is the tracer core.
    pub id: u32,
    pub vmajor: u16,
    pub vminor: u16,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub from: Pointer,
    pub to: Pointer,
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    /// A single context bit.
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Dense id starting at 1; id 0 is never emitted.
    pub id: u32,
    pub type_name: String,
    pub desc: String,
    pub flags: u32,
}

impl ResourceInfo {
    pub fn is_refcounted(&self) -> bool {
        self.flags & resource_flags::REFCOUNT != 0
    }

    /// The bit written in text records: `1 << (id - 1)`.
    pub fn bit(&self) -> u32 {
        1 << (self.id - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub path: String,
}

/// Heap snapshot taken when tracing is toggled off. The counters mirror
/// the C allocator's statistics block; lowest/highest are derived by the
/// post-processor from surviving allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapInfo {
    pub heap_bottom: Pointer,
    pub heap_top: Pointer,
    pub lowest_block: Pointer,
    pub highest_block: Pointer,
    pub arena: u32,
    pub ordblks: u32,
    pub smblks: u32,
    pub hblks: u32,
    pub hblkhd: u32,
    pub usmblks: u32,
    pub fsmblks: u32,
    pub uordblks: u32,
    pub fordblks: u32,
    pub keepcost: u32,
}

impl HeapInfo {
    /// The ten counters in wire order.
    pub fn counters(&self) -> [u32; 10] {
        [
            self.arena,
            self.ordblks,
            self.smblks,
            self.hblks,
            self.hblkhd,
            self.usmblks,
            self.fsmblks,
            self.uordblks,
            self.fordblks,
            self.keepcost,
        ]
    }

    pub fn set_counters(&mut self, counters: [u32; 10]) {
        [
            self.arena,
            self.ordblks,
            self.smblks,
            self.hblks,
            self.hblkhd,
            self.usmblks,
            self.fsmblks,
            self.uordblks,
            self.fordblks,
            self.keepcost,
        ] = counters;
    }
}
