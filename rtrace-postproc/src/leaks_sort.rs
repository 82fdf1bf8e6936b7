// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-backtrace leak aggregation and ordering for compressed reports.

use crate::data::{TraceData, TraceId};
use rtrace_common::record::CallKind;

/// Ordering of the grouped records in a compressed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakSort {
    #[default]
    SizeAsc,
    SizeDesc,
    CountAsc,
    CountDesc,
}

impl LeakSort {
    /// Parses the command-line spelling (`size-asc`, `size-desc`,
    /// `count-asc`, `count-desc`).
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "size-asc" => Some(LeakSort::SizeAsc),
            "size-desc" => Some(LeakSort::SizeDesc),
            "count-asc" => Some(LeakSort::CountAsc),
            "count-desc" => Some(LeakSort::CountDesc),
            _ => None,
        }
    }
}

/// One grouped record: a backtrace plus the total of its surviving
/// allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceAggregate {
    pub trace: TraceId,
    pub leak_count: u64,
    pub leak_size: u64,
}

/// Builds the per-backtrace aggregates and sorts them.
///
/// The sort is stable with the slab order as the tiebreak, so identical
/// inputs always produce identical reports.
pub fn aggregate(data: &TraceData, order: LeakSort) -> Vec<TraceAggregate> {
    let mut aggregates: Vec<TraceAggregate> = data
        .traces
        .iter()
        .map(|(id, trace)| {
            let mut leak_count = 0;
            let mut leak_size = 0;
            for seq in trace.calls() {
                if let Some(call) = data.calls.get(&seq) {
                    if call.record.kind == CallKind::Alloc {
                        leak_count += 1;
                        leak_size += call.record.res_size as u64;
                    }
                }
            }
            TraceAggregate {
                trace: id,
                leak_count,
                leak_size,
            }
        })
        .collect();
    match order {
        LeakSort::SizeAsc => aggregates.sort_by_key(|a| (a.leak_size, a.trace)),
        LeakSort::SizeDesc => {
            aggregates.sort_by_key(|a| (std::cmp::Reverse(a.leak_size), a.trace))
        }
        LeakSort::CountAsc => aggregates.sort_by_key(|a| (a.leak_count, a.trace)),
        LeakSort::CountDesc => {
            aggregates.sort_by_key(|a| (std::cmp::Reverse(a.leak_count), a.trace))
        }
    }
    aggregates
}
