// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backtrace capture filter.
//!
//! By default only allocation events pay for stack unwinding; freeing
//! events and unlisted allocation sizes skip the capture while the call
//! record itself is still emitted.

use rtrace_common::record::CallKind;

const KIND_FREE: u32 = 1 << 0;
const KIND_ALLOC: u32 = 1 << 1;

#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    kinds: u32,
    /// When set, only allocations of the listed sizes are captured.
    size_set: Option<Vec<u32>>,
}

impl TraceFilter {
    /// Captures backtraces for allocation events only.
    pub fn alloc_only() -> Self {
        Self {
            kinds: KIND_ALLOC,
            size_set: None,
        }
    }

    /// Captures backtraces for both allocation and release events.
    pub fn all() -> Self {
        Self {
            kinds: KIND_ALLOC | KIND_FREE,
            size_set: None,
        }
    }

    /// Parses the monitor-size option: a comma-separated list of
    /// allocation sizes worth a backtrace. Unparsable entries are skipped.
    pub fn parse_size_opt(&mut self, opt: &str) {
        let sizes: Vec<u32> = opt
            .split(',')
            .filter_map(|entry| entry.trim().parse().ok())
            .collect();
        if !sizes.is_empty() {
            self.size_set = Some(sizes);
        }
    }

    /// True when the event is worth a backtrace capture.
    pub fn validate(&self, kind: CallKind, res_size: u32) -> bool {
        let kind_bit = match kind {
            CallKind::Free => KIND_FREE,
            CallKind::Alloc => KIND_ALLOC,
        };
        if self.kinds & kind_bit == 0 {
            return false;
        }
        match &self.size_set {
            Some(sizes) => sizes.contains(&res_size),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_only_skips_frees() {
        let filter = TraceFilter::alloc_only();
        assert!(filter.validate(CallKind::Alloc, 16));
        assert!(!filter.validate(CallKind::Free, 0));
        assert!(TraceFilter::all().validate(CallKind::Free, 0));
    }

    #[test]
    fn test_size_set() {
        let mut filter = TraceFilter::alloc_only();
        filter.parse_size_opt("8,64, 512");
        assert!(filter.validate(CallKind::Alloc, 8));
        assert!(filter.validate(CallKind::Alloc, 512));
        assert!(!filter.validate(CallKind::Alloc, 16));
    }

    #[test]
    fn test_garbage_size_opt_ignored() {
        let mut filter = TraceFilter::alloc_only();
        filter.parse_size_opt("pony");
        assert!(filter.validate(CallKind::Alloc, 123));
    }
}
