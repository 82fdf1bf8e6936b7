// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `/proc/<pid>/maps` scanning.
//!
//! The listener keeps a cache of the executable segments it has already
//! reported; a rescan yields only segments that are new or whose range
//! changed, each of which replaces its cached predecessor.

use rtrace_common::record::MemoryMap;

/// Cache of reported executable mappings.
#[derive(Debug, Default)]
pub struct MapCache {
    entries: Vec<MemoryMap>,
}

impl MapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one maps line, keeping only executable segments backed by a
    /// path.
    fn parse_line(line: &str) -> Option<MemoryMap> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        if perms.as_bytes().get(2) != Some(&b'x') {
            return None;
        }
        let (from, to) = range.split_once('-')?;
        let from = u64::from_str_radix(from, 16).ok()?;
        let to = u64::from_str_radix(to, 16).ok()?;
        // offset, dev, inode
        let path = fields.nth(3)?;
        if !path.starts_with('/') {
            return None;
        }
        Some(MemoryMap {
            from,
            to,
            module: path.to_string(),
        })
    }

    /// Diffs `content` (a maps file) against the cache and returns the
    /// mappings that still need reporting.
    pub fn diff(&mut self, content: &str) -> Vec<MemoryMap> {
        let mut fresh = Vec::new();
        for line in content.lines() {
            let Some(mmap) = Self::parse_line(line) else {
                continue;
            };
            match self
                .entries
                .iter_mut()
                .find(|cached| cached.from <= mmap.to && cached.to >= mmap.from)
            {
                Some(cached) if *cached == mmap => {}
                Some(cached) => {
                    *cached = mmap.clone();
                    fresh.push(mmap);
                }
                None => {
                    self.entries.push(mmap.clone());
                    fresh.push(mmap);
                }
            }
        }
        fresh
    }

    /// Rescans the maps of `pid` and returns the new executable segments.
    pub fn rescan(&mut self, pid: u32) -> Vec<MemoryMap> {
        match std::fs::read_to_string(format!("/proc/{pid}/maps")) {
            Ok(content) => self.diff(&content),
            Err(_) => Vec::new(),
        }
    }
}
