// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Text report header: a single `key=value, key=value, ` line.

/// Header fields in their canonical output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Field {
    Version = 0,
    Arch,
    Timestamp,
    Process,
    Pid,
    Filter,
    BacktraceDepth,
    Origin,
}

pub const FIELD_COUNT: usize = 8;

pub const FIELD_NAMES: [&str; FIELD_COUNT] = [
    "version",
    "arch",
    "timestamp",
    "process",
    "pid",
    "filter",
    "backtrace depth",
    "origin",
];

/// Filter mask bits recorded in the `filter` header field.
pub mod filter_mask {
    pub const LEAKS: u32 = 1 << 0;
    pub const COMPRESS: u32 = 1 << 1;
    pub const RESOLVE: u32 = 1 << 2;

    /// Filters that stay set when a report is processed again; compression
    /// is re-derived from the requested options every run.
    pub const PERMANENT: u32 = LEAKS | RESOLVE;

    pub const TAGS: [&str; 3] = ["leaks", "compress", "resolve"];
}

/// Parsed header line. Unset fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: [Option<String>; FIELD_COUNT],
}

impl Header {
    pub fn get(&self, field: Field) -> Option<&str> {
        self.fields[field as usize].as_deref()
    }

    pub fn set(&mut self, field: Field, value: Option<String>) {
        self.fields[field as usize] = value;
    }

    /// Parses a `key=value, key=value, ` line; unrecognized keys are
    /// ignored.
    pub fn parse(line: &str) -> Self {
        let mut header = Self::default();
        for part in line.trim_end().split(", ") {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            if let Some(idx) = FIELD_NAMES.iter().position(|name| *name == key) {
                header.fields[idx] = Some(value.trim_end_matches(',').to_string());
            }
        }
        header
    }

    /// Formats the header line, with the trailing `, ` each field carries.
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        for (idx, value) in self.fields.iter().enumerate() {
            if let Some(value) = value {
                line.push_str(FIELD_NAMES[idx]);
                line.push('=');
                line.push_str(value);
                line.push_str(", ");
            }
        }
        line.push('\n');
        line
    }

    /// Decodes the `filter` field into a mask.
    pub fn filter(&self) -> u32 {
        let Some(filter) = self.get(Field::Filter) else {
            return 0;
        };
        let mut mask = 0;
        for (bit, tag) in filter_mask::TAGS.iter().enumerate() {
            if filter.contains(tag) {
                mask |= 1 << bit;
            }
        }
        mask
    }

    /// Encodes `mask` into the `filter` field; a zero mask clears it.
    pub fn set_filter(&mut self, mask: u32) {
        if mask == 0 {
            self.set(Field::Filter, None);
            return;
        }
        let tags: Vec<&str> = filter_mask::TAGS
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, tag)| *tag)
            .collect();
        self.set(Field::Filter, Some(tags.join("|")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let line = "version=2.0, arch=x86_64, timestamp=21.03.2024 10:11:12, \
                    process=sample, pid=1234, filter=leaks|compress, backtrace depth=10, \
                    origin=rtrace-2.0.0, \n";
        let header = Header::parse(line);
        assert_eq!(Some("2.0"), header.get(Field::Version));
        assert_eq!(Some("x86_64"), header.get(Field::Arch));
        assert_eq!(Some("1234"), header.get(Field::Pid));
        assert_eq!(Some("10"), header.get(Field::BacktraceDepth));
        assert_eq!(
            filter_mask::LEAKS | filter_mask::COMPRESS,
            header.filter()
        );
        assert_eq!(line, header.to_line());
    }

    #[test]
    fn test_filter_mask_set_clear() {
        let mut header = Header::default();
        header.set_filter(filter_mask::LEAKS | filter_mask::RESOLVE);
        assert_eq!(Some("leaks|resolve"), header.get(Field::Filter));
        header.set_filter(0);
        assert_eq!(None, header.get(Field::Filter));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let header = Header::parse("version=2.0, frobnicate=yes, pid=7, \n");
        assert_eq!(Some("2.0"), header.get(Field::Version));
        assert_eq!(Some("7"), header.get(Field::Pid));
    }
}
