// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Text report line parser. Each line is matched against the record
//! grammars in turn; anything unrecognized is preserved as a comment, so
//! parsing a line never fails.

use crate::record::{
    resource_flags, ArgRecord, Attachment, CallKind, CallRecord, ContextInfo, FrameRecord,
    MemoryMap, ResTypeRef, ResourceInfo,
};

/// A parsed text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Call(CallRecord),
    Frame(FrameRecord),
    Arg(ArgRecord),
    Mmap(MemoryMap),
    Context(ContextInfo),
    Resource(ResourceInfo),
    Attachment(Attachment),
    Comment(String),
}

/// Parses one line (trailing newline allowed) into a record.
pub fn parse_record(line: &str) -> Record {
    let line = line.strip_suffix('\n').unwrap_or(line);
    if let Some(frame) = parse_frame(line) {
        return Record::Frame(frame);
    }
    if let Some(call) = parse_call(line) {
        return Record::Call(call);
    }
    if let Some(arg) = parse_arg(line) {
        return Record::Arg(arg);
    }
    if let Some(mmap) = parse_mmap(line) {
        return Record::Mmap(mmap);
    }
    if let Some(context) = parse_context(line) {
        return Record::Context(context);
    }
    if let Some(resource) = parse_resource(line) {
        return Record::Resource(resource);
    }
    if let Some(attachment) = parse_attachment(line) {
        return Record::Attachment(attachment);
    }
    Record::Comment(line.to_string())
}

fn hex_value(text: &str) -> Option<(u64, &str)> {
    let digits = text.len() - text.trim_start_matches(|c: char| c.is_ascii_hexdigit()).len();
    if digits == 0 || digits > 16 {
        return None;
    }
    let value = u64::from_str_radix(&text[..digits], 16).ok()?;
    Some((value, &text[digits..]))
}

fn dec_value(text: &str) -> Option<(u64, &str)> {
    let digits = text.len() - text.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let value = text[..digits].parse().ok()?;
    Some((value, &text[digits..]))
}

fn parse_frame(line: &str) -> Option<FrameRecord> {
    let rest = line.strip_prefix('\t')?.strip_prefix("0x")?;
    let (addr, rest) = hex_value(rest)?;
    let name = rest.strip_prefix(' ').map(|name| name.to_string());
    if name.is_none() && !rest.is_empty() {
        return None;
    }
    Some(FrameRecord { addr, name })
}

fn parse_call(line: &str) -> Option<CallRecord> {
    let (index, rest) = dec_value(line)?;
    let mut rest = rest.strip_prefix(". ")?;

    let mut context = 0;
    if let Some(ctx_text) = rest.strip_prefix('@') {
        let (ctx, after) = hex_value(ctx_text)?;
        context = ctx as u32;
        rest = after.strip_prefix(' ')?;
    }

    let mut timestamp = 0;
    if let Some(ts_text) = rest.strip_prefix('[') {
        let (hours, t) = dec_value(ts_text)?;
        let (minutes, t) = dec_value(t.strip_prefix(':')?)?;
        let (seconds, t) = dec_value(t.strip_prefix(':')?)?;
        let (millis, t) = dec_value(t.strip_prefix('.')?)?;
        timestamp = (hours * 3_600_000 + minutes * 60_000 + seconds * 1000 + millis) as u32;
        rest = t.strip_prefix("] ")?;
    }

    // The name runs up to the last '(' of the line, or up to the last '<'
    // when a resource annotation precedes the parenthesis.
    let paren = rest.rfind('(')?;
    let (name_end, mut tail) = if rest[..paren].ends_with('>') {
        let open = rest.rfind('<')?;
        (open, &rest[open..])
    } else {
        (paren, &rest[paren..])
    };
    let name = rest[..name_end].to_string();
    if name.is_empty() {
        return None;
    }

    let mut res_type = ResTypeRef::None;
    if let Some(annotated) = tail.strip_prefix('<') {
        let close = annotated.find('>')?;
        res_type = ResTypeRef::Name(annotated[..close].to_string());
        tail = &annotated[close + 1..];
        if !tail.starts_with('(') {
            return None;
        }
    }

    let inner = tail.strip_prefix('(')?;
    if let Some(free_text) = inner.strip_prefix("0x") {
        let (res_id, after) = hex_value(free_text)?;
        if after != ")" {
            return None;
        }
        return Some(CallRecord {
            index: index as u32,
            context,
            timestamp,
            kind: CallKind::Free,
            name,
            res_type,
            res_id,
            res_size: 0,
        });
    }
    let (res_size, after) = dec_value(inner)?;
    let after = after.strip_prefix(") = 0x")?;
    let (res_id, after) = hex_value(after)?;
    if !after.is_empty() {
        return None;
    }
    Some(CallRecord {
        index: index as u32,
        context,
        timestamp,
        kind: CallKind::Alloc,
        name,
        res_type,
        res_id,
        res_size: res_size as u32,
    })
}

fn parse_arg(line: &str) -> Option<ArgRecord> {
    let rest = line.strip_prefix("\t$")?;
    let (name, value) = rest.split_once(" = ")?;
    if name.is_empty() {
        return None;
    }
    Some(ArgRecord {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_mmap(line: &str) -> Option<MemoryMap> {
    let rest = line.strip_prefix(": ")?;
    let (module, range) = rest.split_once(" => ")?;
    let (from, range) = hex_value(range.strip_prefix("0x")?)?;
    let (to, rest) = hex_value(range.strip_prefix("-0x")?)?;
    if !rest.is_empty() {
        return None;
    }
    Some(MemoryMap {
        from,
        to,
        module: module.to_string(),
    })
}

fn parse_context(line: &str) -> Option<ContextInfo> {
    let rest = line.strip_prefix("@ ")?;
    let (id, rest) = hex_value(rest)?;
    let name = rest.strip_prefix(" : ")?;
    if name.is_empty() {
        return None;
    }
    Some(ContextInfo {
        id: id as u32,
        name: name.to_string(),
    })
}

fn parse_resource(line: &str) -> Option<ResourceInfo> {
    let rest = line.strip_prefix('<')?;
    let (bit, rest) = hex_value(rest)?;
    if bit == 0 {
        return None;
    }
    let rest = rest.strip_prefix("> : ")?;
    let (type_name, rest) = rest.split_once(" (")?;
    let (desc, rest) = rest.split_once(')')?;
    let mut flags = 0;
    if let Some(flag_text) = rest.strip_prefix(" [").and_then(|t| t.strip_suffix(']')) {
        for (nflag, tag) in resource_flags::NAMES.iter().enumerate() {
            if flag_text.contains(tag) {
                flags |= 1 << nflag;
            }
        }
    } else if !rest.is_empty() {
        return None;
    }
    Some(ResourceInfo {
        // Stored as the dense id; the text form carries the bit.
        id: bit.trailing_zeros() + 1,
        type_name: type_name.to_string(),
        desc: desc.to_string(),
        flags,
    })
}

fn parse_attachment(line: &str) -> Option<Attachment> {
    let rest = line.strip_prefix("& ")?;
    let (name, path) = rest.split_once(" : ")?;
    if name.is_empty() || path.is_empty() {
        return None;
    }
    Some(Attachment {
        name: name.to_string(),
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_alloc_call() {
        let rec = parse_record("5. malloc(128) = 0x4b2f00\n");
        let Record::Call(call) = rec else {
            panic!("expected a call record, got {rec:?}");
        };
        assert_eq!(5, call.index);
        assert_eq!(CallKind::Alloc, call.kind);
        assert_eq!("malloc", call.name);
        assert_eq!(128, call.res_size);
        assert_eq!(0x4b2f00, call.res_id);
        assert_eq!(ResTypeRef::None, call.res_type);
    }

    #[test]
    fn test_parse_free_call_with_everything() {
        let rec = parse_record("6. @3 [01:02:03.004] free<memory>(0x4b2f00)");
        let Record::Call(call) = rec else {
            panic!("expected a call record, got {rec:?}");
        };
        assert_eq!(CallKind::Free, call.kind);
        assert_eq!(3, call.context);
        assert_eq!(3_723_004, call.timestamp);
        assert_eq!(ResTypeRef::Name("memory".into()), call.res_type);
        assert_eq!(0, call.res_size);
    }

    #[test]
    fn test_parse_frame_lines() {
        assert_eq!(
            Record::Frame(FrameRecord {
                addr: 0x400123,
                name: None
            }),
            parse_record("\t0x400123")
        );
        assert_eq!(
            Record::Frame(FrameRecord {
                addr: 0x400456,
                name: Some("main+0x12".into())
            }),
            parse_record("\t0x400456 main+0x12")
        );
    }

    #[test]
    fn test_parse_registry_records() {
        assert_eq!(
            Record::Context(ContextInfo {
                id: 4,
                name: "rendering".into()
            }),
            parse_record("@ 4 : rendering")
        );
        assert_eq!(
            Record::Resource(ResourceInfo {
                id: 3,
                type_name: "shmseg".into(),
                desc: "shared memory segment".into(),
                flags: resource_flags::REFCOUNT,
            }),
            parse_record("<4> : shmseg (shared memory segment) [refcount]")
        );
        assert_eq!(
            Record::Mmap(MemoryMap {
                from: 0x7f0000000000,
                to: 0x7f0000010000,
                module: "/lib/libc.so.6".into()
            }),
            parse_record(": /lib/libc.so.6 => 0x7f0000000000-0x7f0000010000")
        );
        assert_eq!(
            Record::Attachment(Attachment {
                name: "pagemap".into(),
                path: "1234-pagemap-0".into()
            }),
            parse_record("& pagemap : 1234-pagemap-0")
        );
    }

    #[test]
    fn test_malformed_lines_become_comments() {
        for line in [
            "# a plain comment",
            "malloc(128) = 0x1000",
            "17 no dot separator",
            "<0> : zero-bit (broken)",
            "",
        ] {
            assert_eq!(Record::Comment(line.into()), parse_record(line));
        }
    }

    #[test]
    fn test_call_formats_roundtrip() {
        use crate::format::print_call;
        let calls = [
            "1. malloc(8) = 0x10\n",
            "2. @1 calloc(64) = 0xdeadbeef\n",
            "3. [10:20:30.400] free(0x10)\n",
            "4. @f [00:00:00.001] realloc<memory>(32) = 0x20\n",
        ];
        for text in calls {
            let Record::Call(call) = parse_record(text) else {
                panic!("not parsed as call: {text}");
            };
            let mut out = Vec::new();
            let res_name = match &call.res_type {
                ResTypeRef::Name(name) => Some(name.as_str()),
                _ => None,
            };
            print_call(&mut out, &call, res_name).unwrap();
            assert_eq!(text, String::from_utf8(out).unwrap());
        }
    }
}
