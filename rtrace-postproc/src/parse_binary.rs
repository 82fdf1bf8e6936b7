// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary event stream parser.

use crate::data::{Seq, TraceData};
use anyhow::Context;
use rtrace_common::proto::{self, Frame, Handshake, PacketType, PayloadReader, ProtoError};
use rtrace_common::record::{
    ArgRecord, Attachment, CallKind, CallRecord, ContextInfo, HeapInfo, MemoryMap, ModuleInfo,
    ProcessInfo, ResTypeRef, ResourceInfo,
};
use std::io::Read;
use tracing::warn;

const BUFFER_SIZE: usize = 4096;

/// Local architecture tag compared against the handshake; a mismatch is
/// only worth a warning since the rest of the handshake already guards
/// decodability.
pub const BUILD_ARCH: &str = std::env::consts::ARCH;

struct BinaryParser {
    data: TraceData,
    /// Call index counter, reset on a fresh handshake.
    call_index: u32,
    /// The call a following backtrace or argument packet attaches to.
    prev_call: Option<Seq>,
}

enum Advance {
    Consumed(usize),
    Incomplete,
    /// Unknown packet or a mid-stream handshake: stop and keep what was
    /// parsed.
    Stop,
}

impl BinaryParser {
    fn new() -> Self {
        Self {
            data: TraceData::new(),
            call_index: 1,
            prev_call: None,
        }
    }

    fn handshake(&self) -> &Handshake {
        // Set before any packet is processed.
        self.data.handshake.as_ref().unwrap()
    }

    fn process_packet(&mut self, buffer: &[u8]) -> Result<Advance, ProtoError> {
        if buffer.first() == Some(&proto::HANDSHAKE_MAGIC) && !self.handshake().length_first_framing()
        {
            // Multiple concatenated streams; process what has been read.
            warn!("handshake packet received in the middle of the data stream");
            return Ok(Advance::Stop);
        }
        let frame = match proto::next_frame(buffer, self.handshake().length_first_framing())? {
            Some(frame) => frame,
            None => return Ok(Advance::Incomplete),
        };
        let Some(ptype) = PacketType::from_wire(frame.raw_type) else {
            warn!(
                "unknown packet: {:x} (len={})",
                frame.raw_type,
                frame.size - 8
            );
            return Ok(Advance::Stop);
        };
        let size = frame.size;
        self.dispatch(ptype, frame)?;
        Ok(Advance::Consumed(size))
    }

    fn dispatch(&mut self, ptype: PacketType, frame: Frame<'_>) -> Result<(), ProtoError> {
        let mut r = PayloadReader::new(frame.payload);
        match ptype {
            PacketType::MemoryMap => {
                let from = r.get_pointer()?;
                let to = r.get_pointer()?;
                let module = r.get_str()?;
                self.data.add_mmap(MemoryMap { from, to, module });
                self.prev_call = None;
            }
            PacketType::ContextRegistry => {
                let id = r.get_u32()?;
                let name = r.get_str()?;
                self.data.contexts.push(ContextInfo { id, name });
                self.prev_call = None;
            }
            PacketType::ResourceRegistry => {
                let id = r.get_u32()?;
                let flags = if self.handshake().at_least(1, 3) {
                    r.get_u32()?
                } else {
                    0
                };
                let type_name = r.get_str()?;
                let desc = r.get_str()?;
                self.data.add_resource(ResourceInfo {
                    id,
                    type_name,
                    desc,
                    flags,
                });
                self.prev_call = None;
            }
            PacketType::FunctionCall => {
                let res_type = r.get_u32()?;
                let context = r.get_u32()?;
                let timestamp = r.get_u32()?;
                let kind_raw = r.get_u32()?;
                let name = r.get_str()?;
                let res_size = r.get_u32()?;
                let res_id = r.get_pointer()?;
                let Some(kind) = CallKind::from_wire(kind_raw) else {
                    warn!("function call packet with unknown kind {kind_raw}");
                    return Ok(());
                };
                let index = self.call_index;
                self.call_index += 1;
                if self.data.resource_by_id(res_type).is_none() {
                    warn!("call #{index} references unregistered resource type {res_type}");
                }
                let seq = self.data.add_call(CallRecord {
                    index,
                    context,
                    timestamp,
                    kind,
                    name,
                    res_type: ResTypeRef::Id(res_type),
                    res_id,
                    res_size,
                });
                self.prev_call = Some(seq);
            }
            PacketType::Backtrace => {
                let nframes = r.get_u32()? as usize;
                let mut frames = Vec::with_capacity(nframes);
                for _ in 0..nframes {
                    frames.push(r.get_pointer()?);
                }
                match self.prev_call.take() {
                    // Binary streams never carry resolved names.
                    Some(seq) => self.data.set_calls_trace(&[seq], frames, None),
                    None => {
                        warn!("a backtrace packet did not follow a function call packet");
                    }
                }
            }
            PacketType::FunctionArgs => {
                let argc = r.get_u32()?;
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    let name = r.get_str()?;
                    let value = r.get_str()?;
                    args.push(ArgRecord { name, value });
                }
                match self.prev_call {
                    Some(seq) => {
                        if let Some(call) = self.data.calls.get_mut(&seq) {
                            call.args = args;
                        }
                    }
                    None => warn!("a function argument packet did not follow a function call packet"),
                }
            }
            PacketType::ProcessInfo => {
                let pid = r.get_u32()?;
                let timestamp_sec = r.get_u32()?;
                let timestamp_usec = r.get_u32()?;
                let backtrace_depth = if self.handshake().at_least(1, 2) {
                    r.get_u32()? as i32
                } else {
                    -1
                };
                let name = r.get_str()?;
                self.data.pinfo = Some(ProcessInfo {
                    pid,
                    timestamp_sec,
                    timestamp_usec,
                    backtrace_depth,
                    name,
                    trace_origin: rtrace_common::TRACE_ORIGIN.to_string(),
                });
                self.prev_call = None;
            }
            PacketType::ModuleInfo => {
                let id = r.get_u32()?;
                let version = r.get_u32()?;
                let name = r.get_str()?;
                self.data.minfo.push(ModuleInfo {
                    id,
                    vmajor: (version >> 16) as u16,
                    vminor: (version & 0xffff) as u16,
                    name,
                });
                self.prev_call = None;
            }
            PacketType::HeapInfo => {
                let mut hinfo = HeapInfo {
                    heap_bottom: r.get_pointer()?,
                    heap_top: r.get_pointer()?,
                    ..Default::default()
                };
                let mut counters = [0u32; 10];
                for counter in &mut counters {
                    *counter = r.get_u32()?;
                }
                hinfo.set_counters(counters);
                self.data.hinfo = Some(hinfo);
                self.prev_call = None;
            }
            PacketType::Attachment => {
                let name = r.get_str()?;
                let path = r.get_str()?;
                self.data.attachments.push(Attachment { name, path });
            }
            // Consumed by the pre-processor; nothing to keep here.
            PacketType::OutputSettings => {}
            // The pre-processor rewrites these into memory map packets; a
            // stray one in a file is ignored.
            PacketType::NewLibrary => {
                self.prev_call = None;
            }
        }
        Ok(())
    }
}

/// Parses a complete binary stream, handshake included.
pub fn parse_stream(input: &mut impl Read) -> anyhow::Result<TraceData> {
    let mut parser = BinaryParser::new();
    let mut buffer = Vec::with_capacity(BUFFER_SIZE * 2);

    // The handshake is the first packet written into the pipe and is far
    // smaller than any read chunk, so it must never arrive fragmented.
    let mut chunk = [0u8; BUFFER_SIZE];
    let n = input.read(&mut chunk).context("reading handshake")?;
    buffer.extend_from_slice(&chunk[..n]);
    let (handshake, consumed) =
        Handshake::decode(&buffer).context("handshake packet processing failed")?;
    handshake.check_compatibility()?;
    if handshake.arch != BUILD_ARCH {
        warn!(
            "architecture mismatch: {} (expected {})",
            handshake.arch, BUILD_ARCH
        );
    }
    parser.data.handshake = Some(handshake);
    buffer.drain(..consumed);

    'read: loop {
        loop {
            match parser.process_packet(&buffer)? {
                Advance::Consumed(size) => {
                    buffer.drain(..size);
                }
                Advance::Incomplete => break,
                Advance::Stop => break 'read,
            }
        }
        let n = input.read(&mut chunk).context("reading event stream")?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(parser.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtrace_common::proto::{PayloadWriter, VERSION_MAJOR, VERSION_MINOR};

    /// Builds a small but complete binary stream: handshake, process info,
    /// resource registry, one alloc call with a two-frame backtrace.
    pub(crate) fn sample_stream() -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let hs = Handshake::new(BUILD_ARCH);
        let mut size = hs.encode(&mut buf).unwrap();
        {
            let mut w = PayloadWriter::new(&mut buf[size..]);

            let at = w.start_packet(PacketType::ProcessInfo).unwrap();
            w.put_u32(42).unwrap();
            w.put_u32(1_700_000_000).unwrap();
            w.put_u32(0).unwrap();
            w.put_u32(10).unwrap();
            w.put_str("sample").unwrap();
            w.finish_packet(at);

            let at = w.start_packet(PacketType::ModuleInfo).unwrap();
            w.put_u32(0).unwrap();
            w.put_u32(1 << 16).unwrap();
            w.put_str("mem").unwrap();
            w.finish_packet(at);

            let at = w.start_packet(PacketType::ResourceRegistry).unwrap();
            w.put_u32(1).unwrap();
            w.put_u32(0).unwrap();
            w.put_str("memory").unwrap();
            w.put_str("memory allocation in bytes").unwrap();
            w.finish_packet(at);

            let at = w.start_packet(PacketType::FunctionCall).unwrap();
            w.put_u32(1).unwrap();
            w.put_u32(0).unwrap();
            w.put_u32(0).unwrap();
            w.put_u32(CallKind::Alloc as u32).unwrap();
            w.put_str("malloc").unwrap();
            w.put_u32(8).unwrap();
            w.put_pointer(0x100).unwrap();
            w.finish_packet(at);

            let at = w.start_packet(PacketType::Backtrace).unwrap();
            w.put_u32(2).unwrap();
            w.put_pointer(0xa).unwrap();
            w.put_pointer(0xb).unwrap();
            w.finish_packet(at);

            size += w.written();
        }
        buf.truncate(size);
        buf
    }

    #[test]
    fn test_parse_sample_stream() {
        let stream = sample_stream();
        let data = parse_stream(&mut stream.as_slice()).unwrap();

        let hs = data.handshake.as_ref().unwrap();
        assert_eq!((VERSION_MAJOR, VERSION_MINOR), (hs.vmajor, hs.vminor));
        let pinfo = data.pinfo.as_ref().unwrap();
        assert_eq!(42, pinfo.pid);
        assert_eq!(10, pinfo.backtrace_depth);
        assert_eq!("sample", pinfo.name);
        assert_eq!(1, data.minfo.len());
        assert_eq!(1, data.resources.len());
        assert_eq!(1, data.calls.len());

        let call = data.calls.values().next().unwrap();
        assert_eq!(1, call.record.index);
        assert_eq!(CallKind::Alloc, call.record.kind);
        assert_eq!(0x100, call.record.res_id);
        let trace = data.traces.get(call.trace.unwrap()).unwrap();
        assert_eq!(&[0xa, 0xb], trace.frames());
        data.verify_trace_refs();
    }

    #[test]
    fn test_parse_stops_at_mid_stream_handshake() {
        let mut stream = sample_stream();
        let second = sample_stream();
        stream.extend_from_slice(&second);
        let data = parse_stream(&mut stream.as_slice()).unwrap();
        // Only the first stream's call survives.
        assert_eq!(1, data.calls.len());
    }

    #[test]
    fn test_parse_rejects_endianness_mismatch() {
        let mut stream = sample_stream();
        // Flip the endianness byte inside the handshake.
        let arch_len = stream[4] as usize;
        stream[5 + arch_len] ^= 1;
        assert!(parse_stream(&mut stream.as_slice()).is_err());
    }

    #[test]
    fn test_parse_truncated_tail_keeps_complete_packets() {
        let stream = sample_stream();
        // Drop the last 4 bytes: the backtrace packet becomes incomplete.
        let cut = &stream[..stream.len() - 4];
        let data = parse_stream(&mut &cut[..]).unwrap();
        assert_eq!(1, data.calls.len());
        assert!(data.calls.values().next().unwrap().trace.is_none());
    }
}
