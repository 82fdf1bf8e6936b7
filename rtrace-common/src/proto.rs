// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary packet protocol.
//!
//! A stream starts with a handshake packet (`0xF0` sentinel byte) followed
//! by framed packets. From protocol version 2 a frame is
//! `[type:4][length:4][payload]`; older streams used
//! `[length:4][type:4][payload]` and are still readable. Payloads are
//! 4-byte aligned; strings are `[len:u16][bytes][pad to 4]`; all integers
//! are native-endian, guarded by the endianness and pointer-size fields of
//! the handshake.

use thiserror::Error;

pub const VERSION_MAJOR: u8 = 2;
pub const VERSION_MINOR: u8 = 0;

/// First byte of every binary stream. Files not starting with it are
/// treated as text input.
pub const HANDSHAKE_MAGIC: u8 = 0xF0;

/// Payload alignment of the binary protocol.
pub const ALIGN: usize = 4;

/// Endianness tags used in the handshake packet.
pub const HS_LITTLE_ENDIAN: u8 = 0;
pub const HS_BIG_ENDIAN: u8 = 1;

const fn fourcc(tag: [u8; 4]) -> u32 {
    (tag[0] as u32) | (tag[1] as u32) << 8 | (tag[2] as u32) << 16 | (tag[3] as u32) << 24
}

/// Packet types, encoded as four-character codes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    ModuleInfo = fourcc(*b"MINF"),
    MemoryMap = fourcc(*b"MMAP"),
    ContextRegistry = fourcc(*b"CTXR"),
    FunctionCall = fourcc(*b"CALL"),
    Backtrace = fourcc(*b"BTRC"),
    FunctionArgs = fourcc(*b"ARGS"),
    ProcessInfo = fourcc(*b"PINF"),
    NewLibrary = fourcc(*b"NLIB"),
    HeapInfo = fourcc(*b"HINF"),
    OutputSettings = fourcc(*b"OCFG"),
    ResourceRegistry = fourcc(*b"RESR"),
    Attachment = fourcc(*b"FILE"),
}

impl PacketType {
    pub fn from_wire(raw: u32) -> Option<Self> {
        use PacketType::*;
        [
            ModuleInfo,
            MemoryMap,
            ContextRegistry,
            FunctionCall,
            Backtrace,
            FunctionArgs,
            ProcessInfo,
            NewLibrary,
            HeapInfo,
            OutputSettings,
            ResourceRegistry,
            Attachment,
        ]
        .into_iter()
        .find(|t| *t as u32 == raw)
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("truncated packet: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown packet type 0x{0:08x}")]
    UnknownPacket(u32),
    #[error("string of {0} bytes exceeds the u16 length field")]
    StringTooLong(usize),
    #[error("packet string is not valid UTF-8")]
    BadString,
    #[error("missing handshake sentinel (first byte 0x{0:02x})")]
    BadMagic(u8),
    #[error("endianness mismatch: stream {stream}, host {host}")]
    EndiannessMismatch { stream: u8, host: u8 },
    #[error("pointer size mismatch: stream {stream}, host {host}")]
    PointerSizeMismatch { stream: u8, host: u8 },
    #[error("buffer too small for packet of {0} bytes")]
    NoSpace(usize),
}

/// Rounds `size` up to the packet alignment.
#[inline]
pub const fn align_size(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// Host endianness tag as encoded in handshake packets.
#[inline]
pub fn host_endianness() -> u8 {
    if cfg!(target_endian = "little") {
        HS_LITTLE_ENDIAN
    } else {
        HS_BIG_ENDIAN
    }
}

/// Number of bytes a string occupies on the wire.
#[inline]
pub const fn string_wire_size(s: &str) -> usize {
    align_size(2 + s.len())
}

/// The leading handshake packet.
///
/// Not framed like the other packets: `0xF0`, a one-byte length covering
/// the remaining bytes, the protocol version pair, the length-prefixed
/// architecture tag, the endianness tag and the pointer width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub vmajor: u8,
    pub vminor: u8,
    pub arch: String,
    pub endianness: u8,
    pub pointer_size: u8,
}

impl Handshake {
    pub fn new(arch: &str) -> Self {
        Self {
            vmajor: VERSION_MAJOR,
            vminor: VERSION_MINOR,
            arch: arch.to_string(),
            endianness: host_endianness(),
            pointer_size: std::mem::size_of::<usize>() as u8,
        }
    }

    /// True when the stream is at least version `major.minor`.
    pub fn at_least(&self, major: u8, minor: u8) -> bool {
        self.vmajor > major || (self.vmajor == major && self.vminor >= minor)
    }

    /// Packets of version < 2 streams carry the length field first.
    pub fn length_first_framing(&self) -> bool {
        self.vmajor < 2
    }

    /// Encodes the handshake into `buf`, returning the encoded size.
    /// The buffer must hold at least `6 + arch.len()` rounded up to the
    /// packet alignment.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtoError> {
        let size = align_size(6 + self.arch.len());
        if buf.len() < size {
            return Err(ProtoError::NoSpace(size));
        }
        // Both the arch tag and the total packet length must fit their
        // one-byte fields.
        if size - 2 > u8::MAX as usize {
            return Err(ProtoError::StringTooLong(self.arch.len()));
        }
        buf[0] = HANDSHAKE_MAGIC;
        buf[1] = (size - 2) as u8;
        buf[2] = self.vmajor;
        buf[3] = self.vminor;
        buf[4] = self.arch.len() as u8;
        buf[5..5 + self.arch.len()].copy_from_slice(self.arch.as_bytes());
        let mut pos = 5 + self.arch.len();
        buf[pos] = self.endianness;
        pos += 1;
        buf[pos] = self.pointer_size;
        pos += 1;
        while pos < size {
            buf[pos] = 0;
            pos += 1;
        }
        Ok(size)
    }

    /// Decodes a handshake from the start of `data`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), ProtoError> {
        if data.len() < 2 {
            return Err(ProtoError::Truncated {
                needed: 2,
                available: data.len(),
            });
        }
        if data[0] != HANDSHAKE_MAGIC {
            return Err(ProtoError::BadMagic(data[0]));
        }
        let size = data[1] as usize + 2;
        if data.len() < size {
            return Err(ProtoError::Truncated {
                needed: size,
                available: data.len(),
            });
        }
        let vmajor = data[2];
        let vminor = data[3];
        let arch_len = data[4] as usize;
        let arch_end = 5 + arch_len;
        if arch_end + 2 > size {
            return Err(ProtoError::Truncated {
                needed: arch_end + 2,
                available: size,
            });
        }
        let arch = std::str::from_utf8(&data[5..arch_end])
            .map_err(|_| ProtoError::BadString)?
            .to_string();
        Ok((
            Self {
                vmajor,
                vminor,
                arch,
                endianness: data[arch_end],
                pointer_size: data[arch_end + 1],
            },
            size,
        ))
    }

    /// A stream whose endianness or pointer width differs from the host's
    /// cannot be decoded; architecture tag mismatches are left to the
    /// caller to warn about.
    pub fn check_compatibility(&self) -> Result<(), ProtoError> {
        let host = host_endianness();
        if self.endianness != host {
            return Err(ProtoError::EndiannessMismatch {
                stream: self.endianness,
                host,
            });
        }
        let host_ptr = std::mem::size_of::<usize>() as u8;
        if self.pointer_size != host_ptr {
            return Err(ProtoError::PointerSizeMismatch {
                stream: self.pointer_size,
                host: host_ptr,
            });
        }
        Ok(())
    }
}

/// Cursor writing packet payloads into a caller-provided buffer.
///
/// Used both by the tracer (writing into its pipe ring buffer without
/// allocating) and by the tools (writing into plain vectors).
pub struct PayloadWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PayloadWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn written(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8], ProtoError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtoError::NoSpace(self.pos + n));
        }
        let slice = &mut self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), ProtoError> {
        self.reserve(4)?.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    pub fn put_pointer(&mut self, value: u64) -> Result<(), ProtoError> {
        let native = value as usize;
        self.reserve(std::mem::size_of::<usize>())?
            .copy_from_slice(&native.to_ne_bytes());
        Ok(())
    }

    /// Writes a length-prefixed string padded to the packet alignment.
    pub fn put_str(&mut self, value: &str) -> Result<(), ProtoError> {
        let len = value.len();
        if len > u16::MAX as usize {
            return Err(ProtoError::StringTooLong(len));
        }
        let total = string_wire_size(value);
        let slice = self.reserve(total)?;
        slice[..2].copy_from_slice(&(len as u16).to_ne_bytes());
        slice[2..2 + len].copy_from_slice(value.as_bytes());
        for b in &mut slice[2 + len..] {
            *b = 0;
        }
        Ok(())
    }

    /// Starts a framed packet, returning the offset where [`Self::finish_packet`]
    /// patches the length once the payload is complete.
    pub fn start_packet(&mut self, ptype: PacketType) -> Result<usize, ProtoError> {
        self.put_u32(ptype as u32)?;
        let length_at = self.pos;
        self.put_u32(0)?;
        Ok(length_at)
    }

    pub fn finish_packet(&mut self, length_at: usize) {
        let len = (self.pos - length_at - 4) as u32;
        self.buf[length_at..length_at + 4].copy_from_slice(&len.to_ne_bytes());
    }
}

/// Cursor decoding a packet payload.
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if self.pos + n > self.data.len() {
            return Err(ProtoError::Truncated {
                needed: self.pos + n,
                available: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtoError> {
        let bytes = self.take(4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_pointer(&mut self) -> Result<u64, ProtoError> {
        let n = std::mem::size_of::<usize>();
        let bytes = self.take(n)?;
        let mut raw = [0u8; 8];
        raw[..n].copy_from_slice(bytes);
        Ok(u64::from_ne_bytes(raw))
    }

    pub fn get_str(&mut self) -> Result<String, ProtoError> {
        let len_bytes = self.take(2)?;
        let len = u16::from_ne_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let value = std::str::from_utf8(self.take(len)?)
            .map_err(|_| ProtoError::BadString)?
            .to_string();
        // Skip the alignment padding of the string field.
        let consumed = 2 + len;
        self.pos += align_size(consumed) - consumed;
        Ok(value)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// A decoded packet frame borrowed from the input buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub raw_type: u32,
    pub payload: &'a [u8],
    /// Total wire size of the frame, header included.
    pub size: usize,
}

/// Splits the next frame off `data`. Returns `Ok(None)` when the buffer
/// does not yet hold a complete frame.
pub fn next_frame(data: &[u8], length_first: bool) -> Result<Option<Frame<'_>>, ProtoError> {
    if data.len() < 8 {
        return Ok(None);
    }
    let first = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
    let second = u32::from_ne_bytes([data[4], data[5], data[6], data[7]]);
    let (raw_type, len) = if length_first {
        (second, first as usize)
    } else {
        (first, second as usize)
    };
    let total = 8 + len;
    if data.len() < total {
        return Ok(None);
    }
    Ok(Some(Frame {
        raw_type,
        payload: &data[8..total],
        size: total,
    }))
}
