// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The packet relay loop.
//!
//! Packets from the target are forwarded unchanged to the downstream sink
//! (a binary trace file or a spawned post-processor), with four
//! exceptions: output settings are consumed to open the sink, a zero
//! process-info timestamp is stamped in place, new-library events are
//! replaced by a memory-map rescan, and attachments are checked on disk
//! before forwarding.

use crate::maps::MapCache;
use anyhow::Context;
use rtrace_common::proto::{self, PacketType, PayloadReader, PayloadWriter};
use rtrace_common::record::MemoryMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use tracing::{debug, warn};

const BUFFER_SIZE: usize = 4096;

/// SIGINT escalation counter; the first request drains, the second
/// abandons buffered data.
pub static STOP_REQUESTS: AtomicU32 = AtomicU32::new(0);

/// Pid of the traced process, published once its process-info packet is
/// seen so the SIGINT handler can forward the toggle signal.
pub static TRACEE_PID: AtomicI32 = AtomicI32::new(0);

/// Listener configuration coming from the command line; output settings
/// from the stream override the empty fields.
#[derive(Debug, Default, Clone)]
pub struct ListenOptions {
    pub output_dir: Option<PathBuf>,
    pub postproc: Option<String>,
    pub disable_packet_buffering: bool,
    /// Traced pid when known up front (toggle mode); otherwise learned
    /// from the process-info packet.
    pub pid: u32,
}

enum Sink {
    /// Output settings not seen yet; packets preceding them are queued.
    Unconnected(Vec<u8>),
    File(std::fs::File),
    PostProcessor(Child),
}

pub struct Listener {
    options: ListenOptions,
    sink: Sink,
    out_buffer: Vec<u8>,
    handshake: Vec<u8>,
    maps: MapCache,
    pid: u32,
}

impl Listener {
    pub fn new(options: ListenOptions) -> Self {
        let pid = options.pid;
        Self {
            options,
            sink: Sink::Unconnected(Vec::new()),
            out_buffer: Vec::with_capacity(BUFFER_SIZE * 2),
            handshake: Vec::new(),
            maps: MapCache::new(),
            pid,
        }
    }

    fn sink_write(sink: &mut Sink, data: &[u8]) -> std::io::Result<()> {
        match sink {
            Sink::Unconnected(pending) => {
                pending.extend_from_slice(data);
                Ok(())
            }
            Sink::File(file) => file.write_all(data),
            Sink::PostProcessor(child) => match child.stdin.as_mut() {
                Some(stdin) => stdin.write_all(data),
                None => Ok(()),
            },
        }
    }

    fn flush_buffer(&mut self) -> anyhow::Result<()> {
        if !self.out_buffer.is_empty() {
            let buffer = std::mem::take(&mut self.out_buffer);
            Self::sink_write(&mut self.sink, &buffer)
                .context("failed to write to the file/post-processor pipe")?;
            self.out_buffer = buffer;
            self.out_buffer.clear();
        }
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if self.options.disable_packet_buffering {
            Self::sink_write(&mut self.sink, data)
                .context("failed to write to the file/post-processor pipe")?;
            return Ok(());
        }
        self.out_buffer.extend_from_slice(data);
        if self.out_buffer.len() >= BUFFER_SIZE {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Opens the downstream sink once the output settings are known, then
    /// replays the cached handshake and anything queued before it.
    fn connect_output(&mut self) -> anyhow::Result<()> {
        let pending = match &mut self.sink {
            Sink::Unconnected(pending) => std::mem::take(pending),
            _ => return Ok(()),
        };
        let sink = if let Some(postproc) = self.options.postproc.clone() {
            let mut command = Command::new("rtrace-postproc");
            command.args(postproc.split_whitespace());
            if let Some(dir) = &self.options.output_dir {
                command.arg("--output-dir").arg(dir);
            }
            let child = command
                .stdin(Stdio::piped())
                .spawn()
                .context("failed to spawn the post-processor process")?;
            Sink::PostProcessor(child)
        } else {
            let dir = self
                .options
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            let (file, path) = rtrace_common::output::create_unique_file(
                &dir,
                self.pid,
                rtrace_common::BINARY_FILE_SUFFIX,
            )
            .with_context(|| format!("failed to create a trace file in {}", dir.display()))?;
            debug!("writing binary trace to {}", path.display());
            Sink::File(file)
        };
        self.sink = sink;
        let handshake = self.handshake.clone();
        self.write_data(&handshake)?;
        if !pending.is_empty() {
            self.write_data(&pending)?;
        }
        Ok(())
    }

    fn emit_mmap_packets(&mut self, mappings: Vec<MemoryMap>) -> anyhow::Result<()> {
        for mmap in mappings {
            let mut scratch = vec![0u8; proto::align_size(mmap.module.len()) + 64];
            let mut w = PayloadWriter::new(&mut scratch);
            let at = w.start_packet(PacketType::MemoryMap)?;
            w.put_pointer(mmap.from)?;
            w.put_pointer(mmap.to)?;
            w.put_str(&mmap.module)?;
            w.finish_packet(at);
            let size = w.written();
            self.write_data(&scratch[..size])?;
        }
        Ok(())
    }

    fn check_attachment(&self, payload: &[u8]) {
        let mut r = PayloadReader::new(payload);
        let Ok((name, path)) = r.get_str().and_then(|n| Ok((n, r.get_str()?))) else {
            return;
        };
        let mut full = PathBuf::from(&path);
        if full.is_relative() {
            if let Some(dir) = &self.options.output_dir {
                full = dir.join(full);
            }
        }
        match std::fs::metadata(&full) {
            Err(err) => warn!("failed to stat attached file {}: {err}", full.display()),
            Ok(meta) if meta.len() == 0 => {
                warn!("the attached file {} ({name}) has zero size", full.display());
            }
            Ok(_) => {}
        }
    }

    /// Handles one packet. Returns false when relaying must stop (a
    /// second handshake started mid-stream).
    fn process_packet(&mut self, packet: &[u8], raw_type: u32) -> anyhow::Result<bool> {
        let payload = &packet[8..];
        match PacketType::from_wire(raw_type) {
            Some(PacketType::OutputSettings) => {
                let mut r = PayloadReader::new(payload);
                let output_dir = r.get_str().unwrap_or_default();
                let postproc = r.get_str().unwrap_or_default();
                if !output_dir.is_empty() {
                    self.options.output_dir = Some(PathBuf::from(output_dir));
                }
                if !postproc.is_empty() {
                    self.options.postproc = Some(postproc);
                }
                self.connect_output()?;
                // Consumed: the sink never sees output settings.
                return Ok(true);
            }
            Some(PacketType::ProcessInfo) => {
                let mut patched = packet.to_vec();
                let mut r = PayloadReader::new(payload);
                let pid = r.get_u32().unwrap_or(0);
                let sec = r.get_u32().unwrap_or(0);
                if sec == 0 {
                    let now = chrono::Local::now();
                    patched[12..16].copy_from_slice(&(now.timestamp() as u32).to_ne_bytes());
                    patched[16..20].copy_from_slice(
                        &(now.timestamp_subsec_micros()).to_ne_bytes(),
                    );
                }
                self.pid = pid;
                TRACEE_PID.store(pid as i32, Ordering::Release);
                self.write_data(&patched)?;
                return Ok(true);
            }
            Some(PacketType::NewLibrary) => {
                // Not forwarded; answered with a maps rescan instead.
                let pid = self.pid;
                let mappings = self.maps.rescan(pid);
                self.emit_mmap_packets(mappings)?;
                return Ok(true);
            }
            Some(PacketType::Attachment) => {
                self.check_attachment(payload);
            }
            Some(_) => {}
            None => {
                warn!("unknown packet type 0x{raw_type:08x}; forwarding unchanged");
            }
        }
        self.write_data(packet)?;
        Ok(true)
    }

    /// Relays the stream until EOF, a hard stop or a mid-stream
    /// handshake.
    pub fn process(&mut self, input: &mut impl Read) -> anyhow::Result<()> {
        let mut buffer: Vec<u8> = Vec::with_capacity(BUFFER_SIZE * 2);
        let mut chunk = [0u8; BUFFER_SIZE];

        // Cache the handshake; it is replayed once the sink is connected.
        let n = input.read(&mut chunk).context("failed to read from pipe")?;
        if n == 0 {
            anyhow::bail!("failed to read data from pipe");
        }
        buffer.extend_from_slice(&chunk[..n]);
        let (_handshake, consumed) =
            proto::Handshake::decode(&buffer).context("handshake packet processing failed")?;
        self.handshake = buffer[..consumed].to_vec();
        buffer.drain(..consumed);

        'relay: loop {
            loop {
                if buffer.first() == Some(&proto::HANDSHAKE_MAGIC) {
                    warn!("handshake packet received mid-stream; processing what was received");
                    break 'relay;
                }
                // A protocol error stops parsing; what was relayed so far
                // is still flushed below.
                let frame = match proto::next_frame(&buffer, false) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("stopping on a malformed packet: {err}");
                        break 'relay;
                    }
                };
                let size = frame.size;
                let raw_type = frame.raw_type;
                let packet = buffer[..size].to_vec();
                if !self.process_packet(&packet, raw_type)? {
                    break 'relay;
                }
                buffer.drain(..size);
            }
            if STOP_REQUESTS.load(Ordering::Acquire) >= 2 {
                warn!("trace was forced to abort before all data was retrieved");
                break;
            }
            match input.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.flush_buffer()?;
        self.finish()
    }

    /// Closes the sink, waiting for a spawned post-processor to exit.
    fn finish(&mut self) -> anyhow::Result<()> {
        if let Sink::PostProcessor(child) = &mut self.sink {
            drop(child.stdin.take());
            let status = child.wait().context("failed to wait for post-processor")?;
            if !status.success() {
                warn!("post-processor exited with {status}");
            }
        }
        Ok(())
    }

    /// Path of the binary output file pattern, for diagnostics.
    pub fn output_dir(&self) -> &Path {
        self.options
            .output_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtrace_common::proto::Handshake;

    fn handshake_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        let size = Handshake::new("x86_64").encode(&mut buf).unwrap();
        buf.truncate(size);
        buf
    }

    fn packet(ptype: PacketType, fill: impl FnOnce(&mut PayloadWriter)) -> Vec<u8> {
        let mut scratch = vec![0u8; 1024];
        let mut w = PayloadWriter::new(&mut scratch);
        let at = w.start_packet(ptype).unwrap();
        fill(&mut w);
        w.finish_packet(at);
        let size = w.written();
        scratch.truncate(size);
        scratch
    }

    fn process_info_packet(sec: u32) -> Vec<u8> {
        packet(PacketType::ProcessInfo, |w| {
            w.put_u32(4242).unwrap();
            w.put_u32(sec).unwrap();
            w.put_u32(0).unwrap();
            w.put_u32(10).unwrap();
            w.put_str("sample").unwrap();
        })
    }

    fn listener_into_file(dir: &Path) -> Listener {
        Listener::new(ListenOptions {
            output_dir: Some(dir.to_path_buf()),
            ..Default::default()
        })
    }

    fn run(listener: &mut Listener, stream: &[u8]) -> anyhow::Result<()> {
        listener.process(&mut &stream[..])
    }

    #[test]
    fn test_zero_timestamp_is_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = handshake_bytes();
        stream.extend(process_info_packet(0));
        stream.extend(packet(PacketType::OutputSettings, |w| {
            w.put_str("").unwrap();
            w.put_str("").unwrap();
        }));

        let mut listener = listener_into_file(dir.path());
        run(&mut listener, &stream).unwrap();

        let out = std::fs::read(dir.path().join("4242-0.rtrace")).unwrap();
        // handshake + PINF; OCFG was consumed.
        let hs = handshake_bytes();
        assert_eq!(&hs[..], &out[..hs.len()]);
        let frame = proto::next_frame(&out[hs.len()..], false).unwrap().unwrap();
        assert_eq!(PacketType::ProcessInfo as u32, frame.raw_type);
        let mut r = PayloadReader::new(frame.payload);
        assert_eq!(4242, r.get_u32().unwrap());
        assert_ne!(0, r.get_u32().unwrap(), "zero timestamp must be filled");
        assert_eq!(hs.len() + frame.size, out.len());
    }

    #[test]
    fn test_nonzero_timestamp_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = handshake_bytes();
        stream.extend(process_info_packet(1_700_000_000));
        stream.extend(packet(PacketType::OutputSettings, |w| {
            w.put_str("").unwrap();
            w.put_str("").unwrap();
        }));

        let mut listener = listener_into_file(dir.path());
        run(&mut listener, &stream).unwrap();

        let out = std::fs::read(dir.path().join("4242-0.rtrace")).unwrap();
        let hs_len = handshake_bytes().len();
        let frame = proto::next_frame(&out[hs_len..], false).unwrap().unwrap();
        let mut r = PayloadReader::new(frame.payload);
        r.get_u32().unwrap();
        assert_eq!(1_700_000_000, r.get_u32().unwrap());
    }

    #[test]
    fn test_packets_before_settings_are_queued() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = handshake_bytes();
        stream.extend(process_info_packet(1));
        let module_info = packet(PacketType::ModuleInfo, |w| {
            w.put_u32(0).unwrap();
            w.put_u32(2 << 16).unwrap();
            w.put_str("main").unwrap();
        });
        stream.extend(&module_info);
        stream.extend(packet(PacketType::OutputSettings, |w| {
            w.put_str("").unwrap();
            w.put_str("").unwrap();
        }));

        let mut listener = listener_into_file(dir.path());
        run(&mut listener, &stream).unwrap();

        let out = std::fs::read(dir.path().join("4242-0.rtrace")).unwrap();
        // Queued packets follow the replayed handshake in order.
        let hs_len = handshake_bytes().len();
        let first = proto::next_frame(&out[hs_len..], false).unwrap().unwrap();
        assert_eq!(PacketType::ProcessInfo as u32, first.raw_type);
        let second = proto::next_frame(&out[hs_len + first.size..], false)
            .unwrap()
            .unwrap();
        assert_eq!(PacketType::ModuleInfo as u32, second.raw_type);
    }

    #[test]
    fn test_second_handshake_stops_relay() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = handshake_bytes();
        stream.extend(packet(PacketType::OutputSettings, |w| {
            w.put_str("").unwrap();
            w.put_str("").unwrap();
        }));
        stream.extend(process_info_packet(1));
        stream.extend(handshake_bytes());
        stream.extend(process_info_packet(2));

        let mut listener = listener_into_file(dir.path());
        run(&mut listener, &stream).unwrap();

        // Output settings arrived before the process info, so the file is
        // named after the still-unknown pid.
        let out = std::fs::read(dir.path().join("0-0.rtrace")).unwrap();
        let hs_len = handshake_bytes().len();
        let first = proto::next_frame(&out[hs_len..], false).unwrap().unwrap();
        // Only the packets before the second handshake were relayed.
        assert_eq!(hs_len + first.size, out.len());
    }

    #[test]
    fn test_new_library_not_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = handshake_bytes();
        stream.extend(packet(PacketType::OutputSettings, |w| {
            w.put_str("").unwrap();
            w.put_str("").unwrap();
        }));
        stream.extend(packet(PacketType::NewLibrary, |w| {
            w.put_str("*").unwrap();
        }));

        let mut listener = listener_into_file(dir.path());
        // pid 0: the rescan finds no maps file and emits nothing.
        run(&mut listener, &stream).unwrap();

        let out = std::fs::read(dir.path().join("0-0.rtrace")).unwrap();
        assert_eq!(handshake_bytes().len(), out.len());
    }
}
