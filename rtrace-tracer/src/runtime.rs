// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracer runtime: the event-emission API for wrapper modules, the
//! pre-processor pipe with its ring buffer, the signal-driven tracing
//! toggle and the module and resource registries.
//!
//! The emission paths run inside wrapped functions and inside the toggle
//! signal handler, which constrains them to async-signal-safe behaviour:
//! no allocation, no blocking locks, raw `write`/`open` only. Everything
//! the handler needs (pipe path, process name, registries) is staged
//! during [`initialize`], before the handler can run with tracing
//! payload.

use crate::context;
use crate::module::ModuleDecl;
use crate::options::Options;
use crate::unwind::{self, Unwinder, MAX_FRAMES};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use rtrace_common::proto::{Handshake, PacketType, PayloadWriter, ProtoError};
use rtrace_common::record::CallKind;
use std::ffi::CString;
use std::sync::OnceLock;

pub const MAX_MODULES: usize = 16;
pub const MAX_RESOURCES: usize = 32;

/// The send window; the ring holds twice this much so a packet group can
/// be assembled past the flush boundary.
const SEND_BUFFER_SIZE: usize = 4096;

static OPTIONS: OnceLock<Options> = OnceLock::new();
static PROC_NAME: OnceLock<String> = OnceLock::new();

/// Handshake packet pre-encoded at initialization so the signal handler
/// emits it without allocating.
static HANDSHAKE_BYTES: OnceLock<Vec<u8>> = OnceLock::new();

/// 0 = untouched, 1 = in progress, 2 = done.
static INIT_STATE: AtomicU8 = AtomicU8::new(0);

static ENABLED: AtomicBool = AtomicBool::new(false);
static PIPE_FD: AtomicI32 = AtomicI32::new(-1);
static PREPROC_PID: AtomicI32 = AtomicI32::new(0);

/// Heap bottom sampled at initialization, before the target allocates.
static HEAP_BOTTOM: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

/// Writes a diagnostic to stderr with raw `write`, usable from any
/// context the tracer runs in.
pub(crate) fn diag(msg: &str) {
    // SAFETY: write(2) is async-signal-safe; the buffer lives for the call.
    unsafe { libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len()) };
}

/// Like [`diag`], with the current errno appended; the number is
/// formatted on the stack to keep the path allocation free.
pub(crate) fn diag_errno(msg: &str) {
    diag(msg);
    let mut value = errno::errno().0.unsigned_abs();
    let mut digits = [0u8; 12];
    let mut len = 0;
    loop {
        digits[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    digits[..len].reverse();
    // SAFETY: the buffer holds ASCII digits only.
    diag(unsafe { core::str::from_utf8_unchecked(&digits[..len]) });
    diag(")\n");
}

/// Compare-and-swap spin lock. Held only for buffer reservation and the
/// occasional flush; never across allocation.
pub(crate) struct SpinLock(AtomicBool);

impl SpinLock {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinGuard(self)
    }
}

pub(crate) struct SpinGuard<'a>(&'a SpinLock);

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Pipe output buffer
// ---------------------------------------------------------------------------

struct PipeState {
    head: usize,
    buf: [u8; SEND_BUFFER_SIZE * 2],
}

struct PipeBuffer {
    lock: SpinLock,
    state: UnsafeCell<PipeState>,
}

// SAFETY: the state cell is only touched under the spin lock.
unsafe impl Sync for PipeBuffer {}

static PIPE: PipeBuffer = PipeBuffer {
    lock: SpinLock::new(),
    state: UnsafeCell::new(PipeState {
        head: 0,
        buf: [0; SEND_BUFFER_SIZE * 2],
    }),
};

impl PipeBuffer {
    fn with<R>(&self, f: impl FnOnce(&mut PipeState) -> R) -> R {
        let _guard = self.lock.lock();
        // SAFETY: exclusive access guaranteed by the spin lock.
        f(unsafe { &mut *self.state.get() })
    }
}

impl PipeState {
    fn flush(&mut self) {
        let size = self.head;
        self.head = 0;
        if size == 0 {
            return;
        }
        let fd = PIPE_FD.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        // SAFETY: fd is the open pipe; the buffer region is valid.
        let rc = unsafe { libc::write(fd, self.buf.as_ptr() as *const libc::c_void, size) };
        if rc < 0 {
            diag_errno("ERROR: rtrace failed to write into the pre-processor pipe, disabling tracing (errno ");
            PIPE_FD.store(-1, Ordering::Release);
            ENABLED.store(false, Ordering::Release);
            enable_modules(false);
        }
    }

    /// Accounts a packet group of `size` bytes appended at the old head.
    /// Crossing the send-window boundary flushes the window and relocates
    /// the group to the start of the ring.
    fn commit(&mut self, size: usize) {
        let start = self.head;
        if start + size > SEND_BUFFER_SIZE {
            let head = self.head;
            self.head = 0;
            if head > 0 {
                let fd = PIPE_FD.load(Ordering::Acquire);
                if fd >= 0 {
                    // SAFETY: as in flush().
                    let rc =
                        unsafe { libc::write(fd, self.buf.as_ptr() as *const libc::c_void, head) };
                    if rc < 0 {
                        diag_errno("ERROR: rtrace failed to write into the pre-processor pipe, disabling tracing (errno ");
                        PIPE_FD.store(-1, Ordering::Release);
                        ENABLED.store(false, Ordering::Release);
                        enable_modules(false);
                        return;
                    }
                }
            }
            self.buf.copy_within(start..start + size, 0);
            self.head = size;
        } else {
            self.head = start + size;
        }
        let buffering = OPTIONS
            .get()
            .map(|options| options.enable_packet_buffering)
            .unwrap_or(true);
        if !buffering {
            self.flush();
        }
    }
}

/// Assembles one atomic packet group in the locked buffer. The closure
/// writes into the reservation; an oversized group is dropped whole.
fn emit(f: impl FnOnce(&mut PayloadWriter) -> Result<(), ProtoError>) {
    PIPE.with(|state| {
        let head = state.head;
        let mut w = PayloadWriter::new(&mut state.buf[head..]);
        match f(&mut w) {
            Ok(()) => {
                let size = w.written();
                state.commit(size);
            }
            Err(_) => {
                diag("WARNING: rtrace dropped an oversized packet group\n");
            }
        }
    });
}

pub fn flush() {
    PIPE.with(PipeState::flush);
}

// ---------------------------------------------------------------------------
// Module and resource registries
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct ModuleEntry {
    id: u32,
    name: &'static str,
    vmajor: u16,
    vminor: u16,
    enable: fn(bool),
}

#[derive(Clone, Copy)]
struct ResourceEntry {
    id: u32,
    type_tag: &'static str,
    desc: &'static str,
    flags: u32,
}

struct Registry<T: Copy, const N: usize> {
    lock: SpinLock,
    entries: UnsafeCell<[Option<T>; N]>,
}

// SAFETY: the entry array is only touched under the spin lock.
unsafe impl<T: Copy, const N: usize> Sync for Registry<T, N> {}

impl<T: Copy, const N: usize> Registry<T, N> {
    const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            entries: UnsafeCell::new([None; N]),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut [Option<T>; N]) -> R) -> R {
        let _guard = self.lock.lock();
        // SAFETY: exclusive access guaranteed by the spin lock.
        f(unsafe { &mut *self.entries.get() })
    }
}

static MODULES: Registry<ModuleEntry, MAX_MODULES> = Registry::new();
static RESOURCES: Registry<ResourceEntry, MAX_RESOURCES> = Registry::new();

fn enable_modules(value: bool) {
    MODULES.with(|entries| {
        for entry in entries.iter().flatten() {
            (entry.enable)(value);
        }
    });
}

/// Registers a tracing module. Every symbol slot must have resolved;
/// a null slot means the wrapper would crash the target, so startup
/// fails instead. Module id is the next free bitmask position.
pub fn register_module(decl: &ModuleDecl) -> u32 {
    let mut ok = true;
    for symbol in decl.symbols {
        if symbol.addr.load(Ordering::Acquire) == 0 {
            diag("ERROR: rtrace module traced function could not be resolved: ");
            diag(symbol.name);
            diag("\n");
            ok = false;
        }
    }
    if !ok {
        std::process::abort();
    }

    let entry = MODULES.with(|entries| {
        let index = entries.iter().position(|slot| slot.is_none())?;
        let entry = ModuleEntry {
            id: 1 << index,
            name: decl.name,
            vmajor: decl.vmajor,
            vminor: decl.vminor,
            enable: decl.enable,
        };
        entries[index] = Some(entry);
        Some(entry)
    });
    let Some(entry) = entry else {
        return 0;
    };

    (decl.enable)(tracing_enabled());
    if tracing_enabled() {
        write_module_info(&entry);
    }
    entry.id
}

/// Registers a resource type, deduplicated by tag: registering the same
/// tag twice returns the previously assigned id.
pub fn register_resource(type_tag: &'static str, desc: &'static str, flags: u32) -> u32 {
    let (entry, fresh) = RESOURCES.with(|entries| {
        for slot in entries.iter().flatten() {
            if slot.type_tag == type_tag {
                return (Some(*slot), false);
            }
        }
        let Some(index) = entries.iter().position(|slot| slot.is_none()) else {
            return (None, false);
        };
        let entry = ResourceEntry {
            id: index as u32 + 1,
            type_tag,
            desc,
            flags,
        };
        entries[index] = Some(entry);
        (Some(entry), true)
    });
    let Some(entry) = entry else {
        return 0;
    };
    if fresh && tracing_enabled() {
        write_resource_registry(&entry);
    }
    entry.id
}

// ---------------------------------------------------------------------------
// Packet emission
// ---------------------------------------------------------------------------

pub fn tracing_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

fn write_handshake() {
    let Some(bytes) = HANDSHAKE_BYTES.get() else {
        diag("ERROR: rtrace handshake emitted before initialization\n");
        return;
    };
    PIPE.with(|state| {
        let head = state.head;
        let size = bytes.len();
        if head + size > state.buf.len() {
            return;
        }
        state.buf[head..head + size].copy_from_slice(bytes);
        state.commit(size);
    });
}

fn write_output_settings(options: &Options) {
    emit(|w| {
        let at = w.start_packet(PacketType::OutputSettings)?;
        if options.manage_preproc {
            // The managed pre-processor reads its own environment.
            w.put_str("")?;
            w.put_str("")?;
        } else {
            w.put_str(&options.output_dir)?;
            w.put_str(&options.postproc)?;
        }
        w.finish_packet(at);
        Ok(())
    });
}

fn write_process_info(options: &Options) {
    emit(|w| {
        let at = w.start_packet(PacketType::ProcessInfo)?;
        w.put_u32(std::process::id())?;
        // Zero timestamp; the pre-processor stamps it at first relay.
        w.put_u32(0)?;
        w.put_u32(0)?;
        w.put_u32(options.backtrace_depth)?;
        w.put_str(PROC_NAME.get().map(String::as_str).unwrap_or(""))?;
        w.finish_packet(at);
        Ok(())
    });
}

fn write_module_info(entry: &ModuleEntry) {
    emit(|w| {
        let at = w.start_packet(PacketType::ModuleInfo)?;
        w.put_u32(entry.id)?;
        w.put_u32((entry.vmajor as u32) << 16 | entry.vminor as u32)?;
        w.put_str(entry.name)?;
        w.finish_packet(at);
        Ok(())
    });
}

fn write_resource_registry(entry: &ResourceEntry) {
    emit(|w| {
        let at = w.start_packet(PacketType::ResourceRegistry)?;
        w.put_u32(entry.id)?;
        w.put_u32(entry.flags)?;
        w.put_str(entry.type_tag)?;
        w.put_str(entry.desc)?;
        w.finish_packet(at);
        Ok(())
    });
}

pub fn write_context_registry(id: u32, name: &str) {
    if !tracing_enabled() {
        return;
    }
    emit(|w| {
        let at = w.start_packet(PacketType::ContextRegistry)?;
        w.put_u32(id)?;
        w.put_str(name)?;
        w.finish_packet(at);
        Ok(())
    });
}

/// Emits a new-library packet; the pre-processor answers it with a memory
/// map rescan. The sentinel path `*` marks enable/disable boundaries.
pub fn write_new_library(path: &str) {
    emit(|w| {
        let at = w.start_packet(PacketType::NewLibrary)?;
        w.put_str(path)?;
        w.finish_packet(at);
        Ok(())
    });
}

/// Emits a file attachment, with the path relative to the output
/// directory when both share a prefix.
pub fn write_attachment(name: &str, path: &str) {
    let relative = OPTIONS
        .get()
        .and_then(|options| relative_path(&options.output_dir, path));
    emit(|w| {
        let at = w.start_packet(PacketType::Attachment)?;
        w.put_str(name)?;
        w.put_str(relative.as_deref().unwrap_or(path))?;
        w.finish_packet(at);
        Ok(())
    });
}

fn relative_path(from_dir: &str, to: &str) -> Option<String> {
    if from_dir.is_empty() {
        return None;
    }
    let from: Vec<&str> = from_dir.split('/').filter(|c| !c.is_empty()).collect();
    let to_components: Vec<&str> = to.split('/').filter(|c| !c.is_empty()).collect();
    if !to.starts_with('/') {
        return None;
    }
    let common = from
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 {
        return None;
    }
    let mut out = String::new();
    for _ in common..from.len() {
        out.push_str("../");
    }
    out.push_str(&to_components[common..].join("/"));
    Some(out)
}

// ---------------------------------------------------------------------------
// Heap statistics
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Default)]
struct HeapCounters {
    arena: u32,
    ordblks: u32,
    smblks: u32,
    hblks: u32,
    hblkhd: u32,
    usmblks: u32,
    fsmblks: u32,
    uordblks: u32,
    fordblks: u32,
    keepcost: u32,
}

struct HeapStats {
    lock: SpinLock,
    counters: UnsafeCell<HeapCounters>,
}

// SAFETY: the counters are only touched under the spin lock.
unsafe impl Sync for HeapStats {}

static HEAP_STATS: HeapStats = HeapStats {
    lock: SpinLock::new(),
    counters: UnsafeCell::new(HeapCounters {
        arena: 0,
        ordblks: 0,
        smblks: 0,
        hblks: 0,
        hblkhd: 0,
        usmblks: 0,
        fsmblks: 0,
        uordblks: 0,
        fordblks: 0,
        keepcost: 0,
    }),
};

fn heap_end() -> usize {
    // SAFETY: sbrk(0) only queries the break.
    unsafe { libc::sbrk(0) as usize }
}

/// Samples the allocator statistics; called by allocation wrappers after
/// successful allocations so the disable-time snapshot is current.
pub fn store_heap_info() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: mallinfo only reads allocator state.
        let info = unsafe { libc::mallinfo() };
        let _guard = HEAP_STATS.lock.lock();
        // SAFETY: exclusive access guaranteed by the spin lock.
        let counters = unsafe { &mut *HEAP_STATS.counters.get() };
        *counters = HeapCounters {
            arena: info.arena as u32,
            ordblks: info.ordblks as u32,
            smblks: info.smblks as u32,
            hblks: info.hblks as u32,
            hblkhd: info.hblkhd as u32,
            usmblks: info.usmblks as u32,
            fsmblks: info.fsmblks as u32,
            uordblks: info.uordblks as u32,
            fordblks: info.fordblks as u32,
            keepcost: info.keepcost as u32,
        };
    }
}

fn write_heap_info() {
    let counters = {
        let _guard = HEAP_STATS.lock.lock();
        // SAFETY: exclusive access guaranteed by the spin lock.
        unsafe { *HEAP_STATS.counters.get() }
    };
    if counters.arena == 0 {
        return;
    }
    emit(|w| {
        let at = w.start_packet(PacketType::HeapInfo)?;
        w.put_pointer(HEAP_BOTTOM.load(Ordering::Acquire) as u64)?;
        w.put_pointer(heap_end() as u64)?;
        for value in [
            counters.arena,
            counters.ordblks,
            counters.smblks,
            counters.hblks,
            counters.hblkhd,
            counters.usmblks,
            counters.fsmblks,
            counters.uordblks,
            counters.fordblks,
            counters.keepcost,
        ] {
            w.put_u32(value)?;
        }
        w.finish_packet(at);
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Function call emission
// ---------------------------------------------------------------------------

/// Emits a call event with its optional argument list and the captured
/// backtrace as one atomic packet group.
///
/// Must not be entered while the re-entry lock is held: that would mean
/// the unwinder recursed through the emitter, which cannot be recovered
/// without risking silent corruption.
pub fn write_function_call(
    kind: CallKind,
    res_type_id: u32,
    name: &str,
    res_size: u32,
    res_id: usize,
    args: Option<&[(&str, &str)]>,
) {
    if !tracing_enabled() {
        return;
    }
    let Some(options) = OPTIONS.get() else {
        return;
    };

    let mut frames = [0usize; MAX_FRAMES];
    let mut nframes = 0;
    if options.backtrace_depth > 0 && options.filter.validate(kind, res_size) {
        if unwind::lock_held() {
            diag("ERROR: infinite recursion detected: backtrace() re-entered the emitter via ");
            diag(name);
            diag("()\n");
            std::process::abort();
        }
        let unwinder = if options.frame_pointers {
            Unwinder::FramePointers
        } else {
            Unwinder::Backtrace
        };
        unwind::set_lock();
        nframes = unwind::capture(unwinder, &mut frames, options.backtrace_depth as usize);
        unwind::clear_lock();
    }

    let timestamp = if options.enable_timestamps {
        monotonic_ms_of_day()
    } else {
        0
    };
    let context = context::current_mask();

    emit(|w| {
        let at = w.start_packet(PacketType::FunctionCall)?;
        w.put_u32(res_type_id)?;
        w.put_u32(context)?;
        w.put_u32(timestamp)?;
        w.put_u32(kind as u32)?;
        w.put_str(name)?;
        w.put_u32(res_size)?;
        w.put_pointer(res_id as u64)?;
        w.finish_packet(at);

        if let Some(args) = args {
            let at = w.start_packet(PacketType::FunctionArgs)?;
            w.put_u32(args.len() as u32)?;
            for (name, value) in args {
                w.put_str(name)?;
                w.put_str(value)?;
            }
            w.finish_packet(at);
        }

        // The backtrace packet is emitted even when empty so readers can
        // attach it to the preceding call unambiguously.
        let at = w.start_packet(PacketType::Backtrace)?;
        w.put_u32(nframes as u32)?;
        for frame in &frames[..nframes] {
            w.put_pointer(*frame as u64)?;
        }
        w.finish_packet(at);
        Ok(())
    });
}

fn monotonic_ms_of_day() -> u32 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime is async-signal-safe and ts outlives the call.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_nsec / 1_000_000) as u32 + (ts.tv_sec % (60 * 60 * 24)) as u32 * 1000
}

// ---------------------------------------------------------------------------
// Pipe lifecycle and the signal toggle
// ---------------------------------------------------------------------------

fn open_pipe(options: &Options) -> i32 {
    if options.manage_preproc {
        return spawn_preproc();
    }
    // SAFETY: the path is a valid C string staged at initialization.
    let accessible = unsafe { libc::access(options.pipe_path.as_ptr(), libc::W_OK) } == 0;
    if !accessible {
        diag(
            "WARNING: failed to open the pre-processor pipe; start the pre-processor \
             in managed mode or send the toggle signal through it. Tracing is not enabled.\n",
        );
        return -1;
    }
    // SAFETY: as above.
    unsafe { libc::open(options.pipe_path.as_ptr(), libc::O_WRONLY) }
}

/// Managed-mode argv, staged as C strings so the fork/exec path stays
/// allocation free.
static PREPROC_ARGV: OnceLock<[CString; 2]> = OnceLock::new();

#[cfg(not(target_os = "linux"))]
fn spawn_preproc() -> i32 {
    diag("WARNING: managed mode is only supported on Linux\n");
    -1
}

#[cfg(target_os = "linux")]
fn spawn_preproc() -> i32 {
    let Some(argv) = PREPROC_ARGV.get() else {
        return -1;
    };
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid two-element array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return -1;
    }
    // SAFETY: fork/dup2/execvp are async-signal-safe; the child only
    // touches staged static data before exec.
    unsafe {
        let pid = libc::fork();
        if pid == -1 {
            libc::close(fds[0]);
            libc::close(fds[1]);
            return -1;
        }
        if pid == 0 {
            libc::close(fds[1]);
            libc::dup2(fds[0], libc::STDIN_FILENO);
            let argv_ptrs = [argv[0].as_ptr(), argv[1].as_ptr(), core::ptr::null()];
            libc::execvp(argv[0].as_ptr(), argv_ptrs.as_ptr());
            diag("ERROR: failed to execute the pre-processor process\n");
            libc::_exit(1);
        }
        libc::close(fds[0]);
        PREPROC_PID.store(pid, Ordering::Release);
        fds[1]
    }
}

fn close_pipe() {
    let fd = PIPE_FD.swap(-1, Ordering::AcqRel);
    if fd >= 0 {
        // SAFETY: fd is the pipe descriptor owned by the runtime.
        unsafe { libc::close(fd) };
    }
    let child = PREPROC_PID.swap(0, Ordering::AcqRel);
    if child > 0 {
        let mut status = 0;
        // SAFETY: waiting on the managed child we forked.
        unsafe { libc::waitpid(child, &mut status, 0) };
    }
}

fn write_initial_data(options: &Options) {
    PIPE.with(|state| state.head = 0);
    write_handshake();
    write_output_settings(options);
    write_process_info(options);
    write_module_info(&ModuleEntry {
        id: 0,
        name: "main",
        vmajor: 2,
        vminor: 0,
        enable: |_| {},
    });
    MODULES.with(|entries| {
        for entry in entries.iter().flatten() {
            write_module_info(entry);
        }
    });
    RESOURCES.with(|entries| {
        for entry in entries.iter().flatten() {
            write_resource_registry(entry);
        }
    });
    write_new_library("*");
    flush();
}

/// Turns tracing on: opens the pipe, emits the start-of-stream packets
/// and flips every registered module to its tracing table. Idempotent.
pub fn enable_tracing() {
    let Some(options) = OPTIONS.get() else {
        return;
    };
    if ENABLED.swap(true, Ordering::AcqRel) {
        return;
    }
    let fd = open_pipe(options);
    if fd < 0 {
        ENABLED.store(false, Ordering::Release);
        enable_modules(false);
        return;
    }
    PIPE_FD.store(fd, Ordering::Release);
    write_initial_data(options);
    enable_modules(true);
}

/// Turns tracing off: emits the end-of-stream sentinel and the heap
/// snapshot, flushes and closes the pipe. Idempotent.
pub fn disable_tracing() {
    if !ENABLED.swap(false, Ordering::AcqRel) {
        return;
    }
    if PIPE_FD.load(Ordering::Acquire) >= 0 {
        write_new_library("*");
        write_heap_info();
        enable_modules(false);
        flush();
        close_pipe();
    } else {
        enable_modules(false);
    }
}

extern "C" fn toggle_handler(_signal: libc::c_int) {
    if tracing_enabled() {
        disable_tracing();
    } else {
        enable_tracing();
    }
}

/// Installs the toggle-signal handler. The signal number comes from the
/// environment so it can be read before full initialization.
pub fn install_toggle_handler() {
    let signal = std::env::var(rtrace_common::env::TOGGLE_SIGNAL)
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|signal| *signal != 0)
        .unwrap_or(libc::SIGUSR1);
    let Ok(signal) = nix::sys::signal::Signal::try_from(signal) else {
        diag("ERROR: rtrace cannot install an unknown toggle signal\n");
        return;
    };
    let action = nix::sys::signal::SigAction::new(
        nix::sys::signal::SigHandler::Handler(toggle_handler),
        nix::sys::signal::SaFlags::empty(),
        nix::sys::signal::SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics, staged statics and
    // async-signal-safe syscalls.
    if unsafe { nix::sys::signal::sigaction(signal, &action) }.is_err() {
        diag("ERROR: rtrace failed to install the toggle signal handler\n");
    }
}

fn read_proc_name() -> String {
    std::fs::read("/proc/self/cmdline")
        .ok()
        .and_then(|bytes| {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            String::from_utf8(bytes[..end].to_vec()).ok()
        })
        .unwrap_or_default()
}

/// Initializes the runtime once the environment is staged. Returns true
/// when initialization has completed (now or earlier); modules keep
/// retrying from their wrappers until it does.
pub fn initialize() -> bool {
    if INIT_STATE
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return INIT_STATE.load(Ordering::Acquire) == 2;
    }

    HEAP_BOTTOM.store(heap_end(), Ordering::Release);

    let Some(options) = Options::from_env(std::process::id()) else {
        // Environment options are not accessible yet; retried later.
        INIT_STATE.store(0, Ordering::Release);
        return false;
    };

    let _ = PROC_NAME.set(read_proc_name());
    let mut handshake = vec![0u8; 64];
    match Handshake::new(std::env::consts::ARCH).encode(&mut handshake) {
        Ok(size) => {
            handshake.truncate(size);
            let _ = HANDSHAKE_BYTES.set(handshake);
        }
        Err(_) => diag("ERROR: rtrace failed to encode the handshake packet\n"),
    }
    if options.manage_preproc {
        let argv = [
            CString::new("rtrace").unwrap_or_default(),
            CString::new("--listen").unwrap_or_default(),
        ];
        let _ = PREPROC_ARGV.set(argv);
    } else {
        // A non-managed tracer must not leak into child processes.
        std::env::remove_var("LD_PRELOAD");
    }
    let start_enabled = options.start_enabled;
    let _ = OPTIONS.set(options);

    INIT_STATE.store(2, Ordering::Release);

    if start_enabled {
        enable_tracing();
    }
    true
}

/// Library destructor path: flush whatever is buffered and close down.
pub fn shutdown() {
    if PIPE_FD.load(Ordering::Acquire) >= 0 {
        if tracing_enabled() {
            write_new_library("*");
            write_heap_info();
        }
        enable_modules(false);
        ENABLED.store(false, Ordering::Release);
        flush();
        close_pipe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spinlock_serializes() {
        struct Counter(UnsafeCell<u64>);
        // SAFETY: test-only; all access goes through LOCK.
        unsafe impl Sync for Counter {}
        static LOCK: SpinLock = SpinLock::new();
        static VALUE: Counter = Counter(UnsafeCell::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..1000 {
                        let _guard = LOCK.lock();
                        unsafe { *VALUE.0.get() += 1 };
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        let _guard = LOCK.lock();
        assert_eq!(4000, unsafe { *VALUE.0.get() });
    }

    #[test]
    fn test_resource_registry_dedup() {
        let first = register_resource("test-resource", "test resource type", 0);
        let second = register_resource("test-resource", "test resource type", 0);
        assert_ne!(0, first);
        assert_eq!(first, second);

        let other = register_resource("test-resource-2", "another type", 0);
        assert_ne!(first, other);
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(
            Some("1234-pagemap-0".to_string()),
            relative_path("/home/user/out", "/home/user/out/1234-pagemap-0")
        );
        assert_eq!(
            Some("../logs/x.txt".to_string()),
            relative_path("/home/user/out", "/home/user/logs/x.txt")
        );
        assert_eq!(None, relative_path("/home/user/out", "relative/path"));
        assert_eq!(None, relative_path("", "/abs/path"));
    }

    #[test]
    fn test_monotonic_ms_of_day_bounds() {
        let ms = monotonic_ms_of_day();
        assert!(ms < 24 * 60 * 60 * 1000);
    }
}
