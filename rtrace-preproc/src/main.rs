// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `rtrace` pre-processor binary.
//!
//! Three ways in: execute a new process under tracing, toggle tracing of
//! a running process by pid, or listen on stdin when the tracer spawned
//! us in managed mode. All three end in the same relay loop.

use anyhow::{bail, Context};
use nix::sys::signal::{self, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode as FileMode;
use nix::unistd::mkfifo;
use rtrace_preproc::listener::{ListenOptions, Listener, STOP_REQUESTS, TRACEE_PID};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Signal forwarded to the tracee to toggle tracing.
static TOGGLE_SIGNAL: AtomicI32 = AtomicI32::new(libc::SIGUSR1);

#[derive(Debug)]
enum Mode {
    Undefined,
    /// Start and trace a new process.
    Execute(Vec<String>),
    /// Toggle tracing of an already running process.
    Toggle(u32),
    /// Managed mode: the tracer spawned us with the stream on stdin.
    Listen,
}

#[derive(Debug)]
struct Args {
    mode: Mode,
    output_dir: Option<PathBuf>,
    postproc: Option<String>,
    backtrace_depth: Option<u32>,
    start: bool,
    manage_preproc: bool,
    disable_timestamps: bool,
    disable_packet_buffering: bool,
    backtrace_all: bool,
    frame_pointers: bool,
    monitor_size: Option<String>,
    toggle_signal: Option<i32>,
    preload: Option<String>,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let mut args = Self {
            mode: Mode::Undefined,
            output_dir: None,
            postproc: None,
            backtrace_depth: None,
            start: false,
            manage_preproc: false,
            disable_timestamps: false,
            disable_packet_buffering: false,
            backtrace_all: false,
            frame_pointers: false,
            monitor_size: None,
            toggle_signal: None,
            preload: None,
        };
        fn value_for(
            iter: &mut impl Iterator<Item = String>,
            flag: &str,
        ) -> anyhow::Result<String> {
            match iter.next() {
                Some(value) => Ok(value),
                None => bail!("option {flag} requires a value"),
            }
        }

        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-o" | "--output-dir" => args.output_dir = Some(value_for(&mut iter, &arg)?.into()),
                "-P" | "--postproc" => args.postproc = Some(value_for(&mut iter, &arg)?),
                "-b" | "--backtrace-depth" => {
                    args.backtrace_depth = Some(value_for(&mut iter, &arg)?.parse()?)
                }
                "-s" | "--start" => args.start = true,
                "-m" | "--manage-preproc" => args.manage_preproc = true,
                "-T" | "--disable-timestamps" => args.disable_timestamps = true,
                "-B" | "--disable-packet-buffering" => args.disable_packet_buffering = true,
                "-A" | "--backtrace-all" => args.backtrace_all = true,
                "-u" | "--frame-pointers" => args.frame_pointers = true,
                "-M" | "--monitor-size" => args.monitor_size = Some(value_for(&mut iter, &arg)?),
                "-S" | "--toggle-signal" => args.toggle_signal = Some(value_for(&mut iter, &arg)?.parse()?),
                "-e" | "--preload" => args.preload = Some(value_for(&mut iter, &arg)?),
                "-t" | "--toggle" => args.mode = Mode::Toggle(value_for(&mut iter, &arg)?.parse()?),
                "-L" | "--listen" => args.mode = Mode::Listen,
                "-x" | "--execute" => {
                    let command: Vec<String> = iter.by_ref().collect();
                    if command.is_empty() {
                        bail!("option {arg} requires a command");
                    }
                    args.mode = Mode::Execute(command);
                }
                other => bail!("unknown option: {other}"),
            }
        }
        Ok(args)
    }

    fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            output_dir: self.output_dir.clone(),
            postproc: self.postproc.clone(),
            disable_packet_buffering: self.disable_packet_buffering,
            pid: 0,
        }
    }
}

extern "C" fn sigint_handler(_signal: libc::c_int) {
    let requests = STOP_REQUESTS.fetch_add(1, Ordering::AcqRel);
    let tracee = TRACEE_PID.load(Ordering::Acquire);
    if requests == 0 && tracee > 0 {
        let msg = b"INFO: trace stopping, waiting for data retrieval to finish\n";
        // SAFETY: write and kill are async-signal-safe.
        unsafe {
            libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
            libc::kill(tracee, TOGGLE_SIGNAL.load(Ordering::Acquire));
        }
    }
}

fn install_sigint_handler() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(sigint_handler),
        signal::SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics and async-signal-safe
    // syscalls.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .context("failed to install the SIGINT handler")?;
    Ok(())
}

/// Stages the tracer environment for an executed target.
fn stage_environment(args: &Args) {
    use rtrace_common::env;
    std::env::set_var(env::READY, "1");
    let cwd = std::env::current_dir()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_default();
    std::env::set_var(env::START_DIR, &cwd);
    match &args.output_dir {
        Some(dir) => std::env::set_var(env::OUTPUT_DIR, dir),
        None => std::env::set_var(env::OUTPUT_DIR, &cwd),
    }
    if args.manage_preproc {
        std::env::set_var(env::MANAGE_PREPROC, "1");
    }
    if let Some(depth) = args.backtrace_depth {
        std::env::set_var(env::BACKTRACE_DEPTH, depth.to_string());
    }
    if args.disable_timestamps {
        std::env::set_var(env::DISABLE_TIMESTAMPS, "1");
    }
    if args.disable_packet_buffering {
        std::env::set_var(env::DISABLE_PACKET_BUFFERING, "1");
    }
    if let Some(postproc) = &args.postproc {
        std::env::set_var(env::POSTPROC, postproc);
    }
    if let Some(signal) = args.toggle_signal {
        std::env::set_var(env::TOGGLE_SIGNAL, signal.to_string());
    }
    if args.start {
        std::env::set_var(env::START, "1");
    }
    if args.backtrace_all {
        std::env::set_var(env::BACKTRACE_ALL, "1");
    }
    if args.frame_pointers {
        std::env::set_var(env::LIBUNWIND, "0");
    }
    if let Some(sizes) = &args.monitor_size {
        std::env::set_var(env::MONITOR_SIZE, sizes);
    }
    let preload = args
        .preload
        .clone()
        .unwrap_or_else(|| "librtrace_tracer.so".to_string());
    std::env::set_var("LD_PRELOAD", preload);
}

/// Creates the pre-processor pipe unless it already exists.
fn create_pipe(pid: u32) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(rtrace_common::pipe_path(pid));
    if !path.exists() {
        mkfifo(&path, FileMode::from_bits_truncate(0o666))
            .with_context(|| format!("failed to create named pipe {}", path.display()))?;
    }
    Ok(path)
}

fn listen_on_pipe(args: &Args, pid: u32) -> anyhow::Result<()> {
    let path = create_pipe(pid)?;
    // Blocks until the tracer opens the write end.
    let result = std::fs::File::open(&path)
        .with_context(|| format!("failed to open named pipe {}", path.display()))
        .and_then(|mut pipe| {
            let mut options = args.listen_options();
            options.pid = pid;
            Listener::new(options).process(&mut pipe)
        });
    let _ = std::fs::remove_file(&path);
    result
}

fn run_execute(args: &Args, command: &[String]) -> anyhow::Result<()> {
    stage_environment(args);
    let mut child = std::process::Command::new(&command[0])
        .args(&command[1..])
        .spawn()
        .with_context(|| format!("failed to execute {}", command[0]))?;
    let pid = child.id();
    TRACEE_PID.store(pid as i32, Ordering::Release);
    info!("tracing process {pid}");

    let result = if args.manage_preproc {
        // The tracer spawns its own listener; just supervise the target.
        Ok(())
    } else {
        listen_on_pipe(args, pid)
    };

    let status = child.wait().context("failed to wait for the target")?;
    if !status.success() {
        warn!("target exited with {status}");
    }
    result
}

fn run_toggle(args: &Args, pid: u32) -> anyhow::Result<()> {
    let path = create_pipe(pid)?;
    TRACEE_PID.store(pid as i32, Ordering::Release);
    let signal = Signal::try_from(TOGGLE_SIGNAL.load(Ordering::Acquire))
        .context("unknown toggle signal")?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
        .with_context(|| format!("failed to signal process {pid}"))?;

    let result = std::fs::File::open(&path)
        .with_context(|| format!("failed to open named pipe {}", path.display()))
        .and_then(|mut pipe| {
            let mut options = args.listen_options();
            options.pid = pid;
            Listener::new(options).process(&mut pipe)
        });
    let _ = std::fs::remove_file(&path);
    result
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse()?;
    if let Some(signal) = args.toggle_signal {
        TOGGLE_SIGNAL.store(signal, Ordering::Release);
    }
    install_sigint_handler()?;

    match &args.mode {
        Mode::Execute(command) => run_execute(&args, &command.clone()),
        Mode::Toggle(pid) => run_toggle(&args, *pid),
        Mode::Listen => {
            let stdin = std::io::stdin();
            Listener::new(args.listen_options()).process(&mut stdin.lock())
        }
        Mode::Undefined => {
            bail!("no mode selected: use -x <command>, -t <pid> or --listen")
        }
    }
}
