// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use rtrace_common::header::filter_mask;
use rtrace_common::proto::HANDSHAKE_MAGIC;
use rtrace_postproc::data::TraceData;
use rtrace_postproc::options::Options;
use rtrace_postproc::writer::{self, ReportOptions};
use rtrace_postproc::{filter, parse_binary, parse_text};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn parse_input(options: &Options) -> anyhow::Result<TraceData> {
    let reader: Box<dyn Read> = match &options.input_file {
        Some(path) => Box::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open input file {}", path.display()))?,
        ),
        None => Box::new(std::io::stdin().lock()),
    };
    let mut reader = BufReader::new(reader);

    // The stream type is recognized by its first byte: the handshake
    // sentinel marks binary data, anything printable is a text report.
    let first = reader.fill_buf().context("failed to read input")?;
    if first.first() == Some(&HANDSHAKE_MAGIC) {
        parse_binary::parse_stream(&mut reader)
    } else {
        parse_text::parse_stream(&mut reader)
    }
}

fn apply_transforms(data: &mut TraceData, options: &Options) -> anyhow::Result<()> {
    if let Some(depth) = options.backtrace_depth {
        filter::trim_backtraces(data, depth);
    }
    if let Some(mask) = options.filter_resource {
        filter::filter_resource(data, mask);
    }
    if options.filter_leaks {
        filter::filter_leaks(data);
    }
    if let Some(path) = &options.include_file {
        let indices = filter::load_index_file(path)?;
        filter::filter_index(data, &indices, true);
    }
    if let Some(path) = &options.exclude_file {
        let indices = filter::load_index_file(path)?;
        filter::filter_index(data, &indices, false);
    }
    if let Some(mask) = options.filter_context {
        filter::filter_context(data, mask);
    }
    filter::find_lowhigh_blocks(data);
    filter::update_resource_visibility(data);
    Ok(())
}

fn report_options(data: &TraceData, options: &Options) -> ReportOptions {
    // Permanent filters carry over from the input; compression is
    // re-derived from this run's options.
    let mut mask = data.filter & filter_mask::PERMANENT;
    if options.filter_leaks {
        mask |= filter_mask::LEAKS;
    }
    if options.compress {
        mask |= filter_mask::COMPRESS;
    }
    if options.compress && mask & filter_mask::LEAKS == 0 {
        warn!("compressing a report without leak filtering; totals include released resources");
    }
    ReportOptions {
        compress: options.compress,
        sort: options.compare_leaks,
        filter_mask: mask,
    }
}

fn write_output(data: &TraceData, options: &Options) -> anyhow::Result<()> {
    let report = report_options(data, options);
    let dir = options
        .output_dir
        .as_ref()
        .filter(|dir| dir.as_os_str() != "stdout");
    let Some(dir) = dir else {
        let stdout = std::io::stdout();
        let mut w = BufWriter::new(stdout.lock());
        writer::write_report(&mut w, data, &report)?;
        if options.leak_summary {
            writer::write_leak_summary(&mut w, data)?;
        }
        w.flush()?;
        return Ok(());
    };
    let pid = data.pinfo.as_ref().map(|p| p.pid).unwrap_or(0);
    let (file, path) =
        rtrace_common::output::create_unique_file(dir, pid, rtrace_common::TEXT_FILE_SUFFIX)
            .with_context(|| format!("failed to create report file in {}", dir.display()))?;
    let mut w = BufWriter::new(file);
    writer::write_report(&mut w, data, &report)?;
    if options.leak_summary {
        writer::write_leak_summary(&mut w, data)?;
    }
    w.flush()?;
    eprintln!("INFO: report written to {}", path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let options = Options::parse(std::env::args().skip(1))?;
    let mut data = parse_input(&options)?;
    apply_transforms(&mut data, &options)?;
    write_output(&data, &options)?;
    Ok(())
}
