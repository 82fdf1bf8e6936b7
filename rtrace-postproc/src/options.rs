// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-processor invocation options.

use crate::leaks_sort::LeakSort;
use anyhow::bail;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct Options {
    /// Input trace file; stdin when unset.
    pub input_file: Option<PathBuf>,
    /// Report directory; stdout when unset or "stdout".
    pub output_dir: Option<PathBuf>,
    /// Remove matched allocation/release pairs.
    pub filter_leaks: bool,
    /// Group the surviving calls by backtrace.
    pub compress: bool,
    pub compare_leaks: LeakSort,
    /// Keep only calls whose context intersects the mask (zero keeps
    /// context-free calls).
    pub filter_context: Option<u32>,
    /// Keep only calls whose resource-type bit is in the mask.
    pub filter_resource: Option<u32>,
    pub backtrace_depth: Option<u32>,
    pub include_file: Option<PathBuf>,
    pub exclude_file: Option<PathBuf>,
    /// Append per-resource leak totals to the report.
    pub leak_summary: bool,
}

impl Options {
    /// Parses command-line arguments (without the program name).
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value_for = |flag: &str| match args.next() {
                Some(value) => Ok(value),
                None => bail!("option {flag} requires a value"),
            };
            match arg.as_str() {
                "-i" | "--input" => options.input_file = Some(value_for(&arg)?.into()),
                "-o" | "--output-dir" => options.output_dir = Some(value_for(&arg)?.into()),
                "-l" | "--filter-leaks" => options.filter_leaks = true,
                "-c" | "--compress" => options.compress = true,
                "-s" | "--sort" => {
                    let value = value_for(&arg)?;
                    options.compare_leaks = match LeakSort::parse(&value) {
                        Some(order) => order,
                        None => bail!("unknown sort order: {value}"),
                    };
                }
                "-C" | "--filter-context" => {
                    options.filter_context = Some(parse_mask(&value_for(&arg)?)?);
                }
                "-R" | "--filter-resource" => {
                    options.filter_resource = Some(parse_mask(&value_for(&arg)?)?);
                }
                "-b" | "--backtrace-depth" => {
                    options.backtrace_depth = Some(value_for(&arg)?.parse()?);
                }
                "--include" => options.include_file = Some(value_for(&arg)?.into()),
                "--exclude" => options.exclude_file = Some(value_for(&arg)?.into()),
                "-L" | "--leak-summary" => options.leak_summary = true,
                other => bail!("unknown option: {other}"),
            }
        }
        Ok(options)
    }
}

fn parse_mask(text: &str) -> anyhow::Result<u32> {
    let mask = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => text.parse()?,
    };
    Ok(mask)
}
