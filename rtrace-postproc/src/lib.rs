// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-processor for rtrace event streams: builds the in-memory event
//! model from binary or text input, applies the transform pipeline and
//! writes the canonical text report.

pub mod data;
pub mod filter;
pub mod leaks_sort;
pub mod options;
pub mod parse_binary;
pub mod parse_text;
pub mod writer;
