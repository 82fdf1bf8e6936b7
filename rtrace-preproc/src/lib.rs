// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pre-processor library: the packet relay listener and the memory-map
//! scanner it uses to answer new-library events.

pub mod listener;
pub mod maps;
