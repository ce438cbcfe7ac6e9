// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The in-process capture pipeline: installation, thread control, and
//! machine-context materialization.

pub mod api;
pub mod machine_context;
pub mod threads;
