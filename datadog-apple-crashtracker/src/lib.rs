// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash reporter for Apple (Darwin/XNU) userland programs.
//!
//! When the hosting program faults, this library captures a structured,
//! self-contained forensic snapshot (machine registers, stack traces for
//! every thread, loaded binary images, exception metadata, application
//! state) and persists it to disk as JSON before the process dies. On the
//! next launch the persisted snapshot is read back, enriched with deferred
//! sidecar data, and handed to the caller for delivery.
//!
//! The capture pipeline runs inside signal handlers and Mach exception
//! handler threads, where almost nothing is safe to call. Everything
//! reachable from that path is async-signal-safe: no heap allocation, no
//! blocking mutexes, no dynamic-linker calls. Buffers are static or on the
//! sentry's stack, shared structures are lock-free atomics, and every
//! cross-thread memory read goes through a fault-tolerant kernel probe.
//!
//! Faults are intercepted by three independent sentries (Mach exception
//! ports, POSIX signals, the Rust panic hook), plus a watchdog that detects
//! main-thread hangs. All of them drive the same `notify`/`handle` callback
//! sequence through the monitor registry.

pub mod crash_info;
pub mod json;
pub mod shared;
pub mod state;
pub mod store;

pub mod macho;
pub mod memory;
pub mod unwind;

#[cfg(target_vendor = "apple")]
pub mod collector;
#[cfg(target_vendor = "apple")]
pub mod cpu;
#[cfg(target_vendor = "apple")]
pub mod monitors;
#[cfg(target_vendor = "apple")]
pub mod report;

pub use crash_info::{CrashReport, ErrorInfo, ThreadInfo};
pub use shared::configuration::{CrashReporterConfig, MonitorSet};
pub use shared::InstallError;
pub use state::CrashState;
pub use store::ReportStore;

#[cfg(target_vendor = "apple")]
pub use collector::api::{
    install, notify_app_active, notify_app_in_foreground, notify_app_terminate,
    report_user_exception, set_crash_notify_callback, set_user_info_json,
};
