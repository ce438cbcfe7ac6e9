// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The core's coordination points: `notify` and `handle`.
//!
//! Every sentry drives the same sequence when its watched condition fires:
//! `notify` freezes the world and hands back the static monitor context to
//! fill with cause-specific fields; `handle` writes the report and unwinds
//! the process state. Capture is serialized by a global handling flag; a
//! second fault while the first is being handled is detected and produces a
//! minimal recrash report instead of corrupting the in-flight one.

use crate::collector::threads;
use crate::monitors;
use crate::monitors::context::{HandlingRequirements, MonitorContext};
use crate::report;
use crate::shared::fd_log;
use crate::state;
use core::cell::UnsafeCell;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32};

struct ContextCell(UnsafeCell<MonitorContext>);
// SAFETY: access is serialized by HANDLING_CRASH; the recrash path gets its
// own cell.
unsafe impl Sync for ContextCell {}

static PRIMARY_CONTEXT: ContextCell = ContextCell(UnsafeCell::new(MonitorContext::empty()));
static RECRASH_CONTEXT: ContextCell = ContextCell(UnsafeCell::new(MonitorContext::empty()));

static HANDLING_CRASH: AtomicBool = AtomicBool::new(false);
/// Semaphore, not a flag: anything that forces async safety increments it.
static ASYNC_SAFETY: AtomicU32 = AtomicU32::new(0);

pub fn requires_async_safety() -> bool {
    ASYNC_SAFETY.load(SeqCst) > 0
}

pub fn enter_async_safe_mode() {
    ASYNC_SAFETY.fetch_add(1, SeqCst);
}

pub fn exit_async_safe_mode() {
    let previous = ASYNC_SAFETY.fetch_sub(1, SeqCst);
    if previous == 0 {
        // Unbalanced exit; clamp rather than wrap.
        ASYNC_SAFETY.store(0, SeqCst);
    }
}

pub fn is_handling_crash() -> bool {
    HANDLING_CRASH.load(SeqCst)
}

/// Test support: clear the event serialization state.
#[cfg(any(test, feature = "test-fixtures"))]
pub fn reset_for_testing() {
    HANDLING_CRASH.store(false, SeqCst);
    ASYNC_SAFETY.store(0, SeqCst);
}

fn fill_event_id(ctx: &mut MonitorContext) {
    let uuid = uuid::Uuid::new_v4();
    let mut buf = [0u8; 36];
    uuid.as_hyphenated().encode_lower(&mut buf);
    ctx.event_id.set(core::str::from_utf8(&buf).unwrap_or(""));
}

/// Begin handling an exception event.
///
/// Merges `requirements` into the event policy, suspends all non-reserved
/// threads when thread recording is requested, stamps a fresh event UUID,
/// and returns the statically allocated context for the sentry to fill.
///
/// If a crash is already being handled, the returned context is a minimal
/// secondary one flagged `crashed_during_exception_handling`; the caller
/// proceeds normally and `handle` writes a recrash artifact.
///
/// # Safety
/// Async-signal-safe. The returned reference is to static storage; it is
/// valid until the matching `handle` returns, and must not be held across
/// events.
pub unsafe fn notify(
    monitor_id: &'static str,
    requirements: HandlingRequirements,
) -> &'static mut MonitorContext {
    if HANDLING_CRASH.swap(true, SeqCst) {
        // Re-crash during handling. Keep the primary context intact.
        let ctx = &mut *RECRASH_CONTEXT.0.get();
        ctx.reset();
        ctx.monitor_id = monitor_id;
        ctx.requirements = requirements;
        ctx.crashed_during_exception_handling = true;
        fill_event_id(ctx);
        return ctx;
    }

    let ctx = &mut *PRIMARY_CONTEXT.0.get();
    ctx.reset();
    ctx.monitor_id = monitor_id;
    ctx.requirements = requirements;

    if requirements.requires_async_safety {
        enter_async_safe_mode();
    }
    if requirements.should_record_threads {
        enter_async_safe_mode();
        threads::suspend_environment(&mut ctx.offending_context.snapshot);
    }

    fill_event_id(ctx);
    ctx.app_state = state::snapshot();
    ctx
}

/// Finish handling an exception event.
///
/// Runs every enabled monitor's contextual-info hook, writes the report
/// when requested, disables async-safe monitors for fatal events (so the
/// sentry's re-raise reaches the original handlers), resumes suspended
/// threads, and releases the handling flag.
///
/// # Safety
/// Async-signal-safe. `ctx` must be the context returned by the matching
/// `notify`.
pub unsafe fn handle(ctx: &mut MonitorContext) {
    if ctx.crashed_during_exception_handling {
        // Secondary event: write a minimal artifact and get out of the way
        // of the primary, which may still be streaming its report.
        fd_log::error("crashed during exception handling");
        report::write_recrash_report(ctx);
        return;
    }

    monitors::add_contextual_info_to_event(ctx);

    if ctx.requirements.should_write_report {
        report::write_report(ctx);
    }

    if ctx.requirements.is_fatal {
        monitors::disable_async_safe_monitors();
        state::notify_crash_from_handler();
    }

    threads::resume_environment(&mut ctx.offending_context.snapshot);

    if ctx.requirements.should_record_threads {
        exit_async_safe_mode();
    }
    if ctx.requirements.requires_async_safety {
        exit_async_safe_mode();
    }

    if !ctx.requirements.is_fatal {
        // Non-fatal events (hangs, user reports) release the pipeline for
        // the next event. Fatal events never do: the process is doomed, and
        // holding the flag keeps late faults on the recrash path.
        HANDLING_CRASH.store(false, SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_handle_non_fatal_event() {
        reset_for_testing();
        let ctx = unsafe { notify("test", HandlingRequirements::report_only(false)) };
        assert!(!ctx.crashed_during_exception_handling);
        assert_eq!(ctx.event_id.as_str().len(), 36);
        assert!(is_handling_crash());
        // Suppress the write for this test.
        ctx.requirements.should_write_report = false;
        unsafe { handle(ctx) };
        assert!(!is_handling_crash());
    }

    #[test]
    fn test_recrash_detection() {
        reset_for_testing();
        let first = unsafe { notify("test", HandlingRequirements::report_only(false)) };
        assert!(!first.crashed_during_exception_handling);
        let first_id = first.event_id.as_str().to_string();

        let second = unsafe { notify("test", HandlingRequirements::report_only(false)) };
        assert!(second.crashed_during_exception_handling);
        assert_ne!(second.event_id.as_str(), first_id);
        // The primary context was not disturbed.
        let primary = unsafe { &*PRIMARY_CONTEXT.0.get() };
        assert_eq!(primary.event_id.as_str(), first_id);
        reset_for_testing();
    }

    #[test]
    fn test_async_safety_semaphore() {
        reset_for_testing();
        assert!(!requires_async_safety());
        enter_async_safe_mode();
        enter_async_safe_mode();
        assert!(requires_async_safety());
        exit_async_safe_mode();
        assert!(requires_async_safety());
        exit_async_safe_mode();
        assert!(!requires_async_safety());
    }
}
