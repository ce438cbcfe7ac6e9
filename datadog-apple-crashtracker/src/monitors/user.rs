// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User-reported exception sentry.
//!
//! Lets the host report an error condition it caught itself (a scripting
//! runtime's uncaught exception, an assertion from a higher layer) through
//! the same capture pipeline as real faults, producing a report with the
//! same shape. Optionally terminates the process afterwards.

use crate::monitors::callbacks;
use crate::monitors::context::{
    CrashCause, FixedString, HandlingRequirements, MonitorFlags, MAX_PREBAKED_FRAMES,
};
use crate::monitors::{self, MonitorApi};
use crate::unwind::cursor::StackCursor;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::AtomicBool;

static ENABLED: AtomicBool = AtomicBool::new(false);

fn monitor_id() -> &'static str {
    "user"
}

fn monitor_flags() -> MonitorFlags {
    MonitorFlags {
        fatal: false,
        debugger_unsafe: false,
        async_safe: false,
    }
}

fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, SeqCst);
}

fn is_enabled() -> bool {
    ENABLED.load(SeqCst)
}

fn add_contextual_info(_ctx: &mut crate::monitors::context::MonitorContext) {}

fn notify_post_system_enable() {}

pub static API: MonitorApi = MonitorApi {
    id: monitor_id,
    flags: monitor_flags,
    set_enabled,
    is_enabled,
    add_contextual_info,
    notify_post_system_enable,
    write_report_section: None,
    stitch_report: None,
};

pub fn install() {
    monitors::add_monitor(&API);
}

/// Report a user-defined exception.
///
/// `backtrace` supplies pre-captured frame addresses; when empty, the
/// calling thread's own frames are captured instead (minus the reporter's).
/// With `terminate_program` the process aborts after the report is written.
#[allow(clippy::too_many_arguments)]
pub fn report_user_exception(
    name: &str,
    reason: &str,
    language: &str,
    line_of_code: &str,
    backtrace: &[usize],
    log_all_threads: bool,
    terminate_program: bool,
) {
    if !ENABLED.load(SeqCst) {
        return;
    }

    let mut frames = [0usize; MAX_PREBAKED_FRAMES];
    let count = if backtrace.is_empty() {
        let mut cursor = StackCursor::from_self_thread(2);
        let mut count = 0usize;
        while count < MAX_PREBAKED_FRAMES && cursor.advance() {
            frames[count] = cursor.address();
            count += 1;
        }
        count
    } else {
        let count = backtrace.len().min(MAX_PREBAKED_FRAMES);
        frames[..count].copy_from_slice(&backtrace[..count]);
        count
    };

    let mut requirements = HandlingRequirements::report_only(log_all_threads);
    requirements.is_fatal = terminate_program;

    // User reports run in normal mode; reserve a fresh path so the
    // pre-assigned crash destination stays available for a real fault.
    let report_path = crate::collector::api::store().map(|store| store.next_report().1);

    // SAFETY: notify/handle contract on the reporting thread.
    unsafe {
        let ctx = callbacks::notify(monitor_id(), requirements);
        if let Some(path) = &report_path {
            ctx.report_path_override.set(path.to_str().unwrap_or(""));
        }
        let mut cause_name = FixedString::new();
        cause_name.set(name);
        let mut cause_reason = FixedString::new();
        cause_reason.set(reason);
        let mut cause_language = FixedString::new();
        cause_language.set(language);
        let mut cause_line = FixedString::new();
        cause_line.set(line_of_code);
        ctx.cause = CrashCause::User {
            name: cause_name,
            reason: cause_reason,
            language: cause_language,
            line_of_code: cause_line,
            backtrace: frames,
            backtrace_len: count,
            log_all_threads,
        };
        ctx.fault_address = frames.first().copied().unwrap_or(0);
        callbacks::handle(ctx);
    }

    if terminate_program {
        tracing::error!("terminating after user-reported exception");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_sentry_ignores_reports() {
        set_enabled(false);
        // Must be a no-op, not a crash.
        report_user_exception("name", "reason", "rust", "here", &[], false, false);
    }
}
