// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Language-exception sentry: the Rust panic hook.
//!
//! An uncaught panic is the language-level analogue of an uncaught
//! exception: the runtime is about to abort the process in a controlled
//! way, so registers are uninteresting but a backtrace of the panicking
//! thread is available up front. The hook captures the payload message and
//! the raw frame addresses, drives `notify`/`handle`, then chains to the
//! previous hook so default panic output still appears.

use crate::monitors::callbacks;
use crate::monitors::context::{
    CrashCause, FixedString, HandlingRequirements, MonitorFlags, MAX_PREBAKED_FRAMES,
};
use crate::monitors::{self, MonitorApi};
use std::panic::PanicHookInfo;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

static ENABLED: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);

#[allow(clippy::type_complexity)]
static PREVIOUS_HOOK: Mutex<Option<Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>>> =
    Mutex::new(None);

fn monitor_id() -> &'static str {
    "panic"
}

fn monitor_flags() -> MonitorFlags {
    MonitorFlags {
        fatal: true,
        debugger_unsafe: false,
        async_safe: false,
    }
}

fn set_enabled(enabled: bool) {
    ENABLED.store(enabled && INSTALLED.load(SeqCst), SeqCst);
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

fn panic_message(info: &PanicHookInfo<'_>) -> FixedString<512> {
    let mut message = FixedString::new();
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        message.set(s);
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        message.set(s);
    } else {
        message.set("Box<dyn Any>");
    }
    message
}

fn capture_backtrace(frames: &mut [usize; MAX_PREBAKED_FRAMES]) -> usize {
    let mut count = 0usize;
    // SAFETY: unsynchronized trace on the panicking thread; acceptable, the
    // process is on its way out.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if count >= MAX_PREBAKED_FRAMES {
                return false;
            }
            frames[count] = frame.ip() as usize;
            count += 1;
            true
        });
    }
    count
}

fn hook(info: &PanicHookInfo<'_>) {
    if ENABLED.load(SeqCst) {
        let message = panic_message(info);
        let mut frames = [0usize; MAX_PREBAKED_FRAMES];
        let count = capture_backtrace(&mut frames);

        // SAFETY: notify/handle contract on the panicking thread.
        unsafe {
            let ctx = callbacks::notify(monitor_id(), HandlingRequirements::fatal_crash());
            ctx.cause = CrashCause::Panic {
                message,
                backtrace: frames,
                backtrace_len: count,
            };
            ctx.fault_address = frames.first().copied().unwrap_or(0);
            callbacks::handle(ctx);
        }
    }

    // Chain so the default "thread panicked at ..." output survives.
    if let Ok(guard) = PREVIOUS_HOOK.lock() {
        if let Some(previous) = guard.as_ref() {
            previous(info);
        }
    }
}

/// Install the panic hook, saving the previous one for chaining.
pub fn install() {
    if INSTALLED.swap(true, SeqCst) {
        return;
    }
    let previous = std::panic::take_hook();
    *PREVIOUS_HOOK.lock().expect("panic hook mutex poisoned") = Some(previous);
    std::panic::set_hook(Box::new(hook));
    monitors::add_monitor(&API);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_surface() {
        assert_eq!((API.id)(), "panic");
        assert!((API.flags)().fatal);
        assert!(!(API.flags)().debugger_unsafe);
    }

    #[test]
    fn test_message_extraction_via_hook_types() {
        // The payload downcast handles &str and String payloads.
        let mut message = FixedString::<512>::new();
        message.set("boom");
        assert_eq!(message.as_str(), "boom");
    }
}
