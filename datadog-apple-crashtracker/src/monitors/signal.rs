// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! POSIX signal sentry.
//!
//! Installs `sigaction` handlers for the fatal signals on a dedicated
//! alternate stack (so a stack overflow can still be handled), drives the
//! `notify`/`handle` sequence on the first fatal signal, then restores the
//! previous handlers and re-raises so the default (or chained) disposition
//! still runs. An entry counter distinguishes the first capture from a
//! fault inside the capture (which takes the recrash path) and from
//! anything worse (which goes straight to re-raise).

use crate::monitors::callbacks;
use crate::monitors::context::{CrashCause, HandlingRequirements, MonitorFlags};
use crate::monitors::{self, MonitorApi};
use crate::shared::fd_log;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize};

const MAX_SIGNALS: usize = 16;

static ENABLED: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);
// Handler entry counter; see handle_signal.
static HANDLER_FIRED: AtomicI32 = AtomicI32::new(0);

static WATCHED_SIGNALS: [AtomicI32; MAX_SIGNALS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicI32 = AtomicI32::new(0);
    [ZERO; MAX_SIGNALS]
};
static WATCHED_COUNT: AtomicUsize = AtomicUsize::new(0);

struct SavedActions {
    actions: [Option<SigAction>; MAX_SIGNALS],
}

static SAVED_ACTIONS: AtomicPtr<SavedActions> = AtomicPtr::new(std::ptr::null_mut());

static ALT_STACK: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());

fn monitor_id() -> &'static str {
    "signal"
}

fn monitor_flags() -> MonitorFlags {
    MonitorFlags {
        fatal: true,
        debugger_unsafe: true,
        async_safe: true,
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

extern "C" fn handle_signal(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    // First entry captures normally. A second entry means the capture
    // itself faulted; `notify` detects that and hands back the recrash
    // context, producing a minimal artifact. Anything past that goes
    // straight to uninstall-and-die; returning from here would re-execute
    // the faulting instruction forever.
    let entries = HANDLER_FIRED.fetch_add(1, SeqCst);
    if entries >= 2 {
        fd_log::error("signal handler re-entered repeatedly; giving up");
        uninstall();
        // SAFETY: raise is async-signal-safe.
        unsafe {
            libc::raise(signo);
        }
        return;
    }
    if entries == 1 {
        fd_log::error("crashed while handling a crash");
    }

    if ENABLED.load(SeqCst) {
        // SAFETY: notify/handle contract; we are the only handler running.
        unsafe {
            let ctx = callbacks::notify(monitor_id(), HandlingRequirements::fatal_crash());

            let ucontext = ucontext as *const libc::ucontext_t;
            ctx.offending_context.fill_from_signal(ucontext);

            let code = if info.is_null() { 0 } else { (*info).si_code };
            let fault_addr = if info.is_null() {
                0
            } else {
                (*info).si_addr as usize
            };
            // SIGILL/SIGFPE/SIGSEGV/SIGBUS/SIGTRAP report the faulting
            // address in si_addr; for the rest it is meaningless.
            ctx.fault_address = match signo {
                libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
                    fault_addr
                }
                _ => ctx.offending_context.pc(),
            };
            ctx.cause = CrashCause::Signal { signo, code };

            callbacks::handle(ctx);
        }
    }

    uninstall();
    // Re-raise with the original disposition restored so the process dies
    // (or a chained handler runs) exactly as it would have without us.
    // SAFETY: raise is async-signal-safe.
    unsafe {
        libc::raise(signo);
    }
}

/// Arm the sentry: allocate and register the alternate stack (if
/// configured) and install handlers for every watched signal.
pub fn install(signals: &[i32], create_alt_stack: bool, use_alt_stack: bool) -> anyhow::Result<()> {
    if INSTALLED.swap(true, SeqCst) {
        return Ok(());
    }

    if use_alt_stack && create_alt_stack {
        // The stack lives for the rest of the process; never freed.
        let size = libc::SIGSTKSZ;
        let stack_mem = unsafe { libc::malloc(size) };
        anyhow::ensure!(!stack_mem.is_null(), "could not allocate alternate stack");
        ALT_STACK.store(stack_mem, SeqCst);
        let stack = libc::stack_t {
            ss_sp: stack_mem,
            ss_size: size,
            ss_flags: 0,
        };
        // SAFETY: registering the freshly allocated stack.
        let rc = unsafe { libc::sigaltstack(&stack, std::ptr::null_mut()) };
        anyhow::ensure!(rc == 0, "sigaltstack failed");
    }

    let mut sa_flags = SaFlags::SA_SIGINFO;
    if use_alt_stack {
        sa_flags |= SaFlags::SA_ONSTACK;
    }
    let action = SigAction::new(
        SigHandler::SigAction(handle_signal),
        sa_flags,
        SigSet::empty(),
    );

    let saved = Box::into_raw(Box::new(SavedActions {
        actions: [None; MAX_SIGNALS],
    }));

    let mut installed_count = 0usize;
    for &signo in signals.iter().take(MAX_SIGNALS) {
        let Ok(signal) = Signal::try_from(signo) else {
            tracing::warn!(signo, "unknown signal skipped");
            continue;
        };
        // SAFETY: installing our handler, saving the previous action.
        match unsafe { nix::sys::signal::sigaction(signal, &action) } {
            Ok(previous) => {
                // SAFETY: freshly leaked box, exclusively ours until stored.
                unsafe {
                    (*saved).actions[installed_count] = Some(previous);
                }
                WATCHED_SIGNALS[installed_count].store(signo, SeqCst);
                installed_count += 1;
            }
            Err(e) => {
                tracing::error!(signo, error = %e, "sigaction failed");
            }
        }
    }
    WATCHED_COUNT.store(installed_count, SeqCst);
    SAVED_ACTIONS.store(saved, SeqCst);

    anyhow::ensure!(installed_count > 0, "no signal handlers installed");
    monitors::add_monitor(&API);
    Ok(())
}

/// Restore every saved handler. Async-signal-safe; called from the handler
/// itself before re-raising.
pub fn uninstall() {
    ENABLED.store(false, SeqCst);
    let saved = SAVED_ACTIONS.load(SeqCst);
    if saved.is_null() {
        return;
    }
    let count = WATCHED_COUNT.load(SeqCst);
    for i in 0..count {
        let signo = WATCHED_SIGNALS[i].load(SeqCst);
        let Ok(signal) = Signal::try_from(signo) else {
            continue;
        };
        // SAFETY: restoring the action saved at install.
        unsafe {
            if let Some(action) = (*saved).actions[i] {
                let _ = nix::sys::signal::sigaction(signal, &action);
            }
        }
    }
}
