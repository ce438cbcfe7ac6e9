// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mach exception sentry.
//!
//! Swaps the task's exception ports for the fatal exception classes with a
//! freshly allocated receive port and parks a dedicated listener thread on
//! `mach_msg`. Mach exceptions arrive before the BSD signal layer ever
//! sees the fault, on a healthy thread with the faulting thread still
//! stopped in the kernel, which is the best possible vantage point for capture.
//!
//! The listener replies `KERN_FAILURE` after writing the report so the
//! previously registered handler (or the kernel's signal translation) runs
//! exactly as it would have without us.
//!
//! Refuses to install under a debugger: debuggers hook the same exception
//! types (lldb stops sessions via `EXC_SOFTWARE`, single-steps via
//! `EXC_BREAKPOINT`), and stealing their ports breaks them.

use crate::collector::threads;
use crate::monitors::callbacks;
use crate::monitors::context::{CrashCause, HandlingRequirements, MonitorFlags};
use crate::monitors::{self, MonitorApi};
use crate::shared::fd_log;
use core::cell::UnsafeCell;
use mach2::exception_types::{
    exception_behavior_t, exception_mask_t, EXC_MASK_ARITHMETIC, EXC_MASK_BAD_ACCESS,
    EXC_MASK_BAD_INSTRUCTION, EXC_MASK_BREAKPOINT, EXC_MASK_SOFTWARE, EXCEPTION_DEFAULT,
    MACH_EXCEPTION_CODES,
};
use mach2::kern_return::{kern_return_t, KERN_FAILURE, KERN_SUCCESS};
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::{mach_port_allocate, mach_port_deallocate, mach_port_insert_right};
use mach2::message::{
    mach_msg, mach_msg_header_t, mach_msg_type_number_t, MACH_MSG_TIMEOUT_NONE,
    MACH_MSG_TYPE_MAKE_SEND, MACH_RCV_MSG, MACH_SEND_MSG,
};
use mach2::port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use mach2::task::task_threads;
use mach2::thread_status::thread_state_flavor_t;
use mach2::traps::mach_task_self;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32};

// The next few definitions are absent from (or wrong in) mach2; lifted from
// the xnu headers.

/// osfmk/mach/exception_types.h
const EXC_TYPES_COUNT: usize = 14;

/// osfmk/mach/{arm,i386}/thread_status.h
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const THREAD_STATE_NONE: thread_state_flavor_t = 13;
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
const THREAD_STATE_NONE: thread_state_flavor_t = 5;

/// osfmk/mach/ndr.h
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct NdrRecord {
    mig_vers: u8,
    if_vers: u8,
    reserved1: u8,
    mig_encoding: u8,
    int_rep: u8,
    char_rep: u8,
    float_rep: u8,
    reserved2: u8,
}

/// osfmk/mach/message.h
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy)]
struct MachMsgBody {
    descriptor_count: u32,
}

/// osfmk/mach/message.h
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy)]
struct MachMsgPortDescriptor {
    name: u32,
    pad1: u32,
    pad2: u16,
    disposition: u8,
    descriptor_type: u8,
}

extern "C" {
    fn task_get_exception_ports(
        task: mach_port_t,
        exception_mask: exception_mask_t,
        masks: *mut exception_mask_t,
        masks_count: *mut mach_msg_type_number_t,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut exception_behavior_t,
        old_flavors: *mut thread_state_flavor_t,
    ) -> kern_return_t;

    fn task_set_exception_ports(
        task: mach_port_t,
        exception_mask: exception_mask_t,
        new_port: mach_port_t,
        behavior: exception_behavior_t,
        new_flavor: thread_state_flavor_t,
    ) -> kern_return_t;
}

/// The exception message for `EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES`,
/// per the generated `mach_exc.defs` layout.
#[repr(C, packed(4))]
struct ExceptionMessage {
    header: mach_msg_header_t,
    // start of kernel-processed data
    body: MachMsgBody,
    thread: MachMsgPortDescriptor,
    task: MachMsgPortDescriptor,
    // end of kernel-processed data
    ndr: NdrRecord,
    exception: i32,
    code_count: u32,
    code: [i64; 2],
    /// Slack so the kernel never replies RCV_TOO_LARGE.
    padding: [u8; 512],
}

#[repr(C, packed(4))]
struct ReplyMessage {
    header: mach_msg_header_t,
    ndr: NdrRecord,
    return_code: kern_return_t,
}

struct SavedPorts {
    masks: [exception_mask_t; EXC_TYPES_COUNT],
    ports: [mach_port_t; EXC_TYPES_COUNT],
    behaviors: [exception_behavior_t; EXC_TYPES_COUNT],
    flavors: [thread_state_flavor_t; EXC_TYPES_COUNT],
    count: mach_msg_type_number_t,
}

struct SavedPortsCell(UnsafeCell<SavedPorts>);
// SAFETY: written during install (single-threaded) and read during
// uninstall; the INSTALLED flag orders the two.
unsafe impl Sync for SavedPortsCell {}

static SAVED_PORTS: SavedPortsCell = SavedPortsCell(UnsafeCell::new(SavedPorts {
    masks: [0; EXC_TYPES_COUNT],
    ports: [0; EXC_TYPES_COUNT],
    behaviors: [0; EXC_TYPES_COUNT],
    flavors: [0; EXC_TYPES_COUNT],
    count: 0,
}));

static EXCEPTION_PORT: AtomicU32 = AtomicU32::new(MACH_PORT_NULL);
static ENABLED: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);

const WATCHED_MASK: exception_mask_t = EXC_MASK_BAD_ACCESS
    | EXC_MASK_BAD_INSTRUCTION
    | EXC_MASK_ARITHMETIC
    | EXC_MASK_SOFTWARE
    | EXC_MASK_BREAKPOINT;

fn monitor_id() -> &'static str {
    "mach"
}

fn monitor_flags() -> MonitorFlags {
    MonitorFlags {
        fatal: true,
        debugger_unsafe: true,
        async_safe: true,
    }
}

fn set_enabled(enabled: bool) {
    let was = ENABLED.swap(enabled && INSTALLED.load(SeqCst), SeqCst);
    if was && !enabled {
        restore_saved_ports();
    }
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

fn listener_main() {
    // Never suspend the thread doing the capture.
    // SAFETY: new send right; intentionally kept for the thread's life.
    let self_thread = unsafe { mach_thread_self() };
    threads::add_reserved_thread(self_thread);

    let port = EXCEPTION_PORT.load(SeqCst);

    // SAFETY: zeroed message buffers are valid for mach_msg receive.
    let mut message: ExceptionMessage = unsafe { core::mem::zeroed() };
    let mut reply: ReplyMessage = unsafe { core::mem::zeroed() };

    loop {
        // SAFETY: receive into a sufficiently sized buffer on our port.
        let kr = unsafe {
            mach_msg(
                core::ptr::addr_of_mut!(message.header),
                MACH_RCV_MSG,
                0,
                core::mem::size_of::<ExceptionMessage>() as u32,
                port,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kr != KERN_SUCCESS {
            fd_log::error("mach_msg receive failed");
            continue;
        }

        if ENABLED.load(SeqCst) {
            // SAFETY: notify/handle contract, on the dedicated listener
            // thread.
            unsafe {
                let ctx = callbacks::notify(monitor_id(), HandlingRequirements::fatal_crash());

                let offending_thread = message.thread.name;
                if !ctx
                    .offending_context
                    .fill_from_thread(offending_thread, true)
                {
                    fd_log::error_hex(
                        "could not fetch crashed thread state",
                        offending_thread as u64,
                    );
                }

                let exception = message.exception;
                let code = message.code[0];
                let subcode = message.code[1];
                ctx.cause = CrashCause::Mach {
                    exception,
                    code,
                    subcode,
                };
                ctx.fault_address = if exception == crate::crash_info::signals::EXC_BAD_ACCESS {
                    ctx.offending_context.fault_address()
                } else {
                    ctx.offending_context.pc()
                };

                callbacks::handle(ctx);
            }
        }

        // Tell the kernel we did not handle it, so the original handler
        // (or default signal translation) still runs.
        reply.header = message.header;
        reply.ndr = message.ndr;
        reply.return_code = KERN_FAILURE;
        // SAFETY: sending the reply built above.
        unsafe {
            mach_msg(
                core::ptr::addr_of_mut!(reply.header),
                MACH_SEND_MSG,
                core::mem::size_of::<ReplyMessage>() as u32,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );
        }

        // One fatal exception per process; the listener's job is done.
        return;
    }
}

/// Arm the sentry. Fails under a debugger and on any port-plumbing error.
pub fn install() -> anyhow::Result<()> {
    if INSTALLED.swap(true, SeqCst) {
        return Ok(());
    }

    if monitors::is_being_traced() {
        INSTALLED.store(false, SeqCst);
        anyhow::bail!("refusing to install mach exception handler under a debugger");
    }

    let task = unsafe { mach_task_self() };

    // SAFETY: saving current ports into install-time-owned storage.
    let saved = unsafe { &mut *SAVED_PORTS.0.get() };
    let kr = unsafe {
        task_get_exception_ports(
            task,
            WATCHED_MASK,
            saved.masks.as_mut_ptr(),
            &mut saved.count,
            saved.ports.as_mut_ptr(),
            saved.behaviors.as_mut_ptr(),
            saved.flavors.as_mut_ptr(),
        )
    };
    if kr != KERN_SUCCESS {
        INSTALLED.store(false, SeqCst);
        anyhow::bail!("task_get_exception_ports failed: {kr}");
    }

    let mut port: mach_port_t = MACH_PORT_NULL;
    // SAFETY: allocating a fresh receive right.
    let kr = unsafe { mach_port_allocate(task, MACH_PORT_RIGHT_RECEIVE, &mut port) };
    if kr != KERN_SUCCESS {
        INSTALLED.store(false, SeqCst);
        anyhow::bail!("mach_port_allocate failed: {kr}");
    }
    // SAFETY: inserting a send right for the port we just allocated.
    let kr = unsafe { mach_port_insert_right(task, port, port, MACH_MSG_TYPE_MAKE_SEND) };
    if kr != KERN_SUCCESS {
        unsafe { mach_port_deallocate(task, port) };
        INSTALLED.store(false, SeqCst);
        anyhow::bail!("mach_port_insert_right failed: {kr}");
    }

    // SAFETY: installing our port for the watched mask.
    let kr = unsafe {
        task_set_exception_ports(
            task,
            WATCHED_MASK,
            port,
            ((EXCEPTION_DEFAULT as u32) | (MACH_EXCEPTION_CODES as u32)) as exception_behavior_t,
            THREAD_STATE_NONE,
        )
    };
    if kr != KERN_SUCCESS {
        unsafe { mach_port_deallocate(task, port) };
        INSTALLED.store(false, SeqCst);
        anyhow::bail!("task_set_exception_ports failed: {kr}");
    }

    EXCEPTION_PORT.store(port, SeqCst);

    // Detached listener; it parks in mach_msg and exits after one event.
    std::thread::Builder::new()
        .name("mach-exception-listener".into())
        .spawn(listener_main)
        .map(|handle| drop(handle))
        .map_err(|e| {
            restore_saved_ports();
            anyhow::anyhow!("could not spawn exception listener: {e}")
        })?;

    monitors::add_monitor(&API);
    Ok(())
}

/// Restore the exception ports saved at install.
fn restore_saved_ports() {
    if !INSTALLED.load(SeqCst) {
        return;
    }
    let task = unsafe { mach_task_self() };
    // SAFETY: read-only after install.
    let saved = unsafe { &*SAVED_PORTS.0.get() };
    for i in 0..saved.count as usize {
        // SAFETY: restoring ports the kernel handed us.
        let kr = unsafe {
            task_set_exception_ports(
                task,
                saved.masks[i],
                saved.ports[i],
                saved.behaviors[i],
                saved.flavors[i],
            )
        };
        if kr != KERN_SUCCESS {
            fd_log::error("task_set_exception_ports restore failed");
        }
    }
}

/// True while the sentry owns the task's exception ports.
pub fn is_installed() -> bool {
    INSTALLED.load(SeqCst)
}

/// Count of threads in the task; exposed for liveness checks.
pub fn task_thread_count() -> usize {
    let task = unsafe { mach_task_self() };
    let mut list: *mut mach_port_t = core::ptr::null_mut();
    let mut count: mach_msg_type_number_t = 0;
    // SAFETY: task_threads out-params.
    let kr = unsafe { task_threads(task, &mut list, &mut count) };
    if kr != KERN_SUCCESS {
        return 0;
    }
    // SAFETY: releasing rights and the kernel-allocated list.
    unsafe {
        for i in 0..count as usize {
            mach_port_deallocate(task, *list.add(i));
        }
        mach2::vm::mach_vm_deallocate(
            task,
            list as mach2::vm_types::mach_vm_address_t,
            (count as usize * core::mem::size_of::<mach_port_t>())
                as mach2::vm_types::mach_vm_size_t,
        );
    }
    count as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_surface() {
        assert_eq!((API.id)(), "mach");
        let flags = (API.flags)();
        assert!(flags.fatal);
        assert!(flags.debugger_unsafe);
        assert!(flags.async_safe);
    }

    #[test]
    fn test_task_thread_count_positive() {
        assert!(task_thread_count() >= 1);
    }
}
