// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The monitor registry and the sentries it coordinates.
//!
//! A monitor is a vtable of plain function pointers, not trait objects, so
//! a slot fits in one `AtomicPtr` and the registry stays lock-free for the
//! signal path. Slots are claimed by CAS with linear probing; removal CASes
//! the pointer back to null. A post-insert sweep collapses duplicates that
//! racing adders may have produced, keeping the first copy.

pub mod callbacks;
pub mod context;
pub mod mach;
pub mod panic;
pub mod signal;
pub mod user;
pub mod watchdog;

use crate::json::{FdSink, JsonEncoder};
use crate::monitors::context::MonitorContext;
use crate::shared::constants::MONITOR_CAPACITY;
use crate::shared::fd_log;
use crate::store::SidecarScope;
use std::path::Path;
use std::ptr::null_mut;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};

/// Properties the registry needs to know about a monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorFlags {
    /// The watched condition kills the process.
    pub fatal: bool,
    /// Must not be armed while a debugger is attached.
    pub debugger_unsafe: bool,
    /// Runs inside async-signal-only context.
    pub async_safe: bool,
}

/// A monitor's vtable. Instances are `'static`; the registry stores bare
/// pointers to them.
pub struct MonitorApi {
    pub id: fn() -> &'static str,
    pub flags: fn() -> MonitorFlags,
    pub set_enabled: fn(bool),
    pub is_enabled: fn() -> bool,
    /// Contribute cause-independent fields to an in-flight event.
    pub add_contextual_info: fn(&mut MonitorContext),
    /// Called once after the whole monitor set has been enabled.
    pub notify_post_system_enable: fn(),
    /// Contribute a section to the report being written for an event this
    /// monitor raised.
    pub write_report_section: Option<fn(&MonitorContext, &mut JsonEncoder<'_, FdSink>)>,
    /// Merge a sidecar file into a report read back at next launch.
    pub stitch_report: Option<fn(report: &str, sidecar_path: &Path, scope: SidecarScope) -> Option<String>>,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicPtr<MonitorApi> = AtomicPtr::new(null_mut());
static MONITORS: [AtomicPtr<MonitorApi>; MONITOR_CAPACITY] = [EMPTY_SLOT; MONITOR_CAPACITY];

/// Add a monitor. Lock-free; duplicate adds keep the first copy.
pub fn add_monitor(api: &'static MonitorApi) -> bool {
    let target = api as *const MonitorApi as *mut MonitorApi;

    let mut added = false;
    for slot in MONITORS.iter() {
        if slot.load(Acquire) == target {
            return false; // already present
        }
        if slot
            .compare_exchange(null_mut(), target, AcqRel, Acquire)
            .is_ok()
        {
            added = true;
            break;
        }
    }
    if !added {
        fd_log::error("monitor registry full");
        return false;
    }

    // A racing add of the same monitor may have claimed an earlier slot;
    // keep the first copy and null out the rest.
    let mut found = false;
    for slot in MONITORS.iter() {
        if slot.load(Acquire) == target {
            if !found {
                found = true;
            } else {
                let _ = slot.compare_exchange(target, null_mut(), AcqRel, Acquire);
            }
        }
    }
    true
}

/// Remove a monitor and disable it.
pub fn remove_monitor(api: &'static MonitorApi) {
    let target = api as *const MonitorApi as *mut MonitorApi;
    for slot in MONITORS.iter() {
        if slot
            .compare_exchange(target, null_mut(), AcqRel, Acquire)
            .is_ok()
        {
            (api.set_enabled)(false);
        }
    }
}

fn each_monitor(mut f: impl FnMut(&'static MonitorApi)) {
    for slot in MONITORS.iter() {
        let ptr = slot.load(Acquire);
        if !ptr.is_null() {
            // SAFETY: only 'static references are ever stored.
            f(unsafe { &*ptr });
        }
    }
}

/// Enable every registered monitor, masking out debugger-unsafe ones when
/// the process is being traced. Returns whether anything is active.
pub fn activate_monitors() -> bool {
    let traced = is_being_traced();
    if traced {
        tracing::warn!(
            "process is being traced; debugger-unsafe monitors stay disabled \
             and most crashes will not be recorded"
        );
    }

    let mut any_active = false;
    each_monitor(|api| {
        let should_enable = !(traced && (api.flags)().debugger_unsafe);
        (api.set_enabled)(should_enable);
        let enabled = (api.is_enabled)();
        any_active |= enabled;
        tracing::debug!(monitor = (api.id)(), enabled, "monitor state");
    });

    each_monitor(|api| {
        if (api.is_enabled)() {
            (api.notify_post_system_enable)();
        }
    });

    any_active
}

/// Disable every monitor.
pub fn disable_all_monitors() {
    each_monitor(|api| (api.set_enabled)(false));
}

/// Disable the monitors whose watched conditions are async-signal class.
/// Called once a fatal event is being handled, so a re-raise reaches the
/// original handlers instead of re-entering ours.
pub fn disable_async_safe_monitors() {
    each_monitor(|api| {
        if (api.flags)().async_safe {
            (api.set_enabled)(false);
        }
    });
}

/// Run every enabled monitor's contextual-info hook for an event.
pub fn add_contextual_info_to_event(ctx: &mut MonitorContext) {
    each_monitor(|api| {
        if (api.is_enabled)() {
            (api.add_contextual_info)(ctx);
        }
    });
}

/// Look up a monitor by id (sidecar stitching).
pub fn monitor_by_id(id: &str) -> Option<&'static MonitorApi> {
    let mut hit = None;
    each_monitor(|api| {
        if hit.is_none() && (api.id)() == id {
            hit = Some(api);
        }
    });
    hit
}

/// Whether a debugger is attached, via sysctl kinfo_proc (P_TRACED).
pub fn is_being_traced() -> bool {
    let mut info: libc::kinfo_proc = unsafe { core::mem::zeroed() };
    let mut size = core::mem::size_of::<libc::kinfo_proc>();
    let mut mib = [
        libc::CTL_KERN,
        libc::KERN_PROC,
        libc::KERN_PROC_PID,
        unsafe { libc::getpid() },
    ];
    // SAFETY: standard sysctl out-parameter call.
    let rc = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            mib.len() as libc::c_uint,
            &mut info as *mut _ as *mut libc::c_void,
            &mut size,
            core::ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        return false;
    }
    const P_TRACED: i32 = 0x00000800;
    info.kp_proc.p_flag & P_TRACED != 0
}
