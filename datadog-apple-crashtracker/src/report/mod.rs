// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The report writer.
//!
//! Streams the report document straight to a file descriptor through the
//! async-safe JSON encoder: version and identifiers, the pre-baked system
//! section, crash-time machine and app-state counters, every thread with
//! its backtrace and registers, normalized error info, the loaded-image
//! list, and the optional user sections. The destination path is
//! pre-assigned at install time so no path construction happens while the
//! process is dying.

use crate::collector::machine_context::MachineContext;
use crate::crash_info::signals;
use crate::cpu;
use crate::json::{FdSink, JsonEncoder};
use crate::macho::{self, images};
use crate::memory::probe::VmProbe;
use crate::memory::MemoryReader;
use crate::monitors;
use crate::monitors::context::{CrashCause, MonitorContext};
use crate::shared::constants::{
    MAX_BACKTRACE_DEPTH, OVERFLOW_THRESHOLD, REPORT_VERSION_MAJOR, REPORT_VERSION_MINOR,
    STACK_DUMP_AFTER, STACK_DUMP_BEFORE,
};
use crate::shared::fd_log;
use crate::unwind::cursor::{raw_backtrace_length, StackCursor};
use core::cell::UnsafeCell;
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::mach_port_deallocate;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::task::task_threads;
use mach2::traps::mach_task_self;
use mach2::vm::mach_vm_deallocate;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

/// Callback contributing the `user_atcrash` section. Must be
/// async-signal-safe; it runs while the process is dying.
pub type CrashNotifyCallback = fn(&mut JsonEncoder<'_, FdSink>);

extern "C" {
    fn mach_host_self() -> mach_port_t;
    fn host_statistics64(
        host: mach_port_t,
        flavor: libc::c_int,
        host_info_out: *mut libc::c_int,
        host_info_count: *mut mach_msg_type_number_t,
    ) -> i32;
    fn pthread_from_mach_thread_np(thread: mach_port_t) -> *mut libc::c_void;
    fn pthread_getname_np(
        thread: *mut libc::c_void,
        name: *mut libc::c_char,
        len: libc::size_t,
    ) -> libc::c_int;
}

const HOST_VM_INFO64: libc::c_int = 4;

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct VmStatistics64 {
    free_count: u32,
    active_count: u32,
    inactive_count: u32,
    wire_count: u32,
    zero_fill_count: u64,
    reactivations: u64,
    pageins: u64,
    pageouts: u64,
    faults: u64,
    cow_faults: u64,
    lookups: u64,
    hits: u64,
    purges: u64,
    purgeable_count: u32,
    speculative_count: u32,
    decompressions: u64,
    compressions: u64,
    swapins: u64,
    swapouts: u64,
    compressor_page_count: u32,
    throttled_count: u32,
    external_page_count: u32,
    internal_page_count: u32,
    total_uncompressed_pages_in_compressor: u64,
}

// Pre-assigned destinations and identifiers, written once at install.
struct PathCell {
    buf: UnsafeCell<[u8; 1024]>,
    len: AtomicUsize,
}
// SAFETY: written before monitors are armed, read-only afterwards.
unsafe impl Sync for PathCell {}

impl PathCell {
    const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; 1024]),
            len: AtomicUsize::new(0),
        }
    }

    fn store(&self, text: &str) {
        let bytes = text.as_bytes();
        let take = bytes.len().min(1023);
        // SAFETY: single install-time writer.
        unsafe {
            (*self.buf.get())[..take].copy_from_slice(&bytes[..take]);
        }
        self.len.store(take, SeqCst);
    }

    fn get(&self) -> &str {
        let len = self.len.load(SeqCst);
        // SAFETY: immutable after install.
        core::str::from_utf8(unsafe { &(*self.buf.get())[..len] }).unwrap_or("")
    }
}

static REPORT_PATH: PathCell = PathCell::new();
static RECRASH_PATH: PathCell = PathCell::new();
static RUN_ID: PathCell = PathCell::new();

// Pre-baked JSON fragments, swapped in whole: always null or Box::into_raw.
static SYSTEM_JSON: AtomicPtr<String> = AtomicPtr::new(ptr::null_mut());
static USER_JSON: AtomicPtr<String> = AtomicPtr::new(ptr::null_mut());
static CRASH_NOTIFY: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

fn swap_json_global(global: &AtomicPtr<String>, value: Option<String>) {
    let new = value
        .map(|s| Box::into_raw(Box::new(s)))
        .unwrap_or(ptr::null_mut());
    // The old value is leaked, never freed: a crashing thread may hold a
    // reference to it with no way to coordinate. Updates are rare and
    // process-lifetime, so the leak is bounded.
    let _ = global.swap(new, SeqCst);
}

fn load_json_global(global: &AtomicPtr<String>) -> Option<&'static str> {
    let ptr = global.load(SeqCst);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: stored values are never freed (see swap_json_global), so
        // the reference cannot dangle.
        Some(unsafe { (*ptr).as_str() })
    }
}

/// Set the pre-assigned report destinations. Install-time only.
pub fn set_report_destination(path: &Path, recrash_path: &Path) {
    REPORT_PATH.store(path.to_str().unwrap_or(""));
    RECRASH_PATH.store(recrash_path.to_str().unwrap_or(""));
}

pub fn set_run_id(run_id: &str) {
    RUN_ID.store(run_id);
}

/// Pre-baked JSON embedded as the report's `system` section.
pub fn set_system_info_json(json: Option<String>) {
    swap_json_global(&SYSTEM_JSON, json);
}

/// Pre-baked JSON embedded as the report's `user` section. May be updated
/// at any time before a crash.
pub fn set_user_info_json(json: Option<String>) {
    swap_json_global(&USER_JSON, json);
}

/// Install the `user_atcrash` callback.
pub fn set_crash_notify(callback: Option<CrashNotifyCallback>) {
    let raw = callback.map(|cb| cb as *mut ()).unwrap_or(ptr::null_mut());
    CRASH_NOTIFY.store(raw, SeqCst);
}

fn crash_notify() -> Option<CrashNotifyCallback> {
    let raw = CRASH_NOTIFY.load(SeqCst);
    if raw.is_null() {
        None
    } else {
        // SAFETY: only fn pointers of this type are ever stored.
        Some(unsafe { core::mem::transmute::<*mut (), CrashNotifyCallback>(raw) })
    }
}

/// Format into a stack buffer; for names that fall back to numbers.
fn fmt_small<'a>(buf: &'a mut [u8; 32], args: core::fmt::Arguments) -> &'a str {
    struct W<'b> {
        buf: &'b mut [u8; 32],
        len: usize,
    }
    impl core::fmt::Write for W<'_> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let bytes = s.as_bytes();
            if self.len + bytes.len() > self.buf.len() {
                return Err(core::fmt::Error);
            }
            self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();
            Ok(())
        }
    }
    let mut w = W { buf, len: 0 };
    let _ = core::fmt::write(&mut w, args);
    let len = w.len;
    core::str::from_utf8(&buf[..len]).unwrap_or("")
}

fn open_exclusive(path: &str) -> Option<i32> {
    let mut cpath = [0u8; 1024];
    if path.is_empty() || path.len() + 1 > cpath.len() {
        return None;
    }
    cpath[..path.len()].copy_from_slice(path.as_bytes());
    // SAFETY: NUL-terminated buffer built above.
    let fd = unsafe {
        libc::open(
            cpath.as_ptr() as *const libc::c_char,
            libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL,
            0o644,
        )
    };
    if fd < 0 {
        fd_log::error("could not open report file");
        return None;
    }
    Some(fd)
}

/// Write the full report for an event. The destination is the context's
/// override path when set, else the pre-assigned report path.
pub fn write_report(ctx: &mut MonitorContext) {
    let path_override = ctx.report_path_override.as_str();
    let path: &str = if path_override.is_empty() {
        REPORT_PATH.get()
    } else {
        // Borrow dance: the override lives inside ctx.
        path_override
    };
    // Copy to a local so ctx stays mutably borrowable below.
    let mut path_buf = [0u8; 1024];
    let path_len = path.len().min(1023);
    path_buf[..path_len].copy_from_slice(&path.as_bytes()[..path_len]);
    let path = core::str::from_utf8(&path_buf[..path_len]).unwrap_or("");

    let Some(fd) = open_exclusive(path) else {
        return;
    };
    let mut sink = FdSink::new(fd);
    let mut encoder = JsonEncoder::new(&mut sink);

    let _ = write_document(&mut encoder, ctx);
    let _ = encoder.end();

    // SAFETY: fd from open_exclusive.
    unsafe { libc::close(fd) };
}

fn write_document(
    encoder: &mut JsonEncoder<'_, FdSink>,
    ctx: &mut MonitorContext,
) -> Result<(), crate::json::JsonError> {
    encoder.begin_object(None)?;
    encoder.add_int(Some("report_version_major"), REPORT_VERSION_MAJOR)?;
    encoder.add_int(Some("report_version_minor"), REPORT_VERSION_MINOR)?;
    encoder.add_string(Some("crash_id"), ctx.event_id.as_str())?;
    encoder.add_string(Some("run_id"), RUN_ID.get())?;
    // SAFETY: time(2) is async-signal-safe.
    encoder.add_int(Some("timestamp"), unsafe { libc::time(ptr::null_mut()) })?;

    if let Some(system) = load_json_global(&SYSTEM_JSON) {
        let _ = encoder.add_json_element(Some("system"), system.as_bytes());
    }

    encoder.begin_object(Some("system_atcrash"))?;
    write_machine_stats(encoder)?;
    let state = &ctx.app_state;
    encoder.add_bool(Some("application_active"), state.application_active)?;
    encoder.add_bool(
        Some("application_in_foreground"),
        state.application_in_foreground,
    )?;
    encoder.add_int(
        Some("launches_since_last_crash"),
        state.launches_since_last_crash,
    )?;
    encoder.add_int(
        Some("sessions_since_last_crash"),
        state.sessions_since_last_crash,
    )?;
    encoder.add_float(
        Some("active_time_since_last_crash"),
        state.active_duration_since_last_crash,
    )?;
    encoder.add_float(
        Some("background_time_since_last_crash"),
        state.background_duration_since_last_crash,
    )?;
    encoder.add_int(Some("sessions_since_launch"), state.sessions_since_launch)?;
    encoder.add_float(
        Some("active_time_since_launch"),
        state.active_duration_since_launch,
    )?;
    encoder.add_float(
        Some("background_time_since_launch"),
        state.background_duration_since_launch,
    )?;
    encoder.end_container()?;

    encoder.begin_object(Some("crash"))?;
    write_all_threads(encoder, ctx)?;
    write_error_info(encoder, ctx)?;
    write_binary_images(encoder)?;
    encoder.end_container()?;

    if let Some(api) = monitors::monitor_by_id(ctx.monitor_id) {
        if let Some(write_section) = api.write_report_section {
            write_section(ctx, encoder);
        }
    }

    if let Some(user) = load_json_global(&USER_JSON) {
        let _ = encoder.add_json_element(Some("user"), user.as_bytes());
    }
    if let Some(callback) = crash_notify() {
        encoder.begin_object(Some("user_atcrash"))?;
        callback(encoder);
        encoder.end_container()?;
    }

    encoder.end_container()
}

/// Minimal artifact for a fault that occurred while the primary report was
/// being handled. Kept small and self-contained; the primary file (however
/// far it got) is preserved untouched.
pub fn write_recrash_report(ctx: &mut MonitorContext) {
    let Some(fd) = open_exclusive(RECRASH_PATH.get()) else {
        return;
    };
    let mut sink = FdSink::new(fd);
    let mut encoder = JsonEncoder::new(&mut sink);

    let _ = (|| -> Result<(), crate::json::JsonError> {
        encoder.begin_object(None)?;
        encoder.add_int(Some("report_version_major"), REPORT_VERSION_MAJOR)?;
        encoder.add_int(Some("report_version_minor"), REPORT_VERSION_MINOR)?;
        encoder.add_string(Some("crash_id"), ctx.event_id.as_str())?;
        encoder.add_string(Some("run_id"), RUN_ID.get())?;
        // SAFETY: time(2) is async-signal-safe.
        encoder.add_int(Some("timestamp"), unsafe { libc::time(ptr::null_mut()) })?;
        encoder.add_bool(Some("recrash_report"), true)?;
        encoder.begin_object(Some("crash"))?;
        write_error_info(encoder, ctx)?;
        encoder.end_container()?;
        encoder.end_container()
    })();

    // SAFETY: fd from open_exclusive.
    unsafe { libc::close(fd) };
}

fn write_machine_stats(encoder: &mut JsonEncoder<'_, FdSink>) -> Result<(), crate::json::JsonError> {
    let mut stats = VmStatistics64::default();
    let mut count =
        (core::mem::size_of::<VmStatistics64>() / 4) as mach_msg_type_number_t;
    // SAFETY: out-parameters sized to the flavor.
    let kr = unsafe {
        host_statistics64(
            mach_host_self(),
            HOST_VM_INFO64,
            &mut stats as *mut VmStatistics64 as *mut libc::c_int,
            &mut count,
        )
    };
    if kr == KERN_SUCCESS {
        let page = page_size::get() as u64;
        let free = stats.free_count as u64 * page;
        let usable = (stats.free_count as u64
            + stats.active_count as u64
            + stats.inactive_count as u64
            + stats.wire_count as u64)
            * page;
        encoder.add_uint(Some("free_memory"), free)?;
        encoder.add_uint(Some("usable_memory"), usable)?;
    }
    Ok(())
}

fn thread_name(thread: mach_port_t, out: &mut [u8; 100]) -> Option<usize> {
    // SAFETY: np pthread APIs; a null pthread is checked.
    unsafe {
        let pthread = pthread_from_mach_thread_np(thread);
        if pthread.is_null() {
            return None;
        }
        if pthread_getname_np(pthread, out.as_mut_ptr() as *mut libc::c_char, out.len()) != 0 {
            return None;
        }
    }
    let len = out.iter().position(|&b| b == 0).unwrap_or(out.len());
    if len == 0 {
        None
    } else {
        Some(len)
    }
}

fn write_frame(
    encoder: &mut JsonEncoder<'_, FdSink>,
    address: usize,
) -> Result<(), crate::json::JsonError> {
    encoder.begin_object(None)?;
    let mut name_buf = [0u8; 256];
    if let Some((image, symbol)) = images::symbolicate(address, &mut name_buf) {
        if let Some(name) = image.name {
            // Only the last path component, like dladdr consumers expect.
            let short = name.rsplit('/').next().unwrap_or(name);
            encoder.add_string(Some("object_name"), short)?;
        }
        encoder.add_uint(Some("object_addr"), image.header as u64)?;
        if let Some(symbol) = symbol {
            if let Some(len) = symbol.name_len {
                if let Ok(name) = core::str::from_utf8(&name_buf[..len]) {
                    encoder.add_string(Some("symbol_name"), name)?;
                }
            }
            encoder.add_uint(Some("symbol_addr"), symbol.symbol_address as u64)?;
        }
    }
    encoder.add_uint(Some("instruction_addr"), address as u64)?;
    encoder.end_container()
}

fn write_backtrace_from_cursor(
    encoder: &mut JsonEncoder<'_, FdSink>,
    cursor: &mut StackCursor<'_>,
    skip: usize,
) -> Result<(), crate::json::JsonError> {
    encoder.begin_array(Some("backtrace"))?;
    let mut skipped = 0usize;
    let mut emitted = 0usize;
    while emitted < MAX_BACKTRACE_DEPTH && cursor.advance() {
        if skipped < skip {
            skipped += 1;
            continue;
        }
        write_frame(encoder, cursor.address())?;
        emitted += 1;
    }
    encoder.end_container()
}

fn write_registers(
    encoder: &mut JsonEncoder<'_, FdSink>,
    registers: &cpu::RegisterSet,
    include_exception: bool,
) -> Result<(), crate::json::JsonError> {
    encoder.begin_object(Some("registers"))?;
    let mut name_buf = [0u8; 32];
    for index in 0..cpu::register_count() {
        let name = match cpu::register_name(index) {
            Some(name) => name,
            None => fmt_small(&mut name_buf, format_args!("r{index}")),
        };
        encoder.add_uint(Some(name), registers.register_value(index))?;
    }
    encoder.end_container()?;

    if include_exception {
        encoder.begin_object(Some("exception_registers"))?;
        for index in 0..cpu::exception_register_count() {
            let name = match cpu::exception_register_name(index) {
                Some(name) => name,
                None => fmt_small(&mut name_buf, format_args!("r{index}")),
            };
            encoder.add_uint(Some(name), registers.exception_register_value(index))?;
        }
        encoder.end_container()?;
    }
    Ok(())
}

/// Raw bytes around the crashed thread's stack pointer, for postmortem
/// inspection of locals and spilled values.
fn write_stack_contents(
    encoder: &mut JsonEncoder<'_, FdSink>,
    registers: &cpu::RegisterSet,
) -> Result<(), crate::json::JsonError> {
    let sp = registers.sp();
    if sp == 0 {
        return Ok(());
    }
    let start = sp.saturating_sub(STACK_DUMP_BEFORE);
    let end = sp.saturating_add(STACK_DUMP_AFTER);
    let mem = VmProbe::new();
    let mut window = [0u8; STACK_DUMP_BEFORE + STACK_DUMP_AFTER];
    let len = end - start;
    if !mem.read_bytes(start, &mut window[..len]) {
        return Ok(());
    }
    encoder.begin_object(Some("stack"))?;
    encoder.add_int(Some("grow_direction"), cpu::STACK_GROW_DIRECTION as i64)?;
    encoder.add_uint(Some("dump_start"), start as u64)?;
    encoder.add_uint(Some("dump_end"), end as u64)?;
    encoder.add_data(Some("contents"), &window[..len])?;
    encoder.end_container()
}

enum ThreadRole {
    Skip,
    CrashedWithContext,
    CrashedPrebaked,
    Normal,
}

fn role_for_thread(ctx: &MonitorContext, thread: mach_port_t, self_thread: mach_port_t) -> ThreadRole {
    if thread == self_thread {
        // The writer runs on the faulting thread for signal/panic/user
        // events, and on a service thread for Mach and watchdog events.
        return match ctx.cause {
            CrashCause::Signal { .. } => ThreadRole::CrashedWithContext,
            CrashCause::Panic { .. } | CrashCause::User { .. } => ThreadRole::CrashedPrebaked,
            _ => ThreadRole::Skip,
        };
    }
    if thread == ctx.offending_context.thread {
        match ctx.cause {
            CrashCause::Mach { .. } | CrashCause::Watchdog { .. } => ThreadRole::CrashedWithContext,
            _ => ThreadRole::Normal,
        }
    } else {
        ThreadRole::Normal
    }
}

fn write_all_threads(
    encoder: &mut JsonEncoder<'_, FdSink>,
    ctx: &mut MonitorContext,
) -> Result<(), crate::json::JsonError> {
    let task = unsafe { mach_task_self() };
    // SAFETY: new send right, released below.
    let self_thread = unsafe { mach_thread_self() };

    let mut list: *mut mach_port_t = ptr::null_mut();
    let mut count: mach_msg_type_number_t = 0;
    // SAFETY: task_threads out-params.
    let kr = unsafe { task_threads(task, &mut list, &mut count) };
    if kr != KERN_SUCCESS {
        fd_log::error("task_threads failed during report");
        unsafe { mach_port_deallocate(task, self_thread) };
        return Ok(());
    }

    // One reusable context keeps per-thread register state off the heap.
    let mut scratch = MachineContext::empty();

    encoder.begin_array(Some("threads"))?;
    for i in 0..count as usize {
        // SAFETY: the kernel vouches for `count` entries.
        let thread = unsafe { *list.add(i) };
        let role = role_for_thread(ctx, thread, self_thread);

        // RegisterSet is Copy; take it by value so the context stays
        // mutable for overflow flagging below.
        let (registers, is_crashed, prebaked): (Option<cpu::RegisterSet>, bool, bool) = match role
        {
            ThreadRole::Skip => continue,
            ThreadRole::CrashedWithContext => (Some(ctx.offending_context.registers), true, false),
            ThreadRole::CrashedPrebaked => (None, true, true),
            ThreadRole::Normal => {
                if !scratch.fill_from_thread(thread, false) {
                    fd_log::error_hex("could not fetch state for thread", thread as u64);
                    continue;
                }
                (Some(scratch.registers), false, false)
            }
        };

        encoder.begin_object(None)?;

        let mut skip = 0usize;
        if prebaked {
            let frames: &[usize] = match &ctx.cause {
                CrashCause::Panic {
                    backtrace,
                    backtrace_len,
                    ..
                } => &backtrace[..*backtrace_len],
                CrashCause::User {
                    backtrace,
                    backtrace_len,
                    ..
                } => &backtrace[..*backtrace_len],
                _ => &[],
            };
            let mut cursor = StackCursor::from_backtrace(frames);
            write_backtrace_from_cursor(encoder, &mut cursor, 0)?;
        } else if let Some(registers) = registers {
            let mut walk_ctx = MachineContext::empty();
            walk_ctx.registers = registers;
            walk_ctx.thread = thread;
            walk_ctx.is_crashed_context = is_crashed;

            let raw_length = raw_backtrace_length(&walk_ctx);
            if raw_length > OVERFLOW_THRESHOLD {
                ctx.is_stack_overflow = true;
                skip = raw_length - MAX_BACKTRACE_DEPTH;
            }
            let mut cursor = StackCursor::from_machine_context(&walk_ctx, usize::MAX);
            write_backtrace_from_cursor(encoder, &mut cursor, skip)?;
        }
        encoder.add_int(Some("backtrace_skipped"), skip as i64)?;

        if let Some(registers) = registers {
            write_registers(encoder, &registers, is_crashed)?;
            if is_crashed {
                write_stack_contents(encoder, &registers)?;
            }
        }

        let mut name_buf = [0u8; 100];
        if let Some(len) = thread_name(thread, &mut name_buf) {
            if let Ok(name) = core::str::from_utf8(&name_buf[..len]) {
                encoder.add_string(Some("name"), name)?;
            }
        }
        encoder.add_bool(Some("crashed"), is_crashed)?;
        encoder.end_container()?;
    }
    encoder.end_container()?;

    // SAFETY: releasing rights and the kernel-allocated list.
    unsafe {
        for i in 0..count as usize {
            mach_port_deallocate(task, *list.add(i));
        }
        mach_vm_deallocate(
            task,
            list as mach_vm_address_t,
            (count as usize * core::mem::size_of::<mach_port_t>()) as mach_vm_size_t,
        );
        mach_port_deallocate(task, self_thread);
    }
    Ok(())
}

fn write_error_info(
    encoder: &mut JsonEncoder<'_, FdSink>,
    ctx: &MonitorContext,
) -> Result<(), crate::json::JsonError> {
    let mut buf = [0u8; 32];

    // Normalize: every class reports both the Mach view and the signal view.
    let (mach_exception, mach_code, mach_subcode, signo, sig_code) = match &ctx.cause {
        CrashCause::Mach {
            exception,
            code,
            subcode,
        } => {
            let mut code = *code;
            if code == signals::KERN_PROTECTION_FAILURE && ctx.is_stack_overflow {
                // A stack blasting through its guard page reports
                // KERN_PROTECTION_FAILURE; the meaningful code is
                // KERN_INVALID_ADDRESS.
                code = signals::KERN_INVALID_ADDRESS;
            }
            let signo = signals::signal_for_mach_exception(*exception, code);
            (*exception, code, *subcode, signo, 0)
        }
        CrashCause::Signal { signo, code } => (
            signals::mach_exception_for_signal(*signo),
            0,
            0,
            *signo,
            *code,
        ),
        CrashCause::Panic { .. } | CrashCause::User { .. } | CrashCause::Watchdog { .. } => {
            (signals::EXC_CRASH, 0, 0, libc::SIGABRT, 0)
        }
        CrashCause::None => (0, 0, 0, 0, 0),
    };

    encoder.begin_object(Some("error"))?;

    let mach_name = match signals::mach_exception_name(mach_exception) {
        Some(name) => name,
        None => fmt_small(&mut buf, format_args!("{mach_exception:#010x}")),
    };
    encoder.add_string(Some("mach_exception"), mach_name)?;
    encoder.add_uint(Some("mach_code"), mach_code as u64)?;
    let code_name = match signals::kern_return_name(mach_code) {
        Some(name) => name,
        None => fmt_small(&mut buf, format_args!("{mach_code:#010x}")),
    };
    encoder.add_string(Some("mach_code_name"), code_name)?;
    encoder.add_uint(Some("mach_subcode"), mach_subcode as u64)?;

    encoder.add_uint(Some("signal"), signo as u64)?;
    let signal_name = match signals::signal_name(signo) {
        Some(name) => name,
        None => fmt_small(&mut buf, format_args!("{signo}")),
    };
    encoder.add_string(Some("signal_name"), signal_name)?;
    encoder.add_uint(Some("signal_code"), sig_code as u64)?;
    let sig_code_name = match signals::signal_code_name(signo, sig_code) {
        Some(name) => name,
        None => fmt_small(&mut buf, format_args!("{sig_code}")),
    };
    encoder.add_string(Some("signal_code_name"), sig_code_name)?;

    encoder.add_uint(Some("address"), ctx.fault_address as u64)?;

    match &ctx.cause {
        CrashCause::Panic { message, .. } => {
            if !message.is_empty() {
                encoder.add_string(Some("panic_message"), message.as_str())?;
            }
        }
        CrashCause::User {
            name,
            reason,
            language,
            line_of_code,
            ..
        } => {
            if !name.is_empty() {
                encoder.add_string(Some("user_exception_name"), name.as_str())?;
            }
            if !reason.is_empty() {
                encoder.add_string(Some("user_exception_reason"), reason.as_str())?;
            }
            if !language.is_empty() {
                encoder.add_string(Some("user_exception_language"), language.as_str())?;
            }
            if !line_of_code.is_empty() {
                encoder.add_string(Some("user_exception_line_of_code"), line_of_code.as_str())?;
            }
        }
        CrashCause::Watchdog { stalled_for_ms } => {
            encoder.add_uint(Some("stalled_for_ms"), *stalled_for_ms)?;
        }
        _ => {}
    }

    encoder.add_string(Some("type"), ctx.cause.type_name())?;
    encoder.end_container()
}

fn write_binary_images(
    encoder: &mut JsonEncoder<'_, FdSink>,
) -> Result<(), crate::json::JsonError> {
    let mem = VmProbe::new();
    encoder.begin_array(Some("binary_images"))?;
    for index in 0..images::image_count() {
        let Some(image) = images::image_at(index) else {
            continue;
        };
        encoder.begin_object(None)?;
        encoder.add_uint(Some("image_addr"), image.header as u64)?;
        encoder.add_uint(
            Some("image_size"),
            macho::image_size(&mem, image.header).unwrap_or(0),
        )?;
        if let Some(name) = image.name {
            encoder.add_string(Some("name"), name)?;
        }
        match macho::image_uuid(&mem, image.header) {
            Some(uuid) => encoder.add_uuid(Some("uuid"), &uuid)?,
            None => encoder.add_null(Some("uuid"))?,
        }
        if let Some(header) = macho::read_pod::<macho::MachHeader64, _>(&mem, image.header) {
            encoder.add_int(Some("cpu_type"), header.cputype as i64)?;
            encoder.add_int(Some("cpu_subtype"), header.cpusubtype as i64)?;
        }
        encoder.end_container()?;
    }
    encoder.end_container()
}
