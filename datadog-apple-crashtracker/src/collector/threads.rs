// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Task-wide thread suspension.
//!
//! Before a crashed process can be inspected, every other thread must be
//! frozen, or registers and stacks are read mid-flight. The reporter's own
//! service threads (the Mach exception listener, watchdog watchers) are
//! registered as reserved and never suspended; suspending the thread that
//! is doing the capture would deadlock the process for good.

use crate::shared::constants::{MAX_CAPTURED_THREADS, RESERVED_THREAD_CAPACITY};
use crate::shared::fd_log;
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::mach_port_deallocate;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::task::task_threads;
use mach2::thread_act::{thread_resume, thread_suspend};
use mach2::traps::mach_task_self;
use mach2::vm::mach_vm_deallocate;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicU32, AtomicUsize};

#[allow(clippy::declare_interior_mutable_const)]
const NO_THREAD: AtomicU32 = AtomicU32::new(0);
static RESERVED_THREADS: [AtomicU32; RESERVED_THREAD_CAPACITY] =
    [NO_THREAD; RESERVED_THREAD_CAPACITY];
static RESERVED_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Mark a thread as never-suspend. Called by the Mach listener and watchdog
/// threads for themselves at startup.
pub fn add_reserved_thread(thread: mach_port_t) {
    let index = RESERVED_COUNT.fetch_add(1, SeqCst);
    if index < RESERVED_THREAD_CAPACITY {
        RESERVED_THREADS[index].store(thread, SeqCst);
    } else {
        RESERVED_COUNT.store(RESERVED_THREAD_CAPACITY, SeqCst);
        fd_log::error("reserved thread list full");
    }
}

pub fn is_reserved_thread(thread: mach_port_t) -> bool {
    let count = RESERVED_COUNT.load(SeqCst).min(RESERVED_THREAD_CAPACITY);
    RESERVED_THREADS[..count]
        .iter()
        .any(|t| t.load(SeqCst) == thread)
}

/// Handles of the threads suspended for one capture event. Lives inside the
/// machine context of the crashed thread; sized statically so no allocation
/// happens on the capture path.
pub struct ThreadSnapshot {
    threads: [mach_port_t; MAX_CAPTURED_THREADS],
    count: usize,
    suspended: bool,
}

impl ThreadSnapshot {
    pub const fn new() -> Self {
        Self {
            threads: [0; MAX_CAPTURED_THREADS],
            count: 0,
            suspended: false,
        }
    }

    pub fn threads(&self) -> &[mach_port_t] {
        &self.threads[..self.count]
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

impl Default for ThreadSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Suspend every thread in the task except the caller and the reserved set.
/// Idempotent: a snapshot that already holds suspended threads is left
/// untouched.
pub fn suspend_environment(snapshot: &mut ThreadSnapshot) {
    if snapshot.suspended {
        return;
    }

    let task = unsafe { mach_task_self() };
    // SAFETY: mach_thread_self returns a new send right; released below.
    let self_thread = unsafe { mach_thread_self() };

    let mut list: *mut mach_port_t = core::ptr::null_mut();
    let mut count: mach_msg_type_number_t = 0;
    // SAFETY: out-params per the task_threads contract.
    let kr = unsafe { task_threads(task, &mut list, &mut count) };
    if kr != KERN_SUCCESS {
        fd_log::error("task_threads failed during suspend");
        unsafe { mach_port_deallocate(task, self_thread) };
        return;
    }

    snapshot.count = 0;
    for i in 0..count as usize {
        // SAFETY: the kernel vouches for `count` entries.
        let thread = unsafe { *list.add(i) };
        if thread == self_thread || is_reserved_thread(thread) {
            unsafe { mach_port_deallocate(task, thread) };
            continue;
        }
        // SAFETY: suspending a thread we hold a right for.
        let kr = unsafe { thread_suspend(thread) };
        if kr != KERN_SUCCESS {
            unsafe { mach_port_deallocate(task, thread) };
            continue;
        }
        if snapshot.count < MAX_CAPTURED_THREADS {
            snapshot.threads[snapshot.count] = thread;
            snapshot.count += 1;
        } else {
            // Over capacity: resume rather than leave it frozen untracked.
            unsafe {
                thread_resume(thread);
                mach_port_deallocate(task, thread);
            }
        }
    }

    // SAFETY: releasing the kernel-allocated thread list and our self right.
    unsafe {
        mach_vm_deallocate(
            task,
            list as mach_vm_address_t,
            (count as usize * core::mem::size_of::<mach_port_t>()) as mach_vm_size_t,
        );
        mach_port_deallocate(task, self_thread);
    }

    snapshot.suspended = true;
}

/// Resume every thread recorded in the snapshot and clear it. Idempotent:
/// an empty or never-suspended snapshot is a no-op.
pub fn resume_environment(snapshot: &mut ThreadSnapshot) {
    if !snapshot.suspended {
        return;
    }
    let task = unsafe { mach_task_self() };
    for &thread in snapshot.threads[..snapshot.count].iter() {
        // SAFETY: we suspended these threads and still hold their rights.
        unsafe {
            thread_resume(thread);
            mach_port_deallocate(task, thread);
        }
    }
    snapshot.count = 0;
    snapshot.suspended = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reserved_thread_roundtrip() {
        assert!(!is_reserved_thread(0xDEAD));
        add_reserved_thread(0xDEAD);
        assert!(is_reserved_thread(0xDEAD));
    }

    #[test]
    fn test_suspend_resume_environment() {
        let running = Arc::new(AtomicBool::new(true));
        let observed = Arc::new(AtomicUsize::new(0));
        let worker = {
            let running = Arc::clone(&running);
            let observed = Arc::clone(&observed);
            std::thread::spawn(move || {
                while running.load(SeqCst) {
                    observed.fetch_add(1, SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        let mut snapshot = ThreadSnapshot::new();
        suspend_environment(&mut snapshot);
        assert!(snapshot.is_suspended());
        assert!(!snapshot.threads().is_empty());

        // While suspended, the worker makes no progress.
        let before = observed.load(SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        let during = observed.load(SeqCst);
        assert_eq!(before, during);

        // Suspend is a no-op while already suspended.
        let count = snapshot.threads().len();
        suspend_environment(&mut snapshot);
        assert_eq!(snapshot.threads().len(), count);

        resume_environment(&mut snapshot);
        assert!(!snapshot.is_suspended());
        std::thread::sleep(Duration::from_millis(30));
        assert!(observed.load(SeqCst) > during);

        // Resume twice is a no-op.
        resume_environment(&mut snapshot);

        running.store(false, SeqCst);
        worker.join().unwrap();
    }
}
