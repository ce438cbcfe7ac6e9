// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Materialized register state for one thread.
//!
//! A machine context bundles the three register banks with the identity of
//! the thread they came from, and (for the crashing thread) owns the
//! snapshot of every other thread that was suspended for the event. It is
//! created on the sentry's stack and dies with the exception event; it is
//! never shared across threads without external synchronization.

use crate::collector::threads::ThreadSnapshot;
use crate::cpu::RegisterSet;
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::mach_port_deallocate;
use mach2::port::mach_port_t;
use mach2::traps::mach_task_self;

pub struct MachineContext {
    pub registers: RegisterSet,
    pub thread: mach_port_t,
    pub is_crashed_context: bool,
    /// Suspended-thread handles for the event; populated only on the
    /// crashed thread's context.
    pub snapshot: ThreadSnapshot,
}

impl MachineContext {
    pub const fn empty() -> Self {
        Self {
            registers: RegisterSet {
                thread: unsafe { core::mem::zeroed() },
                exception: unsafe { core::mem::zeroed() },
                float: unsafe { core::mem::zeroed() },
            },
            thread: 0,
            is_crashed_context: false,
            snapshot: ThreadSnapshot::new(),
        }
    }

    /// Fill from a (suspended) thread via the kernel's thread-state API.
    pub fn fill_from_thread(&mut self, thread: mach_port_t, is_crashed: bool) -> bool {
        self.thread = thread;
        self.is_crashed_context = is_crashed;
        self.registers.fill_from_thread(thread)
    }

    /// Fill from a signal handler's ucontext. Signal contexts always
    /// describe the crashed thread.
    ///
    /// # Safety
    /// `ucontext` must be the pointer handed to a `SA_SIGINFO` handler.
    pub unsafe fn fill_from_signal(&mut self, ucontext: *const libc::ucontext_t) -> bool {
        self.thread = mach_thread_self();
        mach_port_deallocate(mach_task_self(), self.thread);
        self.is_crashed_context = true;
        self.registers.fill_from_ucontext(ucontext)
    }

    pub fn pc(&self) -> usize {
        self.registers.pc()
    }

    pub fn sp(&self) -> usize {
        self.registers.sp()
    }

    pub fn fp(&self) -> usize {
        self.registers.fp()
    }

    pub fn fault_address(&self) -> usize {
        self.registers.fault_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::threads;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_fill_from_suspended_thread() {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            ready_tx.send(()).unwrap();
            let _ = done_rx.recv_timeout(Duration::from_secs(10));
        });
        ready_rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let mut snapshot = threads::ThreadSnapshot::new();
        threads::suspend_environment(&mut snapshot);

        let mut any_context = false;
        for &thread in snapshot.threads() {
            let mut ctx = MachineContext::empty();
            if ctx.fill_from_thread(thread, false) {
                any_context = true;
                // A parked thread has a live stack pointer.
                assert_ne!(ctx.sp(), 0);
                assert!(!ctx.is_crashed_context);
            }
        }
        assert!(any_context, "at least one suspended thread yields state");

        threads::resume_environment(&mut snapshot);
        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }
}
