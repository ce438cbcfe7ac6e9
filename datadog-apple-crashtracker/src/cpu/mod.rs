// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-architecture register state.
//!
//! Darwin currently ships on aarch64 and x86_64; each gets a module with an
//! identical surface, selected by conditional compilation. Register indices
//! are stable within an architecture; cross-architecture code addresses
//! registers only by name through the accessors here.

#[cfg(target_arch = "aarch64")]
mod arm64;
#[cfg(target_arch = "aarch64")]
pub use arm64::*;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

/// Stacks grow downward on every supported architecture.
pub const STACK_GROW_DIRECTION: i32 = -1;

/// The three register banks of one thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterSet {
    pub thread: ThreadState,
    pub exception: ExceptionState,
    pub float: FloatState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names_are_exhaustive() {
        let set = RegisterSet::default();
        for i in 0..register_count() {
            assert!(register_name(i).is_some(), "missing name for register {i}");
            // Default state reads as zero everywhere.
            assert_eq!(set.register_value(i), 0);
        }
        assert!(register_name(register_count()).is_none());
    }

    #[test]
    fn test_exception_register_names_are_exhaustive() {
        let set = RegisterSet::default();
        for i in 0..exception_register_count() {
            assert!(exception_register_name(i).is_some());
            assert_eq!(set.exception_register_value(i), 0);
        }
        assert!(exception_register_name(exception_register_count()).is_none());
    }

    #[test]
    fn test_pc_sp_fp_accessors_track_fields() {
        let mut set = RegisterSet::default();
        set.set_pc(0x1000);
        set.set_sp(0x2000);
        set.set_fp(0x3000);
        assert_eq!(set.pc(), 0x1000);
        assert_eq!(set.sp(), 0x2000);
        assert_eq!(set.fp(), 0x3000);
    }

    #[test]
    fn test_fetch_suspended_thread_state() {
        use std::sync::mpsc;
        use std::time::Duration;

        // The kernel only guarantees coherent state for a stopped thread.
        let (port_tx, port_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            let port = unsafe { mach2::mach_init::mach_thread_self() };
            port_tx.send(port).unwrap();
            let _ = done_rx.recv_timeout(Duration::from_secs(10));
        });
        let thread = port_rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(10));

        unsafe {
            assert_eq!(
                mach2::thread_act::thread_suspend(thread),
                mach2::kern_return::KERN_SUCCESS
            );
        }
        let mut set = RegisterSet::default();
        assert!(set.fill_from_thread(thread));
        // A parked thread has a live stack pointer and program counter.
        assert_ne!(set.sp(), 0);
        assert_ne!(set.pc(), 0);
        unsafe {
            mach2::thread_act::thread_resume(thread);
        }

        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }
}
