// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! x86_64 register state (x86_THREAD_STATE64 and friends).

use super::RegisterSet;
use mach2::kern_return::KERN_SUCCESS;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::thread_act::thread_get_state;
use mach2::thread_status::thread_state_flavor_t;

pub const X86_THREAD_STATE64: thread_state_flavor_t = 4;
pub const X86_FLOAT_STATE64: thread_state_flavor_t = 5;
pub const X86_EXCEPTION_STATE64: thread_state_flavor_t = 6;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionState {
    pub trapno: u16,
    pub cpu: u16,
    pub err: u32,
    pub faultvaddr: u64,
}

/// Opaque x86 float/SSE state; large and fetched only so the bank exists.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FloatState {
    pub data: [u64; 76],
}

impl Default for FloatState {
    fn default() -> Self {
        // SAFETY: all-zero is a valid bit pattern for this POD struct.
        unsafe { core::mem::zeroed() }
    }
}

const THREAD_STATE_COUNT: mach_msg_type_number_t =
    (core::mem::size_of::<ThreadState>() / 4) as mach_msg_type_number_t;
const EXCEPTION_STATE_COUNT: mach_msg_type_number_t =
    (core::mem::size_of::<ExceptionState>() / 4) as mach_msg_type_number_t;
const FLOAT_STATE_COUNT: mach_msg_type_number_t =
    (core::mem::size_of::<FloatState>() / 4) as mach_msg_type_number_t;

static REGISTER_NAMES: [&str; 21] = [
    "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip", "rflags", "cs", "fs", "gs",
];

static EXCEPTION_REGISTER_NAMES: [&str; 3] = ["trapno", "err", "faultvaddr"];

pub fn register_count() -> usize {
    REGISTER_NAMES.len()
}

pub fn register_name(index: usize) -> Option<&'static str> {
    REGISTER_NAMES.get(index).copied()
}

pub fn exception_register_count() -> usize {
    EXCEPTION_REGISTER_NAMES.len()
}

pub fn exception_register_name(index: usize) -> Option<&'static str> {
    EXCEPTION_REGISTER_NAMES.get(index).copied()
}

/// No pointer authentication on x86_64.
pub fn normalize_instruction_pointer(addr: usize) -> usize {
    addr
}

impl RegisterSet {
    pub fn pc(&self) -> usize {
        self.thread.rip as usize
    }

    pub fn sp(&self) -> usize {
        self.thread.rsp as usize
    }

    pub fn fp(&self) -> usize {
        self.thread.rbp as usize
    }

    /// x86_64 has no link register.
    pub fn lr(&self) -> usize {
        0
    }

    pub fn set_pc(&mut self, value: usize) {
        self.thread.rip = value as u64;
    }

    pub fn set_sp(&mut self, value: usize) {
        self.thread.rsp = value as u64;
    }

    pub fn set_fp(&mut self, value: usize) {
        self.thread.rbp = value as u64;
    }

    pub fn fault_address(&self) -> usize {
        self.exception.faultvaddr as usize
    }

    pub fn register_value(&self, index: usize) -> u64 {
        match index {
            0 => self.thread.rax,
            1 => self.thread.rbx,
            2 => self.thread.rcx,
            3 => self.thread.rdx,
            4 => self.thread.rdi,
            5 => self.thread.rsi,
            6 => self.thread.rbp,
            7 => self.thread.rsp,
            8 => self.thread.r8,
            9 => self.thread.r9,
            10 => self.thread.r10,
            11 => self.thread.r11,
            12 => self.thread.r12,
            13 => self.thread.r13,
            14 => self.thread.r14,
            15 => self.thread.r15,
            16 => self.thread.rip,
            17 => self.thread.rflags,
            18 => self.thread.cs,
            19 => self.thread.fs,
            20 => self.thread.gs,
            _ => 0,
        }
    }

    pub fn exception_register_value(&self, index: usize) -> u64 {
        match index {
            0 => self.exception.trapno as u64,
            1 => self.exception.err as u64,
            2 => self.exception.faultvaddr,
            _ => 0,
        }
    }

    /// Fetch all three banks from a (suspended) thread. The general bank is
    /// required; exception and float are best-effort.
    pub fn fill_from_thread(&mut self, thread: mach_port_t) -> bool {
        let mut count = THREAD_STATE_COUNT;
        // SAFETY: the out-pointer/count pairs match the flavor's layout.
        let kr = unsafe {
            thread_get_state(
                thread,
                X86_THREAD_STATE64,
                &mut self.thread as *mut ThreadState as *mut _,
                &mut count,
            )
        };
        if kr != KERN_SUCCESS {
            return false;
        }
        let mut count = EXCEPTION_STATE_COUNT;
        // SAFETY: as above.
        unsafe {
            thread_get_state(
                thread,
                X86_EXCEPTION_STATE64,
                &mut self.exception as *mut ExceptionState as *mut _,
                &mut count,
            );
        }
        let mut count = FLOAT_STATE_COUNT;
        // SAFETY: as above.
        unsafe {
            thread_get_state(
                thread,
                X86_FLOAT_STATE64,
                &mut self.float as *mut FloatState as *mut _,
                &mut count,
            );
        }
        true
    }

    /// Transcribe a signal handler's ucontext into the register banks.
    ///
    /// # Safety
    /// `ucontext` must be the pointer handed to a `SA_SIGINFO` handler.
    pub unsafe fn fill_from_ucontext(&mut self, ucontext: *const libc::ucontext_t) -> bool {
        if ucontext.is_null() {
            return false;
        }
        let mcontext = (*ucontext).uc_mcontext;
        if mcontext.is_null() {
            return false;
        }
        let ss = &(*mcontext).__ss;
        self.thread.rax = ss.__rax;
        self.thread.rbx = ss.__rbx;
        self.thread.rcx = ss.__rcx;
        self.thread.rdx = ss.__rdx;
        self.thread.rdi = ss.__rdi;
        self.thread.rsi = ss.__rsi;
        self.thread.rbp = ss.__rbp;
        self.thread.rsp = ss.__rsp;
        self.thread.r8 = ss.__r8;
        self.thread.r9 = ss.__r9;
        self.thread.r10 = ss.__r10;
        self.thread.r11 = ss.__r11;
        self.thread.r12 = ss.__r12;
        self.thread.r13 = ss.__r13;
        self.thread.r14 = ss.__r14;
        self.thread.r15 = ss.__r15;
        self.thread.rip = ss.__rip;
        self.thread.rflags = ss.__rflags;
        self.thread.cs = ss.__cs;
        self.thread.fs = ss.__fs;
        self.thread.gs = ss.__gs;
        let es = &(*mcontext).__es;
        self.exception.trapno = es.__trapno;
        self.exception.cpu = es.__cpu;
        self.exception.err = es.__err;
        self.exception.faultvaddr = es.__faultvaddr;
        true
    }
}
