// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal and Mach-exception naming, and the mapping between the two.
//!
//! The kernel reports the same fault through different vocabularies
//! depending on which sentry catches it; reports normalize by emitting both
//! the Mach view and the BSD-signal view for every error, whichever side
//! was observed.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

// Mach exception types (mach/exception_types.h).
pub const EXC_BAD_ACCESS: i32 = 1;
pub const EXC_BAD_INSTRUCTION: i32 = 2;
pub const EXC_ARITHMETIC: i32 = 3;
pub const EXC_EMULATION: i32 = 4;
pub const EXC_SOFTWARE: i32 = 5;
pub const EXC_BREAKPOINT: i32 = 6;
pub const EXC_CRASH: i32 = 10;

// Kernel return codes seen as EXC_BAD_ACCESS codes.
pub const KERN_INVALID_ADDRESS: i64 = 1;
pub const KERN_PROTECTION_FAILURE: i64 = 2;

// The BSD layer raises SIGABRT through EXC_SOFTWARE with this code.
pub const EXC_UNIX_BAD_SYSCALL: i64 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(i32)]
pub enum FatalSignal {
    Hup = libc::SIGHUP,
    Int = libc::SIGINT,
    Quit = libc::SIGQUIT,
    Ill = libc::SIGILL,
    Trap = libc::SIGTRAP,
    Abrt = libc::SIGABRT,
    #[cfg(target_vendor = "apple")]
    Emt = libc::SIGEMT,
    Fpe = libc::SIGFPE,
    Kill = libc::SIGKILL,
    Bus = libc::SIGBUS,
    Segv = libc::SIGSEGV,
    Sys = libc::SIGSYS,
    Pipe = libc::SIGPIPE,
    Alrm = libc::SIGALRM,
    Term = libc::SIGTERM,
    Xcpu = libc::SIGXCPU,
    Xfsz = libc::SIGXFSZ,
}

impl FatalSignal {
    pub fn name(self) -> &'static str {
        match self {
            FatalSignal::Hup => "SIGHUP",
            FatalSignal::Int => "SIGINT",
            FatalSignal::Quit => "SIGQUIT",
            FatalSignal::Ill => "SIGILL",
            FatalSignal::Trap => "SIGTRAP",
            FatalSignal::Abrt => "SIGABRT",
            #[cfg(target_vendor = "apple")]
            FatalSignal::Emt => "SIGEMT",
            FatalSignal::Fpe => "SIGFPE",
            FatalSignal::Kill => "SIGKILL",
            FatalSignal::Bus => "SIGBUS",
            FatalSignal::Segv => "SIGSEGV",
            FatalSignal::Sys => "SIGSYS",
            FatalSignal::Pipe => "SIGPIPE",
            FatalSignal::Alrm => "SIGALRM",
            FatalSignal::Term => "SIGTERM",
            FatalSignal::Xcpu => "SIGXCPU",
            FatalSignal::Xfsz => "SIGXFSZ",
        }
    }
}

/// `"SIGSEGV"` for 11, None for anything unnamed.
pub fn signal_name(signo: i32) -> Option<&'static str> {
    FatalSignal::from_i32(signo).map(FatalSignal::name)
}

/// The si_code name for a signal, where one exists.
pub fn signal_code_name(signo: i32, code: i32) -> Option<&'static str> {
    let name = match (signo, code) {
        (libc::SIGILL, 1) => "ILL_ILLOPC",
        (libc::SIGILL, 2) => "ILL_ILLTRP",
        (libc::SIGILL, 3) => "ILL_PRVOPC",
        (libc::SIGILL, 4) => "ILL_ILLOPN",
        (libc::SIGILL, 5) => "ILL_ILLADR",
        (libc::SIGILL, 6) => "ILL_PRVREG",
        (libc::SIGILL, 7) => "ILL_COPROC",
        (libc::SIGILL, 8) => "ILL_BADSTK",
        (libc::SIGFPE, 1) => "FPE_FLTDIV",
        (libc::SIGFPE, 2) => "FPE_FLTOVF",
        (libc::SIGFPE, 3) => "FPE_FLTUND",
        (libc::SIGFPE, 4) => "FPE_FLTRES",
        (libc::SIGFPE, 5) => "FPE_FLTINV",
        (libc::SIGFPE, 6) => "FPE_FLTSUB",
        (libc::SIGFPE, 7) => "FPE_INTDIV",
        (libc::SIGFPE, 8) => "FPE_INTOVF",
        (libc::SIGSEGV, 1) => "SEGV_MAPERR",
        (libc::SIGSEGV, 2) => "SEGV_ACCERR",
        (libc::SIGBUS, 1) => "BUS_ADRALN",
        (libc::SIGBUS, 2) => "BUS_ADRERR",
        (libc::SIGBUS, 3) => "BUS_OBJERR",
        (libc::SIGTRAP, 1) => "TRAP_BRKPT",
        (libc::SIGTRAP, 2) => "TRAP_TRACE",
        _ => return None,
    };
    Some(name)
}

pub fn mach_exception_name(exception: i32) -> Option<&'static str> {
    let name = match exception {
        EXC_BAD_ACCESS => "EXC_BAD_ACCESS",
        EXC_BAD_INSTRUCTION => "EXC_BAD_INSTRUCTION",
        EXC_ARITHMETIC => "EXC_ARITHMETIC",
        EXC_EMULATION => "EXC_EMULATION",
        EXC_SOFTWARE => "EXC_SOFTWARE",
        EXC_BREAKPOINT => "EXC_BREAKPOINT",
        EXC_CRASH => "EXC_CRASH",
        _ => return None,
    };
    Some(name)
}

/// Name of a kern_return_t appearing as a Mach exception code.
pub fn kern_return_name(code: i64) -> Option<&'static str> {
    let name = match code {
        KERN_INVALID_ADDRESS => "KERN_INVALID_ADDRESS",
        KERN_PROTECTION_FAILURE => "KERN_PROTECTION_FAILURE",
        3 => "KERN_NO_SPACE",
        4 => "KERN_INVALID_ARGUMENT",
        5 => "KERN_FAILURE",
        6 => "KERN_RESOURCE_SHORTAGE",
        9 => "KERN_MEMORY_FAILURE",
        10 => "KERN_MEMORY_ERROR",
        _ => return None,
    };
    Some(name)
}

/// The BSD signal the kernel would deliver for a Mach exception, following
/// the ux_exception translation.
pub fn signal_for_mach_exception(exception: i32, code: i64) -> i32 {
    match exception {
        EXC_BAD_ACCESS => {
            if code == KERN_INVALID_ADDRESS {
                libc::SIGSEGV
            } else {
                libc::SIGBUS
            }
        }
        EXC_BAD_INSTRUCTION => libc::SIGILL,
        EXC_ARITHMETIC => libc::SIGFPE,
        #[cfg(target_vendor = "apple")]
        EXC_EMULATION => libc::SIGEMT,
        EXC_SOFTWARE => {
            if code == EXC_UNIX_BAD_SYSCALL {
                libc::SIGSYS
            } else {
                libc::SIGABRT
            }
        }
        EXC_BREAKPOINT => libc::SIGTRAP,
        EXC_CRASH => libc::SIGABRT,
        _ => 0,
    }
}

/// The Mach exception type a signal corresponds to (reverse mapping).
pub fn mach_exception_for_signal(signo: i32) -> i32 {
    match signo {
        libc::SIGSEGV | libc::SIGBUS => EXC_BAD_ACCESS,
        libc::SIGILL => EXC_BAD_INSTRUCTION,
        libc::SIGFPE => EXC_ARITHMETIC,
        #[cfg(target_vendor = "apple")]
        libc::SIGEMT => EXC_EMULATION,
        libc::SIGSYS | libc::SIGPIPE | libc::SIGABRT => EXC_SOFTWARE,
        libc::SIGTRAP => EXC_BREAKPOINT,
        _ => EXC_CRASH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGSEGV), Some("SIGSEGV"));
        assert_eq!(signal_name(libc::SIGABRT), Some("SIGABRT"));
        assert_eq!(signal_name(0), None);
    }

    #[test]
    fn test_code_names() {
        assert_eq!(signal_code_name(libc::SIGSEGV, 1), Some("SEGV_MAPERR"));
        assert_eq!(signal_code_name(libc::SIGSEGV, 99), None);
        assert_eq!(signal_code_name(libc::SIGFPE, 7), Some("FPE_INTDIV"));
    }

    #[test]
    fn test_mach_signal_round_trips() {
        // Every fatal signal maps to a Mach exception whose forward mapping
        // lands back on a compatible signal.
        for signo in [libc::SIGSEGV, libc::SIGILL, libc::SIGFPE, libc::SIGTRAP] {
            let exc = mach_exception_for_signal(signo);
            let back = signal_for_mach_exception(exc, KERN_INVALID_ADDRESS);
            match signo {
                libc::SIGSEGV => assert_eq!(back, libc::SIGSEGV),
                _ => assert_eq!(back, signal_for_mach_exception(exc, 0)),
            }
        }
    }

    #[test]
    fn test_exc_bad_access_code_selects_signal() {
        assert_eq!(
            signal_for_mach_exception(EXC_BAD_ACCESS, KERN_INVALID_ADDRESS),
            libc::SIGSEGV
        );
        assert_eq!(
            signal_for_mach_exception(EXC_BAD_ACCESS, KERN_PROTECTION_FAILURE),
            libc::SIGBUS
        );
    }

    #[test]
    fn test_kern_return_names() {
        assert_eq!(kern_return_name(1), Some("KERN_INVALID_ADDRESS"));
        assert_eq!(kern_return_name(2), Some("KERN_PROTECTION_FAILURE"));
        assert_eq!(kern_return_name(1234), None);
    }
}
