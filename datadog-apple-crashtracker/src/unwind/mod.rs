// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The stack unwinder.
//!
//! Given a thread's register state, produce the sequence of return
//! addresses, correctly crossing frame-pointer-less functions, tail calls,
//! signal frames and leaf functions, while staying async-signal-safe.
//!
//! Each frame is recovered by the first method that succeeds, in order:
//!
//! 1. Compact unwind (`__TEXT,__unwind_info`): [`compact`]
//! 2. DWARF CFI (`__TEXT,__eh_frame`): [`dwarf`]
//! 3. Frame-pointer walk: [`frame_pointer`]
//!
//! The cursor records which method produced each frame. All memory access
//! goes through the fault-tolerant probe; a bad pointer ends the chain
//! instead of crashing the crash reporter.

pub mod compact;
pub mod dwarf;
pub mod frame_pointer;

#[cfg(target_vendor = "apple")]
pub mod cache;
#[cfg(target_vendor = "apple")]
pub mod cursor;

/// How a frame was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnwindMethod {
    /// The frame was not unwound (the PC frame, or the LR shortcut frame).
    #[default]
    None,
    CompactUnwind,
    Dwarf,
    FramePointer,
}

impl UnwindMethod {
    pub fn name(self) -> &'static str {
        match self {
            UnwindMethod::None => "none",
            UnwindMethod::CompactUnwind => "compact_unwind",
            UnwindMethod::Dwarf => "dwarf",
            UnwindMethod::FramePointer => "frame_pointer",
        }
    }
}

/// One successful unwind step: the caller's resumption state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    pub return_address: usize,
    pub stack_pointer: usize,
    pub frame_pointer: usize,
}

/// Return addresses point one past the call; looking up unwind info for
/// `pc - 1` lands inside the calling function and avoids spurious frames at
/// function boundaries. The initial (faulting) PC is used as-is.
pub fn lookup_pc(pc: usize, is_return_address: bool) -> usize {
    if is_return_address && pc > 0 {
        pc - 1
    } else {
        pc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(UnwindMethod::None.name(), "none");
        assert_eq!(UnwindMethod::CompactUnwind.name(), "compact_unwind");
        assert_eq!(UnwindMethod::Dwarf.name(), "dwarf");
        assert_eq!(UnwindMethod::FramePointer.name(), "frame_pointer");
    }

    #[test]
    fn test_lookup_pc_adjusts_return_addresses_only() {
        assert_eq!(lookup_pc(0x1000, false), 0x1000);
        assert_eq!(lookup_pc(0x1000, true), 0xfff);
        assert_eq!(lookup_pc(0, true), 0);
    }
}
