// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The stack cursor: an iterator over call-stack frames.
//!
//! Three variants share one interface: unwinding a machine context with the
//! compact-unwind → DWARF → frame-pointer method chain, replaying a
//! pre-captured address array (language exceptions), and capturing the
//! calling thread's own frames through the `backtrace` crate's unsynchronized
//! walker. Only the first records per-frame unwind methods.

use crate::collector::machine_context::MachineContext;
use crate::cpu;
#[cfg(target_arch = "aarch64")]
use crate::memory::MemoryReader;
use crate::memory::probe::VmProbe;
use crate::shared::constants::BACKTRACE_GIVE_UP_POINT;
use crate::unwind::{cache, compact, dwarf, frame_pointer, lookup_pc, StepResult, UnwindMethod};

/// Maximum frames captured by the self-thread variant.
pub const SELF_THREAD_MAX_FRAMES: usize = 100;

const METHOD_CHAIN_LEN: usize = 3;

struct UnwindState<'a> {
    context: &'a MachineContext,
    max_depth: usize,
    pc: usize,
    sp: usize,
    fp: usize,
    lr: usize,
    is_first_frame: bool,
    #[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
    used_link_register: bool,
    reached_end_of_stack: bool,
    last_method: UnwindMethod,
    methods: [UnwindMethod; METHOD_CHAIN_LEN],
}

enum CursorState<'a> {
    Unwind(UnwindState<'a>),
    Backtrace { addresses: &'a [usize], index: usize },
    SelfThread {
        addresses: [usize; SELF_THREAD_MAX_FRAMES],
        count: usize,
        index: usize,
    },
}

pub struct StackCursor<'a> {
    address: usize,
    depth: usize,
    has_given_up: bool,
    state: CursorState<'a>,
}

/// An address below the first page is a NULL pointer, an uninitialized LR,
/// or a corrupted return address at a thread boundary (`thread_start`,
/// `_pthread_start`); none of them is code.
fn is_valid_code_address(address: usize) -> bool {
    address > page_size::get()
}

fn try_compact_for_pc(pc: usize, sp: usize, fp: usize, lr: usize) -> Option<StepResult> {
    let info = cache::info_for_address(pc)?;
    let (section_addr, section_size) = info.unwind_info?;
    let mem = VmProbe::new();
    let entry = compact::find_entry(&mem, section_addr, section_size, pc, info.header, info.slide)?;
    if compact::encoding_requires_dwarf(entry.encoding) {
        return None;
    }
    #[cfg(target_arch = "aarch64")]
    {
        compact::arm64::decode(&mem, entry.encoding, sp, fp, lr, None)
    }
    #[cfg(target_arch = "x86_64")]
    {
        let _ = lr;
        compact::x86_64::decode(&mem, entry.encoding, sp, fp)
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    {
        let _ = (sp, fp, lr, entry);
        None
    }
}

fn try_dwarf_for_pc(pc: usize, sp: usize, fp: usize, lr: usize) -> Option<StepResult> {
    let info = cache::info_for_address(pc)?;
    let (section_addr, section_size) = info.eh_frame?;
    let mem = VmProbe::new();
    dwarf::unwind(
        &mem,
        section_addr,
        section_size,
        dwarf::DwarfArch::current(),
        pc,
        dwarf::InputRegisters { sp, fp, lr },
    )
}

impl<'a> UnwindState<'a> {
    fn new(context: &'a MachineContext, max_depth: usize) -> Self {
        Self {
            context,
            max_depth,
            pc: 0,
            sp: 0,
            fp: 0,
            lr: 0,
            is_first_frame: true,
            used_link_register: false,
            reached_end_of_stack: false,
            last_method: UnwindMethod::None,
            methods: [
                UnwindMethod::CompactUnwind,
                UnwindMethod::Dwarf,
                UnwindMethod::FramePointer,
            ],
        }
    }

    fn reset(&mut self) {
        // The method chain survives reset.
        self.pc = 0;
        self.sp = 0;
        self.fp = 0;
        self.lr = 0;
        self.is_first_frame = true;
        self.used_link_register = false;
        self.reached_end_of_stack = false;
        self.last_method = UnwindMethod::None;
    }

    /// Try one method; on success update `(pc, sp, fp)` and return the new
    /// return address.
    fn try_method(&mut self, method: UnwindMethod, is_return_address: bool) -> Option<usize> {
        let pc = lookup_pc(self.pc, is_return_address);
        match method {
            UnwindMethod::CompactUnwind => {
                let step = try_compact_for_pc(pc, self.sp, self.fp, self.lr)?;
                self.sp = step.stack_pointer;
                self.fp = step.frame_pointer;
                self.pc = step.return_address;
                self.last_method = UnwindMethod::CompactUnwind;
                Some(step.return_address)
            }
            UnwindMethod::Dwarf => {
                let step = try_dwarf_for_pc(pc, self.sp, self.fp, self.lr)?;
                self.sp = step.stack_pointer;
                self.fp = step.frame_pointer;
                self.pc = step.return_address;
                self.last_method = UnwindMethod::Dwarf;
                Some(step.return_address)
            }
            UnwindMethod::FramePointer => {
                let step = frame_pointer::walk(&VmProbe::new(), self.fp)?;
                self.sp = step.new_sp;
                self.fp = step.new_fp;
                self.pc = step.return_address;
                self.last_method = UnwindMethod::FramePointer;
                Some(step.return_address)
            }
            UnwindMethod::None => None,
        }
    }

    /// After consuming LR as the second frame, bring `(pc, sp, fp)` in sync
    /// by running one round of the method chain against the exact PC (it is
    /// still the faulting instruction pointer, not a return address).
    #[cfg(target_arch = "aarch64")]
    fn update_state_after_lr(&mut self) -> bool {
        for i in 0..METHOD_CHAIN_LEN {
            match self.methods[i] {
                UnwindMethod::CompactUnwind => {
                    if let Some(step) = try_compact_for_pc(self.pc, self.sp, self.fp, self.lr) {
                        self.sp = step.stack_pointer;
                        self.fp = step.frame_pointer;
                        self.pc = step.return_address;
                        return true;
                    }
                }
                UnwindMethod::Dwarf => {
                    if let Some(step) = try_dwarf_for_pc(self.pc, self.sp, self.fp, self.lr) {
                        self.sp = step.stack_pointer;
                        self.fp = step.frame_pointer;
                        self.pc = step.return_address;
                        return true;
                    }
                }
                UnwindMethod::FramePointer => {
                    let mem = VmProbe::new();
                    if self.fp != 0 {
                        if let (Some(previous), Some(_)) =
                            (mem.read_usize(self.fp), mem.read_usize(self.fp + 8))
                        {
                            if previous != 0 && previous <= self.fp {
                                continue; // direction violation; next method
                            }
                            self.fp = previous;
                            self.pc = self.lr;
                            return true;
                        }
                    }
                }
                UnwindMethod::None => {}
            }
        }
        false
    }

    fn advance(&mut self, depth: usize) -> Option<usize> {
        if depth >= self.max_depth {
            return None;
        }
        // FP hit zero on a previous step: the thread entry point was
        // already emitted, anything further would be garbage.
        if self.reached_end_of_stack {
            return None;
        }

        if self.is_first_frame {
            self.is_first_frame = false;
            self.pc = self.context.registers.pc();
            self.sp = self.context.registers.sp();
            self.fp = self.context.registers.fp();
            self.lr = self.context.registers.lr();
            if self.pc == 0 {
                return None;
            }
            return self.finish_frame(self.pc);
        }

        #[cfg(target_arch = "aarch64")]
        if !self.used_link_register && self.lr != 0 {
            self.used_link_register = true;
            let address = self.lr;
            if !is_valid_code_address(address) {
                return None;
            }
            if !self.update_state_after_lr() {
                // Fallback: advance FP if the chain looks sane, and always
                // move PC to LR so the next step starts from a real address.
                let mem = VmProbe::new();
                if self.fp != 0 {
                    if let Some(previous) = mem.read_usize(self.fp) {
                        if previous == 0 || previous > self.fp {
                            self.fp = previous;
                        }
                    }
                }
                self.pc = self.lr;
            }
            // The LR frame itself was read from a register, not unwound.
            self.last_method = UnwindMethod::None;
            if self.fp == 0 {
                self.reached_end_of_stack = true;
            }
            return self.finish_frame(address);
        }

        for i in 0..METHOD_CHAIN_LEN {
            let method = self.methods[i];
            if method == UnwindMethod::None {
                break;
            }
            // PC is a return address from here on; look up at PC-1.
            if let Some(address) = self.try_method(method, true) {
                if self.fp == 0 {
                    self.reached_end_of_stack = true;
                }
                return self.finish_frame(address);
            }
        }

        None
    }

    fn finish_frame(&mut self, address: usize) -> Option<usize> {
        if !is_valid_code_address(address) {
            return None;
        }
        Some(cpu::normalize_instruction_pointer(address))
    }
}

impl<'a> StackCursor<'a> {
    /// Unwind a suspended (or signal-captured) thread's machine context.
    pub fn from_machine_context(context: &'a MachineContext, max_depth: usize) -> Self {
        Self {
            address: 0,
            depth: 0,
            has_given_up: false,
            state: CursorState::Unwind(UnwindState::new(context, max_depth)),
        }
    }

    /// Replay a pre-captured backtrace (language exceptions).
    pub fn from_backtrace(addresses: &'a [usize]) -> Self {
        Self {
            address: 0,
            depth: 0,
            has_given_up: false,
            state: CursorState::Backtrace {
                addresses,
                index: 0,
            },
        }
    }

    /// Capture the calling thread's own frames, skipping the innermost
    /// `skip` entries (the reporter's own).
    pub fn from_self_thread(skip: usize) -> Self {
        let mut addresses = [0usize; SELF_THREAD_MAX_FRAMES];
        let mut count = 0usize;
        let mut skipped = 0usize;
        // SAFETY: unsynchronized trace; all other threads are either
        // suspended or this is a cooperative (user-report) capture.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if skipped < skip {
                    skipped += 1;
                    return true;
                }
                if count >= SELF_THREAD_MAX_FRAMES {
                    return false;
                }
                addresses[count] = frame.ip() as usize;
                count += 1;
                true
            });
        }
        Self {
            address: 0,
            depth: 0,
            has_given_up: false,
            state: CursorState::SelfThread {
                addresses,
                count,
                index: 0,
            },
        }
    }

    /// Restart iteration. The unwind variant keeps its method chain.
    pub fn reset(&mut self) {
        self.address = 0;
        self.depth = 0;
        self.has_given_up = false;
        match &mut self.state {
            CursorState::Unwind(state) => state.reset(),
            CursorState::Backtrace { index, .. } => *index = 0,
            CursorState::SelfThread { index, .. } => *index = 0,
        }
    }

    /// Step to the next frame. Returns false when the walk is over.
    pub fn advance(&mut self) -> bool {
        let next = match &mut self.state {
            CursorState::Unwind(state) => {
                let depth = self.depth;
                match state.advance(depth) {
                    Some(address) => Some(address),
                    None => {
                        if depth >= state.max_depth {
                            self.has_given_up = true;
                        }
                        None
                    }
                }
            }
            CursorState::Backtrace { addresses, index } => {
                let address = addresses.get(*index).copied();
                *index += 1;
                address.filter(|&a| is_valid_code_address(a))
            }
            CursorState::SelfThread {
                addresses,
                count,
                index,
            } => {
                let address = addresses[..*count].get(*index).copied();
                *index += 1;
                address.filter(|&a| is_valid_code_address(a))
            }
        };
        match next {
            Some(address) => {
                self.address = address;
                self.depth += 1;
                true
            }
            None => false,
        }
    }

    /// The most recently yielded frame address.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn has_given_up(&self) -> bool {
        self.has_given_up
    }

    /// The method that produced the most recent frame. `None` for frames
    /// that were not unwound (the PC frame, the LR shortcut, replayed
    /// backtraces).
    pub fn unwind_method(&self) -> UnwindMethod {
        match &self.state {
            CursorState::Unwind(state) => state.last_method,
            _ => UnwindMethod::None,
        }
    }
}

/// Length of the full chain, bounded by the give-up point. Used for
/// stack-overflow detection before the real (depth-capped) walk.
pub fn raw_backtrace_length(context: &MachineContext) -> usize {
    let mut cursor = StackCursor::from_machine_context(context, BACKTRACE_GIVE_UP_POINT);
    let mut length = 0;
    while cursor.advance() {
        length += 1;
    }
    length
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtrace_cursor_replays_addresses() {
        let page = page_size::get();
        let addresses = [page + 1, page + 0x100, page + 0x200];
        let mut cursor = StackCursor::from_backtrace(&addresses);
        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.address());
        }
        let expected: Vec<usize> = addresses
            .iter()
            .map(|&a| cpu::normalize_instruction_pointer(a))
            .collect();
        assert_eq!(seen, expected);
        assert_eq!(cursor.depth(), 3);
        assert_eq!(cursor.unwind_method(), UnwindMethod::None);

        cursor.reset();
        assert!(cursor.advance());
        assert_eq!(cursor.depth(), 1);
    }

    #[test]
    fn test_backtrace_cursor_stops_at_null_page() {
        let page = page_size::get();
        let addresses = [page + 1, 0x10, page + 0x200];
        let mut cursor = StackCursor::from_backtrace(&addresses);
        assert!(cursor.advance());
        // The NULL-page entry terminates the walk.
        assert!(!cursor.advance());
    }

    #[test]
    fn test_self_thread_cursor_captures_frames() {
        crate::macho::images::init();
        let mut cursor = StackCursor::from_self_thread(0);
        let mut frames = 0;
        while cursor.advance() {
            assert!(cursor.address() > page_size::get());
            frames += 1;
        }
        assert!(frames >= 1, "expected at least one self frame");
    }
}
