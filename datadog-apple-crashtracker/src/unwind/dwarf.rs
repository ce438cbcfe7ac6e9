// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! DWARF CFI unwinding over `__TEXT,__eh_frame`.
//!
//! The section is scanned sequentially: CIEs are skipped, every FDE's PC
//! range is decoded until one covers the target. The matching CIE's initial
//! instructions and the FDE's instructions are then executed into a CFI row,
//! from which the CFA, return address and caller frame pointer are
//! recovered.
//!
//! Supported: CIE versions 1 and 3; augmentations `z`, `L`, `P`, `R`, `S`
//! (anything else aborts the method); all standard CFA opcodes including
//! `remember_state`/`restore_state` with a bounded stack; a minimal
//! expression interpreter (`DW_OP_breg*`, `DW_OP_deref`,
//! `DW_OP_plus_uconst`, `DW_OP_call_frame_cfa`, literals and +/-).
//! 64-bit DWARF (`length == 0xFFFFFFFF`) declines; Apple toolchains emit
//! only the 32-bit format.

use crate::memory::MemoryReader;
use crate::unwind::StepResult;

// Pointer encoding formats (DW_EH_PE_*).
const DW_EH_PE_ABSPTR: u8 = 0x00;
const DW_EH_PE_ULEB128: u8 = 0x01;
const DW_EH_PE_UDATA2: u8 = 0x02;
const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_UDATA8: u8 = 0x04;
const DW_EH_PE_SLEB128: u8 = 0x09;
const DW_EH_PE_SDATA2: u8 = 0x0A;
const DW_EH_PE_SDATA4: u8 = 0x0B;
const DW_EH_PE_SDATA8: u8 = 0x0C;
const DW_EH_PE_PCREL: u8 = 0x10;
const DW_EH_PE_DATAREL: u8 = 0x30;
const DW_EH_PE_INDIRECT: u8 = 0x80;
const DW_EH_PE_OMIT: u8 = 0xFF;

// CFA instruction opcodes.
const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_RESTORE: u8 = 0xC0;
const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_SET_LOC: u8 = 0x01;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_UNDEFINED: u8 = 0x07;
const DW_CFA_SAME_VALUE: u8 = 0x08;
const DW_CFA_REGISTER: u8 = 0x09;
const DW_CFA_REMEMBER_STATE: u8 = 0x0A;
const DW_CFA_RESTORE_STATE: u8 = 0x0B;
const DW_CFA_DEF_CFA: u8 = 0x0C;
const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0D;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0E;
const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0F;
const DW_CFA_EXPRESSION: u8 = 0x10;
const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;
const DW_CFA_DEF_CFA_SF: u8 = 0x12;
const DW_CFA_DEF_CFA_OFFSET_SF: u8 = 0x13;
const DW_CFA_VAL_OFFSET: u8 = 0x14;
const DW_CFA_VAL_OFFSET_SF: u8 = 0x15;
const DW_CFA_VAL_EXPRESSION: u8 = 0x16;
const DW_CFA_GNU_ARGS_SIZE: u8 = 0x2E;

// Expression opcodes handled by the minimal interpreter.
const DW_OP_DEREF: u8 = 0x06;
const DW_OP_CONST1U: u8 = 0x08;
const DW_OP_CONST1S: u8 = 0x09;
const DW_OP_CONST2U: u8 = 0x0A;
const DW_OP_CONST2S: u8 = 0x0B;
const DW_OP_CONST4U: u8 = 0x0C;
const DW_OP_CONST4S: u8 = 0x0D;
const DW_OP_CONST8U: u8 = 0x0E;
const DW_OP_CONST8S: u8 = 0x0F;
const DW_OP_CONSTU: u8 = 0x10;
const DW_OP_CONSTS: u8 = 0x11;
const DW_OP_MINUS: u8 = 0x1C;
const DW_OP_PLUS: u8 = 0x22;
const DW_OP_PLUS_UCONST: u8 = 0x23;
const DW_OP_LIT0: u8 = 0x30;
const DW_OP_LIT31: u8 = 0x4F;
const DW_OP_BREG0: u8 = 0x70;
const DW_OP_BREG31: u8 = 0x8F;
const DW_OP_CALL_FRAME_CFA: u8 = 0x9C;

/// DWARF register numbers tracked per row. arm64 needs up to 31 (SP);
/// x86_64 up to 16 (RIP).
pub const MAX_REGISTERS: usize = 40;

const MAX_STATE_STACK_DEPTH: usize = 8;
const MAX_EXPR_STACK_DEPTH: usize = 16;
const MAX_AUGMENTATION_LEN: usize = 8;

/// Per-register recovery rule in a CFI row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegisterRule {
    #[default]
    Undefined,
    SameValue,
    /// Saved at `CFA + offset`.
    Offset(i64),
    /// Value is `CFA + offset` itself.
    ValOffset(i64),
    /// Value lives in another register.
    Register(u16),
    /// Saved at the address computed by the expression at `(addr, len)`.
    Expression { addr: usize, len: usize },
    /// Value is the result of the expression at `(addr, len)`.
    ValExpression { addr: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CfaKind {
    #[default]
    Unset,
    RegisterOffset,
    Expression {
        addr: usize,
        len: usize,
    },
}

/// One row of the virtual CFI table: how to recover each register at a
/// given location.
#[derive(Debug, Clone, Copy)]
pub struct CfiRow {
    pub location: usize,
    pub cfa_kind: CfaKind,
    pub cfa_register: u16,
    pub cfa_offset: i64,
    pub registers: [RegisterRule; MAX_REGISTERS],
}

impl Default for CfiRow {
    fn default() -> Self {
        Self {
            location: 0,
            cfa_kind: CfaKind::Unset,
            cfa_register: 0,
            cfa_offset: 0,
            registers: [RegisterRule::Undefined; MAX_REGISTERS],
        }
    }
}

/// The architectures whose DWARF register numbering we can map back to the
/// machine registers the unwinder tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfArch {
    Arm64,
    X86_64,
}

/// The machine registers available as inputs to a DWARF step.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputRegisters {
    pub sp: usize,
    pub fp: usize,
    pub lr: usize,
}

impl DwarfArch {
    pub fn current() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            DwarfArch::Arm64
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            DwarfArch::X86_64
        }
    }

    pub fn return_address_register(self) -> u16 {
        match self {
            DwarfArch::Arm64 => 30,  // LR
            DwarfArch::X86_64 => 16, // RIP
        }
    }

    pub fn frame_pointer_register(self) -> u16 {
        match self {
            DwarfArch::Arm64 => 29, // FP
            DwarfArch::X86_64 => 6, // RBP
        }
    }

    /// Value of a DWARF-numbered register, where known. Only the registers
    /// the unwinder tracks are available.
    pub fn register_value(self, reg: u16, regs: InputRegisters) -> Option<usize> {
        match (self, reg) {
            (DwarfArch::Arm64, 31) => Some(regs.sp),
            (DwarfArch::Arm64, 29) => Some(regs.fp),
            (DwarfArch::Arm64, 30) => Some(regs.lr),
            (DwarfArch::X86_64, 7) => Some(regs.sp),
            (DwarfArch::X86_64, 6) => Some(regs.fp),
            _ => None,
        }
    }
}

// MARK: - Bounded reader over probed memory

struct Reader<'m, M: ?Sized> {
    mem: &'m M,
    pos: usize,
    end: usize,
}

impl<'m, M: MemoryReader + ?Sized> Reader<'m, M> {
    fn new(mem: &'m M, start: usize, len: usize) -> Self {
        Self {
            mem,
            pos: start,
            end: start.saturating_add(len),
        }
    }

    fn has(&self, bytes: usize) -> bool {
        self.pos.checked_add(bytes).is_some_and(|p| p <= self.end)
    }

    fn remaining(&self) -> usize {
        self.end - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        if !self.has(1) {
            return None;
        }
        let mut buf = [0u8; 1];
        if !self.mem.read_bytes(self.pos, &mut buf) {
            return None;
        }
        self.pos += 1;
        Some(buf[0])
    }

    fn u16(&mut self) -> Option<u16> {
        if !self.has(2) {
            return None;
        }
        let mut buf = [0u8; 2];
        if !self.mem.read_bytes(self.pos, &mut buf) {
            return None;
        }
        self.pos += 2;
        Some(u16::from_ne_bytes(buf))
    }

    fn u32(&mut self) -> Option<u32> {
        if !self.has(4) {
            return None;
        }
        let value = self.mem.read_u32(self.pos)?;
        self.pos += 4;
        Some(value)
    }

    fn u64(&mut self) -> Option<u64> {
        if !self.has(8) {
            return None;
        }
        let value = self.mem.read_u64(self.pos)?;
        self.pos += 8;
        Some(value)
    }

    fn uleb128(&mut self) -> Option<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            result |= u64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 || shift >= 64 {
                return Some(result);
            }
        }
    }

    fn sleb128(&mut self) -> Option<i64> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        let mut byte;
        loop {
            byte = self.u8()?;
            result |= i64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 || shift >= 64 {
                break;
            }
        }
        if shift < 64 && byte & 0x40 != 0 {
            result |= -(1i64 << shift);
        }
        Some(result)
    }

    fn skip(&mut self, bytes: usize) -> Option<()> {
        if self.has(bytes) {
            self.pos += bytes;
            Some(())
        } else {
            None
        }
    }

    /// Read a pointer per DW_EH_PE encoding. `pcrel` is relative to the
    /// field's own (live) address; `datarel` to `datarel_base`.
    fn encoded_pointer(&mut self, encoding: u8, datarel_base: usize) -> Option<usize> {
        if encoding == DW_EH_PE_OMIT {
            return Some(0);
        }
        let field_addr = self.pos;
        let value = match encoding & 0x0F {
            DW_EH_PE_ABSPTR => self.u64()? as usize,
            DW_EH_PE_ULEB128 => self.uleb128()? as usize,
            DW_EH_PE_UDATA2 => self.u16()? as usize,
            DW_EH_PE_UDATA4 => self.u32()? as usize,
            DW_EH_PE_UDATA8 => self.u64()? as usize,
            DW_EH_PE_SLEB128 => self.sleb128()? as usize,
            DW_EH_PE_SDATA2 => self.u16()? as i16 as isize as usize,
            DW_EH_PE_SDATA4 => self.u32()? as i32 as isize as usize,
            DW_EH_PE_SDATA8 => self.u64()? as i64 as isize as usize,
            _ => return None,
        };
        let result = match encoding & 0x70 {
            0 => value,
            DW_EH_PE_PCREL => value.wrapping_add(field_addr),
            DW_EH_PE_DATAREL => value.wrapping_add(datarel_base),
            _ => return None,
        };
        if encoding & DW_EH_PE_INDIRECT != 0 {
            self.mem.read_usize(result)
        } else {
            Some(result)
        }
    }
}

// MARK: - CIE / FDE

#[derive(Debug, Clone, Copy)]
struct Cie {
    code_alignment: u64,
    data_alignment: i64,
    return_address_register: u64,
    fde_pointer_encoding: u8,
    lsda_encoding: u8,
    has_augmentation_data: bool,
    initial_instructions: (usize, usize),
}

#[derive(Debug, Clone, Copy)]
struct Fde {
    pc_start: usize,
    pc_range: usize,
    lsda: usize,
    instructions: (usize, usize),
}

fn parse_cie<M: MemoryReader + ?Sized>(mem: &M, addr: usize, len: usize) -> Option<Cie> {
    let mut r = Reader::new(mem, addr, len);

    let version = r.u8()?;
    if version != 1 && version != 3 {
        return None;
    }

    let mut augmentation = [0u8; MAX_AUGMENTATION_LEN];
    let mut aug_len = 0usize;
    loop {
        let byte = r.u8()?;
        if byte == 0 {
            break;
        }
        if aug_len >= MAX_AUGMENTATION_LEN {
            return None;
        }
        augmentation[aug_len] = byte;
        aug_len += 1;
    }
    let augmentation = &augmentation[..aug_len];
    // Anything we can't interpret means we can't find the instructions.
    if !augmentation.is_empty() && augmentation[0] != b'z' {
        return None;
    }

    let code_alignment = r.uleb128()?;
    let data_alignment = r.sleb128()?;
    let return_address_register = if version == 1 {
        u64::from(r.u8()?)
    } else {
        r.uleb128()?
    };

    let mut fde_pointer_encoding = DW_EH_PE_ABSPTR;
    let mut lsda_encoding = DW_EH_PE_OMIT;
    let has_augmentation_data = !augmentation.is_empty();

    if has_augmentation_data {
        let data_len = r.uleb128()? as usize;
        let data_end = r.pos.checked_add(data_len)?;
        if data_end > r.end {
            return None;
        }
        for &aug in &augmentation[1..] {
            match aug {
                b'L' => {
                    if r.pos >= data_end {
                        return None;
                    }
                    lsda_encoding = r.u8()?;
                }
                b'P' => {
                    if r.pos >= data_end {
                        return None;
                    }
                    let personality_encoding = r.u8()?;
                    r.encoded_pointer(personality_encoding, 0)?;
                }
                b'R' => {
                    if r.pos >= data_end {
                        return None;
                    }
                    fde_pointer_encoding = r.u8()?;
                }
                b'S' => {} // signal frame, no payload
                _ => return None,
            }
        }
        r.pos = data_end;
    }

    Some(Cie {
        code_alignment,
        data_alignment,
        return_address_register,
        fde_pointer_encoding,
        lsda_encoding,
        has_augmentation_data,
        initial_instructions: (r.pos, r.remaining()),
    })
}

fn parse_fde<M: MemoryReader + ?Sized>(mem: &M, addr: usize, len: usize, cie: &Cie) -> Option<Fde> {
    let mut r = Reader::new(mem, addr, len);

    let pc_start = r.encoded_pointer(cie.fde_pointer_encoding, 0)?;
    // The range uses the same format as pc_start but no relocation.
    let pc_range = match cie.fde_pointer_encoding & 0x0F {
        DW_EH_PE_ABSPTR => r.u64()? as usize,
        DW_EH_PE_UDATA2 | DW_EH_PE_SDATA2 => r.u16()? as usize,
        DW_EH_PE_UDATA4 | DW_EH_PE_SDATA4 => r.u32()? as usize,
        DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => r.u64()? as usize,
        _ => r.uleb128()? as usize,
    };

    let mut lsda = 0;
    if cie.has_augmentation_data {
        let data_len = r.uleb128()? as usize;
        let data_start = r.pos;
        if cie.lsda_encoding != DW_EH_PE_OMIT {
            lsda = r.encoded_pointer(cie.lsda_encoding, 0)?;
        }
        let data_end = data_start.checked_add(data_len)?;
        if data_end > r.end {
            return None;
        }
        r.pos = data_end;
    }

    Some(Fde {
        pc_start,
        pc_range,
        lsda,
        instructions: (r.pos, r.remaining()),
    })
}

// MARK: - Instruction execution

fn execute_instructions<M: MemoryReader + ?Sized>(
    mem: &M,
    instructions: (usize, usize),
    cie: &Cie,
    pc_start: usize,
    target_pc: usize,
    row: &mut CfiRow,
    initial_state: Option<&CfiRow>,
) -> Option<()> {
    let mut r = Reader::new(mem, instructions.0, instructions.1);
    let mut current_pc = pc_start;

    let mut state_stack = [*row; MAX_STATE_STACK_DEPTH];
    let mut state_depth = 0usize;

    let set_register = |row: &mut CfiRow, reg: u64, rule: RegisterRule| {
        if (reg as usize) < MAX_REGISTERS {
            row.registers[reg as usize] = rule;
        }
    };
    let restore_register = |row: &mut CfiRow, reg: u64| {
        if (reg as usize) < MAX_REGISTERS {
            row.registers[reg as usize] = match initial_state {
                Some(initial) => initial.registers[reg as usize],
                None => RegisterRule::Undefined,
            };
        }
    };

    while r.has(1) {
        if current_pc > target_pc {
            break;
        }
        let opcode = r.u8()?;
        let high = opcode & 0xC0;
        let low = opcode & 0x3F;

        if high == DW_CFA_ADVANCE_LOC {
            current_pc = current_pc.wrapping_add(low as usize * cie.code_alignment as usize);
        } else if high == DW_CFA_OFFSET {
            // The factored offset is unsigned; the data alignment factor
            // (typically negative) signs it.
            let offset = r.uleb128()?;
            set_register(
                row,
                u64::from(low),
                RegisterRule::Offset(offset as i64 * cie.data_alignment),
            );
        } else if high == DW_CFA_RESTORE {
            restore_register(row, u64::from(low));
        } else {
            match opcode {
                DW_CFA_NOP => {}
                DW_CFA_SET_LOC => {
                    current_pc = r.encoded_pointer(cie.fde_pointer_encoding, 0)?;
                }
                DW_CFA_ADVANCE_LOC1 => {
                    current_pc =
                        current_pc.wrapping_add(r.u8()? as usize * cie.code_alignment as usize);
                }
                DW_CFA_ADVANCE_LOC2 => {
                    current_pc =
                        current_pc.wrapping_add(r.u16()? as usize * cie.code_alignment as usize);
                }
                DW_CFA_ADVANCE_LOC4 => {
                    current_pc =
                        current_pc.wrapping_add(r.u32()? as usize * cie.code_alignment as usize);
                }
                DW_CFA_OFFSET_EXTENDED => {
                    let reg = r.uleb128()?;
                    let offset = r.uleb128()?;
                    set_register(
                        row,
                        reg,
                        RegisterRule::Offset(offset as i64 * cie.data_alignment),
                    );
                }
                DW_CFA_RESTORE_EXTENDED => {
                    let reg = r.uleb128()?;
                    restore_register(row, reg);
                }
                DW_CFA_UNDEFINED => {
                    let reg = r.uleb128()?;
                    set_register(row, reg, RegisterRule::Undefined);
                }
                DW_CFA_SAME_VALUE => {
                    let reg = r.uleb128()?;
                    set_register(row, reg, RegisterRule::SameValue);
                }
                DW_CFA_REGISTER => {
                    let reg = r.uleb128()?;
                    let source = r.uleb128()?;
                    set_register(row, reg, RegisterRule::Register(source as u16));
                }
                DW_CFA_REMEMBER_STATE => {
                    if state_depth < MAX_STATE_STACK_DEPTH {
                        state_stack[state_depth] = *row;
                        state_depth += 1;
                    }
                }
                DW_CFA_RESTORE_STATE => {
                    if state_depth > 0 {
                        state_depth -= 1;
                        *row = state_stack[state_depth];
                    }
                }
                DW_CFA_DEF_CFA => {
                    row.cfa_kind = CfaKind::RegisterOffset;
                    row.cfa_register = r.uleb128()? as u16;
                    row.cfa_offset = r.uleb128()? as i64;
                }
                DW_CFA_DEF_CFA_REGISTER => {
                    row.cfa_register = r.uleb128()? as u16;
                }
                DW_CFA_DEF_CFA_OFFSET => {
                    row.cfa_offset = r.uleb128()? as i64;
                }
                DW_CFA_DEF_CFA_EXPRESSION => {
                    let len = r.uleb128()? as usize;
                    row.cfa_kind = CfaKind::Expression { addr: r.pos, len };
                    r.skip(len)?;
                }
                DW_CFA_EXPRESSION => {
                    let reg = r.uleb128()?;
                    let len = r.uleb128()? as usize;
                    set_register(row, reg, RegisterRule::Expression { addr: r.pos, len });
                    r.skip(len)?;
                }
                DW_CFA_OFFSET_EXTENDED_SF => {
                    let reg = r.uleb128()?;
                    let offset = r.sleb128()?;
                    set_register(row, reg, RegisterRule::Offset(offset * cie.data_alignment));
                }
                DW_CFA_DEF_CFA_SF => {
                    row.cfa_kind = CfaKind::RegisterOffset;
                    row.cfa_register = r.uleb128()? as u16;
                    row.cfa_offset = r.sleb128()? * cie.data_alignment;
                }
                DW_CFA_DEF_CFA_OFFSET_SF => {
                    row.cfa_offset = r.sleb128()? * cie.data_alignment;
                }
                DW_CFA_VAL_OFFSET => {
                    let reg = r.uleb128()?;
                    let offset = r.uleb128()?;
                    set_register(
                        row,
                        reg,
                        RegisterRule::ValOffset(offset as i64 * cie.data_alignment),
                    );
                }
                DW_CFA_VAL_OFFSET_SF => {
                    let reg = r.uleb128()?;
                    let offset = r.sleb128()?;
                    set_register(row, reg, RegisterRule::ValOffset(offset * cie.data_alignment));
                }
                DW_CFA_VAL_EXPRESSION => {
                    let reg = r.uleb128()?;
                    let len = r.uleb128()? as usize;
                    set_register(row, reg, RegisterRule::ValExpression { addr: r.pos, len });
                    r.skip(len)?;
                }
                DW_CFA_GNU_ARGS_SIZE => {
                    r.uleb128()?;
                }
                _ => return None,
            }
        }
    }

    row.location = current_pc;
    Some(())
}

// MARK: - Expression evaluation

/// Minimal DWARF expression interpreter. Anything outside the supported
/// opcode set declines so the caller can fall back to the next method.
fn eval_expression<M: MemoryReader + ?Sized>(
    mem: &M,
    addr: usize,
    len: usize,
    cfa: Option<usize>,
    arch: DwarfArch,
    regs: InputRegisters,
) -> Option<usize> {
    let mut r = Reader::new(mem, addr, len);
    let mut stack = [0usize; MAX_EXPR_STACK_DEPTH];
    let mut depth = 0usize;

    let push = |stack: &mut [usize; MAX_EXPR_STACK_DEPTH], depth: &mut usize, v: usize| {
        if *depth >= MAX_EXPR_STACK_DEPTH {
            return false;
        }
        stack[*depth] = v;
        *depth += 1;
        true
    };

    while r.has(1) {
        let op = r.u8()?;
        let ok = match op {
            DW_OP_LIT0..=DW_OP_LIT31 => push(&mut stack, &mut depth, (op - DW_OP_LIT0) as usize),
            DW_OP_BREG0..=DW_OP_BREG31 => {
                let reg = (op - DW_OP_BREG0) as u16;
                let offset = r.sleb128()?;
                let base = arch.register_value(reg, regs)?;
                push(
                    &mut stack,
                    &mut depth,
                    (base as i64).wrapping_add(offset) as usize,
                )
            }
            DW_OP_DEREF => {
                if depth == 0 {
                    return None;
                }
                stack[depth - 1] = mem.read_usize(stack[depth - 1])?;
                true
            }
            DW_OP_CONST1U => {
                let v = r.u8()? as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONST1S => {
                let v = r.u8()? as i8 as isize as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONST2U => {
                let v = r.u16()? as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONST2S => {
                let v = r.u16()? as i16 as isize as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONST4U => {
                let v = r.u32()? as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONST4S => {
                let v = r.u32()? as i32 as isize as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONST8U => {
                let v = r.u64()? as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONST8S => {
                let v = r.u64()? as i64 as isize as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONSTU => {
                let v = r.uleb128()? as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_CONSTS => {
                let v = r.sleb128()? as isize as usize;
                push(&mut stack, &mut depth, v)
            }
            DW_OP_PLUS_UCONST => {
                if depth == 0 {
                    return None;
                }
                let v = r.uleb128()? as usize;
                stack[depth - 1] = stack[depth - 1].wrapping_add(v);
                true
            }
            DW_OP_PLUS => {
                if depth < 2 {
                    return None;
                }
                depth -= 1;
                stack[depth - 1] = stack[depth - 1].wrapping_add(stack[depth]);
                true
            }
            DW_OP_MINUS => {
                if depth < 2 {
                    return None;
                }
                depth -= 1;
                stack[depth - 1] = stack[depth - 1].wrapping_sub(stack[depth]);
                true
            }
            DW_OP_CALL_FRAME_CFA => push(&mut stack, &mut depth, cfa?),
            _ => return None,
        };
        if !ok {
            return None;
        }
    }

    if depth == 0 {
        None
    } else {
        Some(stack[depth - 1])
    }
}

fn apply_register_rule<M: MemoryReader + ?Sized>(
    mem: &M,
    rule: RegisterRule,
    cfa: usize,
    arch: DwarfArch,
    regs: InputRegisters,
) -> Option<usize> {
    match rule {
        RegisterRule::Undefined => None,
        // The original value is unavailable once the frame is gone.
        RegisterRule::SameValue => None,
        RegisterRule::Offset(offset) => {
            let addr = (cfa as i64).wrapping_add(offset) as usize;
            mem.read_usize(addr)
        }
        RegisterRule::ValOffset(offset) => Some((cfa as i64).wrapping_add(offset) as usize),
        RegisterRule::Register(reg) => {
            let value = arch.register_value(reg, regs)?;
            if value == 0 {
                None
            } else {
                Some(value)
            }
        }
        RegisterRule::Expression { addr, len } => {
            let location = eval_expression(mem, addr, len, Some(cfa), arch, regs)?;
            mem.read_usize(location)
        }
        RegisterRule::ValExpression { addr, len } => {
            eval_expression(mem, addr, len, Some(cfa), arch, regs)
        }
    }
}

// MARK: - Section scan

/// Locations of a matched FDE and its CIE within the section. Addresses
/// point at the entry's CIE-id/CIE-pointer field (the word after the
/// length), matching what [`build_cfi_row`] expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdeMatch {
    pub fde_addr: usize,
    pub fde_len: usize,
    pub cie_addr: usize,
    pub cie_len: usize,
}

/// Sequentially scan `__eh_frame` for the FDE covering `target_pc`.
pub fn find_fde<M: MemoryReader + ?Sized>(
    mem: &M,
    section_addr: usize,
    section_size: usize,
    target_pc: usize,
) -> Option<FdeMatch> {
    let section_end = section_addr.checked_add(section_size)?;
    let mut pos = section_addr;

    while pos + 4 < section_end {
        let length = mem.read_u32(pos)?;
        pos += 4;
        if length == 0 {
            break; // terminator
        }
        if length == 0xFFFF_FFFF {
            // 64-bit DWARF format; not emitted by Apple toolchains.
            return None;
        }

        let entry_start = pos;
        let entry_end = pos.checked_add(length as usize)?;
        if entry_end > section_end {
            break;
        }

        let cie_pointer = mem.read_u32(pos)?;
        pos += 4;

        if cie_pointer == 0 {
            // A CIE; FDEs reference it by back-offset.
            pos = entry_end;
            continue;
        }

        // The CIE pointer counts back from its own field to the CIE's
        // length field.
        let Some(cie_length_field) = entry_start.checked_sub(cie_pointer as usize) else {
            pos = entry_end;
            continue;
        };
        if cie_length_field < section_addr {
            pos = entry_end;
            continue;
        }
        let cie_length = mem.read_u32(cie_length_field)?;
        if cie_length == 0xFFFF_FFFF || cie_length < 8 {
            pos = entry_end;
            continue;
        }
        let cie_id_field = cie_length_field + 4;

        let Some(cie) = parse_cie(mem, cie_id_field + 4, cie_length as usize - 4) else {
            pos = entry_end;
            continue;
        };
        let Some(fde) = parse_fde(mem, pos, entry_end - pos, &cie) else {
            pos = entry_end;
            continue;
        };

        if target_pc >= fde.pc_start && target_pc < fde.pc_start.wrapping_add(fde.pc_range) {
            return Some(FdeMatch {
                fde_addr: entry_start,
                fde_len: entry_end - entry_start,
                cie_addr: cie_id_field,
                cie_len: cie_length as usize,
            });
        }

        pos = entry_end;
    }

    None
}

/// A CFI row evaluated at a specific PC, plus the frame metadata the
/// consumer needs alongside it.
#[derive(Debug, Clone, Copy)]
pub struct RowResult {
    pub row: CfiRow,
    pub return_address_register: u16,
    pub lsda: usize,
}

/// Build the CFI row for `target_pc`: run the CIE's initial instructions,
/// snapshot them for `DW_CFA_restore`, then run the FDE's instructions.
pub fn build_cfi_row<M: MemoryReader + ?Sized>(
    mem: &M,
    matched: &FdeMatch,
    target_pc: usize,
) -> Option<RowResult> {
    let cie = parse_cie(mem, matched.cie_addr + 4, matched.cie_len.checked_sub(4)?)?;
    let fde = parse_fde(
        mem,
        matched.fde_addr + 4,
        matched.fde_len.checked_sub(4)?,
        &cie,
    )?;

    let mut row = CfiRow::default();
    execute_instructions(
        mem,
        cie.initial_instructions,
        &cie,
        fde.pc_start,
        target_pc,
        &mut row,
        None,
    )?;
    let initial_state = row;
    execute_instructions(
        mem,
        fde.instructions,
        &cie,
        fde.pc_start,
        target_pc,
        &mut row,
        Some(&initial_state),
    )?;
    Some(RowResult {
        row,
        return_address_register: cie.return_address_register as u16,
        lsda: fde.lsda,
    })
}

/// One DWARF unwind step: locate the FDE for `pc`, evaluate the row, and
/// recover `{return_address, sp, fp}`. The new SP is the CFA.
pub fn unwind<M: MemoryReader + ?Sized>(
    mem: &M,
    section_addr: usize,
    section_size: usize,
    arch: DwarfArch,
    pc: usize,
    regs: InputRegisters,
) -> Option<StepResult> {
    let matched = find_fde(mem, section_addr, section_size, pc)?;
    let result = build_cfi_row(mem, &matched, pc)?;
    let row = result.row;

    let cfa = match row.cfa_kind {
        CfaKind::RegisterOffset => {
            let base = arch.register_value(row.cfa_register, regs)?;
            if base == 0 {
                return None;
            }
            (base as i64).wrapping_add(row.cfa_offset) as usize
        }
        CfaKind::Expression { addr, len } => eval_expression(mem, addr, len, None, arch, regs)?,
        CfaKind::Unset => return None,
    };

    // Prefer the CIE's declared return-address register; fall back to the
    // architectural default when it is out of range.
    let ra_register = if (result.return_address_register as usize) < MAX_REGISTERS {
        result.return_address_register
    } else {
        arch.return_address_register()
    };
    let ra_rule = row.registers[ra_register as usize];
    let return_address = apply_register_rule(mem, ra_rule, cfa, arch, regs)?;

    let fp_rule = row.registers[arch.frame_pointer_register() as usize];
    let frame_pointer = apply_register_rule(mem, fp_rule, cfa, arch, regs).unwrap_or(0);

    Some(StepResult {
        return_address,
        stack_pointer: cfa,
        frame_pointer,
    })
}

#[cfg(test)]
mod tests;
