// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CFI tests over hand-assembled `__eh_frame` byte streams.

use super::*;
use crate::memory::SliceMemory;

const SECTION_ADDR: usize = 0x2_0000_0000;
const FUNC_START: u64 = 0x5000_0000;

fn uleb(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn sleb(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        let sign = byte & 0x40 != 0;
        if (v == 0 && !sign) || (v == -1 && sign) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

struct EhFrameBuilder {
    bytes: Vec<u8>,
}

impl EhFrameBuilder {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Append a CIE; returns the offset of its length field.
    fn cie(&mut self, augmentation: &[u8], ra_register: u8, initial: &[u8]) -> usize {
        let offset = self.bytes.len();
        let mut content = Vec::new();
        content.extend_from_slice(&0u32.to_le_bytes()); // CIE id
        content.push(1); // version
        content.extend_from_slice(augmentation);
        content.push(0);
        uleb(&mut content, 1); // code alignment
        sleb(&mut content, -8); // data alignment
        content.push(ra_register);
        if augmentation.first() == Some(&b'z') {
            let mut aug_data = Vec::new();
            for &a in &augmentation[1..] {
                if a == b'R' {
                    aug_data.push(DW_EH_PE_ABSPTR);
                }
            }
            uleb(&mut content, aug_data.len() as u64);
            content.extend_from_slice(&aug_data);
        }
        content.extend_from_slice(initial);
        self.bytes
            .extend_from_slice(&(content.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&content);
        offset
    }

    /// Append an FDE bound to the CIE at `cie_offset`; returns the offset of
    /// its length field.
    fn fde(&mut self, cie_offset: usize, pc_start: u64, pc_range: u64, instructions: &[u8]) -> usize {
        let offset = self.bytes.len();
        let entry_start = offset + 4;
        let cie_pointer = (entry_start - cie_offset) as u32;
        let mut content = Vec::new();
        content.extend_from_slice(&cie_pointer.to_le_bytes());
        content.extend_from_slice(&pc_start.to_le_bytes());
        content.extend_from_slice(&pc_range.to_le_bytes());
        uleb(&mut content, 0); // augmentation data length
        content.extend_from_slice(instructions);
        self.bytes
            .extend_from_slice(&(content.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&content);
        offset
    }

    fn terminator(&mut self) {
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
    }
}

/// The standard x86_64 CIE prologue: CFA = rsp+8, RA saved at CFA-8.
fn x86_64_initial_instructions() -> Vec<u8> {
    let mut init = Vec::new();
    init.push(DW_CFA_DEF_CFA);
    uleb(&mut init, 7); // rsp
    uleb(&mut init, 8);
    init.push(DW_CFA_OFFSET | 16); // rip
    uleb(&mut init, 1); // factored: 1 * -8
    init
}

/// FDE body for a classic `push rbp; mov rbp, rsp` prologue.
fn x86_64_frame_instructions() -> Vec<u8> {
    let mut instrs = Vec::new();
    instrs.push(DW_CFA_ADVANCE_LOC | 1);
    instrs.push(DW_CFA_DEF_CFA_OFFSET);
    uleb(&mut instrs, 16);
    instrs.push(DW_CFA_OFFSET | 6); // rbp at cfa-16
    uleb(&mut instrs, 2);
    instrs.push(DW_CFA_ADVANCE_LOC | 3);
    instrs.push(DW_CFA_DEF_CFA_REGISTER);
    uleb(&mut instrs, 6); // rbp
    instrs
}

fn build_standard_section() -> Vec<u8> {
    let mut b = EhFrameBuilder::new();
    let cie = b.cie(b"zR", 16, &x86_64_initial_instructions());
    b.fde(cie, FUNC_START, 0x100, &x86_64_frame_instructions());
    b.fde(cie, FUNC_START + 0x200, 0x80, &[]);
    b.terminator();
    b.bytes
}

/// Combine the section with a fake stack so `unwind` can read saved values.
struct TestSpace {
    bytes: Vec<u8>,
    base: usize,
}

impl TestSpace {
    fn new(section: &[u8]) -> Self {
        // Lay out: [section][stack area 0x200]
        let mut bytes = section.to_vec();
        bytes.resize(section.len() + 0x200, 0);
        Self {
            bytes,
            base: SECTION_ADDR,
        }
    }

    fn stack_addr(&self, offset: usize) -> usize {
        self.base + self.bytes.len() - 0x200 + offset
    }

    fn put_usize(&mut self, addr: usize, value: usize) {
        let off = addr - self.base;
        self.bytes[off..off + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn mem(&self) -> SliceMemory<'_> {
        SliceMemory::new(self.base, &self.bytes)
    }
}

#[test]
fn test_find_fde_locates_covering_entry() {
    let section = build_standard_section();
    let mem = SliceMemory::new(SECTION_ADDR, &section);

    let hit = find_fde(&mem, SECTION_ADDR, section.len(), FUNC_START as usize + 0x40).unwrap();
    assert!(hit.fde_addr > SECTION_ADDR);

    let second = find_fde(&mem, SECTION_ADDR, section.len(), FUNC_START as usize + 0x240).unwrap();
    assert_ne!(hit.fde_addr, second.fde_addr);
    assert_eq!(hit.cie_addr, second.cie_addr);

    // Outside every range.
    assert!(find_fde(&mem, SECTION_ADDR, section.len(), FUNC_START as usize + 0x180).is_none());
    assert!(find_fde(&mem, SECTION_ADDR, section.len(), 0x1234).is_none());
}

#[test]
fn test_row_at_function_entry_uses_cie_state() {
    let section = build_standard_section();
    let mem = SliceMemory::new(SECTION_ADDR, &section);
    let hit = find_fde(&mem, SECTION_ADDR, section.len(), FUNC_START as usize).unwrap();
    let result = build_cfi_row(&mem, &hit, FUNC_START as usize).unwrap();
    assert_eq!(result.return_address_register, 16);
    assert_eq!(result.row.cfa_kind, CfaKind::RegisterOffset);
    assert_eq!(result.row.cfa_register, 7);
    assert_eq!(result.row.cfa_offset, 8);
    assert_eq!(result.row.registers[16], RegisterRule::Offset(-8));
    assert_eq!(result.row.registers[6], RegisterRule::Undefined);
}

#[test]
fn test_row_after_prologue_tracks_rbp_frame() {
    let section = build_standard_section();
    let mem = SliceMemory::new(SECTION_ADDR, &section);
    let pc = FUNC_START as usize + 0x40;
    let hit = find_fde(&mem, SECTION_ADDR, section.len(), pc).unwrap();
    let result = build_cfi_row(&mem, &hit, pc).unwrap();
    assert_eq!(result.row.cfa_register, 6);
    assert_eq!(result.row.cfa_offset, 16);
    assert_eq!(result.row.registers[6], RegisterRule::Offset(-16));
}

#[test]
fn test_unwind_recovers_frame() {
    let section = build_standard_section();
    let mut space = TestSpace::new(&section);

    // Simulated frame: rbp points into the stack area; CFA = rbp + 16.
    let rbp = space.stack_addr(0x40);
    let cfa = rbp + 16;
    space.put_usize(cfa - 8, 0x52E7);
    space.put_usize(cfa - 16, rbp + 0x60);

    let mem = space.mem();
    let step = unwind(
        &mem,
        SECTION_ADDR,
        section.len(),
        DwarfArch::X86_64,
        FUNC_START as usize + 0x40,
        InputRegisters {
            sp: space.stack_addr(0x20),
            fp: rbp,
            lr: 0,
        },
    )
    .unwrap();
    assert_eq!(step.stack_pointer, cfa);
    assert_eq!(step.return_address, 0x52E7);
    assert_eq!(step.frame_pointer, rbp + 0x60);
}

#[test]
fn test_unwind_at_entry_reads_return_from_stack_top() {
    let section = build_standard_section();
    let mut space = TestSpace::new(&section);

    let rsp = space.stack_addr(0x40);
    space.put_usize(rsp, 0xBEEF);

    let mem = space.mem();
    let step = unwind(
        &mem,
        SECTION_ADDR,
        section.len(),
        DwarfArch::X86_64,
        FUNC_START as usize,
        InputRegisters {
            sp: rsp,
            fp: 0x1111,
            lr: 0,
        },
    )
    .unwrap();
    // CFA = rsp + 8; RA at CFA - 8 == [rsp].
    assert_eq!(step.stack_pointer, rsp + 8);
    assert_eq!(step.return_address, 0xBEEF);
}

#[test]
fn test_remember_restore_state() {
    let mut instrs = Vec::new();
    instrs.push(DW_CFA_REMEMBER_STATE);
    instrs.push(DW_CFA_ADVANCE_LOC | 1);
    instrs.push(DW_CFA_DEF_CFA_OFFSET);
    uleb(&mut instrs, 0x60);
    instrs.push(DW_CFA_ADVANCE_LOC | 1);
    instrs.push(DW_CFA_RESTORE_STATE);

    let mut b = EhFrameBuilder::new();
    let cie = b.cie(b"zR", 16, &x86_64_initial_instructions());
    b.fde(cie, FUNC_START, 0x100, &instrs);
    b.terminator();
    let mem = SliceMemory::new(SECTION_ADDR, &b.bytes);

    // Past both advances: the restore must bring back offset 8.
    let pc = FUNC_START as usize + 0x10;
    let hit = find_fde(&mem, SECTION_ADDR, b.bytes.len(), pc).unwrap();
    let result = build_cfi_row(&mem, &hit, pc).unwrap();
    assert_eq!(result.row.cfa_offset, 8);

    // Between the advances the modified offset is live.
    let pc = FUNC_START as usize + 1;
    let hit = find_fde(&mem, SECTION_ADDR, b.bytes.len(), pc).unwrap();
    let result = build_cfi_row(&mem, &hit, pc).unwrap();
    assert_eq!(result.row.cfa_offset, 0x60);
}

#[test]
fn test_dw_cfa_restore_recovers_cie_rule() {
    let mut instrs = Vec::new();
    instrs.push(DW_CFA_ADVANCE_LOC | 1);
    instrs.push(DW_CFA_OFFSET | 16);
    uleb(&mut instrs, 4); // rip moved to cfa-32
    instrs.push(DW_CFA_ADVANCE_LOC | 1);
    instrs.push(DW_CFA_RESTORE | 16); // back to the CIE's cfa-8

    let mut b = EhFrameBuilder::new();
    let cie = b.cie(b"zR", 16, &x86_64_initial_instructions());
    b.fde(cie, FUNC_START, 0x100, &instrs);
    b.terminator();
    let mem = SliceMemory::new(SECTION_ADDR, &b.bytes);

    let pc = FUNC_START as usize + 1;
    let hit = find_fde(&mem, SECTION_ADDR, b.bytes.len(), pc).unwrap();
    assert_eq!(
        build_cfi_row(&mem, &hit, pc).unwrap().row.registers[16],
        RegisterRule::Offset(-32)
    );

    let pc = FUNC_START as usize + 0x10;
    let hit = find_fde(&mem, SECTION_ADDR, b.bytes.len(), pc).unwrap();
    assert_eq!(
        build_cfi_row(&mem, &hit, pc).unwrap().row.registers[16],
        RegisterRule::Offset(-8)
    );
}

#[test]
fn test_64bit_dwarf_declines() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 32]);
    let mem = SliceMemory::new(SECTION_ADDR, &bytes);
    assert!(find_fde(&mem, SECTION_ADDR, bytes.len(), FUNC_START as usize).is_none());
}

#[test]
fn test_unknown_augmentation_aborts_entry() {
    let mut b = EhFrameBuilder::new();
    let cie = b.cie(b"zRQ", 16, &x86_64_initial_instructions());
    b.fde(cie, FUNC_START, 0x100, &[]);
    b.terminator();
    let mem = SliceMemory::new(SECTION_ADDR, &b.bytes);
    assert!(find_fde(&mem, SECTION_ADDR, b.bytes.len(), FUNC_START as usize + 0x10).is_none());
}

#[test]
fn test_cfa_expression_is_evaluated() {
    // CFA via expression: breg7(rsp) + 8.
    let mut expr = Vec::new();
    expr.push(DW_OP_BREG0 + 7);
    sleb(&mut expr, 8);

    let mut instrs = Vec::new();
    instrs.push(DW_CFA_DEF_CFA_EXPRESSION);
    uleb(&mut instrs, expr.len() as u64);
    instrs.extend_from_slice(&expr);

    let mut b = EhFrameBuilder::new();
    let cie = b.cie(b"zR", 16, &x86_64_initial_instructions());
    b.fde(cie, FUNC_START, 0x100, &instrs);
    b.terminator();

    let mut space = TestSpace::new(&b.bytes);
    let rsp = space.stack_addr(0x80);
    space.put_usize(rsp, 0xFACE); // RA at cfa-8 == [rsp]
    let mem = space.mem();

    let step = unwind(
        &mem,
        SECTION_ADDR,
        b.bytes.len(),
        DwarfArch::X86_64,
        FUNC_START as usize + 2,
        InputRegisters {
            sp: rsp,
            fp: 0,
            lr: 0,
        },
    )
    .unwrap();
    assert_eq!(step.stack_pointer, rsp + 8);
    assert_eq!(step.return_address, 0xFACE);
}

#[test]
fn test_register_expression_rule() {
    // RA rule: saved at [call_frame_cfa - 8].
    let mut expr = Vec::new();
    expr.push(DW_OP_CALL_FRAME_CFA);
    expr.push(DW_OP_CONST1U);
    expr.push(8);
    expr.push(DW_OP_MINUS);

    let mut instrs = Vec::new();
    instrs.push(DW_CFA_EXPRESSION);
    uleb(&mut instrs, 16); // rip
    uleb(&mut instrs, expr.len() as u64);
    instrs.extend_from_slice(&expr);

    let mut b = EhFrameBuilder::new();
    let cie = b.cie(b"zR", 16, &x86_64_initial_instructions());
    b.fde(cie, FUNC_START, 0x100, &instrs);
    b.terminator();

    let mut space = TestSpace::new(&b.bytes);
    let rsp = space.stack_addr(0x80);
    space.put_usize(rsp, 0xAF00D);
    let mem = space.mem();

    let step = unwind(
        &mem,
        SECTION_ADDR,
        b.bytes.len(),
        DwarfArch::X86_64,
        FUNC_START as usize + 2,
        InputRegisters {
            sp: rsp,
            fp: 0,
            lr: 0,
        },
    )
    .unwrap();
    assert_eq!(step.return_address, 0xAF00D);
}

#[test]
fn test_unsupported_expression_opcode_declines() {
    // DW_OP_drop (0x13) is outside the supported set.
    let mut instrs = Vec::new();
    instrs.push(DW_CFA_DEF_CFA_EXPRESSION);
    uleb(&mut instrs, 1);
    instrs.push(0x13);

    let mut b = EhFrameBuilder::new();
    let cie = b.cie(b"zR", 16, &x86_64_initial_instructions());
    b.fde(cie, FUNC_START, 0x100, &instrs);
    b.terminator();
    let mem = SliceMemory::new(SECTION_ADDR, &b.bytes);

    assert!(unwind(
        &mem,
        SECTION_ADDR,
        b.bytes.len(),
        DwarfArch::X86_64,
        FUNC_START as usize + 2,
        InputRegisters::default(),
    )
    .is_none());
}

#[test]
fn test_arm64_frame_rules() {
    // arm64 frame: CFA = fp+16, LR at cfa-8, FP at cfa-16.
    let mut instrs = Vec::new();
    instrs.push(DW_CFA_DEF_CFA);
    uleb(&mut instrs, 29);
    uleb(&mut instrs, 16);
    instrs.push(DW_CFA_OFFSET | 30);
    uleb(&mut instrs, 1);
    instrs.push(DW_CFA_OFFSET | 29);
    uleb(&mut instrs, 2);

    let mut b = EhFrameBuilder::new();
    let cie = b.cie(b"zR", 30, &[]);
    b.fde(cie, FUNC_START, 0x100, &instrs);
    b.terminator();

    let mut space = TestSpace::new(&b.bytes);
    let fp = space.stack_addr(0x40);
    let cfa = fp + 16;
    space.put_usize(cfa - 8, 0xCAFE);
    space.put_usize(cfa - 16, fp + 0x50);
    let mem = space.mem();

    let step = unwind(
        &mem,
        SECTION_ADDR,
        b.bytes.len(),
        DwarfArch::Arm64,
        FUNC_START as usize + 8,
        InputRegisters {
            sp: space.stack_addr(0x20),
            fp,
            lr: 0x9999,
        },
    )
    .unwrap();
    assert_eq!(step.stack_pointer, cfa);
    assert_eq!(step.return_address, 0xCAFE);
    assert_eq!(step.frame_pointer, fp + 0x50);
}

#[test]
fn test_eval_expression_minimal_ops() {
    let mut expr = Vec::new();
    expr.push(DW_OP_LIT0 + 5);
    expr.push(DW_OP_CONSTU);
    uleb(&mut expr, 7);
    expr.push(DW_OP_PLUS);

    let mem = SliceMemory::new(0x9000, &expr);
    assert_eq!(
        eval_expression(
            &mem,
            0x9000,
            expr.len(),
            None,
            DwarfArch::X86_64,
            InputRegisters::default()
        ),
        Some(12)
    );

    // deref through probed memory
    let target: usize = 0x1234_5678;
    let mut bytes = target.to_ne_bytes().to_vec();
    let value_addr = 0x9000usize;
    let mut expr = Vec::new();
    expr.push(DW_OP_CONSTU);
    uleb(&mut expr, value_addr as u64);
    expr.push(DW_OP_DEREF);
    let expr_addr = value_addr + bytes.len();
    bytes.extend_from_slice(&expr);
    let mem = SliceMemory::new(value_addr, &bytes);
    assert_eq!(
        eval_expression(
            &mem,
            expr_addr,
            expr.len(),
            None,
            DwarfArch::X86_64,
            InputRegisters::default()
        ),
        Some(target)
    );
}
