// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compact unwind (`__TEXT,__unwind_info`).
//!
//! Apple encodes per-function unwind behavior in 32 bits. The section is a
//! two-level structure: a first-level index of pages, each page either
//! "regular" (full `{function_offset, encoding}` entries) or "compressed"
//! (24-bit function-offset deltas keyed into a common or page-local
//! encoding table). Lookup is a binary search at each level.
//!
//! The per-architecture decoders turn an encoding plus the current
//! registers into the caller's `{return_address, sp, fp}`. Encodings whose
//! mode is the architecture's DWARF escape decline so the DWARF path can
//! take over.

use crate::memory::MemoryReader;
use crate::unwind::StepResult;

pub const UNWIND_IS_NOT_FUNCTION_START: u32 = 0x8000_0000;
pub const UNWIND_HAS_LSDA: u32 = 0x4000_0000;
pub const UNWIND_PERSONALITY_MASK: u32 = 0x3000_0000;
pub const UNWIND_MODE_MASK: u32 = 0x0F00_0000;

const SECOND_LEVEL_REGULAR: u32 = 2;
const SECOND_LEVEL_COMPRESSED: u32 = 3;

/// Bound on the LSDA linear scan; defends against a corrupt index.
const LSDA_SCAN_LIMIT: u32 = 10_000;

// Section header field offsets.
const HDR_VERSION: usize = 0;
const HDR_COMMON_ENCODINGS_OFFSET: usize = 4;
const HDR_COMMON_ENCODINGS_COUNT: usize = 8;
const HDR_PERSONALITY_OFFSET: usize = 12;
const HDR_PERSONALITY_COUNT: usize = 16;
const HDR_INDEX_OFFSET: usize = 20;
const HDR_INDEX_COUNT: usize = 24;
const HDR_SIZE: usize = 28;

// First-level index entry: {function_offset, second_level_offset, lsda_offset}.
const INDEX_ENTRY_SIZE: usize = 12;

/// A decoded `__unwind_info` entry for one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactUnwindEntry {
    pub function_start: usize,
    pub function_length: usize,
    pub encoding: u32,
    pub personality_function: usize,
    pub lsda: usize,
}

pub fn mode(encoding: u32) -> u32 {
    encoding & UNWIND_MODE_MASK
}

/// Whether `encoding` escapes to DWARF on the architecture this process is
/// built for. Mode values overlap between architectures, so only the
/// current architecture's DWARF mode is checked.
pub fn encoding_requires_dwarf(encoding: u32) -> bool {
    #[cfg(target_arch = "aarch64")]
    {
        mode(encoding) == arm64::MODE_DWARF
    }
    #[cfg(target_arch = "x86_64")]
    {
        mode(encoding) == x86_64::MODE_DWARF
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    {
        let _ = encoding;
        false
    }
}

/// Rightmost entry with `key(entry) <= target` in `[0, count)`, probing via
/// `key`. Returns None when every key exceeds the target.
fn binary_search_rightmost<K: Fn(u32) -> Option<u32>>(count: u32, target: u32, key: K) -> Option<u32> {
    let mut left = 0i64;
    let mut right = count as i64 - 1;
    let mut result = None;
    while left <= right {
        let mid = left + (right - left) / 2;
        let value = key(mid as u32)?;
        if value <= target {
            result = Some(mid as u32);
            left = mid + 1;
        } else {
            right = mid - 1;
        }
    }
    result
}

fn search_regular_page<M: MemoryReader + ?Sized>(
    mem: &M,
    page_addr: usize,
    target_offset: u32,
) -> Option<(u32, u32, u32)> {
    let entry_page_offset = mem.read_u32(page_addr + 4)? & 0xFFFF;
    let entry_count = (mem.read_u32(page_addr + 4)? >> 16) & 0xFFFF;
    if entry_count == 0 {
        return None;
    }
    let entries = page_addr + entry_page_offset as usize;
    let hit = binary_search_rightmost(entry_count, target_offset, |i| {
        mem.read_u32(entries + i as usize * 8)
    })?;
    let function_offset = mem.read_u32(entries + hit as usize * 8)?;
    let encoding = mem.read_u32(entries + hit as usize * 8 + 4)?;
    let next_function_offset = if hit + 1 < entry_count {
        mem.read_u32(entries + (hit + 1) as usize * 8)?
    } else {
        0
    };
    Some((encoding, function_offset, next_function_offset))
}

fn search_compressed_page<M: MemoryReader + ?Sized>(
    mem: &M,
    section_addr: usize,
    page_addr: usize,
    page_base_offset: u32,
    target_offset: u32,
) -> Option<(u32, u32, u32)> {
    let word1 = mem.read_u32(page_addr + 4)?;
    let entry_page_offset = word1 & 0xFFFF;
    let entry_count = (word1 >> 16) & 0xFFFF;
    let word2 = mem.read_u32(page_addr + 8)?;
    let encodings_page_offset = word2 & 0xFFFF;
    let encodings_count = (word2 >> 16) & 0xFFFF;
    if entry_count == 0 {
        return None;
    }

    // Compressed entries hold a 24-bit offset relative to the page base.
    let relative_target = target_offset.checked_sub(page_base_offset)?;
    let entries = page_addr + entry_page_offset as usize;
    let hit = binary_search_rightmost(entry_count, relative_target, |i| {
        mem.read_u32(entries + i as usize * 4).map(|e| e & 0x00FF_FFFF)
    })?;
    let entry = mem.read_u32(entries + hit as usize * 4)?;
    let func_offset = entry & 0x00FF_FFFF;
    let encoding_index = (entry >> 24) & 0xFF;

    let common_count = mem.read_u32(section_addr + HDR_COMMON_ENCODINGS_COUNT)?;
    let encoding = if encoding_index < common_count {
        let common_offset = mem.read_u32(section_addr + HDR_COMMON_ENCODINGS_OFFSET)?;
        mem.read_u32(section_addr + common_offset as usize + encoding_index as usize * 4)?
    } else {
        let local_index = encoding_index - common_count;
        if local_index >= encodings_count {
            return None;
        }
        mem.read_u32(page_addr + encodings_page_offset as usize + local_index as usize * 4)?
    };

    let next_function_offset = if hit + 1 < entry_count {
        let next = mem.read_u32(entries + (hit + 1) as usize * 4)?;
        page_base_offset + (next & 0x00FF_FFFF)
    } else {
        0
    };
    Some((encoding, page_base_offset + func_offset, next_function_offset))
}

fn find_lsda<M: MemoryReader + ?Sized>(
    mem: &M,
    section_addr: usize,
    lsda_index_offset: u32,
    function_offset: u32,
    slide: usize,
) -> usize {
    if lsda_index_offset == 0 {
        return 0;
    }
    let index = section_addr + lsda_index_offset as usize;
    // LSDA tables are small; a bounded linear scan suffices.
    for i in 0..LSDA_SCAN_LIMIT {
        let entry = index + i as usize * 8;
        let Some(func) = mem.read_u32(entry) else {
            return 0;
        };
        let Some(lsda) = mem.read_u32(entry + 4) else {
            return 0;
        };
        if func == 0 && lsda == 0 {
            return 0;
        }
        if func == function_offset {
            return (lsda as usize).wrapping_add(slide);
        }
        if func > function_offset {
            return 0;
        }
    }
    0
}

/// Look up the compact-unwind entry covering `target_pc`.
///
/// `section_addr`/`section_size` locate the live (slid) `__unwind_info`
/// section; `image_base` is the image's header address.
pub fn find_entry<M: MemoryReader + ?Sized>(
    mem: &M,
    section_addr: usize,
    section_size: usize,
    target_pc: usize,
    image_base: usize,
    slide: usize,
) -> Option<CompactUnwindEntry> {
    if section_size < HDR_SIZE {
        return None;
    }
    if mem.read_u32(section_addr + HDR_VERSION)? != 1 {
        return None;
    }

    let target_offset = u32::try_from(target_pc.checked_sub(image_base)?).ok()?;

    let index_offset = mem.read_u32(section_addr + HDR_INDEX_OFFSET)?;
    let index_count = mem.read_u32(section_addr + HDR_INDEX_COUNT)?;
    if index_count == 0 {
        return None;
    }
    let indices = section_addr + index_offset as usize;

    let mut page_index = binary_search_rightmost(index_count, target_offset, |i| {
        mem.read_u32(indices + i as usize * INDEX_ENTRY_SIZE)
    })?;
    // The final index entry is a sentinel marking the end of the covered
    // range; a hit there means the target lives in the last real page.
    if page_index >= index_count - 1 {
        page_index = index_count.checked_sub(2)?;
    }

    let index_entry = indices + page_index as usize * INDEX_ENTRY_SIZE;
    let page_function_offset = mem.read_u32(index_entry)?;
    let second_level_offset = mem.read_u32(index_entry + 4)?;
    let lsda_index_offset = mem.read_u32(index_entry + 8)?;
    if second_level_offset == 0 {
        return None;
    }

    let page_addr = section_addr + second_level_offset as usize;
    let page_kind = mem.read_u32(page_addr)?;
    let (encoding, function_offset, next_function_offset) = match page_kind {
        SECOND_LEVEL_REGULAR => search_regular_page(mem, page_addr, target_offset)?,
        SECOND_LEVEL_COMPRESSED => search_compressed_page(
            mem,
            section_addr,
            page_addr,
            page_function_offset,
            target_offset,
        )?,
        _ => return None,
    };

    let personality_index = (encoding & UNWIND_PERSONALITY_MASK) >> 28;
    let personality_count = mem.read_u32(section_addr + HDR_PERSONALITY_COUNT)?;
    let personality_function = if personality_index > 0 && personality_index <= personality_count {
        let personality_offset = mem.read_u32(section_addr + HDR_PERSONALITY_OFFSET)?;
        let ptr = mem.read_u32(
            section_addr + personality_offset as usize + (personality_index as usize - 1) * 4,
        )?;
        (ptr as usize).wrapping_add(slide)
    } else {
        0
    };

    let lsda = if encoding & UNWIND_HAS_LSDA != 0 {
        find_lsda(mem, section_addr, lsda_index_offset, function_offset, slide)
    } else {
        0
    };

    Some(CompactUnwindEntry {
        function_start: image_base + function_offset as usize,
        function_length: next_function_offset
            .checked_sub(function_offset)
            .unwrap_or(0) as usize,
        encoding,
        personality_function,
        lsda,
    })
}

/// aarch64 encoding decoder.
pub mod arm64 {
    use super::*;

    pub const MODE_FRAMELESS: u32 = 0x0200_0000;
    pub const MODE_DWARF: u32 = 0x0300_0000;
    pub const MODE_FRAME: u32 = 0x0400_0000;

    pub const FRAME_X19_X20_PAIR: u32 = 0x0000_0001;
    pub const FRAME_X21_X22_PAIR: u32 = 0x0000_0002;
    pub const FRAME_X23_X24_PAIR: u32 = 0x0000_0004;
    pub const FRAME_X25_X26_PAIR: u32 = 0x0000_0008;
    pub const FRAME_X27_X28_PAIR: u32 = 0x0000_0010;

    pub const FRAMELESS_STACK_SIZE_MASK: u32 = 0x00FF_F000;

    /// Values of X19..X28 recovered by a frame-mode decode.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SavedRegisters {
        pub mask: u16,
        pub x: [u64; 10],
    }

    /// Decode one arm64 encoding against the current `(sp, fp, lr)`.
    pub fn decode<M: MemoryReader + ?Sized>(
        mem: &M,
        encoding: u32,
        sp: usize,
        fp: usize,
        lr: usize,
        saved: Option<&mut SavedRegisters>,
    ) -> Option<StepResult> {
        match mode(encoding) {
            MODE_FRAME => {
                // [FP] = previous FP, [FP+8] = return address, caller SP = FP+16.
                if fp == 0 {
                    return None;
                }
                let return_address = mem.read_usize(fp.checked_add(8)?)?;
                let prev_fp = mem.read_usize(fp)?;

                if let Some(saved) = saved {
                    decode_saved_pairs(mem, encoding, fp, saved);
                }

                Some(StepResult {
                    return_address,
                    stack_pointer: fp + 16,
                    frame_pointer: prev_fp,
                })
            }
            MODE_FRAMELESS => {
                let stack_size =
                    (((encoding & FRAMELESS_STACK_SIZE_MASK) >> 12) as usize) * 16;
                if stack_size == 0 {
                    // Leaf function: the return address never left LR.
                    return Some(StepResult {
                        return_address: lr,
                        stack_pointer: sp,
                        frame_pointer: fp,
                    });
                }
                let return_address = mem.read_usize(sp.checked_add(stack_size - 8)?)?;
                Some(StepResult {
                    return_address,
                    stack_pointer: sp + stack_size,
                    frame_pointer: fp,
                })
            }
            MODE_DWARF => None,
            0 => Some(StepResult {
                // No unwind info recorded; treat as a leaf.
                return_address: lr,
                stack_pointer: sp,
                frame_pointer: fp,
            }),
            _ => None,
        }
    }

    /// Callee-saved pairs sit below FP as bit-flag-selected 16-byte slots,
    /// X19/X20 closest to the frame record.
    fn decode_saved_pairs<M: MemoryReader + ?Sized>(
        mem: &M,
        encoding: u32,
        fp: usize,
        saved: &mut SavedRegisters,
    ) {
        *saved = SavedRegisters::default();
        let mut slot = fp.wrapping_sub(8);
        let pairs = [
            (FRAME_X19_X20_PAIR, 0),
            (FRAME_X21_X22_PAIR, 2),
            (FRAME_X23_X24_PAIR, 4),
            (FRAME_X25_X26_PAIR, 6),
            (FRAME_X27_X28_PAIR, 8),
        ];
        for (flag, base) in pairs {
            if encoding & flag != 0 {
                let mut pair = [0u8; 16];
                if mem.read_bytes(slot.wrapping_sub(8), &mut pair) {
                    saved.x[base] = u64::from_ne_bytes(pair[..8].try_into().unwrap());
                    saved.x[base + 1] = u64::from_ne_bytes(pair[8..].try_into().unwrap());
                    saved.mask |= 1 << base | 1 << (base + 1);
                }
                slot = slot.wrapping_sub(16);
            }
        }
    }
}

/// x86_64 encoding decoder.
pub mod x86_64 {
    use super::*;

    pub const MODE_RBP_FRAME: u32 = 0x0100_0000;
    pub const MODE_STACK_IMMD: u32 = 0x0200_0000;
    pub const MODE_STACK_IND: u32 = 0x0300_0000;
    pub const MODE_DWARF: u32 = 0x0400_0000;

    pub const FRAMELESS_STACK_SIZE_MASK: u32 = 0x00FF_0000;
    pub const FRAMELESS_STACK_SIZE_SHIFT: u32 = 16;

    /// Decode one x86_64 encoding against the current `(sp, bp)`.
    pub fn decode<M: MemoryReader + ?Sized>(
        mem: &M,
        encoding: u32,
        sp: usize,
        bp: usize,
    ) -> Option<StepResult> {
        match mode(encoding) {
            MODE_RBP_FRAME => {
                // [RBP] = previous RBP, [RBP+8] = return address,
                // caller RSP = RBP+16.
                if bp == 0 {
                    return None;
                }
                let return_address = mem.read_usize(bp.checked_add(8)?)?;
                let prev_bp = mem.read_usize(bp)?;
                Some(StepResult {
                    return_address,
                    stack_pointer: bp + 16,
                    frame_pointer: prev_bp,
                })
            }
            MODE_STACK_IMMD => {
                // The encoded size is the `sub rsp` immediate; the CALL-pushed
                // return address adds another slot on top of it.
                let encoded =
                    (((encoding & FRAMELESS_STACK_SIZE_MASK) >> FRAMELESS_STACK_SIZE_SHIFT)
                        as usize)
                        * 8;
                let total = encoded + 8;
                let return_address = mem.read_usize(sp.checked_add(total - 8)?)?;
                Some(StepResult {
                    return_address,
                    stack_pointer: sp + total,
                    frame_pointer: if encoded == 0 { bp } else { 0 },
                })
            }
            // Indirect stack size requires prologue disassembly; decline.
            MODE_STACK_IND => None,
            MODE_DWARF => None,
            0 => {
                // No unwind info; assume a leaf with the return address at [RSP].
                let return_address = mem.read_usize(sp)?;
                Some(StepResult {
                    return_address,
                    stack_pointer: sp + 8,
                    frame_pointer: bp,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests;
