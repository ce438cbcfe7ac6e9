// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Kernel-backed memory probe.
//!
//! `mach_vm_read_overwrite` copies into a caller-supplied buffer and returns
//! a kern_return_t instead of faulting, which makes it the one safe way to
//! dereference pointers owned by a suspended (or corrupted) thread. It is a
//! straight trap and takes no userland locks, so it is safe in signal
//! handler context.

use super::MemoryReader;
use mach2::kern_return::KERN_SUCCESS;
use mach2::traps::mach_task_self;
use mach2::vm::mach_vm_read_overwrite;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

/// Probe over the current task's address space.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmProbe;

impl VmProbe {
    pub const fn new() -> Self {
        Self
    }
}

impl MemoryReader for VmProbe {
    fn read_bytes(&self, addr: usize, out: &mut [u8]) -> bool {
        if out.is_empty() {
            return true;
        }
        let mut copied: mach_vm_size_t = 0;
        // SAFETY: the destination pointer/length come from a valid slice;
        // the kernel validates the source range and fails instead of
        // faulting.
        let kr = unsafe {
            mach_vm_read_overwrite(
                mach_task_self(),
                addr as mach_vm_address_t,
                out.len() as mach_vm_size_t,
                out.as_mut_ptr() as mach_vm_address_t,
                &mut copied,
            )
        };
        kr == KERN_SUCCESS && copied == out.len() as mach_vm_size_t
    }
}

/// Copy `out.len()` bytes from `addr` in this process, never faulting.
pub fn copy_safely(addr: usize, out: &mut [u8]) -> bool {
    VmProbe.read_bytes(addr, out)
}

/// Read one pointer-sized value, or None if the address is bad.
pub fn read_ptr(addr: usize) -> Option<usize> {
    VmProbe.read_usize(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let addr = &value as *const u64 as usize;
        assert_eq!(VmProbe.read_u64(addr), Some(value));
    }

    #[test]
    fn test_fails_on_null_page() {
        let mut out = [0u8; 8];
        assert!(!copy_safely(0, &mut out));
        assert!(!copy_safely(16, &mut out));
    }

    #[test]
    fn test_fails_on_wild_pointer() {
        // Kernel space on all Darwin targets.
        assert_eq!(read_ptr(0xffff_ffff_ffff_0000), None);
    }

    #[test]
    fn test_reads_across_slices() {
        let buf = vec![0xABu8; 4096 * 4];
        let mut out = vec![0u8; buf.len()];
        assert!(copy_safely(buf.as_ptr() as usize, &mut out));
        assert_eq!(buf, out);
    }
}
