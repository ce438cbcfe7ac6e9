// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary-image cache.
//!
//! Snapshot of every loaded image, maintained by dyld's add/remove-image
//! callbacks and read lock-free from exception handlers. dyld serializes its
//! callbacks and holds its own lock while running them, so writers never
//! race each other; readers may run at any time, including from a signal
//! handler, and therefore see entries only through acquire loads after the
//! writer's release publish.
//!
//! Entries are append-mostly: removal marks a slot invalid but never
//! compacts, and image names are interned once and never freed, so a reader
//! that loaded a name pointer before a removal can keep using it.

use crate::macho;
use crate::memory::probe::VmProbe;
use crate::shared::constants::IMAGE_CACHE_CAPACITY;
use crate::shared::fd_log;
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::atomic::Ordering::{Acquire, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

extern "C" {
    fn _dyld_register_func_for_add_image(
        callback: extern "C" fn(header: *const c_void, slide: isize),
    );
    fn _dyld_register_func_for_remove_image(
        callback: extern "C" fn(header: *const c_void, slide: isize),
    );
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const c_void;
    fn _dyld_get_image_name(index: u32) -> *const c_char;
}

struct ImageEntry {
    header: AtomicUsize,
    slide: AtomicUsize,
    name: AtomicPtr<u8>,
    name_len: AtomicUsize,
    valid: AtomicBool,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_ENTRY: ImageEntry = ImageEntry {
    header: AtomicUsize::new(0),
    slide: AtomicUsize::new(0),
    name: AtomicPtr::new(std::ptr::null_mut()),
    name_len: AtomicUsize::new(0),
    valid: AtomicBool::new(false),
};

static IMAGES: [ImageEntry; IMAGE_CACHE_CAPACITY] = [EMPTY_ENTRY; IMAGE_CACHE_CAPACITY];
static IMAGE_COUNT: AtomicUsize = AtomicUsize::new(0);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// A loaded image as seen by the capture path.
#[derive(Debug, Clone, Copy)]
pub struct BinaryImage {
    pub header: usize,
    pub slide: usize,
    pub name: Option<&'static str>,
}

fn intern_image_name(header: *const c_void) -> (*mut u8, usize) {
    // dyld does not hand the name to the callback; search its image list.
    // This runs in dyld-callback context (normal mode), so allocation is
    // allowed here and only here.
    // SAFETY: dyld APIs; indices bounded by _dyld_image_count.
    unsafe {
        let count = _dyld_image_count();
        for i in 0..count {
            if _dyld_get_image_header(i) == header {
                let name = _dyld_get_image_name(i);
                if name.is_null() {
                    return (std::ptr::null_mut(), 0);
                }
                let bytes = CStr::from_ptr(name).to_bytes();
                let interned: &'static mut [u8] = Box::leak(bytes.to_vec().into_boxed_slice());
                return (interned.as_mut_ptr(), interned.len());
            }
        }
    }
    (std::ptr::null_mut(), 0)
}

extern "C" fn add_image_callback(header: *const c_void, slide: isize) {
    let header_addr = header as usize;
    let count = IMAGE_COUNT.load(Acquire);

    // Re-validate a previously removed copy of the same image.
    for entry in IMAGES.iter().take(count) {
        if entry.header.load(Acquire) == header_addr {
            entry.slide.store(slide as usize, Release);
            entry.valid.store(true, Release);
            return;
        }
    }

    if count >= IMAGE_CACHE_CAPACITY {
        fd_log::error("binary image cache full, not caching image");
        return;
    }

    let (name_ptr, name_len) = intern_image_name(header);
    let entry = &IMAGES[count];
    entry.header.store(header_addr, Release);
    entry.slide.store(slide as usize, Release);
    entry.name.store(name_ptr, Release);
    entry.name_len.store(name_len, Release);
    entry.valid.store(true, Release);
    // Publish the slot only after its fields are visible.
    IMAGE_COUNT.store(count + 1, Release);
}

extern "C" fn remove_image_callback(header: *const c_void, _slide: isize) {
    let header_addr = header as usize;
    let count = IMAGE_COUNT.load(Acquire);
    for entry in IMAGES.iter().take(count) {
        if entry.header.load(Acquire) == header_addr {
            entry.valid.store(false, Release);
            return;
        }
    }
}

/// Register the dyld callbacks. dyld immediately replays every already
/// loaded image into the add callback, so the cache is complete on return.
/// Idempotent.
pub fn init() {
    if INITIALIZED
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_err()
    {
        return;
    }
    // SAFETY: registering process-lifetime callbacks with dyld.
    unsafe {
        _dyld_register_func_for_add_image(add_image_callback);
        _dyld_register_func_for_remove_image(remove_image_callback);
    }
}

pub fn image_count() -> usize {
    IMAGE_COUNT.load(Acquire)
}

/// Fetch the image in slot `index`, if the slot is currently valid.
pub fn image_at(index: usize) -> Option<BinaryImage> {
    if index >= IMAGE_COUNT.load(Acquire) {
        return None;
    }
    let entry = &IMAGES[index];
    if !entry.valid.load(Acquire) {
        return None;
    }
    let name_ptr = entry.name.load(Acquire);
    let name = if name_ptr.is_null() {
        None
    } else {
        let len = entry.name_len.load(Acquire);
        // SAFETY: interned names are immutable and never freed.
        std::str::from_utf8(unsafe { std::slice::from_raw_parts(name_ptr, len) }).ok()
    };
    Some(BinaryImage {
        header: entry.header.load(Acquire),
        slide: entry.slide.load(Acquire),
        name,
    })
}

/// Scan for the image whose segments contain `address`. Lock-free; safe on
/// the capture path.
pub fn find_image_for_address(address: usize) -> Option<BinaryImage> {
    let mem = VmProbe::new();
    let count = IMAGE_COUNT.load(Acquire);
    for index in 0..count {
        let Some(image) = image_at(index) else {
            continue;
        };
        if macho::contains_address(&mem, image.header, image.slide, address) {
            return Some(image);
        }
    }
    None
}

/// Find the nearest symbol for an address, writing its name into `name_out`.
/// Returns the containing image and the symbol match.
pub fn symbolicate(
    address: usize,
    name_out: &mut [u8],
) -> Option<(BinaryImage, Option<macho::SymbolMatch>)> {
    let image = find_image_for_address(address)?;
    let mem = VmProbe::new();
    let symbol = macho::find_symbol(&mem, image.header, image.slide, address, name_out);
    Some((image, symbol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_sees_own_image() {
        init();
        assert!(image_count() > 0);

        let here = test_cache_sees_own_image as usize;
        let image = find_image_for_address(here).expect("own code must be in a cached image");
        assert_ne!(image.header, 0);
        assert!(image.name.is_some());
    }

    #[test]
    fn test_symbolicate_own_function() {
        init();
        let mut name = [0u8; 256];
        let here = test_symbolicate_own_function as usize;
        let (image, symbol) = symbolicate(here, &mut name).expect("symbolication");
        assert_ne!(image.header, 0);
        let symbol = symbol.expect("test binaries carry symbols");
        assert!(symbol.symbol_address <= here);
    }

    #[test]
    fn test_find_image_rejects_wild_address() {
        init();
        assert!(find_image_for_address(0x10).is_none());
    }
}
