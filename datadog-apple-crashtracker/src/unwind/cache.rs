// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-image unwind-section cache.
//!
//! Locating `__unwind_info` and `__eh_frame` means walking load commands,
//! which is too slow to repeat for every frame. Results are cached in a
//! fixed array guarded by an exclusive-access-via-exchange pattern: a
//! caller atomically swaps the storage pointer for NULL, works on the
//! storage alone, and swaps it back. Signal-handler code can therefore
//! never block on a mutex here. If the cache is busy, the lookup is
//! simply done uncached.

use crate::macho::{self, images};
use crate::memory::probe::VmProbe;
use crate::shared::constants::UNWIND_CACHE_CAPACITY;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{AcqRel, Release};

/// Cached unwind-section locations for one image. Section addresses are
/// live (slid) addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnwindImageInfo {
    pub header: usize,
    pub slide: usize,
    /// `(address, size)` of `__TEXT,__unwind_info`, if present.
    pub unwind_info: Option<(usize, usize)>,
    /// `(address, size)` of `__TEXT,__eh_frame`, if present.
    pub eh_frame: Option<(usize, usize)>,
}

struct CacheStorage {
    entries: [UnwindImageInfo; UNWIND_CACHE_CAPACITY],
    count: usize,
}

struct CacheCell(core::cell::UnsafeCell<CacheStorage>);
// SAFETY: mutation happens only while a caller holds exclusive access via
// the CACHE_PTR exchange protocol.
unsafe impl Sync for CacheCell {}

static CACHE_STORAGE: CacheCell = CacheCell(core::cell::UnsafeCell::new(CacheStorage {
    entries: [UnwindImageInfo {
        header: 0,
        slide: 0,
        unwind_info: None,
        eh_frame: None,
    }; UNWIND_CACHE_CAPACITY],
    count: 0,
}));

// Owner pointer: non-NULL means the cache is free; NULL means some caller
// holds exclusive access.
static CACHE_PTR: AtomicPtr<CacheStorage> = AtomicPtr::new(CACHE_STORAGE.0.get());

fn populate(header: usize) -> Option<UnwindImageInfo> {
    let mem = VmProbe::new();
    let slide = macho::image_slide(&mem, header)?;
    let mut info = UnwindImageInfo {
        header,
        slide,
        unwind_info: None,
        eh_frame: None,
    };
    if let Some(sect) = macho::find_section(&mem, header, macho::SEG_TEXT, macho::SECT_UNWIND_INFO)
    {
        if sect.size > 0 {
            info.unwind_info = Some(((sect.addr as usize).wrapping_add(slide), sect.size as usize));
        }
    }
    if let Some(sect) = macho::find_section(&mem, header, macho::SEG_TEXT, macho::SECT_EH_FRAME) {
        if sect.size > 0 {
            info.eh_frame = Some(((sect.addr as usize).wrapping_add(slide), sect.size as usize));
        }
    }
    if info.unwind_info.is_none() && info.eh_frame.is_none() {
        return None;
    }
    Some(info)
}

/// Unwind info for the image at `header`, from the cache when possible.
/// When another caller holds the cache, falls back to an uncached lookup.
pub fn info_for_image(header: usize) -> Option<UnwindImageInfo> {
    if header == 0 {
        return None;
    }

    let storage = CACHE_PTR.swap(core::ptr::null_mut(), AcqRel);
    if storage.is_null() {
        // Busy: another thread owns the cache. Do the lookup without it.
        return populate(header);
    }

    // SAFETY: the successful exchange grants exclusive access until the
    // pointer is stored back.
    let result = unsafe {
        let cache = &mut *storage;
        let mut hit = None;
        for entry in cache.entries.iter().take(cache.count) {
            if entry.header == header {
                hit = Some(*entry);
                break;
            }
        }
        match hit {
            Some(found) => Some(found),
            None => {
                let populated = populate(header);
                if let Some(info) = populated {
                    if cache.count < UNWIND_CACHE_CAPACITY {
                        cache.entries[cache.count] = info;
                        cache.count += 1;
                    }
                }
                populated
            }
        }
    };
    CACHE_PTR.store(storage, Release);
    result
}

/// Unwind info for the image containing `address`.
pub fn info_for_address(address: usize) -> Option<UnwindImageInfo> {
    let image = images::find_image_for_address(address)?;
    info_for_image(image.header)
}

/// Drop every cached entry. Only used at re-initialization.
pub fn reset() {
    let storage = CACHE_PTR.swap(core::ptr::null_mut(), AcqRel);
    if !storage.is_null() {
        // SAFETY: exclusive access per the exchange pattern.
        unsafe {
            (*storage).count = 0;
        }
        CACHE_PTR.store(storage, Release);
    } else {
        // Busy: force the storage back. The interrupted owner's store will
        // simply reinstate the same pointer.
        // SAFETY: count reset races only with lookups, which tolerate it.
        unsafe {
            (*CACHE_STORAGE.0.get()).count = 0;
        }
        CACHE_PTR.store(CACHE_STORAGE.0.get(), Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_finds_own_image_sections() {
        images::init();
        let here = test_cache_finds_own_image_sections as usize;
        let image = images::find_image_for_address(here).unwrap();

        let info = info_for_image(image.header).expect("test binary has unwind data");
        assert_eq!(info.header, image.header);
        assert_eq!(info.slide, image.slide);
        assert!(info.unwind_info.is_some() || info.eh_frame.is_some());

        // Second lookup must hit the cache and agree.
        let again = info_for_image(image.header).unwrap();
        assert_eq!(info, again);
    }

    #[test]
    fn test_info_for_address_matches_info_for_image() {
        images::init();
        let here = test_info_for_address_matches_info_for_image as usize;
        let via_addr = info_for_address(here).unwrap();
        let image = images::find_image_for_address(here).unwrap();
        let via_image = info_for_image(image.header).unwrap();
        assert_eq!(via_addr, via_image);
    }

    #[test]
    fn test_null_header_rejected() {
        assert_eq!(info_for_image(0), None);
    }

    #[test]
    fn test_reset_clears_entries() {
        images::init();
        let here = test_reset_clears_entries as usize;
        let image = images::find_image_for_address(here).unwrap();
        assert!(info_for_image(image.header).is_some());
        reset();
        // Still resolvable after reset (repopulated lazily).
        assert!(info_for_image(image.header).is_some());
    }
}
