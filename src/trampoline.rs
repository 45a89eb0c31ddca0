//! Trampoline slots and the region slab allocator
//!
//! Trampolines are fixed-size slots carved out of page-sized regions. Each
//! region starts with a header occupying the first slot; the remaining slots
//! form the allocation pool, threaded onto a per-region free list. Regions
//! form a singly linked global list with a rotating default cursor, are
//! lazily allocated when no reachable region has a free slot, and are
//! released once every slot is free again.

use core::mem;
use core::ptr::{self, NonNull};

use log::{debug, trace};

use crate::arch::{native as arch, JumpBounds};
use crate::error::Result;
use crate::host::{CodePage, Host};

/// regions are exactly one system page
pub(crate) const REGION_SIZE: usize = 0x1000;

// "Rrtd"
const REGION_SIGNATURE: u32 = 0x5272_7464;

/// one entry of the instruction-alignment map: a relocated-prefix offset
/// paired with its original offset in the target
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignEntry {
    /// offset just past the instruction in the original target
    pub target_offset: u8,
    /// offset just past the relocated instruction in `code`
    pub trampoline_offset: u8,
}

/// a trampoline slot
///
/// Live slots hold the relocated target prefix followed by a jump back to
/// the untouched remainder. Free slots sit on their region's free list with
/// `remain` reused as the next link; a free slot has no live target to
/// point back into, so the two states never collide.
#[repr(C)]
pub struct Trampoline {
    /// relocated target prefix plus the jump back to `remain`; kept first
    /// so a caller's function pointer lands on the slot itself
    pub(crate) code: [u8; arch::TRAMPOLINE_CODE_LEN],
    /// valid bytes in `code`
    pub(crate) cb_code: u8,
    /// exact original bytes overwritten at the target
    pub(crate) restore: [u8; arch::TRAMPOLINE_RESTORE_LEN],
    /// valid bytes in `restore`
    pub(crate) cb_restore: u8,
    /// relocated-offset to original-offset map, for translating instruction
    /// pointers observed inside the patch window
    pub(crate) align: [AlignEntry; arch::ALIGN_ENTRIES],
    /// first original instruction after the relocated prefix
    /// (free-list next link while the slot is free)
    pub(crate) remain: *mut u8,
    /// first instruction of the detour function
    pub(crate) detour: *mut u8,
    /// indirection cell consumed by the overwrite jump and the landing pad
    /// of an incoming call
    #[cfg(target_arch = "x86_64")]
    pub(crate) code_in: [u8; 8],
}

impl Trampoline {
    /// entry point callers use to invoke the original function
    pub fn entry(&self) -> *const u8 {
        self.code.as_ptr()
    }

    /// the original bytes the overwrite displaced
    pub fn restore_bytes(&self) -> &[u8] {
        &self.restore[..self.cb_restore as usize]
    }

    /// first original instruction after the relocated prefix
    pub fn remain_ptr(&self) -> *const u8 {
        self.remain
    }

    /// the detour this trampoline redirects to
    pub fn detour_ptr(&self) -> *const u8 {
        self.detour
    }

    /// populated instruction-alignment entries
    pub fn align_map(&self) -> &[AlignEntry] {
        let used = self
            .align
            .iter()
            .position(|e| *e == AlignEntry::default())
            .unwrap_or(self.align.len());
        &self.align[..used]
    }
}

/// region header, stored in the first slot of each page
#[repr(C)]
pub(crate) struct Region {
    signature: u32,
    /// slots handed out and not yet freed
    live_slots: u32,
    /// host token of the backing page
    page_handle: usize,
    /// next region in the global list
    next: *mut Region,
    /// head of this region's free list
    free: *mut Trampoline,
}

const _: () = assert!(mem::size_of::<Region>() <= mem::size_of::<Trampoline>());
const _: () = assert!(REGION_SIZE / mem::size_of::<Trampoline>() >= 2);

/// usable slots per region (the header consumes the first one)
pub(crate) const TRAMPOLINES_PER_REGION: usize = REGION_SIZE / mem::size_of::<Trampoline>() - 1;

fn overlaps(base: usize, len: usize, excluded: (usize, usize)) -> bool {
    base < excluded.1 && base + len > excluded.0
}

/// slab allocator over the global region list
pub(crate) struct TrampolineAllocator {
    regions: *mut Region,
    /// rotating default region tried before walking the list
    cursor: *mut Region,
}

impl TrampolineAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            regions: ptr::null_mut(),
            cursor: ptr::null_mut(),
        }
    }

    fn region_usable(region: *mut Region, bounds: &JumpBounds, excluded: (usize, usize)) -> bool {
        let base = region as usize;
        bounds.contains(base, REGION_SIZE) && !overlaps(base, REGION_SIZE, excluded)
    }

    /// pop the head of a region's free list and hand it out
    unsafe fn pop(&mut self, region: *mut Region) -> NonNull<Trampoline> {
        // SAFETY: region is a live header and its free list is non-empty
        unsafe {
            self.cursor = region;
            let slot = (*region).free;
            (*region).free = (*slot).remain as *mut Trampoline;
            (*region).live_slots += 1;

            // breakpoint bytes until the attach populates the slot
            ptr::write_bytes(slot as *mut u8, 0xcc, mem::size_of::<Trampoline>());
            (*slot).cb_code = 0;
            (*slot).cb_restore = 0;
            (*slot).align = [AlignEntry::default(); arch::ALIGN_ENTRIES];
            (*slot).remain = ptr::null_mut();
            (*slot).detour = ptr::null_mut();

            NonNull::new_unchecked(slot)
        }
    }

    /// allocate a slot reachable from `target`, outside the `excluded`
    /// system region
    pub(crate) unsafe fn alloc<H: Host>(
        &mut self,
        host: &H,
        target: *const u8,
        excluded: (usize, usize),
    ) -> Option<NonNull<Trampoline>> {
        // SAFETY: target points at readable code; regions on the list are live
        unsafe {
            let bounds = arch::find_jmp_bounds(target);

            // the default region first
            let cursor = self.cursor;
            if !cursor.is_null()
                && !(*cursor).free.is_null()
                && Self::region_usable(cursor, &bounds, excluded)
            {
                return Some(self.pop(cursor));
            }

            // then any region with a free slot in range
            let mut region = self.regions;
            while !region.is_null() {
                if !(*region).free.is_null() && Self::region_usable(region, &bounds, excluded) {
                    return Some(self.pop(region));
                }
                region = (*region).next;
            }

            // no usable region: grow
            let page = host.alloc_code_page(&bounds)?;
            let base = page.base as usize;
            if base % REGION_SIZE != 0
                || !bounds.contains(base, REGION_SIZE)
                || overlaps(base, REGION_SIZE, excluded)
            {
                debug!(
                    "region candidate {:p} unreachable from target {:p}",
                    page.base, target
                );
                host.free_code_page(&page);
                return None;
            }

            let region = page.base as *mut Region;
            (*region).signature = REGION_SIGNATURE;
            (*region).live_slots = 0;
            (*region).page_handle = page.handle;
            (*region).next = self.regions;

            // thread every pool slot onto the free list, lowest address first
            let slots = region as *mut Trampoline;
            let mut free: *mut Trampoline = ptr::null_mut();
            for index in (1..=TRAMPOLINES_PER_REGION).rev() {
                let slot = slots.add(index);
                (*slot).remain = free as *mut u8;
                free = slot;
            }
            (*region).free = free;

            self.regions = region;
            trace!(
                "allocated region {:p}..{:p}",
                region,
                (region as *const u8).add(REGION_SIZE)
            );

            Some(self.pop(region))
        }
    }

    /// return a slot to its region's free list
    pub(crate) unsafe fn free(&mut self, slot: *mut Trampoline) {
        let region = (slot as usize & !(REGION_SIZE - 1)) as *mut Region;
        // SAFETY: slots never move, so masking recovers the owning header
        unsafe {
            ptr::write_bytes(slot as *mut u8, 0, mem::size_of::<Trampoline>());
            (*slot).remain = (*region).free as *mut u8;
            (*region).free = slot;
            (*region).live_slots -= 1;
        }
    }

    /// true if `pointer` is a slot address inside one of our regions
    pub(crate) unsafe fn contains(&self, pointer: *const u8) -> bool {
        let address = pointer as usize;
        let mut region = self.regions;
        while !region.is_null() {
            let base = region as usize;
            if address > base && address < base + REGION_SIZE {
                let offset = address - base;
                let slot = offset / mem::size_of::<Trampoline>();
                return offset % mem::size_of::<Trampoline>() == 0
                    && (1..=TRAMPOLINES_PER_REGION).contains(&slot);
            }
            // SAFETY: regions on the list are live headers
            region = unsafe { (*region).next };
        }
        false
    }

    /// release every region whose slots are all free
    pub(crate) unsafe fn free_empty_regions<H: Host>(&mut self, host: &H) {
        let mut link: *mut *mut Region = &mut self.regions;
        // SAFETY: the list is owned by the transaction holder
        unsafe {
            while !(*link).is_null() {
                let region = *link;
                if (*region).signature == REGION_SIGNATURE && (*region).live_slots == 0 {
                    *link = (*region).next;
                    debug!("released empty region {:p}", region);
                    host.free_code_page(&CodePage {
                        base: region as *mut u8,
                        handle: (*region).page_handle,
                    });
                } else {
                    link = &mut (*region).next;
                }
            }
        }
        self.cursor = self.regions;
    }

    /// make every region writable; the first host failure is returned
    pub(crate) unsafe fn set_writable<H: Host>(&self, host: &H) -> Result<()> {
        let mut region = self.regions;
        while !region.is_null() {
            // SAFETY: regions on the list are live
            unsafe {
                host.protect_code_page(
                    &CodePage {
                        base: region as *mut u8,
                        handle: (*region).page_handle,
                    },
                    true,
                )?;
                region = (*region).next;
            }
        }
        Ok(())
    }

    /// make every region executable again; failures are ignored because the
    /// code stays reachable either way
    pub(crate) unsafe fn set_executable<H: Host>(&self, host: &H) {
        let mut region = self.regions;
        while !region.is_null() {
            // SAFETY: regions on the list are live
            unsafe {
                let _ = host.protect_code_page(
                    &CodePage {
                        base: region as *mut u8,
                        handle: (*region).page_handle,
                    },
                    false,
                );
                region = (*region).next;
            }
        }
    }

    /// number of regions currently on the list
    pub(crate) fn region_count(&self) -> usize {
        let mut count = 0;
        let mut region = self.regions;
        while !region.is_null() {
            count += 1;
            // SAFETY: regions on the list are live
            region = unsafe { (*region).next };
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SimHost;

    const NO_EXCLUSION: (usize, usize) = (0, 0);

    #[test]
    fn test_alloc_returns_distinct_slot_aligned_slots() {
        let host = SimHost::new();
        let mut allocator = TrampolineAllocator::new();
        // heap-allocated so the ±2 GiB filter accepts heap region pages
        let target = Box::new([0x90u8; 16]);

        let a = unsafe { allocator.alloc(&host, target.as_ptr(), NO_EXCLUSION) }.unwrap();
        let b = unsafe { allocator.alloc(&host, target.as_ptr(), NO_EXCLUSION) }.unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(allocator.region_count(), 1);

        for slot in [a, b] {
            let offset = slot.as_ptr() as usize & (REGION_SIZE - 1);
            assert_eq!(offset % mem::size_of::<Trampoline>(), 0);
            assert!(unsafe { allocator.contains(slot.as_ptr() as *const u8) });
        }
        assert!(!unsafe { allocator.contains(target.as_ptr()) });

        unsafe {
            allocator.free(a.as_ptr());
            allocator.free(b.as_ptr());
            allocator.free_empty_regions(&host);
        }
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let host = SimHost::new();
        let mut allocator = TrampolineAllocator::new();
        // heap-allocated so the ±2 GiB filter accepts heap region pages
        let target = Box::new([0x90u8; 16]);

        let a = unsafe { allocator.alloc(&host, target.as_ptr(), NO_EXCLUSION) }.unwrap();
        unsafe { allocator.free(a.as_ptr()) };
        let b = unsafe { allocator.alloc(&host, target.as_ptr(), NO_EXCLUSION) }.unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());

        unsafe {
            allocator.free(b.as_ptr());
            allocator.free_empty_regions(&host);
        }
    }

    #[test]
    fn test_free_list_walk_terminates_within_region() {
        let host = SimHost::new();
        let mut allocator = TrampolineAllocator::new();
        // heap-allocated so the ±2 GiB filter accepts heap region pages
        let target = Box::new([0x90u8; 16]);

        let slot = unsafe { allocator.alloc(&host, target.as_ptr(), NO_EXCLUSION) }.unwrap();
        let region = (slot.as_ptr() as usize & !(REGION_SIZE - 1)) as *mut Region;

        let mut visited = 0;
        let mut free = unsafe { (*region).free };
        while !free.is_null() {
            let address = free as usize;
            assert!(address > region as usize);
            assert!(address < region as usize + REGION_SIZE);
            visited += 1;
            assert!(visited <= TRAMPOLINES_PER_REGION);
            free = unsafe { (*free).remain } as *mut Trampoline;
        }
        assert_eq!(visited, TRAMPOLINES_PER_REGION - 1);

        unsafe {
            allocator.free(slot.as_ptr());
            allocator.free_empty_regions(&host);
        }
    }

    #[test]
    fn test_exhausted_region_grows_the_list() {
        let host = SimHost::new();
        let mut allocator = TrampolineAllocator::new();
        // heap-allocated so the ±2 GiB filter accepts heap region pages
        let target = Box::new([0x90u8; 16]);

        let mut slots = Vec::new();
        for _ in 0..TRAMPOLINES_PER_REGION + 1 {
            slots.push(unsafe { allocator.alloc(&host, target.as_ptr(), NO_EXCLUSION) }.unwrap());
        }
        assert_eq!(allocator.region_count(), 2);
        assert_eq!(host.live_pages(), 2);

        for slot in slots {
            unsafe { allocator.free(slot.as_ptr()) };
        }
        unsafe { allocator.free_empty_regions(&host) };
        assert_eq!(allocator.region_count(), 0);
        assert_eq!(host.live_pages(), 0);
    }

    #[test]
    fn test_excluded_range_rejects_candidate_pages() {
        let host = SimHost::new();
        let mut allocator = TrampolineAllocator::new();
        // heap-allocated so the ±2 GiB filter accepts heap region pages
        let target = Box::new([0x90u8; 16]);

        // exclude everything: no page can be accepted
        let everything = (0usize, usize::MAX);
        let slot = unsafe { allocator.alloc(&host, target.as_ptr(), everything) };
        assert!(slot.is_none());
        // the rejected candidate page was handed back
        assert_eq!(host.live_pages(), 0);
    }
}
