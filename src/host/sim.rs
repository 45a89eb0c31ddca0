//! Simulated in-process host
//!
//! Backs the engine with plain heap memory: code pages are page-aligned heap
//! allocations, the writable "alias" is the identity mapping (heap memory is
//! already writable), and the rendezvous runs the callback inline on the one
//! simulated processor. Useful for harnesses and for exercising the engine
//! outside the kernel.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::arch::JumpBounds;
use crate::error::Result;

use super::{CodePage, Host, WritableMapping};

const PAGE_SIZE: usize = 0x1000;

fn page_layout() -> Layout {
    // page-aligned so region lookup by address masking works
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// host implementation over process heap memory
#[derive(Default)]
pub struct SimHost {
    pages: Mutex<Vec<usize>>,
    modules: Mutex<Vec<(usize, usize)>>,
    rendezvous_calls: AtomicU32,
    protect_flips: AtomicU32,
}

// SAFETY: the raw page addresses are only created/released under the lock
unsafe impl Send for SimHost {}
unsafe impl Sync for SimHost {}

impl SimHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// declare `[base, base + len)` a module image for the IAT probe
    pub fn register_module(&self, base: *const u8, len: usize) {
        self.modules.lock().unwrap().push((base as usize, len));
    }

    /// number of code pages currently allocated
    pub fn live_pages(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    /// number of rendezvous broadcasts issued so far
    pub fn rendezvous_count(&self) -> u32 {
        self.rendezvous_calls.load(Ordering::Relaxed)
    }

    /// number of page-protection flips issued so far
    pub fn protect_flips(&self) -> u32 {
        self.protect_flips.load(Ordering::Relaxed)
    }
}

impl Host for SimHost {
    fn alloc_code_page(&self, _range: &JumpBounds) -> Option<CodePage> {
        // heap pages land near every heap target, so the hint is moot here
        // SAFETY: non-zero, valid layout
        let base = unsafe { alloc_zeroed(page_layout()) };
        if base.is_null() {
            return None;
        }
        self.pages.lock().unwrap().push(base as usize);
        Some(CodePage {
            base,
            handle: base as usize,
        })
    }

    unsafe fn free_code_page(&self, page: &CodePage) {
        let mut pages = self.pages.lock().unwrap();
        if let Some(index) = pages.iter().position(|&p| p == page.base as usize) {
            pages.remove(index);
            // SAFETY: the page was allocated with page_layout in alloc_code_page
            unsafe {
                dealloc(page.base, page_layout());
            }
        }
    }

    unsafe fn protect_code_page(&self, _page: &CodePage, _writable: bool) -> Result<()> {
        // heap memory stays writable; just record the flip
        self.protect_flips.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn remap_writable(&self, address: *const u8, _len: usize) -> Result<WritableMapping> {
        // identity alias: heap targets are already writable
        Ok(WritableMapping {
            ptr: address as *mut u8,
            handle: 0,
        })
    }

    unsafe fn unmap(&self, _mapping: &WritableMapping) {}

    fn broadcast(&self, callback: &(dyn Fn() + Sync)) {
        self.rendezvous_calls.fetch_add(1, Ordering::Relaxed);
        callback();
    }

    fn current_thread_id(&self) -> usize {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        thread_local! {
            static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        ID.with(|id| *id)
    }

    fn current_processor(&self) -> u32 {
        0
    }

    fn processor_count(&self) -> u32 {
        1
    }

    fn module_base(&self, address: *const u8) -> Option<*const u8> {
        let address = address as usize;
        self.modules
            .lock()
            .unwrap()
            .iter()
            .find(|&&(base, len)| address >= base && address < base + len)
            .map(|&(base, _)| base as *const u8)
    }

    fn is_memory_readable(&self, address: *const u8, len: usize) -> bool {
        !address.is_null() && len != 0
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        let pages = self.pages.get_mut().unwrap();
        for &base in pages.iter() {
            // SAFETY: every recorded page came from alloc_code_page
            unsafe {
                dealloc(base as *mut u8, page_layout());
            }
        }
        pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_allocation_is_page_aligned() {
        let host = SimHost::new();
        let page = host.alloc_code_page(&JumpBounds::unconstrained()).unwrap();
        assert_eq!(page.base as usize % PAGE_SIZE, 0);
        assert_eq!(host.live_pages(), 1);
        unsafe { host.free_code_page(&page) };
        assert_eq!(host.live_pages(), 0);
    }

    #[test]
    fn test_module_lookup() {
        let host = SimHost::new();
        let image = [0u8; 64];
        host.register_module(image.as_ptr(), image.len());
        assert_eq!(
            host.module_base(unsafe { image.as_ptr().add(10) }),
            Some(image.as_ptr())
        );
        assert_eq!(host.module_base(0x1000 as *const u8), None);
    }

    #[test]
    fn test_thread_id_nonzero_and_stable() {
        let host = SimHost::new();
        let a = host.current_thread_id();
        let b = host.current_thread_id();
        assert_ne!(a, 0);
        assert_eq!(a, b);
    }
}
