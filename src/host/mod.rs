//! Host primitives behind the detour engine
//!
//! Everything the engine needs from the operating system goes through the
//! [`Host`] trait: code-page allocation for trampoline regions, writable
//! aliasing of target bytes, page-protection flips, the inter-processor
//! rendezvous, and a few identity queries. The kernel backend implements it
//! over MDL and IPI services; the simulated backend implements it over plain
//! heap memory for in-process harnesses and tests.

#[cfg(all(feature = "kernel", windows))]
pub mod kernel;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(all(feature = "kernel", windows))]
pub use kernel::KernelHost;

#[cfg(any(test, feature = "sim"))]
pub use sim::SimHost;

use crate::arch::JumpBounds;
use crate::error::Result;

/// a page-aligned, page-sized, non-cached writable code page
///
/// `handle` is an opaque host token (the MDL for the kernel backend) that
/// travels with the page until it is released.
#[derive(Debug, Clone, Copy)]
pub struct CodePage {
    pub base: *mut u8,
    pub handle: usize,
}

/// a writable virtual alias of a target byte range
///
/// the original mapping keeps its protection; only the alias is writable.
#[derive(Debug, Clone, Copy)]
pub struct WritableMapping {
    pub ptr: *mut u8,
    pub handle: usize,
}

/// operating-system services required by the engine
///
/// Contract notes:
/// - `current_thread_id` must never return 0; the engine reserves 0 for
///   "no transaction owner".
/// - `broadcast` must run the callback on every processor concurrently and
///   return only after all of them finished. A single-processor host may
///   simply invoke the callback once.
pub trait Host: Sync {
    /// allocate one page of physically contiguous, non-cached, writable
    /// memory suitable for code
    ///
    /// `range` is a placement hint; a host that cannot honor it may return
    /// any page, and the caller re-validates reachability.
    fn alloc_code_page(&self, range: &JumpBounds) -> Option<CodePage>;

    /// release a page obtained from `alloc_code_page`
    ///
    /// # Safety
    /// no live trampoline may remain inside the page
    unsafe fn free_code_page(&self, page: &CodePage);

    /// flip a code page between execute+read+write and execute+read
    ///
    /// # Safety
    /// `page` must be a live page obtained from `alloc_code_page`
    unsafe fn protect_code_page(&self, page: &CodePage, writable: bool) -> Result<()>;

    /// map `[address, address + len)` to a second, writable virtual alias,
    /// leaving the original mapping untouched
    ///
    /// # Safety
    /// the range must be valid mapped memory
    unsafe fn remap_writable(&self, address: *const u8, len: usize) -> Result<WritableMapping>;

    /// release an alias obtained from `remap_writable`
    ///
    /// # Safety
    /// `mapping` must not be used after this call
    unsafe fn unmap(&self, mapping: &WritableMapping);

    /// run `callback` on every processor and return after all have finished
    fn broadcast(&self, callback: &(dyn Fn() + Sync));

    /// identity of the calling thread; never 0
    fn current_thread_id(&self) -> usize;

    /// index of the executing processor
    fn current_processor(&self) -> u32;

    /// number of active processors
    fn processor_count(&self) -> u32;

    /// base address of the module image containing `address`, if any
    fn module_base(&self, address: *const u8) -> Option<*const u8>;

    /// true if `[address, address + len)` can be read without faulting
    fn is_memory_readable(&self, address: *const u8, len: usize) -> bool;

    /// invalidate the instruction cache for a patched range
    ///
    /// a no-op on architectures where the rendezvous already serializes
    /// instruction fetch.
    fn flush_icache(&self, _address: *const u8, _len: usize) {}
}
