//! Windows kernel-mode host backend
//!
//! Trampoline regions come from `MmAllocatePagesForMdlEx` (non-cached,
//! physically contiguous pages); target aliases come from locking the target
//! range into a second system mapping; the rendezvous is `KeIpiGenericCall`.
//!
//! # Safety
//!
//! This backend runs at elevated privilege. Improper use can take the whole
//! machine down; all unsafe operations are documented at the call sites.

use core::ffi::c_void;
use core::ptr;

use crate::arch::JumpBounds;
use crate::error::{status, DetourError, Result};

use super::{CodePage, Host, WritableMapping};

const PAGE_SIZE: usize = 0x1000;

const PAGE_EXECUTE_READ: u32 = 0x20;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;

const MM_NON_CACHED: u32 = 0;
const MM_ALLOCATE_REQUIRE_CONTIGUOUS_CHUNKS: u32 = 0x20;
const HIGH_PAGE_PRIORITY: u32 = 32;

const KERNEL_MODE: u8 = 0;
const IO_MODIFY_ACCESS: u32 = 2;

/// host implementation over the NT kernel services
pub struct KernelHost;

impl KernelHost {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for KernelHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for KernelHost {
    fn alloc_code_page(&self, _range: &JumpBounds) -> Option<CodePage> {
        // physical page placement cannot honor a virtual range hint; the
        // allocator re-validates reachability on the returned mapping
        let empty = PhysicalAddress(0);
        let max = PhysicalAddress(i64::MAX);

        // SAFETY: plain allocation call, parameters are self-contained
        let mdl = unsafe {
            MmAllocatePagesForMdlEx(
                empty,
                max,
                empty,
                PAGE_SIZE,
                MM_NON_CACHED,
                MM_ALLOCATE_REQUIRE_CONTIGUOUS_CHUNKS,
            )
        };
        if mdl.is_null() {
            return None;
        }

        // SAFETY: mdl describes freshly allocated, locked pages
        let base = unsafe { MmGetSystemAddressForMdlSafe(mdl, HIGH_PAGE_PRIORITY) };
        if base.is_null() {
            // SAFETY: mdl came from MmAllocatePagesForMdlEx above
            unsafe {
                MmFreePagesFromMdl(mdl);
                ExFreePool(mdl as *mut c_void);
            }
            return None;
        }

        Some(CodePage {
            base: base as *mut u8,
            handle: mdl as usize,
        })
    }

    unsafe fn free_code_page(&self, page: &CodePage) {
        let mdl = page.handle as *mut c_void;
        // SAFETY: caller guarantees the page is no longer referenced
        unsafe {
            MmFreePagesFromMdl(mdl);
            ExFreePool(mdl);
        }
    }

    unsafe fn protect_code_page(&self, page: &CodePage, writable: bool) -> Result<()> {
        let protection = if writable {
            PAGE_EXECUTE_READWRITE
        } else {
            PAGE_EXECUTE_READ
        };
        // SAFETY: the handle is the MDL backing this page
        let nt = unsafe { MmProtectMdlSystemAddress(page.handle as *mut c_void, protection) };
        if status::nt_success(nt) {
            Ok(())
        } else {
            Err(DetourError::InsufficientResources)
        }
    }

    unsafe fn remap_writable(&self, address: *const u8, len: usize) -> Result<WritableMapping> {
        // SAFETY: describing an existing kernel range
        let mdl = unsafe {
            IoAllocateMdl(
                address as *mut c_void,
                len as u32,
                0,
                0,
                ptr::null_mut(),
            )
        };
        if mdl.is_null() {
            return Err(DetourError::InsufficientResources);
        }

        // SAFETY: mdl describes a resident kernel code range; lock for modify
        // so the second mapping is writable
        unsafe {
            MmProbeAndLockPages(mdl, KERNEL_MODE, IO_MODIFY_ACCESS);
        }

        // SAFETY: pages are locked
        let alias = unsafe { MmGetSystemAddressForMdlSafe(mdl, HIGH_PAGE_PRIORITY) };
        if alias.is_null() {
            // SAFETY: undo the lock and allocation from above
            unsafe {
                MmUnlockPages(mdl);
                IoFreeMdl(mdl);
            }
            return Err(DetourError::InsufficientResources);
        }

        Ok(WritableMapping {
            ptr: alias as *mut u8,
            handle: mdl as usize,
        })
    }

    unsafe fn unmap(&self, mapping: &WritableMapping) {
        let mdl = mapping.handle as *mut c_void;
        if !mdl.is_null() {
            // SAFETY: handle is the MDL created by remap_writable
            unsafe {
                MmUnlockPages(mdl);
                IoFreeMdl(mdl);
            }
        }
    }

    fn broadcast(&self, callback: &(dyn Fn() + Sync)) {
        unsafe extern "system" fn thunk(context: usize) -> usize {
            // SAFETY: context is the &&dyn reference passed below, alive for
            // the whole KeIpiGenericCall
            let callback = unsafe { &*(context as *const &(dyn Fn() + Sync)) };
            callback();
            0
        }

        let context = &callback as *const &(dyn Fn() + Sync) as usize;
        // SAFETY: KeIpiGenericCall keeps every processor inside thunk until
        // all of them return; context outlives the call
        unsafe {
            KeIpiGenericCall(thunk, context);
        }
    }

    fn current_thread_id(&self) -> usize {
        // SAFETY: identity query, always valid
        unsafe { PsGetCurrentThreadId() as usize }
    }

    fn current_processor(&self) -> u32 {
        // SAFETY: identity query, always valid
        unsafe { KeGetCurrentProcessorNumberEx(ptr::null_mut()) }
    }

    fn processor_count(&self) -> u32 {
        // SAFETY: identity query, always valid
        unsafe { KeQueryActiveProcessorCountEx(0) }
    }

    fn module_base(&self, address: *const u8) -> Option<*const u8> {
        let mut base: *mut c_void = ptr::null_mut();
        // SAFETY: RtlPcToFileHeader only reads loader metadata
        let image = unsafe { RtlPcToFileHeader(address as *mut c_void, &mut base) };
        if image.is_null() {
            None
        } else {
            Some(base as *const u8)
        }
    }

    fn is_memory_readable(&self, address: *const u8, len: usize) -> bool {
        if address.is_null() || len == 0 {
            return false;
        }

        let start = address as usize;
        let end = match start.checked_add(len) {
            Some(end) => end,
            None => return false,
        };

        // probe at page granularity, plus the final byte
        let mut current = start;
        while current < end {
            // SAFETY: MmIsAddressValid never faults
            if unsafe { MmIsAddressValid(current as *const c_void) } == 0 {
                return false;
            }
            current = match current.checked_add(PAGE_SIZE) {
                Some(next) => next,
                None => return false,
            };
        }
        // SAFETY: as above
        unsafe { MmIsAddressValid((end - 1) as *const c_void) != 0 }
    }
}

/// physical address wrapper
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct PhysicalAddress(i64);

extern "system" {
    fn MmAllocatePagesForMdlEx(
        LowAddress: PhysicalAddress,
        HighAddress: PhysicalAddress,
        SkipBytes: PhysicalAddress,
        TotalBytes: usize,
        CacheType: u32,
        Flags: u32,
    ) -> *mut c_void;

    fn MmFreePagesFromMdl(MemoryDescriptorList: *mut c_void);

    fn MmGetSystemAddressForMdlSafe(Mdl: *mut c_void, Priority: u32) -> *mut c_void;

    fn MmProtectMdlSystemAddress(MemoryDescriptorList: *mut c_void, NewProtect: u32) -> i32;

    fn IoAllocateMdl(
        VirtualAddress: *mut c_void,
        Length: u32,
        SecondaryBuffer: u8,
        ChargeQuota: u8,
        Irp: *mut c_void,
    ) -> *mut c_void;

    fn IoFreeMdl(Mdl: *mut c_void);

    fn MmProbeAndLockPages(MemoryDescriptorList: *mut c_void, AccessMode: u8, Operation: u32);

    fn MmUnlockPages(MemoryDescriptorList: *mut c_void);

    fn MmIsAddressValid(VirtualAddress: *const c_void) -> u8;

    fn ExFreePool(P: *mut c_void);

    fn KeIpiGenericCall(
        BroadcastFunction: unsafe extern "system" fn(usize) -> usize,
        Context: usize,
    ) -> usize;

    fn PsGetCurrentThreadId() -> *mut c_void;

    fn KeGetCurrentProcessorNumberEx(ProcNumber: *mut c_void) -> u32;

    fn KeQueryActiveProcessorCountEx(GroupNumber: u16) -> u32;

    fn RtlPcToFileHeader(PcValue: *mut c_void, BaseOfImage: *mut *mut c_void) -> *mut c_void;
}
