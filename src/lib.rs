#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)] // safety documented in SAFETY comments

//! waylay: kernel-mode function interception
//!
//! This library redirects calls to chosen target functions into replacement
//! functions ("detours"), while handing callers of the original signature a
//! trampoline that runs the displaced first instructions of the target and
//! jumps back into its body. It provides:
//!
//! - Per-architecture instruction analysis: import-thunk and patch-stub
//!   skipping, reachability bounds, end-of-function and filler detection
//! - A slab allocator of fixed-size trampoline slots kept within ±2 GiB of
//!   their targets
//! - An all-or-nothing transaction engine that applies every patch inside
//!   an inter-processor rendezvous
//! - Writable aliasing of read-only executable pages, so the original
//!   mappings never change protection
//!
//! # Feature Flags
//!
//! - `std` (default): use the standard library. Disable for kernel builds.
//! - `alloc`: enable heap allocation in `no_std` mode (requires an allocator).
//! - `kernel`: the Windows kernel host backend and the process-wide engine
//!   instance behind [`api`].
//! - `sim`: an in-process simulated host for harnesses outside the kernel.
//!
//! # Example
//!
//! ```ignore
//! use waylay::{DetourEngine, SimHost};
//!
//! static mut ORIGINAL: *mut u8 = core::ptr::null_mut();
//!
//! let engine = DetourEngine::new(SimHost::new());
//! engine.transaction_begin()?;
//! unsafe {
//!     ORIGINAL = target as *mut u8;
//!     engine.attach(&raw mut ORIGINAL, my_detour as *mut u8)?;
//! }
//! engine.transaction_commit()?;
//! // ORIGINAL now enters the trampoline; calls to target reach my_detour
//! ```

#[cfg(all(not(feature = "std"), feature = "alloc"))]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod arch;
pub mod error;
pub mod host;

#[cfg(any(feature = "std", feature = "alloc"))]
pub mod asm;
#[cfg(any(feature = "std", feature = "alloc"))]
pub mod trampoline;
#[cfg(any(feature = "std", feature = "alloc"))]
pub mod transaction;

mod pe;

// re-exports for convenience
pub use arch::JumpBounds;
pub use error::{DetourError, NtStatus, Result};
pub use host::{CodePage, Host, WritableMapping};

#[cfg(any(feature = "std", feature = "alloc"))]
pub use asm::{CopiedInstruction, Copier, RelocatingCopier};
#[cfg(any(feature = "std", feature = "alloc"))]
pub use trampoline::{AlignEntry, Trampoline};
#[cfg(any(feature = "std", feature = "alloc"))]
pub use transaction::{Attachment, CommitFailure, DetourEngine};

#[cfg(any(test, feature = "sim"))]
pub use host::SimHost;

#[cfg(all(feature = "kernel", windows))]
pub use host::KernelHost;

/// library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// process-wide engine instance and the matching free-function entry points
///
/// Drivers that want the classic flat surface call these; everything
/// forwards to one static [`DetourEngine`] over the kernel host.
#[cfg(all(
    feature = "kernel",
    windows,
    any(target_arch = "x86", target_arch = "x86_64")
))]
pub mod api {
    use crate::asm::RelocatingCopier;
    use crate::error::Result;
    use crate::host::KernelHost;
    use crate::transaction::{Attachment, CommitFailure, DetourEngine};

    static ENGINE: DetourEngine<KernelHost, RelocatingCopier> =
        DetourEngine::new(KernelHost::new());

    /// the process-wide engine
    pub fn engine() -> &'static DetourEngine<KernelHost, RelocatingCopier> {
        &ENGINE
    }

    /// open a transaction on the calling thread
    pub fn transaction_begin() -> Result<()> {
        ENGINE.transaction_begin()
    }

    /// roll back the open transaction
    pub fn transaction_abort() -> Result<()> {
        ENGINE.transaction_abort()
    }

    /// atomically apply the open transaction
    pub fn transaction_commit() -> Result<()> {
        ENGINE.transaction_commit()
    }

    /// commit, surfacing the argument that poisoned a failed transaction
    pub fn transaction_commit_ex() -> core::result::Result<(), CommitFailure> {
        ENGINE.transaction_commit_ex()
    }

    /// record an attach in the open transaction
    pub unsafe fn attach(pointer: *mut *mut u8, detour: *mut u8) -> Result<()> {
        // SAFETY: forwarded caller contract
        unsafe { ENGINE.attach(pointer, detour) }
    }

    /// record an attach and report what it resolved to
    pub unsafe fn attach_ex(pointer: *mut *mut u8, detour: *mut u8) -> Result<Option<Attachment>> {
        // SAFETY: forwarded caller contract
        unsafe { ENGINE.attach_ex(pointer, detour) }
    }

    /// record a detach in the open transaction
    pub unsafe fn detach(pointer: *mut *mut u8, detour: *mut u8) -> Result<()> {
        // SAFETY: forwarded caller contract
        unsafe { ENGINE.detach(pointer, detour) }
    }

    /// note a thread for update at commit (parity stub)
    pub fn update_thread(thread: usize) -> Result<()> {
        ENGINE.update_thread(thread)
    }

    /// resolve a code pointer through thunks to the real body entry point
    pub unsafe fn code_from_pointer(pointer: *mut u8) -> *mut u8 {
        // SAFETY: forwarded caller contract
        unsafe { ENGINE.code_from_pointer(pointer) }
    }

    /// turn undersized targets into silent no-ops; returns the previous value
    pub fn set_ignore_too_small(ignore: bool) -> bool {
        ENGINE.set_ignore_too_small(ignore)
    }

    /// keep empty regions mapped across commits; returns the previous value
    pub fn set_retain_regions(retain: bool) -> bool {
        ENGINE.set_retain_regions(retain)
    }

    /// lower bound of the excluded system region; returns the previous value
    pub fn set_system_region_lower_bound(bound: usize) -> usize {
        ENGINE.set_system_region_lower_bound(bound)
    }

    /// upper bound of the excluded system region; returns the previous value
    pub fn set_system_region_upper_bound(bound: usize) -> usize {
        ENGINE.set_system_region_upper_bound(bound)
    }
}
