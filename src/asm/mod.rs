//! Instruction copier contract
//!
//! The engine treats per-instruction copying as an external service: given a
//! source instruction, write an equivalent instruction (or sequence) at a
//! destination, relocating PC-relative operands so they stay correct at the
//! new address. The crate ships one implementation for x86/x64 built on
//! iced-x86; other dialects plug in their own.

mod copier;

pub use copier::RelocatingCopier;

use crate::error::Result;

/// outcome of copying a single instruction
#[derive(Debug, Clone, Copy)]
pub struct CopiedInstruction {
    /// source cursor just past the copied instruction
    pub next: *const u8,
    /// bytes written at the destination beyond the instruction's source
    /// length; negative when the rewritten form is shorter
    pub extra: isize,
}

/// copies one instruction at a time, relocating PC-relative operands
pub trait Copier {
    /// copy exactly one instruction from `src` to `dst`
    ///
    /// `pool` is a literal-pool cursor growing downward; implementations
    /// that materialize absolute operands may carve storage from it.
    /// `original` is the instruction's pre-relocation home when `src` is
    /// itself a copy, for implementations that need the original address.
    ///
    /// # Safety
    /// `src` must have one whole decodable instruction readable behind it
    /// (up to the architecture's maximum instruction length), and `dst`
    /// must have room for the rewritten form.
    unsafe fn copy_instruction(
        &self,
        dst: *mut u8,
        pool: &mut *mut u8,
        src: *const u8,
        original: Option<*const u8>,
    ) -> Result<CopiedInstruction>;
}
