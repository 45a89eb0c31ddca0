//! Relocating instruction copier for x86/x64 built on iced-x86

use core::ptr;
use core::slice;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock, OpKind,
};

use crate::error::{DetourError, Result};

use super::{CopiedInstruction, Copier};

// an x86/x64 instruction is at most 15 bytes
const MAX_INSTRUCTION_LEN: usize = 15;

/// instruction copier using iced-x86 for decode and re-encode
///
/// position-independent instructions are copied verbatim; relative branches
/// and RIP-relative operands are re-encoded at the destination address,
/// widening short forms when the displacement no longer fits.
pub struct RelocatingCopier {
    bitness: u32,
}

impl RelocatingCopier {
    /// create copier for the build target
    #[cfg(target_arch = "x86_64")]
    pub const fn native() -> Self {
        Self { bitness: 64 }
    }

    /// create copier for the build target
    #[cfg(target_arch = "x86")]
    pub const fn native() -> Self {
        Self { bitness: 32 }
    }

    /// create 64-bit copier
    pub const fn x64() -> Self {
        Self { bitness: 64 }
    }

    /// create 32-bit copier
    pub const fn x86() -> Self {
        Self { bitness: 32 }
    }
}

fn needs_relocation(instruction: &Instruction, bitness: u32) -> bool {
    match instruction.flow_control() {
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::Call => {
            matches!(
                instruction.op0_kind(),
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
            )
        }
        _ => bitness == 64 && instruction.is_ip_rel_memory_operand(),
    }
}

impl Copier for RelocatingCopier {
    unsafe fn copy_instruction(
        &self,
        dst: *mut u8,
        pool: &mut *mut u8,
        src: *const u8,
        original: Option<*const u8>,
    ) -> Result<CopiedInstruction> {
        // relocation happens by re-encoding, never through a literal pool
        let _ = pool;

        let ip = original.unwrap_or(src) as u64;
        // SAFETY: caller guarantees one whole instruction readable at src
        let bytes = unsafe { slice::from_raw_parts(src, MAX_INSTRUCTION_LEN) };
        let mut decoder = Decoder::with_ip(self.bitness, bytes, ip, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return Err(DetourError::OutOfMemory);
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(DetourError::OutOfMemory);
        }
        let length = instruction.len();

        if needs_relocation(&instruction, self.bitness) {
            let mut relocated = instruction;
            relocated.set_ip(dst as u64);
            let block = InstructionBlock::new(slice::from_ref(&relocated), dst as u64);
            let encoded = BlockEncoder::encode(self.bitness, block, BlockEncoderOptions::NONE)
                .map_err(|_| DetourError::OutOfMemory)?;
            let code = encoded.code_buffer;
            // SAFETY: caller guarantees room at dst for the rewritten form
            unsafe {
                ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
            }
            Ok(CopiedInstruction {
                next: unsafe { src.add(length) },
                extra: code.len() as isize - length as isize,
            })
        } else {
            // SAFETY: length bytes readable at src, room at dst
            unsafe {
                ptr::copy_nonoverlapping(src, dst, length);
            }
            Ok(CopiedInstruction {
                next: unsafe { src.add(length) },
                extra: 0,
            })
        }
    }
}
