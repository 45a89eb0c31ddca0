//! x86_64 dialect
//!
//! The overwrite jump is the 6-byte `jmp qword ptr [rip+imm32]` form whose
//! indirection cell lives inside the trampoline slot, so trampolines must be
//! reachable within the rel32 range of the target. The prefix copy covers
//! more than the overwrite: moving up to 12 bytes keeps whole instructions
//! intact even when the final patch only needs 6.

use log::trace;

use super::{range_2gb_above, range_2gb_below, JumpBounds};

// byte tables shared with the 32-bit dialect
pub use super::x86::{does_code_end_function, gen_brk, is_code_filler};

/// whole instructions are moved from the target until this many bytes are
/// covered
pub const SIZE_OF_JMP: usize = 12;

/// bytes of the overwrite jump written into a target, and of the
/// trampoline's jump back to the remainder (jmp [rip+imm32])
pub const SIZE_OF_JMP_TO_REMAIN: usize = 6;

/// relocated-prefix area of a trampoline slot
pub(crate) const TRAMPOLINE_CODE_LEN: usize = 30;

/// original-bytes area of a trampoline slot
pub(crate) const TRAMPOLINE_RESTORE_LEN: usize = 30;

/// instruction-alignment entries per trampoline slot
pub(crate) const ALIGN_ENTRIES: usize = 8;

/// emit `jmp [rip+imm32]` at `code`, as if executing at `src`, reading the
/// destination from `cell`
///
/// `code` and `src` differ when emitting through a writable alias of the
/// real instruction address.
pub unsafe fn gen_jmp_indirect(code: *mut u8, src: *const u8, cell: *const *mut u8) -> *mut u8 {
    unsafe {
        *code = 0xff;
        *code.add(1) = 0x25;
        let disp = (cell as isize) - (src as isize + 6);
        (code.add(2) as *mut i32).write_unaligned(disp as i32);
        code.add(6)
    }
}

/// follow import thunks and patch stubs to the real first instruction
///
/// `imported` decides whether an indirect cell lies in the owning module's
/// import address table.
pub unsafe fn skip_jump(
    code: *const u8,
    imported: &dyn Fn(*const u8, *const u8) -> bool,
) -> *const u8 {
    if code.is_null() {
        return code;
    }
    let mut code = code;

    unsafe {
        // import thunk: jmp [rip+imm32] through an IAT cell
        if *code == 0xff && *code.add(1) == 0x25 {
            let disp = (code.add(2) as *const i32).read_unaligned();
            let cell = code.add(6).offset(disp as isize);
            if imported(code, cell) {
                let new = (cell as *const *const u8).read_unaligned();
                trace!("{:p}->{:p}: skipped over import table", code, new);
                code = new;
            }
        }

        // patch stub: jmp +imm8
        if *code == 0xeb {
            let delta = *code.add(1) as i8;
            let new = code.add(2).offset(delta as isize);
            trace!("{:p}->{:p}: skipped over short jump", code, new);
            code = new;

            if *code == 0xff && *code.add(1) == 0x25 {
                let disp = (code.add(2) as *const i32).read_unaligned();
                let cell = code.add(6).offset(disp as isize);
                if imported(code, cell) {
                    let new = (cell as *const *const u8).read_unaligned();
                    trace!("{:p}->{:p}: skipped over import table", code, new);
                    code = new;
                }
            } else if *code == 0xe9 {
                // long jump targeted by the patch stub
                let disp = (code.add(1) as *const i32).read_unaligned();
                let new = code.add(5).offset(disp as isize);
                trace!("{:p}->{:p}: skipped over long jump", code, new);
                code = new;
            }
        }
    }
    code
}

/// addresses within which a trampoline stays reachable from `code`
pub unsafe fn find_jmp_bounds(code: *const u8) -> JumpBounds {
    let mut lower = range_2gb_below(code as usize);
    let mut upper = range_2gb_above(code as usize);

    unsafe {
        if *code == 0xff && *code.add(1) == 0x25 {
            // stay within reach of the indirect cell as well
            let disp = (code.add(2) as *const i32).read_unaligned();
            let cell = code.add(6).offset(disp as isize);
            if cell < code {
                upper = range_2gb_above(cell as usize);
            } else {
                lower = range_2gb_below(cell as usize);
            }
        } else if *code == 0xe9 {
            // stay within reach of the relative jmp target as well
            let disp = (code.add(1) as *const i32).read_unaligned();
            let dest = code.add(5).offset(disp as isize);
            if dest < code {
                upper = range_2gb_above(dest as usize);
            } else {
                lower = range_2gb_below(dest as usize);
            }
        }
    }

    JumpBounds { lower, upper }
}
