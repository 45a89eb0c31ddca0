//! ARM64 dialect
//!
//! Every instruction is 4 bytes; the overwrite is two instructions plus an
//! 8-byte literal, 16 bytes in all. Copied instructions can expand when
//! PC-relative forms are rewritten through immediates, so the code area is
//! sized for several times the overwrite length.

use log::trace;

use super::{range_2gb_above, range_2gb_below, JumpBounds};

/// bytes of the overwrite jump written into a target
/// (`LDR X17,[PC+8]; BR X17` plus the 8-byte literal)
pub const SIZE_OF_JMP: usize = 16;

/// relocated-prefix area of a trampoline slot
pub(crate) const TRAMPOLINE_CODE_LEN: usize = 128;

/// original-bytes area of a trampoline slot
pub(crate) const TRAMPOLINE_RESTORE_LEN: usize = 24;

/// instruction-alignment entries per trampoline slot
pub(crate) const ALIGN_ENTRIES: usize = 8;

/// fetch one opcode
pub unsafe fn fetch_opcode(code: *const u8) -> u32 {
    unsafe { (code as *const u32).read_unaligned() }
}

/// write one opcode, advancing the cursor
pub unsafe fn write_opcode(code: &mut *mut u8, opcode: u32) {
    unsafe {
        (*code as *mut u32).write_unaligned(opcode);
        *code = code.add(4);
    }
}

#[inline]
fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// emit `LDR X17,[PC+n]; BR X17` at `code`, landing on `dest`
///
/// with a pool the literal is carved from the pool (growing downward);
/// without one it is placed right after the two instructions.
pub unsafe fn gen_jmp_immediate(
    code: *mut u8,
    pool: Option<&mut *mut u8>,
    dest: *const u8,
) -> *mut u8 {
    let mut cursor = code;
    unsafe {
        let (literal, inline_literal) = match pool {
            Some(pool) => {
                *pool = pool.sub(8);
                (*pool, false)
            }
            None => (code.add(8), true),
        };

        (literal as *mut u64).write_unaligned(dest as u64);
        let delta = literal as isize - code as isize;

        write_opcode(&mut cursor, 0x5800_0011 | ((delta as u32 / 4) & 0x7ffff) << 5); // LDR X17,[PC+n]
        write_opcode(&mut cursor, 0xd61f_0000 | (17 << 5)); // BR X17

        if inline_literal {
            cursor = cursor.add(8);
        }
    }
    cursor
}

/// fill `[code, limit)` with break opcodes
pub unsafe fn gen_brk(code: *mut u8, limit: *mut u8) -> *mut u8 {
    let mut cursor = code;
    while cursor < limit {
        unsafe {
            write_opcode(&mut cursor, 0xd410_0000 | (0xf000 << 5));
        }
    }
    cursor
}

/// follow an import thunk to the real first instruction
///
/// the recognized thunk is the `adrp x16; ldr x16,[x16,#off]; br x16`
/// sequence through an IAT cell. The adrp immediate is 21 signed bits,
/// page-scaled; the ldr offset is a 12-bit unsigned, doubleword-scaled
/// immediate.
pub unsafe fn skip_jump(
    code: *const u8,
    imported: &dyn Fn(*const u8, *const u8) -> bool,
) -> *const u8 {
    if code.is_null() {
        return code;
    }

    unsafe {
        let opcode = fetch_opcode(code);
        if opcode & 0x9f00_001f == 0x9000_0010 {
            // adrp x16, IAT
            let opcode2 = fetch_opcode(code.add(4));
            if opcode2 & 0xffe0_03ff == 0xf940_0210 {
                // ldr x16, [x16, IAT]
                let opcode3 = fetch_opcode(code.add(8));
                if opcode3 == 0xd61f_0200 {
                    // br x16
                    let page_low2 = (opcode >> 29) as u64 & 3;
                    let page_high19 = (opcode >> 5) as u64 & 0x7ffff;
                    let page = sign_extend((page_high19 << 2) | page_low2, 21) << 12;
                    let offset = (((opcode2 >> 10) as u64) & 0xfff) << 3;

                    let cell = ((code as u64 & !0xfff).wrapping_add_signed(page)
                        + offset) as usize as *const u8;
                    if imported(code, cell) {
                        let new = (cell as *const *const u8).read_unaligned();
                        trace!("{:p}->{:p}: skipped over import table", code, new);
                        return new;
                    }
                }
            }
        }
    }
    code
}

/// addresses within which a trampoline stays reachable from `code`
pub unsafe fn find_jmp_bounds(code: *const u8) -> JumpBounds {
    JumpBounds {
        lower: range_2gb_below(code as usize),
        upper: range_2gb_above(code as usize),
    }
}

/// true if the instruction at `code` ends the enclosing function
pub unsafe fn does_code_end_function(code: *const u8) -> bool {
    let opcode = unsafe { fetch_opcode(code) };
    opcode & 0xffff_fc1f == 0xd65f_0000 ||      // ret <reg>
        opcode & 0xfc00_0000 == 0x1400_0000 // b <imm26>
}

/// length of the padding sequence at `code`, or 0 when it is live code
pub unsafe fn is_code_filler(code: *const u8) -> usize {
    let opcode = unsafe { fetch_opcode(code) };
    if opcode == 0xd503_201f {
        // nop
        return 4;
    }
    if opcode == 0x0000_0000 {
        // zero-filled padding
        return 4;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_jmp_immediate_inline_literal() {
        #[repr(align(8))]
        struct Buf([u8; 24]);
        let mut buf = Buf([0; 24]);
        let base = buf.0.as_mut_ptr();
        let dest = 0x1234_5678_9abc_def0usize as *const u8;

        let end = unsafe { gen_jmp_immediate(base, None, dest) };
        assert_eq!(unsafe { end.offset_from(base) }, 16);
        // LDR X17,[PC+8]
        assert_eq!(unsafe { fetch_opcode(base) }, 0x5800_0011 | (2 << 5));
        // BR X17
        assert_eq!(unsafe { fetch_opcode(base.add(4)) }, 0xd61f_0220);
        let literal = u64::from_le_bytes(buf.0[8..16].try_into().unwrap());
        assert_eq!(literal, dest as u64);
    }

    #[test]
    fn test_gen_jmp_immediate_pool_literal() {
        #[repr(align(8))]
        struct Buf([u8; 32]);
        let mut buf = Buf([0; 32]);
        let base = buf.0.as_mut_ptr();
        let mut pool = unsafe { base.add(32) };
        let dest = 0x4000_0000usize as *const u8;

        let end = unsafe { gen_jmp_immediate(base, Some(&mut pool), dest) };
        assert_eq!(unsafe { end.offset_from(base) }, 8);
        assert_eq!(pool as usize, base as usize + 24);
        // literal is 24 bytes ahead of the LDR
        assert_eq!(unsafe { fetch_opcode(base) }, 0x5800_0011 | (6 << 5));
        let literal = u64::from_le_bytes(buf.0[24..32].try_into().unwrap());
        assert_eq!(literal, 0x4000_0000);
    }

    #[test]
    fn test_gen_brk_fills_range() {
        let mut buf = [0u8; 16];
        let base = buf.as_mut_ptr();
        unsafe { gen_brk(base, base.add(8)) };
        assert_eq!(unsafe { fetch_opcode(base) }, 0xd410_0000 | (0xf000 << 5));
        assert_eq!(unsafe { fetch_opcode(base.add(4)) }, 0xd410_0000 | (0xf000 << 5));
        assert_eq!(unsafe { fetch_opcode(base.add(8)) }, 0);
    }

    #[test]
    fn test_skip_jump_follows_import_thunk() {
        let body = [0u8; 4];

        // adrp/ldr/br thunk with the IAT cell in the same allocation
        #[repr(C, align(8))]
        struct Thunk {
            ops: [u32; 3],
            _pad: u32,
            cell: *const u8,
        }
        let mut thunk = Thunk {
            ops: [0; 3],
            _pad: 0,
            cell: body.as_ptr(),
        };

        let code = thunk.ops.as_ptr() as *const u8;
        let cell = &thunk.cell as *const *const u8 as usize;
        let page = (cell as i64 & !0xfff) - (code as i64 & !0xfff);
        let imm21 = (page >> 12) as u64 & 0x1f_ffff;
        let imm12 = ((cell & 0xfff) >> 3) as u32;

        thunk.ops[0] =
            0x9000_0010 | ((imm21 & 3) as u32) << 29 | (((imm21 >> 2) & 0x7ffff) as u32) << 5;
        thunk.ops[1] = 0xf940_0210 | imm12 << 10;
        thunk.ops[2] = 0xd61f_0200;

        let followed = unsafe { skip_jump(code, &|_, _| true) };
        assert_eq!(followed, body.as_ptr());

        let kept = unsafe { skip_jump(code, &|_, _| false) };
        assert_eq!(kept, code);
    }

    #[test]
    fn test_end_of_function_patterns() {
        let ret = 0xd65f_03c0u32.to_le_bytes(); // ret (x30)
        assert!(unsafe { does_code_end_function(ret.as_ptr()) });

        let b = 0x1400_0010u32.to_le_bytes(); // b +0x40
        assert!(unsafe { does_code_end_function(b.as_ptr()) });

        let add = 0x9100_0000u32.to_le_bytes(); // add x0,x0,#0
        assert!(!unsafe { does_code_end_function(add.as_ptr()) });
    }

    #[test]
    fn test_filler_lengths() {
        assert_eq!(unsafe { is_code_filler(0xd503_201fu32.to_le_bytes().as_ptr()) }, 4);
        assert_eq!(unsafe { is_code_filler(0u32.to_le_bytes().as_ptr()) }, 4);
        assert_eq!(unsafe { is_code_filler(0xd65f_03c0u32.to_le_bytes().as_ptr()) }, 0);
    }
}
