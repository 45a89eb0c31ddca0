//! x86 (32-bit) dialect

use log::trace;

use super::{range_2gb_above, range_2gb_below, JumpBounds};

/// bytes of the overwrite jump written into a target (jmp rel32)
pub const SIZE_OF_JMP: usize = 5;

/// relocated-prefix area of a trampoline slot
pub(crate) const TRAMPOLINE_CODE_LEN: usize = 30;

/// original-bytes area of a trampoline slot
pub(crate) const TRAMPOLINE_RESTORE_LEN: usize = 22;

/// instruction-alignment entries per trampoline slot
pub(crate) const ALIGN_ENTRIES: usize = 8;

/// emit `jmp +imm32` at `code`, as if executing at `src`, landing on `dest`
///
/// `code` and `src` differ when emitting through a writable alias of the
/// real instruction address.
pub unsafe fn gen_jmp_immediate(code: *mut u8, src: *const u8, dest: *const u8) -> *mut u8 {
    unsafe {
        *code = 0xe9;
        let disp = (dest as isize) - (src as isize + 5);
        (code.add(1) as *mut i32).write_unaligned(disp as i32);
        code.add(5)
    }
}

/// fill `[code, limit)` with breakpoint opcodes
pub unsafe fn gen_brk(code: *mut u8, limit: *mut u8) -> *mut u8 {
    let mut code = code;
    while code < limit {
        unsafe {
            *code = 0xcc;
            code = code.add(1);
        }
    }
    code
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
        // import thunk: jmp [imm32] through an IAT cell (32-bit absolute)
        if *code == 0xff && *code.add(1) == 0x25 {
            let cell = (code.add(2) as *const u32).read_unaligned() as usize as *const u8;
            if imported(code, cell) {
                let new = (cell as *const u32).read_unaligned() as usize as *const u8;
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
                let cell = (code.add(2) as *const u32).read_unaligned() as usize as *const u8;
                if imported(code, cell) {
                    let new = (cell as *const u32).read_unaligned() as usize as *const u8;
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
        // stay within reach of a relative jmp target as well
        if *code == 0xe9 {
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

/// true if the instruction at `code` ends the enclosing function
pub unsafe fn does_code_end_function(code: *const u8) -> bool {
    unsafe {
        let b0 = *code;
        if b0 == 0xeb ||    // jmp +imm8
            b0 == 0xe9 ||   // jmp +imm32
            b0 == 0xe0 ||   // jmp eax
            b0 == 0xc2 ||   // ret +imm8
            b0 == 0xc3 ||   // ret
            b0 == 0xcc
        {
            // brk
            return true;
        }
        let b1 = *code.add(1);
        if b0 == 0xf3 && b1 == 0xc3 {
            // rep ret
            return true;
        }
        if b0 == 0xff && b1 == 0x25 {
            // jmp [+imm32]
            return true;
        }
        if matches!(b0, 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65)
            && b1 == 0xff
            && *code.add(2) == 0x25
        {
            // segment-prefixed jmp [+imm32]
            return true;
        }
    }
    false
}

// 1-byte through 11-byte NOPs.
const FILLERS: &[&[u8]] = &[
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x66, 0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// length of the padding sequence at `code`, or 0 when it is live code
pub unsafe fn is_code_filler(code: *const u8) -> usize {
    for filler in FILLERS {
        // byte-by-byte so no read happens past the first mismatch
        let matches = filler
            .iter()
            .enumerate()
            .all(|(i, &b)| unsafe { *code.add(i) } == b);
        if matches {
            return filler.len();
        }
    }
    unsafe {
        if *code == 0xcc {
            // int 3
            return 1;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_jmp_immediate_forward() {
        let mut buf = [0u8; 8];
        let base = buf.as_mut_ptr();
        let end = unsafe { gen_jmp_immediate(base, base, base.wrapping_add(0x10)) };
        assert_eq!(unsafe { end.offset_from(base) }, 5);
        assert_eq!(buf[0], 0xe9);
        // 0x10 - 5 = 0x0b
        assert_eq!(i32::from_le_bytes(buf[1..5].try_into().unwrap()), 0x0b);
    }

    #[test]
    fn test_gen_jmp_immediate_through_alias() {
        let mut alias = [0u8; 8];
        // encode as if running at 0x1000, landing at 0x2000
        let src = 0x1000usize as *const u8;
        let dest = 0x2000usize as *const u8;
        unsafe { gen_jmp_immediate(alias.as_mut_ptr(), src, dest) };
        assert_eq!(
            i32::from_le_bytes(alias[1..5].try_into().unwrap()),
            0x1000 - 5
        );
    }

    #[test]
    fn test_gen_brk_fills_range() {
        let mut buf = [0u8; 8];
        let base = buf.as_mut_ptr();
        unsafe { gen_brk(base, base.add(5)) };
        assert_eq!(&buf[..5], &[0xcc; 5]);
        assert_eq!(buf[5], 0);
    }

    #[test]
    fn test_skip_jump_patch_stub_into_long_jump() {
        // jmp +2 over two dead bytes, landing on jmp +imm32
        let mut buf = [0u8; 16];
        buf[0] = 0xeb;
        buf[1] = 0x02;
        buf[4] = 0xe9;
        buf[5..9].copy_from_slice(&3i32.to_le_bytes());
        let base = buf.as_ptr();
        let skipped = unsafe { skip_jump(base, &|_, _| false) };
        // eb lands at +4, e9 adds 5 + 3
        assert_eq!(skipped as usize, base as usize + 12);
    }

    #[test]
    fn test_skip_jump_plain_code_unchanged() {
        let buf = [0x55u8, 0x8b, 0xec];
        let base = buf.as_ptr();
        assert_eq!(unsafe { skip_jump(base, &|_, _| true) }, base);
    }

    #[test]
    fn test_find_jmp_bounds_narrows_toward_jump_target() {
        let mut buf = [0u8; 8];
        buf[0] = 0xe9;
        buf[1..5].copy_from_slice(&0x2000_0000i32.to_le_bytes());
        let base = buf.as_ptr();
        let dest = base as usize + 5 + 0x2000_0000;
        let bounds = unsafe { find_jmp_bounds(base) };
        assert_eq!(bounds.lower, range_2gb_below(dest));
        assert!(bounds.lower > range_2gb_below(base as usize));
        assert_eq!(bounds.upper, range_2gb_above(base as usize));
    }

    #[test]
    fn test_end_of_function_patterns() {
        for bytes in [
            [0xc3u8, 0, 0].as_slice(),
            &[0xc2, 0x08, 0x00],
            &[0xeb, 0x10, 0],
            &[0xe9, 0, 0],
            &[0xcc, 0, 0],
            &[0xf3, 0xc3, 0],
            &[0xff, 0x25, 0],
            &[0x65, 0xff, 0x25],
        ] {
            assert!(unsafe { does_code_end_function(bytes.as_ptr()) });
        }
        for bytes in [[0x55u8, 0, 0].as_slice(), &[0x8b, 0xec, 0], &[0x90, 0, 0]] {
            assert!(!unsafe { does_code_end_function(bytes.as_ptr()) });
        }
    }

    #[test]
    fn test_filler_lengths() {
        for filler in FILLERS {
            let mut buf = [0u8; 16];
            buf[..filler.len()].copy_from_slice(filler);
            assert_eq!(unsafe { is_code_filler(buf.as_ptr()) }, filler.len());
        }
        assert_eq!(unsafe { is_code_filler([0xccu8; 4].as_ptr()) }, 1);
        assert_eq!(unsafe { is_code_filler([0x55u8; 4].as_ptr()) }, 0);
    }
}
