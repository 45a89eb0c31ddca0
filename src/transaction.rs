//! Transactional attach/detach engine
//!
//! All patching happens inside an all-or-nothing transaction: one thread
//! opens it, records attach and detach operations, and commits. The commit
//! stops every other processor in a rendezvous, applies every patch from the
//! issuing processor, and only then lets the machine run again, so no
//! processor can ever observe half-written target bytes.
//!
//! The engine object owns every piece of process-wide state the transaction
//! needs; a kernel build exposes one process-wide instance through the crate
//! root entry points.

use core::cell::UnsafeCell;
use core::hint;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

#[cfg(all(not(feature = "std"), feature = "alloc"))]
use alloc::vec::Vec;

use log::trace;

use crate::arch::native as arch;
use crate::asm::Copier;
use crate::error::{DetourError, Result};
use crate::host::{Host, WritableMapping};
use crate::pe;
use crate::trampoline::{AlignEntry, Trampoline, TrampolineAllocator};

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use crate::asm::RelocatingCopier;

// region reserved for system images, never used for trampolines
const SYSTEM_REGION_LOWER_BOUND: usize = 0x7000_0000;
const SYSTEM_REGION_UPPER_BOUND: usize = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Attach,
    Detach,
}

/// one recorded operation of the open transaction
struct PendingOp {
    kind: OpKind,
    /// the caller's function-pointer slot, rewritten at commit
    pointer: *mut *mut u8,
    /// first byte of the real target
    target: *mut u8,
    /// writable alias of the target bytes
    alias: *mut u8,
    mapping: WritableMapping,
    trampoline: NonNull<Trampoline>,
}

// SAFETY: the raw pointers are only dereferenced by the transaction owner
// and, during commit, by the issuing processor inside the rendezvous
unsafe impl Send for PendingOp {}
unsafe impl Sync for PendingOp {}

/// state owned by whichever thread holds the transaction
struct TransactionState {
    pending: Vec<PendingOp>,
    /// first error of the transaction; later operations short-circuit to it
    first_error: Option<DetourError>,
    /// the user argument that produced `first_error`
    failed_pointer: *mut *mut u8,
    allocator: TrampolineAllocator,
}

/// what an attach resolved to, mirroring the extended attach outputs
#[derive(Debug, Clone, Copy)]
pub struct Attachment {
    pub trampoline: NonNull<Trampoline>,
    /// real target after import-thunk and patch-stub skipping
    pub target: *mut u8,
    /// real detour after skipping
    pub detour: *mut u8,
}

/// a failed commit: the latched error plus the argument that caused it
#[derive(Debug, Clone, Copy)]
pub struct CommitFailure {
    pub error: DetourError,
    /// the offending function-pointer slot, or null when none applies
    pub failed_pointer: *mut *mut u8,
}

/// shared context of one commit rendezvous
///
/// every processor decrements `remaining` after the issuing processor has
/// applied the patches, then spins until all processors got there.
struct RendezvousContext<'a> {
    remaining: AtomicU32,
    issuing: u32,
    ops: &'a [PendingOp],
}

impl RendezvousContext<'_> {
    fn signal_done(&self) {
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    fn wait_all(&self) {
        while self.remaining.load(Ordering::Acquire) != 0 {
            hint::spin_loop();
        }
    }
}

enum BuildError {
    /// movable prefix plus trailing filler never reached the jump size
    TooFewBytes,
    /// relocated prefix ran past the slot's code area
    Overflow,
}

impl From<BuildError> for DetourError {
    fn from(_: BuildError) -> Self {
        DetourError::OutOfMemory
    }
}

/// the function interception engine
///
/// `H` supplies the OS primitives, `C` the per-instruction copier. At most
/// one transaction is open at any time, enforced by a compare-and-swap on
/// the owning thread id; everything behind `state` is only touched by the
/// owner.
pub struct DetourEngine<H: Host, C: Copier> {
    host: H,
    copier: C,
    /// thread id owning the pending transaction; 0 = none
    owner: AtomicUsize,
    /// turn undersized targets into silent no-ops instead of errors
    ignore_too_small: AtomicBool,
    /// keep empty regions mapped across commits
    retain_regions: AtomicBool,
    system_region_lower: AtomicUsize,
    system_region_upper: AtomicUsize,
    state: UnsafeCell<TransactionState>,
}

// SAFETY: `state` is only accessed by the thread that won the `owner` CAS;
// the rendezvous hands the pending list to the issuing processor only
unsafe impl<H: Host, C: Copier> Sync for DetourEngine<H, C> {}
unsafe impl<H: Host + Send, C: Copier + Send> Send for DetourEngine<H, C> {}

impl<H: Host, C: Copier> DetourEngine<H, C> {
    /// create an engine with an explicit instruction copier
    pub const fn with_copier(host: H, copier: C) -> Self {
        Self {
            host,
            copier,
            owner: AtomicUsize::new(0),
            ignore_too_small: AtomicBool::new(false),
            retain_regions: AtomicBool::new(false),
            system_region_lower: AtomicUsize::new(SYSTEM_REGION_LOWER_BOUND),
            system_region_upper: AtomicUsize::new(SYSTEM_REGION_UPPER_BOUND),
            state: UnsafeCell::new(TransactionState {
                pending: Vec::new(),
                first_error: None,
                failed_pointer: ptr::null_mut(),
                allocator: TrampolineAllocator::new(),
            }),
        }
    }

    /// the host backing this engine
    pub fn host(&self) -> &H {
        &self.host
    }

    fn owns_transaction(&self) -> bool {
        self.owner.load(Ordering::Acquire) == self.host.current_thread_id()
    }

    /// # Safety
    /// only call after verifying this thread owns the transaction
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut TransactionState {
        // SAFETY: ownership is exclusive per the owner CAS protocol
        unsafe { &mut *self.state.get() }
    }

    fn latch(
        state: &mut TransactionState,
        pointer: *mut *mut u8,
        error: DetourError,
    ) -> DetourError {
        if state.first_error.is_none() {
            state.first_error = Some(error);
            state.failed_pointer = pointer;
        }
        error
    }

    fn system_region(&self) -> (usize, usize) {
        (
            self.system_region_lower.load(Ordering::SeqCst),
            self.system_region_upper.load(Ordering::SeqCst),
        )
    }

    /// resolve a code pointer through import thunks and patch stubs to the
    /// real body entry point
    ///
    /// # Safety
    /// `pointer` must be null or point at readable code
    pub unsafe fn code_from_pointer(&self, pointer: *mut u8) -> *mut u8 {
        let imported =
            |code: *const u8, address: *const u8| pe::is_imported(&self.host, code, address);
        // SAFETY: caller guarantees readable code behind the pointer
        unsafe { arch::skip_jump(pointer, &imported) as *mut u8 }
    }

    /// open a transaction on the calling thread
    ///
    /// fails with `InvalidOperation` while any transaction is open,
    /// including one owned by the caller.
    pub fn transaction_begin(&self) -> Result<()> {
        let thread = self.host.current_thread_id();
        if self
            .owner
            .compare_exchange(0, thread, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DetourError::InvalidOperation);
        }

        // SAFETY: the CAS above made this thread the sole owner
        let state = unsafe { self.state() };
        state.pending.clear();
        state.first_error = None;
        state.failed_pointer = ptr::null_mut();

        // make the trampoline pages writable for the whole transaction
        if let Err(error) = unsafe { state.allocator.set_writable(&self.host) } {
            state.first_error = Some(error);
            return Err(error);
        }
        Ok(())
    }

    /// throw away every recorded operation and close the transaction
    ///
    /// live target bytes are untouched on this path; only trampoline memory
    /// was ever dirtied, and it is returned to the free lists here.
    pub fn transaction_abort(&self) -> Result<()> {
        if !self.owns_transaction() {
            return Err(DetourError::InvalidOperation);
        }
        // SAFETY: owner verified above
        let state = unsafe { self.state() };
        // SAFETY: aliases and trampolines were acquired by this transaction
        unsafe {
            for op in state.pending.drain(..) {
                self.host.unmap(&op.mapping);
                if op.kind == OpKind::Attach {
                    state.allocator.free(op.trampoline.as_ptr());
                }
            }
            state.allocator.set_executable(&self.host);
        }
        self.owner.store(0, Ordering::Release);
        Ok(())
    }

    /// apply every recorded operation atomically and close the transaction
    pub fn transaction_commit(&self) -> Result<()> {
        self.transaction_commit_ex().map_err(|failure| failure.error)
    }

    /// like [`transaction_commit`](Self::transaction_commit), but surfaces
    /// the argument pointer that poisoned a failed transaction
    pub fn transaction_commit_ex(&self) -> core::result::Result<(), CommitFailure> {
        if !self.owns_transaction() {
            return Err(CommitFailure {
                error: DetourError::InvalidOperation,
                failed_pointer: ptr::null_mut(),
            });
        }

        // SAFETY: owner verified above
        let state = unsafe { self.state() };

        // a poisoned transaction rolls back instead of committing
        if let Some(error) = state.first_error {
            let failed_pointer = state.failed_pointer;
            let _ = self.transaction_abort();
            return Err(CommitFailure {
                error,
                failed_pointer,
            });
        }

        // apply every patch from the issuing processor while the rendezvous
        // holds all others at a known point
        let context = RendezvousContext {
            remaining: AtomicU32::new(self.host.processor_count()),
            issuing: self.host.current_processor(),
            ops: &state.pending,
        };
        let handler = || {
            if self.host.current_processor() == context.issuing {
                // SAFETY: every other processor is spinning in this
                // rendezvous, so the patch window has a single writer
                unsafe { apply_pending(&self.host, context.ops) };
            }
            context.signal_done();
            context.wait_all();
        };
        self.host.broadcast(&handler);

        // release aliases, recycle detached trampolines, restore protection
        let mut freed = false;
        // SAFETY: still the owner; the rendezvous has completed
        unsafe {
            for op in state.pending.drain(..) {
                self.host.unmap(&op.mapping);
                if op.kind == OpKind::Detach {
                    state.allocator.free(op.trampoline.as_ptr());
                    freed = true;
                }
            }
            if freed && !self.retain_regions.load(Ordering::SeqCst) {
                state.allocator.free_empty_regions(&self.host);
            }
            state.allocator.set_executable(&self.host);
        }
        self.owner.store(0, Ordering::Release);
        Ok(())
    }

    /// note a thread for update at commit
    ///
    /// kernel threads are never suspended, so this only reports a poisoned
    /// transaction; it exists for API parity.
    pub fn update_thread(&self, _thread: usize) -> Result<()> {
        if self.owns_transaction() {
            // SAFETY: owner verified above
            if let Some(error) = unsafe { self.state() }.first_error {
                return Err(error);
            }
        }
        Ok(())
    }

    /// record an attach of `detour` to the function named by `pointer`
    ///
    /// # Safety
    /// `pointer` must reference a function pointer that stays valid until
    /// commit or abort; both code addresses must be readable.
    pub unsafe fn attach(&self, pointer: *mut *mut u8, detour: *mut u8) -> Result<()> {
        // SAFETY: forwarded caller contract
        unsafe { self.attach_ex(pointer, detour).map(|_| ()) }
    }

    /// record an attach and report what it resolved to
    ///
    /// returns `Ok(None)` when *ignore-too-small* is set and the target was
    /// skipped rather than failed.
    ///
    /// # Safety
    /// see [`attach`](Self::attach)
    pub unsafe fn attach_ex(
        &self,
        pointer: *mut *mut u8,
        detour: *mut u8,
    ) -> Result<Option<Attachment>> {
        if detour.is_null() {
            return Err(DetourError::InvalidParameter);
        }
        if !self.owns_transaction() {
            return Err(DetourError::InvalidOperation);
        }
        let ignore_too_small = self.ignore_too_small.load(Ordering::SeqCst);

        // SAFETY: owner verified above
        let state = unsafe { self.state() };
        if let Some(error) = state.first_error {
            return Err(error);
        }

        if pointer.is_null() {
            return Err(DetourError::InvalidHandle);
        }
        // SAFETY: caller guarantees pointer references a function pointer
        let stored = unsafe { *pointer };
        if stored.is_null() {
            return Err(Self::latch(state, pointer, DetourError::InvalidHandle));
        }

        // SAFETY: both addresses point at readable code per caller contract
        let target = unsafe { self.code_from_pointer(stored) };
        let detour_code = unsafe { self.code_from_pointer(detour) };

        // a detour that does nothing but call the target resolves onto it
        if detour_code == target {
            if ignore_too_small {
                return Ok(None);
            }
            return Err(Self::latch(state, pointer, DetourError::InvalidParameter));
        }

        let excluded = self.system_region();
        // SAFETY: target is readable code; allocator state belongs to us
        let Some(trampoline) = (unsafe { state.allocator.alloc(&self.host, target, excluded) })
        else {
            return Err(Self::latch(
                state,
                pointer,
                DetourError::InsufficientResources,
            ));
        };

        // SAFETY: fresh writable slot, readable target
        if let Err(build_error) = unsafe { self.build_trampoline(trampoline, target, detour_code) }
        {
            // SAFETY: the slot was allocated above and holds no live detour
            unsafe { state.allocator.free(trampoline.as_ptr()) };
            return match build_error {
                BuildError::TooFewBytes if ignore_too_small => Ok(None),
                other => Err(Self::latch(state, pointer, other.into())),
            };
        }

        // SAFETY: trampoline was fully built above
        let cb_restore = unsafe { (*trampoline.as_ptr()).cb_restore } as usize;
        // SAFETY: the restore range is readable mapped code
        let mapping = match unsafe { self.host.remap_writable(target, cb_restore) } {
            Ok(mapping) => mapping,
            Err(error) => {
                // SAFETY: as above, slot holds no live detour yet
                unsafe { state.allocator.free(trampoline.as_ptr()) };
                return Err(Self::latch(state, pointer, error));
            }
        };

        trace!(
            "attach: target={:p} detour={:p} trampoline={:p}",
            target,
            detour_code,
            trampoline.as_ptr()
        );
        state.pending.push(PendingOp {
            kind: OpKind::Attach,
            pointer,
            target,
            alias: mapping.ptr,
            mapping,
            trampoline,
        });
        Ok(Some(Attachment {
            trampoline,
            target,
            detour: detour_code,
        }))
    }

    /// record a detach of `detour` from the function named by `pointer`
    ///
    /// `*pointer` must currently hold the trampoline entry the matching
    /// attach installed.
    ///
    /// # Safety
    /// see [`attach`](Self::attach)
    pub unsafe fn detach(&self, pointer: *mut *mut u8, detour: *mut u8) -> Result<()> {
        if !self.owns_transaction() {
            return Err(DetourError::InvalidOperation);
        }
        let ignore_too_small = self.ignore_too_small.load(Ordering::SeqCst);

        // SAFETY: owner verified above
        let state = unsafe { self.state() };
        if let Some(error) = state.first_error {
            return Err(error);
        }

        if detour.is_null() {
            return Err(DetourError::InvalidParameter);
        }
        if pointer.is_null() {
            return Err(DetourError::InvalidHandle);
        }
        // SAFETY: caller guarantees pointer references a function pointer
        let stored = unsafe { *pointer };
        if stored.is_null() {
            return Err(Self::latch(state, pointer, DetourError::InvalidHandle));
        }

        // SAFETY: caller guarantees readable code behind both pointers
        let trampoline = unsafe { self.code_from_pointer(stored) } as *mut Trampoline;
        let detour_code = unsafe { self.code_from_pointer(detour) };

        let stop_or_latch = |state: &mut TransactionState| {
            if ignore_too_small {
                Ok(())
            } else {
                Err(Self::latch(state, pointer, DetourError::InvalidBlock))
            }
        };

        // the stored pointer must name a slot this engine handed out
        // SAFETY: allocator state belongs to us
        if !unsafe { state.allocator.contains(trampoline as *const u8) } {
            return stop_or_latch(state);
        }

        // SAFETY: contains() proved this is one of our slots
        let (cb_restore, recorded_detour, remain) = unsafe {
            let t = &*trampoline;
            (t.cb_restore as usize, t.detour, t.remain)
        };
        if cb_restore == 0 || cb_restore > arch::TRAMPOLINE_CODE_LEN {
            return stop_or_latch(state);
        }
        if recorded_detour != detour_code {
            return stop_or_latch(state);
        }

        // SAFETY: a live trampoline's remain points just past its target
        let target = unsafe { remain.sub(cb_restore) };
        // SAFETY: the restore range is readable mapped code
        let mapping = match unsafe { self.host.remap_writable(target, cb_restore) } {
            Ok(mapping) => mapping,
            Err(error) => return Err(Self::latch(state, pointer, error)),
        };

        trace!(
            "detach: target={:p} detour={:p} trampoline={:p}",
            target,
            detour_code,
            trampoline
        );
        state.pending.push(PendingOp {
            kind: OpKind::Detach,
            pointer,
            target,
            alias: mapping.ptr,
            mapping,
            // SAFETY: contains() proved non-null
            trampoline: unsafe { NonNull::new_unchecked(trampoline) },
        });
        Ok(())
    }

    /// build the relocated prefix, back jump and restore record of a slot
    ///
    /// # Safety
    /// `trampoline` is a freshly allocated writable slot; `target` points at
    /// readable code.
    unsafe fn build_trampoline(
        &self,
        trampoline: NonNull<Trampoline>,
        target: *mut u8,
        detour: *mut u8,
    ) -> core::result::Result<(), BuildError> {
        // SAFETY: exclusive access to the fresh slot
        let t = unsafe { &mut *trampoline.as_ptr() };
        let code_base = t.code.as_mut_ptr();

        // the literal pool grows down from the end of the code area
        // SAFETY: in-bounds one-past-the-end cursor
        let mut pool = unsafe { code_base.add(arch::TRAMPOLINE_CODE_LEN) };
        let mut src: *const u8 = target;
        let mut dst = code_base;
        let mut cb_target = 0usize;
        let mut n_align = 0usize;

        #[cfg(target_arch = "arm")]
        let mut cb_jump = arch::SIZE_OF_JMP;
        #[cfg(not(target_arch = "arm"))]
        let cb_jump = arch::SIZE_OF_JMP;

        #[cfg(target_arch = "arm")]
        {
            use crate::arch::arm::fetch_thumb_opcode;

            // a 2-mod-4 entry needs one extra half-word of overwrite; an
            // existing "ldr pc,[pc]" entry (another detour) moves verbatim
            // SAFETY: reading the first target opcodes
            unsafe {
                if target as usize & 2 != 0 {
                    cb_jump += 2;
                    if fetch_thumb_opcode(src) == 0xbf00
                        && fetch_thumb_opcode(src.add(2)) == 0xf8df_f000
                    {
                        ptr::copy_nonoverlapping(src, dst, 10);
                        src = src.add(10);
                        dst = dst.add(10);
                        cb_target = 10;
                    }
                } else if fetch_thumb_opcode(src) == 0xf8df_f000 {
                    ptr::copy_nonoverlapping(src, dst, 8);
                    src = src.add(8);
                    dst = dst.add(8);
                    cb_target = 8;
                }
            }
        }

        // move whole instructions until the overwrite jump fits
        while cb_target < cb_jump {
            let op = src;
            // SAFETY: src walks decodable target code, dst stays in the slot
            let copied = match unsafe { self.copier.copy_instruction(dst, &mut pool, src, None) } {
                Ok(copied) => copied,
                Err(_) => return Err(BuildError::TooFewBytes),
            };
            src = copied.next;
            // SAFETY: advances by what the copier wrote
            dst = unsafe { dst.offset(src.offset_from(op) + copied.extra) };
            cb_target = src as usize - target as usize;

            t.align[n_align] = AlignEntry {
                target_offset: cb_target as u8,
                trampoline_offset: (dst as usize - code_base as usize) as u8,
            };
            n_align += 1;
            if n_align >= t.align.len() {
                break;
            }
            // SAFETY: op points at the instruction just copied
            if unsafe { arch::does_code_end_function(op) } {
                break;
            }
        }

        // consume, but do not duplicate, trailing padding if it is needed
        while cb_target < cb_jump {
            // SAFETY: src stays within the target's mapped code
            let filler = unsafe { arch::is_code_filler(src) };
            if filler == 0 {
                break;
            }
            // SAFETY: filler bytes verified readable just above
            src = unsafe { src.add(filler) };
            cb_target = src as usize - target as usize;
        }

        if cb_target < cb_jump {
            return Err(BuildError::TooFewBytes);
        }
        if dst > pool {
            return Err(BuildError::Overflow);
        }
        if cb_target > arch::TRAMPOLINE_RESTORE_LEN {
            return Err(BuildError::Overflow);
        }

        #[cfg(target_arch = "x86_64")]
        let cb_back = arch::SIZE_OF_JMP_TO_REMAIN;
        #[cfg(not(target_arch = "x86_64"))]
        let cb_back = arch::SIZE_OF_JMP;
        if cb_target > arch::TRAMPOLINE_CODE_LEN - cb_back {
            return Err(BuildError::Overflow);
        }

        t.cb_code = (dst as usize - code_base as usize) as u8;
        t.cb_restore = cb_target as u8;
        // SAFETY: cb_target bounded by TRAMPOLINE_RESTORE_LEN above
        unsafe {
            ptr::copy_nonoverlapping(target as *const u8, t.restore.as_mut_ptr(), cb_target);
        }
        // SAFETY: in-bounds offset from the target
        t.remain = unsafe { target.add(cb_target) };
        t.detour = detour;

        // finish with the jump back to the remainder and breakpoint fill
        // SAFETY: cursor stays inside the code area per the checks above
        unsafe {
            let cursor = code_base.add(t.cb_code as usize);
            #[cfg(target_arch = "x86_64")]
            let cursor = arch::gen_jmp_indirect(cursor, cursor, &t.remain as *const *mut u8);
            #[cfg(target_arch = "x86")]
            let cursor = arch::gen_jmp_immediate(cursor, cursor, t.remain);
            #[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
            let cursor = arch::gen_jmp_immediate(cursor, Some(&mut pool), t.remain);
            arch::gen_brk(cursor, pool);
        }
        Ok(())
    }

    /// turn undersized targets into silent no-ops; returns the previous value
    pub fn set_ignore_too_small(&self, ignore: bool) -> bool {
        self.ignore_too_small.swap(ignore, Ordering::SeqCst)
    }

    /// keep empty trampoline regions mapped across commits; returns the
    /// previous value
    pub fn set_retain_regions(&self, retain: bool) -> bool {
        self.retain_regions.swap(retain, Ordering::SeqCst)
    }

    /// lower bound of the excluded system region; returns the previous value
    pub fn set_system_region_lower_bound(&self, bound: usize) -> usize {
        self.system_region_lower.swap(bound, Ordering::SeqCst)
    }

    /// upper bound of the excluded system region; returns the previous value
    pub fn set_system_region_upper_bound(&self, bound: usize) -> usize {
        self.system_region_upper.swap(bound, Ordering::SeqCst)
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl<H: Host> DetourEngine<H, RelocatingCopier> {
    /// create an engine with the built-in relocating copier
    pub const fn new(host: H) -> Self {
        Self::with_copier(host, RelocatingCopier::native())
    }
}

/// write every pending patch; runs on the issuing processor while the
/// rendezvous quiesces all others
unsafe fn apply_pending<H: Host>(host: &H, ops: &[PendingOp]) {
    for op in ops {
        let trampoline = op.trampoline.as_ptr();
        // SAFETY: single writer inside the rendezvous; aliases are writable,
        // trampoline slots live until their detach commits
        unsafe {
            let cb_restore = (*trampoline).cb_restore as usize;
            match op.kind {
                OpKind::Detach => {
                    // put the original bytes back, verbatim
                    ptr::copy_nonoverlapping((*trampoline).restore.as_ptr(), op.alias, cb_restore);

                    #[cfg(target_arch = "arm")]
                    {
                        *op.pointer = crate::arch::arm::to_pfunc(op.target) as *mut u8;
                    }
                    #[cfg(not(target_arch = "arm"))]
                    {
                        *op.pointer = op.target;
                    }
                }
                OpKind::Attach => {
                    #[cfg(target_arch = "x86_64")]
                    {
                        // the landing-pad cell routes the short overwrite
                        // jump to the 64-bit detour address
                        ((*trampoline).code_in.as_mut_ptr() as *mut u64)
                            .write_unaligned((*trampoline).detour as u64);
                        let cell = (*trampoline).code_in.as_ptr() as *const *mut u8;
                        let end = arch::gen_jmp_indirect(op.alias, op.target, cell);
                        arch::gen_brk(end, op.alias.add(cb_restore));
                        *op.pointer = (*trampoline).code.as_ptr() as *mut u8;
                    }
                    #[cfg(target_arch = "x86")]
                    {
                        let end =
                            arch::gen_jmp_immediate(op.alias, op.target, (*trampoline).detour);
                        arch::gen_brk(end, op.alias.add(cb_restore));
                        *op.pointer = (*trampoline).code.as_ptr() as *mut u8;
                    }
                    #[cfg(target_arch = "arm")]
                    {
                        let end = arch::gen_jmp_immediate(op.alias, None, (*trampoline).detour);
                        arch::gen_brk(end, op.alias.add(cb_restore));
                        *op.pointer =
                            crate::arch::arm::to_pfunc((*trampoline).code.as_ptr()) as *mut u8;
                    }
                    #[cfg(target_arch = "aarch64")]
                    {
                        let end = arch::gen_jmp_immediate(op.alias, None, (*trampoline).detour);
                        arch::gen_brk(end, op.alias.add(cb_restore));
                        *op.pointer = (*trampoline).code.as_ptr() as *mut u8;
                    }
                }
            }
            host.flush_icache(op.target, cb_restore);
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::host::SimHost;

    // mov [rsp+8],rbx; mov [rsp+0x10],rsi; push rdi
    const PROLOGUE: [u8; 11] = [
        0x48, 0x89, 0x5c, 0x24, 0x08, 0x48, 0x89, 0x74, 0x24, 0x10, 0x57,
    ];

    fn engine() -> DetourEngine<SimHost, RelocatingCopier> {
        DetourEngine::new(SimHost::new())
    }

    fn make_target() -> Box<[u8; 64]> {
        let mut code = Box::new([0xccu8; 64]);
        code[..PROLOGUE.len()].copy_from_slice(&PROLOGUE);
        code
    }

    fn make_detour() -> Box<[u8; 16]> {
        Box::new([0xc3u8; 16])
    }

    #[test]
    fn test_attach_detach_round_trip() {
        let engine = engine();
        let mut target = make_target();
        let snapshot = *target;
        let detour_code = make_detour();
        let detour = detour_code.as_ptr() as *mut u8;
        let target_addr = target.as_mut_ptr();
        let mut pointer: *mut u8 = target_addr;

        engine.transaction_begin().unwrap();
        let attachment = unsafe { engine.attach_ex(&mut pointer, detour) }
            .unwrap()
            .unwrap();
        engine.transaction_commit().unwrap();

        let t = unsafe { &*attachment.trampoline.as_ptr() };
        // greedy copy covers the three prologue instructions plus one
        // padding byte to reach the 12-byte copy length
        assert_eq!(t.restore_bytes().len(), 12);
        assert_eq!(t.restore_bytes(), &snapshot[..12]);
        assert_eq!(t.remain_ptr() as usize, target_addr as usize + 12);
        assert_eq!(t.detour_ptr(), detour as *const u8);

        // the target now opens with the 6-byte indirect jump through the
        // landing-pad cell, breakpoint-filled to the restore length
        assert_eq!(&target[..2], &[0xff, 0x25]);
        let disp = i32::from_le_bytes(target[2..6].try_into().unwrap());
        let cell = (target_addr as i64 + 6 + disp as i64) as usize;
        assert_eq!(cell, t.code_in.as_ptr() as usize);
        let routed = u64::from_le_bytes(t.code_in);
        assert_eq!(routed, detour as u64);
        assert_eq!(&target[6..12], &[0xcc; 6]);

        // the caller's pointer enters the trampoline, whose prefix is the
        // verbatim prologue followed by the jump back to the remainder
        assert_eq!(pointer, t.entry() as *mut u8);
        assert_eq!(&t.code[..12], &snapshot[..12]);
        assert_eq!(&t.code[12..14], &[0xff, 0x25]);
        let back_disp = i32::from_le_bytes(t.code[14..18].try_into().unwrap());
        let back_cell = t.code.as_ptr() as i64 + 12 + 6 + back_disp as i64;
        assert_eq!(back_cell as usize, &t.remain as *const _ as usize);

        // alignment map pairs each original offset with its relocated one
        assert_eq!(
            t.align_map(),
            &[
                AlignEntry {
                    target_offset: 5,
                    trampoline_offset: 5
                },
                AlignEntry {
                    target_offset: 10,
                    trampoline_offset: 10
                },
                AlignEntry {
                    target_offset: 11,
                    trampoline_offset: 11
                },
                AlignEntry {
                    target_offset: 12,
                    trampoline_offset: 12
                },
            ]
        );

        // reachability invariant: the slot lies inside the target's bounds
        let bounds = unsafe { crate::arch::x64::find_jmp_bounds(target_addr) };
        assert!(bounds.contains(attachment.trampoline.as_ptr() as usize, 1));

        // detach restores the bytes bit-exactly
        engine.transaction_begin().unwrap();
        unsafe { engine.detach(&mut pointer, detour) }.unwrap();
        engine.transaction_commit().unwrap();

        assert_eq!(&target[..], &snapshot[..]);
        assert_eq!(pointer, target_addr);
    }

    #[test]
    fn test_attach_skips_patch_stub_to_real_body() {
        let engine = engine();
        let mut buffer = Box::new([0xccu8; 64]);
        // patch stub at the front jumping over 14 dead bytes into the body
        buffer[0] = 0xeb;
        buffer[1] = 14;
        buffer[16..16 + PROLOGUE.len()].copy_from_slice(&PROLOGUE);
        let stub = buffer.as_mut_ptr();
        let detour_code = make_detour();
        let mut pointer: *mut u8 = stub;

        engine.transaction_begin().unwrap();
        let attachment = unsafe { engine.attach_ex(&mut pointer, detour_code.as_ptr() as *mut u8) }
            .unwrap()
            .unwrap();
        engine.transaction_commit().unwrap();

        // the patch landed on the body, not the stub
        assert_eq!(attachment.target as usize, stub as usize + 16);
        assert_eq!(buffer[0], 0xeb);
        assert_eq!(&buffer[16..18], &[0xff, 0x25]);
    }

    #[test]
    fn test_commit_with_no_operations_is_clean() {
        let engine = engine();
        engine.transaction_begin().unwrap();
        engine.transaction_commit().unwrap();
        assert_eq!(engine.host().live_pages(), 0);
        assert_eq!(engine.host().rendezvous_count(), 1);
    }

    #[test]
    fn test_abort_on_empty_transaction_clears_ownership() {
        let engine = engine();
        engine.transaction_begin().unwrap();
        engine.transaction_abort().unwrap();
        // ownership is gone, so a second abort has nothing to close
        assert_eq!(
            engine.transaction_abort(),
            Err(DetourError::InvalidOperation)
        );
        // and a new transaction can open
        engine.transaction_begin().unwrap();
        engine.transaction_abort().unwrap();
    }

    #[test]
    fn test_second_begin_fails() {
        let engine = engine();
        engine.transaction_begin().unwrap();
        assert_eq!(
            engine.transaction_begin(),
            Err(DetourError::InvalidOperation)
        );
        engine.transaction_abort().unwrap();
    }

    #[test]
    fn test_attach_outside_transaction_fails() {
        let engine = engine();
        let mut target = make_target();
        let detour_code = make_detour();
        let mut pointer: *mut u8 = target.as_mut_ptr();
        let result = unsafe { engine.attach(&mut pointer, detour_code.as_ptr() as *mut u8) };
        assert_eq!(result, Err(DetourError::InvalidOperation));
    }

    #[test]
    fn test_null_arguments() {
        let engine = engine();
        let mut target = make_target();
        let detour_code = make_detour();
        let detour = detour_code.as_ptr() as *mut u8;
        let mut pointer: *mut u8 = target.as_mut_ptr();

        engine.transaction_begin().unwrap();
        // null detour and null slot are rejected without poisoning
        assert_eq!(
            unsafe { engine.attach(&mut pointer, ptr::null_mut()) },
            Err(DetourError::InvalidParameter)
        );
        assert_eq!(
            unsafe { engine.attach(ptr::null_mut(), detour) },
            Err(DetourError::InvalidHandle)
        );
        engine.transaction_commit().unwrap();

        // a null stored target poisons the transaction
        engine.transaction_begin().unwrap();
        let mut empty: *mut u8 = ptr::null_mut();
        assert_eq!(
            unsafe { engine.attach(&mut empty, detour) },
            Err(DetourError::InvalidHandle)
        );
        let failure = engine.transaction_commit_ex().unwrap_err();
        assert_eq!(failure.error, DetourError::InvalidHandle);
        assert_eq!(failure.failed_pointer, &mut empty as *mut *mut u8);
    }

    #[test]
    fn test_self_detour_rejected_or_skipped() {
        let engine = engine();
        let mut target = make_target();
        let snapshot = *target;
        let mut pointer: *mut u8 = target.as_mut_ptr();
        let detour = target.as_mut_ptr();

        engine.transaction_begin().unwrap();
        assert_eq!(
            unsafe { engine.attach(&mut pointer, detour) },
            Err(DetourError::InvalidParameter)
        );
        let failure = engine.transaction_commit_ex().unwrap_err();
        assert_eq!(failure.error, DetourError::InvalidParameter);

        // under ignore-too-small the attach is silently skipped
        engine.set_ignore_too_small(true);
        engine.transaction_begin().unwrap();
        let skipped = unsafe { engine.attach_ex(&mut pointer, detour) }.unwrap();
        assert!(skipped.is_none());
        engine.transaction_commit().unwrap();
        assert_eq!(&target[..], &snapshot[..]);
    }

    #[test]
    fn test_too_small_target() {
        let engine = engine();
        // xor eax,eax; ret; then bytes that are neither code filler nor nop
        let mut tiny = Box::new([0x01u8; 32]);
        tiny[0] = 0x31;
        tiny[1] = 0xc0;
        tiny[2] = 0xc3;
        let snapshot = *tiny;
        let detour_code = make_detour();
        let detour = detour_code.as_ptr() as *mut u8;
        let mut pointer: *mut u8 = tiny.as_mut_ptr();

        engine.transaction_begin().unwrap();
        assert_eq!(
            unsafe { engine.attach(&mut pointer, detour) },
            Err(DetourError::OutOfMemory)
        );
        let failure = engine.transaction_commit_ex().unwrap_err();
        assert_eq!(failure.error, DetourError::OutOfMemory);
        assert_eq!(failure.failed_pointer, &mut pointer as *mut *mut u8);
        assert_eq!(&tiny[..], &snapshot[..]);

        // with ignore-too-small the attach skips and the commit is clean
        engine.set_ignore_too_small(true);
        engine.transaction_begin().unwrap();
        let skipped = unsafe { engine.attach_ex(&mut pointer, detour) }.unwrap();
        assert!(skipped.is_none());
        engine.transaction_commit().unwrap();
        assert_eq!(&tiny[..], &snapshot[..]);
        assert_eq!(pointer, tiny.as_mut_ptr());
    }

    #[test]
    fn test_multi_attach_commits_inside_one_rendezvous() {
        let engine = engine();
        let mut first = make_target();
        let mut second = make_target();
        let detour_code = make_detour();
        let detour = detour_code.as_ptr() as *mut u8;
        let mut first_ptr: *mut u8 = first.as_mut_ptr();
        let mut second_ptr: *mut u8 = second.as_mut_ptr();

        engine.transaction_begin().unwrap();
        unsafe {
            engine.attach(&mut first_ptr, detour).unwrap();
            engine.attach(&mut second_ptr, detour).unwrap();
        }
        assert_eq!(engine.host().rendezvous_count(), 0);
        engine.transaction_commit().unwrap();

        // both patches landed, and in a single rendezvous window
        assert_eq!(engine.host().rendezvous_count(), 1);
        assert_eq!(&first[..2], &[0xff, 0x25]);
        assert_eq!(&second[..2], &[0xff, 0x25]);
        assert_ne!(first_ptr, first.as_mut_ptr());
        assert_ne!(second_ptr, second.as_mut_ptr());
    }

    #[test]
    fn test_abort_rolls_back_without_touching_target() {
        let engine = engine();
        let mut target = make_target();
        let snapshot = *target;
        let detour_code = make_detour();
        let mut pointer: *mut u8 = target.as_mut_ptr();

        engine.transaction_begin().unwrap();
        unsafe {
            engine
                .attach(&mut pointer, detour_code.as_ptr() as *mut u8)
                .unwrap();
        }
        engine.transaction_abort().unwrap();

        assert_eq!(&target[..], &snapshot[..]);
        assert_eq!(pointer, target.as_mut_ptr());
        assert_eq!(engine.host().rendezvous_count(), 0);
    }

    #[test]
    fn test_empty_region_reclamation_follows_retain_policy() {
        let engine = engine();
        let detour_code = make_detour();
        let detour = detour_code.as_ptr() as *mut u8;

        // default policy: the region created for the attach is released
        // once its last trampoline is detached
        let mut target = make_target();
        let mut pointer: *mut u8 = target.as_mut_ptr();
        engine.transaction_begin().unwrap();
        unsafe { engine.attach(&mut pointer, detour).unwrap() };
        engine.transaction_commit().unwrap();
        assert_eq!(engine.host().live_pages(), 1);

        engine.transaction_begin().unwrap();
        unsafe { engine.detach(&mut pointer, detour).unwrap() };
        engine.transaction_commit().unwrap();
        assert_eq!(engine.host().live_pages(), 0);

        // with retain-regions the empty region persists
        engine.set_retain_regions(true);
        engine.transaction_begin().unwrap();
        unsafe { engine.attach(&mut pointer, detour).unwrap() };
        engine.transaction_commit().unwrap();
        engine.transaction_begin().unwrap();
        unsafe { engine.detach(&mut pointer, detour).unwrap() };
        engine.transaction_commit().unwrap();
        assert_eq!(engine.host().live_pages(), 1);
    }

    #[test]
    fn test_detach_of_foreign_pointer_fails() {
        let engine = engine();
        let mut not_a_trampoline = Box::new([0x90u8; 32]);
        let detour_code = make_detour();
        let mut pointer: *mut u8 = not_a_trampoline.as_mut_ptr();

        engine.transaction_begin().unwrap();
        assert_eq!(
            unsafe { engine.detach(&mut pointer, detour_code.as_ptr() as *mut u8) },
            Err(DetourError::InvalidBlock)
        );
        let failure = engine.transaction_commit_ex().unwrap_err();
        assert_eq!(failure.error, DetourError::InvalidBlock);
    }

    #[test]
    fn test_detach_with_mismatched_detour_fails() {
        let engine = engine();
        let mut target = make_target();
        let detour_code = make_detour();
        let other_code = make_detour();
        let detour = detour_code.as_ptr() as *mut u8;
        let mut pointer: *mut u8 = target.as_mut_ptr();

        engine.transaction_begin().unwrap();
        unsafe { engine.attach(&mut pointer, detour).unwrap() };
        engine.transaction_commit().unwrap();

        engine.transaction_begin().unwrap();
        assert_eq!(
            unsafe { engine.detach(&mut pointer, other_code.as_ptr() as *mut u8) },
            Err(DetourError::InvalidBlock)
        );
        let failure = engine.transaction_commit_ex().unwrap_err();
        assert_eq!(failure.error, DetourError::InvalidBlock);

        // the real detour still detaches cleanly
        engine.transaction_begin().unwrap();
        unsafe { engine.detach(&mut pointer, detour).unwrap() };
        engine.transaction_commit().unwrap();
        assert_eq!(pointer, target.as_mut_ptr());
    }

    #[test]
    fn test_poisoned_transaction_short_circuits_later_operations() {
        let engine = engine();
        let mut target = make_target();
        let detour_code = make_detour();
        let detour = detour_code.as_ptr() as *mut u8;

        engine.transaction_begin().unwrap();
        let mut empty: *mut u8 = ptr::null_mut();
        assert_eq!(
            unsafe { engine.attach(&mut empty, detour) },
            Err(DetourError::InvalidHandle)
        );

        // a later, perfectly valid attach reports the latched error
        let mut pointer: *mut u8 = target.as_mut_ptr();
        assert_eq!(
            unsafe { engine.attach(&mut pointer, detour) },
            Err(DetourError::InvalidHandle)
        );
        assert_eq!(
            engine.update_thread(0x1234),
            Err(DetourError::InvalidHandle)
        );
        let failure = engine.transaction_commit_ex().unwrap_err();
        assert_eq!(failure.error, DetourError::InvalidHandle);
        // the first offender is the one reported
        assert_eq!(failure.failed_pointer, &mut empty as *mut *mut u8);
    }

    #[test]
    fn test_policy_setters_return_previous_value() {
        let engine = engine();
        assert!(!engine.set_ignore_too_small(true));
        assert!(engine.set_ignore_too_small(false));
        assert!(!engine.set_retain_regions(true));
        assert!(engine.set_retain_regions(false));
        assert_eq!(
            engine.set_system_region_lower_bound(0x1000_0000),
            SYSTEM_REGION_LOWER_BOUND
        );
        assert_eq!(
            engine.set_system_region_upper_bound(0x2000_0000),
            SYSTEM_REGION_UPPER_BOUND
        );
    }

    #[test]
    fn test_update_thread_is_a_parity_stub() {
        let engine = engine();
        engine.update_thread(0x42).unwrap();
        engine.transaction_begin().unwrap();
        engine.update_thread(0x42).unwrap();
        engine.transaction_commit().unwrap();
    }
}
