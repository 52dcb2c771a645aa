// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Host load/store trampolines (spec.md §4.8, component C8).
//!
//! At startup the core emits twelve trampolines into a small exec-memory pool of their own:
//! byte/word/long/quad load and store, plus float32/float64 load and store. Each implements a
//! minimal TLB test against a `readlookup2`/`writelookup2`-style array indexed by guest virtual
//! page number, falling through to the interpretive `readmem*`/`writemem*` layer
//! ([`crate::guest::MemoryAccess`]) on a miss or misalignment.
//!
//! The translator never inlines a memory access itself (spec.md §4.6); it only ever emits calls
//! into the out-of-scope opcode handlers (spec.md §1). Those handlers are the callers of these
//! trampolines' function pointers, which is why [`Trampolines`] exposes them as plain `extern
//! "C"` values rather than wiring them into [`crate::translator`] directly.
//!
//! Float32/float64 routines are not separately encoded: the bit pattern a 32-bit or 64-bit guest
//! float occupies is transported identically to an integer of the same width, so
//! [`Trampolines::read_f32`]/[`Trampolines::read_f64`]/[`Trampolines::write_f32`]/
//! [`Trampolines::write_f64`] are simply aliases of the long/quad integer entry points.

use crate::backend;
use crate::block::BlockIdx;
use crate::emitter::Emitter;
use crate::error::MmapError;
use crate::exec_memory::{BlockRemover, ExecMemoryPool, ExecMemoryProvider, EXEC_INVALID};
use crate::guest::{Abort, MemoryAccess};

/// Guest virtual address space is 32-bit, 4 KiB pages -- `2^20` page-table slots (spec.md §4.8
/// "a process-wide `readlookup2`/`writelookup2` array indexed by virtual-page number").
const LOOKUP_PAGE_BITS: u32 = 20;

/// Number of entries in each of [`Trampolines`]'s two lookup tables.
pub const LOOKUP_ENTRIES: usize = 1 << LOOKUP_PAGE_BITS;

/// Sentinel meaning "this page is not TLB-resident; take the slow path" (spec.md §4.8 "If `base
/// == -1`").
pub const PAGE_UNMAPPED: isize = -1;

/// Number of exec blocks reserved for the trampoline pool. Eight routines take on the order of
/// 650 bytes in total (measured from the per-instruction worst-case reserves below), comfortably
/// inside two [`crate::exec_memory::EXEC_BLOCK_SIZE`] blocks; a third is kept as slack so a
/// slightly larger future encoding still never needs forced eviction.
const TRAMPOLINE_EXEC_BLOCKS: usize = 4;

/// Worst-case encoded size of one trampoline routine, used to pre-reserve room so the routine's
/// entry address (captured once, before any byte is emitted) can never be invalidated by a
/// mid-routine chaining jump.
const ROUTINE_RESERVE: usize = 96;

/// Owning [`BlockIdx`] the trampoline pool's exec blocks are tagged with. Never compared against
/// by anything after [`Trampolines::new`] returns, since [`NoEviction`] guarantees this pool's
/// `allocate` is never called again: the value only has to be *a* valid index, not a meaningful
/// one.
const TRAMPOLINE_OWNER: BlockIdx = crate::block::INVALID;

/// Entry-point signature for a load trampoline: guest virtual address zero-extended in the first
/// argument register, result zero-extended in the return register (spec.md §4.8).
pub type ReadFn = unsafe extern "C" fn(virt: u32) -> u64;

/// Entry-point signature for a store trampoline: guest virtual address in the first argument
/// register, the value to store in the second (spec.md §4.8).
pub type WriteFn = unsafe extern "C" fn(virt: u32, value: u64);

/// [`BlockRemover`] for the trampoline pool. [`TRAMPOLINE_EXEC_BLOCKS`] is sized so the pool
/// never actually runs dry; if it ever does, that is a sizing bug worth learning about loudly
/// rather than silently evicting an unrelated code block (which this pool has no machinery to
/// even express -- it owns no [`crate::block_pool::BlockPool`]).
struct NoEviction;

impl BlockRemover for NoEviction {
    fn remove_block(&mut self, _block: BlockIdx) {
        unreachable!("trampoline exec pool is sized to never require forced eviction")
    }
}

/// Stable-address cell the slow-path wrapper functions dereference to reach the interpretive
/// memory layer (spec.md §4.8 "call the interpretive read/write routine").
///
/// The trampolines bake a pointer to this cell once, at build time, as a plain `movabs`
/// immediate (spec.md §4.2 "Calls to non-generated code"). Boxing it means that address stays
/// valid even when the owning [`Trampolines`] (and the [`crate::Dynarec`] that owns it) is moved;
/// only the *contents* of the cell -- which `MemoryAccess` implementation it points at -- can
/// change, never its own location.
struct MemoryAccessCell {
    mem: *mut dyn MemoryAccess,
    /// Abort raised by the most recent slow-path access; the dispatcher is expected to consult
    /// and clear this the same way it consults `CpuState::abrt` after a compiled block returns.
    abrt: Option<Abort>,
}

/// SAFETY: every access to `mem` happens on the single emulation thread that also owns the
/// `Dynarec` this cell belongs to (spec.md §5 "Shared-resource policy"); nothing here is ever
/// touched concurrently.
unsafe impl Send for MemoryAccessCell {}

extern "C" fn slow_read_trampoline(cell: *mut MemoryAccessCell, addr: u32, width: u32) -> u64 {
    // SAFETY: `cell` was baked from a live `Box<MemoryAccessCell>` owned by the `Trampolines`
    // this routine belongs to, which outlives every compiled routine that can call it.
    let cell = unsafe { &mut *cell };
    // SAFETY: `cell.mem` was set to a live `&mut dyn MemoryAccess` when the cell was built and is
    // only ever touched from the single emulation thread (spec.md §5).
    let mem = unsafe { &mut *cell.mem };
    match mem.read_slow(addr, width as u8) {
        Ok(value) => value,
        Err(abrt) => {
            cell.abrt = Some(abrt);
            0
        }
    }
}

extern "C" fn slow_write_trampoline(cell: *mut MemoryAccessCell, addr: u32, width: u32, value: u64) {
    // SAFETY: see `slow_read_trampoline`.
    let cell = unsafe { &mut *cell };
    let mem = unsafe { &mut *cell.mem };
    if let Err(abrt) = mem.write_slow(addr, width as u8, value) {
        cell.abrt = Some(abrt);
    }
}

/// The twelve built-once host load/store trampolines (spec.md §4.8, component C8).
pub struct Trampolines {
    pool: ExecMemoryPool,
    mem_cell: Box<MemoryAccessCell>,
    read_lookup: Vec<isize>,
    write_lookup: Vec<isize>,

    pub read_b: ReadFn,
    pub read_w: ReadFn,
    pub read_l: ReadFn,
    pub read_q: ReadFn,
    pub read_f32: ReadFn,
    pub read_f64: ReadFn,

    pub write_b: WriteFn,
    pub write_w: WriteFn,
    pub write_l: WriteFn,
    pub write_q: WriteFn,
    pub write_f32: WriteFn,
    pub write_f64: WriteFn,
}

// SAFETY: same single-emulation-thread argument as `ExecMemoryPool` and `MemoryAccessCell`.
unsafe impl Send for Trampolines {}

impl Trampolines {
    /// Builds all twelve trampolines into a freshly reserved exec-memory pool, wiring their slow
    /// paths to `mem` (spec.md §4.8).
    ///
    /// `mem` must outlive every call made through this `Trampolines`' function pointers; the
    /// caller (normally [`crate::Dynarec::new`]) is responsible for that, the same way it is
    /// responsible for keeping a compiled block's baked `cpu_state` pointer valid.
    pub fn new(provider: &mut dyn ExecMemoryProvider, mem: *mut dyn MemoryAccess) -> Result<Self, MmapError> {
        let mut pool = ExecMemoryPool::new(provider, TRAMPOLINE_EXEC_BLOCKS)?;
        let mut mem_cell = Box::new(MemoryAccessCell { mem, abrt: None });
        let ctx = mem_cell.as_mut() as *mut MemoryAccessCell as *const u8;

        let read_lookup = vec![PAGE_UNMAPPED; LOOKUP_ENTRIES];
        let write_lookup = vec![PAGE_UNMAPPED; LOOKUP_ENTRIES];
        let read_table = read_lookup.as_ptr();
        let write_table = write_lookup.as_ptr();

        let mut remover = NoEviction;
        let head = pool.allocate(EXEC_INVALID, TRAMPOLINE_OWNER, &mut remover);
        let mut e = Emitter::new(&mut pool, TRAMPOLINE_OWNER, head);

        let slow_read = slow_read_trampoline as usize as *const u8;
        let slow_write = slow_write_trampoline as usize as *const u8;

        let read_b = build_read(&mut e, &mut remover, read_table, 1, slow_read, ctx);
        let read_w = build_read(&mut e, &mut remover, read_table, 2, slow_read, ctx);
        let read_l = build_read(&mut e, &mut remover, read_table, 4, slow_read, ctx);
        let read_q = build_read(&mut e, &mut remover, read_table, 8, slow_read, ctx);

        let write_b = build_write(&mut e, &mut remover, write_table, 1, slow_write, ctx);
        let write_w = build_write(&mut e, &mut remover, write_table, 2, slow_write, ctx);
        let write_l = build_write(&mut e, &mut remover, write_table, 4, slow_write, ctx);
        let write_q = build_write(&mut e, &mut remover, write_table, 8, slow_write, ctx);

        let head = e.finish();
        pool.clean_blocks(head);

        Ok(Trampolines {
            pool,
            mem_cell,
            read_lookup,
            write_lookup,
            read_b,
            read_w,
            read_l,
            read_q,
            read_f32: read_l,
            read_f64: read_q,
            write_b,
            write_w,
            write_l,
            write_q,
            write_f32: write_l,
            write_f64: write_q,
        })
    }

    /// Maps guest page `page` (a virtual page number, `virt >> 12`) for reads, so that
    /// `host_base + virt` is the live host address of that page's first byte.
    pub fn map_read(&mut self, page: u32, host_base: isize) {
        self.read_lookup[page as usize] = host_base;
    }

    /// Removes guest page `page` from the read TLB, forcing the next read trampoline call to
    /// take the slow path.
    pub fn unmap_read(&mut self, page: u32) {
        self.read_lookup[page as usize] = PAGE_UNMAPPED;
    }

    /// Maps guest page `page` for writes. Kept separate from [`Trampolines::map_read`] because a
    /// page may be readable without being writable (spec.md §4.8 "a process-wide
    /// `readlookup2`/`writelookup2` array").
    pub fn map_write(&mut self, page: u32, host_base: isize) {
        self.write_lookup[page as usize] = host_base;
    }

    /// Removes guest page `page` from the write TLB.
    pub fn unmap_write(&mut self, page: u32) {
        self.write_lookup[page as usize] = PAGE_UNMAPPED;
    }

    /// Takes the abort condition (if any) raised by the most recent slow-path access, clearing
    /// it. Mirrors how the dispatcher consumes `CpuState::abrt` after a compiled block returns.
    pub fn take_abort(&mut self) -> Option<Abort> {
        self.mem_cell.abrt.take()
    }

    /// Exec-memory pool backing these trampolines, exposed for diagnostics (e.g. reporting used
    /// vs. capacity alongside the main code-block pool's own numbers).
    pub fn pool(&self) -> &ExecMemoryPool {
        &self.pool
    }
}

/// Emits one load trampoline and returns its entry point (spec.md §4.8).
///
/// Layout: compute the TLB index from `virt`, reject misaligned accesses (`width > 1` and low
/// bits set) and non-resident pages to the slow path below, otherwise read `[base + virt]`
/// directly and return.
fn build_read(
    e: &mut Emitter,
    remover: &mut dyn BlockRemover,
    table: *const isize,
    width: u8,
    slow_target: *const u8,
    ctx: *const u8,
) -> ReadFn {
    e.ensure(ROUTINE_RESERVE, remover);
    let entry = e.next_insn_addr();

    backend::emit_mov_rax_rdi(e, remover);
    backend::emit_shr_rax_imm8(e, remover, 12);

    let misaligned = if width > 1 {
        backend::emit_test_edi_imm32(e, remover, (width - 1) as u32);
        Some(backend::emit_jnz_short(e, remover))
    } else {
        None
    };

    backend::emit_load_lookup_entry(e, remover, table);
    backend::emit_cmp_rsi_neg1(e, remover);
    let unmapped = backend::emit_jz_short(e, remover);

    // Fast path: base (rsi) + virt (rdi) -> host address, load, return.
    backend::emit_lea_rax_rsi_plus_rdi(e, remover);
    backend::emit_load_from_rax_width(e, remover, width);
    backend::emit_ret(e, remover);

    // Slow path: recover virt into esi before rdi is overwritten with ctx, load the fixed width
    // and call the interpretive reader.
    if let Some(patch) = &misaligned {
        backend::patch_short_to_here(patch, e);
    }
    backend::patch_short_to_here(&unmapped, e);

    backend::emit_mov_esi_edi(e, remover);
    backend::emit_load_ctx_rdi(e, remover, ctx);
    backend::emit_mov_edx_imm32(e, remover, width as u32);
    backend::emit_call_abs(e, remover, slow_target);
    backend::emit_ret(e, remover);

    // SAFETY: `entry` is the absolute host address of this routine's first byte, captured before
    // any byte of it was emitted; the exec memory it points into is executable and never freed
    // (this pool is never touched by eviction, see `NoEviction`).
    unsafe { std::mem::transmute::<*const u8, ReadFn>(entry) }
}

/// Emits one store trampoline and returns its entry point (spec.md §4.8).
fn build_write(
    e: &mut Emitter,
    remover: &mut dyn BlockRemover,
    table: *const isize,
    width: u8,
    slow_target: *const u8,
    ctx: *const u8,
) -> WriteFn {
    e.ensure(ROUTINE_RESERVE, remover);
    let entry = e.next_insn_addr();

    // The incoming value arrives in rsi; the TLB lookup below clobbers rsi with the page's host
    // base, so stash the value in r10 first.
    backend::emit_save_rsi_to_r10(e, remover);
    backend::emit_mov_rax_rdi(e, remover);
    backend::emit_shr_rax_imm8(e, remover, 12);

    let misaligned = if width > 1 {
        backend::emit_test_edi_imm32(e, remover, (width - 1) as u32);
        Some(backend::emit_jnz_short(e, remover))
    } else {
        None
    };

    backend::emit_load_lookup_entry(e, remover, table);
    backend::emit_cmp_rsi_neg1(e, remover);
    let unmapped = backend::emit_jz_short(e, remover);

    backend::emit_lea_rax_rsi_plus_rdi(e, remover);
    backend::emit_store_r10_to_rax_width(e, remover, width);
    backend::emit_ret(e, remover);

    if let Some(patch) = &misaligned {
        backend::patch_short_to_here(patch, e);
    }
    backend::patch_short_to_here(&unmapped, e);

    backend::emit_mov_esi_edi(e, remover);
    backend::emit_load_ctx_rdi(e, remover, ctx);
    backend::emit_mov_edx_imm32(e, remover, width as u32);
    backend::emit_mov_rcx_r10(e, remover);
    backend::emit_call_abs(e, remover, slow_target);
    backend::emit_ret(e, remover);

    // SAFETY: see `build_read`.
    unsafe { std::mem::transmute::<*const u8, WriteFn>(entry) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_memory::MmapProvider;
    use crate::guest::Linear;

    struct FakeMemory {
        reads: Vec<(Linear, u8)>,
        writes: Vec<(Linear, u8, u64)>,
    }

    impl MemoryAccess for FakeMemory {
        fn fastreadl(&mut self, _addr: Linear) -> Result<u32, Abort> {
            unimplemented!("not exercised by these tests")
        }
        fn read_slow(&mut self, addr: Linear, width: u8) -> Result<u64, Abort> {
            self.reads.push((addr, width));
            Ok(0x1122_3344_5566_7788u64 & mask_for(width))
        }
        fn write_slow(&mut self, addr: Linear, width: u8, value: u64) -> Result<(), Abort> {
            self.writes.push((addr, width, value));
            Ok(())
        }
    }

    fn mask_for(width: u8) -> u64 {
        if width >= 8 {
            u64::max_value()
        } else {
            (1u64 << (width as u32 * 8)) - 1
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn fast_path_reads_and_writes_a_mapped_page() {
        let mut mem = FakeMemory { reads: Vec::new(), writes: Vec::new() };
        let mem_ptr: *mut dyn MemoryAccess = &mut mem;
        let mut trampolines = Trampolines::new(&mut MmapProvider, mem_ptr).unwrap();

        let mut backing = vec![0u8; 4096];
        let page = 7u32;
        let virt_base = page << 12;
        // base + virt == host address of the backing buffer's first byte.
        let host_base = backing.as_mut_ptr() as isize - virt_base as isize;
        trampolines.map_read(page, host_base);
        trampolines.map_write(page, host_base);

        unsafe {
            (trampolines.write_l)(virt_base + 4, 0xdead_beefu64);
            let got = (trampolines.read_l)(virt_base + 4);
            assert_eq!(got as u32, 0xdead_beef);
        }
        assert!(mem.writes.is_empty(), "mapped page must take the fast path");
        assert!(mem.reads.is_empty(), "mapped page must take the fast path");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn unmapped_page_falls_through_to_the_slow_path() {
        let mut mem = FakeMemory { reads: Vec::new(), writes: Vec::new() };
        let mem_ptr: *mut dyn MemoryAccess = &mut mem;
        let trampolines = Trampolines::new(&mut MmapProvider, mem_ptr).unwrap();

        let virt = 0x0012_3000u32;
        unsafe {
            let got = (trampolines.read_b)(virt);
            assert_eq!(got as u8, 0x88);
        }
        assert_eq!(mem.reads, vec![(virt, 1)]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn misaligned_access_falls_through_to_the_slow_path_even_on_a_mapped_page() {
        let mut mem = FakeMemory { reads: Vec::new(), writes: Vec::new() };
        let mem_ptr: *mut dyn MemoryAccess = &mut mem;
        let mut trampolines = Trampolines::new(&mut MmapProvider, mem_ptr).unwrap();

        let mut backing = vec![0u8; 8192];
        let page = 3u32;
        let virt_base = page << 12;
        let host_base = backing.as_mut_ptr() as isize - virt_base as isize;
        trampolines.map_read(page, host_base);

        // Address `virt_base + 1` is not 4-byte aligned.
        unsafe {
            let _ = (trampolines.read_l)(virt_base + 1);
        }
        assert_eq!(mem.reads, vec![(virt_base + 1, 4)]);
    }
}
