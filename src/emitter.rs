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

//! Host code emitter (spec.md §4.2, component C2).
//!
//! The emitter owns a mutable byte cursor `(data_ptr, position, limit)` into the exec-memory
//! chain of the block currently being compiled. `limit` always reserves [`JUMP_RESERVE`] bytes
//! for a chaining jump, so [`Emitter::ensure`] never has to re-derive how much headroom a
//! just-emitted chaining jump itself consumed (spec.md §4.2 `ensure(n)`).
//!
//! Per-opcode encoders live in [`crate::backend`]; this module only provides the cursor,
//! the chaining protocol, and little-endian append primitives shared by every backend.

use crate::block::BlockIdx;
use crate::exec_memory::{ExecBlockIdx, ExecMemoryPool, EXEC_BLOCK_SIZE, EXEC_INVALID};

/// Bytes reserved at the end of every exec block for a chaining jump (spec.md §4.2 "limit is
/// the current ExecMemBlock's usable size minus a reserve for a chaining jump").
///
/// Equal to the active backend's unconditional-jump encoding width
/// ([`crate::backend::JMP_REL32_LEN`]) so the reserve always fits exactly one chaining jump
/// without a further `ensure` call.
pub const JUMP_RESERVE: usize = crate::backend::JMP_REL32_LEN;

/// A location within the currently-emitting exec block whose bytes the caller intends to patch
/// once a branch target is known (spec.md §4.2 "Branch helpers that need patching...").
///
/// The field's absolute host address is pinned at the moment the branch is emitted; it therefore
/// remains valid even if the cursor is later carried into a fresh exec block by [`Emitter::ensure`]
/// emitting a chaining jump -- the *already-emitted* field does not move, only the cursor does.
#[derive(Debug, Clone, Copy)]
pub struct Patch {
    /// Absolute host address of the first byte of the displacement field.
    addr: *mut u8,
    /// Width of the field: `1` for a short (8-bit) branch, `4` for a long (32-bit) branch.
    width: u8,
}

impl Patch {
    /// Patches a short (8-bit) displacement field. `disp` must fit in `i8`; the caller is
    /// responsible for only requesting a short encoding when the measured distance fits
    /// (spec.md §4.2 "short forms must only be used when the measured distance fits").
    pub fn patch_short(&self, disp: i8) {
        assert_eq!(self.width, 1, "patch_short called on a long-displacement field");
        // SAFETY: `addr` was derived from a live exec-memory pointer at emission time and the
        // field was reserved for exactly this write by the emitting helper; the block that owns
        // it cannot have been freed since (the translator holds exclusive access, spec.md §5).
        unsafe { addr_as_mut::<i8>(self.addr).write(disp) }
    }

    /// Patches a long (32-bit) displacement field, little-endian.
    pub fn patch_long(&self, disp: i32) {
        assert_eq!(self.width, 4, "patch_long called on a short-displacement field");
        // SAFETY: see `patch_short`.
        unsafe { addr_as_mut::<i32>(self.addr).write_unaligned(disp) }
    }

    /// Width of this patch site in bytes (`1` or `4`).
    pub fn width(&self) -> u8 {
        self.width
    }

    /// Absolute host address of this patch site's first byte. Exposed crate-internally so a
    /// backend can compute "patch to here" displacements without re-deriving the cursor state.
    pub(crate) fn addr(&self) -> *mut u8 {
        self.addr
    }
}

unsafe fn addr_as_mut<T>(addr: *mut u8) -> *mut T {
    addr as *mut T
}

/// Mutable byte cursor over one code block's growing chain of exec-memory blocks
/// (spec.md §4.2).
pub struct Emitter<'a> {
    pool: &'a mut ExecMemoryPool,
    /// Code block being compiled; passed to the allocator as `code_block` and as the chain's
    /// eviction-exclusion parent.
    owner: BlockIdx,
    /// Current exec block the cursor writes into.
    current: ExecBlockIdx,
    /// Base host pointer of `current`.
    data_ptr: *mut u8,
    /// Write offset within `current`.
    position: usize,
    /// `EXEC_BLOCK_SIZE - JUMP_RESERVE`: the last position at which an `n`-byte write is
    /// guaranteed to leave room for a trailing chaining jump.
    limit: usize,
}

impl<'a> Emitter<'a> {
    /// Begins emitting into `head`, the first exec block already allocated for `owner`
    /// (spec.md §4.6 `block_init` allocates the head block; the emitter just attaches to it).
    pub fn new(pool: &'a mut ExecMemoryPool, owner: BlockIdx, head: ExecBlockIdx) -> Self {
        let data_ptr = pool.get_ptr(head);
        Emitter {
            pool,
            owner,
            current: head,
            data_ptr,
            position: 0,
            limit: EXEC_BLOCK_SIZE - JUMP_RESERVE,
        }
    }

    /// Index of the exec block the cursor is currently writing into.
    pub fn current_block(&self) -> ExecBlockIdx {
        self.current
    }

    /// Current write offset within [`Emitter::current_block`].
    pub fn position(&self) -> usize {
        self.position
    }

    /// Ensures at least `n` more bytes can be written before the chaining-jump reserve is
    /// breached; if not, allocates a new exec block, emits the chaining jump, and redirects the
    /// cursor (spec.md §4.2 `ensure(n)`).
    pub fn ensure(&mut self, n: usize, remover: &mut dyn crate::exec_memory::BlockRemover) {
        if self.position + n <= self.limit {
            return;
        }
        self.allocate_new_block(remover);
    }

    fn allocate_new_block(&mut self, remover: &mut dyn crate::exec_memory::BlockRemover) {
        let new_block = self.pool.allocate(self.current, self.owner, remover);
        let new_ptr = self.pool.get_ptr(new_block);

        // Emit `jmp rel32` from the current cursor to the new block's start (spec.md §4.2
        // "emit an unconditional jump from the old block's cursor to the new block's start").
        crate::backend::emit_jmp_rel32(self, new_ptr);

        self.current = new_block;
        self.data_ptr = new_ptr;
        self.position = 0;
    }

    /// Appends one byte and advances the cursor. Callers must have called [`Emitter::ensure`]
    /// with a sufficient worst-case size first.
    pub fn emit_u8(&mut self, v: u8) {
        // SAFETY: every public per-opcode helper calls `ensure` with its worst-case encoded
        // size before emitting any bytes, so `position` is always `< limit + JUMP_RESERVE`
        // here, which is within the exec block's `EXEC_BLOCK_SIZE` extent.
        unsafe { self.data_ptr.add(self.position).write(v) };
        self.position += 1;
    }

    /// Appends a little-endian `u16`.
    pub fn emit_u16(&mut self, v: u16) {
        for b in v.to_le_bytes() {
            self.emit_u8(b);
        }
    }

    /// Appends a little-endian `u32`.
    pub fn emit_u32(&mut self, v: u32) {
        for b in v.to_le_bytes() {
            self.emit_u8(b);
        }
    }

    /// Appends a little-endian `u64`.
    pub fn emit_u64(&mut self, v: u64) {
        for b in v.to_le_bytes() {
            self.emit_u8(b);
        }
    }

    /// Reserves `width` bytes at the current position for later patching, advancing the cursor
    /// past them with zeroed placeholder bytes, and returns a [`Patch`] pinned to their absolute
    /// host address (spec.md §4.2 "the caller patches it once the target is known").
    pub fn reserve_patch(&mut self, width: u8) -> Patch {
        // SAFETY: caller has already called `ensure` to cover `width` bytes.
        let addr = unsafe { self.data_ptr.add(self.position) };
        for _ in 0..width {
            self.emit_u8(0);
        }
        Patch { addr, width }
    }

    /// Absolute host address of the byte immediately following the cursor's current position;
    /// used to compute `call`/`jmp rel32` displacements against "the instruction byte
    /// immediately past the operand" (spec.md §4.2).
    pub fn next_insn_addr(&self) -> *const u8 {
        // SAFETY: within the current exec block's extent.
        unsafe { self.data_ptr.add(self.position) }
    }

    /// Ends the current exec-block chain link without starting a new one; used once translation
    /// of a block completes, just before flushing the instruction cache over the chain
    /// (spec.md §4.6 `block_end_recompile`).
    pub fn finish(self) -> ExecBlockIdx {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_memory::MmapProvider;

    struct NoopRemover;
    impl crate::exec_memory::BlockRemover for NoopRemover {
        fn remove_block(&mut self, _: BlockIdx) {
            panic!("unexpected eviction in emitter unit tests");
        }
    }

    #[test]
    fn emit_u32_advances_position_by_four() {
        let mut pool = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut remover = NoopRemover;
        let head = pool.allocate(EXEC_INVALID, 1, &mut remover);
        let mut emitter = Emitter::new(&mut pool, 1, head);
        emitter.ensure(4, &mut remover);
        emitter.emit_u32(0xdead_beef);
        assert_eq!(emitter.position(), 4);
    }

    #[test]
    fn ensure_chains_into_new_block_near_limit() {
        let mut pool = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut remover = NoopRemover;
        let head = pool.allocate(EXEC_INVALID, 1, &mut remover);
        let mut emitter = Emitter::new(&mut pool, 1, head);
        // Fill up to just short of the reserve so the next `ensure` must allocate.
        emitter.ensure(EXEC_BLOCK_SIZE - JUMP_RESERVE, &mut remover);
        for _ in 0..(EXEC_BLOCK_SIZE - JUMP_RESERVE) {
            emitter.emit_u8(0x90);
        }
        let before = emitter.current_block();
        emitter.ensure(16, &mut remover);
        assert_ne!(emitter.current_block(), before, "should have chained to a new exec block");
        assert_eq!(emitter.position(), 0);
    }
}
