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

//! [`CodeBlock`], the unit of translation (spec.md §3).

use crate::guest::{Linear, Phys};
use crate::status::Status;

/// Index into the [`BlockPool`](crate::block_pool::BlockPool) arena. Index `0` is the
/// permanently-reserved `INVALID` sentinel (spec.md §4.3).
pub type BlockIdx = u16;

/// Reserved index meaning "no block" (spec.md §3 `phys`/tree-pointer sentinels, §4.3 `BLOCK_INVALID`).
pub const INVALID: BlockIdx = 0;

bitflags::bitflags! {
    /// [`CodeBlock::flags`] (spec.md §3).
    #[derive(Default)]
    pub struct BlockFlags: u16 {
        /// Block executes FPU instructions.
        const HAS_FPU = 1 << 0;
        /// Block was compiled assuming a specific FPU top-of-stack; re-validated against the
        /// live value at execution time (spec.md §4.7 supplement, SPEC_FULL.md §3).
        const STATIC_TOP = 1 << 1;
        /// Block has been compiled (as opposed to merely marked, spec.md §4.6).
        const WAS_RECOMPILED = 1 << 2;
        /// Block sits in the exec-memory allocator's / block pool's free list and is invalid.
        const IN_FREE_LIST = 1 << 3;
        /// Block has a valid second page (`phys2`/`dirty_mask_ptr2`).
        const HAS_PAGE2 = 1 << 4;
        /// Block uses byte-granularity dirty/code-present tracking rather than 64-byte.
        const BYTE_MASK = 1 << 5;
        /// Block is linked into a page's "dirty list" (purgeable, but not yet deleted).
        const IN_DIRTY_LIST = 1 << 6;
        /// Block must not inline immediate constants (may legitimately be rewritten by the guest).
        const NO_IMMEDIATES = 1 << 7;
    }
}

/// The unit of translation: a contiguous run of translated guest instructions with one entry
/// and one exit (spec.md §3, glossary).
#[derive(Debug, Clone)]
pub struct CodeBlock {
    /// Guest linear address where the block begins. [`Linear::max_value`]-equivalent sentinel
    /// (`PC_INVALID`) marks a free descriptor (spec.md §3).
    pub start_pc: Linear,
    /// Guest CS base at compile time; part of the block's identity.
    pub cs_base: u32,
    /// Primary physical page/address the block maps to.
    pub phys: Phys,
    /// Physical address of the block's second page, valid iff `flags.contains(HAS_PAGE2)`.
    pub phys2: Phys,
    /// Captured CPU-state bits that must match at execution time.
    pub status: Status,
    /// See [`BlockFlags`].
    pub flags: BlockFlags,
    /// FPU top-of-stack assumed at entry, valid iff `flags.contains(STATIC_TOP)`.
    pub top: u8,

    /// Parent in the owning page's BST (spec.md §4.3/§4.4), [`INVALID`] at the root.
    pub tree_parent: BlockIdx,
    /// Left child (smaller `cs_base | (phys << 32)` key).
    pub tree_left: BlockIdx,
    /// Right child (larger key).
    pub tree_right: BlockIdx,

    /// Index of the first exec-memory block backing this code block's compiled output.
    pub head_exec_block: crate::exec_memory::ExecBlockIdx,

    /// Bitmask of which 64-byte (or byte, under `BYTE_MASK`) sub-regions of the primary page
    /// this block's instruction bytes cover.
    pub page_mask1: u64,
    /// Same as `page_mask1`, for the second page.
    pub page_mask2: u64,

    /// Doubly-linked membership in the primary page's block list.
    pub page_list_prev1: BlockIdx,
    pub page_list_next1: BlockIdx,
    /// Doubly-linked membership in the secondary page's block list.
    pub page_list_prev2: BlockIdx,
    pub page_list_next2: BlockIdx,

    /// Total guest bytes spanned by every instruction translated into this block. The compiled
    /// stream never bakes its own PC update (unlike the baked cycle charge, spec.md §6
    /// `codegen_block_cycles`); the dispatcher instead replays this value onto the live PC after
    /// every real execution of the compiled code (SPEC_FULL.md §1 `Dynarec::exec`).
    pub total_len: u32,
}

/// Sentinel `start_pc` for a free (unused) descriptor (spec.md §3 `BLOCK_PC_INVALID`).
pub const PC_INVALID: Linear = u32::max_value();

impl CodeBlock {
    /// A cleared, free-list-resident descriptor.
    pub fn empty() -> Self {
        CodeBlock {
            start_pc: PC_INVALID,
            cs_base: 0,
            phys: 0,
            phys2: 0,
            status: Status::default(),
            flags: BlockFlags::IN_FREE_LIST,
            top: 0,
            tree_parent: INVALID,
            tree_left: INVALID,
            tree_right: INVALID,
            head_exec_block: crate::exec_memory::EXEC_INVALID,
            page_mask1: 0,
            page_mask2: 0,
            page_list_prev1: INVALID,
            page_list_next1: INVALID,
            page_list_prev2: INVALID,
            page_list_next2: INVALID,
            total_len: 0,
        }
    }

    /// The 64-bit BST ordering key for this block within its primary page (spec.md §3/§4.4).
    pub fn tree_key(&self) -> u64 {
        tree_key(self.cs_base, self.phys)
    }

    /// Whether `self` is a valid candidate for execution at `(cs_base, phys, status)`
    /// (spec.md §4.4). Does not consider SMC staleness or the FPU-top re-validation; callers
    /// combine this with [`crate::smc`] and the FPU check.
    pub fn identity_matches(&self, start_pc: Linear, cs_base: u32, phys: Phys, status: Status) -> bool {
        self.start_pc == start_pc
            && self.cs_base == cs_base
            && self.phys == phys
            && self.status.matches(status)
    }
}

/// Computes the BST ordering key `cs_base | (phys << 32)` (spec.md §3).
pub fn tree_key(cs_base: u32, phys: Phys) -> u64 {
    (cs_base as u64) | ((phys as u64) << 32)
}
