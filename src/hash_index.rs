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

//! Single-slot-per-bucket hash cache over guest physical addresses (spec.md §4.4, the other
//! half of component C4).
//!
//! This is a pure first-level cache: a miss or stale hit always falls back to the per-page
//! BST in [`crate::tree`], which is authoritative. The hash table just remembers the last
//! winner per bucket so repeated execution of the same block doesn't pay for a tree descent.

use crate::block::{BlockIdx, INVALID};
use crate::guest::Phys;

/// `HASH_SIZE = 0x20000` (spec.md §4.4).
pub const HASH_SIZE: usize = 0x20000;
const HASH_MASK: u32 = (HASH_SIZE - 1) as u32;

/// `hash(phys) = phys & HASH_MASK` (spec.md §4.4).
pub fn hash(phys: Phys) -> usize {
    (phys & HASH_MASK) as usize
}

/// The flat `hash_table[h]` array of candidate block indices.
pub struct HashIndex {
    table: Vec<BlockIdx>,
}

impl HashIndex {
    pub fn new() -> Self {
        HashIndex {
            table: vec![INVALID; HASH_SIZE],
        }
    }

    /// Returns the candidate block for `phys`'s bucket (may be stale or `INVALID`).
    pub fn candidate(&self, phys: Phys) -> BlockIdx {
        self.table[hash(phys)]
    }

    /// Records `block` as the winner for `phys`'s bucket, after a tree hit (spec.md §4.4 "on a
    /// tree hit, the hash is updated to the new winner").
    pub fn set(&mut self, phys: Phys, block: BlockIdx) {
        self.table[hash(phys)] = block;
    }

    /// Clears every bucket currently pointing at `block`. Called when a block is deleted so a
    /// stale hash entry can't resurrect a freed descriptor (the tree lookup would fail safely
    /// too, since the slot is re-keyed on reuse, but a flush should not leave dangling winners
    /// around for long-lived diagnostics). Callers pass the physical address when they have it
    /// (see [`HashIndex::invalidate_phys`]); this scans every bucket for the cases where only the
    /// block index is known (e.g. a full [`crate::block_pool::BlockPool::flush_all`] sweep).
    pub fn invalidate(&mut self, block: BlockIdx) {
        for slot in self.table.iter_mut() {
            if *slot == block {
                *slot = INVALID;
            }
        }
    }

    /// Clears the bucket for `phys` unconditionally (cheap path used when the physical address
    /// is already at hand, e.g. during SMC flush of the page that owns it).
    pub fn invalidate_phys(&mut self, phys: Phys, block: BlockIdx) {
        let h = hash(phys);
        if self.table[h] == block {
            self.table[h] = INVALID;
        }
    }

    /// Invalidates every bucket (spec.md §6 `codegen_flush`).
    pub fn clear(&mut self) {
        for slot in self.table.iter_mut() {
            *slot = INVALID;
        }
    }
}
