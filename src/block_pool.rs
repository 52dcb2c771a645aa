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

//! Block storage and free list (spec.md §4.3, component C3).
//!
//! A fixed array of [`CodeBlock`]s acts as an arena, index [`INVALID`] reserved as the sentinel.
//! All cross-references -- the free list, the per-page BST, and the per-page doubly-linked
//! lists -- are 16-bit indices into this same array (spec.md §9 "Pointer graphs → index
//! arenas"), which is what makes [`BlockPool::delete_block`] O(1) regardless of where the block
//! sits in either graph.

use crate::block::{BlockFlags, BlockIdx, CodeBlock, INVALID, PC_INVALID};
use crate::exec_memory::{BlockRemover, ExecMemoryPool};
use crate::guest::Phys;
use crate::hash_index::HashIndex;
use crate::page::PageTable;
use crate::tree;
use rand::Rng;

/// The fixed [`CodeBlock`] arena plus its free list (spec.md §3 "codeblock\[BLOCK_SIZE\]").
pub struct BlockPool {
    blocks: Vec<CodeBlock>,
    free_list: BlockIdx,
    /// Head of the "dirty list": blocks flagged `IN_DIRTY_LIST` (spec.md §4.3
    /// `purge_purgable_list`). Threaded through `page_list_next1`, since a dirty-listed block's
    /// ordinary page-list membership and dirty-list membership are mutually exclusive phases of
    /// its life (a block is unlinked from its page list before being dirty-listed).
    dirty_list: BlockIdx,
    rng: rand::rngs::SmallRng,
}

impl BlockPool {
    /// Reserves `n` descriptors, `0` permanently sentinel (spec.md §4.3, §3).
    pub fn new(n: usize) -> Self {
        assert!(n >= 2, "need at least 2 block descriptors (index 0 is reserved)");
        let mut blocks = Vec::with_capacity(n);
        blocks.push(CodeBlock::empty()); // index 0: BLOCK_INVALID sentinel, never allocated.
        for _ in 1..n {
            blocks.push(CodeBlock::empty());
        }
        let mut pool = BlockPool {
            blocks,
            free_list: INVALID,
            dirty_list: INVALID,
            rng: rand::SeedableRng::from_entropy(),
        };
        // Thread the free list 1..n using `tree_left` as the link field (a free descriptor has
        // no tree membership, so this field is otherwise unused).
        for i in (1..n).rev() {
            pool.blocks[i].tree_left = pool.free_list;
            pool.free_list = i as BlockIdx;
        }
        pool
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len() - 1
    }

    pub fn get(&self, idx: BlockIdx) -> &CodeBlock {
        &self.blocks[idx as usize]
    }

    pub fn get_mut(&mut self, idx: BlockIdx) -> &mut CodeBlock {
        &mut self.blocks[idx as usize]
    }

    pub fn blocks_mut(&mut self) -> &mut [CodeBlock] {
        &mut self.blocks
    }

    pub fn blocks(&self) -> &[CodeBlock] {
        &self.blocks
    }

    #[cfg(test)]
    fn free_list_len(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_list;
        while cur != INVALID {
            count += 1;
            cur = self.blocks[cur as usize].tree_left;
        }
        count
    }

    /// Unlinks a descriptor from the free list and clears it, forcing room via
    /// [`BlockPool::evict_for_descriptor`] first if the pool is fully occupied (spec.md §4.3
    /// `new_block`, §7 "Out of block descriptors | Block free list empty |
    /// `delete_random_block` until a descriptor frees").
    ///
    /// A guest that marks many blocks without ever promoting them to `WAS_RECOMPILED` holds a
    /// descriptor per marked block while owning no exec-memory chain, so the descriptor pool can
    /// run dry well before the exec-memory arena does; that case never reaches
    /// [`ExecMemoryPool::allocate`]'s own forced eviction, so it needs this separate recovery
    /// path rather than surfacing as a panic.
    pub fn new_block(&mut self, pages: &mut PageTable, hash: &mut HashIndex, exec: &mut ExecMemoryPool) -> BlockIdx {
        if self.free_list == INVALID {
            self.evict_for_descriptor(pages, hash, exec);
        }
        let idx = self.free_list;
        self.free_list = self.blocks[idx as usize].tree_left;
        self.blocks[idx as usize] = CodeBlock::empty();
        self.blocks[idx as usize].flags.remove(BlockFlags::IN_FREE_LIST);
        idx
    }

    fn push_free(&mut self, idx: BlockIdx) {
        self.blocks[idx as usize] = CodeBlock::empty();
        self.blocks[idx as usize].tree_left = self.free_list;
        self.free_list = idx;
    }

    /// Unlinks `idx` from the doubly-linked list rooted at `page.list_head1`/`list_head2`
    /// (selected by `primary`).
    fn unlink_page_list(&mut self, idx: BlockIdx, pages: &mut PageTable, phys: Phys, primary: bool) {
        let page = match pages.get_mut(phys) {
            Some(p) => p,
            None => return,
        };
        let (prev, next) = if primary {
            (self.blocks[idx as usize].page_list_prev1, self.blocks[idx as usize].page_list_next1)
        } else {
            (self.blocks[idx as usize].page_list_prev2, self.blocks[idx as usize].page_list_next2)
        };
        if prev != INVALID {
            if primary {
                self.blocks[prev as usize].page_list_next1 = next;
            } else {
                self.blocks[prev as usize].page_list_next2 = next;
            }
        } else if primary {
            page.list_head1 = next;
        } else {
            page.list_head2 = next;
        }
        if next != INVALID {
            if primary {
                self.blocks[next as usize].page_list_prev1 = prev;
            } else {
                self.blocks[next as usize].page_list_prev2 = prev;
            }
        }
        pages.compact(phys);
    }

    /// Splices `idx` onto the head of `phys`'s page-list (selected by `primary`), creating the
    /// page's metadata if this is the first block to touch it.
    pub fn link_page_list(&mut self, idx: BlockIdx, pages: &mut PageTable, phys: Phys, primary: bool) {
        let page = pages.get_or_create(phys);
        let old_head = if primary { page.list_head1 } else { page.list_head2 };
        if primary {
            page.list_head1 = idx;
            self.blocks[idx as usize].page_list_prev1 = INVALID;
            self.blocks[idx as usize].page_list_next1 = old_head;
        } else {
            page.list_head2 = idx;
            self.blocks[idx as usize].page_list_prev2 = INVALID;
            self.blocks[idx as usize].page_list_next2 = old_head;
        }
        if old_head != INVALID {
            if primary {
                self.blocks[old_head as usize].page_list_prev1 = idx;
            } else {
                self.blocks[old_head as usize].page_list_prev2 = idx;
            }
        }
    }

    /// Removes `idx` from its BST, both page lists, frees its exec-memory chain, and returns it
    /// to the free list (spec.md §4.3 `delete_block`).
    pub fn delete_block(&mut self, idx: BlockIdx, pages: &mut PageTable, hash: &mut HashIndex, exec: &mut ExecMemoryPool) {
        if idx == INVALID || self.blocks[idx as usize].start_pc == PC_INVALID {
            return; // already free; forced-eviction races with an explicit flush can double-delete.
        }

        let phys = self.blocks[idx as usize].phys;
        let phys2 = self.blocks[idx as usize].phys2;
        let has_page2 = self.blocks[idx as usize].flags.contains(BlockFlags::HAS_PAGE2);
        let in_dirty_list = self.blocks[idx as usize].flags.contains(BlockFlags::IN_DIRTY_LIST);

        if in_dirty_list {
            self.unlink_dirty_list(idx);
        } else {
            if let Some(page) = pages.get_mut(phys) {
                let mut root = page.head_tree;
                tree::delete(&mut self.blocks, &mut root, idx);
                page.head_tree = root;
            }
            self.unlink_page_list(idx, pages, phys, true);
            if has_page2 {
                self.unlink_page_list(idx, pages, phys2, false);
            }
        }

        hash.invalidate_phys(phys, idx);
        if has_page2 {
            hash.invalidate_phys(phys2, idx);
        }

        let head_exec = self.blocks[idx as usize].head_exec_block;
        exec.free(head_exec);

        log::debug!("block {} at phys {:#x} deleted", idx, phys);
        self.push_free(idx);
    }

    /// Unlinks `idx` from its page's BST and both page lists, then links it into the dirty list
    /// instead of freeing it outright (spec.md §4.5 "survives a flush ... reverts to 'marked but
    /// not compiled'"; §4.3 `purge_purgable_list`'s input set). Used by [`crate::smc`] when a
    /// flush hits a block that may still be recompiled imminently, rather than deleting it.
    pub fn move_to_dirty_list(&mut self, idx: BlockIdx, pages: &mut PageTable) {
        let phys = self.blocks[idx as usize].phys;
        let phys2 = self.blocks[idx as usize].phys2;
        let has_page2 = self.blocks[idx as usize].flags.contains(BlockFlags::HAS_PAGE2);

        if let Some(page) = pages.get_mut(phys) {
            let mut root = page.head_tree;
            tree::delete(&mut self.blocks, &mut root, idx);
            page.head_tree = root;
        }
        self.unlink_page_list(idx, pages, phys, true);
        if has_page2 {
            self.unlink_page_list(idx, pages, phys2, false);
        }

        self.blocks[idx as usize].flags.insert(BlockFlags::IN_DIRTY_LIST);
        self.blocks[idx as usize].flags.remove(BlockFlags::WAS_RECOMPILED);
        self.blocks[idx as usize].page_list_next1 = self.dirty_list;
        self.blocks[idx as usize].page_list_prev1 = INVALID;
        if self.dirty_list != INVALID {
            self.blocks[self.dirty_list as usize].page_list_prev1 = idx;
        }
        self.dirty_list = idx;
    }

    fn unlink_dirty_list(&mut self, idx: BlockIdx) {
        let prev = self.blocks[idx as usize].page_list_prev1;
        let next = self.blocks[idx as usize].page_list_next1;
        if prev != INVALID {
            self.blocks[prev as usize].page_list_next1 = next;
        } else {
            self.dirty_list = next;
        }
        if next != INVALID {
            self.blocks[next as usize].page_list_prev1 = prev;
        }
        self.blocks[idx as usize].flags.remove(BlockFlags::IN_DIRTY_LIST);
    }

    /// Walks the dirty list, deleting every block that hasn't been recompiled since it was
    /// flushed (spec.md §4.3 `purge_purgable_list`).
    pub fn purge_purgable_list(&mut self, pages: &mut PageTable, hash: &mut HashIndex, exec: &mut ExecMemoryPool) {
        let mut cur = self.dirty_list;
        while cur != INVALID {
            let next = self.blocks[cur as usize].page_list_next1;
            if !self.blocks[cur as usize].flags.contains(BlockFlags::WAS_RECOMPILED) {
                self.unlink_dirty_list(cur);
                self.delete_block(cur, pages, hash, exec);
            }
            cur = next;
        }
    }

    /// Forced-eviction recovery for an exhausted descriptor pool (spec.md §4.3
    /// `delete_random_block`, §7 "Out of block descriptors"): repeatedly deletes a uniformly
    /// random occupied block until at least one descriptor is free.
    ///
    /// This is the descriptor-pool analogue of [`ExecMemoryPool::allocate`]'s own forced
    /// eviction (spec.md §4.1), which already reclaims exec memory via the
    /// [`PoolRemover`]/[`BlockRemover`] callback and so needs no separate method here; this one
    /// exists because a descriptor can be exhausted independently of exec memory (see
    /// [`BlockPool::new_block`]'s doc comment).
    fn evict_for_descriptor(&mut self, pages: &mut PageTable, hash: &mut HashIndex, exec: &mut ExecMemoryPool) {
        let capacity = self.blocks.len();
        let mut attempts: u64 = 0;
        while self.free_list == INVALID {
            attempts += 1;
            if attempts > 0 && attempts % 10_000 == 0 {
                log::warn!(
                    "forced block-descriptor eviction has made {} attempts without freeing one",
                    attempts
                );
            }
            let candidate = 1 + self.rng.gen_range(0, capacity - 1) as BlockIdx;
            if self.blocks[candidate as usize].start_pc != PC_INVALID {
                self.delete_block(candidate, pages, hash, exec);
            }
        }
    }

    /// Flushes every live block (spec.md §6 `codegen_flush`/`codegen_reset`).
    pub fn flush_all(&mut self, pages: &mut PageTable, hash: &mut HashIndex, exec: &mut ExecMemoryPool) {
        for idx in 1..self.blocks.len() as BlockIdx {
            if self.blocks[idx as usize].start_pc != PC_INVALID {
                self.delete_block(idx, pages, hash, exec);
            }
        }
        hash.clear();
    }
}

/// Adapter implementing [`BlockRemover`] over a `(BlockPool, PageTable, HashIndex, ExecMemoryPool)`
/// quartet, so [`ExecMemoryPool::allocate`] can force eviction without knowing about block
/// storage (spec.md §4.1 "This removal is invoked via a callback published by C3").
///
/// `exec` is a raw pointer rather than `&mut ExecMemoryPool` because the same pool is, by
/// construction, already mutably borrowed by the `allocate` call that invokes this callback
/// (spec.md §5 single-emulation-thread invariant guarantees no other access is concurrently in
/// flight; `allocate` itself never touches `self` again between invoking the remover and
/// returning). This mirrors the `FreeingRemover` pattern exercised by
/// `exec_memory::tests::forced_eviction_makes_progress_when_pool_exhausted`.
pub struct PoolRemover<'a> {
    pub blocks: &'a mut BlockPool,
    pub pages: &'a mut PageTable,
    pub hash: &'a mut HashIndex,
    pub exec: *mut ExecMemoryPool,
}

impl<'a> BlockRemover for PoolRemover<'a> {
    fn remove_block(&mut self, block: BlockIdx) {
        let phys = self.blocks.get(block).phys;
        let phys2 = self.blocks.get(block).phys2;
        let has_page2 = self.blocks.get(block).flags.contains(BlockFlags::HAS_PAGE2);
        let in_dirty_list = self.blocks.get(block).flags.contains(BlockFlags::IN_DIRTY_LIST);

        if in_dirty_list {
            self.blocks.unlink_dirty_list(block);
        } else {
            if let Some(page) = self.pages.get_mut(phys) {
                let mut root = page.head_tree;
                tree::delete(self.blocks.blocks_mut(), &mut root, block);
                page.head_tree = root;
            }
            self.blocks.unlink_page_list(block, self.pages, phys, true);
            if has_page2 {
                self.blocks.unlink_page_list(block, self.pages, phys2, false);
            }
        }
        self.hash.invalidate_phys(phys, block);
        if has_page2 {
            self.hash.invalidate_phys(phys2, block);
        }

        let head_exec = self.blocks.get(block).head_exec_block;
        // SAFETY: see struct doc comment -- the pool this points to is not otherwise accessed
        // for the duration of the `allocate` call that invoked this callback.
        unsafe { (*self.exec).free(head_exec) };

        self.blocks.push_free(block);
    }
}
