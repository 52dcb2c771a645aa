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

//! Self-modifying-code coherence protocol (spec.md §4.5, component C5).
//!
//! Two granularities of per-page bitmask coexist because code and data often share a page: the
//! coarse 64-byte masks used by most blocks, and a fine byte mask a block escalates to once it
//! has already been flushed while dirty-listed (spec.md §4.5, SPEC_FULL.md §3 "escalation is
//! triggered specifically by a dirty-list flush").

use crate::block::{BlockFlags, BlockIdx, INVALID};
use crate::block_pool::BlockPool;
use crate::exec_memory::ExecMemoryPool;
use crate::guest::Phys;
use crate::hash_index::HashIndex;
use crate::page::{Page, PageTable};

/// Number of guest bytes one bit of the coarse mask covers (spec.md §4.5 "Coarse (64-byte)").
pub const COARSE_GRANULARITY: u32 = 64;

/// Sets the bits in `block`'s `page_mask`(s) and the owning page's `code_present_mask`(s) for
/// every byte `[start_pc, start_pc + length)` covers (spec.md §4.5 `mark_code_present`).
///
/// `start_pc` and `length` are linear addresses/byte counts; the caller has already resolved
/// `phys`/`phys2` for the one or two pages the range touches. A block whose range is entirely
/// within the primary page leaves `page_mask2` at zero.
pub fn mark_code_present(
    pool: &mut BlockPool,
    pages: &mut PageTable,
    block: BlockIdx,
    phys: Phys,
    phys2: Option<Phys>,
    byte_offset_in_page: u32,
    length: u32,
) {
    let byte_mask = pool.get(block).flags.contains(BlockFlags::BYTE_MASK);
    let page_size = 4096u32;
    let first_page_len = (page_size - byte_offset_in_page).min(length);

    let mask1 = region_mask(byte_offset_in_page, first_page_len);
    {
        let page = pages.get_or_create(phys);
        apply_present(page, mask1, byte_mask);
    }
    pool.get_mut(block).page_mask1 |= mask1;

    let remaining = length - first_page_len;
    if remaining > 0 {
        let phys2 = phys2.expect("range crosses a page boundary but no second page was supplied");
        let mask2 = region_mask(0, remaining);
        {
            let page = pages.get_or_create(phys2);
            apply_present(page, mask2, byte_mask);
        }
        pool.get_mut(block).page_mask2 |= mask2;
    }
}

/// The 64-bit coarse region mask covering `[offset, offset+len)` within one page, one bit per
/// [`COARSE_GRANULARITY`]-byte sub-region. Used as-is for `code_present_mask`/`dirty_mask`
/// regardless of a block's byte-mask flag: a byte-granularity block still records which coarse
/// sub-region(s) its bytes fall into here, so the ordinary dirty-mask intersection test in
/// `candidate_is_stale` keeps working unchanged; the fine, byte-precise bitmap lives separately
/// in `Page::byte_code_present_mask`/`byte_dirty_mask` and is maintained by
/// `apply_present`/`write_ram_page`.
fn region_mask(offset: u32, len: u32) -> u64 {
    if len == 0 {
        return 0;
    }
    let first_bit = offset / COARSE_GRANULARITY;
    let last_bit = (offset + len - 1) / COARSE_GRANULARITY;
    let mut mask = 0u64;
    for bit in first_bit..=last_bit {
        mask |= 1u64 << (bit & 63);
    }
    mask
}

fn apply_present(page: &mut Page, coarse_mask: u64, byte_mask: bool) {
    page.code_present_mask |= coarse_mask;
    if byte_mask {
        for word in 0..page.byte_code_present_mask.len() {
            if coarse_mask & (1u64 << word) != 0 {
                page.byte_code_present_mask[word] = u64::max_value();
            }
        }
    }
}

/// Routes a guest write through the dirty-mask protocol (spec.md §4.5 "Guest writes route
/// through specialised `write_ram_page` entry points that ... OR the target sub-region's bit
/// into the page's `dirty_mask`").
///
/// `offset_in_page` and `len` describe the write's extent within the 4 KiB page at `phys`.
/// Returns `true` iff the page had any code present at all (callers may skip calling this for
/// pages known never to have hosted code, as the original does via `writelookup2` eviction).
pub fn write_ram_page(pages: &mut PageTable, phys: Phys, offset_in_page: u32, len: u32) -> bool {
    let page = match pages.get_mut(phys) {
        Some(p) => p,
        None => return false,
    };
    if page.code_present_mask == 0 && page.byte_code_present_mask.iter().all(|&w| w == 0) {
        return false;
    }

    let coarse = region_mask(offset_in_page, len);
    page.dirty_mask |= coarse & page.code_present_mask;

    let byte_first = offset_in_page;
    let byte_last = offset_in_page + len - 1;
    for byte in byte_first..=byte_last {
        let word = (byte / 64) as usize;
        let bit = byte % 64;
        if page.byte_code_present_mask[word] & (1u64 << bit) != 0 {
            page.byte_dirty_mask[word] |= 1u64 << bit;
        }
    }
    true
}

/// Outcome of validating a candidate block against the live SMC/FPU state (spec.md §4.4/§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// The block is still good to execute as-is.
    Valid,
    /// The block was flushed (and possibly deleted); the dispatcher must re-run lookup/translate.
    Flushed,
}

/// Checks `block`'s primary (and, if present, secondary) page against the live dirty masks and
/// flushes affected blocks if they intersect (spec.md §4.5 "When the dispatcher validates a
/// candidate block, if `block.page_mask & *block.dirty_mask_ptr` is non-zero, it calls
/// `check_flush`").
///
/// `phys2_current`, when `Some`, is the physical address the block's second page *currently*
/// maps to (re-derived via `get_phys_noabrt` by the caller); a mismatch against the block's
/// recorded `phys2` is the "two-page physical-address drift" check from SPEC_FULL.md §3 and is
/// treated the same as a dirty-mask hit.
pub fn validate_block(
    pool: &mut BlockPool,
    pages: &mut PageTable,
    hash: &mut HashIndex,
    exec: &mut ExecMemoryPool,
    block: BlockIdx,
    phys2_current: Option<Phys>,
) -> Validity {
    let phys = pool.get(block).phys;
    let phys2 = pool.get(block).phys2;
    let has_page2 = pool.get(block).flags.contains(BlockFlags::HAS_PAGE2);
    let mask1 = pool.get(block).page_mask1;
    let mask2 = pool.get(block).page_mask2;

    let mut must_flush = false;

    if let Some(page) = pages.get(phys) {
        if mask1 & page.dirty_mask != 0 {
            must_flush = true;
        }
    }

    if has_page2 {
        if let Some(current) = phys2_current {
            // phys addresses are page-aligned comparisons at the 4 KiB granularity; a changed
            // page number means the mapping drifted even if the dirty mask itself is clean
            // (SPEC_FULL.md §3 "Two-page physical-address drift check").
            if (current ^ phys2) & !0xfff != 0 {
                must_flush = true;
            }
        }
        if !must_flush {
            if let Some(page) = pages.get(phys2) {
                if mask2 & page.dirty_mask != 0 {
                    must_flush = true;
                }
            }
        }
    }

    if !must_flush {
        return Validity::Valid;
    }

    if let Some(page) = pages.get_mut(phys) {
        let dirty = page.dirty_mask;
        check_flush_page(pool, pages, hash, exec, phys, dirty);
    }
    if has_page2 {
        if let Some(page) = pages.get_mut(phys2) {
            let dirty = page.dirty_mask;
            check_flush_page(pool, pages, hash, exec, phys2, dirty);
        }
    }

    Validity::Flushed
}

/// Walks `phys`'s page block list, deleting (or dirty-listing) every block whose mask
/// intersects `dirty_mask`, then clears the page's dirty mask (spec.md §4.5 `check_flush`,
/// external interface `codegen_check_flush`).
pub fn check_flush_page(
    pool: &mut BlockPool,
    pages: &mut PageTable,
    hash: &mut HashIndex,
    exec: &mut ExecMemoryPool,
    phys: Phys,
    dirty_mask: u64,
) {
    let (mut cur1, mut cur2) = match pages.get(phys) {
        Some(page) => (page.list_head1, page.list_head2),
        None => return,
    };

    let mut victims = Vec::new();
    while cur1 != INVALID {
        let next = pool.get(cur1).page_list_next1;
        if pool.get(cur1).page_mask1 & dirty_mask != 0 {
            victims.push(cur1);
        }
        cur1 = next;
    }
    while cur2 != INVALID {
        let next = pool.get(cur2).page_list_next2;
        if pool.get(cur2).page_mask2 & dirty_mask != 0 && !victims.contains(&cur2) {
            victims.push(cur2);
        }
        cur2 = next;
    }

    for victim in victims {
        flush_one(pool, pages, hash, exec, victim);
    }

    if let Some(page) = pages.get_mut(phys) {
        page.dirty_mask = 0;
        for word in page.byte_dirty_mask.iter_mut() {
            *word = 0;
        }
    }
}

/// Flushes a single victim block: deletes it outright unless it was actually compiled, in which
/// case it survives as a dirty-listed, demoted "marked" block so it can be re-observed and
/// recompiled in place (spec.md §4.5 "Policy detail").
fn flush_one(
    pool: &mut BlockPool,
    pages: &mut PageTable,
    hash: &mut HashIndex,
    exec: &mut ExecMemoryPool,
    block: BlockIdx,
) {
    let was_recompiled = pool.get(block).flags.contains(BlockFlags::WAS_RECOMPILED);
    if !was_recompiled {
        hash.invalidate_phys(pool.get(block).phys, block);
        if pool.get(block).flags.contains(BlockFlags::HAS_PAGE2) {
            let phys2 = pool.get(block).phys2;
            hash.invalidate_phys(phys2, block);
        }
        pool.delete_block(block, pages, hash, exec);
        return;
    }

    log::debug!("block {} demoted by SMC flush", block);
    hash.invalidate_phys(pool.get(block).phys, block);
    if pool.get(block).flags.contains(BlockFlags::HAS_PAGE2) {
        let phys2 = pool.get(block).phys2;
        hash.invalidate_phys(phys2, block);
    }

    pool.move_to_dirty_list(block, pages);
    let b = pool.get_mut(block);
    b.flags.remove(BlockFlags::WAS_RECOMPILED);

    // Escalation: a block that was already byte-granular escalates to forbidding inlined
    // immediates; a coarse block escalates to byte granularity (spec.md §4.5 "A block that is
    // flushed then re-created with BYTE_MASK already set escalates to NO_IMMEDIATES").
    if b.flags.contains(BlockFlags::IN_DIRTY_LIST) {
        if b.flags.contains(BlockFlags::BYTE_MASK) {
            b.flags.insert(BlockFlags::NO_IMMEDIATES);
        } else {
            b.flags.insert(BlockFlags::BYTE_MASK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_memory::{ExecMemoryPool, MmapProvider};
    use crate::tree;

    fn setup() -> (BlockPool, PageTable, HashIndex, ExecMemoryPool) {
        let pool = BlockPool::new(8);
        let pages = PageTable::new();
        let hash = HashIndex::new();
        let exec = ExecMemoryPool::new(&mut MmapProvider, 8).unwrap();
        (pool, pages, hash, exec)
    }

    fn install(
        pool: &mut BlockPool,
        pages: &mut PageTable,
        hash: &mut HashIndex,
        exec: &mut ExecMemoryPool,
        phys: Phys,
    ) -> BlockIdx {
        let idx = pool.new_block(pages, hash, exec);
        {
            let b = pool.get_mut(idx);
            b.start_pc = phys;
            b.phys = phys;
        }
        let page = pages.get_or_create(phys);
        let mut root = page.head_tree;
        tree::insert(pool.blocks_mut(), &mut root, idx);
        pages.get_or_create(phys).head_tree = root;
        pool.link_page_list(idx, pages, phys, true);
        hash.set(phys, idx);
        idx
    }

    #[test]
    fn mark_then_write_sets_intersecting_dirty_bit() {
        let (mut pool, mut pages, mut hash, mut exec) = setup();
        let block = install(&mut pool, &mut pages, &mut hash, &mut exec, 0x1000);
        mark_code_present(&mut pool, &mut pages, block, 0x1000, None, 0, 5);
        assert_eq!(pool.get(block).page_mask1, 1);

        write_ram_page(&mut pages, 0x1000, 0, 1);
        assert_eq!(pages.get(0x1000).unwrap().dirty_mask, 1);
    }

    #[test]
    fn write_outside_code_present_region_does_not_dirty() {
        let (mut pool, mut pages, mut hash, mut exec) = setup();
        let block = install(&mut pool, &mut pages, &mut hash, &mut exec, 0x1000);
        mark_code_present(&mut pool, &mut pages, block, 0x1000, None, 0, 5);

        write_ram_page(&mut pages, 0x1000, 200, 4);
        assert_eq!(pages.get(0x1000).unwrap().dirty_mask, 0);
    }

    #[test]
    fn validate_block_flushes_on_dirty_intersection() {
        let (mut pool, mut pages, mut hash, mut exec) = setup();
        let block = install(&mut pool, &mut pages, &mut hash, &mut exec, 0x2000);
        mark_code_present(&mut pool, &mut pages, block, 0x2000, None, 0, 5);
        write_ram_page(&mut pages, 0x2000, 0, 1);

        let v = validate_block(&mut pool, &mut pages, &mut hash, &mut exec, block, None);
        assert_eq!(v, Validity::Flushed);
        assert_eq!(pool.get(block).start_pc, crate::block::PC_INVALID);
    }

    #[test]
    fn flush_demotes_recompiled_block_instead_of_deleting() {
        let (mut pool, mut pages, mut hash, mut exec) = setup();
        let block = install(&mut pool, &mut pages, &mut hash, &mut exec, 0x3000);
        mark_code_present(&mut pool, &mut pages, block, 0x3000, None, 0, 5);
        pool.get_mut(block).flags.insert(BlockFlags::WAS_RECOMPILED);
        write_ram_page(&mut pages, 0x3000, 0, 1);

        let dirty = pages.get(0x3000).unwrap().dirty_mask;
        check_flush_page(&mut pool, &mut pages, &mut hash, &mut exec, 0x3000, dirty);

        assert_ne!(pool.get(block).start_pc, crate::block::PC_INVALID, "survives as dirty-listed");
        assert!(!pool.get(block).flags.contains(BlockFlags::WAS_RECOMPILED));
        assert!(pool.get(block).flags.contains(BlockFlags::BYTE_MASK), "escalates to byte granularity");
    }

    #[test]
    fn two_page_block_flushed_via_secondary_page() {
        // spec.md §8 scenario E: an instruction straddling a page boundary must be flushed when
        // its *second* page is dirtied, even though `start_pc`/`phys` name only the first page.
        let (mut pool, mut pages, mut hash, mut exec) = setup();
        let block = install(&mut pool, &mut pages, &mut hash, &mut exec, 0x1f000);
        {
            let b = pool.get_mut(block);
            b.phys2 = 0x20000;
            b.flags.insert(BlockFlags::HAS_PAGE2);
        }
        mark_code_present(&mut pool, &mut pages, block, 0x1f000, Some(0x20000), 4095, 2);
        pool.link_page_list(block, &mut pages, 0x20000, false);

        assert_ne!(pool.get(block).page_mask2, 0);
        write_ram_page(&mut pages, 0x20000, 0, 1);

        let v = validate_block(&mut pool, &mut pages, &mut hash, &mut exec, block, Some(0x20000));
        assert_eq!(v, Validity::Flushed, "dirtying the second page alone must flush the block");
        assert_eq!(pool.get(block).start_pc, crate::block::PC_INVALID);
    }

    #[test]
    fn second_escalation_sets_no_immediates() {
        let (mut pool, mut pages, mut hash, mut exec) = setup();
        let block = install(&mut pool, &mut pages, &mut hash, &mut exec, 0x4000);
        pool.get_mut(block).flags.insert(BlockFlags::BYTE_MASK);
        mark_code_present(&mut pool, &mut pages, block, 0x4000, None, 0, 5);
        pool.get_mut(block).flags.insert(BlockFlags::WAS_RECOMPILED);
        write_ram_page(&mut pages, 0x4000, 0, 1);

        let dirty = pages.get(0x4000).unwrap().dirty_mask;
        check_flush_page(&mut pool, &mut pages, &mut hash, &mut exec, 0x4000, dirty);

        assert!(pool.get(block).flags.contains(BlockFlags::NO_IMMEDIATES));
    }
}
