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

//! Per-4-KiB-physical-page metadata (spec.md §3 "Page").
//!
//! A real guest's physical address space is sparse and mostly not code, so rather than
//! reserving one [`Page`] per possible physical page up front (which the original C code does
//! via a flat array sized to all of guest RAM), this keeps a `HashMap` keyed by page number and
//! creates entries lazily the first time a page hosts compiled code or takes a tracked write.

use crate::block::INVALID;
use crate::guest::Phys;
use hashbrown::HashMap;

/// One 4 KiB byte-granularity mask region's worth of bits (spec.md §4.5 "Fine (byte)").
const BYTE_MASK_WORDS: usize = 4096 / 64;

/// Per-page metadata required by the block index and SMC coherence protocol (spec.md §3).
#[derive(Debug, Clone)]
pub struct Page {
    /// Root of the BST of blocks whose primary page is this page.
    pub head_tree: crate::block::BlockIdx,
    /// Doubly-linked list roots of blocks touching this page as page 1 / page 2.
    pub list_head1: crate::block::BlockIdx,
    pub list_head2: crate::block::BlockIdx,
    /// Bit `i` set iff any resident block's bytes intersect 64-byte sub-region `i`.
    pub code_present_mask: u64,
    /// Bit `i` set when a guest write hit sub-region `i` since the last clear.
    pub dirty_mask: u64,
    /// Byte-granularity variant of `code_present_mask`, for blocks flagged `BYTE_MASK`.
    pub byte_code_present_mask: [u64; BYTE_MASK_WORDS],
    /// Byte-granularity variant of `dirty_mask`.
    pub byte_dirty_mask: [u64; BYTE_MASK_WORDS],
}

impl Default for Page {
    fn default() -> Self {
        Page {
            head_tree: INVALID,
            list_head1: INVALID,
            list_head2: INVALID,
            code_present_mask: 0,
            dirty_mask: 0,
            byte_code_present_mask: [0; BYTE_MASK_WORDS],
            byte_dirty_mask: [0; BYTE_MASK_WORDS],
        }
    }
}

impl Page {
    /// Whether this page currently hosts no compiled code and has no pending dirty bits,
    /// and so can be dropped from the table.
    fn is_empty(&self) -> bool {
        self.head_tree == INVALID
            && self.list_head1 == INVALID
            && self.list_head2 == INVALID
            && self.code_present_mask == 0
            && self.dirty_mask == 0
            && self.byte_code_present_mask.iter().all(|&w| w == 0)
    }
}

/// Page number (physical address shifted right by 12).
pub type PageNumber = u32;

/// Converts a physical address to its page number.
pub fn page_number(phys: Phys) -> PageNumber {
    phys >> 12
}

/// The sparse collection of all [`Page`]s that currently have metadata worth tracking
/// (spec.md §3 "Page ... lives as long as the physical page exists in the guest address
/// space").
#[derive(Debug, Default)]
pub struct PageTable {
    pages: HashMap<PageNumber, Page>,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable { pages: HashMap::new() }
    }

    /// Returns the page for `phys`, creating an empty one if it doesn't exist yet.
    pub fn get_or_create(&mut self, phys: Phys) -> &mut Page {
        self.pages.entry(page_number(phys)).or_insert_with(Page::default)
    }

    /// Returns the page for `phys` if it has ever been touched.
    pub fn get(&self, phys: Phys) -> Option<&Page> {
        self.pages.get(&page_number(phys))
    }

    /// Returns the page for `phys` mutably, if it has ever been touched.
    pub fn get_mut(&mut self, phys: Phys) -> Option<&mut Page> {
        self.pages.get_mut(&page_number(phys))
    }

    /// Drops a page's metadata once it no longer tracks any block or dirty bit. Called after
    /// block removal so the table doesn't grow unboundedly over a long-running guest.
    pub fn compact(&mut self, phys: Phys) {
        let key = page_number(phys);
        if let Some(page) = self.pages.get(&key) {
            if page.is_empty() {
                self.pages.remove(&key);
            }
        }
    }

    /// Number of pages currently tracked. Exposed for tests/diagnostics.
    pub fn len(&self) -> usize {
        self.pages.len()
    }
}
