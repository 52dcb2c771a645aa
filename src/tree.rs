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

//! Per-page binary search tree over `cs_base | (phys << 32)` (spec.md §4.3/§4.4, component
//! half of C4).
//!
//! Unbalanced textbook BST on 64-bit keys. Ties (two blocks sharing a physical address but
//! differing in captured [`Status`](crate::status::Status)) are broken by always descending
//! right on an equal key, so same-key blocks form a chain searched in insertion order -- this
//! mirrors `codeblock_tree_find`/`codeblock_tree_add` in the original exactly, rather than
//! inventing a three-way key that the spec doesn't describe.

use crate::block::{CodeBlock, BlockIdx, INVALID};
use crate::status::Status;

/// Looks up a block matching `key` and `status` in the BST rooted at `root`.
///
/// Descends past same-key nodes whose status doesn't match the live one (spec.md §4.4: "the
/// BST orders them by the 64-bit key `cs_base | (phys << 32)`", with multiple blocks at one
/// physical address selected by status).
pub fn find(blocks: &[CodeBlock], root: BlockIdx, key: u64, status: Status) -> Option<BlockIdx> {
    let mut cur = root;
    while cur != INVALID {
        let node = &blocks[cur as usize];
        let node_key = node.tree_key();
        if key == node_key && node.status.matches(status) {
            return Some(cur);
        }
        cur = if key < node_key { node.tree_left } else { node.tree_right };
    }
    None
}

/// Inserts `new_idx` (whose fields are already populated) into the BST rooted at `*root`,
/// updating `*root` if the tree was empty.
pub fn insert(blocks: &mut [CodeBlock], root: &mut BlockIdx, new_idx: BlockIdx) {
    let new_key = blocks[new_idx as usize].tree_key();

    if *root == INVALID {
        *root = new_idx;
        let node = &mut blocks[new_idx as usize];
        node.tree_parent = INVALID;
        node.tree_left = INVALID;
        node.tree_right = INVALID;
        return;
    }

    let mut cur = *root;
    loop {
        let cur_key = blocks[cur as usize].tree_key();
        let go_left = new_key < cur_key;
        let next = if go_left {
            blocks[cur as usize].tree_left
        } else {
            blocks[cur as usize].tree_right
        };
        if next == INVALID {
            if go_left {
                blocks[cur as usize].tree_left = new_idx;
            } else {
                blocks[cur as usize].tree_right = new_idx;
            }
            let node = &mut blocks[new_idx as usize];
            node.tree_parent = cur;
            node.tree_left = INVALID;
            node.tree_right = INVALID;
            return;
        }
        cur = next;
    }
}

/// Replaces whichever of `parent`'s children equals `old` with `new` (or, if `parent ==
/// INVALID`, updates `*root` instead), matching `codeblock_tree_delete`'s re-parenting.
fn replace_child(blocks: &mut [CodeBlock], root: &mut BlockIdx, parent: BlockIdx, old: BlockIdx, new: BlockIdx) {
    if parent == INVALID {
        *root = new;
    } else {
        if blocks[parent as usize].tree_left == old {
            blocks[parent as usize].tree_left = new;
        }
        if blocks[parent as usize].tree_right == old {
            blocks[parent as usize].tree_right = new;
        }
    }
    if new != INVALID {
        blocks[new as usize].tree_parent = parent;
    }
}

/// Removes `idx` from the BST rooted at `*root` (spec.md §4.3 "Deletion uses the 'replace with
/// in-order successor from the right subtree' rule and re-parents children; the routine must
/// re-root the page when the deleted node is the root").
pub fn delete(blocks: &mut [CodeBlock], root: &mut BlockIdx, idx: BlockIdx) {
    let parent = blocks[idx as usize].tree_parent;
    let left = blocks[idx as usize].tree_left;
    let right = blocks[idx as usize].tree_right;

    if left == INVALID && right == INVALID {
        replace_child(blocks, root, parent, idx, INVALID);
    } else if left == INVALID {
        replace_child(blocks, root, parent, idx, right);
    } else if right == INVALID {
        replace_child(blocks, root, parent, idx, left);
    } else {
        // Two children: successor is the leftmost node of the right subtree.
        let mut successor = right;
        while blocks[successor as usize].tree_left != INVALID {
            successor = blocks[successor as usize].tree_left;
        }
        let successor_parent = blocks[successor as usize].tree_parent;
        let successor_right = blocks[successor as usize].tree_right;

        if successor_parent != idx {
            // Detach successor from its current parent's left slot, splice its right child in.
            blocks[successor_parent as usize].tree_left = successor_right;
            if successor_right != INVALID {
                blocks[successor_right as usize].tree_parent = successor_parent;
            }
            blocks[successor as usize].tree_right = right;
            blocks[right as usize].tree_parent = successor;
        }

        blocks[successor as usize].tree_left = left;
        blocks[left as usize].tree_parent = successor;

        replace_child(blocks, root, parent, idx, successor);
    }

    let node = &mut blocks[idx as usize];
    node.tree_parent = INVALID;
    node.tree_left = INVALID;
    node.tree_right = INVALID;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CodeBlock;

    fn new_blocks(n: usize) -> Vec<CodeBlock> {
        (0..n).map(|_| CodeBlock::empty()).collect()
    }

    fn set_identity(blocks: &mut [CodeBlock], idx: BlockIdx, cs_base: u32, phys: u32) {
        blocks[idx as usize].cs_base = cs_base;
        blocks[idx as usize].phys = phys;
        blocks[idx as usize].status = Status(0);
    }

    #[test]
    fn insert_then_find_round_trips() {
        let mut blocks = new_blocks(8);
        let mut root = INVALID;
        for (i, phys) in [0x1000u32, 0x2000, 0x500, 0x8000].iter().enumerate() {
            set_identity(&mut blocks, (i + 1) as BlockIdx, 0, *phys);
            insert(&mut blocks, &mut root, (i + 1) as BlockIdx);
        }
        for (i, phys) in [0x1000u32, 0x2000, 0x500, 0x8000].iter().enumerate() {
            let key = crate::block::tree_key(0, *phys);
            assert_eq!(find(&blocks, root, key, Status(0)), Some((i + 1) as BlockIdx));
        }
    }

    #[test]
    fn delete_leaf_detaches_cleanly() {
        let mut blocks = new_blocks(4);
        let mut root = INVALID;
        set_identity(&mut blocks, 1, 0, 10);
        insert(&mut blocks, &mut root, 1);
        set_identity(&mut blocks, 2, 0, 20);
        insert(&mut blocks, &mut root, 2);
        delete(&mut blocks, &mut root, 2);
        assert_eq!(blocks[1].tree_right, INVALID);
        assert_eq!(find(&blocks, root, crate::block::tree_key(0, 20), Status(0)), None);
    }

    #[test]
    fn delete_root_with_two_children_reroots() {
        let mut blocks = new_blocks(8);
        let mut root = INVALID;
        for (i, phys) in [50u32, 20, 80, 10, 30, 70, 90].into_iter().enumerate() {
            set_identity(&mut blocks, (i + 1) as BlockIdx, 0, phys);
            insert(&mut blocks, &mut root, (i + 1) as BlockIdx);
        }
        // root is block 1 (phys=50)
        delete(&mut blocks, &mut root, 1);
        assert_ne!(root, 1);
        assert_ne!(root, INVALID);
        // every other key must still be reachable
        for phys in [20u32, 80, 10, 30, 70, 90] {
            assert!(find(&blocks, root, crate::block::tree_key(0, phys), Status(0)).is_some());
        }
        assert!(find(&blocks, root, crate::block::tree_key(0, 50), Status(0)).is_none());
    }

    #[test]
    fn same_key_different_status_chain_to_the_right() {
        let mut blocks = new_blocks(4);
        let mut root = INVALID;
        set_identity(&mut blocks, 1, 0, 100);
        blocks[1].status = Status(0x0000);
        insert(&mut blocks, &mut root, 1);
        set_identity(&mut blocks, 2, 0, 100);
        blocks[2].status = Status(0xff00); // differs in STATUS_MASK bits
        insert(&mut blocks, &mut root, 2);

        assert_eq!(
            find(&blocks, root, crate::block::tree_key(0, 100), Status(0xff00)),
            Some(2)
        );
        assert_eq!(
            find(&blocks, root, crate::block::tree_key(0, 100), Status(0)),
            Some(1)
        );
    }
}
