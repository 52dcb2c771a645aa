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

//! Executable-memory allocator (spec.md §4.1, component C1).
//!
//! A fixed pool of [`ExecMemBlock`]s is reserved up front from a single `mmap`'d arena. A
//! free-list head links unowned blocks through their `next` field; when the list runs dry,
//! [`ExecMemoryPool::allocate`] forces room by repeatedly evicting a uniformly random
//! occupied block via a callback the block-storage layer ([`crate::block_pool`]) publishes.

use crate::block::BlockIdx;
use crate::error::MmapError;
use rand::Rng;

/// Index into the [`ExecMemoryPool`]'s arena. `0` is the `INVALID` sentinel (mirrors
/// [`crate::block::INVALID`]; kept as a distinct type so the two index spaces can't be mixed up).
pub type ExecBlockIdx = u32;

/// Reserved index meaning "no exec block".
pub const EXEC_INVALID: ExecBlockIdx = 0;

/// Usable size of one exec block: slightly under 1 KiB, to limit instruction-cache aliasing
/// (spec.md §3 "Arena").
pub const EXEC_BLOCK_SIZE: usize = 1000;

/// Number of exec blocks in the default arena. Chosen so the default arena stays well inside
/// an x86-64 host's ±2 GiB unconditional-jump range (spec.md §3).
pub const DEFAULT_N_EXEC_BLOCKS: usize = 1 << 14;

/// A host mapping the allocator draws its backing bytes from (spec.md §6 "Host-mmap provider").
///
/// Implementations own the actual OS call (`mmap`, page-granularity remap, ...); the core only
/// ever sees a base pointer and a length.
pub trait ExecMemoryProvider {
    /// Reserves `len` bytes of memory, readable/writable/executable, returning its base address.
    fn map(&mut self, len: usize) -> Result<*mut u8, MmapError>;
}

/// [`ExecMemoryProvider`] backed by a real anonymous `mmap` (the common hosted case).
pub struct MmapProvider;

impl ExecMemoryProvider for MmapProvider {
    fn map(&mut self, len: usize) -> Result<*mut u8, MmapError> {
        // SAFETY: `mmap` with `MAP_ANON | MAP_PRIVATE` and no fd is always safe to call; the
        // returned pointer is only ever dereferenced within `[ptr, ptr+len)`, which is exactly
        // the mapping's extent.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
            return Err(MmapError::Os(err));
        }
        Ok(ptr as *mut u8)
    }
}

/// One unit of executable backing memory (spec.md §3 "ExecMemBlock").
///
/// A [`crate::block::CodeBlock`]'s compiled output may span several of these, joined by
/// unconditional jumps emitted by [`crate::emitter`].
#[derive(Debug, Clone, Copy)]
struct ExecMemBlock {
    /// Byte offset into the arena.
    offset: u32,
    /// Owning code-block index, or [`crate::block::INVALID`].
    owner: BlockIdx,
    /// Forms either a free-list chain or a per-`CodeBlock` overflow chain.
    next: ExecBlockIdx,
}

/// Callback published by [`crate::block_pool::BlockPool`] so the allocator can forcibly evict
/// a code block's exec-memory ownership during forced eviction (spec.md §4.1, §5).
pub trait BlockRemover {
    /// Deletes the code block owning `block`, returning its exec-memory chain to this pool.
    fn remove_block(&mut self, block: BlockIdx);
}

/// The fixed pool of [`ExecMemBlock`]s drawn from one `mmap`'d arena (spec.md §3 "Arena", §4.1).
pub struct ExecMemoryPool {
    arena: *mut u8,
    blocks: Vec<ExecMemBlock>,
    free_list: ExecBlockIdx,
    used: usize,
    rng: rand::rngs::SmallRng,
}

// The arena pointer is never aliased mutably from two places at once outside of `get_ptr`
// (guarded by the single-emulation-thread invariant, spec.md §5); treat the pool as Send so it
// can be owned by a `Dynarec` moved across threads at rest.
unsafe impl Send for ExecMemoryPool {}

impl ExecMemoryPool {
    /// Reserves `n` exec blocks via `provider` and initialises the free list (spec.md §4.1
    /// `codegen_allocator_init`).
    pub fn new(provider: &mut dyn ExecMemoryProvider, n: usize) -> Result<Self, MmapError> {
        assert!(n >= 2, "need at least 2 exec blocks (index 0 is reserved)");
        let total = n * EXEC_BLOCK_SIZE;
        let arena = provider.map(total)?;

        // Index 0 is reserved as EXEC_INVALID, mirroring the code-block pool's convention, so
        // a cleared `head_exec_block` field can never be confused with a real allocation.
        let mut blocks = Vec::with_capacity(n);
        blocks.push(ExecMemBlock {
            offset: 0,
            owner: crate::block::INVALID,
            next: EXEC_INVALID,
        });
        for i in 1..n {
            blocks.push(ExecMemBlock {
                offset: (i * EXEC_BLOCK_SIZE) as u32,
                owner: crate::block::INVALID,
                next: if i + 1 < n { (i + 1) as ExecBlockIdx } else { EXEC_INVALID },
            });
        }

        Ok(ExecMemoryPool {
            arena,
            blocks,
            free_list: if n > 1 { 1 } else { EXEC_INVALID },
            used: 0,
            rng: rand::SeedableRng::from_entropy(),
        })
    }

    /// Total number of exec blocks in the arena.
    pub fn capacity(&self) -> usize {
        self.blocks.len() - 1
    }

    /// Number of exec blocks currently owned by some code block.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Conservation invariant check for tests (spec.md §8 property 3): free-list length plus
    /// owned count equals total capacity.
    #[cfg(test)]
    fn free_list_len(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_list;
        while cur != EXEC_INVALID {
            count += 1;
            cur = self.blocks[cur as usize].next;
        }
        count
    }

    /// Draws one exec block from the free list, forcing room via `remover` if necessary
    /// (spec.md §4.1 `allocate`).
    ///
    /// If `parent` is [`EXEC_INVALID`], the new block starts a fresh chain (unowned by any
    /// other exec block); otherwise it is spliced into `parent`'s `next` field, chaining
    /// overflow within one code block.
    pub fn allocate(
        &mut self,
        parent: ExecBlockIdx,
        code_block: BlockIdx,
        remover: &mut dyn BlockRemover,
    ) -> ExecBlockIdx {
        let mut attempts: u64 = 0;
        while self.free_list == EXEC_INVALID {
            attempts += 1;
            if attempts > 0 && attempts % 10_000 == 0 {
                log::warn!(
                    "forced exec-memory eviction has made {} attempts without freeing a block",
                    attempts
                );
            }
            let n = self.blocks.len() as u32;
            // blocks[1..n) are real slots; 0 is the sentinel.
            let candidate = 1 + self.rng.gen_range(0, n - 1);
            let owner = self.blocks[candidate as usize].owner;
            if owner != crate::block::INVALID && owner != code_block {
                remover.remove_block(owner);
            }
        }

        let idx = self.free_list;
        self.free_list = self.blocks[idx as usize].next;
        self.blocks[idx as usize].owner = code_block;
        self.used += 1;

        if parent != EXEC_INVALID {
            self.blocks[idx as usize].next = self.blocks[parent as usize].next;
            self.blocks[parent as usize].next = idx;
        } else {
            self.blocks[idx as usize].next = EXEC_INVALID;
        }

        idx
    }

    /// Returns every link of the chain rooted at `head` to the free list, clearing ownership
    /// (spec.md §4.1 `free`).
    pub fn free(&mut self, head: ExecBlockIdx) {
        let mut cur = head;
        while cur != EXEC_INVALID {
            let next = self.blocks[cur as usize].next;
            self.blocks[cur as usize].owner = crate::block::INVALID;
            self.blocks[cur as usize].next = self.free_list;
            self.free_list = cur;
            self.used -= 1;
            cur = next;
        }
    }

    /// Host-writable/executable address of `block`'s backing bytes (spec.md §4.1 `get_ptr`).
    pub fn get_ptr(&self, block: ExecBlockIdx) -> *mut u8 {
        let offset = self.blocks[block as usize].offset as usize;
        // SAFETY: `offset` was derived from this same arena's layout at construction time and
        // is always `< capacity() * EXEC_BLOCK_SIZE`.
        unsafe { self.arena.add(offset) }
    }

    /// Next link in `block`'s chain, or [`EXEC_INVALID`] if it is the last.
    pub fn next_of(&self, block: ExecBlockIdx) -> ExecBlockIdx {
        self.blocks[block as usize].next
    }

    /// Flushes the host instruction cache over the full usable extent of every link in the
    /// chain rooted at `head`, on hosts with split I/D caches (spec.md §4.1 `clean_blocks`).
    pub fn clean_blocks(&self, head: ExecBlockIdx) {
        #[cfg(target_arch = "aarch64")]
        {
            let mut cur = head;
            while cur != EXEC_INVALID {
                let ptr = self.get_ptr(cur);
                // SAFETY: `ptr..ptr+EXEC_BLOCK_SIZE` lies entirely within the arena mapping.
                unsafe {
                    clear_icache(ptr, ptr.add(EXEC_BLOCK_SIZE));
                }
                cur = self.blocks[cur as usize].next;
            }
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = head; // no-op: x86 has coherent I/D caches.
        }
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn clear_icache(start: *const u8, end: *const u8) {
    extern "C" {
        fn __clear_cache(start: *const core::ffi::c_void, end: *const core::ffi::c_void);
    }
    __clear_cache(start as *const _, end as *const _);
}

/// Alternative arena variant (spec.md §4.1 "An alternative arena variant..."; grounded on
/// `codegen_allocator_new.c`): one exec block per code-block slot, whose usable size grows in
/// fixed 16 KiB increments (up to 64 KiB) instead of chaining many small fixed-size blocks.
///
/// Where the default [`ExecMemoryPool`] reserves one arena and hands out `EXEC_BLOCK_SIZE`
/// chunks, this variant reserves `slots * GROWING_MAX_SIZE` bytes of address space up front
/// (`PROT_NONE`) and incrementally `mprotect`s a growing RWX prefix per slot -- standing in for
/// the original's page-granularity remap, which Rust's portable `libc` binding doesn't expose
/// directly. Behaviour towards callers is otherwise identical: `free` is a no-op (the original
/// does not reclaim these either, per its own comment), and `allocate` on an empty parent just
/// grows that slot's usable prefix.
#[cfg(feature = "growing-arena")]
pub struct GrowingArena {
    base: *mut u8,
    slots: usize,
    usable: Vec<usize>,
}

#[cfg(feature = "growing-arena")]
const GROWING_INCREMENT: usize = 16 * 1024;
#[cfg(feature = "growing-arena")]
const GROWING_MAX_SIZE: usize = 64 * 1024;

#[cfg(feature = "growing-arena")]
impl GrowingArena {
    /// Reserves address space for `slots` code blocks, each growable up to
    /// [`GROWING_MAX_SIZE`].
    pub fn new(slots: usize) -> Result<Self, MmapError> {
        let total = slots * GROWING_MAX_SIZE;
        // SAFETY: anonymous, unbacked reservation; no memory is touched until `grow` protects it.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
            return Err(MmapError::Os(err));
        }
        Ok(GrowingArena {
            base: base as *mut u8,
            slots,
            usable: vec![0; slots],
        })
    }

    /// Grows `slot`'s usable prefix by one increment, `mprotect`-ing the newly covered pages
    /// RWX. Returns the new usable size.
    pub fn grow(&mut self, slot: usize) -> usize {
        assert!(self.usable[slot] < GROWING_MAX_SIZE, "slot already at max size");
        let new_size = self.usable[slot] + GROWING_INCREMENT;
        // SAFETY: `slot_base..slot_base+new_size` lies within this arena's reservation, whose
        // full extent was PROT_NONE-mapped at construction time.
        unsafe {
            let slot_base = self.base.add(slot * GROWING_MAX_SIZE);
            libc::mprotect(
                slot_base as *mut _,
                new_size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            );
        }
        self.usable[slot] = new_size;
        new_size
    }

    /// Host-writable/executable base address of `slot`.
    pub fn get_ptr(&self, slot: usize) -> *mut u8 {
        // SAFETY: within the arena's reserved extent.
        unsafe { self.base.add(slot * GROWING_MAX_SIZE) }
    }

    /// Current usable size of `slot`.
    pub fn usable_size(&self, slot: usize) -> usize {
        self.usable[slot]
    }
}
