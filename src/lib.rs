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

//! Dynamic binary translation core for an x86 PC emulator (spec.md, SPEC_FULL.md).
//!
//! [`Dynarec`] is the single process-wide object this crate exposes: it owns the block pool
//! (C3), the block index (C4), the SMC-coherence page table (C5), the executable-memory arena
//! (C1), and the host load/store trampolines (C8) that the original kept as global mutable
//! state (SPEC_FULL.md §9 "Global mutable state -> owned modules"). Every guest-side
//! collaborator the core only consumes -- the MMU, the opcode decoder, the opcode handler
//! table, the interrupt controller, the reset/abort/flag hooks, and the platform timer -- is
//! supplied once at [`Dynarec::new`] and driven by [`Dynarec::exec`] without further wiring
//! (SPEC_FULL.md §1 "Crate shape").
//!
//! Translator (C6) and dispatcher (C7) logic live in private modules and are exercised directly
//! by their own unit tests; [`Dynarec`] is the thin owning shell spec.md §6 describes, not a
//! reimplementation of either.

#![warn(missing_docs)]

mod backend;
mod block;
mod block_pool;
mod dispatch;
mod emitter;
pub mod error;
pub mod exec_memory;
pub mod guest;
mod hash_index;
mod page;
mod smc;
mod status;
pub mod timing;
pub mod trampolines;
mod translator;
mod tree;

#[cfg(test)]
mod tests;

use crate::block_pool::BlockPool;
use crate::dispatch::BlockState;
use crate::error::DynarecError;
use crate::exec_memory::{ExecMemoryPool, ExecMemoryProvider};
use crate::guest::{
    CpuState, Decoder, GuestHooks, InterruptController, MemoryAccess, Mmu, OpcodeTable, PlatformTimer, Phys,
};
use crate::hash_index::HashIndex;
use crate::page::PageTable;
use crate::timing::{Flat, TimingProfile};
use crate::trampolines::Trampolines;

/// Guest interrupt vector synthesised for the trap flag (spec.md §4.7 step 3 "INT 1").
const TRAP_VECTOR: u8 = 1;
/// Guest interrupt vector synthesised for a pending NMI (spec.md §4.7 step 3 "INT 2").
const NMI_VECTOR: u8 = 2;
/// Guest interrupt vector synthesised for a double fault (spec.md §7 "Dispatcher raises INT 8").
const DOUBLE_FAULT_VECTOR: u8 = 8;

/// Approximate guest-cycle span of one "period" between [`PlatformTimer::tick`] calls (spec.md
/// §4.7 step 4 "~5 µs periods"). The core has no notion of the guest's actual clock frequency --
/// that mapping is entirely the caller's concern -- so this is a coarse, documented placeholder
/// rather than a derived value; callers running a guest whose `cycles` unit isn't "1 cycle ~= 1
/// simple instruction at a period this short" should not rely on the exact cadence.
const PERIOD_CYCLES: i32 = 5_000;

/// Owns every piece of process-wide dynarec state and drives the dispatch loop (spec.md §2
/// "System overview", §9 "Global mutable state -> owned modules").
///
/// Guest-side collaborators are injected once at construction time (SPEC_FULL.md §1) rather than
/// per [`Dynarec::exec`] call, mirroring how the original's globals were wired once at process
/// startup.
pub struct Dynarec {
    pool: BlockPool,
    pages: PageTable,
    hash: HashIndex,
    exec: ExecMemoryPool,
    trampolines: Trampolines,
    opcodes: OpcodeTable,
    timing: Box<dyn TimingProfile>,
    mmu: Box<dyn Mmu>,
    decoder: Box<dyn Decoder>,
    pic: Box<dyn InterruptController>,
    hooks: Box<dyn GuestHooks>,
    timer: Box<dyn PlatformTimer>,
    cpu: CpuState,
}

impl Dynarec {
    /// Builds a fresh core: reserves the code-block pool (`n_blocks` descriptors, spec.md §4.3),
    /// the executable-memory arena (`n_exec_blocks` exec blocks, spec.md §4.1), and the host
    /// load/store trampolines (spec.md §4.8), then wires in every collaborator the dispatch loop
    /// will later drive.
    ///
    /// `mem` is the interpretive memory layer the trampolines' slow path falls back to
    /// (spec.md §4.8); it must outlive this `Dynarec`, the same requirement
    /// [`Trampolines::new`](crate::trampolines::Trampolines::new) documents.
    ///
    /// Defaults to the [`Flat`] timing profile (SPEC_FULL.md §2.3); call
    /// [`Dynarec::set_timing_profile`] to pick a per-CPU-model table instead.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: &mut dyn ExecMemoryProvider,
        n_blocks: usize,
        n_exec_blocks: usize,
        opcodes: OpcodeTable,
        mem: *mut dyn MemoryAccess,
        mmu: Box<dyn Mmu>,
        decoder: Box<dyn Decoder>,
        pic: Box<dyn InterruptController>,
        hooks: Box<dyn GuestHooks>,
        timer: Box<dyn PlatformTimer>,
    ) -> Result<Self, DynarecError> {
        let exec = ExecMemoryPool::new(provider, n_exec_blocks).map_err(DynarecError::ArenaMapFailed)?;
        let trampolines = Trampolines::new(provider, mem).map_err(DynarecError::ArenaMapFailed)?;

        Ok(Dynarec {
            pool: BlockPool::new(n_blocks),
            pages: PageTable::new(),
            hash: HashIndex::new(),
            exec,
            trampolines,
            opcodes,
            timing: Box::new(Flat),
            mmu,
            decoder,
            pic,
            hooks,
            timer,
            cpu: CpuState::default(),
        })
    }

    /// Live CPU state the dispatch loop reads and writes at block boundaries (spec.md §3
    /// "status", §4.7). Callers seed the initial `pc`/`cs_base`/`regs` here before the first
    /// [`Dynarec::exec`] call and inspect it afterwards (spec.md §8 scenario A checks `EAX`).
    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    /// Mutable access to [`Dynarec::cpu`], for seeding initial guest state or applying an
    /// asynchronous condition (`nmi_pending`, `abrt`) from outside the dispatch loop (spec.md §5
    /// "a separate host thread ... setting global atomic flags that the dispatch loop polls at
    /// block boundaries").
    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    /// The host load/store trampolines (spec.md §4.8, component C8), exposed so the memory
    /// subsystem can maintain their TLB-like `read_lookup`/`write_lookup` tables as guest pages
    /// are mapped and unmapped.
    pub fn trampolines(&mut self) -> &mut Trampolines {
        &mut self.trampolines
    }

    /// Runs the dispatch loop for roughly `cycles` guest cycles (spec.md §6 `exec(cycles)`),
    /// choosing interpretation or cached execution per iteration (spec.md §4.7) and driving the
    /// platform timer once per `~5 µs` period (step 4).
    pub fn exec(&mut self, cycles: u32) {
        self.cpu.cycles = cycles as i32;
        let mut period_accum: i32 = 0;

        while self.cpu.cycles > 0 {
            let spent = if self.cpu.cache_disabled || self.cpu.trap_flag {
                dispatch::interpret_block(&mut self.cpu, self.decoder.as_mut(), &self.opcodes, self.timing.as_ref())
            } else {
                self.run_cached_iteration()
            };
            self.cpu.cycles -= spent as i32;
            period_accum += spent as i32;

            self.after_block();

            if period_accum >= PERIOD_CYCLES {
                period_accum -= PERIOD_CYCLES;
                self.timer.tick();
            }
        }
    }

    /// One iteration of the cached path (spec.md §4.7 step 2): resolve the physical address,
    /// look up and validate a candidate, then run compiled code, record-and-emit, or mark-only
    /// depending on what was found. Returns the cycle cost to charge against the budget --
    /// already baked into `cpu.cycles` by the compiled stream itself when a [`BlockState::Ready`]
    /// block ran, hence `0` in that arm (spec.md §6 `codegen_block_cycles`).
    fn run_cached_iteration(&mut self) -> u32 {
        let linear = self.cpu.linear_pc();
        let phys = match self.mmu.get_phys(linear) {
            Ok(p) => p,
            Err(abort) => {
                self.cpu.abrt = Some(abort);
                return 0;
            }
        };

        let state = dispatch::lookup_and_validate(
            &mut self.pool,
            &mut self.pages,
            &mut self.hash,
            &mut self.exec,
            self.mmu.as_mut(),
            &self.cpu,
            phys,
        );

        match state {
            BlockState::Ready(block) => {
                // SAFETY: `self.exec` is the pool `block`'s exec-memory chain was allocated
                // from, and the single-emulation-thread invariant (spec.md §5) guarantees no
                // other code is concurrently executing on it.
                unsafe { dispatch::run_compiled(&self.pool, &self.exec, &mut self.cpu, block) };
                0
            }
            BlockState::NeedsCompile(block) => self.run_translate(block, true),
            BlockState::Miss => {
                let block = translator::block_init(
                    &mut self.pool,
                    &mut self.pages,
                    &mut self.hash,
                    &mut self.exec,
                    &self.cpu,
                    phys,
                );
                self.run_translate(block, false)
            }
        }
    }

    /// Runs the translator over `block` (record-and-emit if `emit_code`, mark-only otherwise),
    /// issuing a full [`Dynarec::reset`] if a guest reset was observed mid-walk (spec.md §7
    /// "Reset observed mid-block").
    fn run_translate(&mut self, block: block::BlockIdx, emit_code: bool) -> u32 {
        let outcome = dispatch::run_translate_pass(
            &mut self.pool,
            &mut self.pages,
            &mut self.hash,
            &mut self.exec,
            &mut self.cpu,
            self.mmu.as_mut(),
            self.decoder.as_mut(),
            &self.opcodes,
            self.timing.as_ref(),
            block,
            emit_code,
        );
        if outcome.reset {
            self.reset();
        }
        outcome.cycles
    }

    /// Post-block bookkeeping (spec.md §4.7 step 3): rebuild lazy flags, then handle an abort,
    /// the trap flag, a pending NMI, or a pending maskable interrupt, in that priority order.
    /// A double or triple fault escalates through [`GuestHooks::inject_interrupt`] and
    /// [`GuestHooks::soft_reset`] exactly as spec.md §7's "Double fault" row describes.
    fn after_block(&mut self) {
        self.hooks.rebuild_flags(&mut self.cpu);

        if self.cpu.abrt.take().is_some() {
            self.hooks.handle_abort(&mut self.cpu);
            if self.cpu.abrt.take().is_some() {
                self.hooks.inject_interrupt(&mut self.cpu, DOUBLE_FAULT_VECTOR);
                if self.cpu.abrt.take().is_some() {
                    log::warn!("triple fault: forcing a full guest reset");
                    self.hooks.soft_reset(&mut self.cpu);
                    self.reset();
                }
            }
            // An abort already redirected control flow this boundary; trap/NMI/IRQ delivery
            // waits for the next one (matches the original's single `abrt` word taking priority
            // over every other pending condition).
            return;
        }

        if self.cpu.trap_flag {
            self.cpu.trap_flag = false;
            self.hooks.inject_interrupt(&mut self.cpu, TRAP_VECTOR);
            return;
        }
        if self.cpu.nmi_pending {
            self.cpu.nmi_pending = false;
            self.hooks.inject_interrupt(&mut self.cpu, NMI_VECTOR);
            return;
        }
        if self.cpu.interrupts_enabled && self.pic.pending_maskable().is_some() {
            let vector = self.pic.acknowledge();
            self.hooks.inject_interrupt(&mut self.cpu, vector);
        }
    }

    /// Invalidates every block touching `phys` whose `page_mask` intersects `dirty_mask` (spec.md
    /// §6 `codegen_check_flush`, called by the memory subsystem when a guest write dirties a page
    /// known to host code).
    pub fn check_flush(&mut self, phys: Phys, dirty_mask: u64) {
        smc::check_flush_page(&mut self.pool, &mut self.pages, &mut self.hash, &mut self.exec, phys, dirty_mask);
    }

    /// Invalidates every live block (spec.md §6 `codegen_flush`, called on MMU reconfiguration or
    /// a large guest-mode change).
    pub fn flush(&mut self) {
        self.pool.flush_all(&mut self.pages, &mut self.hash, &mut self.exec);
    }

    /// Records a guest write of `len` bytes at `offset_in_page` within the page at `phys`,
    /// setting the dirty bits the lazy `validate_block` path consumes later (spec.md §4.5 "Guest
    /// writes route through specialised `write_ram_page` entry points that ... OR the target
    /// sub-region's bit into the page's `dirty_mask`"). The memory subsystem calls this for
    /// every guest store; pages that never hosted code are a cheap no-op.
    ///
    /// Returns `true` iff the page had any code present, i.e. there was anything to dirty.
    pub fn note_guest_write(&mut self, phys: Phys, offset_in_page: u32, len: u32) -> bool {
        smc::write_ram_page(&mut self.pages, phys, offset_in_page, len)
    }

    /// Flushes every block the same way [`Dynarec::flush`] does (spec.md §6 `codegen_reset`,
    /// §5 "reset is modelled by `codegen_reset()`, which flushes every block"). Distinct from
    /// [`GuestHooks::soft_reset`], which resets guest-visible CPU state and is the caller's
    /// concern, not the code cache's.
    pub fn reset(&mut self) {
        self.flush();
    }

    /// Selects a per-CPU-model cycle-cost table (spec.md §6 `codegen_timing_set`, SPEC_FULL.md
    /// §2.3), consulted by the translator and dispatcher from the next block onward.
    pub fn set_timing_profile(&mut self, profile: Box<dyn TimingProfile>) {
        self.timing = profile;
    }
}
