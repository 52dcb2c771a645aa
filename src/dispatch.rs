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

//! Dispatch loop helpers (spec.md §4.7, component C7).
//!
//! [`crate::Dynarec::exec`] is the actual top-level loop (it owns every piece of state this
//! module's functions borrow); this module holds the two per-iteration bodies -- cached-path
//! lookup/validate/run and the pure interpreter -- factored out the same way
//! [`crate::translator::walk`] factors the shared instruction loop out of `block_init`/
//! `block_end_recompile`. Keeping these as free functions over explicit borrows (rather than
//! inherent `Dynarec` methods) means they can be unit-tested without constructing a full
//! `Dynarec`, matching how [`crate::smc`] and [`crate::translator`] are tested.

use crate::block::{BlockFlags, BlockIdx, INVALID};
use crate::block_pool::{BlockPool, PoolRemover};
use crate::exec_memory::{BlockRemover, ExecMemoryPool};
use crate::guest::{CpuState, Decoder, Mmu, OpcodeTable, Phys};
use crate::hash_index::HashIndex;
use crate::page::PageTable;
use crate::smc;
use crate::timing::TimingProfile;
use crate::translator;
use crate::tree;

/// Outcome of [`lookup_and_validate`]: what the dispatcher should do this iteration once a
/// physical address has been resolved (spec.md §4.7 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Neither the hash nor the tree produced a usable candidate: initialise a fresh block and
    /// run the translator's mark-only pass.
    Miss,
    /// A valid candidate exists but has not been compiled yet (or was just demoted): run the
    /// translator's record-and-emit pass against it.
    NeedsCompile(BlockIdx),
    /// A valid, compiled candidate: call straight into its host code.
    Ready(BlockIdx),
}

/// Resolves `cpu`'s current linear PC against the block index and validates the winner against
/// live SMC/FPU state, re-deriving the second page's physical address for the drift check when
/// the candidate has one (spec.md §4.4 lookup, §4.5 validation, SPEC_FULL.md §3 FPU
/// re-validation and two-page drift check). Named to match SPEC_FULL.md §3's
/// `Dynarec::lookup_and_validate`, though it lives here as a free function so it can be
/// exercised without a full `Dynarec`.
#[allow(clippy::too_many_arguments)]
pub fn lookup_and_validate(
    pool: &mut BlockPool,
    pages: &mut PageTable,
    hash: &mut HashIndex,
    exec: &mut ExecMemoryPool,
    mmu: &mut dyn Mmu,
    cpu: &CpuState,
    phys: Phys,
) -> BlockState {
    let linear = cpu.linear_pc();
    let key = crate::block::tree_key(cpu.cs_base, phys);

    let mut candidate = hash.candidate(phys);
    if candidate == INVALID || !pool.get(candidate).identity_matches(linear, cpu.cs_base, phys, cpu.status) {
        candidate = match pages.get(phys) {
            Some(page) => tree::find(pool.blocks(), page.head_tree, key, cpu.status).unwrap_or(INVALID),
            None => INVALID,
        };
        if candidate != INVALID {
            hash.set(phys, candidate);
        }
    }

    if candidate == INVALID {
        return BlockState::Miss;
    }

    // FPU top-of-stack re-validation (SPEC_FULL.md §3): a block compiled against a fixed top
    // whose live value has since drifted is demoted in place -- it stays in the tree/hash/page
    // lists (only its flags change), so it is found again next time and recompiled dynamically.
    {
        let b = pool.get_mut(candidate);
        if b.flags.contains(BlockFlags::STATIC_TOP) && b.top != cpu.fpu_top {
            log::debug!("block {} demoted: FPU top-of-stack mismatch", candidate);
            b.flags.remove(BlockFlags::STATIC_TOP);
            b.flags.remove(BlockFlags::WAS_RECOMPILED);
        }
    }

    let phys2_current = if pool.get(candidate).flags.contains(BlockFlags::HAS_PAGE2) {
        let next_page_linear = (linear & !0xfff).wrapping_add(4096);
        mmu.get_phys_noabrt(next_page_linear)
    } else {
        None
    };

    match smc::validate_block(pool, pages, hash, exec, candidate, phys2_current) {
        // The candidate was deleted outright or demoted onto the dirty list; either way it is no
        // longer reachable through the tree/hash, so the next lookup for this address is a
        // genuine miss.
        smc::Validity::Flushed => BlockState::Miss,
        smc::Validity::Valid => {
            if pool.get(candidate).flags.contains(BlockFlags::WAS_RECOMPILED) {
                BlockState::Ready(candidate)
            } else {
                BlockState::NeedsCompile(candidate)
            }
        }
    }
}

/// Calls straight into `block`'s compiled host code and replays its accumulated source length
/// onto `cpu.pc` (spec.md §4.7 "if valid and WAS_RECOMPILED, call the compiled code";
/// [`crate::block::CodeBlock::total_len`]'s doc comment). The compiled stream itself already
/// decremented `cpu.cycles` by its baked cost before returning (spec.md §6
/// `codegen_block_cycles`), so this function charges nothing further.
///
/// # Safety
/// `exec` must be the same pool `block`'s exec-memory chain was allocated from, and no other
/// code may be concurrently executing on this pool's arena (spec.md §5 single-emulation-thread
/// invariant).
pub unsafe fn run_compiled(pool: &BlockPool, exec: &ExecMemoryPool, cpu: &mut CpuState, block: BlockIdx) {
    let head = pool.get(block).head_exec_block;
    let entry = exec.get_ptr(head);
    // SAFETY: `entry` was produced by this crate's own emitter, which only ever terminates a
    // compiled stream with `emit_exit_thunk`/`emit_ret` (spec.md §4.2); every compiled block is
    // a valid zero-argument `extern "C"` routine. The caller's contract guarantees the backing
    // exec memory is still live.
    let f: extern "C" fn() = std::mem::transmute(entry);
    f();
    cpu.pc = cpu.pc.wrapping_add(pool.get(block).total_len);
}

/// Runs the translator over `block`, either the record-and-emit pass (`emit_code = true`, for a
/// [`BlockState::NeedsCompile`] candidate) or the mark-only pass (`emit_code = false`, for a
/// freshly [`translator::block_init`]ialised [`BlockState::Miss`] candidate), per spec.md §4.6.
///
/// On success for the record-and-emit pass, flushes the host instruction cache over the exec
/// chain and sets `WAS_RECOMPILED`. On a mid-walk abort, the half-built block is deleted (spec.md
/// §4.7 "if inside translator, block is removed") rather than left around to be mis-validated
/// later.
#[allow(clippy::too_many_arguments)]
pub fn run_translate_pass(
    pool: &mut BlockPool,
    pages: &mut PageTable,
    hash: &mut HashIndex,
    exec: &mut ExecMemoryPool,
    cpu: &mut CpuState,
    mmu: &mut dyn Mmu,
    decoder: &mut dyn Decoder,
    opcodes: &OpcodeTable,
    timing: &dyn TimingProfile,
    block: BlockIdx,
    emit_code: bool,
) -> translator::WalkOutcome {
    let exec_ptr: *mut ExecMemoryPool = exec;

    if !emit_code {
        let outcome = translator::walk(block, pool, pages, hash, exec_ptr, cpu, mmu, decoder, opcodes, timing, None);
        if outcome.aborted || outcome.reset {
            // A reset mid-walk is abandoned exactly like an abort (spec.md §7 "Reset observed
            // mid-block"): the caller issues a full `Dynarec::reset` right after this returns,
            // which would delete the block anyway, but leaving it half-marked in the meantime
            // would let a lookup in between see a bogus `page_mask`.
            let mut remover = PoolRemover { blocks: pool, pages, hash, exec: exec_ptr };
            remover.remove_block(block);
        } else {
            translator::block_end(block);
        }
        return outcome;
    }

    let mut emitter = translator::block_start_recompile(pool, pages, hash, exec, exec_ptr, block);
    let outcome = translator::walk(
        block,
        pool,
        pages,
        hash,
        exec_ptr,
        cpu,
        mmu,
        decoder,
        opcodes,
        timing,
        Some(&mut emitter),
    );

    if outcome.aborted || outcome.reset {
        // Same reasoning as the mark-only pass above: a reset mid-walk must not be allowed to
        // fall through to `block_end_recompile`, or a truncated, reset-interrupted instruction
        // stream would get marked `WAS_RECOMPILED` and become eligible for execution.
        drop(emitter);
        let mut remover = PoolRemover { blocks: pool, pages, hash, exec: exec_ptr };
        remover.remove_block(block);
        return outcome;
    }

    let cycles_ptr = &mut cpu.cycles as *mut i32;
    let mut remover = PoolRemover { blocks: pool, pages, hash, exec: exec_ptr };
    translator::block_end_recompile(emitter, &mut remover, cycles_ptr, outcome.cycles);

    let head = pool.get(block).head_exec_block;
    exec.clean_blocks(head);
    pool.get_mut(block).total_len = outcome.total_len;
    pool.get_mut(block).flags.insert(BlockFlags::WAS_RECOMPILED);

    outcome
}

/// Runs exactly one instruction-boundary-granular "block" of pure interpretation (spec.md §4.7
/// step 1, the code-cache-disabled / single-step path): fetch, dispatch, advance, and break on
/// any of the same conditions [`translator::walk`] breaks on, minus every piece of book-keeping
/// that only matters to a cached block (no `mark_code_present`, no tree/hash/page-list
/// membership). Returns the cycle cost accumulated, which the caller charges against
/// `cpu.cycles` itself (unlike the compiled path, nothing here bakes a cycle charge into
/// anything -- there is no compiled code).
pub fn interpret_block(
    cpu: &mut CpuState,
    decoder: &mut dyn Decoder,
    opcodes: &OpcodeTable,
    timing: &dyn TimingProfile,
) -> u32 {
    let mut cycles = timing.block_start();

    loop {
        let insn_linear = cpu.linear_pc();
        let decoded = match decoder.decode(insn_linear) {
            Ok(d) => d,
            Err(abort) => {
                cpu.abrt = Some(abort);
                break;
            }
        };

        let offset_in_page = insn_linear & 0xfff;
        let crosses_page = u32::from(decoded.length) > 4096 - offset_in_page;

        if let Some(op) = decoded.fast_path {
            translator::apply_fast_op(cpu, op);
        } else {
            let handler = opcodes.get(decoded.opcode_index);
            let cpu_ptr = cpu as *mut CpuState as *mut u8;
            handler(cpu_ptr, decoded.fetchdat);
        }

        cycles += timing.opcode(decoded.opcode_index);
        cpu.pc = cpu.pc.wrapping_add(u32::from(decoded.length));

        if cpu.was_reset {
            break;
        }
        if decoded.block_end {
            break;
        }
        if crosses_page {
            break;
        }
        if cpu.trap_flag {
            break;
        }
        if cpu.nmi_pending {
            break;
        }
        if cpu.abrt.is_some() {
            break;
        }
    }

    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PC_INVALID;
    use crate::exec_memory::MmapProvider;
    use crate::guest::{Abort, DecodedInsn, FastOp, Linear, REG_EAX};
    use crate::timing::Flat;
    use std::collections::VecDeque;

    struct ScriptedDecoder {
        insns: VecDeque<DecodedInsn>,
    }

    impl Decoder for ScriptedDecoder {
        fn decode(&mut self, _linear_pc: Linear) -> Result<DecodedInsn, Abort> {
            Ok(self.insns.pop_front().expect("decoder script exhausted"))
        }
    }

    struct NoopMmu;
    impl Mmu for NoopMmu {
        fn get_phys(&mut self, virt: Linear) -> Result<Phys, Abort> {
            Ok(virt)
        }
        fn get_phys_noabrt(&mut self, virt: Linear) -> Option<Phys> {
            Some(virt)
        }
    }

    extern "C" fn noop_handler(_cpu_state: *mut u8, _fetchdat: u32) {}

    fn opcode_table() -> OpcodeTable {
        OpcodeTable::new([noop_handler; 1024])
    }

    #[test]
    fn lookup_and_validate_reports_miss_for_unknown_address() {
        let mut pool = BlockPool::new(4);
        let mut pages = PageTable::new();
        let mut hash = HashIndex::new();
        let mut exec = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut mmu = NoopMmu;
        let cpu = CpuState::default();

        let state = lookup_and_validate(&mut pool, &mut pages, &mut hash, &mut exec, &mut mmu, &cpu, 0x9000);
        assert_eq!(state, BlockState::Miss);
    }

    #[test]
    fn miss_then_mark_only_pass_leaves_block_uncompiled() {
        let mut pool = BlockPool::new(4);
        let mut pages = PageTable::new();
        let mut hash = HashIndex::new();
        let mut exec = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut mmu = NoopMmu;
        let mut cpu = CpuState::default();
        cpu.pc = 0x1000;

        let phys = 0x1000;
        assert_eq!(
            lookup_and_validate(&mut pool, &mut pages, &mut hash, &mut exec, &mut mmu, &cpu, phys),
            BlockState::Miss
        );

        let block = translator::block_init(&mut pool, &mut pages, &mut hash, &mut exec, &cpu, phys);
        let mut decoder = ScriptedDecoder {
            insns: vec![DecodedInsn {
                opcode_index: 0,
                fetchdat: 0,
                length: 1,
                block_end: true,
                fast_path: Some(FastOp::Terminate),
            }]
            .into(),
        };
        let opcodes = opcode_table();
        let timing = Flat;

        run_translate_pass(
            &mut pool, &mut pages, &mut hash, &mut exec, &mut cpu, &mut mmu, &mut decoder, &opcodes, &timing, block,
            false,
        );

        assert!(!pool.get(block).flags.contains(BlockFlags::WAS_RECOMPILED));

        // Next lookup at the same address now finds the marked (but uncompiled) block.
        cpu.pc = 0x1000;
        let state = lookup_and_validate(&mut pool, &mut pages, &mut hash, &mut exec, &mut mmu, &cpu, phys);
        assert_eq!(state, BlockState::NeedsCompile(block));
    }

    #[test]
    fn needs_compile_then_record_and_emit_marks_recompiled() {
        let mut pool = BlockPool::new(4);
        let mut pages = PageTable::new();
        let mut hash = HashIndex::new();
        let mut exec = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut mmu = NoopMmu;
        let mut cpu = CpuState::default();
        cpu.pc = 0x2000;
        let phys = 0x2000;

        let block = translator::block_init(&mut pool, &mut pages, &mut hash, &mut exec, &cpu, phys);
        let mut decoder = ScriptedDecoder {
            insns: vec![
                DecodedInsn {
                    opcode_index: 0,
                    fetchdat: 0,
                    length: 5,
                    block_end: false,
                    fast_path: Some(FastOp::MovRegImm32 { dst: REG_EAX, imm: 7 }),
                },
                DecodedInsn {
                    opcode_index: 0,
                    fetchdat: 0,
                    length: 1,
                    block_end: true,
                    fast_path: Some(FastOp::Terminate),
                },
            ]
            .into(),
        };
        let opcodes = opcode_table();
        let timing = Flat;

        run_translate_pass(
            &mut pool, &mut pages, &mut hash, &mut exec, &mut cpu, &mut mmu, &mut decoder, &opcodes, &timing, block,
            true,
        );

        assert!(pool.get(block).flags.contains(BlockFlags::WAS_RECOMPILED));
        assert_eq!(cpu.regs[REG_EAX as usize], 7);
        assert_eq!(pool.get(block).total_len, 6, "5-byte mov + 1-byte terminator");
    }

    #[test]
    fn aborted_walk_deletes_the_half_built_block() {
        let mut pool = BlockPool::new(4);
        let mut pages = PageTable::new();
        let mut hash = HashIndex::new();
        let mut exec = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut mmu = NoopMmu;
        let mut cpu = CpuState::default();
        cpu.pc = 0x3000;
        let phys = 0x3000;

        let block = translator::block_init(&mut pool, &mut pages, &mut hash, &mut exec, &cpu, phys);

        struct FaultingDecoder;
        impl Decoder for FaultingDecoder {
            fn decode(&mut self, _linear_pc: Linear) -> Result<DecodedInsn, Abort> {
                Err(Abort(0xe))
            }
        }
        let mut decoder = FaultingDecoder;
        let opcodes = opcode_table();
        let timing = Flat;

        run_translate_pass(
            &mut pool, &mut pages, &mut hash, &mut exec, &mut cpu, &mut mmu, &mut decoder, &opcodes, &timing, block,
            false,
        );

        assert_eq!(pool.get(block).start_pc, PC_INVALID, "aborted block is freed");
    }

    #[test]
    fn interpret_block_applies_fast_op_and_stops_at_block_end() {
        let mut cpu = CpuState::default();
        cpu.pc = 0x4000;
        let mut decoder = ScriptedDecoder {
            insns: vec![
                DecodedInsn {
                    opcode_index: 0,
                    fetchdat: 0,
                    length: 5,
                    block_end: false,
                    fast_path: Some(FastOp::MovRegImm32 { dst: REG_EAX, imm: 99 }),
                },
                DecodedInsn {
                    opcode_index: 0,
                    fetchdat: 0,
                    length: 1,
                    block_end: true,
                    fast_path: Some(FastOp::Terminate),
                },
            ]
            .into(),
        };
        let opcodes = opcode_table();
        let timing = Flat;

        let cycles = interpret_block(&mut cpu, &mut decoder, &opcodes, &timing);

        assert_eq!(cpu.regs[REG_EAX as usize], 99);
        assert_eq!(cpu.pc, 0x4000 + 6);
        assert_eq!(cycles, 2);
    }

    #[test]
    fn interpret_block_stops_on_trap_flag_mid_block() {
        let mut cpu = CpuState::default();
        cpu.pc = 0x5000;
        cpu.trap_flag = true;
        let mut decoder = ScriptedDecoder {
            insns: vec![DecodedInsn {
                opcode_index: 0,
                fetchdat: 0,
                length: 1,
                block_end: false,
                fast_path: Some(FastOp::Terminate),
            }]
            .into(),
        };
        let opcodes = opcode_table();
        let timing = Flat;

        interpret_block(&mut cpu, &mut decoder, &opcodes, &timing);
        assert_eq!(cpu.pc, 0x5001);
    }
}
