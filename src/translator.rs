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

//! Translator (spec.md §4.6, component C6).
//!
//! Operates in two passes over one [`CodeBlock`](crate::block::CodeBlock):
//!
//! - [`block_init`] allocates (or recycles) the descriptor and wires it into the tree/page-list
//!   index, but emits nothing.
//! - [`walk`] then drives the shared instruction loop either with an [`Emitter`] attached
//!   ("record-and-emit", the real compile) or without one ("mark-only", the first observation of
//!   a block -- the loop still runs every instruction through the interpreter and still marks
//!   SMC presence, so the second visit to the same block has accurate `page_mask` bounds before
//!   anything is actually compiled). `block_end_recompile`/`block_end` close out whichever pass
//!   ran (spec.md §4.6).
//!
//! Grounded on `386_dynarec.c`'s `codegen_block_start_recompile`/mark-only branches: both run the
//! *exact same* per-instruction loop body, differing only in whether `codegen_generate_call` also
//! fires alongside the interpretive `x86_opcodes[...]` call.

use crate::backend;
use crate::block::{BlockFlags, BlockIdx};
use crate::block_pool::{BlockPool, PoolRemover};
use crate::emitter::Emitter;
use crate::exec_memory::{BlockRemover, ExecMemoryPool, EXEC_INVALID};
use crate::guest::{CpuState, Decoder, FastOp, Mmu, OpcodeTable, Phys};
use crate::hash_index::HashIndex;
use crate::page::PageTable;
use crate::smc;
use crate::timing::TimingProfile;
use crate::tree;

/// Default maximum number of guest source bytes translated into one block, under coarse
/// (64-byte) SMC tracking (spec.md §4.6 "block reached maximum source size").
pub const MAX_BLOCK_SIZE_DEFAULT: u32 = 4000;

/// `(128 - 25) - (start_pc & 0x3f)`: the capped source size once a block is compiled under
/// byte-granularity SMC tracking (SPEC_FULL.md §3), so its instruction bytes never straddle more
/// than one 64-byte sub-region regardless of where within it `start_pc` happens to fall.
fn max_block_size(flags: BlockFlags, start_pc: u32) -> u32 {
    if flags.contains(BlockFlags::BYTE_MASK) {
        (103u32.wrapping_sub(start_pc & 0x3f)).min(103)
    } else {
        MAX_BLOCK_SIZE_DEFAULT
    }
}

/// Allocates or recycles a descriptor for a block starting at the CPU's current linear PC, and
/// inserts it into `phys`'s BST, primary page list, and the hash cache (spec.md §4.6
/// `block_init(phys_addr)`).
pub fn block_init(
    pool: &mut BlockPool,
    pages: &mut PageTable,
    hash: &mut HashIndex,
    exec: &mut ExecMemoryPool,
    cpu: &CpuState,
    phys: Phys,
) -> BlockIdx {
    let idx = pool.new_block(pages, hash, exec);
    {
        let b = pool.get_mut(idx);
        b.start_pc = cpu.linear_pc();
        b.cs_base = cpu.cs_base;
        b.phys = phys;
        b.status = cpu.status;
        // A block always compiles against a fixed FPU top-of-stack snapshot; the dispatcher
        // re-validates it against the live value before reusing a cached block (SPEC_FULL.md §3
        // "FPU top-of-stack re-validation").
        b.top = cpu.fpu_top;
        b.flags.insert(BlockFlags::STATIC_TOP);
    }
    let page = pages.get_or_create(phys);
    let mut root = page.head_tree;
    tree::insert(pool.blocks_mut(), &mut root, idx);
    pages.get_or_create(phys).head_tree = root;
    pool.link_page_list(idx, pages, phys, true);
    hash.set(phys, idx);
    log::debug!("block {} initialised at phys {:#x}", idx, phys);
    idx
}

/// Allocates the head exec block for `block` and returns an [`Emitter`] attached to it (spec.md
/// §4.6; the "record-and-emit" pass begins here).
pub fn block_start_recompile<'e>(
    pool: &mut BlockPool,
    pages: &mut PageTable,
    hash: &mut HashIndex,
    exec: &'e mut ExecMemoryPool,
    exec_ptr: *mut ExecMemoryPool,
    block: BlockIdx,
) -> Emitter<'e> {
    let head = {
        let mut remover = PoolRemover { blocks: pool, pages, hash, exec: exec_ptr };
        exec.allocate(EXEC_INVALID, block, &mut remover)
    };
    pool.get_mut(block).head_exec_block = head;
    Emitter::new(exec, block, head)
}

/// Outcome of one [`walk`] over a block's instruction stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkOutcome {
    /// Cycles to charge against the dispatcher's budget (spec.md §6 `codegen_block_cycles`).
    pub cycles: u32,
    /// Total guest bytes spanned by every instruction translated into this block. Stored onto
    /// [`crate::block::CodeBlock::total_len`] once the record-and-emit pass completes, since the
    /// compiled stream itself never bakes a PC update (spec.md §3 `CodeBlock::total_len`'s doc
    /// comment; the dispatcher replays it after every cached re-execution).
    pub total_len: u32,
    /// A guest fault was raised mid-walk; the caller must delete the (now half-built) block
    /// (spec.md §4.7 "abort raised" / §7 "if inside translator, block is removed").
    pub aborted: bool,
    /// A reset was observed mid-walk; the caller abandons the block and flushes every block
    /// (spec.md §7 "Reset observed mid-block").
    pub reset: bool,
}

/// Drives the shared per-instruction loop for `block`, interpreting every instruction and,
/// whenever `emitter` is `Some`, also emitting host code for it (spec.md §4.6 "Walk").
///
/// `exec_ptr` is only dereferenced if `emitter` is `Some` and an emit helper's `ensure` call
/// forces eviction; see [`PoolRemover`] for the aliasing argument. Pass a dangling/null pointer
/// when `emitter` is `None` (mark-only pass never touches it).
#[allow(clippy::too_many_arguments)]
pub fn walk(
    block: BlockIdx,
    pool: &mut BlockPool,
    pages: &mut PageTable,
    hash: &mut HashIndex,
    exec_ptr: *mut ExecMemoryPool,
    cpu: &mut CpuState,
    mmu: &mut dyn Mmu,
    decoder: &mut dyn Decoder,
    opcodes: &OpcodeTable,
    timing: &dyn TimingProfile,
    mut emitter: Option<&mut Emitter>,
) -> WalkOutcome {
    let start_pc = pool.get(block).start_pc;
    let flags = pool.get(block).flags;
    let mut out =
        WalkOutcome { cycles: timing.block_start(), total_len: 0, aborted: false, reset: false };

    loop {
        let insn_linear = cpu.linear_pc();
        let decoded = match decoder.decode(insn_linear) {
            Ok(d) => d,
            Err(abort) => {
                cpu.abrt = Some(abort);
                out.aborted = true;
                break;
            }
        };

        let offset_in_page = insn_linear & 0xfff;
        let remaining_in_page1 = 4096 - offset_in_page;
        let crosses_page = u32::from(decoded.length) > remaining_in_page1;
        let phys2 = if crosses_page {
            let next_page_linear = (insn_linear & !0xfff).wrapping_add(4096);
            mmu.get_phys_noabrt(next_page_linear)
        } else {
            None
        };
        if let Some(p2) = phys2 {
            pool.get_mut(block).phys2 = p2;
            pool.get_mut(block).flags.insert(BlockFlags::HAS_PAGE2);
            pool.link_page_list(block, pages, p2, false);
        }
        let phys1 = pool.get(block).phys;
        smc::mark_code_present(pool, pages, block, phys1, phys2, offset_in_page, u32::from(decoded.length));

        if let Some(op) = decoded.fast_path {
            apply_fast_op(cpu, op);
            log::trace!("block {}: inlined fast path {:?}", block, op);
        } else {
            let handler = opcodes.get(decoded.opcode_index);
            let cpu_ptr = cpu as *mut CpuState as *mut u8;
            handler(cpu_ptr, decoded.fetchdat);
            log::trace!("block {}: interpreted opcode {:#x}", block, decoded.opcode_index);
        }

        if let Some(e) = emitter.as_mut() {
            let mut remover = PoolRemover { blocks: pool, pages, hash, exec: exec_ptr };
            emit_instruction(e, &mut remover, cpu, &decoded, opcodes);
        }

        out.cycles += timing.opcode(decoded.opcode_index);
        out.total_len += u32::from(decoded.length);
        cpu.pc = cpu.pc.wrapping_add(u32::from(decoded.length));

        if cpu.was_reset {
            out.reset = true;
            break;
        }
        if decoded.block_end {
            break;
        }
        if crosses_page {
            break;
        }
        if cpu.linear_pc().wrapping_sub(start_pc) >= max_block_size(flags, start_pc) {
            break;
        }
        if cpu.trap_flag {
            break;
        }
        if cpu.nmi_pending {
            break;
        }
        if cpu.abrt.is_some() {
            out.aborted = true;
            break;
        }
    }

    out
}

/// Applies a [`FastOp`]'s effect directly to the live register file, standing in for the
/// opaque interpretive handler call on the fast-path list (spec.md §4.6).
pub(crate) fn apply_fast_op(cpu: &mut CpuState, op: FastOp) {
    match op {
        FastOp::MovRegImm32 { dst, imm } => cpu.regs[dst as usize] = imm,
        FastOp::AddRegImm32 { dst, imm } => {
            cpu.regs[dst as usize] = cpu.regs[dst as usize].wrapping_add(imm)
        }
        FastOp::MovRegReg32 { dst, src } => cpu.regs[dst as usize] = cpu.regs[src as usize],
        FastOp::Terminate => {}
    }
}

fn reg_ptr(cpu: &mut CpuState, reg: u8) -> *mut u32 {
    &mut cpu.regs[reg as usize] as *mut u32
}

/// Emits host code reproducing one decoded instruction's effect: an inlined fast path if one was
/// decoded, otherwise a host call to the existing interpretive handler (spec.md §4.6 "emit a
/// host call ... or optionally inline a fast path").
fn emit_instruction(
    e: &mut Emitter,
    remover: &mut dyn BlockRemover,
    cpu: &mut CpuState,
    decoded: &crate::guest::DecodedInsn,
    opcodes: &OpcodeTable,
) {
    match decoded.fast_path {
        Some(FastOp::MovRegImm32 { dst, imm }) => {
            let addr = reg_ptr(cpu, dst);
            backend::emit_mov_mem32_imm32(e, remover, addr, imm);
        }
        Some(FastOp::AddRegImm32 { dst, imm }) => {
            let addr = reg_ptr(cpu, dst);
            backend::emit_add_mem32_imm32(e, remover, addr, imm);
        }
        Some(FastOp::MovRegReg32 { dst, src }) => {
            let dst_ptr = reg_ptr(cpu, dst);
            let src_ptr = reg_ptr(cpu, src) as *const u32;
            backend::emit_mov_mem32_mem32(e, remover, dst_ptr, src_ptr);
        }
        Some(FastOp::Terminate) => {
            backend::emit_terminate(e, remover);
        }
        None => {
            let handler = opcodes.get(decoded.opcode_index);
            let cpu_ptr = cpu as *mut CpuState as *mut u8;
            backend::emit_call_handler(e, remover, cpu_ptr, decoded.fetchdat, handler);
        }
    }
}

/// Ends the record-and-emit pass: bakes the block's total accumulated cycle cost into its own
/// compiled stream (spec.md §6 `codegen_block_cycles`; SPEC_FULL.md §3 "Timing-profile-driven
/// cycle accounting") and emits the exit thunk (spec.md §4.6 `block_end_recompile`). The caller
/// is responsible for flushing the instruction cache over `block`'s exec-memory chain and
/// setting `WAS_RECOMPILED` once this returns, since doing so needs an unaliased
/// `&ExecMemoryPool` that `emitter`'s borrow must release first.
pub fn block_end_recompile(
    mut emitter: Emitter,
    remover: &mut dyn BlockRemover,
    cycles_ptr: *mut i32,
    total_cycles: u32,
) {
    backend::emit_sub_mem32_imm32(&mut emitter, remover, cycles_ptr, total_cycles);
    backend::emit_exit_thunk(&mut emitter, remover);
    let _ = emitter.finish();
}

/// Ends a mark-only pass: nothing to emit, the block simply stays in its current (uncompiled)
/// state so a later visit can promote it (spec.md §4.6 "A cheaper variant -- `block_end()`").
pub fn block_end(_block: BlockIdx) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_memory::MmapProvider;
    use crate::guest::{Abort, DecodedInsn, Linear, REG_EAX};
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
    fn max_block_size_default_is_4000() {
        assert_eq!(max_block_size(BlockFlags::empty(), 0x1234), MAX_BLOCK_SIZE_DEFAULT);
        assert_eq!(MAX_BLOCK_SIZE_DEFAULT, 4000);
    }

    #[test]
    fn max_block_size_byte_mask_uses_capped_formula() {
        assert_eq!(max_block_size(BlockFlags::BYTE_MASK, 0x40), 103);
        assert_eq!(max_block_size(BlockFlags::BYTE_MASK, 0x7f), 103 - 0x3f);
    }

    #[test]
    fn block_init_installs_into_tree_hash_and_page_list() {
        let mut pool = BlockPool::new(4);
        let mut pages = PageTable::new();
        let mut hash = HashIndex::new();
        let mut exec = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut cpu = CpuState::default();
        cpu.pc = 0x1000;

        let block = block_init(&mut pool, &mut pages, &mut hash, &mut exec, &cpu, 0x1000);

        assert_eq!(hash.candidate(0x1000), block);
        assert_eq!(pages.get(0x1000).unwrap().list_head1, block);
        assert_eq!(pool.get(block).start_pc, 0x1000);
    }

    #[test]
    fn walk_mark_only_applies_fast_ops_and_advances_pc() {
        let mut pool = BlockPool::new(4);
        let mut pages = PageTable::new();
        let mut hash = HashIndex::new();
        let mut exec = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut cpu = CpuState::default();
        cpu.pc = 0x1000;
        let block = block_init(&mut pool, &mut pages, &mut hash, &mut exec, &cpu, 0x1000);

        let mut decoder = ScriptedDecoder {
            insns: vec![
                DecodedInsn {
                    opcode_index: 0,
                    fetchdat: 0,
                    length: 5,
                    block_end: false,
                    fast_path: Some(FastOp::MovRegImm32 { dst: REG_EAX, imm: 42 }),
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
        let mut mmu = NoopMmu;
        let opcodes = opcode_table();
        let timing = Flat;

        let outcome = walk(
            block,
            &mut pool,
            &mut pages,
            &mut hash,
            std::ptr::null_mut(),
            &mut cpu,
            &mut mmu,
            &mut decoder,
            &opcodes,
            &timing,
            None,
        );

        assert!(!outcome.aborted);
        assert!(!outcome.reset);
        assert_eq!(cpu.regs[REG_EAX as usize], 42);
        assert_eq!(cpu.pc, 0x1000 + 6);
        assert!(!pool.get(block).flags.contains(BlockFlags::WAS_RECOMPILED));
    }

    #[test]
    fn walk_stops_on_trap_flag() {
        let mut pool = BlockPool::new(4);
        let mut pages = PageTable::new();
        let mut hash = HashIndex::new();
        let mut exec = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let mut cpu = CpuState::default();
        cpu.pc = 0x2000;
        cpu.trap_flag = true;
        let block = block_init(&mut pool, &mut pages, &mut hash, &mut exec, &cpu, 0x2000);

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
        let mut mmu = NoopMmu;
        let opcodes = opcode_table();
        let timing = Flat;

        let outcome = walk(
            block,
            &mut pool,
            &mut pages,
            &mut hash,
            std::ptr::null_mut(),
            &mut cpu,
            &mut mmu,
            &mut decoder,
            &opcodes,
            &timing,
            None,
        );

        assert!(!outcome.aborted);
        assert_eq!(cpu.pc, 0x2001, "loop stops after exactly one instruction");
    }

    #[test]
    fn compile_pass_emits_host_bytes_and_can_be_closed_out() {
        let mut pool = BlockPool::new(4);
        let mut pages = PageTable::new();
        let mut hash = HashIndex::new();
        let mut exec = ExecMemoryPool::new(&mut MmapProvider, 4).unwrap();
        let exec_ptr: *mut ExecMemoryPool = &mut exec;
        let mut cpu = CpuState::default();
        cpu.pc = 0x3000;
        let block = block_init(&mut pool, &mut pages, &mut hash, &mut exec, &cpu, 0x3000);

        let mut emitter =
            block_start_recompile(&mut pool, &mut pages, &mut hash, &mut exec, exec_ptr, block);

        let mut decoder = ScriptedDecoder {
            insns: vec![
                DecodedInsn {
                    opcode_index: 0,
                    fetchdat: 0,
                    length: 5,
                    block_end: false,
                    fast_path: Some(FastOp::MovRegImm32 { dst: REG_EAX, imm: 42 }),
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
        let mut mmu = NoopMmu;
        let opcodes = opcode_table();
        let timing = Flat;

        let outcome = walk(
            block,
            &mut pool,
            &mut pages,
            &mut hash,
            exec_ptr,
            &mut cpu,
            &mut mmu,
            &mut decoder,
            &opcodes,
            &timing,
            Some(&mut emitter),
        );
        assert!(!outcome.aborted);
        assert!(emitter.position() > 0, "the compile pass must have written some host bytes");

        let mut remover = PoolRemover { blocks: &mut pool, pages: &mut pages, hash: &mut hash, exec: exec_ptr };
        let cycles_ptr = &mut cpu.cycles as *mut i32;
        block_end_recompile(emitter, &mut remover, cycles_ptr, outcome.cycles);

        let head = pool.get(block).head_exec_block;
        exec.clean_blocks(head);
        pool.get_mut(block).flags.insert(BlockFlags::WAS_RECOMPILED);
        assert!(pool.get(block).flags.contains(BlockFlags::WAS_RECOMPILED));
    }
}
