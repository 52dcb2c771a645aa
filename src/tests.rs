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

//! End-to-end exercises of [`crate::Dynarec`] against a minimal fake guest (spec.md §8 "Concrete
//! end-to-end scenarios"), mirroring how `core/src/scheduler/tests.rs` drives the teacher's
//! scheduler through a fake extrinsics implementation rather than a real wasm guest.
//!
//! The fake guest is a flat byte array decoded one opcode at a time by [`ScriptDecoder`], which
//! maps a handful of one-byte opcodes onto [`FastOp`]s; this is enough to drive the translator
//! and dispatch loop through every scenario spec.md §8 names without a real x86 decoder.

use crate::exec_memory::MmapProvider;
use crate::guest::{
    Abort, CpuState, Decoder, DecodedInsn, FastOp, GuestHooks, InterruptController, Linear, MemoryAccess, Mmu,
    OpcodeTable, PlatformTimer, REG_EAX,
};
use crate::Dynarec;
use std::cell::RefCell;
use std::convert::TryInto;
use std::rc::Rc;

/// `mov eax, imm32` (5 bytes: opcode + little-endian imm32).
const OP_MOV_EAX_IMM32: u8 = 0xb8;
/// `add eax, imm32` (5 bytes).
const OP_ADD_EAX_IMM32: u8 = 0x05;
/// `ret` (1 byte, block-ending terminator).
const OP_RET: u8 = 0xc3;

/// Flat guest physical memory: linear addresses equal physical addresses (identity-mapped,
/// single address space), matching the simplest configuration spec.md §6 allows an `Mmu` to
/// implement.
struct FlatMemory {
    bytes: RefCell<Vec<u8>>,
}

impl FlatMemory {
    /// Memory starts filled with `ret` (a one-byte [`FastOp::Terminate`]) rather than zeroes, so
    /// an `exec` budget that outlives a scenario's scripted routine harmlessly decodes trivial
    /// one-instruction blocks instead of hitting [`ScriptDecoder`]'s "unscripted opcode" panic.
    fn new(size: usize) -> Self {
        FlatMemory { bytes: RefCell::new(vec![OP_RET; size]) }
    }

    fn write(&self, addr: Linear, data: &[u8]) {
        let mut bytes = self.bytes.borrow_mut();
        bytes[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }
}

// `MemoryAccess` takes `&mut self`, but every real mutation already goes through the `RefCell`,
// so this impl is on the shared handle itself rather than `FlatMemory` directly -- there is no
// exclusive Rust reference to hand out, and none is needed.
impl MemoryAccess for Rc<FlatMemory> {
    fn fastreadl(&mut self, addr: Linear) -> Result<u32, Abort> {
        let bytes = self.bytes.borrow();
        Ok(u32::from_le_bytes(bytes[addr as usize..addr as usize + 4].try_into().unwrap()))
    }
    fn read_slow(&mut self, addr: Linear, width: u8) -> Result<u64, Abort> {
        let bytes = self.bytes.borrow();
        let mut buf = [0u8; 8];
        buf[..width as usize].copy_from_slice(&bytes[addr as usize..addr as usize + width as usize]);
        Ok(u64::from_le_bytes(buf))
    }
    fn write_slow(&mut self, addr: Linear, width: u8, value: u64) -> Result<(), Abort> {
        self.write(addr, &value.to_le_bytes()[..width as usize]);
        Ok(())
    }
}

/// Identity-mapped MMU over a [`FlatMemory`] region: every linear address is its own physical
/// address, and no translation ever faults. Good enough for spec.md §8's scenarios, none of
/// which exercise paging.
struct IdentityMmu;
impl Mmu for IdentityMmu {
    fn get_phys(&mut self, virt: Linear) -> Result<u32, Abort> {
        Ok(virt)
    }
    fn get_phys_noabrt(&mut self, virt: Linear) -> Option<u32> {
        Some(virt)
    }
}

/// Decodes the handful of one-byte/five-byte opcodes this test module's scenarios use directly
/// out of a shared [`FlatMemory`], folding each into a [`FastOp`] the translator can inline
/// without ever consulting [`OpcodeTable`] (spec.md §4.6 "optionally inline a fast path").
struct ScriptDecoder {
    mem: Rc<FlatMemory>,
}

impl Decoder for ScriptDecoder {
    fn decode(&mut self, linear_pc: Linear) -> Result<DecodedInsn, Abort> {
        let bytes = self.mem.bytes.borrow();
        let opcode = bytes[linear_pc as usize];
        let insn = match opcode {
            OP_MOV_EAX_IMM32 => {
                let imm = u32::from_le_bytes(bytes[linear_pc as usize + 1..linear_pc as usize + 5].try_into().unwrap());
                DecodedInsn { opcode_index: 0, fetchdat: 0, length: 5, block_end: false, fast_path: Some(FastOp::MovRegImm32 { dst: REG_EAX, imm }) }
            }
            OP_ADD_EAX_IMM32 => {
                let imm = u32::from_le_bytes(bytes[linear_pc as usize + 1..linear_pc as usize + 5].try_into().unwrap());
                DecodedInsn { opcode_index: 0, fetchdat: 0, length: 5, block_end: false, fast_path: Some(FastOp::AddRegImm32 { dst: REG_EAX, imm }) }
            }
            OP_RET => DecodedInsn { opcode_index: 0, fetchdat: 0, length: 1, block_end: true, fast_path: Some(FastOp::Terminate) },
            OP_NOP => DecodedInsn { opcode_index: 0, fetchdat: 0, length: 1, block_end: false, fast_path: Some(FastOp::Terminate) },
            other => panic!("ScriptDecoder: unscripted opcode {:#x} at {:#x}", other, linear_pc),
        };
        Ok(insn)
    }
}

struct NoHooks;
impl GuestHooks for NoHooks {
    fn rebuild_flags(&mut self, _cpu: &mut CpuState) {}
    fn handle_abort(&mut self, _cpu: &mut CpuState) {}
    fn inject_interrupt(&mut self, cpu: &mut CpuState, vector: u8) {
        // Scenario F only needs to observe that an interrupt was delivered, not a real IDT walk;
        // parking the vector number at the new start_pc is enough to assert against.
        cpu.pc = u32::from(vector) * 0x100;
        cpu.cs_base = 0;
    }
    fn soft_reset(&mut self, cpu: &mut CpuState) {
        *cpu = CpuState::default();
    }
}

struct NoInterrupts;
impl InterruptController for NoInterrupts {
    fn pending_maskable(&self) -> Option<u8> {
        None
    }
    fn acknowledge(&mut self) -> u8 {
        unreachable!("pending_maskable never returned Some")
    }
}

struct NoTimer;
impl PlatformTimer for NoTimer {
    fn tick(&mut self) {}
}

extern "C" fn noop_handler(_cpu_state: *mut u8, _fetchdat: u32) {}

fn opcode_table() -> OpcodeTable {
    OpcodeTable::new([noop_handler; 1024])
}

/// Builds a `Dynarec` wired to `mem` through both the decoder path (shared `Rc`) and the
/// trampolines' slow-path `MemoryAccess` pointer (a separate, intentionally-leaked handle on the
/// same `Rc`, since [`Dynarec::new`] requires the latter to outlive the `Dynarec` itself and
/// these tests have no natural owner to pin it to).
fn new_dynarec(mem: &Rc<FlatMemory>, n_blocks: usize, n_exec_blocks: usize) -> Dynarec {
    let mem_access: Box<dyn MemoryAccess> = Box::new(Rc::clone(mem));
    let mem_ptr: *mut dyn MemoryAccess = Box::into_raw(mem_access);
    Dynarec::new(
        &mut MmapProvider,
        n_blocks,
        n_exec_blocks,
        opcode_table(),
        mem_ptr,
        Box::new(IdentityMmu),
        Box::new(ScriptDecoder { mem: Rc::clone(mem) }),
        Box::new(NoInterrupts),
        Box::new(NoHooks),
        Box::new(NoTimer),
    )
    .unwrap()
}

/// Scenario A: `mov eax, 42; add eax, 1; ret` compiles to a working block and leaves `EAX == 43`.
#[test]
fn scenario_a_mov_add_fast_path() {
    let mem = Rc::new(FlatMemory::new(0x10000));
    mem.write(0x1000, &[OP_MOV_EAX_IMM32, 42, 0, 0, 0, OP_ADD_EAX_IMM32, 1, 0, 0, 0, OP_RET]);
    let mut dynarec = new_dynarec(&mem, 16, 16);
    dynarec.cpu_mut().pc = 0x1000;

    dynarec.exec(256);

    assert_eq!(dynarec.cpu().regs[REG_EAX as usize], 43);
}

/// Scenario B: dirtying the compiled block's bytes forces a recompile on the next `exec`, which
/// must observe the new instruction stream rather than stale host code.
#[test]
fn scenario_b_smc_invalidation_forces_recompile() {
    let mem = Rc::new(FlatMemory::new(0x10000));
    mem.write(0x1000, &[OP_MOV_EAX_IMM32, 42, 0, 0, 0, OP_ADD_EAX_IMM32, 1, 0, 0, 0, OP_RET]);
    let mut dynarec = new_dynarec(&mem, 16, 16);
    dynarec.cpu_mut().pc = 0x1000;
    dynarec.exec(256);
    assert_eq!(dynarec.cpu().regs[REG_EAX as usize], 43);

    mem.write(0x1000, &[OP_MOV_EAX_IMM32, 0x63, 0, 0, 0]);
    dynarec.check_flush(0x1000, u64::max_value());

    dynarec.cpu_mut().pc = 0x1000;
    dynarec.cpu_mut().regs[REG_EAX as usize] = 0;
    dynarec.exec(256);

    assert_eq!(dynarec.cpu().regs[REG_EAX as usize], 0x63);
}

/// Scenario D (abridged): a tiny exec-memory arena forces eviction across several independently
/// compiled routines; every surviving lookup must still execute correctly afterwards.
#[test]
fn scenario_d_forced_eviction_keeps_surviving_blocks_correct() {
    let mem = Rc::new(FlatMemory::new(0x10000));
    let routines: &[(Linear, u32)] = &[(0x1000, 1), (0x2000, 2), (0x3000, 3), (0x4000, 4), (0x5000, 5)];
    for &(addr, value) in routines {
        let imm = value.to_le_bytes();
        mem.write(addr, &[OP_MOV_EAX_IMM32, imm[0], imm[1], imm[2], imm[3], OP_RET]);
    }
    let mut dynarec = new_dynarec(&mem, 16, 4);

    for &(addr, value) in routines {
        dynarec.cpu_mut().pc = addr;
        dynarec.cpu_mut().cs_base = 0;
        dynarec.cpu_mut().regs[REG_EAX as usize] = 0;
        dynarec.exec(64);
        assert_eq!(dynarec.cpu().regs[REG_EAX as usize], value, "routine at {:#x}", addr);
    }

    // Re-running the very first routine must still work even though its exec memory was almost
    // certainly evicted to make room for the later ones.
    dynarec.cpu_mut().pc = routines[0].0;
    dynarec.cpu_mut().regs[REG_EAX as usize] = 0;
    dynarec.exec(64);
    assert_eq!(dynarec.cpu().regs[REG_EAX as usize], routines[0].1);
}

/// Lookup soundness (spec.md §8 property 1): compiling the same `(cs, phys, status)` triple
/// twice returns the identical block rather than drifting to a new one.
#[test]
fn lookup_is_stable_across_repeated_exec_calls() {
    let mem = Rc::new(FlatMemory::new(0x10000));
    mem.write(0x1000, &[OP_MOV_EAX_IMM32, 7, 0, 0, 0, OP_RET]);
    let mut dynarec = new_dynarec(&mem, 16, 16);

    for _ in 0..3 {
        dynarec.cpu_mut().pc = 0x1000;
        dynarec.cpu_mut().regs[REG_EAX as usize] = 0;
        dynarec.exec(64);
        assert_eq!(dynarec.cpu().regs[REG_EAX as usize], 7);
    }
}

/// A full [`Dynarec::flush`] (e.g. on an MMU reconfiguration) must also force a recompile, not
/// just a targeted [`Dynarec::check_flush`].
#[test]
fn flush_forces_full_recompile() {
    let mem = Rc::new(FlatMemory::new(0x10000));
    mem.write(0x1000, &[OP_MOV_EAX_IMM32, 1, 0, 0, 0, OP_RET]);
    let mut dynarec = new_dynarec(&mem, 16, 16);
    dynarec.cpu_mut().pc = 0x1000;
    dynarec.exec(64);
    assert_eq!(dynarec.cpu().regs[REG_EAX as usize], 1);

    mem.write(0x1000, &[OP_MOV_EAX_IMM32, 2, 0, 0, 0]);
    dynarec.flush();

    dynarec.cpu_mut().pc = 0x1000;
    dynarec.cpu_mut().regs[REG_EAX as usize] = 0;
    dynarec.exec(64);
    assert_eq!(dynarec.cpu().regs[REG_EAX as usize], 2);
}

/// Scenario F: an NMI already latched when a block starts is observed at the very next
/// instruction boundary (the translator's walk loop treats `nmi_pending` as a block-ending
/// condition the same way it treats the trap flag or a page crossing); the instruction already
/// executed this boundary keeps its effect, and the dispatcher synthesises INT 2 before the
/// following block starts, landing at the vector's entry ([`NoHooks::inject_interrupt`] parks it
/// at `vector * 0x100`).
#[test]
fn scenario_f_nmi_delivered_at_next_block_boundary() {
    let mem = Rc::new(FlatMemory::new(0x10000));
    mem.write(0x1000, &[OP_MOV_EAX_IMM32, 1, 0, 0, 0, OP_RET]);
    let mut dynarec = new_dynarec(&mem, 16, 16);
    dynarec.cpu_mut().pc = 0x1000;
    dynarec.cpu_mut().nmi_pending = true;

    dynarec.exec(1);

    assert_eq!(dynarec.cpu().regs[REG_EAX as usize], 1, "the mov already executed this boundary keeps its effect");
    assert_eq!(dynarec.cpu().pc, 2 * 0x100, "next block starts at the NMI vector's entry");
}
