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

//! Interfaces the core consumes from the rest of the emulator (spec.md §6).
//!
//! None of these are implemented here: the guest MMU, the opcode decoder, the interrupt
//! controller and the interpretive memory functions all live outside the translation core.
//! This module only names the shapes the core calls through.

use crate::status::Status;

/// A guest physical address (within a single address space, no segment/protection bits).
pub type Phys = u32;

/// A guest linear address (`CS_base + IP`, flattened).
pub type Linear = u32;

/// Reason a guest memory access aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort(pub u32);

/// Guest MMU, used only via address translation (spec.md §6).
pub trait Mmu {
    /// Translates a linear address to a physical one. May fault (sets an abort condition the
    /// dispatcher observes via [`CpuState::abrt`]).
    fn get_phys(&mut self, virt: Linear) -> Result<Phys, Abort>;

    /// Same as [`Mmu::get_phys`], but never raises a fault; returns `None` instead. Used for the
    /// second page of a two-page block, where a fault must be deferred (spec.md §9 supplement).
    fn get_phys_noabrt(&mut self, virt: Linear) -> Option<Phys>;
}

/// The interpretive memory layer, used both for the interpreter path and as the slow path of
/// the host load/store trampolines (spec.md §4.8).
pub trait MemoryAccess {
    /// Fetches 4 bytes for instruction prefetch. May aborts via the returned `Result`.
    fn fastreadl(&mut self, addr: Linear) -> Result<u32, Abort>;

    /// Slow-path guest memory read of `width` bytes (1, 2, 4 or 8).
    fn read_slow(&mut self, addr: Linear, width: u8) -> Result<u64, Abort>;

    /// Slow-path guest memory write of `width` bytes (1, 2, 4 or 8).
    fn write_slow(&mut self, addr: Linear, width: u8, value: u64) -> Result<(), Abort>;
}

/// Pollable interrupt controller (spec.md §4.7/§6 `picinterrupt`).
pub trait InterruptController {
    /// Returns the pending maskable interrupt vector, if any and if the guest has interrupts
    /// enabled.
    fn pending_maskable(&self) -> Option<u8>;

    /// Acknowledges the interrupt returned by the last call to `pending_maskable`.
    fn acknowledge(&mut self) -> u8;
}

/// The guest instruction decoder, used only via this narrow interface (spec.md §1 "the guest
/// instruction decoder and semantic interpreters for individual opcodes" are named collaborators,
/// not part of the core).
///
/// A real decoder consumes bytes from the guest's physical/linear address space itself (through
/// whatever prefetch/TLB path it already owns); the core only ever asks it "what is the
/// instruction at this linear address, given this operand-size default".
pub trait Decoder {
    /// Decodes the single instruction at `linear_pc`. The decoder owns whatever operand-size
    /// default/addressing mode the guest is currently in and folds it into
    /// [`DecodedInsn::opcode_index`] itself; the core never computes that fold. Returns `Err` if
    /// the fetch itself aborted (e.g. the first byte lies on an unmapped page); the
    /// translator/interpreter then treats this exactly like any other guest fault (spec.md §4.7
    /// "abort raised").
    fn decode(&mut self, linear_pc: Linear) -> Result<DecodedInsn, Abort>;
}

/// One decoded guest instruction, as produced by the (external) decoder.
///
/// The decoder itself is out of scope (spec.md §1); the translator and interpreter only see
/// this summary.
#[derive(Debug, Clone)]
pub struct DecodedInsn {
    /// Opcode index into the handler table, already folded with the operand-size bit the way
    /// `(opcode | op32) & 0x3ff` does in the original (spec.md §6).
    pub opcode_index: u16,
    /// Raw bytes consumed by this instruction (`fetchdat` payload passed to the handler).
    pub fetchdat: u32,
    /// Number of guest bytes this instruction occupies.
    pub length: u8,
    /// Set by instructions that unconditionally end a block (jumps, string ops, `int`, ...).
    pub block_end: bool,
    /// A fast path the translator may inline instead of emitting a call, if the opcode is on
    /// the fast-path list (spec.md §4.6).
    pub fast_path: Option<FastOp>,
}

/// Index of `EAX` within [`CpuState::regs`], the canonical "return value" register inspected by
/// the end-to-end scenarios in spec.md §8.
pub const REG_EAX: u8 = 0;

/// A small catalogue of opcodes cheap enough to inline directly as host code rather than a
/// call into the interpreter (spec.md §4.6 "optionally inline a fast path").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastOp {
    /// `mov reg32, imm32`
    MovRegImm32 { dst: u8, imm: u32 },
    /// `add reg32, imm32`
    AddRegImm32 { dst: u8, imm: u32 },
    /// `mov reg32, reg32`
    MovRegReg32 { dst: u8, src: u8 },
    /// Unconditional block-end with no side effect other than returning to the dispatcher
    /// (stands in for `ret`/`hlt`-style terminators in tests).
    Terminate,
}

/// Function pointer type for the guest opcode handler table (spec.md §6 `x86_opcodes[]`).
///
/// Handlers take a pointer to the interpreter's CPU state and the instruction's `fetchdat`;
/// this matches the host-ABI call the emitter produces for non-fast-path instructions.
pub type OpcodeHandler = extern "C" fn(cpu_state: *mut u8, fetchdat: u32);

/// Table of 1024 opcode handlers, indexed by `(opcode | op32_flag) & 0x3ff` (spec.md §6).
pub struct OpcodeTable {
    handlers: [OpcodeHandler; 1024],
}

impl OpcodeTable {
    /// Builds a table from a full 1024-entry slice.
    pub fn new(handlers: [OpcodeHandler; 1024]) -> Self {
        OpcodeTable { handlers }
    }

    /// Looks up the handler for a folded `(opcode | op32) & 0x3ff` index.
    pub fn get(&self, index: u16) -> OpcodeHandler {
        self.handlers[(index & 0x3ff) as usize]
    }
}

/// Live CPU state the dispatcher reads and writes at block boundaries.
///
/// This is a deliberately thin slice of what a real interpreter core tracks: only the fields
/// the dispatch loop and translator need to decide block boundaries, SMC validity and
/// interrupt delivery (spec.md §3 "status", §4.7, §5).
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuState {
    /// Current instruction pointer (offset within `cs_base`).
    pub pc: u32,
    /// Current code-segment base.
    pub cs_base: u32,
    /// The eight 32-bit general-purpose registers (EAX..EDI, in that index order), matching
    /// `cpu_state.regs[]` in the original. [`FastOp`] and the interpretive opcode handlers both
    /// address registers through this array; the translator never assumes their host layout
    /// beyond the baked-in pointer it takes at block-compile time (spec.md §4.6/§4.8).
    pub regs: [u32; 8],
    /// Captured status bits (spec.md §4.4).
    pub status: Status,
    /// FPU top-of-stack pointer (0..=7).
    pub fpu_top: u8,
    /// Code cache disabled (`CR0.CD`) or single-step trap flag forces pure interpretation.
    pub cache_disabled: bool,
    /// Trap flag latched for the *next* instruction boundary.
    pub trap_flag: bool,
    /// Non-maskable interrupt pending and unmasked.
    pub nmi_pending: bool,
    /// Guest-visible abort condition, if any, raised during the last memory access.
    pub abrt: Option<Abort>,
    /// Set by the interpreter/translator callbacks when a reset was observed mid-block.
    pub was_reset: bool,
    /// Remaining cycle budget for the current [`crate::Dynarec::exec`] period.
    ///
    /// Unlike every other field here, compiled code writes this directly: the translator bakes
    /// a `sub [cycles_ptr], total_cycles` into every compiled block right before its exit thunk
    /// (spec.md §6 `codegen_block_cycles`), so the dispatcher doesn't need to re-derive a
    /// just-executed compiled block's cost after the fact. The interpreter path and the
    /// mark-only translator pass instead decrement it directly in Rust from
    /// [`crate::translator::WalkOutcome::cycles`].
    pub cycles: i32,
    /// Guest `EFLAGS.IF`: whether maskable interrupts are currently accepted (spec.md §4.7 "if
    /// PIC has a pending maskable interrupt and IF is set, accept it").
    pub interrupts_enabled: bool,
}

impl CpuState {
    /// The guest's current linear program counter (`cs_base + pc`).
    pub fn linear_pc(&self) -> Linear {
        self.cs_base.wrapping_add(self.pc)
    }
}

/// Guest-specific bookkeeping the dispatcher invokes around block boundaries (spec.md §4.7 step
/// 3), kept separate from [`Decoder`]/[`OpcodeTable`] because none of it runs on the hot path of
/// ordinary execution -- only on the exceptional transitions (fault, trap, interrupt, reset).
pub trait GuestHooks {
    /// Recomputes any lazily-evaluated condition-code/flag state after a block has run
    /// (spec.md §4.7 step 3 "rebuild lazy flags").
    fn rebuild_flags(&mut self, cpu: &mut CpuState);

    /// Enters the guest's abort/fault handler for the condition recorded in `cpu.abrt` before
    /// this call (already taken by the caller). If entering the handler itself faults, the
    /// implementation sets `cpu.abrt` again; the dispatcher reads this as a double fault
    /// (spec.md §7 "Double fault").
    fn handle_abort(&mut self, cpu: &mut CpuState);

    /// Synthesises guest entry into interrupt vector `vector` (INT1 for the trap flag, INT2 for
    /// NMI, INT8 for a double fault, or a PIC-supplied vector for a maskable interrupt;
    /// spec.md §4.7 step 3, §6 `pmodeint`).
    fn inject_interrupt(&mut self, cpu: &mut CpuState, vector: u8);

    /// Full guest reset, the triple-fault escalation target (spec.md §6 `softresetx86`, §7
    /// "Double fault" recovery row).
    fn soft_reset(&mut self, cpu: &mut CpuState);
}

/// Host real-time timer service driven once per dispatch period has elapsed (spec.md §4.7 step
/// 4 "drive the platform timer service").
pub trait PlatformTimer {
    /// Advances whatever host-side timer/RTC emulation the caller owns by one period.
    fn tick(&mut self);
}
