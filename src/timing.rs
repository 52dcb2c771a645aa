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

//! Per-CPU cycle-cost tables (spec.md §6 `codegen_timing_set`, SPEC_FULL.md §2.3/§3).
//!
//! The original (`model.c`) wires one of several fixed per-model vtables of cycle costs into
//! the dynarec at machine-construction time. This crate exposes the same vtable shape as a
//! trait object so callers can plug in their own tables without this crate needing to know
//! about every CPU model that ever existed; the five profiles the original names are provided
//! as built-ins, plus a `Flat` profile this crate defaults to so it is usable standalone.

/// Per-CPU cycle-cost vtable consulted by the translator to accumulate `codegen_block_cycles`
/// and by the dispatcher to drain the cycle budget (spec.md §6).
pub trait TimingProfile: Send {
    /// Cycles charged once at the very start of a block.
    fn block_start(&self) -> u32 {
        0
    }

    /// Cycles charged for each instruction prefix byte (segment override, operand-size, lock...).
    fn prefix(&self) -> u32 {
        0
    }

    /// Cycles charged for one decoded opcode, given its folded `(opcode | op32) & 0x3ff` index.
    fn opcode(&self, opcode_index: u16) -> u32;

    /// Cycles charged once at block end (exit-thunk overhead).
    fn block_end(&self) -> u32 {
        0
    }

    /// Cycles charged for a taken control-flow transfer (branch, call, block-chaining jump).
    fn jump_cycles(&self) -> u32 {
        0
    }
}

/// One cycle per instruction, no prefix/jump/block overhead. Used as this crate's default and
/// by tests that don't care about timing fidelity (SPEC_FULL.md §2.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct Flat;

impl TimingProfile for Flat {
    fn opcode(&self, _opcode_index: u16) -> u32 {
        1
    }
}

/// Intel Pentium-class costs (grounded on `model.c`'s Pentium cycle tables: 1-cycle decode with
/// a 1-cycle prefix tax and no superscalar modelling, which this crate does not attempt).
#[derive(Debug, Clone, Copy, Default)]
pub struct Pentium;

impl TimingProfile for Pentium {
    fn block_start(&self) -> u32 {
        1
    }
    fn prefix(&self) -> u32 {
        1
    }
    fn opcode(&self, _opcode_index: u16) -> u32 {
        1
    }
    fn jump_cycles(&self) -> u32 {
        2
    }
}

/// Intel 80486-class costs: cheaper prefixes, pricier taken branches (no branch prediction).
#[derive(Debug, Clone, Copy, Default)]
pub struct I486;

impl TimingProfile for I486 {
    fn block_start(&self) -> u32 {
        1
    }
    fn opcode(&self, _opcode_index: u16) -> u32 {
        2
    }
    fn jump_cycles(&self) -> u32 {
        3
    }
}

/// AMD K6-class costs.
#[derive(Debug, Clone, Copy, Default)]
pub struct K6;

impl TimingProfile for K6 {
    fn block_start(&self) -> u32 {
        1
    }
    fn prefix(&self) -> u32 {
        1
    }
    fn opcode(&self, _opcode_index: u16) -> u32 {
        1
    }
    fn jump_cycles(&self) -> u32 {
        1
    }
}

/// Intel Pentium II ("686")-class costs: cheap branches from a deeper pipeline's prediction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pentium2;

impl TimingProfile for Pentium2 {
    fn block_start(&self) -> u32 {
        1
    }
    fn opcode(&self, _opcode_index: u16) -> u32 {
        1
    }
    fn jump_cycles(&self) -> u32 {
        1
    }
}

/// WinChip-class costs: single in-order pipeline, no branch prediction at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct WinChip;

impl TimingProfile for WinChip {
    fn block_start(&self) -> u32 {
        1
    }
    fn prefix(&self) -> u32 {
        1
    }
    fn opcode(&self, _opcode_index: u16) -> u32 {
        2
    }
    fn jump_cycles(&self) -> u32 {
        4
    }
}
