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

//! AArch64 host encodings.
//!
//! The original carries a third backend alongside x86-32/x86-64 (spec.md §9
//! "Host-arch portability"); this module is its placeholder. The per-opcode encoders below are
//! unimplemented pending a real AArch64 instruction encoder -- `±128 MiB` branch-range arena
//! sizing (spec.md §3 "Arena") and `clean_blocks`' range flush (already implemented in
//! [`crate::exec_memory`]) are the only pieces of AArch64 support actually exercised today, so
//! the crate compiles and runs its x86_64-gated tests without this module being complete.
//! TODO: port `codegen_backend_x86_ops.c`'s routines to AArch64 A64 encodings.

use crate::emitter::{Emitter, Patch};
use crate::exec_memory::BlockRemover;

/// AArch64 instructions are fixed 4 bytes wide; an unconditional branch (`B`) covers ±128 MiB in
/// one instruction (spec.md §3 "Arena").
pub const JMP_REL32_LEN: usize = 4;

pub const TERMINATE_SENTINEL: u32 = 0xcafe_babe;

pub(crate) fn emit_jmp_rel32(_e: &mut Emitter, _target: *mut u8) {
    unimplemented!("AArch64 backend: chaining jump encoder not yet implemented")
}

pub fn emit_mov_mem32_imm32(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _addr: *mut u32, _imm: u32) {
    unimplemented!("AArch64 backend: fast-path MovRegImm32 not yet implemented")
}

pub fn emit_add_mem32_imm32(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _addr: *mut u32, _imm: u32) {
    unimplemented!("AArch64 backend: fast-path AddRegImm32 not yet implemented")
}

pub fn emit_mov_mem32_mem32(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _dst: *mut u32, _src: *const u32) {
    unimplemented!("AArch64 backend: fast-path MovRegReg32 not yet implemented")
}

pub fn emit_sub_mem32_imm32(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _addr: *mut i32, _imm: u32) {
    unimplemented!("AArch64 backend: cycle-charge subtraction not yet implemented")
}

pub fn emit_terminate(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: Terminate fast-path not yet implemented")
}

pub fn emit_call_handler(
    _e: &mut Emitter,
    _remover: &mut dyn BlockRemover,
    _cpu_state: *mut u8,
    _fetchdat: u32,
    _handler: crate::guest::OpcodeHandler,
) {
    unimplemented!("AArch64 backend: handler call encoder not yet implemented")
}

pub fn emit_exit_thunk(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: exit thunk encoder not yet implemented")
}

pub fn emit_ret(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: ret encoder not yet implemented")
}

pub fn emit_test_edi_imm32(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _imm: u32) {
    unimplemented!("AArch64 backend: trampoline alignment test not yet implemented")
}

pub fn emit_jnz_short(_e: &mut Emitter, _remover: &mut dyn BlockRemover) -> Patch {
    unimplemented!("AArch64 backend: conditional branch encoder not yet implemented")
}

pub fn emit_jz_short(_e: &mut Emitter, _remover: &mut dyn BlockRemover) -> Patch {
    unimplemented!("AArch64 backend: conditional branch encoder not yet implemented")
}

pub fn patch_short_to_here(_patch: &Patch, _e: &Emitter) {
    unimplemented!("AArch64 backend: branch patching not yet implemented")
}

pub fn emit_mov_rax_rdi(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: register move not yet implemented")
}

pub fn emit_shr_rax_imm8(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _imm: u8) {
    unimplemented!("AArch64 backend: shift encoder not yet implemented")
}

pub fn emit_load_lookup_entry(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _table_base: *const isize) {
    unimplemented!("AArch64 backend: TLB lookup load not yet implemented")
}

pub fn emit_cmp_rsi_neg1(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: compare encoder not yet implemented")
}

pub fn emit_xor_edx_edx(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: zeroing idiom not yet implemented")
}

pub fn emit_save_rsi_to_r10(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: trampoline register shuffle not yet implemented")
}

pub fn emit_mov_esi_edi(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: trampoline register shuffle not yet implemented")
}

pub fn emit_mov_edx_imm32(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _imm: u32) {
    unimplemented!("AArch64 backend: trampoline register shuffle not yet implemented")
}

pub fn emit_mov_rcx_r10(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: trampoline register shuffle not yet implemented")
}

pub fn emit_load_ctx_rdi(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _ctx: *const u8) {
    unimplemented!("AArch64 backend: trampoline slow-path call not yet implemented")
}

pub fn emit_call_abs(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _target: *const u8) {
    unimplemented!("AArch64 backend: trampoline slow-path call not yet implemented")
}

pub fn emit_lea_rax_rsi_plus_rdi(_e: &mut Emitter, _remover: &mut dyn BlockRemover) {
    unimplemented!("AArch64 backend: trampoline address computation not yet implemented")
}

pub fn emit_load_from_rax_width(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _width: u8) {
    unimplemented!("AArch64 backend: trampoline load not yet implemented")
}

pub fn emit_store_r10_to_rax_width(_e: &mut Emitter, _remover: &mut dyn BlockRemover, _width: u8) {
    unimplemented!("AArch64 backend: trampoline store not yet implemented")
}
