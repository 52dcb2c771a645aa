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

//! x86-64 host encodings (grounded on `codegen_backend_x86_ops.c`/
//! `codegen_backend_x86_ops_helpers.h`, reworked from the original's 32-bit encodings to the
//! SysV x86-64 ABI this crate actually runs on).
//!
//! Every helper here calls [`Emitter::ensure`] with its exact worst-case size before appending
//! bytes, mirroring `codegen_alloc_bytes` in the original.

use crate::emitter::{Emitter, Patch};
use crate::exec_memory::BlockRemover;

/// Length of the `jmp rel32` chaining-jump encoding (spec.md §4.2; mirrors `JMP_LEN_BYTES` in
/// the original, widened from a 32-bit absolute to a rel32 since both hosts use the same
/// encoding width).
pub const JMP_REL32_LEN: usize = 5;

fn rel32(from_next_insn: *const u8, target: *const u8) -> i32 {
    let delta = (target as isize) - (from_next_insn as isize);
    // The arena is capped (spec.md §3 "Arena") to stay within a host's unconditional-jump
    // range, so this cast never truncates in practice; debug_assert catches a misconfigured
    // arena rather than silently wrapping.
    debug_assert!(delta >= i32::min_value() as isize && delta <= i32::max_value() as isize);
    delta as i32
}

/// Emits `jmp rel32` from the cursor's current position to `target` (spec.md §4.2
/// `codegen_allocate_new_block`'s chaining jump).
pub(crate) fn emit_jmp_rel32(e: &mut Emitter, target: *mut u8) {
    // SAFETY: called only from `Emitter::allocate_new_block`, which has already verified the
    // reserve covers `JMP_REL32_LEN` bytes (it is `JUMP_RESERVE`, kept equal by construction).
    let next = unsafe { e.next_insn_addr().add(JMP_REL32_LEN) };
    let disp = rel32(next, target);
    e.emit_u8(0xe9);
    e.emit_u32(disp as u32);
}

/// `movabs rax, imm64` -- `48 B8 <imm64>`.
fn movabs_rax(e: &mut Emitter, imm: u64) {
    e.emit_u8(0x48);
    e.emit_u8(0xb8);
    e.emit_u64(imm);
}

/// `movabs rcx, imm64` -- `48 B9 <imm64>`.
fn movabs_rcx(e: &mut Emitter, imm: u64) {
    e.emit_u8(0x48);
    e.emit_u8(0xb9);
    e.emit_u64(imm);
}

/// `movabs rdi, imm64` -- `48 BF <imm64>`.
fn movabs_rdi(e: &mut Emitter, imm: u64) {
    e.emit_u8(0x48);
    e.emit_u8(0xbf);
    e.emit_u64(imm);
}

/// `mov esi, imm32` -- `BE <imm32>`.
fn mov_esi_imm32(e: &mut Emitter, imm: u32) {
    e.emit_u8(0xbe);
    e.emit_u32(imm);
}

/// `ret` -- `C3`.
fn ret(e: &mut Emitter) {
    e.emit_u8(0xc3);
}

const RET_LEN: usize = 1;

/// Emits a fast-path `mov [addr], imm32` (spec.md §4.6 `FastOp::MovRegImm32`): writes `imm`
/// directly into the guest register cell at `addr` (a stable pointer into the live
/// [`crate::guest::CpuState::regs`] array baked into the compiled stream, the same way the
/// original bakes `&cpu_state` into its prologue).
pub fn emit_mov_mem32_imm32(e: &mut Emitter, remover: &mut dyn BlockRemover, addr: *mut u32, imm: u32) {
    e.ensure(10 + 6, remover);
    movabs_rax(e, addr as u64);
    // `mov dword [rax], imm32` -- `C7 00 <imm32>`.
    e.emit_u8(0xc7);
    e.emit_u8(0x00);
    e.emit_u32(imm);
}

/// Emits a fast-path `add [addr], imm32` (spec.md §4.6 `FastOp::AddRegImm32`).
pub fn emit_add_mem32_imm32(e: &mut Emitter, remover: &mut dyn BlockRemover, addr: *mut u32, imm: u32) {
    e.ensure(10 + 6, remover);
    movabs_rax(e, addr as u64);
    // `add dword [rax], imm32` -- `81 00 <imm32>`.
    e.emit_u8(0x81);
    e.emit_u8(0x00);
    e.emit_u32(imm);
}

/// Emits `sub [addr], imm32` (spec.md §6 `codegen_block_cycles`: bakes a block's total cycle
/// cost into its own compiled stream, decrementing the dispatcher's budget as a side effect of
/// running the block rather than requiring the dispatcher to re-derive the cost afterwards).
pub fn emit_sub_mem32_imm32(e: &mut Emitter, remover: &mut dyn BlockRemover, addr: *mut i32, imm: u32) {
    e.ensure(10 + 6, remover);
    movabs_rax(e, addr as u64);
    // `sub dword [rax], imm32` -- `81 28 <imm32>` (ModRM: mod=00 reg=101(/5) rm=000).
    e.emit_u8(0x81);
    e.emit_u8(0x28);
    e.emit_u32(imm);
}

/// Emits a fast-path `mov [dst], [src]` (spec.md §4.6 `FastOp::MovRegReg32`).
pub fn emit_mov_mem32_mem32(e: &mut Emitter, remover: &mut dyn BlockRemover, dst: *mut u32, src: *const u32) {
    e.ensure(10 + 2 + 10 + 2, remover);
    movabs_rax(e, src as u64);
    // `mov eax, [rax]` -- `8B 00`.
    e.emit_u8(0x8b);
    e.emit_u8(0x00);
    movabs_rcx(e, dst as u64);
    // `mov [rcx], eax` -- `89 01`.
    e.emit_u8(0x89);
    e.emit_u8(0x01);
}

/// Sentinel value the chaining-correctness test (spec.md §8 scenario C) looks for in `eax` on
/// return from the synthetic block's exit thunk.
pub const TERMINATE_SENTINEL: u32 = 0xcafe_babe;

/// Emits `FastOp::Terminate`: loads the terminator sentinel into `eax` and returns
/// (spec.md §4.6 fast-path catalogue; spec.md §8 scenario C).
pub fn emit_terminate(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(5 + RET_LEN, remover);
    // `mov eax, imm32` -- `B8 <imm32>`.
    e.emit_u8(0xb8);
    e.emit_u32(TERMINATE_SENTINEL);
    ret(e);
}

/// Emits a host call to a guest opcode handler (spec.md §4.6 "emit a host call to the existing
/// interpretive handler with arguments (`fetchdat`, updated PC) set up in host-ABI form").
///
/// Uses the SysV calling convention: `rdi` = `cpu_state`, `esi` = `fetchdat`. The original's
/// 32-bit ABI instead stack-passes these; the argument *values* are unchanged, only the
/// transport (registers vs. stack) differs between host ABIs, which is exactly the kind of
/// detail spec.md §9 assigns to the per-host backend.
pub fn emit_call_handler(
    e: &mut Emitter,
    remover: &mut dyn BlockRemover,
    cpu_state: *mut u8,
    fetchdat: u32,
    handler: crate::guest::OpcodeHandler,
) {
    e.ensure(10 + 5 + 10 + 2, remover);
    movabs_rdi(e, cpu_state as u64);
    mov_esi_imm32(e, fetchdat);
    movabs_rax(e, handler as usize as u64);
    // `call rax` -- `FF D0`.
    e.emit_u8(0xff);
    e.emit_u8(0xd0);
}

/// Emits the block's exit thunk: returns control to the dispatcher via a plain host `ret`
/// (spec.md §4.7 "single-entry, single-exit per block"; §4.6 `block_end_recompile`).
pub fn emit_exit_thunk(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(RET_LEN, remover);
    ret(e);
}

/// Emits a standalone `ret`, used by the first-exec-block prologue bookkeeping in
/// [`crate::trampolines`] as the tail of every trampoline routine.
pub fn emit_ret(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(RET_LEN, remover);
    ret(e);
}

/// `test edi, imm8` -- `83 F7` is CMP; we need TEST: `F7 C7 <imm32>` (TEST r/m32, imm32, reg
/// field 000, rm=edi=111 -> ModRM C7).
pub fn emit_test_edi_imm32(e: &mut Emitter, remover: &mut dyn BlockRemover, imm: u32) {
    e.ensure(6, remover);
    e.emit_u8(0xf7);
    e.emit_u8(0xc7);
    e.emit_u32(imm);
}

/// `jnz rel8` -- `75 <rel8>`, returning a [`Patch`] for the caller to fix up once the target is
/// known (spec.md §4.2 "Branch helpers that need patching...").
pub fn emit_jnz_short(e: &mut Emitter, remover: &mut dyn BlockRemover) -> Patch {
    e.ensure(2, remover);
    e.emit_u8(0x75);
    e.reserve_patch(1)
}

/// `jz rel8` -- `74 <rel8>`.
pub fn emit_jz_short(e: &mut Emitter, remover: &mut dyn BlockRemover) -> Patch {
    e.ensure(2, remover);
    e.emit_u8(0x74);
    e.reserve_patch(1)
}

/// Patches a short-form branch whose target is the instruction about to be emitted next
/// (i.e. "here"), matching the original's `*branch_offset = (uint8_t)(target - (uintptr_t)branch_offset) - 1`
/// idiom.
pub fn patch_short_to_here(patch: &Patch, e: &Emitter) {
    let here = e.next_insn_addr();
    // Short branches are only used for intra-routine jumps that never cross an
    // `ensure`-triggered reallocation (trampolines are emitted in one unbroken pass), so
    // `patch`'s address and `here` are always within the same exec block.
    let disp = (here as isize) - (patch.addr() as isize) - 1;
    debug_assert!(disp >= i8::min_value() as isize && disp <= i8::max_value() as isize);
    patch.patch_short(disp as i8);
}

/// `mov rax, rdi` -- `48 89 F8`.
pub fn emit_mov_rax_rdi(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(3, remover);
    e.emit_u8(0x48);
    e.emit_u8(0x89);
    e.emit_u8(0xf8);
}

/// `shr rax, imm8` -- `48 C1 E8 <imm8>`.
pub fn emit_shr_rax_imm8(e: &mut Emitter, remover: &mut dyn BlockRemover, imm: u8) {
    e.ensure(4, remover);
    e.emit_u8(0x48);
    e.emit_u8(0xc1);
    e.emit_u8(0xe8);
    e.emit_u8(imm);
}

/// `movabs r11, imm64` -- `49 BB <imm64>`, then `mov rsi, [r11 + rax*8]` -- `49 8B 34 C3`
/// (spec.md §4.8 "Compute `idx = virt >> 12`; load `base = lookup[idx]`").
///
/// Unlike the original's 32-bit absolute-address ModRM form, the lookup table's base address is
/// baked through a 64-bit scratch register so it can point anywhere in the host's address space
/// rather than only the low 4 GiB.
pub fn emit_load_lookup_entry(e: &mut Emitter, remover: &mut dyn BlockRemover, table_base: *const isize) {
    e.ensure(10 + 4, remover);
    e.emit_u8(0x49);
    e.emit_u8(0xbb);
    e.emit_u64(table_base as u64);
    e.emit_u8(0x49);
    e.emit_u8(0x8b);
    e.emit_u8(0x34);
    e.emit_u8(0xc3);
}

/// `cmp rsi, -1` -- `48 83 FE FF`.
pub fn emit_cmp_rsi_neg1(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(4, remover);
    e.emit_u8(0x48);
    e.emit_u8(0x83);
    e.emit_u8(0xfe);
    e.emit_u8(0xff);
}

/// `xor edx, edx` -- `31 D2` (zeroes the `abrt`-out register on the fast path).
pub fn emit_xor_edx_edx(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(2, remover);
    e.emit_u8(0x31);
    e.emit_u8(0xd2);
}

/// `mov r10, rsi` -- `49 89 F2`. Used by the store trampolines (spec.md §4.8) to stash the
/// incoming value out of `rsi` before the TLB lookup overwrites it.
pub fn emit_save_rsi_to_r10(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(3, remover);
    e.emit_u8(0x49);
    e.emit_u8(0x89);
    e.emit_u8(0xf2);
}

/// `mov esi, edi` -- `89 FE`. Recovers the guest address into the second argument slot before
/// calling a trampoline's slow path.
pub fn emit_mov_esi_edi(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(2, remover);
    e.emit_u8(0x89);
    e.emit_u8(0xfe);
}

/// `mov edx, imm32` -- `BA <imm32>`. Loads the access width into the third argument slot of a
/// trampoline's slow-path call.
pub fn emit_mov_edx_imm32(e: &mut Emitter, remover: &mut dyn BlockRemover, imm: u32) {
    e.ensure(5, remover);
    e.emit_u8(0xba);
    e.emit_u32(imm);
}

/// `mov rcx, r10` -- `49 8B CA`. Moves a saved store value into the fourth argument slot ahead
/// of a write trampoline's slow-path call.
pub fn emit_mov_rcx_r10(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(3, remover);
    e.emit_u8(0x49);
    e.emit_u8(0x8b);
    e.emit_u8(0xca);
}

/// `movabs rdi, imm64` -- bakes a trampoline's fixed collaborator pointer (`ctx`, spec.md §4.8)
/// as the first argument of its slow path.
pub fn emit_load_ctx_rdi(e: &mut Emitter, remover: &mut dyn BlockRemover, ctx: *const u8) {
    e.ensure(10, remover);
    movabs_rdi(e, ctx as u64);
}

/// `movabs rax, imm64` then `call rax` -- calls a fixed host function pointer baked in at
/// trampoline-build time (spec.md §4.8 "fall through to the slow path...call the interpretive
/// read/write routine").
pub fn emit_call_abs(e: &mut Emitter, remover: &mut dyn BlockRemover, target: *const u8) {
    e.ensure(10 + 2, remover);
    movabs_rax(e, target as u64);
    e.emit_u8(0xff);
    e.emit_u8(0xd0);
}

/// `lea rax, [rsi+rdi]` -- `48 8D 04 3E`. Computes the host address of a TLB hit: `rsi` holds
/// the page's host base (from [`emit_load_lookup_entry`]), `rdi` the guest virtual address.
pub fn emit_lea_rax_rsi_plus_rdi(e: &mut Emitter, remover: &mut dyn BlockRemover) {
    e.ensure(4, remover);
    e.emit_u8(0x48);
    e.emit_u8(0x8d);
    e.emit_u8(0x04);
    e.emit_u8(0x3e);
}

/// Loads `width` bytes from `[rax]` into `eax`/`rax` (zero-extended for sub-word widths), the
/// fast-path payload of a load trampoline (spec.md §4.8). `width` is 1, 2, 4 or 8.
pub fn emit_load_from_rax_width(e: &mut Emitter, remover: &mut dyn BlockRemover, width: u8) {
    e.ensure(4, remover);
    match width {
        // `movzx eax, byte [rax]` -- `0F B6 00`.
        1 => {
            e.emit_u8(0x0f);
            e.emit_u8(0xb6);
            e.emit_u8(0x00);
        }
        // `movzx eax, word [rax]` -- `0F B7 00`.
        2 => {
            e.emit_u8(0x0f);
            e.emit_u8(0xb7);
            e.emit_u8(0x00);
        }
        // `mov eax, [rax]` -- `8B 00`.
        4 => {
            e.emit_u8(0x8b);
            e.emit_u8(0x00);
        }
        // `mov rax, [rax]` -- `48 8B 00`.
        8 => {
            e.emit_u8(0x48);
            e.emit_u8(0x8b);
            e.emit_u8(0x00);
        }
        _ => unreachable!("trampoline widths are 1, 2, 4 or 8 bytes"),
    }
}

/// Stores `width` bytes of `r10` into `[rax]`, the fast-path payload of a store trampoline
/// (spec.md §4.8). `width` is 1, 2, 4 or 8.
pub fn emit_store_r10_to_rax_width(e: &mut Emitter, remover: &mut dyn BlockRemover, width: u8) {
    e.ensure(5, remover);
    match width {
        // `mov [rax], r10b` -- `44 88 10`.
        1 => {
            e.emit_u8(0x44);
            e.emit_u8(0x88);
            e.emit_u8(0x10);
        }
        // `mov [rax], r10w` -- `66 44 89 10`.
        2 => {
            e.emit_u8(0x66);
            e.emit_u8(0x44);
            e.emit_u8(0x89);
            e.emit_u8(0x10);
        }
        // `mov [rax], r10d` -- `44 89 10`.
        4 => {
            e.emit_u8(0x44);
            e.emit_u8(0x89);
            e.emit_u8(0x10);
        }
        // `mov [rax], r10` -- `4C 89 10`.
        8 => {
            e.emit_u8(0x4c);
            e.emit_u8(0x89);
            e.emit_u8(0x10);
        }
        _ => unreachable!("trampoline widths are 1, 2, 4 or 8 bytes"),
    }
}
