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

//! Host-architecture code emitter back-ends (spec.md §9 "Host-arch portability").
//!
//! The abstract emitter cursor in [`crate::emitter`] is architecture-independent; only the
//! actual instruction encodings live here, one module per host target. The translator
//! ([`crate::translator`]) and trampoline builder ([`crate::trampolines`]) call the free
//! functions re-exported below, which `cfg`-dispatch to the active target's encoder. Adding a
//! new host only means adding a module here and widening the `cfg` gates in this file.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("dynarec-core's host emitter has no back-end for this target architecture; see src/backend/mod.rs");
