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

use err_derive::Error;

/// Error that can happen when constructing a [`Dynarec`](crate::Dynarec) or when the injected
/// executable-memory provider fails.
///
/// Every other failure mode described by the spec (stale blocks, exhausted pools, emitter
/// overflow) is handled internally and never reaches the caller; see the crate-level docs.
#[derive(Debug, Error)]
pub enum DynarecError {
    /// The host failed to reserve the executable-memory arena.
    #[error(display = "failed to map executable memory arena: {}", _0)]
    ArenaMapFailed(#[error(cause)] MmapError),
}

/// Error reported by an [`ExecMemoryProvider`](crate::exec_memory::ExecMemoryProvider).
#[derive(Debug, Error)]
pub enum MmapError {
    /// The underlying `mmap`/`mprotect` call returned an OS error.
    #[error(display = "os error {}", _0)]
    Os(i32),
}
