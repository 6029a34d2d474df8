// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! CPU side of the handoff.

#[cfg(target_arch = "x86")]
pub mod x86;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86")]
pub use self::x86 as native;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64 as native;

use crate::paging::PagingMode;

pub trait CpuControl {
    /// Current stack pointer, to keep the loader stack identity mapped.
    fn stack_pointer(&self) -> u64;

    /// Can this CPU, running this build, enter `mode`?
    fn supports(&self, mode: PagingMode) -> bool;

    /// Load `root` and (re-)enable paging for `mode`.
    ///
    /// # Safety
    /// `root` must be a complete hierarchy that identity maps the code and
    /// stack currently executing. There is no way back.
    unsafe fn switch_address_space(&mut self, mode: PagingMode, root: u64);
}
