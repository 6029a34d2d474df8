// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! ldrmm - loader memory manager.
//!
//! Tracks every physical range claimed while the loader runs under UEFI boot
//! services, builds the kernel's page tables (x86 non-PAE, x86 PAE, x86-64) and
//! performs the one-shot `ExitBootServices -> SetVirtualAddressMap -> CR3`
//! handoff. Everything that touches firmware or the CPU sits behind the traits
//! in [`firmware`] and [`arch`], so the whole pipeline runs on the host in tests.
#![cfg_attr(not(test), no_std)]
#![warn(missing_debug_implementations)]

extern crate alloc;

pub mod arch;
pub mod descriptors;
pub mod efimap;
pub mod error;
pub mod firmware;
pub mod layout;
pub mod ledger;
pub mod memtype;
pub mod paging;
pub mod runtime;
pub mod transition;

#[cfg(test)]
pub(crate) mod testing;

pub use error::MmError;
pub use firmware::{Firmware, MemoryMapInfo, PhysMemory};
pub use ledger::{Ledger, Mapping};
pub use memtype::MemoryType;
pub use paging::{PageTables, PagingMode};
pub use transition::{BootContext, MmConfig, TransitionState};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

#[inline]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

#[inline]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + (a - 1)) & !(a - 1)
}

#[inline]
pub const fn pages_for(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE) >> PAGE_SHIFT
}
