// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Recursive self-map.
//!
//! One top-level slot points back at the hierarchy, so the live tables show up
//! as ordinary memory in a fixed window. The slot holds a raw frame number,
//! the cycle is owned by the hardware.

use log::debug;

use super::{EntryFlags, PageTables, PagingMode};
use crate::PAGE_SHIFT;
use crate::firmware::PhysMemory;
use crate::layout::KernelLayout;

/// Slot of the legacy page directory that points at itself.
const LEGACY_SELF_SLOT: usize = 0x300;
/// PML4 slot of the recursive entry.
const LONG_SELF_SLOT: usize = 0x1ED;

/// Install the recursive entries into `tables`.
pub fn install<M: PhysMemory + ?Sized>(tables: &PageTables, mem: &M) {
    let root = tables.root();
    let rw = EntryFlags::PRESENT | EntryFlags::WRITABLE;
    match tables.mode() {
        PagingMode::Legacy => unsafe { tables.write_entry(mem, root, LEGACY_SELF_SLOT, root, rw) },
        PagingMode::Long => unsafe { tables.write_entry(mem, root, LONG_SELF_SLOT, root, rw) },
        PagingMode::Pae => {
            // The PTE window is the first 8 MiB of the last gigabyte, i.e. the
            // first four slots of PD3 hold PD0..PD3.
            let pd3 = tables.entry(mem, root, 3) & !0xFFF;
            for i in 0..4 {
                let pd = tables.entry(mem, root, i) & !0xFFF;
                unsafe { tables.write_entry(mem, pd3, i, pd, rw) };
            }
        }
    }
    debug!(
        "selfmap: {:?} window at {:#x}",
        tables.mode(),
        KernelLayout::for_mode(tables.mode()).pte_base
    );
}

/// Virtual address of the leaf entry that maps `va`.
pub const fn pte_address(mode: PagingMode, va: u64) -> u64 {
    let base = KernelLayout::for_mode(mode).pte_base;
    match mode {
        PagingMode::Legacy => base + ((va & 0xFFFF_FFFF) >> PAGE_SHIFT) * 4,
        PagingMode::Pae => base + ((va & 0xFFFF_FFFF) >> PAGE_SHIFT) * 8,
        PagingMode::Long => base + (((va >> PAGE_SHIFT) & 0xF_FFFF_FFFF) << 3),
    }
}

/// Virtual address of the entry one level up (the PDE) that maps `va`.
pub const fn pde_address(mode: PagingMode, va: u64) -> u64 {
    pte_address(mode, pte_address(mode, va))
}
