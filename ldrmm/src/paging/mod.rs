// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Kernel page-table builder for the three x86 layouts.
//!
//! The walker is shared; a [`PagingMode`] supplies the level count, index
//! split and entry width. Intermediate tables are allocated lazily through a
//! [`FrameAllocator`], which the boot context backs with firmware pages that
//! are also recorded in the ledger.

pub mod selfmap;

use bitflags::bitflags;
use log::debug;

use crate::firmware::PhysMemory;
use crate::{MmError, PAGE_SHIFT, PAGE_SIZE, align_down};

/* --------------------------------- Layouts --------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 32-bit, 2 levels: PD / PT, 10/10/12.
    Legacy,
    /// 32-bit PAE, 3 levels: 4-entry PDPT / PD / PT, 2/9/9/12.
    Pae,
    /// 4 levels: PML4 / PDPT / PD / PT, 9/9/9/9/12.
    Long,
}

impl PagingMode {
    pub const fn levels(self) -> usize {
        match self {
            PagingMode::Legacy => 2,
            PagingMode::Pae => 3,
            PagingMode::Long => 4,
        }
    }

    pub const fn entry_size(self) -> usize {
        match self {
            PagingMode::Legacy => 4,
            PagingMode::Pae | PagingMode::Long => 8,
        }
    }

    /// Width of a kernel pointer in bytes.
    pub const fn pointer_width(self) -> usize {
        match self {
            PagingMode::Legacy | PagingMode::Pae => 4,
            PagingMode::Long => 8,
        }
    }

    const fn bits_per_level(self) -> u32 {
        match self {
            PagingMode::Legacy => 10,
            PagingMode::Pae | PagingMode::Long => 9,
        }
    }

    /// Entries in a table at `level` (0 = root).
    pub const fn entries(self, level: usize) -> usize {
        match (self, level) {
            (PagingMode::Pae, 0) => 4,
            _ => 1 << self.bits_per_level(),
        }
    }

    /// Bit position of the index for `level`.
    pub const fn shift(self, level: usize) -> u32 {
        PAGE_SHIFT + self.bits_per_level() * (self.levels() - 1 - level) as u32
    }

    pub const fn index(self, va: u64, level: usize) -> usize {
        ((va >> self.shift(level)) as usize) & (self.entries(level) - 1)
    }

    const fn address_mask(self) -> u64 {
        match self {
            PagingMode::Legacy => 0xFFFF_F000,
            PagingMode::Pae | PagingMode::Long => 0x000F_FFFF_FFFF_F000,
        }
    }

    /// Bits that are legal in an entry of this layout.
    const fn flag_mask(self) -> u64 {
        match self {
            PagingMode::Legacy => 0xFFF,
            PagingMode::Pae | PagingMode::Long => 0xFFF | EntryFlags::NO_EXECUTE.bits(),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Source of zeroed frames for new tables.
pub trait FrameAllocator: PhysMemory {
    fn allocate_table(&mut self) -> Result<u64, MmError>;
}

/* ---------------------------------- Tables --------------------------------- */

#[derive(Debug)]
pub struct PageTables {
    mode: PagingMode,
    root: u64,
}

impl PageTables {
    /// Allocate the root. PAE also gets all four page directories, the
    /// self-map needs every one of them present.
    pub fn new<A: FrameAllocator>(mode: PagingMode, frames: &mut A) -> Result<Self, MmError> {
        let root = frames.allocate_table()?;
        let tables = Self { mode, root };
        if mode == PagingMode::Pae {
            for i in 0..mode.entries(0) {
                let pd = frames.allocate_table()?;
                unsafe { tables.write_entry(&*frames, root, i, pd, EntryFlags::PRESENT) };
            }
        }
        debug!("paging: {:?} root at {:#x}", mode, root);
        Ok(tables)
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// Physical address of the top-level table (what goes into CR3).
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Map `pages` pages at `va` to `pa`, present and writable.
    pub fn map<A: FrameAllocator>(
        &self,
        frames: &mut A,
        va: u64,
        pa: u64,
        pages: u64,
    ) -> Result<(), MmError> {
        self.map_with(
            frames,
            va,
            pa,
            pages,
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        )
    }

    /// [`PageTables::map`] with explicit leaf flags. An existing leaf is
    /// overwritten.
    pub fn map_with<A: FrameAllocator>(
        &self,
        frames: &mut A,
        va: u64,
        pa: u64,
        pages: u64,
        flags: EntryFlags,
    ) -> Result<(), MmError> {
        let va = align_down(va, PAGE_SIZE);
        let pa = align_down(pa, PAGE_SIZE);
        let leaf = self.mode.levels() - 1;
        for i in 0..pages {
            let v = va.wrapping_add(i * PAGE_SIZE);
            let table = self.walk_create(frames, v)?;
            unsafe {
                self.write_entry(
                    &*frames,
                    table,
                    self.mode.index(v, leaf),
                    pa + i * PAGE_SIZE,
                    flags,
                )
            };
        }
        Ok(())
    }

    /// Materialise the leaf table covering `va` without mapping the page.
    /// Returns the table's physical address.
    pub fn ensure_table<A: FrameAllocator>(&self, frames: &mut A, va: u64) -> Result<u64, MmError> {
        self.walk_create(frames, va)
    }

    /// Software walk. Returns the physical address `va` maps to.
    pub fn translate<M: PhysMemory + ?Sized>(&self, mem: &M, va: u64) -> Option<u64> {
        let mut table = self.root;
        for level in 0..self.mode.levels() {
            let e = unsafe { self.read_entry(mem, table, self.mode.index(va, level)) };
            if e & EntryFlags::PRESENT.bits() == 0 {
                return None;
            }
            table = e & self.mode.address_mask();
        }
        Some(table | (va & (PAGE_SIZE - 1)))
    }

    /// Leaf table for `va`, if the walk gets that far.
    pub fn leaf_table<M: PhysMemory + ?Sized>(&self, mem: &M, va: u64) -> Option<u64> {
        let mut table = self.root;
        for level in 0..self.mode.levels() - 1 {
            let e = unsafe { self.read_entry(mem, table, self.mode.index(va, level)) };
            if e & EntryFlags::PRESENT.bits() == 0 {
                return None;
            }
            table = e & self.mode.address_mask();
        }
        Some(table)
    }

    /// Raw entry at `index` of the table at `table`.
    pub fn entry<M: PhysMemory + ?Sized>(&self, mem: &M, table: u64, index: usize) -> u64 {
        assert!(index < PAGE_SIZE as usize / self.mode.entry_size());
        unsafe { self.read_entry(mem, table, index) }
    }

    /// Walk down to the leaf table for `va`, creating what is missing.
    fn walk_create<A: FrameAllocator>(&self, frames: &mut A, va: u64) -> Result<u64, MmError> {
        let mut table = self.root;
        for level in 0..self.mode.levels() - 1 {
            let idx = self.mode.index(va, level);
            let e = unsafe { self.read_entry(&*frames, table, idx) };
            table = if e & EntryFlags::PRESENT.bits() != 0 {
                e & self.mode.address_mask()
            } else {
                let next = frames.allocate_table()?;
                // PDPTEs under PAE reserve everything but P and the cache bits.
                let flags = if self.mode == PagingMode::Pae && level == 0 {
                    EntryFlags::PRESENT
                } else {
                    EntryFlags::PRESENT | EntryFlags::WRITABLE
                };
                unsafe { self.write_entry(&*frames, table, idx, next, flags) };
                next
            };
        }
        Ok(table)
    }

    /// # Safety
    /// `table` must be a table frame of this hierarchy.
    unsafe fn read_entry<M: PhysMemory + ?Sized>(&self, mem: &M, table: u64, index: usize) -> u64 {
        let p = mem.phys_ptr(table + (index * self.mode.entry_size()) as u64);
        unsafe {
            match self.mode {
                PagingMode::Legacy => core::ptr::read_volatile(p as *const u32) as u64,
                PagingMode::Pae | PagingMode::Long => core::ptr::read_volatile(p as *const u64),
            }
        }
    }

    /// # Safety
    /// `table` must be a table frame of this hierarchy.
    pub(crate) unsafe fn write_entry<M: PhysMemory + ?Sized>(
        &self,
        mem: &M,
        table: u64,
        index: usize,
        frame: u64,
        flags: EntryFlags,
    ) {
        let raw = (frame & self.mode.address_mask()) | (flags.bits() & self.mode.flag_mask());
        let p = mem.phys_ptr(table + (index * self.mode.entry_size()) as u64);
        unsafe {
            match self.mode {
                PagingMode::Legacy => core::ptr::write_volatile(p as *mut u32, raw as u32),
                PagingMode::Pae | PagingMode::Long => core::ptr::write_volatile(p as *mut u64, raw),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;

    #[test]
    fn index_split() {
        let va = 0xC030_1234u64;
        assert_eq!(PagingMode::Legacy.index(va, 0), 0x300);
        assert_eq!(PagingMode::Legacy.index(va, 1), 0x301);
        assert_eq!(PagingMode::Pae.index(va, 0), 3);
        assert_eq!(PagingMode::Pae.index(va, 1), 1);
        assert_eq!(PagingMode::Pae.index(va, 2), 0x101);

        let va = 0xFFFF_F680_0000_0000u64;
        assert_eq!(PagingMode::Long.index(va, 0), 0x1ED);
        assert_eq!(PagingMode::Long.index(va, 3), 0);
        assert_eq!(PagingMode::Long.shift(0), 39);
    }

    fn check_run(mode: PagingMode, va: u64, pa: u64, n: u64) {
        let mut arena = Arena::new(0x40_0000, 0x20_0000);
        let pt = PageTables::new(mode, &mut arena).unwrap();
        pt.map(&mut arena, va, pa, n).unwrap();
        for i in 0..n {
            assert_eq!(
                pt.translate(&arena, va + i * PAGE_SIZE),
                Some(pa + i * PAGE_SIZE),
                "{mode:?} page {i}"
            );
        }
        assert_eq!(pt.translate(&arena, va + n * PAGE_SIZE), None);
        assert_eq!(pt.translate(&arena, va + 0x123), Some(pa + 0x123));
    }

    #[test]
    fn map_walks_back_in_order() {
        // Crosses a leaf-table boundary in every layout.
        check_run(PagingMode::Legacy, 0x803F_E000, 0x0020_0000, 5);
        check_run(PagingMode::Pae, 0x801F_E000, 0x0020_0000, 5);
        check_run(PagingMode::Long, 0xFFFF_F800_001F_E000, 0x0020_0000, 5);
    }

    #[test]
    fn tables_are_allocated_lazily() {
        let mut arena = Arena::new(0x40_0000, 0x20_0000);
        let pt = PageTables::new(PagingMode::Long, &mut arena).unwrap();
        assert_eq!(arena.tables_allocated(), 1);
        pt.map(&mut arena, 0x1000, 0x1000, 1).unwrap();
        assert_eq!(arena.tables_allocated(), 4);
        // same leaf table, nothing new
        pt.map(&mut arena, 0x2000, 0x2000, 16).unwrap();
        assert_eq!(arena.tables_allocated(), 4);

        let mut arena = Arena::new(0x40_0000, 0x20_0000);
        let pt = PageTables::new(PagingMode::Pae, &mut arena).unwrap();
        assert_eq!(arena.tables_allocated(), 5);
        pt.map(&mut arena, 0xC000_0000, 0x1000, 1).unwrap();
        assert_eq!(arena.tables_allocated(), 6);
    }

    #[test]
    fn remap_overwrites_leaf() {
        let mut arena = Arena::new(0x40_0000, 0x20_0000);
        let pt = PageTables::new(PagingMode::Legacy, &mut arena).unwrap();
        pt.map(&mut arena, 0x8000_0000, 0x10_0000, 1).unwrap();
        pt.map(&mut arena, 0x8000_0000, 0x20_0000, 1).unwrap();
        assert_eq!(pt.translate(&arena, 0x8000_0000), Some(0x20_0000));
    }

    #[test]
    fn pae_pdpt_entries_are_present_only() {
        let mut arena = Arena::new(0x40_0000, 0x20_0000);
        let pt = PageTables::new(PagingMode::Pae, &mut arena).unwrap();
        for i in 0..4 {
            let e = pt.entry(&arena, pt.root(), i);
            assert_eq!(e & 0xFFF, EntryFlags::PRESENT.bits());
        }
    }

    #[test]
    fn legacy_drops_no_execute() {
        let mut arena = Arena::new(0x40_0000, 0x20_0000);
        let pt = PageTables::new(PagingMode::Legacy, &mut arena).unwrap();
        let flags = EntryFlags::PRESENT | EntryFlags::NO_CACHE | EntryFlags::NO_EXECUTE;
        pt.map_with(&mut arena, 0xFFFE_0000, 0xFEE0_0000, 1, flags).unwrap();
        assert_eq!(pt.translate(&arena, 0xFFFE_0000), Some(0xFEE0_0000));
        let table = pt.leaf_table(&arena, 0xFFFE_0000).unwrap();
        let e = pt.entry(&arena, table, PagingMode::Legacy.index(0xFFFE_0000, 1));
        assert_eq!(e, 0xFEE0_0000 | 0x11);
    }

    #[test]
    fn ensure_table_maps_nothing() {
        let mut arena = Arena::new(0x40_0000, 0x20_0000);
        let pt = PageTables::new(PagingMode::Long, &mut arena).unwrap();
        let va = 0xFFFF_FFFF_FFC0_0000;
        let t = pt.ensure_table(&mut arena, va).unwrap();
        assert_eq!(pt.leaf_table(&arena, va), Some(t));
        assert_eq!(pt.translate(&arena, va), None);
    }

    #[test]
    fn allocation_failure_propagates() {
        let mut arena = Arena::new(0x40_0000, 2 * PAGE_SIZE);
        let pt = PageTables::new(PagingMode::Long, &mut arena).unwrap();
        assert_eq!(pt.map(&mut arena, 0, 0, 1), Err(MmError::OutOfFrames));
    }
}
