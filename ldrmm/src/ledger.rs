// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! The mapping ledger: every physical range claimed during boot.
//!
//! Kept sorted by physical base. Ranges never overlap, with one exception: a
//! mapping inserted over an *identical* range of an existing one is kept next
//! to it as an alias (the loader image is both placed and identity mapped).
//! Partially cutting into a non-free mapping means the ledger can no longer
//! be trusted, so it panics.

use alloc::vec::Vec;
use log::{debug, error, warn};

use crate::PAGE_SIZE;
use crate::memtype::MemoryType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub physical_base: u64,
    pub virtual_base: Option<u64>,
    pub page_count: u64,
    pub memory_type: MemoryType,
}

impl Mapping {
    pub const fn new(
        physical_base: u64,
        virtual_base: Option<u64>,
        page_count: u64,
        memory_type: MemoryType,
    ) -> Self {
        Self {
            physical_base,
            virtual_base,
            page_count,
            memory_type,
        }
    }

    /// Exclusive physical end.
    pub const fn physical_end(&self) -> u64 {
        self.physical_base + self.page_count * PAGE_SIZE
    }

    pub const fn contains(&self, pa: u64) -> bool {
        pa >= self.physical_base && pa < self.physical_end()
    }

    pub const fn same_range(&self, other: &Mapping) -> bool {
        self.physical_base == other.physical_base && self.page_count == other.page_count
    }

    fn with_range(&self, physical_base: u64, physical_end: u64) -> Mapping {
        Mapping {
            physical_base,
            page_count: (physical_end - physical_base) / PAGE_SIZE,
            ..*self
        }
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<Mapping>,
}

impl Ledger {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.entries.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Mapping> {
        self.entries.get(index)
    }

    /// Record `page_count` pages at `physical_base`.
    ///
    /// Free mappings under the new range are split or dropped; any other
    /// intersection that is not an exact alias halts.
    pub fn insert(
        &mut self,
        physical_base: u64,
        virtual_base: Option<u64>,
        page_count: u64,
        memory_type: MemoryType,
    ) {
        debug_assert!(physical_base % PAGE_SIZE == 0);
        debug_assert!(virtual_base.is_none_or(|va| va % PAGE_SIZE == 0));
        if page_count == 0 {
            return;
        }
        let new = Mapping::new(physical_base, virtual_base, page_count, memory_type);
        let start = new.physical_base;
        let end = new.physical_end();

        // Ends are sorted too, so the intersecting run is contiguous.
        let lo = self.entries.partition_point(|m| m.physical_end() <= start);
        let hi = self.entries.partition_point(|m| m.physical_base < end);

        for m in &self.entries[lo..hi] {
            if !m.memory_type.is_free() && !m.same_range(&new) {
                error!("ledger: {:x?} collides with {:x?}", new, m);
                panic!(
                    "ledger: insert {:#x}+{} pages ({:?}) intersects non-free {:#x}+{} pages ({:?})",
                    start,
                    page_count,
                    memory_type,
                    m.physical_base,
                    m.page_count,
                    m.memory_type
                );
            }
        }

        let mut spliced = Vec::with_capacity(hi - lo + 3);
        let mut high_leftover = None;
        for m in self.entries.drain(lo..hi) {
            if !m.memory_type.is_free() {
                debug!("ledger: alias {:#x}+{} pages", start, page_count);
                spliced.push(m);
                continue;
            }
            if m.physical_base < start {
                spliced.push(m.with_range(m.physical_base, start));
            }
            if m.physical_end() > end {
                high_leftover = Some(m.with_range(end, m.physical_end()));
            }
        }
        spliced.push(new);
        spliced.extend(high_leftover);
        self.entries.splice(lo..lo, spliced);
    }

    /// Does any mapping touch `[physical_base, physical_base + pages)`?
    pub fn intersects(&self, physical_base: u64, page_count: u64) -> bool {
        let end = physical_base + page_count * PAGE_SIZE;
        let lo = self
            .entries
            .partition_point(|m| m.physical_end() <= physical_base);
        self.entries
            .get(lo)
            .is_some_and(|m| m.physical_base < end)
    }

    /// Physical to virtual through the first aliased mapping covering `pa`.
    pub fn find_virtual(&self, pa: u64) -> Option<u64> {
        let hit = self
            .entries
            .iter()
            .filter(|m| m.contains(pa))
            .find_map(|m| m.virtual_base.map(|va| va + (pa - m.physical_base)));
        if hit.is_none() {
            warn!("ledger: no virtual alias for {:#x}", pa);
        }
        hit
    }

    /// Reverse of [`Ledger::find_virtual`].
    pub fn find_physical(&self, va: u64) -> Option<u64> {
        self.entries.iter().find_map(|m| {
            let base = m.virtual_base?;
            let len = m.page_count * PAGE_SIZE;
            (va >= base && va - base < len).then(|| m.physical_base + (va - base))
        })
    }

    /// One past the highest page frame of loader-owned memory.
    pub fn loader_pages_spanned(&self) -> u64 {
        self.entries
            .iter()
            .filter(|m| m.memory_type.is_loader_owned())
            .map(|m| m.physical_end() / PAGE_SIZE)
            .max()
            .unwrap_or(0)
    }

    pub fn dump(&self) {
        for m in &self.entries {
            debug!(
                "  {:#012x}-{:#012x} {:>6} pages {:?} -> {:x?}",
                m.physical_base,
                m.physical_end(),
                m.page_count,
                m.memory_type,
                m.virtual_base
            );
        }
    }
}
