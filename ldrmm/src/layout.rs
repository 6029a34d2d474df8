// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Fixed virtual layout the kernel expects to inherit.

use crate::paging::PagingMode;
use crate::{MmError, PAGE_SIZE};

/// Legacy BIOS video/ROM window, always identity visible.
pub const LEGACY_ROM_BASE: u64 = 0xA_0000;
pub const LEGACY_ROM_PAGES: u64 = (0x10_0000 - LEGACY_ROM_BASE) / PAGE_SIZE;

/// Default xAPIC physical base when the MSR cannot be read.
pub const APIC_DEFAULT_PHYS: u64 = 0xFEE0_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    /// Start of the self-map (PTE) window.
    pub pte_base: u64,
    pub kuser_shared_data: u64,
    /// HAL scratch window; only the 64-bit kernel wants its table present.
    pub hal_window: Option<u64>,
    pub apic: u64,
    /// Window the loader places firmware ranges and its own data into.
    pub placement_base: u64,
    pub placement_size: u64,
}

impl KernelLayout {
    pub const fn for_mode(mode: PagingMode) -> Self {
        match mode {
            PagingMode::Legacy | PagingMode::Pae => Self {
                pte_base: 0xC000_0000,
                kuser_shared_data: 0xFFDF_0000,
                hal_window: None,
                apic: 0xFFFE_0000,
                placement_base: 0xE000_0000,
                placement_size: 0x1000_0000,
            },
            PagingMode::Long => Self {
                pte_base: 0xFFFF_F680_0000_0000,
                kuser_shared_data: 0xFFFF_F780_0000_0000,
                hal_window: Some(0xFFFF_FFFF_FFC0_0000),
                apic: 0xFFFF_FFFF_FFFE_0000,
                placement_base: 0xFFFF_F880_0000_0000,
                placement_size: 0x80_0000_0000,
            },
        }
    }
}

/// Bump allocator over the placement window.
#[derive(Debug, Clone)]
pub struct VaCursor {
    next: u64,
    end: u64,
}

impl VaCursor {
    pub const fn new(base: u64, size: u64) -> Self {
        Self {
            next: base,
            end: base + size,
        }
    }

    pub fn for_mode(mode: PagingMode) -> Self {
        let l = KernelLayout::for_mode(mode);
        Self::new(l.placement_base, l.placement_size)
    }

    pub fn take(&mut self, pages: u64) -> Result<u64, MmError> {
        let bytes = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(MmError::VirtualWindowExhausted)?;
        if self.end - self.next < bytes {
            return Err(MmError::VirtualWindowExhausted);
        }
        let va = self.next;
        self.next += bytes;
        Ok(va)
    }
}
