// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
use core::arch::asm;

use super::CpuControl;
use crate::paging::PagingMode;

const CR0_WP: u32 = 1 << 16;
const CR0_PG: u32 = 1 << 31;
const CR4_PAE: u32 = 1 << 5;

/// The CPU the 32-bit loader runs on.
#[derive(Debug, Default)]
pub struct NativeCpu {
    /// CPUID.01h:EDX.PAE, filled in by the caller.
    pub has_pae: bool,
}

impl NativeCpu {
    pub const fn new(has_pae: bool) -> Self {
        Self { has_pae }
    }
}

impl CpuControl for NativeCpu {
    fn stack_pointer(&self) -> u64 {
        let sp: u32;
        unsafe { asm!("mov {}, esp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
        sp as u64
    }

    fn supports(&self, mode: PagingMode) -> bool {
        match mode {
            PagingMode::Legacy => true,
            PagingMode::Pae => self.has_pae,
            PagingMode::Long => false,
        }
    }

    unsafe fn switch_address_space(&mut self, mode: PagingMode, root: u64) {
        assert!(root <= u32::MAX as u64, "page table root above 4 GiB");
        let pae = mode == PagingMode::Pae;
        unsafe {
            asm!(
                "cli",
                // paging and write-protect off
                "mov eax, cr0",
                "and eax, {off}",
                "mov cr0, eax",
                // PAE per layout
                "mov eax, cr4",
                "test {pae}, {pae}",
                "jz 2f",
                "or eax, {cr4_pae}",
                "jmp 3f",
                "2:",
                "and eax, {cr4_nopae}",
                "3:",
                "mov cr4, eax",
                "mov cr3, {root}",
                "mov eax, cr0",
                "or eax, {pg}",
                "mov cr0, eax",
                off = const !(CR0_PG | CR0_WP),
                cr4_pae = const CR4_PAE,
                cr4_nopae = const !CR4_PAE,
                pg = const CR0_PG,
                pae = in(reg) pae as u32,
                root = in(reg) root as u32,
                out("eax") _,
            );
        }
    }
}
