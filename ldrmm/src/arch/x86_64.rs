// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
use core::arch::asm;

use ::x86_64::PhysAddr;
use ::x86_64::instructions::interrupts;
use ::x86_64::registers::control::{Cr0, Cr0Flags, Cr3, Cr3Flags, Cr4, Cr4Flags};
use ::x86_64::structures::paging::PhysFrame;

use super::CpuControl;
use crate::paging::PagingMode;

/// The CPU the 64-bit loader runs on. Long mode is already on, so only the
/// four-level layout can be entered from here.
#[derive(Debug, Default)]
pub struct NativeCpu;

impl CpuControl for NativeCpu {
    fn stack_pointer(&self) -> u64 {
        let sp: u64;
        unsafe { asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
        sp
    }

    fn supports(&self, mode: PagingMode) -> bool {
        mode == PagingMode::Long
    }

    unsafe fn switch_address_space(&mut self, mode: PagingMode, root: u64) {
        assert_eq!(mode, PagingMode::Long, "64-bit loader cannot enter {mode:?}");
        interrupts::disable();
        unsafe {
            Cr4::update(|f| f.insert(Cr4Flags::PAGE_GLOBAL));
            Cr0::update(|f| {
                f.insert(Cr0Flags::WRITE_PROTECT | Cr0Flags::ALIGNMENT_MASK);
                f.remove(Cr0Flags::MONITOR_COPROCESSOR);
            });
            Cr3::write(
                PhysFrame::containing_address(PhysAddr::new(root)),
                Cr3Flags::empty(),
            );
        }
    }
}
