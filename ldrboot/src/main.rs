// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
#![no_std]
#![no_main]

extern crate alloc;

mod firmware;
mod serial;

use core::arch::asm;

use ldrmm::arch::native::NativeCpu;
use ldrmm::layout::APIC_DEFAULT_PHYS;
use ldrmm::{BootContext, MemoryType, MmConfig, PagingMode};
use log::{LevelFilter, error, info, warn};
use raw_cpuid::CpuId;
use uefi::prelude::*;

use crate::firmware::UefiFirmware;

#[global_allocator]
static ALLOCATOR: uefi::allocator::Allocator = uefi::allocator::Allocator;

const IA32_APIC_BASE: u32 = 0x1B;
/// Stacks the kernel's first processor starts on.
const STARTUP_STACK_PAGES: u64 = 4;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial::emergency_write(format_args!("\r\n[PANIC] {}\r\n", info));
    halt()
}

fn halt() -> ! {
    unsafe {
        loop {
            asm!("cli", "hlt");
        }
    }
}

/* =================================== Entry =================================== */
#[entry]
fn main() -> Status {
    serial::init(if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    info!("ldrboot: entry");

    let fw = match UefiFirmware::new() {
        Ok(fw) => fw,
        Err(e) => {
            error!("ldrboot: firmware setup failed: {:?}", e);
            return e.status();
        }
    };
    let (config, cpu) = detect_cpu();
    info!("ldrboot: {:?}, APIC {:x?}", config.mode, config.apic_base);

    let mut ctx = BootContext::new(fw, cpu, config);
    if let Err(e) = ctx.import_firmware_map() {
        error!("ldrboot: cannot import memory map: {}", e);
        return Status::LOAD_ERROR;
    }
    for ty in [
        MemoryType::StartupKernelStack,
        MemoryType::StartupDpcStack,
        MemoryType::StartupPanicStack,
    ] {
        if let Err(e) = ctx.request(None, None, STARTUP_STACK_PAGES, ty) {
            error!("ldrboot: {:?} allocation failed: {}", ty, e);
            return Status::OUT_OF_RESOURCES;
        }
    }

    // Point of no return once this succeeds.
    let spanned = match ctx.enable_paging() {
        Ok(n) => n,
        Err(e) => {
            error!("ldrboot: transition failed: {}", e);
            return Status::LOAD_ERROR;
        }
    };
    info!("ldrboot: paging enabled, loader spans {} pages", spanned);
    if let Some(list) = ctx.descriptor_list() {
        info!(
            "ldrboot: {} descriptors, list head at {:#x}",
            list.len(),
            list.head_virtual()
        );
    }
    // Kernel entry is not ours to make.
    warn!("ldrboot: nothing to hand off to, halting");
    halt()
}

/* ================================ CPU probing ================================ */

fn detect_cpu() -> (MmConfig, NativeCpu) {
    let features = CpuId::new().get_feature_info();
    let has_apic = features.as_ref().is_some_and(|f| f.has_apic());
    let apic_base = has_apic.then(|| match unsafe { read_msr(IA32_APIC_BASE) } & 0xF_FFFF_F000 {
        0 => APIC_DEFAULT_PHYS,
        base => base,
    });

    #[cfg(target_arch = "x86_64")]
    let (mode, cpu) = (PagingMode::Long, NativeCpu);
    #[cfg(target_arch = "x86")]
    let (mode, cpu) = {
        let has_pae = features.as_ref().is_some_and(|f| f.has_pae());
        let mode = if cfg!(feature = "pae") && has_pae {
            PagingMode::Pae
        } else {
            PagingMode::Legacy
        };
        (mode, NativeCpu::new(has_pae))
    };

    (MmConfig::new(mode).with_apic(apic_base), cpu)
}

#[cfg(target_arch = "x86_64")]
unsafe fn read_msr(msr: u32) -> u64 {
    unsafe { x86_64::registers::model_specific::Msr::new(msr).read() }
}

#[cfg(target_arch = "x86")]
unsafe fn read_msr(msr: u32) -> u64 {
    let (lo, hi): (u32, u32);
    unsafe {
        asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(nomem, nostack, preserves_flags));
    }
    ((hi as u64) << 32) | lo as u64
}
