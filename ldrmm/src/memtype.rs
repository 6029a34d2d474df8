// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Kernel-facing memory type tags (`TYPE_OF_MEMORY`).

use uefi::mem::memory_map::MemoryType as EfiMemoryType;

/// Values are the kernel's, they go into the descriptor list verbatim.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryType {
    ExceptionBlock = 0,
    SystemBlock = 1,
    Free = 2,
    Bad = 3,
    LoadedProgram = 4,
    FirmwareTemporary = 5,
    FirmwarePermanent = 6,
    OsloaderHeap = 7,
    OsloaderStack = 8,
    SystemCode = 9,
    HalCode = 10,
    BootDriver = 11,
    ConsoleInDriver = 12,
    ConsoleOutDriver = 13,
    StartupDpcStack = 14,
    StartupKernelStack = 15,
    StartupPanicStack = 16,
    StartupPcrPage = 17,
    StartupPdrPage = 18,
    RegistryData = 19,
    MemoryData = 20,
    NlsData = 21,
    SpecialMemory = 22,
    BbtMemory = 23,
    Reserve = 24,
    XipRom = 25,
    HalCachedMemory = 26,
    LargePageFiller = 27,
    ErrorLogMemory = 28,
}

impl MemoryType {
    pub const fn is_free(self) -> bool {
        matches!(self, MemoryType::Free)
    }

    /// Memory the loader itself allocated and the kernel must account for
    /// (as opposed to firmware ranges and holes).
    pub const fn is_loader_owned(self) -> bool {
        !matches!(
            self,
            MemoryType::Free
                | MemoryType::Bad
                | MemoryType::FirmwareTemporary
                | MemoryType::FirmwarePermanent
                | MemoryType::SpecialMemory
        )
    }

    /// Tag an imported firmware descriptor.
    pub fn from_efi(ty: EfiMemoryType) -> Self {
        match ty {
            EfiMemoryType::CONVENTIONAL => MemoryType::Free,
            EfiMemoryType::UNUSABLE => MemoryType::Bad,
            EfiMemoryType::LOADER_CODE => MemoryType::LoadedProgram,
            EfiMemoryType::LOADER_DATA
            | EfiMemoryType::BOOT_SERVICES_CODE
            | EfiMemoryType::BOOT_SERVICES_DATA => MemoryType::FirmwareTemporary,
            EfiMemoryType::RUNTIME_SERVICES_CODE
            | EfiMemoryType::RUNTIME_SERVICES_DATA
            | EfiMemoryType::ACPI_RECLAIM
            | EfiMemoryType::ACPI_NON_VOLATILE => MemoryType::FirmwarePermanent,
            // RESERVED, MMIO, MMIO_PORT_SPACE, PAL_CODE, PERSISTENT_MEMORY, OEM ranges
            _ => MemoryType::SpecialMemory,
        }
    }

    /// Inverse of `as u32`, for reading descriptors back.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        use MemoryType::*;
        const ALL: [MemoryType; 29] = [
            ExceptionBlock, SystemBlock, Free, Bad, LoadedProgram, FirmwareTemporary,
            FirmwarePermanent, OsloaderHeap, OsloaderStack, SystemCode, HalCode, BootDriver,
            ConsoleInDriver, ConsoleOutDriver, StartupDpcStack, StartupKernelStack,
            StartupPanicStack, StartupPcrPage, StartupPdrPage, RegistryData, MemoryData, NlsData,
            SpecialMemory, BbtMemory, Reserve, XipRom, HalCachedMemory, LargePageFiller,
            ErrorLogMemory,
        ];
        if (raw as usize) < ALL.len() {
            Some(ALL[raw as usize])
        } else {
            None
        }
    }

    /// Type to request from AllocatePages when the loader claims memory of
    /// this kind.
    pub fn to_efi(self) -> EfiMemoryType {
        match self {
            MemoryType::LoadedProgram
            | MemoryType::SystemCode
            | MemoryType::HalCode
            | MemoryType::BootDriver => EfiMemoryType::LOADER_CODE,
            _ => EfiMemoryType::LOADER_DATA,
        }
    }
}
