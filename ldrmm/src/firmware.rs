// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! The firmware services the ledger consumes.
//!
//! `ldrboot` implements these over the real boot/runtime services; the unit
//! tests use an in-memory fake.

use uefi::Status;
use uefi::boot::AllocateType;
use uefi::mem::memory_map::{MemoryDescriptor, MemoryType as EfiMemoryType};

use crate::MmError;

/// Access to physical frames. On real hardware the firmware keeps memory
/// identity mapped until the CR3 switch, so this is a cast.
pub trait PhysMemory {
    fn phys_ptr(&self, pa: u64) -> *mut u8 {
        pa as usize as *mut u8
    }

    /// # Safety
    /// `pa` must be a frame this loader owns.
    unsafe fn zero_page(&self, pa: u64) {
        unsafe { core::ptr::write_bytes(self.phys_ptr(pa), 0, crate::PAGE_SIZE as usize) };
    }
}

/// Output of a successful GetMemoryMap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapInfo {
    pub map_size: usize,
    pub map_key: usize,
    pub descriptor_size: usize,
    pub descriptor_version: u32,
}

pub trait Firmware: PhysMemory {
    /// GetMemoryMap into `buffer`. A short buffer yields
    /// [`MmError::BufferTooSmall`] carrying the size the firmware wants.
    fn get_memory_map(&mut self, buffer: &mut [u8]) -> Result<MemoryMapInfo, MmError>;

    /// AllocatePages; returns the physical base.
    fn allocate_pages(
        &mut self,
        ty: AllocateType,
        memory_type: EfiMemoryType,
        pages: usize,
    ) -> Result<u64, Status>;

    /// ExitBootServices. `Status::INVALID_PARAMETER` means the key is stale.
    fn exit_boot_services(&mut self, map_key: usize) -> Result<(), Status>;

    /// SetVirtualAddressMap with a map using `size_of::<MemoryDescriptor>()`
    /// as its stride.
    fn set_virtual_address_map(&mut self, map: &mut [MemoryDescriptor]) -> Result<(), Status>;

    /// `major << 16 | minor`, e.g. `0x0002_001E` for 2.30.
    fn revision(&self) -> u32;

    /// Physical address of the EFI system table.
    fn system_table(&self) -> u64;

    /// Physical base and size in bytes of the running loader image.
    fn loaded_image(&self) -> (u64, u64);

    /// Point the global system-table pointer at its post-transition alias.
    fn repoint_system_table(&mut self, virtual_address: u64);
}

/// UEFI 2.30, from which firmware expects the runtime map to describe its own
/// storage.
pub const EFI_2_30: u32 = (2 << 16) | 30;
