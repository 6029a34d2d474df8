// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! `ldrmm::Firmware` over the real boot and runtime services.
//!
//! GetMemoryMap, ExitBootServices and SetVirtualAddressMap go through the raw
//! tables: the loader owns the map key and the order of the calls.

use core::ptr::NonNull;

use ldrmm::{Firmware, MemoryMapInfo, MmError, PhysMemory};
use uefi::boot::{self, AllocateType};
use uefi::mem::memory_map::{MemoryDescriptor, MemoryType};
use uefi::proto::loaded_image::LoadedImage;
use uefi::{Handle, Status};
use uefi_raw::table::boot::BootServices;
use uefi_raw::table::runtime::RuntimeServices;
use uefi_raw::table::system::SystemTable;

#[derive(Debug)]
pub struct UefiFirmware {
    system_table: NonNull<SystemTable>,
    image: Handle,
    image_range: (u64, u64),
    revision: u32,
}

impl UefiFirmware {
    pub fn new() -> uefi::Result<Self> {
        let system_table = uefi::table::system_table_raw().ok_or(Status::NOT_READY)?;
        let image = boot::image_handle();
        let image_range = {
            let loaded = boot::open_protocol_exclusive::<LoadedImage>(image)?;
            let (base, size) = loaded.info();
            (base as usize as u64, size)
        };
        let rev = uefi::system::uefi_revision();
        Ok(Self {
            system_table,
            image,
            image_range,
            revision: (u32::from(rev.major()) << 16) | u32::from(rev.minor()),
        })
    }

    fn boot_services(&self) -> &BootServices {
        unsafe { &*self.system_table.as_ref().boot_services }
    }

    fn runtime_services(&self) -> &RuntimeServices {
        unsafe { &*self.system_table.as_ref().runtime_services }
    }
}

impl PhysMemory for UefiFirmware {}

impl Firmware for UefiFirmware {
    fn get_memory_map(&mut self, buffer: &mut [u8]) -> Result<MemoryMapInfo, MmError> {
        let mut map_size = buffer.len();
        let mut map_key = 0usize;
        let mut descriptor_size = 0usize;
        let mut descriptor_version = 0u32;
        let status = unsafe {
            (self.boot_services().get_memory_map)(
                &mut map_size,
                buffer.as_mut_ptr().cast(),
                &mut map_key,
                &mut descriptor_size,
                &mut descriptor_version,
            )
        };
        match status {
            Status::SUCCESS => Ok(MemoryMapInfo {
                map_size,
                map_key,
                descriptor_size,
                descriptor_version,
            }),
            Status::BUFFER_TOO_SMALL => Err(MmError::BufferTooSmall { required: map_size }),
            s => Err(MmError::firmware("GetMemoryMap", s)),
        }
    }

    fn allocate_pages(
        &mut self,
        ty: AllocateType,
        memory_type: MemoryType,
        pages: usize,
    ) -> Result<u64, Status> {
        boot::allocate_pages(ty, memory_type, pages)
            .map(|p| p.as_ptr() as usize as u64)
            .map_err(|e| e.status())
    }

    fn exit_boot_services(&mut self, map_key: usize) -> Result<(), Status> {
        let status =
            unsafe { (self.boot_services().exit_boot_services)(self.image.as_ptr(), map_key) };
        check(status)
    }

    fn set_virtual_address_map(&mut self, map: &mut [MemoryDescriptor]) -> Result<(), Status> {
        let stride = size_of::<MemoryDescriptor>();
        let status = unsafe {
            (self.runtime_services().set_virtual_address_map)(
                map.len() * stride,
                stride,
                MemoryDescriptor::VERSION,
                map.as_mut_ptr(),
            )
        };
        check(status)
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn system_table(&self) -> u64 {
        self.system_table.as_ptr() as usize as u64
    }

    fn loaded_image(&self) -> (u64, u64) {
        self.image_range
    }

    fn repoint_system_table(&mut self, virtual_address: u64) {
        let st = virtual_address as usize as *const SystemTable;
        unsafe { uefi::table::set_system_table(st) };
        if let Some(p) = NonNull::new(st.cast_mut()) {
            self.system_table = p;
        }
    }
}

fn check(status: Status) -> Result<(), Status> {
    if status.is_success() {
        Ok(())
    } else {
        Err(status)
    }
}
