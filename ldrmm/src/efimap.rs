// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Firmware memory map: retrieval and import into the ledger.

use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;

use log::{debug, info, warn};
use uefi::Status;
use uefi::mem::memory_map::{MemoryDescriptor, MemoryType as EfiMemoryType};

use crate::firmware::{Firmware, MemoryMapInfo};
use crate::layout::{LEGACY_ROM_BASE, LEGACY_ROM_PAGES, VaCursor};
use crate::ledger::Ledger;
use crate::memtype::MemoryType;
use crate::{MmError, PAGE_SIZE};

/// Give up growing the buffer after this many rounds.
const MAX_MAP_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct EfiMemoryMap {
    pub descriptors: Vec<MemoryDescriptor>,
    pub info: MemoryMapInfo,
}

impl EfiMemoryMap {
    /// GetMemoryMap with the usual grow-and-retry dance. Every round can
    /// itself grow the map (the buffer is pool memory), so leave slack.
    pub fn fetch<F: Firmware + ?Sized>(fw: &mut F) -> Result<Self, MmError> {
        let mut buffer = Vec::new();
        let info = fetch_raw(fw, &mut buffer)?;
        Ok(Self {
            descriptors: parse(&buffer, &info)?,
            info,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryDescriptor> {
        self.descriptors.iter()
    }
}

/// Grow `buffer` until the map fits. Returns the map's metadata; the
/// descriptors are left in `buffer`.
pub fn fetch_raw<F: Firmware + ?Sized>(
    fw: &mut F,
    buffer: &mut Vec<u8>,
) -> Result<MemoryMapInfo, MmError> {
    for _ in 0..MAX_MAP_ATTEMPTS {
        match fw.get_memory_map(buffer) {
            Ok(info) => return Ok(info),
            Err(MmError::BufferTooSmall { required }) => {
                let slack = 2 * size_of::<MemoryDescriptor>().max(64);
                debug!("efimap: growing map buffer to {} bytes", required + slack);
                *buffer = vec![0u8; required + slack];
            }
            Err(e) => return Err(e),
        }
    }
    Err(MmError::BufferTooSmall {
        required: buffer.len(),
    })
}

/// Split a raw map using the firmware's descriptor stride.
pub fn parse(buffer: &[u8], info: &MemoryMapInfo) -> Result<Vec<MemoryDescriptor>, MmError> {
    let stride = info.descriptor_size;
    if stride < size_of::<MemoryDescriptor>() || info.map_size > buffer.len() {
        warn!(
            "efimap: nonsense map, stride {} size {} in a {} byte buffer",
            stride,
            info.map_size,
            buffer.len()
        );
        return Err(MmError::firmware("GetMemoryMap", Status::COMPROMISED_DATA));
    }
    let count = info.map_size / stride;
    Ok((0..count)
        .map(|i| unsafe {
            core::ptr::read_unaligned(buffer.as_ptr().add(i * stride) as *const MemoryDescriptor)
        })
        .collect())
}

/// Record every firmware descriptor in the ledger.
///
/// Non-free ranges are placed at `cursor`; free and bad ones stay unplaced.
/// Loader-code ranges under the running image also get an identity alias so
/// execution survives the CR3 switch, and the legacy ROM window is forced in
/// when the firmware leaves it out.
pub fn import(
    ledger: &mut Ledger,
    cursor: &mut VaCursor,
    map: &EfiMemoryMap,
    image: (u64, u64),
) -> Result<(), MmError> {
    let (image_base, image_size) = image;
    let image_end = image_base + image_size;

    for d in map.iter() {
        if d.page_count == 0 {
            continue;
        }
        let ty = MemoryType::from_efi(d.ty);
        let base = d.phys_start;
        let pages = d.page_count;
        match ty {
            MemoryType::Free | MemoryType::Bad => ledger.insert(base, None, pages, ty),
            _ => {
                let va = cursor.take(pages)?;
                ledger.insert(base, Some(va), pages, ty);
            }
        }

        let end = base + pages * PAGE_SIZE;
        if d.ty == EfiMemoryType::LOADER_CODE && base < image_end && image_base < end {
            debug!("efimap: identity alias for loader image {:#x}+{}", base, pages);
            ledger.insert(base, Some(base), pages, MemoryType::FirmwareTemporary);
        }
    }

    if !ledger.intersects(LEGACY_ROM_BASE, LEGACY_ROM_PAGES) {
        debug!("efimap: firmware omitted the ROM window, forcing it in");
        ledger.insert(
            LEGACY_ROM_BASE,
            Some(LEGACY_ROM_BASE),
            LEGACY_ROM_PAGES,
            MemoryType::FirmwarePermanent,
        );
    }
    info!(
        "efimap: imported {} descriptors, ledger holds {} mappings",
        map.descriptors.len(),
        ledger.len()
    );
    Ok(())
}
