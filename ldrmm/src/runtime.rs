// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Virtual map handed to SetVirtualAddressMap.
//!
//! Built from the imported firmware map, not from the ledger: firmware only
//! wants its own runtime ranges back, each with a fresh virtual address.

use core::mem::size_of;

use log::{debug, info};
use uefi::boot::AllocateType;
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType as EfiMemoryType};

use crate::efimap::EfiMemoryMap;
use crate::firmware::{EFI_2_30, Firmware, PhysMemory};
use crate::layout::VaCursor;
use crate::ledger::Ledger;
use crate::memtype::MemoryType;
use crate::{MmError, PAGE_SIZE, pages_for};

/// Does SetVirtualAddressMap need to know about `d`?
pub fn is_runtime(d: &MemoryDescriptor) -> bool {
    d.att.contains(MemoryAttribute::RUNTIME)
        && matches!(
            d.ty,
            EfiMemoryType::RUNTIME_SERVICES_CODE
                | EfiMemoryType::RUNTIME_SERVICES_DATA
                | EfiMemoryType::MMIO
                | EfiMemoryType::MMIO_PORT_SPACE
        )
}

/// Descriptor array living in firmware-allocated pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeMap {
    storage: u64,
    count: usize,
}

impl RuntimeMap {
    /// Copy the runtime descriptors of `map` into new storage, give each a
    /// virtual address from `cursor` and record the alias in `ledger`.
    ///
    /// From UEFI 2.30 on, the storage is runtime data itself and is appended
    /// as the final entry so firmware can still find the table afterwards.
    pub fn build<F: Firmware + ?Sized>(
        fw: &mut F,
        ledger: &mut Ledger,
        cursor: &mut VaCursor,
        map: &EfiMemoryMap,
        placement: AllocateType,
    ) -> Result<Self, MmError> {
        let describe_self = fw.revision() >= EFI_2_30;
        let found = map.iter().filter(|d| is_runtime(d) && d.page_count != 0).count();
        let count = found + usize::from(describe_self);
        let storage_pages = pages_for((count * size_of::<MemoryDescriptor>()) as u64).max(1);
        let storage_type = if describe_self {
            EfiMemoryType::RUNTIME_SERVICES_DATA
        } else {
            EfiMemoryType::LOADER_DATA
        };
        let storage = fw
            .allocate_pages(placement, storage_type, storage_pages as usize)
            .map_err(|s| MmError::firmware("AllocatePages", s))?;

        let base = fw.phys_ptr(storage) as *mut MemoryDescriptor;
        let mut written = 0;
        for d in map.iter().filter(|d| is_runtime(d) && d.page_count != 0) {
            let va = cursor.take(d.page_count)?;
            ledger.insert(d.phys_start, Some(va), d.page_count, MemoryType::FirmwarePermanent);
            let entry = MemoryDescriptor {
                virt_start: va,
                ..*d
            };
            unsafe { base.add(written).write(entry) };
            debug!(
                "runtime: {:?} {:#x}+{} -> {:#x}",
                d.ty, d.phys_start, d.page_count, va
            );
            written += 1;
        }

        if describe_self {
            let va = cursor.take(storage_pages)?;
            ledger.insert(storage, Some(va), storage_pages, MemoryType::FirmwarePermanent);
            let entry = MemoryDescriptor {
                ty: EfiMemoryType::RUNTIME_SERVICES_DATA,
                phys_start: storage,
                virt_start: va,
                page_count: storage_pages,
                att: MemoryAttribute::WRITE_BACK | MemoryAttribute::RUNTIME,
                ..Default::default()
            };
            unsafe { base.add(written).write(entry) };
            written += 1;
        } else {
            ledger.insert(storage, None, storage_pages, MemoryType::OsloaderHeap);
        }
        debug_assert_eq!(written, count);

        info!(
            "runtime: {} descriptors at {:#x} ({} pages)",
            count, storage, storage_pages
        );
        Ok(Self { storage, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Physical base of the descriptor array.
    pub fn storage(&self) -> u64 {
        self.storage
    }

    /// # Safety
    /// `mem` must reach the storage this map was built in, and nothing else
    /// may hold a reference into it for `'a`.
    pub unsafe fn descriptors_mut<'a, M: PhysMemory + ?Sized>(
        &self,
        mem: &M,
    ) -> &'a mut [MemoryDescriptor] {
        let base = mem.phys_ptr(self.storage) as *mut MemoryDescriptor;
        unsafe { core::slice::from_raw_parts_mut(base, self.count) }
    }

    /// Copy of the array.
    pub fn descriptors<M: PhysMemory + ?Sized>(&self, mem: &M) -> alloc::vec::Vec<MemoryDescriptor> {
        let base = mem.phys_ptr(self.storage) as *const MemoryDescriptor;
        (0..self.count)
            .map(|i| unsafe { base.add(i).read() })
            .collect()
    }

    /// Virtual address firmware will use for `pa`, if it lies in one of the
    /// remapped ranges. Reads the array in place.
    pub fn find_virtual<M: PhysMemory + ?Sized>(&self, mem: &M, pa: u64) -> Option<u64> {
        let base = mem.phys_ptr(self.storage) as *const MemoryDescriptor;
        (0..self.count)
            .map(|i| unsafe { base.add(i).read() })
            .find_map(|d| {
                let len = d.page_count * PAGE_SIZE;
                (pa >= d.phys_start && pa - d.phys_start < len)
                    .then(|| d.virt_start + (pa - d.phys_start))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFirmware, init_logging};

    const BASE: u64 = 0xFFFF_F880_0000_0000;

    fn build(fw: &mut FakeFirmware) -> (Ledger, RuntimeMap) {
        let map = EfiMemoryMap::fetch(fw).unwrap();
        let mut ledger = Ledger::new();
        let mut cursor = VaCursor::new(BASE, 0x100_0000);
        let rt = RuntimeMap::build(fw, &mut ledger, &mut cursor, &map, AllocateType::AnyPages).unwrap();
        (ledger, rt)
    }

    #[test]
    fn runtime_filter() {
        let mut d = MemoryDescriptor {
            ty: EfiMemoryType::RUNTIME_SERVICES_CODE,
            att: MemoryAttribute::RUNTIME,
            page_count: 1,
            ..Default::default()
        };
        assert!(is_runtime(&d));
        d.att = MemoryAttribute::WRITE_BACK;
        assert!(!is_runtime(&d));
        d.ty = EfiMemoryType::BOOT_SERVICES_DATA;
        d.att = MemoryAttribute::RUNTIME;
        assert!(!is_runtime(&d));
    }

    #[test]
    fn new_firmware_gets_its_storage_described() {
        init_logging();
        let mut fw = FakeFirmware::standard();
        let (ledger, rt) = build(&mut fw);
        let d = rt.descriptors(&fw);
        assert_eq!(rt.len(), 4);
        let kinds: alloc::vec::Vec<_> = d.iter().map(|d| d.ty).collect();
        assert_eq!(
            kinds,
            [
                EfiMemoryType::RUNTIME_SERVICES_CODE,
                EfiMemoryType::RUNTIME_SERVICES_DATA,
                EfiMemoryType::MMIO,
                EfiMemoryType::RUNTIME_SERVICES_DATA,
            ]
        );
        assert_eq!(d[0].virt_start, BASE);
        assert_eq!(d[1].virt_start, BASE + 0x10 * PAGE_SIZE);
        assert_eq!(d[2].virt_start, BASE + 0x20 * PAGE_SIZE);
        assert_eq!(d[3].phys_start, rt.storage());
        assert!(d[3].att.contains(MemoryAttribute::RUNTIME));

        // The storage shows up as runtime data in the firmware's own map.
        assert!(fw.descriptors().iter().any(|f| f.phys_start == rt.storage()
            && f.ty == EfiMemoryType::RUNTIME_SERVICES_DATA));
        // Every entry is reachable through the ledger.
        for e in &d {
            assert_eq!(ledger.find_physical(e.virt_start), Some(e.phys_start));
        }
    }

    #[test]
    fn old_firmware_gets_loader_storage() {
        let mut fw = FakeFirmware::standard();
        fw.set_revision((2 << 16) | 10);
        let (ledger, rt) = build(&mut fw);
        assert_eq!(rt.len(), 3);
        assert!(fw.descriptors().iter().any(|f| f.phys_start == rt.storage()
            && f.ty == EfiMemoryType::LOADER_DATA));
        let m = ledger
            .iter()
            .find(|m| m.physical_base == rt.storage())
            .copied()
            .unwrap();
        assert_eq!(m.virtual_base, None);
        assert_eq!(m.memory_type, MemoryType::OsloaderHeap);
    }

    #[test]
    fn system_table_resolves_through_runtime_map() {
        let mut fw = FakeFirmware::standard();
        let (_, rt) = build(&mut fw);
        assert_eq!(
            rt.find_virtual(&fw, fw.system_table()),
            Some(BASE + 0x10 * PAGE_SIZE + 0x18)
        );
        assert_eq!(rt.find_virtual(&fw, 0x1000), None);
    }
}
