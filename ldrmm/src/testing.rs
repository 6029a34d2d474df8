// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Host-side stand-ins for firmware, CPU and physical memory.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use uefi::Status;
use uefi::boot::AllocateType;
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType as EfiMemoryType};

use crate::arch::CpuControl;
use crate::firmware::{EFI_2_30, Firmware, MemoryMapInfo, PhysMemory};
use crate::paging::{FrameAllocator, PagingMode};
use crate::{MmError, PAGE_SIZE};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn desc(ty: EfiMemoryType, phys_start: u64, page_count: u64, att: MemoryAttribute) -> MemoryDescriptor {
    MemoryDescriptor {
        ty,
        phys_start,
        page_count,
        att,
        ..Default::default()
    }
}

/* --------------------------------- Heap watch -------------------------------- */

/// Counts this thread's heap allocations while a watch is open, so tests can
/// tell whether the loader touched pool after ExitBootServices.
struct WatchedHeap;

thread_local! {
    static WATCHING: Cell<bool> = const { Cell::new(false) };
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn note_allocation() {
    let watching = WATCHING.try_with(Cell::get).unwrap_or(false);
    if watching {
        let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
    }
}

unsafe impl GlobalAlloc for WatchedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        note_allocation();
        unsafe { System.realloc(ptr, layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static HEAP: WatchedHeap = WatchedHeap;

pub fn watch_heap() {
    ALLOCATIONS.with(|n| n.set(0));
    WATCHING.with(|w| w.set(true));
}

/// Close the watch; returns the allocations seen since [`watch_heap`].
pub fn unwatch_heap() -> usize {
    WATCHING.with(|w| w.set(false));
    ALLOCATIONS.with(Cell::get)
}

/// Run `f` without counting, for the fakes' own bookkeeping.
fn unwatched<R>(f: impl FnOnce() -> R) -> R {
    let was = WATCHING.with(|w| w.replace(false));
    let r = f();
    WATCHING.with(|w| w.set(was));
    r
}

/* ------------------------------ Physical memory ------------------------------ */

/// `[0, size)` of fake physical memory.
pub struct PhysRam {
    _words: Vec<u64>,
    base: *mut u8,
    size: u64,
}

impl PhysRam {
    pub fn new(size: u64) -> Self {
        let mut words = vec![0u64; (size / 8) as usize];
        let base = words.as_mut_ptr() as *mut u8;
        Self {
            _words: words,
            base,
            size,
        }
    }
}

impl core::fmt::Debug for PhysRam {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysRam").field("size", &self.size).finish()
    }
}

impl PhysMemory for PhysRam {
    fn phys_ptr(&self, pa: u64) -> *mut u8 {
        assert!(pa < self.size, "fake RAM: {pa:#x} out of range");
        unsafe { self.base.add(pa as usize) }
    }
}

/// Bump allocator over `[base, base + size)` for page-table tests.
#[derive(Debug)]
pub struct Arena {
    ram: PhysRam,
    next: u64,
    end: u64,
    allocated: usize,
}

impl Arena {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            ram: PhysRam::new(base + size),
            next: base,
            end: base + size,
            allocated: 0,
        }
    }

    pub fn tables_allocated(&self) -> usize {
        self.allocated
    }
}

impl PhysMemory for Arena {
    fn phys_ptr(&self, pa: u64) -> *mut u8 {
        self.ram.phys_ptr(pa)
    }
}

impl FrameAllocator for Arena {
    fn allocate_table(&mut self) -> Result<u64, MmError> {
        if self.next + PAGE_SIZE > self.end {
            return Err(MmError::OutOfFrames);
        }
        let pa = self.next;
        self.next += PAGE_SIZE;
        self.allocated += 1;
        unsafe { self.zero_page(pa) };
        Ok(pa)
    }
}

/* ---------------------------------- Firmware --------------------------------- */

/// Firmware stride, deliberately wider than `MemoryDescriptor`.
const FAKE_DESC_SIZE: usize = 48;
const FAKE_RAM: u64 = 0x80_0000;

#[derive(Debug)]
pub struct FakeFirmware {
    ram: PhysRam,
    map: Vec<MemoryDescriptor>,
    key: usize,
    queries: usize,
    image: (u64, u64),
    revision: u32,
    system_table: u64,
    /// Next ExitBootServices fails as if an event allocated behind our back.
    pub stale_key_once: bool,
    pub ebs_calls: usize,
    pub exited: bool,
    pub virtual_map: Option<Vec<MemoryDescriptor>>,
    pub repointed: Option<u64>,
    /// AllocatePages calls that may still succeed; `None` is unlimited.
    pub allocations_left: Option<usize>,
    /// Heap allocations between ExitBootServices and the repoint.
    pub heap_after_exit: Option<usize>,
}

impl FakeFirmware {
    pub fn new(mut map: Vec<MemoryDescriptor>) -> Self {
        map.sort_by_key(|d| d.phys_start);
        Self {
            ram: PhysRam::new(FAKE_RAM),
            map,
            key: 1,
            queries: 0,
            image: (0, 0),
            revision: EFI_2_30,
            system_table: 0,
            stale_key_once: false,
            ebs_calls: 0,
            exited: false,
            virtual_map: None,
            repointed: None,
            allocations_left: None,
            heap_after_exit: None,
        }
    }

    /// A small but complete machine: low RAM, loader image at 1 MiB, firmware
    /// stack, runtime code/data, and an MMIO range.
    pub fn standard() -> Self {
        let wb = MemoryAttribute::WRITE_BACK;
        let rt = MemoryAttribute::WRITE_BACK | MemoryAttribute::RUNTIME;
        let mut fw = Self::new(vec![
            desc(EfiMemoryType::BOOT_SERVICES_DATA, 0, 1, wb),
            desc(EfiMemoryType::CONVENTIONAL, 0x1000, 0x9F, wb),
            desc(EfiMemoryType::LOADER_CODE, 0x10_0000, 0x10, wb),
            desc(EfiMemoryType::CONVENTIONAL, 0x11_0000, 0x4F0, wb),
            desc(EfiMemoryType::BOOT_SERVICES_DATA, 0x60_0000, 0x40, wb),
            desc(EfiMemoryType::RUNTIME_SERVICES_CODE, 0x64_0000, 0x10, rt),
            desc(EfiMemoryType::RUNTIME_SERVICES_DATA, 0x65_0000, 0x10, rt),
            desc(EfiMemoryType::CONVENTIONAL, 0x66_0000, 0x1A0, wb),
            desc(
                EfiMemoryType::MMIO,
                0xFEC0_0000,
                1,
                MemoryAttribute::UNCACHEABLE | MemoryAttribute::RUNTIME,
            ),
        ]);
        fw.image = (0x10_0000, 0x10 * PAGE_SIZE);
        fw.system_table = 0x65_0018;
        fw
    }

    pub fn set_image(&mut self, base: u64, size: u64) {
        self.image = (base, size);
    }

    pub fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    pub fn descriptors(&self) -> &[MemoryDescriptor] {
        &self.map
    }

    pub fn current_key(&self) -> usize {
        self.key
    }

    pub fn map_queries(&self) -> usize {
        self.queries
    }

    fn carve(&mut self, at: Option<u64>, pages: u64, ty: EfiMemoryType) -> Result<u64, Status> {
        let bytes = pages * PAGE_SIZE;
        let idx = self
            .map
            .iter()
            .position(|d| {
                let end = d.phys_start + d.page_count * PAGE_SIZE;
                d.ty == EfiMemoryType::CONVENTIONAL
                    && match at {
                        None => d.page_count >= pages,
                        Some(a) => a >= d.phys_start && a + bytes <= end,
                    }
            })
            .ok_or(Status::OUT_OF_RESOURCES)?;
        let d = self.map.remove(idx);
        let start = at.unwrap_or(d.phys_start);
        let end = d.phys_start + d.page_count * PAGE_SIZE;
        if start > d.phys_start {
            self.map.push(desc(
                EfiMemoryType::CONVENTIONAL,
                d.phys_start,
                (start - d.phys_start) / PAGE_SIZE,
                d.att,
            ));
        }
        self.map.push(desc(ty, start, pages, d.att));
        if start + bytes < end {
            self.map.push(desc(
                EfiMemoryType::CONVENTIONAL,
                start + bytes,
                (end - start - bytes) / PAGE_SIZE,
                d.att,
            ));
        }
        self.map.sort_by_key(|d| d.phys_start);
        self.key += 1;
        Ok(start)
    }
}

impl PhysMemory for FakeFirmware {
    fn phys_ptr(&self, pa: u64) -> *mut u8 {
        self.ram.phys_ptr(pa)
    }
}

impl Firmware for FakeFirmware {
    fn get_memory_map(&mut self, buffer: &mut [u8]) -> Result<MemoryMapInfo, MmError> {
        self.queries += 1;
        let required = self.map.len() * FAKE_DESC_SIZE;
        if buffer.len() < required {
            return Err(MmError::BufferTooSmall { required });
        }
        for (i, d) in self.map.iter().enumerate() {
            unsafe {
                core::ptr::write_unaligned(
                    buffer.as_mut_ptr().add(i * FAKE_DESC_SIZE) as *mut MemoryDescriptor,
                    *d,
                )
            };
        }
        Ok(MemoryMapInfo {
            map_size: required,
            map_key: self.key,
            descriptor_size: FAKE_DESC_SIZE,
            descriptor_version: 1,
        })
    }

    fn allocate_pages(
        &mut self,
        ty: AllocateType,
        memory_type: EfiMemoryType,
        pages: usize,
    ) -> Result<u64, Status> {
        assert!(!self.exited, "AllocatePages after ExitBootServices");
        if let Some(left) = self.allocations_left.as_mut() {
            if *left == 0 {
                return Err(Status::OUT_OF_RESOURCES);
            }
            *left -= 1;
        }
        let at = match ty {
            AllocateType::Address(a) => Some(a),
            _ => None,
        };
        self.carve(at, pages as u64, memory_type)
    }

    fn exit_boot_services(&mut self, map_key: usize) -> Result<(), Status> {
        assert!(!self.exited, "ExitBootServices twice");
        self.ebs_calls += 1;
        if self.stale_key_once {
            self.stale_key_once = false;
            self.key += 1;
            return Err(Status::INVALID_PARAMETER);
        }
        if map_key != self.key {
            return Err(Status::INVALID_PARAMETER);
        }
        self.exited = true;
        watch_heap();
        Ok(())
    }

    fn set_virtual_address_map(&mut self, map: &mut [MemoryDescriptor]) -> Result<(), Status> {
        assert!(self.exited, "SetVirtualAddressMap before ExitBootServices");
        assert!(self.virtual_map.is_none(), "SetVirtualAddressMap twice");
        self.virtual_map = Some(unwatched(|| map.to_vec()));
        Ok(())
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn system_table(&self) -> u64 {
        self.system_table
    }

    fn loaded_image(&self) -> (u64, u64) {
        self.image
    }

    fn repoint_system_table(&mut self, virtual_address: u64) {
        self.heap_after_exit = Some(unwatch_heap());
        self.repointed = Some(virtual_address);
    }
}

/* ------------------------------------ CPU ------------------------------------ */

#[derive(Debug)]
pub struct FakeCpu {
    pub stack: u64,
    pub modes: Vec<PagingMode>,
    pub switched: Option<(PagingMode, u64)>,
}

impl FakeCpu {
    pub fn new() -> Self {
        Self {
            stack: 0x63_F000 + 0xF40,
            modes: vec![PagingMode::Legacy, PagingMode::Pae, PagingMode::Long],
            switched: None,
        }
    }
}

impl CpuControl for FakeCpu {
    fn stack_pointer(&self) -> u64 {
        self.stack
    }

    fn supports(&self, mode: PagingMode) -> bool {
        self.modes.contains(&mode)
    }

    unsafe fn switch_address_space(&mut self, mode: PagingMode, root: u64) {
        assert!(self.switched.is_none(), "address space switched twice");
        self.switched = Some((mode, root));
    }
}
