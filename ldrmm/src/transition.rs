// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! The boot context and the one-way handoff to the kernel's address space.
//!
//! ```text
//! Preparing -> MapsBuilt -> ExitedBootServices -> VirtualAddressesSet -> PagingEnabled
//! ```
//!
//! Nothing is retried or rolled back. Errors before ExitBootServices return
//! to the caller, who can still fall back to firmware, but leave the context
//! `Failed`; anything after it halts.

use alloc::vec::Vec;

use log::{debug, error, info};
use uefi::Status;
use uefi::boot::AllocateType;
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType as EfiMemoryType};

use crate::arch::CpuControl;
use crate::descriptors::{self, DescriptorList};
use crate::efimap::{self, EfiMemoryMap};
use crate::firmware::{Firmware, PhysMemory};
use crate::layout::{KernelLayout, VaCursor};
use crate::ledger::{Ledger, Mapping};
use crate::memtype::MemoryType;
use crate::paging::{EntryFlags, FrameAllocator, PageTables, PagingMode, selfmap};
use crate::runtime::RuntimeMap;
use crate::{MmError, PAGE_SIZE, align_down, pages_for};

/// ExitBootServices attempts before giving up on a moving map key.
const MAX_EXIT_ATTEMPTS: usize = 4;
/// Spare descriptor slots for what mapping the storage itself adds.
const DESCRIPTOR_SLACK: usize = 16;
const DEFAULT_STACK_PAGES: u64 = 16;

const RAM_FLAGS: EntryFlags = EntryFlags::PRESENT.union(EntryFlags::WRITABLE);
const DEVICE_FLAGS: EntryFlags = RAM_FLAGS
    .union(EntryFlags::WRITE_THROUGH)
    .union(EntryFlags::NO_CACHE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    Preparing,
    MapsBuilt,
    ExitedBootServices,
    VirtualAddressesSet,
    PagingEnabled,
    /// Building the maps or leaving boot services failed. Firmware and the
    /// ledger already carry part of the work, so nothing may run again.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmConfig {
    pub mode: PagingMode,
    /// Physical base of the local APIC, if the CPU has one.
    pub apic_base: Option<u64>,
    /// Pages identity mapped around the loader stack pointer.
    pub stack_pages: u64,
}

impl MmConfig {
    pub const fn new(mode: PagingMode) -> Self {
        Self {
            mode,
            apic_base: None,
            stack_pages: DEFAULT_STACK_PAGES,
        }
    }

    pub const fn with_apic(mut self, apic_base: Option<u64>) -> Self {
        self.apic_base = apic_base;
        self
    }

    /// 32-bit kernels cannot reach anything above 4 GiB.
    fn placement(&self) -> AllocateType {
        match self.mode {
            PagingMode::Legacy | PagingMode::Pae => AllocateType::MaxAddress(0xFFFF_FFFF),
            PagingMode::Long => AllocateType::AnyPages,
        }
    }
}

/* ------------------------------ Table frames ------------------------------- */

/// Page-table frames from firmware, each one recorded in the ledger so the
/// kernel sees it.
struct TableFrames<'a, F: Firmware> {
    fw: &'a mut F,
    ledger: &'a mut Ledger,
    placement: AllocateType,
}

impl<F: Firmware> PhysMemory for TableFrames<'_, F> {
    fn phys_ptr(&self, pa: u64) -> *mut u8 {
        self.fw.phys_ptr(pa)
    }
}

impl<F: Firmware> FrameAllocator for TableFrames<'_, F> {
    fn allocate_table(&mut self) -> Result<u64, MmError> {
        let pa = self
            .fw
            .allocate_pages(self.placement, EfiMemoryType::LOADER_DATA, 1)
            .map_err(|_| MmError::OutOfFrames)?;
        unsafe { self.zero_page(pa) };
        self.ledger.insert(pa, None, 1, MemoryType::MemoryData);
        Ok(pa)
    }
}

/* ------------------------------- Boot context ------------------------------ */

/// What the CR3 switch needs, read out before ExitBootServices.
#[derive(Debug, Clone, Copy)]
struct Handoff {
    root: u64,
    spanned: u64,
    system_table_virtual: u64,
}

/// Everything the loader knows about memory while boot services are alive.
#[derive(Debug)]
pub struct BootContext<F: Firmware, C: CpuControl> {
    fw: F,
    cpu: C,
    config: MmConfig,
    state: TransitionState,
    ledger: Ledger,
    cursor: VaCursor,
    efi_map: Option<EfiMemoryMap>,
    runtime: Option<RuntimeMap>,
    tables: Option<PageTables>,
    descriptors: Option<DescriptorList>,
    handoff: Option<Handoff>,
    system_table_virtual: Option<u64>,
}

impl<F: Firmware, C: CpuControl> BootContext<F, C> {
    pub fn new(fw: F, cpu: C, config: MmConfig) -> Self {
        Self {
            fw,
            cpu,
            config,
            state: TransitionState::Preparing,
            ledger: Ledger::new(),
            cursor: VaCursor::for_mode(config.mode),
            efi_map: None,
            runtime: None,
            tables: None,
            descriptors: None,
            handoff: None,
            system_table_virtual: None,
        }
    }

    pub fn state(&self) -> TransitionState {
        self.state
    }

    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn firmware(&self) -> &F {
        &self.fw
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn page_tables(&self) -> Option<&PageTables> {
        self.tables.as_ref()
    }

    pub fn descriptor_list(&self) -> Option<&DescriptorList> {
        self.descriptors.as_ref()
    }

    pub fn runtime_map(&self) -> Option<&RuntimeMap> {
        self.runtime.as_ref()
    }

    pub fn efi_map(&self) -> Option<&EfiMemoryMap> {
        self.efi_map.as_ref()
    }

    /// Virtual address the firmware system table was repointed to.
    pub fn system_table_virtual(&self) -> Option<u64> {
        self.system_table_virtual
    }

    fn expect(&self, expected: TransitionState) -> Result<(), MmError> {
        if self.state != expected {
            return Err(MmError::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn advance(&mut self, next: TransitionState) {
        info!("mm: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn settle(&mut self, step: Result<(), MmError>, next: TransitionState) -> Result<(), MmError> {
        match step {
            Ok(()) => {
                self.advance(next);
                Ok(())
            }
            Err(e) => {
                error!("mm: leaving {:?} failed: {}", self.state, e);
                self.advance(TransitionState::Failed);
                Err(e)
            }
        }
    }

    /// Seed the ledger from the firmware map. Done implicitly by the first
    /// [`BootContext::request`] or by [`BootContext::enable_paging`].
    pub fn import_firmware_map(&mut self) -> Result<(), MmError> {
        self.expect(TransitionState::Preparing)?;
        if self.efi_map.is_some() {
            return Err(MmError::AlreadyImported);
        }
        let map = EfiMemoryMap::fetch(&mut self.fw)?;
        efimap::import(
            &mut self.ledger,
            &mut self.cursor,
            &map,
            self.fw.loaded_image(),
        )?;
        self.efi_map = Some(map);
        Ok(())
    }

    fn ensure_imported(&mut self) -> Result<(), MmError> {
        if self.efi_map.is_none() {
            self.import_firmware_map()?;
        }
        Ok(())
    }

    /// Claim `page_count` pages of `memory_type`.
    ///
    /// Without a physical base the pages come from firmware; with one, the
    /// caller already owns the range and it is only recorded. A virtual base
    /// makes the range visible to the kernel at that address. Returns the
    /// physical base.
    pub fn request(
        &mut self,
        physical_base: Option<u64>,
        virtual_base: Option<u64>,
        page_count: u64,
        memory_type: MemoryType,
    ) -> Result<u64, MmError> {
        self.expect(TransitionState::Preparing)?;
        self.ensure_imported()?;
        let pa = match physical_base {
            Some(pa) => align_down(pa, PAGE_SIZE),
            None => self
                .fw
                .allocate_pages(
                    self.config.placement(),
                    memory_type.to_efi(),
                    page_count as usize,
                )
                .map_err(|s| MmError::firmware("AllocatePages", s))?,
        };
        debug!(
            "mm: request {:#x}+{} {:?} -> {:x?}",
            pa, page_count, memory_type, virtual_base
        );
        self.ledger.insert(pa, virtual_base, page_count, memory_type);
        Ok(pa)
    }

    /// Physical to kernel-virtual, through the ledger.
    pub fn find_virtual_address(&self, physical: u64) -> Option<u64> {
        self.ledger.find_virtual(physical)
    }

    /// Build the kernel's address space, leave boot services and switch to
    /// it. Returns the number of pages the loader's own memory spans.
    ///
    /// Callable once; every later call fails with [`MmError::InvalidState`].
    pub fn enable_paging(&mut self) -> Result<u64, MmError> {
        self.expect(TransitionState::Preparing)?;
        let mode = self.config.mode;
        if !self.cpu.supports(mode) {
            return Err(MmError::UnsupportedPagingMode(mode));
        }
        self.ensure_imported()?;

        // Past this point firmware and the ledger hold our edits.
        let built = self.build_maps();
        self.settle(built, TransitionState::MapsBuilt)?;

        let exited = self.exit_boot_services();
        self.settle(exited, TransitionState::ExitedBootServices)?;

        // Boot services are gone: no allocation until the kernel owns memory.
        self.set_virtual_address_map();
        self.advance(TransitionState::VirtualAddressesSet);

        let handoff = match self.handoff {
            Some(h) => h,
            None => fatal("handoff missing after MapsBuilt"),
        };
        unsafe { self.cpu.switch_address_space(mode, handoff.root) };
        self.fw.repoint_system_table(handoff.system_table_virtual);
        self.system_table_virtual = Some(handoff.system_table_virtual);
        self.advance(TransitionState::PagingEnabled);
        Ok(handoff.spanned)
    }

    /* ---- Preparing -> MapsBuilt ---- */

    fn build_maps(&mut self) -> Result<(), MmError> {
        let mode = self.config.mode;
        let layout = KernelLayout::for_mode(mode);
        let placement = self.config.placement();

        let kuser = self.request(None, Some(layout.kuser_shared_data), 1, MemoryType::MemoryData)?;
        unsafe { self.fw.zero_page(kuser) };

        let efi_map = match &self.efi_map {
            Some(m) => m,
            None => return Err(MmError::InvalidState {
                expected: TransitionState::Preparing,
                found: self.state,
            }),
        };
        self.runtime = Some(RuntimeMap::build(
            &mut self.fw,
            &mut self.ledger,
            &mut self.cursor,
            efi_map,
            placement,
        )?);

        let mut frames = TableFrames {
            fw: &mut self.fw,
            ledger: &mut self.ledger,
            placement,
        };
        let tables = PageTables::new(mode, &mut frames)?;
        selfmap::install(&tables, &frames);

        let stack = self.cpu.stack_pointer();
        let stack_base = align_down(stack, PAGE_SIZE).saturating_sub(PAGE_SIZE);
        let build = |frames: &mut TableFrames<'_, F>| -> Result<(), MmError> {
            tables.map(frames, 0, 0, 1)?;
            tables.map(frames, stack_base, stack_base, self.config.stack_pages)?;

            let placed: Vec<_> = frames
                .ledger
                .iter()
                .filter_map(|m| {
                    let flags = leaf_flags(efi_map, m);
                    m.virtual_base.map(|va| (va, m.physical_base, m.page_count, flags))
                })
                .collect();
            for (va, pa, pages, flags) in placed {
                tables.map_with(frames, va, pa, pages, flags)?;
            }

            if let Some(apic) = self.config.apic_base {
                tables.map_with(frames, layout.apic, apic, 1, DEVICE_FLAGS)?;
            }
            if let Some(hal) = layout.hal_window {
                tables.ensure_table(frames, hal)?;
            }
            Ok(())
        };
        if let Err(e) = build(&mut frames) {
            error!("mm: page table build failed: {}", e);
            fatal("cannot populate page tables");
        }
        debug!("mm: stack {:#x}, identity from {:#x}", stack, stack_base);

        let root = tables.root();
        self.tables = Some(tables);
        self.build_descriptor_list(placement)?;
        self.handoff = Some(self.prepare_handoff(root));
        Ok(())
    }

    /// The ledger lives in loader pool, which the new tables do not map, and
    /// nothing may allocate once boot services are gone. Read out what the
    /// switch needs while both still hold.
    fn prepare_handoff(&self, root: u64) -> Handoff {
        let system_table = self.fw.system_table();
        let system_table_virtual = self
            .runtime
            .as_ref()
            .and_then(|rt| rt.find_virtual(&self.fw, system_table))
            .or_else(|| self.ledger.find_virtual(system_table))
            .unwrap_or_else(|| fatal("system table has no virtual alias"));
        Handoff {
            root,
            spanned: self.ledger.loader_pages_spanned(),
            system_table_virtual,
        }
    }

    fn build_descriptor_list(&mut self, placement: AllocateType) -> Result<(), MmError> {
        let width = self.config.mode.pointer_width();
        let node = descriptors::node_size(width);
        let capacity_hint = self.ledger.len() + 1 + DESCRIPTOR_SLACK;
        let pages = pages_for((capacity_hint * node) as u64);
        let capacity = (pages * PAGE_SIZE) as usize / node;

        let va = self.cursor.take(pages)?;
        let pa = self
            .fw
            .allocate_pages(placement, EfiMemoryType::LOADER_DATA, pages as usize)
            .map_err(|s| MmError::firmware("AllocatePages", s))?;
        self.ledger.insert(pa, Some(va), pages, MemoryType::MemoryData);

        let tables = match &self.tables {
            Some(t) => t,
            None => fatal("page tables missing"),
        };
        let mut frames = TableFrames {
            fw: &mut self.fw,
            ledger: &mut self.ledger,
            placement,
        };
        if let Err(e) = tables.map(&mut frames, va, pa, pages) {
            error!("mm: cannot map descriptor storage: {}", e);
            fatal("cannot populate page tables");
        }

        let mut descs = descriptors::collect(&self.ledger);
        descriptors::merge(&mut descs);
        let mut list = DescriptorList::write(&self.fw, width, pa, va, capacity, &descs)?;
        let before = list.read_back(&self.fw, Some);
        list.virtualize(&self.fw, |link| self.ledger.find_virtual(link));
        debug_assert_eq!(
            list.read_back(&self.fw, |va| self.ledger.find_physical(va)),
            before
        );
        info!(
            "mm: {} descriptors ({} ledger mappings), head {:#x} -> {:#x}",
            list.len(),
            self.ledger.len(),
            pa,
            va
        );
        self.ledger.dump();
        self.descriptors = Some(list);
        Ok(())
    }

    /* ---- MapsBuilt -> ExitedBootServices ---- */

    fn exit_boot_services(&mut self) -> Result<(), MmError> {
        // Size the buffer now; from here on nothing may allocate.
        let mut buffer = Vec::new();
        let mut info = efimap::fetch_raw(&mut self.fw, &mut buffer)?;
        for attempt in 1..=MAX_EXIT_ATTEMPTS {
            match self.fw.exit_boot_services(info.map_key) {
                Ok(()) => {
                    // Pool cannot be freed without boot services.
                    core::mem::forget(buffer);
                    return Ok(());
                }
                Err(Status::INVALID_PARAMETER) if attempt < MAX_EXIT_ATTEMPTS => {
                    debug!("mm: stale map key {:#x}, refetching", info.map_key);
                    info = self.fw.get_memory_map(&mut buffer)?;
                }
                Err(status) => return Err(MmError::firmware("ExitBootServices", status)),
            }
        }
        Err(MmError::firmware("ExitBootServices", Status::INVALID_PARAMETER))
    }

    /* ---- ExitedBootServices -> VirtualAddressesSet ---- */

    fn set_virtual_address_map(&mut self) {
        let runtime = match &self.runtime {
            Some(rt) => *rt,
            None => fatal("runtime map missing"),
        };
        let map = unsafe { runtime.descriptors_mut(&self.fw) };
        if let Err(status) = self.fw.set_virtual_address_map(map) {
            error!("mm: SetVirtualAddressMap failed: {:?}", status);
            fatal("SetVirtualAddressMap failed");
        }
    }
}

/// Device memory, by the firmware's account of the range, is mapped uncached.
fn leaf_flags(map: &EfiMemoryMap, m: &Mapping) -> EntryFlags {
    let device = map.iter().any(|d| {
        d.page_count != 0
            && m.physical_base >= d.phys_start
            && m.physical_base - d.phys_start < d.page_count * PAGE_SIZE
            && is_device(d)
    });
    if device { DEVICE_FLAGS } else { RAM_FLAGS }
}

fn is_device(d: &MemoryDescriptor) -> bool {
    matches!(d.ty, EfiMemoryType::MMIO | EfiMemoryType::MMIO_PORT_SPACE)
        || (d.att.contains(MemoryAttribute::UNCACHEABLE)
            && !d.att.contains(MemoryAttribute::WRITE_BACK))
}

/// Past the point where anything could be reported or undone.
#[cold]
fn fatal(what: &str) -> ! {
    error!("mm: fatal: {}", what);
    panic!("mm: {what}")
}
