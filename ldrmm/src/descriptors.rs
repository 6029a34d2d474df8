// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Kernel memory descriptor list (`MEMORY_ALLOCATION_DESCRIPTOR`).
//!
//! Built in three passes: one descriptor per ledger mapping, merge of
//! contiguous same-type runs, then translation of every link to its virtual
//! form. The nodes live in a single storage block whose slot 0 holds the list
//! head.
//!
//! ```text
//!          Flink  Blink  Type   BasePage PageCount  size
//! 32-bit   u32@0  u32@4  u32@8  u32@12   u32@16     20
//! 64-bit   u64@0  u64@8  u32@16 u64@24   u64@32     40
//! ```

use alloc::vec::Vec;
use log::{debug, error};

use crate::firmware::PhysMemory;
use crate::ledger::{Ledger, Mapping};
use crate::memtype::MemoryType;
use crate::{MmError, PAGE_SHIFT};

/// Upper bound for [`walk`], a corrupted list must not spin forever.
const WALK_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub memory_type: MemoryType,
    pub base_page: u64,
    pub page_count: u64,
}

impl Descriptor {
    const fn end_page(&self) -> u64 {
        self.base_page + self.page_count
    }
}

/* --------------------------------- Passes ---------------------------------- */

/// Pass 1: one descriptor per mapping, in physical order. An exact alias is
/// reported once, under the type of its first mapping.
pub fn collect(ledger: &Ledger) -> Vec<Descriptor> {
    let mut out: Vec<Descriptor> = Vec::with_capacity(ledger.len());
    let mut prev: Option<&Mapping> = None;
    for m in ledger.iter() {
        if prev.is_some_and(|p| p.same_range(m)) {
            continue;
        }
        prev = Some(m);
        out.push(Descriptor {
            memory_type: m.memory_type,
            base_page: m.physical_base >> PAGE_SHIFT,
            page_count: m.page_count,
        });
    }
    out
}

/// Pass 2: fold physically contiguous runs of the same type.
pub fn merge(descs: &mut Vec<Descriptor>) {
    descs.dedup_by(|next, prev| {
        if prev.memory_type == next.memory_type && prev.end_page() == next.base_page {
            prev.page_count += next.page_count;
            true
        } else {
            false
        }
    });
}

/* ------------------------------- Binary list ------------------------------- */

/// Field offsets for a pointer width of 4 or 8 bytes.
#[derive(Debug, Clone, Copy)]
struct NodeLayout {
    width: usize,
}

impl NodeLayout {
    const fn new(width: usize) -> Self {
        assert!(width == 4 || width == 8);
        Self { width }
    }
    const fn flink(self) -> usize {
        0
    }
    const fn blink(self) -> usize {
        self.width
    }
    const fn memory_type(self) -> usize {
        2 * self.width
    }
    const fn base_page(self) -> usize {
        3 * self.width
    }
    const fn page_count(self) -> usize {
        4 * self.width
    }
    const fn size(self) -> usize {
        5 * self.width
    }

    unsafe fn read<M: PhysMemory + ?Sized>(self, mem: &M, at: u64) -> u64 {
        let p = mem.phys_ptr(at);
        unsafe {
            match self.width {
                4 => core::ptr::read_unaligned(p as *const u32) as u64,
                _ => core::ptr::read_unaligned(p as *const u64),
            }
        }
    }

    unsafe fn write<M: PhysMemory + ?Sized>(self, mem: &M, at: u64, value: u64) {
        let p = mem.phys_ptr(at);
        unsafe {
            match self.width {
                4 => core::ptr::write_unaligned(p as *mut u32, value as u32),
                _ => core::ptr::write_unaligned(p as *mut u64, value),
            }
        }
    }
}

/// Bytes one node takes for a kernel with `width`-byte pointers.
pub const fn node_size(width: usize) -> usize {
    NodeLayout::new(width).size()
}

/// A written descriptor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorList {
    width: usize,
    head: u64,
    head_virtual: u64,
    count: usize,
    virtualized: bool,
}

impl DescriptorList {
    /// Write `descs` into `storage` (physical, `capacity` node slots) with
    /// physical links. `storage_virtual` is where the kernel will see slot 0.
    pub fn write<M: PhysMemory + ?Sized>(
        mem: &M,
        width: usize,
        storage: u64,
        storage_virtual: u64,
        capacity: usize,
        descs: &[Descriptor],
    ) -> Result<Self, MmError> {
        let layout = NodeLayout::new(width);
        let needed = descs.len() + 1;
        if needed > capacity {
            return Err(MmError::DescriptorStorageExhausted { capacity, needed });
        }
        let node = |i: usize| storage + (i * layout.size()) as u64;
        let n = descs.len();
        unsafe {
            for i in 0..=n {
                let flink = if i == n { node(0) } else { node(i + 1) };
                let blink = if i == 0 { node(n) } else { node(i - 1) };
                layout.write(mem, node(i) + layout.flink() as u64, flink);
                layout.write(mem, node(i) + layout.blink() as u64, blink);
            }
            for (i, d) in descs.iter().enumerate() {
                let at = node(i + 1);
                core::ptr::write_unaligned(
                    mem.phys_ptr(at + layout.memory_type() as u64) as *mut u32,
                    d.memory_type as u32,
                );
                layout.write(mem, at + layout.base_page() as u64, d.base_page);
                layout.write(mem, at + layout.page_count() as u64, d.page_count);
            }
        }
        debug!("descriptors: {} nodes at {:#x}", n, storage);
        Ok(Self {
            width,
            head: storage,
            head_virtual: storage_virtual,
            count: n,
            virtualized: false,
        })
    }

    /// Pass 3: rewrite every link through `resolve`. Links to the head are
    /// rewritten directly since nothing in the ledger describes the head on
    /// its own. A link `resolve` cannot translate halts.
    pub fn virtualize<M: PhysMemory + ?Sized>(
        &mut self,
        mem: &M,
        resolve: impl Fn(u64) -> Option<u64>,
    ) {
        assert!(!self.virtualized, "descriptor list translated twice");
        let layout = NodeLayout::new(self.width);
        for i in 0..=self.count {
            let at = self.head + (i * layout.size()) as u64;
            for field in [layout.flink(), layout.blink()] {
                let link = unsafe { layout.read(mem, at + field as u64) };
                let va = if link == self.head {
                    self.head_virtual
                } else {
                    resolve(link).unwrap_or_else(|| {
                        error!("descriptors: node {:#x} has no virtual alias", link);
                        panic!("descriptors: unresolvable link {link:#x}")
                    })
                };
                unsafe { layout.write(mem, at + field as u64, va) };
            }
        }
        self.virtualized = true;
    }

    /// Physical address of the head.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Address of the head as the kernel sees it.
    pub fn head_virtual(&self) -> u64 {
        self.head_virtual
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_virtualized(&self) -> bool {
        self.virtualized
    }

    /// Walk the list the way its links are currently written.
    pub fn read_back<M: PhysMemory + ?Sized>(
        &self,
        mem: &M,
        translate: impl Fn(u64) -> Option<u64>,
    ) -> Option<Vec<Descriptor>> {
        if self.virtualized {
            walk(mem, self.width, self.head_virtual, translate)
        } else {
            walk(mem, self.width, self.head, Some)
        }
    }
}

/// Follow Flink from `head` until it comes back. `head` and every link are
/// in whatever address space the list currently uses; `translate` turns them
/// into physical addresses. `None` if a link does not translate.
pub fn walk<M: PhysMemory + ?Sized>(
    mem: &M,
    width: usize,
    head: u64,
    translate: impl Fn(u64) -> Option<u64>,
) -> Option<Vec<Descriptor>> {
    let layout = NodeLayout::new(width);
    let mut out = Vec::new();
    let mut link = unsafe { layout.read(mem, translate(head)? + layout.flink() as u64) };
    while link != head {
        assert!(out.len() < WALK_LIMIT, "descriptors: list does not close");
        let at = translate(link)?;
        let raw_type = unsafe {
            core::ptr::read_unaligned(mem.phys_ptr(at + layout.memory_type() as u64) as *const u32)
        };
        out.push(Descriptor {
            memory_type: MemoryType::from_raw(raw_type)?,
            base_page: unsafe { layout.read(mem, at + layout.base_page() as u64) },
            page_count: unsafe { layout.read(mem, at + layout.page_count() as u64) },
        });
        link = unsafe { layout.read(mem, at + layout.flink() as u64) };
    }
    Some(out)
}
