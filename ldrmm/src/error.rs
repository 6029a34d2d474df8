// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Recoverable failures.
//!
//! Only conditions that can still be reported while boot services are alive
//! end up here. Ledger corruption and anything after ExitBootServices panics.

use uefi::Status;

use crate::paging::PagingMode;
use crate::transition::TransitionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmError {
    #[error("firmware {call} failed: {status:?}")]
    Firmware { call: &'static str, status: Status },
    #[error("memory map buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("out of pages for page tables")]
    OutOfFrames,
    #[error("virtual placement window exhausted")]
    VirtualWindowExhausted,
    #[error("paging mode {0:?} not supported by this CPU/build")]
    UnsupportedPagingMode(PagingMode),
    #[error("operation needs state {expected:?}, context is in {found:?}")]
    InvalidState {
        expected: TransitionState,
        found: TransitionState,
    },
    #[error("firmware memory map already imported")]
    AlreadyImported,
    #[error("descriptor storage holds {capacity} nodes, {needed} needed")]
    DescriptorStorageExhausted { capacity: usize, needed: usize },
}

impl MmError {
    pub const fn firmware(call: &'static str, status: Status) -> Self {
        Self::Firmware { call, status }
    }
}
