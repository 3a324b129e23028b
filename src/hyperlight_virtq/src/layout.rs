/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Ring memory layouts.
//!
//! # Split ring
//!
//! ```text
//! base ─> descriptor table   num × 16 bytes            (align 16)
//!         avail ring         flags, idx, ring[num], used_event   (align 2)
//!         used ring          flags, idx, {id,len}[num], avail_event (align 64)
//! ```
//!
//! # Packed ring
//!
//! ```text
//! base ─> descriptor table   num × 16 bytes            (align 16)
//!         driver event       off_wrap, flags           (align 4)
//!         device event       off_wrap, flags           (align 4)
//! ```
//!
//! The split event-index tail fields are always reserved so the same region
//! works whether or not EVENT_IDX is negotiated.

use core::num::NonZeroU16;

use super::{Descriptor, EventSuppression, QueueConfig, UsedElem, VirtqError};

#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Layout of a split virtqueue in shared memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitLayout {
    /// Descriptor table base.
    pub desc_table_addr: u64,
    /// Number of descriptors (power of two).
    pub size: u16,
    /// Avail ring base (driver area).
    pub avail_addr: u64,
    /// Used ring base (device area).
    pub used_addr: u64,
}

impl SplitLayout {
    /// Alignment of the used ring, keeps it off the driver-written cache lines.
    pub const USED_ALIGN: usize = 64;

    const fn avail_offset(num: usize) -> usize {
        num * Descriptor::SIZE
    }

    const fn used_offset(num: usize) -> usize {
        // flags + idx + ring[num] + used_event
        align_up(Self::avail_offset(num) + 2 * (3 + num), Self::USED_ALIGN)
    }

    /// Create a SplitLayout from a base address and number of descriptors.
    ///
    /// # Safety
    /// - `base` must be valid for `SplitLayout::query_size(num_descs)` bytes.
    /// - The region stays mapped for as long as a queue uses it.
    pub const unsafe fn from_base(base: u64, num_descs: NonZeroU16) -> Result<Self, VirtqError> {
        if !base.is_multiple_of(Self::USED_ALIGN as u64) {
            return Err(VirtqError::InvalidLayout);
        }
        if !num_descs.get().is_power_of_two() {
            return Err(VirtqError::InvalidLayout);
        }

        let num = num_descs.get() as usize;
        Ok(Self {
            desc_table_addr: base,
            size: num_descs.get(),
            avail_addr: base + Self::avail_offset(num) as u64,
            used_addr: base + Self::used_offset(num) as u64,
        })
    }

    /// Bytes needed for a split ring with `num_descs` descriptors.
    pub const fn query_size(num_descs: usize) -> usize {
        // flags + idx + ring[num] + avail_event
        Self::used_offset(num_descs) + 2 * 3 + UsedElem::SIZE * num_descs
    }

    pub fn avail_flags_addr(&self) -> u64 {
        self.avail_addr
    }

    pub fn avail_idx_addr(&self) -> u64 {
        self.avail_addr + 2
    }

    pub fn avail_ring_addr(&self, slot: u16) -> u64 {
        self.avail_addr + 4 + 2 * slot as u64
    }

    /// `used_event`, written by the driver at the tail of the avail ring.
    pub fn used_event_addr(&self) -> u64 {
        self.avail_addr + 4 + 2 * self.size as u64
    }

    pub fn used_flags_addr(&self) -> u64 {
        self.used_addr
    }

    pub fn used_idx_addr(&self) -> u64 {
        self.used_addr + 2
    }

    pub fn used_elem_addr(&self, slot: u16) -> u64 {
        self.used_addr + 4 + (UsedElem::SIZE as u64) * slot as u64
    }

    /// `avail_event`, written by the device at the tail of the used ring.
    pub fn avail_event_addr(&self) -> u64 {
        self.used_addr + 4 + (UsedElem::SIZE as u64) * self.size as u64
    }

    pub fn total_size(&self) -> usize {
        Self::query_size(self.size as usize)
    }
}

/// Addresses of the three areas of a packed ring.
///
/// Use [`from_base`](Self::from_base) to compute the layout from a base
/// address, or [`query_size`](Self::query_size) to determine memory
/// requirements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedLayout {
    /// Start of the descriptor ring.
    pub desc_table_addr: u64,
    /// Number of descriptors, any value up to 32768.
    pub desc_table_len: u16,
    /// Event area the driver writes.
    pub drv_evt_addr: u64,
    /// Event area the device writes.
    pub dev_evt_addr: u64,
}

impl PackedLayout {
    /// Create a PackedLayout from a base address and number of descriptors.
    ///
    /// # Safety
    /// - `base` must be valid for `PackedLayout::query_size(num_descs)` bytes.
    /// - `base` must be aligned to `Descriptor::ALIGN`.
    /// - The region stays mapped for as long as a queue uses it.
    pub const unsafe fn from_base(base: u64, num_descs: NonZeroU16) -> Result<Self, VirtqError> {
        if !base.is_multiple_of(Descriptor::ALIGN as u64) {
            return Err(VirtqError::InvalidLayout);
        }

        let desc_size = num_descs.get() as usize * Descriptor::SIZE;
        let event_size = EventSuppression::SIZE;
        let event_align = EventSuppression::ALIGN;

        let drv_evt_offset = align_up(desc_size, event_align);
        let dev_evt_offset = align_up(drv_evt_offset + event_size, event_align);

        Ok(Self {
            desc_table_addr: base,
            desc_table_len: num_descs.get(),
            drv_evt_addr: base + drv_evt_offset as u64,
            dev_evt_addr: base + dev_evt_offset as u64,
        })
    }

    /// Bytes a packed ring of `num_descs` descriptors occupies, padding
    /// included.
    pub const fn query_size(num_descs: usize) -> usize {
        let desc_size = num_descs * Descriptor::SIZE;
        let event_size = EventSuppression::SIZE;
        let event_align = EventSuppression::ALIGN;

        // descriptors at offset 0, each event area aligned after them
        let drv_evt_offset = align_up(desc_size, event_align);
        let dev_evt_offset = align_up(drv_evt_offset + event_size, event_align);

        dev_evt_offset + event_size
    }

    pub fn total_size(&self) -> usize {
        Self::query_size(self.desc_table_len as usize)
    }
}

/// Ring layout for either encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingLayout {
    Split(SplitLayout),
    Packed(PackedLayout),
}

impl RingLayout {
    /// Compute the layout selected by `config` at `base`.
    ///
    /// # Safety
    /// - `base` must be valid for `RingLayout::query_size(config)` bytes.
    /// - Memory must remain valid for the lifetime of the queue.
    pub unsafe fn from_base(base: u64, config: &QueueConfig) -> Result<Self, VirtqError> {
        config.validate()?;
        let size = NonZeroU16::new(config.size()).ok_or(VirtqError::InvalidLayout)?;

        // SAFETY: forwarded to the caller
        unsafe {
            if config.is_packed() {
                PackedLayout::from_base(base, size).map(Self::Packed)
            } else {
                SplitLayout::from_base(base, size).map(Self::Split)
            }
        }
    }

    /// Bytes of ring memory the queue described by `config` needs.
    pub fn query_size(config: &QueueConfig) -> usize {
        if config.is_packed() {
            PackedLayout::query_size(config.size() as usize)
        } else {
            SplitLayout::query_size(config.size() as usize)
        }
    }

    pub fn base(&self) -> u64 {
        match self {
            Self::Split(l) => l.desc_table_addr,
            Self::Packed(l) => l.desc_table_addr,
        }
    }

    pub fn size(&self) -> u16 {
        match self {
            Self::Split(l) => l.size,
            Self::Packed(l) => l.desc_table_len,
        }
    }

    pub fn total_size(&self) -> usize {
        match self {
            Self::Split(l) => l.total_size(),
            Self::Packed(l) => l.total_size(),
        }
    }

    pub fn is_packed(&self) -> bool {
        matches!(self, Self::Packed(_))
    }
}

const _: () = {
    const fn verify_packed(num_descs: usize) {
        let base = 0x1000u64;

        let Some(n) = NonZeroU16::new(num_descs as u16) else {
            panic!("zero ring");
        };

        // Safety: base is aligned and nothing is accessed, only the
        // arithmetic is under test
        let layout = match unsafe { PackedLayout::from_base(base, n) } {
            Ok(l) => l,
            Err(_) => panic!("packed from_base failed"),
        };

        let expected_size = PackedLayout::query_size(num_descs);

        assert!(layout.desc_table_addr == base);
        assert!(layout.desc_table_len as usize == num_descs);
        assert!(
            layout
                .drv_evt_addr
                .is_multiple_of(EventSuppression::ALIGN as u64)
        );
        assert!(
            layout
                .dev_evt_addr
                .is_multiple_of(EventSuppression::ALIGN as u64)
        );

        // event areas start past the last descriptor
        let desc_end = base + (num_descs * Descriptor::SIZE) as u64;
        assert!(layout.drv_evt_addr >= desc_end);
        assert!(layout.dev_evt_addr >= layout.drv_evt_addr + EventSuppression::SIZE as u64);

        // query_size reaches the end of the device area
        let layout_end = layout.dev_evt_addr + EventSuppression::SIZE as u64;
        assert!(base + expected_size as u64 == layout_end);
    }

    const fn verify_split(num_descs: usize) {
        let base = 0x1000u64;

        let Some(n) = NonZeroU16::new(num_descs as u16) else {
            panic!("zero ring");
        };

        // Safety: base is aligned and nothing is accessed
        let layout = match unsafe { SplitLayout::from_base(base, n) } {
            Ok(l) => l,
            Err(_) => panic!("split from_base failed"),
        };

        let desc_end = base + (num_descs * Descriptor::SIZE) as u64;
        assert!(layout.avail_addr == desc_end);

        // avail ring plus used_event ends before the used ring
        let avail_end = layout.avail_addr + 2 * (3 + num_descs) as u64;
        assert!(layout.used_addr >= avail_end);
        assert!(
            layout
                .used_addr
                .is_multiple_of(SplitLayout::USED_ALIGN as u64)
        );

        // used ring plus avail_event ends exactly at query_size
        let used_end = layout.used_addr + 6 + (UsedElem::SIZE * num_descs) as u64;
        assert!(base + SplitLayout::query_size(num_descs) as u64 == used_end);
    }

    verify_packed(1);
    verify_packed(3);
    verify_split(1);

    let mut n = 2;
    while n <= 1024 {
        verify_packed(n);
        verify_split(n);
        n *= 2;
    }
};
