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

use bitflags::bitflags;

use super::VirtqError;

bitflags! {
    /// Negotiated device feature bits the ring cares about.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Features: u64 {
        /// Indirect descriptor tables.
        const INDIRECT_DESC = 1 << 28;
        /// used_event / avail_event suppression.
        const EVENT_IDX = 1 << 29;
        const VERSION_1 = 1 << 32;
        const ACCESS_PLATFORM = 1 << 33;
        /// Packed ring layout.
        const RING_PACKED = 1 << 34;
        const ORDER_PLATFORM = 1 << 36;
    }
}

impl Features {
    /// Keep only the transport bits of a negotiated feature word.
    pub fn from_negotiated(bits: u64) -> Self {
        let features = Self::from_bits_truncate(bits);
        if features.bits() != bits & Self::all().bits() {
            log::trace!("dropping unknown feature bits {:#x}", bits & !Self::all().bits());
        }
        features
    }
}

/// A driver-owned memory region, e.g. the backing store for indirect tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub len: usize,
}

/// The configuration needed to create a [`Virtqueue`](crate::Virtqueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    size: u16,
    /// Queue index, only used to tag log records
    index: u16,
    features: Features,
    /// Whether the caller wants used-buffer interrupts at all
    callbacks: bool,
    /// Longest chain placed in a single indirect table
    max_indirect: u16,
    indirect_region: Option<Region>,
}

impl QueueConfig {
    /// The default number of descriptors.
    pub const DEFAULT_SIZE: u16 = 256;
    /// The largest ring either encoding can describe.
    pub const MAX_SIZE: u16 = 32768;
    /// The default and maximum indirect table length, in descriptors.
    pub const DEFAULT_MAX_INDIRECT: u16 = 128;
    pub const MAX_MAX_INDIRECT: u16 = 1024;

    pub fn new(size: u16) -> Self {
        Self {
            size,
            index: 0,
            features: Features::empty(),
            callbacks: true,
            max_indirect: Self::DEFAULT_MAX_INDIRECT,
            indirect_region: None,
        }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_index(mut self, index: u16) -> Self {
        self.index = index;
        self
    }

    /// The queue is only polled; the device is asked not to interrupt.
    pub fn without_callbacks(mut self) -> Self {
        self.callbacks = false;
        self
    }

    /// Clamp the indirect table length to `[1, MAX_MAX_INDIRECT]`.
    pub fn with_max_indirect(mut self, max_indirect: u16) -> Self {
        self.max_indirect = max_indirect.clamp(1, Self::MAX_MAX_INDIRECT);
        self
    }

    /// Region indirect tables are carved from. Without one, chains always use
    /// direct descriptors.
    pub fn with_indirect_region(mut self, region: Region) -> Self {
        self.indirect_region = Some(region);
        self
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn callbacks(&self) -> bool {
        self.callbacks
    }

    pub fn max_indirect(&self) -> u16 {
        self.max_indirect
    }

    pub fn indirect_region(&self) -> Option<Region> {
        self.indirect_region
    }

    pub fn is_packed(&self) -> bool {
        self.features.contains(Features::RING_PACKED)
    }

    pub fn event_idx(&self) -> bool {
        self.features.contains(Features::EVENT_IDX)
    }

    /// Indirect tables are usable: negotiated and backed by a region.
    pub fn indirect(&self) -> bool {
        self.features.contains(Features::INDIRECT_DESC) && self.indirect_region.is_some()
    }

    pub fn validate(&self) -> Result<(), VirtqError> {
        if self.size == 0 {
            return Err(VirtqError::InvalidConfig("queue size is zero"));
        }
        if self.size > Self::MAX_SIZE {
            return Err(VirtqError::InvalidConfig("queue size exceeds 32768"));
        }
        if !self.is_packed() && !self.size.is_power_of_two() {
            return Err(VirtqError::InvalidConfig(
                "split queue size must be a power of two",
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SIZE)
    }
}
