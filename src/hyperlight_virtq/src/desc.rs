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

//! Descriptor wire formats.
//!
//! Both encodings describe a buffer in 16 bytes. A split descriptor links to
//! the next one by index and becomes visible through the avail ring. A packed
//! descriptor carries a buffer id and changes hands through its AVAIL and
//! USED bits.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::MemOps;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// Chain continues (split: at `next`, packed: in the next slot)
        const NEXT     = 1 << 0;
        /// Device writes the buffer
        const WRITE    = 1 << 1;
        /// Buffer holds a table of descriptors
        const INDIRECT = 1 << 2;
        const AVAIL    = 1 << 7;
        const USED     = 1 << 15;
    }
}

impl DescFlags {
    const OWNERSHIP: Self = Self::AVAIL.union(Self::USED);

    /// AVAIL/USED pattern a driver writes in the lap with wrap counter `wrap`.
    pub const fn driver_owned(wrap: bool) -> Self {
        if wrap { Self::AVAIL } else { Self::USED }
    }

    /// AVAIL/USED pattern a device writes in the lap with wrap counter `wrap`.
    pub const fn device_owned(wrap: bool) -> Self {
        if wrap { Self::OWNERSHIP } else { Self::empty() }
    }

    fn with_ownership(self, bits: Self) -> Self {
        self.difference(Self::OWNERSHIP).union(bits)
    }

    fn ownership(self) -> Self {
        self.intersection(Self::OWNERSHIP)
    }
}

/// Split ring descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct SplitDescriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl SplitDescriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(addr: u64, len: u32, flags: DescFlags, next: u16) -> Self {
        Self {
            addr,
            len,
            flags: flags.bits(),
            next,
        }
    }

    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    pub fn is_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    pub fn is_writeable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    pub fn is_indirect(&self) -> bool {
        self.flags().contains(DescFlags::INDIRECT)
    }
}

/// Packed ring descriptor. Every slot of a chain carries the chain's id.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub addr: u64,
    /// Buffer length, or bytes written once the device marks it used
    pub len: u32,
    pub id: u16,
    pub flags: u16,
}

const _: () = {
    assert!(SplitDescriptor::SIZE == 16);
    assert!(core::mem::offset_of!(SplitDescriptor, flags) == 12);
    assert!(core::mem::offset_of!(SplitDescriptor, next) == 14);
    assert!(Descriptor::SIZE == 16);
    assert!(Descriptor::LEN_OFFSET == 8);
    assert!(Descriptor::ID_OFFSET == 12);
    assert!(Descriptor::FLAGS_OFFSET == 14);
};

impl Descriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const ID_OFFSET: usize = core::mem::offset_of!(Self, id);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);

    pub fn new(addr: u64, len: u32, id: u16, flags: DescFlags) -> Self {
        Self {
            addr,
            len,
            id,
            flags: flags.bits(),
        }
    }

    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    /// Offered by the driver in lap `wrap` and not yet returned.
    pub fn is_avail(&self, wrap: bool) -> bool {
        self.flags().ownership() == DescFlags::driver_owned(wrap)
    }

    /// Returned by the device in lap `wrap`.
    pub fn is_used(&self, wrap: bool) -> bool {
        self.flags().ownership() == DescFlags::device_owned(wrap)
    }

    pub fn is_writeable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    pub fn is_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    pub fn is_indirect(&self) -> bool {
        self.flags().contains(DescFlags::INDIRECT)
    }

    pub fn mark_avail(&mut self, wrap: bool) {
        self.flags = self
            .flags()
            .with_ownership(DescFlags::driver_owned(wrap))
            .bits();
    }

    pub fn mark_used(&mut self, wrap: bool) {
        self.flags = self
            .flags()
            .with_ownership(DescFlags::device_owned(wrap))
            .bits();
    }

    /// Take a slot from the peer.
    ///
    /// Only the flags word is read before `owned` accepts the slot; the body
    /// is read after that acquire load and never for a slot still owned by
    /// the peer.
    pub fn read_acquire<M: MemOps>(
        mem: &M,
        addr: u64,
        owned: impl FnOnce(&Self) -> bool,
    ) -> Result<Option<Self>, M::Error> {
        let flags = mem.load_acquire(addr + Self::FLAGS_OFFSET as u64)?;
        let mut desc = Self {
            flags,
            ..Self::zeroed()
        };
        if !owned(&desc) {
            return Ok(None);
        }

        desc.addr = mem.read_val(addr + Self::ADDR_OFFSET as u64)?;
        desc.len = mem.read_val(addr + Self::LEN_OFFSET as u64)?;
        desc.id = mem.read_val(addr + Self::ID_OFFSET as u64)?;
        Ok(Some(desc))
    }

    /// Hand a slot to the peer: body first, then the flags word with a
    /// release store.
    pub fn write_release<M: MemOps>(&self, mem: &M, addr: u64) -> Result<(), M::Error> {
        mem.write_val(addr + Self::ADDR_OFFSET as u64, self.addr)?;
        mem.write_val(addr + Self::LEN_OFFSET as u64, self.len)?;
        mem.write_val(addr + Self::ID_OFFSET as u64, self.id)?;
        mem.store_release(addr + Self::FLAGS_OFFSET as u64, self.flags)
    }
}

/// Address arithmetic for a ring of `size` 16 byte descriptors.
#[derive(Debug, Clone, Copy)]
pub struct DescTable {
    base: u64,
    size: u16,
}

impl DescTable {
    pub fn new(base: u64, size: u16) -> Self {
        Self { base, size }
    }

    /// Address of slot `idx`, None past the end of the ring.
    pub fn addr(&self, idx: u16) -> Option<u64> {
        (idx < self.size).then(|| self.base + idx as u64 * Descriptor::SIZE as u64)
    }

    pub fn size(&self) -> u16 {
        self.size
    }
}
