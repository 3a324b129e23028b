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

//! Notification suppression.
//!
//! Split rings suppress notifications with a flag word in each ring header,
//! or, once EVENT_IDX is negotiated, with an index appended to the tail of the
//! opposite ring. Packed rings use a pair of [`EventSuppression`] structures,
//! one written by each side.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::MemOps;

bitflags! {
    /// Packed ring event suppression mode, the low two bits of the flags word.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EventFlags: u16 {
        /// Every event
        const ENABLE = 0b00;
        /// No events
        const DISABLE = 0b01;
        /// Only the event for the descriptor in `off_wrap`
        const DESC = 0b10;
    }
}

bitflags! {
    /// Split avail ring flags, written by the driver.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AvailFlags: u16 {
        /// The driver does not want used buffer interrupts.
        const NO_INTERRUPT = 1;
    }
}

bitflags! {
    /// Split used ring flags, written by the device.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UsedFlags: u16 {
        /// The device does not want available buffer notifications.
        const NO_NOTIFY = 1;
    }
}

/// Split used ring element: `{u32 id; u32 len}`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct UsedElem {
    /// Head index of the completed chain.
    pub id: u32,
    /// Bytes written by the device.
    pub len: u32,
}

const _: () = assert!(core::mem::size_of::<UsedElem>() == 8);

impl UsedElem {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Packed ring event suppression area. The driver and the device each own
/// one and read the other's.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct EventSuppression {
    pub off_wrap: u16,
    pub flags: u16,
}

const _: () = {
    assert!(EventSuppression::SIZE == 4);
    assert!(EventSuppression::WRAP_OFFSET == 0);
    assert!(EventSuppression::FLAGS_OFFSET == 2);
};

const MODE_MASK: u16 = 0b11;
const OFF_MASK: u16 = 0x7FFF;
const WRAP_BIT: u16 = 0x8000;

impl EventSuppression {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();
    pub const WRAP_OFFSET: usize = core::mem::offset_of!(Self, off_wrap);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);

    pub fn new(off_wrap: u16, flags: EventFlags) -> Self {
        Self {
            off_wrap,
            flags: flags.bits(),
        }
    }

    /// Mode bits only. Reserved bits are ignored.
    pub fn flags(&self) -> EventFlags {
        EventFlags::from_bits_truncate(self.flags & MODE_MASK)
    }

    /// Replace the mode bits and keep whatever the reserved bits hold.
    pub fn set_flags(&mut self, flags: EventFlags) {
        self.flags = (self.flags & !MODE_MASK) | (flags.bits() & MODE_MASK);
    }

    pub fn desc_event_off(&self) -> u16 {
        unpack_off_wrap(self.off_wrap).0
    }

    pub fn desc_event_wrap(&self) -> bool {
        unpack_off_wrap(self.off_wrap).1
    }

    pub fn set_desc_event(&mut self, off: u16, wrap: bool) {
        self.off_wrap = pack_off_wrap(off, wrap);
    }

    /// Load the peer's area. `addr` must be the start of an event
    /// suppression area.
    pub fn read_acquire<M: MemOps>(mem: &M, addr: u64) -> Result<Self, M::Error> {
        let flags = mem.load_acquire(addr + Self::FLAGS_OFFSET as u64)?;
        let off_wrap = mem.load_acquire(addr + Self::WRAP_OFFSET as u64)?;
        Ok(Self { off_wrap, flags })
    }

    /// Store our area. The position goes out before the mode so a peer that
    /// sees DESC also sees the position it refers to.
    pub fn write_release<M: MemOps>(&self, mem: &M, addr: u64) -> Result<(), M::Error> {
        mem.store_release(addr + Self::WRAP_OFFSET as u64, self.off_wrap)?;
        mem.store_release(addr + Self::FLAGS_OFFSET as u64, self.flags)
    }
}

/// Encode a packed ring position as `off | wrap << 15`.
#[inline]
pub const fn pack_off_wrap(off: u16, wrap: bool) -> u16 {
    (off & OFF_MASK) | if wrap { WRAP_BIT } else { 0 }
}

/// Decode an `off | wrap << 15` pair.
#[inline]
pub const fn unpack_off_wrap(off_wrap: u16) -> (u16, bool) {
    (off_wrap & OFF_MASK, off_wrap & WRAP_BIT != 0)
}

/// Has the index `event_idx` been crossed when moving from `old` to `new`?
///
/// All arithmetic is modulo 2^16, so this keeps working after the free
/// running indices wrap.
#[inline(always)]
pub fn ring_need_event(event_idx: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event_idx).wrapping_sub(1) < new.wrapping_sub(old)
}

/// Packed ring notification decision for a batch of `added` descriptors
/// ending at ring position (`new`, `new_wrap`).
///
/// `old` is derived as `new - added` in 16 bit arithmetic so a batch that
/// crosses the end of the ring is still measured correctly.
#[inline]
pub fn should_notify(
    evt: EventSuppression,
    ring_len: u16,
    new: u16,
    new_wrap: bool,
    added: u16,
) -> bool {
    let flags = evt.flags();
    if flags == EventFlags::DISABLE {
        return false;
    }
    if flags != EventFlags::DESC {
        return true;
    }

    let mut event_idx = evt.desc_event_off();
    if evt.desc_event_wrap() != new_wrap {
        event_idx = event_idx.wrapping_sub(ring_len);
    }

    ring_need_event(event_idx, new, new.wrapping_sub(added))
}
