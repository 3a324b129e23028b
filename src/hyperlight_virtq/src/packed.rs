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

//! Packed Virtqueue Engine (driver side)
//!
//! Packed ring engine.
//! Packed virtqueues use a single descriptor ring where both driver and device
//! write to the same ring, using wrap counters and flags to coordinate ownership.
//!
//! ```text
//!   slot:   0        1        2        3
//!         ┌────────┬────────┬────────┬────────┐
//!         │ used W │ avail W│ avail W│  free  │
//!         └────────┴────────┴────────┴────────┘
//!              ^        ^                  ^
//!           (device  used cursor        avail cursor
//!            wrote)
//! ```
//!
//! A chain of `n` descriptors occupies `n` consecutive slots and is published
//! by writing its head descriptor last. The device reports completion by
//! writing a single used descriptor carrying the chain's buffer id; the driver
//! then skips as many slots as the chain occupied.
//!
//! Buffer ids come from a [`FreeList`] independent of slot positions, so the
//! device may complete chains in any order.

use alloc::vec;
use alloc::vec::Vec;

use bytemuck::Zeroable;

use super::dma::MappedChain;
use super::indirect::IndirectTable;
use super::split::Used;
use super::{
    DescFlags, DescTable, Descriptor, EventFlags, EventSuppression, FreeList, MemOps,
    PackedLayout, Violation, VirtqError, pack_off_wrap, should_notify, unpack_off_wrap,
};

/// Position in a packed ring: slot index plus the lap's wrap counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingCursor {
    head: u16,
    size: u16,
    wrap: bool,
}

impl RingCursor {
    pub(crate) fn new(size: u16) -> Self {
        Self {
            head: 0,
            size,
            wrap: true,
        }
    }

    /// Step one slot. Passing the last slot flips the wrap counter.
    #[inline]
    pub(crate) fn advance(&mut self) {
        self.advance_by(1);
    }

    /// Advance by n positions, at most one lap
    #[inline]
    pub(crate) fn advance_by(&mut self, n: u16) {
        debug_assert!(n <= self.size);
        let next = self.head as u32 + n as u32;
        if next >= self.size as u32 {
            self.head = (next - self.size as u32) as u16;
            self.wrap = !self.wrap;
        } else {
            self.head = next as u16;
        }
    }

    /// Slot index
    #[inline]
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Wrap counter of the current lap
    #[inline]
    pub fn wrap(&self) -> bool {
        self.wrap
    }

    /// Position encoded as `head | wrap << 15`.
    #[inline]
    pub fn off_wrap(&self) -> u16 {
        pack_off_wrap(self.head, self.wrap)
    }
}

#[derive(Debug)]
pub struct PackedRing<M> {
    /// Memory accessor
    mem: M,
    layout: PackedLayout,
    /// Descriptor ring
    desc_table: DescTable,
    /// Where the next chain is written
    avail_cursor: RingCursor,
    /// Where the next completion is expected
    used_cursor: RingCursor,
    /// Buffer ids, one per slot a chain occupies; the head id names the chain
    ids: FreeList,
    /// Bytes the device may write, per head id
    writable: Vec<u64>,
    /// Last mode we wrote to the driver event area
    event_flags_shadow: EventFlags,
    num_added: u16,
    event_idx: bool,
}

impl<M: MemOps> PackedRing<M> {
    /// Take over a zeroed packed ring. Both wrap counters start at 1.
    pub fn new(layout: PackedLayout, mem: M, event_idx: bool, callbacks: bool) -> Result<Self, VirtqError> {
        let size = layout.desc_table_len;
        let desc_table = DescTable::new(layout.desc_table_addr, size);
        let cursor = RingCursor::new(size);

        let event_flags_shadow = if callbacks {
            EventFlags::ENABLE
        } else {
            EventFlags::DISABLE
        };

        let ring = Self {
            mem,
            layout,
            desc_table,
            avail_cursor: cursor,
            used_cursor: cursor,
            ids: FreeList::new(size),
            writable: vec![0; size as usize],
            event_flags_shadow,
            num_added: 0,
            event_idx,
        };
        ring.write_driver_flags()?;
        Ok(ring)
    }

    /// Write a chain into consecutive slots and publish its head last.
    ///
    /// With `indirect` the chain takes a single slot pointing at the table.
    /// Ring state is untouched if any write fails.
    pub fn add(
        &mut self,
        chain: &MappedChain,
        indirect: Option<&IndirectTable>,
    ) -> Result<u16, VirtqError> {
        let descs = if indirect.is_some() { 1 } else { chain.len() as u16 };
        let id = self.ids.allocate_chain(descs)?;

        let next = match self.publish(id, chain, indirect) {
            Ok(next) => next,
            Err(e) => {
                self.ids.release_chain(id);
                return Err(e);
            }
        };

        self.avail_cursor = next;
        self.writable[id as usize] = chain.writable_len();
        self.num_added = self.num_added.wrapping_add(descs);
        Ok(id)
    }

    fn publish(
        &self,
        id: u16,
        chain: &MappedChain,
        indirect: Option<&IndirectTable>,
    ) -> Result<RingCursor, VirtqError> {
        let head_pos = self.avail_cursor;
        let mut pos = head_pos;
        pos.advance();

        let head_desc = match indirect {
            Some(table) => Descriptor::new(table.bus_addr, table.len, id, DescFlags::INDIRECT),
            None => {
                let n = chain.len();
                // tail slots first, the head makes the chain visible
                for (i, seg) in chain.segs.iter().enumerate().skip(1) {
                    let mut flags = DescFlags::empty();
                    flags.set(DescFlags::NEXT, i + 1 < n);
                    flags.set(DescFlags::WRITE, seg.writable);

                    let mut desc = Descriptor::new(seg.bus_addr, seg.len, id, flags);
                    desc.mark_avail(pos.wrap());

                    let addr = self.desc_addr(pos.head())?;
                    self.mem
                        .write_val(addr, desc)
                        .map_err(|_| VirtqError::MemoryError)?;
                    pos.advance();
                }

                let head = chain.segs.first().ok_or(VirtqError::EmptyChain)?;
                let mut flags = DescFlags::empty();
                flags.set(DescFlags::NEXT, n > 1);
                flags.set(DescFlags::WRITE, head.writable);
                Descriptor::new(head.bus_addr, head.len, id, flags)
            }
        };

        let mut head_desc = head_desc;
        head_desc.mark_avail(head_pos.wrap());

        // Release publish
        let addr = self.desc_addr(head_pos.head())?;
        head_desc
            .write_release(&self.mem, addr)
            .map_err(|_| VirtqError::MemoryError)?;

        Ok(pos)
    }

    fn desc_addr(&self, idx: u16) -> Result<u64, VirtqError> {
        self.desc_table
            .addr(idx)
            .ok_or(VirtqError::InvalidLayout)
    }

    /// Does the device want a notification for everything added since the
    /// last call?
    pub fn kick_prepare(&mut self) -> Result<bool, VirtqError> {
        // New flags must be visible before reading the device event
        self.mem.mb();

        let added = self.num_added;
        self.num_added = 0;

        let evt = EventSuppression::read_acquire(&self.mem, self.layout.dev_evt_addr)
            .map_err(|_| VirtqError::MemoryError)?;

        Ok(should_notify(
            evt,
            self.layout.desc_table_len,
            self.avail_cursor.head(),
            self.avail_cursor.wrap(),
            added,
        ))
    }

    fn is_used_at(&self, idx: u16, wrap: bool) -> Result<bool, VirtqError> {
        let addr = self.desc_addr(idx)?;
        let flags = self
            .mem
            .load_acquire(addr + Descriptor::FLAGS_OFFSET as u64)
            .map_err(|_| VirtqError::MemoryError)?;

        let probe = Descriptor {
            flags,
            ..Descriptor::zeroed()
        };
        Ok(probe.is_used(wrap))
    }

    pub fn more_used(&self) -> Result<bool, VirtqError> {
        self.is_used_at(self.used_cursor.head(), self.used_cursor.wrap())
    }

    /// Take the next completion off the ring.
    ///
    /// The descriptor is validated before anything is released; a violation
    /// leaves driver state as it was.
    pub fn pop_used(&mut self) -> Result<Option<Used>, VirtqError> {
        let wrap = self.used_cursor.wrap();
        let addr = self.desc_addr(self.used_cursor.head())?;

        // flags first, body only once the slot is ours
        let Some(desc) = Descriptor::read_acquire(&self.mem, addr, |d| d.is_used(wrap))
            .map_err(|_| VirtqError::MemoryError)?
        else {
            return Ok(None);
        };

        let size = self.layout.desc_table_len;
        let id = desc.id;
        if id >= size {
            return Err(Violation::IdOutOfRange {
                id: id as u32,
                size,
            }
            .into());
        }
        if !self.ids.is_head(id) {
            return Err(Violation::NotAHead { id }.into());
        }
        let capacity = self.writable[id as usize];
        if desc.len as u64 > capacity {
            return Err(Violation::UsedLenTooLarge {
                id,
                len: desc.len,
                capacity,
            }
            .into());
        }

        let slots = self.ids.release_chain(id).unwrap_or(0);
        self.writable[id as usize] = 0;
        self.used_cursor.advance_by(slots);

        // Ask for an interrupt at the next used slot
        if self.event_flags_shadow == EventFlags::DESC {
            self.write_driver_off_wrap(self.used_cursor.off_wrap())?;
            self.mem.mb();
        }

        Ok(Some(Used { id, len: desc.len }))
    }

    fn write_driver_off_wrap(&self, off_wrap: u16) -> Result<(), VirtqError> {
        self.mem
            .store_release(
                self.layout.drv_evt_addr + EventSuppression::WRAP_OFFSET as u64,
                off_wrap,
            )
            .map_err(|_| VirtqError::MemoryError)
    }

    fn write_driver_flags(&self) -> Result<(), VirtqError> {
        self.mem
            .store_release(
                self.layout.drv_evt_addr + EventSuppression::FLAGS_OFFSET as u64,
                self.event_flags_shadow.bits(),
            )
            .map_err(|_| VirtqError::MemoryError)
    }

    pub fn disable_cb(&mut self) -> Result<(), VirtqError> {
        if self.event_flags_shadow != EventFlags::DISABLE {
            self.event_flags_shadow = EventFlags::DISABLE;
            self.write_driver_flags()?;
        }
        Ok(())
    }

    fn rearm_flags(&mut self) -> Result<(), VirtqError> {
        if self.event_flags_shadow == EventFlags::DISABLE {
            self.event_flags_shadow = if self.event_idx {
                EventFlags::DESC
            } else {
                EventFlags::ENABLE
            };
            self.write_driver_flags()?;
        }
        Ok(())
    }

    /// Re-arm interrupts at the next used slot; returns that position as
    /// `off | wrap << 15`.
    pub fn enable_cb_prepare(&mut self) -> Result<u16, VirtqError> {
        let off_wrap = self.used_cursor.off_wrap();
        // offset and wrap are published before the flags that make them live
        if self.event_idx {
            self.write_driver_off_wrap(off_wrap)?;
        }
        self.rearm_flags()?;
        Ok(off_wrap)
    }

    /// Has the device used the slot recorded by `enable_cb_prepare`?
    pub fn poll(&self, off_wrap: u16) -> Result<bool, VirtqError> {
        self.mem.mb();
        let (off, wrap) = unpack_off_wrap(off_wrap);
        self.is_used_at(off, wrap)
    }

    /// Re-arm interrupts once roughly three quarters of the outstanding
    /// descriptors are used. Returns false if the next one is already used.
    pub fn enable_cb_delayed(&mut self) -> Result<bool, VirtqError> {
        if self.event_idx {
            let size = self.layout.desc_table_len;
            let bufs = ((size - self.ids.num_free()) as u32 * 3 / 4) as u16;
            let mut target = self.used_cursor;
            target.advance_by(bufs);
            self.write_driver_off_wrap(target.off_wrap())?;
        }
        self.rearm_flags()?;

        // Suppression update must be visible before re-checking the ring
        self.mem.mb();
        Ok(!self.more_used()?)
    }

    /// Reclaim one outstanding chain without the device's help. Device
    /// memory is never touched.
    pub fn detach_unused(&mut self) -> Option<u16> {
        let id = self.ids.first_head(0)?;
        self.ids.release_chain(id);
        self.writable[id as usize] = 0;
        Some(id)
    }

    pub fn num_free(&self) -> u16 {
        self.ids.num_free()
    }

    pub fn num_added(&self) -> u16 {
        self.num_added
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn layout(&self) -> &PackedLayout {
        &self.layout
    }

    pub fn avail_cursor(&self) -> RingCursor {
        self.avail_cursor
    }

    pub fn used_cursor(&self) -> RingCursor {
        self.used_cursor
    }

    #[cfg(test)]
    pub(crate) fn free_list(&self) -> &FreeList {
        &self.ids
    }
}
