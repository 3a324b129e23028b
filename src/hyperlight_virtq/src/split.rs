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

//! Split virtqueue engine (driver side).
//!
//! The driver fills descriptors, writes the chain head into the next avail
//! ring entry and then publishes the entry by storing the avail index with
//! release semantics. The device answers through the used ring and publishes
//! its own index the same way.
//!
//! ```text
//!   avail_idx_shadow ──┐          used.idx (device) ──┐
//!                      v                               v
//!   avail.ring  [h0][h1][h2][  ]    used.ring  [e0][e1][  ][  ]
//!                ^                               ^
//!          published to device            last_used_idx
//! ```
//!
//! Free-running 16 bit indices are masked with `size - 1`, which is why the
//! split encoding needs a power of two ring size.

use alloc::vec;
use alloc::vec::Vec;

use super::dma::MappedChain;
use super::indirect::IndirectTable;
use super::{
    AvailFlags, DescFlags, DescTable, FreeList, MemOps, SplitDescriptor, SplitLayout, UsedElem,
    UsedFlags, Violation, VirtqError, ring_need_event,
};

/// A validated completion taken off a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Used {
    /// Head id of the completed chain
    pub id: u16,
    /// Bytes written by the device
    pub len: u32,
}

#[derive(Debug)]
pub struct SplitRing<M> {
    mem: M,
    layout: SplitLayout,
    desc_table: DescTable,
    free: FreeList,
    /// Bytes the device may write, per head
    writable: Vec<u64>,
    avail_idx_shadow: u16,
    avail_flags_shadow: AvailFlags,
    last_used_idx: u16,
    num_added: u16,
    event_idx: bool,
}

impl<M: MemOps> SplitRing<M> {
    /// Take over a zeroed split ring.
    pub fn new(layout: SplitLayout, mem: M, event_idx: bool, callbacks: bool) -> Result<Self, VirtqError> {
        let size = layout.size;
        let desc_table = DescTable::new(layout.desc_table_addr, size);

        let mut avail_flags_shadow = AvailFlags::empty();
        if !callbacks {
            avail_flags_shadow |= AvailFlags::NO_INTERRUPT;
            if !event_idx {
                mem.store_release(layout.avail_flags_addr(), avail_flags_shadow.bits())
                    .map_err(|_| VirtqError::MemoryError)?;
            }
        }

        Ok(Self {
            mem,
            layout,
            desc_table,
            free: FreeList::new(size),
            writable: vec![0; size as usize],
            avail_idx_shadow: 0,
            avail_flags_shadow,
            last_used_idx: 0,
            num_added: 0,
            event_idx,
        })
    }

    /// Write a chain into the descriptor table and publish its head.
    ///
    /// With `indirect` the chain takes a single slot pointing at the table.
    /// Ring state is untouched if any write fails.
    pub fn add(
        &mut self,
        chain: &MappedChain,
        indirect: Option<&IndirectTable>,
    ) -> Result<u16, VirtqError> {
        let descs = if indirect.is_some() { 1 } else { chain.len() as u16 };
        let head = self.free.allocate_chain(descs)?;

        if let Err(e) = self.publish(head, chain, indirect) {
            self.free.release_chain(head);
            return Err(e);
        }

        self.writable[head as usize] = chain.writable_len();
        self.num_added = self.num_added.wrapping_add(1);
        Ok(head)
    }

    fn publish(
        &mut self,
        head: u16,
        chain: &MappedChain,
        indirect: Option<&IndirectTable>,
    ) -> Result<(), VirtqError> {
        match indirect {
            Some(table) => {
                let desc =
                    SplitDescriptor::new(table.bus_addr, table.len, DescFlags::INDIRECT, 0);
                self.write_desc(head, desc)?;
            }
            None => {
                let n = chain.len();
                for (i, (idx, seg)) in self.free.chain(head).zip(chain.segs.iter()).enumerate() {
                    let mut flags = DescFlags::empty();
                    flags.set(DescFlags::WRITE, seg.writable);
                    flags.set(DescFlags::NEXT, i + 1 < n);
                    let next = if i + 1 < n { self.free.next(idx) } else { 0 };

                    let desc = SplitDescriptor::new(seg.bus_addr, seg.len, flags, next);
                    self.write_desc(idx, desc)?;
                }
            }
        }

        let slot = self.avail_idx_shadow & (self.layout.size - 1);
        self.mem
            .write_val(self.layout.avail_ring_addr(slot), head)
            .map_err(|_| VirtqError::MemoryError)?;

        // Release publish
        let new = self.avail_idx_shadow.wrapping_add(1);
        self.mem
            .store_release(self.layout.avail_idx_addr(), new)
            .map_err(|_| VirtqError::MemoryError)?;
        self.avail_idx_shadow = new;

        Ok(())
    }

    fn write_desc(&self, idx: u16, desc: SplitDescriptor) -> Result<(), VirtqError> {
        let addr = self
            .desc_table
            .addr(idx)
            .ok_or(VirtqError::InvalidLayout)?;
        self.mem
            .write_val(addr, desc)
            .map_err(|_| VirtqError::MemoryError)
    }

    /// Does the device want a notification for everything added since the
    /// last call?
    pub fn kick_prepare(&mut self) -> Result<bool, VirtqError> {
        // The avail index store must be visible before reading the event word
        self.mem.mb();

        let new = self.avail_idx_shadow;
        let old = new.wrapping_sub(self.num_added);
        self.num_added = 0;

        if self.event_idx {
            let event = self
                .mem
                .load_acquire(self.layout.avail_event_addr())
                .map_err(|_| VirtqError::MemoryError)?;
            Ok(ring_need_event(event, new, old))
        } else {
            let flags = self
                .mem
                .load_acquire(self.layout.used_flags_addr())
                .map_err(|_| VirtqError::MemoryError)?;
            Ok(!UsedFlags::from_bits_truncate(flags).contains(UsedFlags::NO_NOTIFY))
        }
    }

    fn used_idx(&self) -> Result<u16, VirtqError> {
        self.mem
            .load_acquire(self.layout.used_idx_addr())
            .map_err(|_| VirtqError::MemoryError)
    }

    pub fn more_used(&self) -> Result<bool, VirtqError> {
        Ok(self.used_idx()? != self.last_used_idx)
    }

    /// Take the next completion off the used ring.
    ///
    /// The entry is validated before anything is released; a violation leaves
    /// driver state as it was.
    pub fn pop_used(&mut self) -> Result<Option<Used>, VirtqError> {
        let used_idx = self.used_idx()?;
        if used_idx == self.last_used_idx {
            return Ok(None);
        }

        let size = self.layout.size;
        if used_idx.wrapping_sub(self.last_used_idx) > size {
            return Err(Violation::UsedIndexAhead {
                used_idx,
                last_used: self.last_used_idx,
                size,
            }
            .into());
        }

        let slot = self.last_used_idx & (size - 1);
        let elem: UsedElem = self
            .mem
            .read_val(self.layout.used_elem_addr(slot))
            .map_err(|_| VirtqError::MemoryError)?;

        if elem.id >= size as u32 {
            return Err(Violation::IdOutOfRange { id: elem.id, size }.into());
        }
        let id = elem.id as u16;
        if !self.free.is_head(id) {
            return Err(Violation::NotAHead { id }.into());
        }
        let capacity = self.writable[id as usize];
        if elem.len as u64 > capacity {
            return Err(Violation::UsedLenTooLarge {
                id,
                len: elem.len,
                capacity,
            }
            .into());
        }

        self.free.release_chain(id);
        self.writable[id as usize] = 0;
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        // Ask for an interrupt at the next entry
        if self.event_idx && !self.avail_flags_shadow.contains(AvailFlags::NO_INTERRUPT) {
            self.write_used_event(self.last_used_idx)?;
            self.mem.mb();
        }

        Ok(Some(Used { id, len: elem.len }))
    }

    fn write_used_event(&self, idx: u16) -> Result<(), VirtqError> {
        self.mem
            .store_release(self.layout.used_event_addr(), idx)
            .map_err(|_| VirtqError::MemoryError)
    }

    fn write_avail_flags(&self) -> Result<(), VirtqError> {
        self.mem
            .store_release(self.layout.avail_flags_addr(), self.avail_flags_shadow.bits())
            .map_err(|_| VirtqError::MemoryError)
    }

    pub fn disable_cb(&mut self) -> Result<(), VirtqError> {
        if !self.avail_flags_shadow.contains(AvailFlags::NO_INTERRUPT) {
            self.avail_flags_shadow |= AvailFlags::NO_INTERRUPT;
            if !self.event_idx {
                self.write_avail_flags()?;
            }
        }
        Ok(())
    }

    fn clear_no_interrupt(&mut self) -> Result<(), VirtqError> {
        if self.avail_flags_shadow.contains(AvailFlags::NO_INTERRUPT) {
            self.avail_flags_shadow &= !AvailFlags::NO_INTERRUPT;
            if !self.event_idx {
                self.write_avail_flags()?;
            }
        }
        Ok(())
    }

    /// Re-arm interrupts at the next used entry; returns that position.
    pub fn enable_cb_prepare(&mut self) -> Result<u16, VirtqError> {
        self.clear_no_interrupt()?;
        self.write_used_event(self.last_used_idx)?;
        Ok(self.last_used_idx)
    }

    /// Has the device used anything past `last_used`?
    pub fn poll(&self, last_used: u16) -> Result<bool, VirtqError> {
        // The re-arm store must be visible before the used index is read
        self.mem.mb();
        Ok(self.used_idx()? != last_used)
    }

    /// Re-arm interrupts once roughly three quarters of the outstanding
    /// buffers are used. Returns false if that many are already used.
    pub fn enable_cb_delayed(&mut self) -> Result<bool, VirtqError> {
        self.clear_no_interrupt()?;

        let bufs = (self.avail_idx_shadow.wrapping_sub(self.last_used_idx) as u32 * 3 / 4) as u16;
        self.write_used_event(self.last_used_idx.wrapping_add(bufs))?;
        self.mem.mb();

        let used = self.used_idx()?.wrapping_sub(self.last_used_idx);
        Ok(used <= bufs)
    }

    /// Reclaim one outstanding chain without the device's help.
    ///
    /// The avail index is rewound so the device never sees the entry again;
    /// with `touch_ring` false only driver state changes.
    pub fn detach_unused(&mut self, touch_ring: bool) -> Result<Option<u16>, VirtqError> {
        let Some(head) = self.free.first_head(0) else {
            debug_assert_eq!(self.free.num_free(), self.layout.size);
            return Ok(None);
        };

        let rewound = self.avail_idx_shadow.wrapping_sub(1);
        if touch_ring {
            self.mem
                .store_release(self.layout.avail_idx_addr(), rewound)
                .map_err(|_| VirtqError::MemoryError)?;
        }

        self.free.release_chain(head);
        self.writable[head as usize] = 0;
        self.avail_idx_shadow = rewound;
        Ok(Some(head))
    }

    pub fn num_free(&self) -> u16 {
        self.free.num_free()
    }

    pub fn num_added(&self) -> u16 {
        self.num_added
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn layout(&self) -> &SplitLayout {
        &self.layout
    }

    #[cfg(test)]
    pub(crate) fn free_list(&self) -> &FreeList {
        &self.free
    }
}
