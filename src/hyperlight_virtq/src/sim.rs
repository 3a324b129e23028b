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

//! Test doubles for the queue's collaborators and a simulated device.
//!
//! Everything here runs on the driver's own memory: [`TestMem`] is a byte
//! arena addressed by real pointers, [`TestDma`] is an identity mapping that
//! keeps a ledger of live mappings, and [`SplitDevice`] / [`PackedDevice`]
//! play the device side of each ring encoding. The devices can be told to
//! misbehave through [`DeviceFault`].

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicU16, Ordering};

use thiserror::Error;

use super::packed::RingCursor;
use super::{
    AvailFlags, BufferElement, DescFlags, Descriptor, DmaDirection, DmaOps, EventSuppression, MemOps,
    Notifier, PackedLayout, QueueConfig, QueueStats, Region, RingLayout, SplitDescriptor,
    SplitLayout, UsedElem, UsedFlags, VirtqError, ring_need_event, should_notify,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    #[error("access outside test memory at {0:#x}")]
    OutOfBounds(u64),
    #[error("id {0} is not pending on the device")]
    NotPending(u16),
    #[error("malformed chain at {0}")]
    BadChain(u16),
}

/// Heap buffer posing as shared memory.
///
/// Accesses derive from the storage pointer, never from integers, which
/// keeps Miri's provenance checks happy.
pub struct TestMem {
    /// Shared between driver and device through `&self`
    storage: UnsafeCell<Vec<u8>>,
    /// Address the ring is told the buffer lives at
    base_addr: u64,
    len: usize,
}

impl TestMem {
    pub fn new(size: usize) -> Self {
        let storage = vec![0u8; size];
        let base_addr = storage.as_ptr() as u64;
        Self {
            storage: UnsafeCell::new(storage),
            base_addr,
            len: size,
        }
    }

    /// Get a pointer with proper provenance for `len` bytes at `addr`
    fn ptr_for_addr(&self, addr: u64, len: usize) -> Result<*mut u8, SimError> {
        let offset = addr
            .checked_sub(self.base_addr)
            .ok_or(SimError::OutOfBounds(addr))? as usize;
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(SimError::OutOfBounds(addr));
        }

        // SAFETY: only raw pointers are derived from the storage
        let base_ptr = unsafe { (*self.storage.get()).as_mut_ptr() };
        // offset the storage pointer so Miri keeps its provenance
        Ok(base_ptr.wrapping_add(offset))
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl MemOps for Rc<TestMem> {
    type Error = SimError;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let src = self.ptr_for_addr(addr, dst.len())?;
        unsafe {
            ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        }
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let dst = self.ptr_for_addr(addr, src.len())?;
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        let ptr = self.ptr_for_addr(addr, 2)?.cast::<AtomicU16>();
        Ok(unsafe { (*ptr).load(Ordering::Acquire) })
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        let ptr = self.ptr_for_addr(addr, 2)?.cast::<AtomicU16>();
        unsafe { (*ptr).store(val, Ordering::Release) };
        Ok(())
    }
}

/// Owns ring memory plus a data area and an indirect table region.
pub struct OwnedRing {
    mem: Rc<TestMem>,
    layout: RingLayout,
    data_base: u64,
    indirect: Region,
}

impl OwnedRing {
    /// Bytes of buffer space behind the ring.
    pub const DATA_LEN: usize = 64 * 1024;
    pub const INDIRECT_LEN: usize = 16 * 1024;
    /// Stride between the buffers handed out by [`buf`](Self::buf).
    pub const BUF_STRIDE: usize = 256;

    pub fn new(config: &QueueConfig) -> Result<Self, VirtqError> {
        let ring_len = RingLayout::query_size(config);
        let total = ring_len + Self::DATA_LEN + Self::INDIRECT_LEN + 1024;
        let mem = Rc::new(TestMem::new(total));

        let base = mem.base_addr().next_multiple_of(SplitLayout::USED_ALIGN as u64);
        // SAFETY: the arena covers base + ring_len and lives as long as self
        let layout = unsafe { RingLayout::from_base(base, config)? };

        let data_base = (base + ring_len as u64).next_multiple_of(64);
        let indirect_base = (data_base + Self::DATA_LEN as u64).next_multiple_of(256);

        Ok(Self {
            mem,
            layout,
            data_base,
            indirect: Region {
                base: indirect_base,
                len: Self::INDIRECT_LEN,
            },
        })
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn mem(&self) -> Rc<TestMem> {
        self.mem.clone()
    }

    /// Address of the `i`th data buffer.
    pub fn buf(&self, i: usize) -> u64 {
        self.data_base + ((i * Self::BUF_STRIDE) % Self::DATA_LEN) as u64
    }

    pub fn indirect_region(&self) -> Region {
        self.indirect
    }
}

#[derive(Debug, Default)]
struct DmaLedger {
    live: Vec<(u64, u32, DmaDirection)>,
    maps: usize,
    bad_unmaps: usize,
    fail_after: Option<usize>,
}

/// Identity DMA mapping with a ledger of live mappings and failure injection.
///
/// Clones share the same ledger.
#[derive(Debug, Clone, Default)]
pub struct TestDma {
    inner: Rc<RefCell<DmaLedger>>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("injected mapping failure")]
pub struct MapFailed;

impl TestDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more mappings succeed, then fail the next one.
    pub fn fail_after(&self, n: usize) {
        self.inner.borrow_mut().fail_after = Some(n);
    }

    /// Mappings not yet unmapped.
    pub fn live(&self) -> usize {
        self.inner.borrow().live.len()
    }

    /// Successful mappings so far.
    pub fn maps(&self) -> usize {
        self.inner.borrow().maps
    }

    /// Unmaps that matched no live mapping.
    pub fn bad_unmaps(&self) -> usize {
        self.inner.borrow().bad_unmaps
    }
}

impl DmaOps for TestDma {
    type Error = MapFailed;

    fn map(&self, addr: u64, len: u32, dir: DmaDirection) -> Result<u64, Self::Error> {
        let mut ledger = self.inner.borrow_mut();
        match ledger.fail_after {
            Some(0) => {
                ledger.fail_after = None;
                return Err(MapFailed);
            }
            Some(n) => ledger.fail_after = Some(n - 1),
            None => {}
        }

        ledger.live.push((addr, len, dir));
        ledger.maps += 1;
        Ok(addr)
    }

    fn unmap(&self, bus_addr: u64, len: u32, dir: DmaDirection) {
        let mut ledger = self.inner.borrow_mut();
        match ledger.live.iter().rposition(|m| *m == (bus_addr, len, dir)) {
            Some(pos) => {
                ledger.live.swap_remove(pos);
            }
            None => ledger.bad_unmaps += 1,
        }
    }
}

/// Doorbell that counts notifications. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct TestNotifier {
    kicks: Rc<Cell<usize>>,
    fail: Rc<Cell<bool>>,
    broken: Rc<Cell<bool>>,
    last: Rc<Cell<Option<QueueStats>>>,
}

impl TestNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kicks(&self) -> usize {
        self.kicks.get()
    }

    pub fn last_stats(&self) -> Option<QueueStats> {
        self.last.get()
    }

    /// Make every following doorbell write fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.set(fail);
    }

    /// Simulate surprise removal of the transport.
    pub fn set_broken(&self, broken: bool) {
        self.broken.set(broken);
    }
}

impl Notifier for TestNotifier {
    fn notify(&self, stats: QueueStats) -> bool {
        self.kicks.set(self.kicks.get() + 1);
        self.last.set(Some(stats));
        !self.fail.get()
    }

    fn is_broken(&self) -> bool {
        self.broken.get()
    }
}

/// A chain as the device sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChain {
    pub id: u16,
    pub elems: Vec<BufferElement>,
    /// Ring slots the chain occupies
    pub slots: u16,
}

impl DeviceChain {
    pub fn writable_len(&self) -> u64 {
        self.elems
            .iter()
            .filter(|e| e.writable)
            .map(|e| e.len as u64)
            .sum()
    }

    pub fn readable_len(&self) -> u64 {
        self.elems
            .iter()
            .filter(|e| !e.writable)
            .map(|e| e.len as u64)
            .sum()
    }
}

/// Ways a simulated device can break the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum DeviceFault {
    /// Complete an id outside the ring
    IdOutOfRange(u32),
    /// Complete the last completed chain again
    Replay,
    /// Report more bytes than the oldest pending chain can hold
    Overlong,
    /// Complete an arbitrary id
    RawId(u16),
    /// Publish far more used entries than were ever made available
    IndexJump(u16),
}

/// Read a chain of split descriptors linked through `next`, starting at
/// `first` in the table at `table` of `len` entries.
///
/// Returns how many entries of `table` itself the chain used. An indirect
/// descriptor counts as one; the table it points at does not.
fn walk_split<M: MemOps>(
    mem: &M,
    table: u64,
    len: u16,
    first: u16,
    elems: &mut Vec<BufferElement>,
) -> Result<u16, SimError> {
    let mut idx = first;
    for walked in 1..=len {
        let desc: SplitDescriptor = mem
            .read_val(table + SplitDescriptor::SIZE as u64 * idx as u64)
            .map_err(|_| SimError::OutOfBounds(table))?;

        if desc.is_indirect() {
            if !elems.is_empty() || desc.is_next() {
                return Err(SimError::BadChain(idx));
            }
            let n = (desc.len as usize / SplitDescriptor::SIZE) as u16;
            walk_split(mem, desc.addr, n, 0, elems)?;
            return Ok(walked);
        }

        elems.push(BufferElement {
            addr: desc.addr,
            len: desc.len,
            writable: desc.is_writeable(),
        });
        if !desc.is_next() {
            return Ok(walked);
        }
        idx = desc.next;
        if idx >= len {
            return Err(SimError::BadChain(idx));
        }
    }
    Err(SimError::BadChain(first))
}

/// Device side of a split ring.
pub struct SplitDevice<M> {
    mem: M,
    layout: SplitLayout,
    last_avail: u16,
    used_idx: u16,
    pending: BTreeMap<u16, DeviceChain>,
    last_completed: Option<(u16, u32)>,
    event_idx: bool,
}

impl<M: MemOps> SplitDevice<M> {
    pub fn new(layout: SplitLayout, mem: M, event_idx: bool) -> Self {
        Self {
            mem,
            layout,
            last_avail: 0,
            used_idx: 0,
            pending: BTreeMap::new(),
            last_completed: None,
            event_idx,
        }
    }

    /// Consume the next available chain, if any.
    pub fn poll_avail(&mut self) -> Result<Option<DeviceChain>, SimError> {
        let avail_idx = self
            .mem
            .load_acquire(self.layout.avail_idx_addr())
            .map_err(|_| SimError::OutOfBounds(self.layout.avail_idx_addr()))?;
        if avail_idx == self.last_avail {
            return Ok(None);
        }

        let slot = self.last_avail & (self.layout.size - 1);
        let head: u16 = self
            .mem
            .read_val(self.layout.avail_ring_addr(slot))
            .map_err(|_| SimError::OutOfBounds(self.layout.avail_ring_addr(slot)))?;
        if head >= self.layout.size {
            return Err(SimError::BadChain(head));
        }

        let mut elems = Vec::new();
        let slots = walk_split(
            &self.mem,
            self.layout.desc_table_addr,
            self.layout.size,
            head,
            &mut elems,
        )?;
        self.last_avail = self.last_avail.wrapping_add(1);

        let chain = DeviceChain {
            id: head,
            elems,
            slots,
        };
        self.pending.insert(head, chain.clone());
        Ok(Some(chain))
    }

    /// Copy `data` into the writable part of a chain, returning bytes written.
    pub fn fill(&self, chain: &DeviceChain, data: &[u8]) -> Result<u32, SimError> {
        fill_chain(&self.mem, chain, data)
    }

    /// Return a pending chain. Returns whether the driver wants an interrupt.
    pub fn complete(&mut self, id: u16, len: u32) -> Result<bool, SimError> {
        self.pending.remove(&id).ok_or(SimError::NotPending(id))?;
        self.push_used(id as u32, len)
    }

    fn push_used(&mut self, id: u32, len: u32) -> Result<bool, SimError> {
        let slot = self.used_idx & (self.layout.size - 1);
        let addr = self.layout.used_elem_addr(slot);
        self.mem
            .write_val(addr, UsedElem { id, len })
            .map_err(|_| SimError::OutOfBounds(addr))?;

        let old = self.used_idx;
        self.used_idx = self.used_idx.wrapping_add(1);
        self.publish_used_idx()?;
        self.last_completed = Some((id as u16, len));

        self.should_interrupt(old)
    }

    fn publish_used_idx(&self) -> Result<(), SimError> {
        self.mem
            .store_release(self.layout.used_idx_addr(), self.used_idx)
            .map_err(|_| SimError::OutOfBounds(self.layout.used_idx_addr()))
    }

    fn should_interrupt(&self, old: u16) -> Result<bool, SimError> {
        self.mem.mb();
        if self.event_idx {
            let addr = self.layout.used_event_addr();
            let event = self
                .mem
                .load_acquire(addr)
                .map_err(|_| SimError::OutOfBounds(addr))?;
            Ok(ring_need_event(event, self.used_idx, old))
        } else {
            let addr = self.layout.avail_flags_addr();
            let flags = self
                .mem
                .load_acquire(addr)
                .map_err(|_| SimError::OutOfBounds(addr))?;
            Ok(!AvailFlags::from_bits_truncate(flags).contains(AvailFlags::NO_INTERRUPT))
        }
    }

    /// Ask for a kick once the driver publishes avail entry `idx`.
    pub fn set_avail_event(&self, idx: u16) -> Result<(), SimError> {
        let addr = self.layout.avail_event_addr();
        self.mem
            .store_release(addr, idx)
            .map_err(|_| SimError::OutOfBounds(addr))
    }

    pub fn set_no_notify(&self, no_notify: bool) -> Result<(), SimError> {
        let flags = if no_notify {
            UsedFlags::NO_NOTIFY
        } else {
            UsedFlags::empty()
        };
        let addr = self.layout.used_flags_addr();
        self.mem
            .store_release(addr, flags.bits())
            .map_err(|_| SimError::OutOfBounds(addr))
    }

    pub fn inject(&mut self, fault: DeviceFault) -> Result<(), SimError> {
        match fault {
            DeviceFault::IdOutOfRange(id) => {
                let id = id.max(self.layout.size as u32);
                self.push_used(id, 0)?;
            }
            DeviceFault::Replay => {
                if let Some((id, len)) = self.last_completed {
                    self.push_used(id as u32, len)?;
                }
            }
            DeviceFault::Overlong => {
                if let Some((&id, chain)) = self.pending.iter().next() {
                    let len = u32::try_from(chain.writable_len() + 1).unwrap_or(u32::MAX);
                    self.pending.remove(&id);
                    self.push_used(id as u32, len)?;
                }
            }
            DeviceFault::RawId(id) => {
                self.pending.remove(&id);
                self.push_used(id as u32, 0)?;
            }
            DeviceFault::IndexJump(n) => {
                self.used_idx = self
                    .used_idx
                    .wrapping_add(self.layout.size)
                    .wrapping_add(n.max(1));
                self.publish_used_idx()?;
            }
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<u16> {
        self.pending.keys().copied().collect()
    }
}

/// Device side of a packed ring.
pub struct PackedDevice<M> {
    mem: M,
    layout: PackedLayout,
    avail_cursor: RingCursor,
    used_cursor: RingCursor,
    pending: BTreeMap<u16, DeviceChain>,
    last_completed: Option<(u16, u32)>,
}

impl<M: MemOps> PackedDevice<M> {
    pub fn new(layout: PackedLayout, mem: M) -> Self {
        let cursor = RingCursor::new(layout.desc_table_len);
        Self {
            mem,
            layout,
            avail_cursor: cursor,
            used_cursor: cursor,
            pending: BTreeMap::new(),
            last_completed: None,
        }
    }

    fn desc_addr(&self, idx: u16) -> u64 {
        self.layout.desc_table_addr + Descriptor::SIZE as u64 * idx as u64
    }

    /// Consume the next available chain, if any.
    pub fn poll_avail(&mut self) -> Result<Option<DeviceChain>, SimError> {
        let pos = self.avail_cursor;
        let addr = self.desc_addr(pos.head());

        // same order as the driver: flags, then body
        let Some(head) = Descriptor::read_acquire(&self.mem, addr, |d| d.is_avail(pos.wrap()))
            .map_err(|_| SimError::OutOfBounds(addr))?
        else {
            return Ok(None);
        };

        let size = self.layout.desc_table_len;
        let mut elems = Vec::new();
        let mut slots: u16 = 1;

        if head.is_indirect() {
            let n = head.len as usize / Descriptor::SIZE;
            for i in 0..n {
                let entry = head.addr + (i * Descriptor::SIZE) as u64;
                let desc: Descriptor = self
                    .mem
                    .read_val(entry)
                    .map_err(|_| SimError::OutOfBounds(entry))?;
                elems.push(BufferElement {
                    addr: desc.addr,
                    len: desc.len,
                    writable: desc.is_writeable(),
                });
            }
        } else {
            elems.push(BufferElement {
                addr: head.addr,
                len: head.len,
                writable: head.is_writeable(),
            });

            let mut cur = pos;
            cur.advance();
            let mut has_next = head.is_next();
            while has_next {
                if slots >= size {
                    return Err(SimError::BadChain(pos.head()));
                }
                // tail reads are ordered by the head's acquire
                let tail = self.desc_addr(cur.head());
                let desc: Descriptor = self
                    .mem
                    .read_val(tail)
                    .map_err(|_| SimError::OutOfBounds(tail))?;
                elems.push(BufferElement {
                    addr: desc.addr,
                    len: desc.len,
                    writable: desc.is_writeable(),
                });
                slots += 1;
                has_next = desc.is_next();
                cur.advance();
            }
        }

        self.avail_cursor.advance_by(slots);
        let chain = DeviceChain {
            id: head.id,
            elems,
            slots,
        };
        self.pending.insert(head.id, chain.clone());
        Ok(Some(chain))
    }

    /// Copy `data` into the writable part of a chain, returning bytes written.
    pub fn fill(&self, chain: &DeviceChain, data: &[u8]) -> Result<u32, SimError> {
        fill_chain(&self.mem, chain, data)
    }

    /// Return a pending chain. Returns whether the driver wants an interrupt.
    pub fn complete(&mut self, id: u16, len: u32) -> Result<bool, SimError> {
        let chain = self.pending.remove(&id).ok_or(SimError::NotPending(id))?;
        self.push_used(id, len, chain.slots)
    }

    fn push_used(&mut self, id: u16, len: u32, slots: u16) -> Result<bool, SimError> {
        let mut desc = Descriptor::new(0, len, id, DescFlags::empty());
        desc.mark_used(self.used_cursor.wrap());

        let addr = self.desc_addr(self.used_cursor.head());
        // flags go out last
        desc.write_release(&self.mem, addr)
            .map_err(|_| SimError::OutOfBounds(addr))?;

        self.used_cursor.advance_by(slots);
        self.last_completed = Some((id, len));

        self.mem.mb();
        let evt = EventSuppression::read_acquire(&self.mem, self.layout.drv_evt_addr)
            .map_err(|_| SimError::OutOfBounds(self.layout.drv_evt_addr))?;
        Ok(should_notify(
            evt,
            self.layout.desc_table_len,
            self.used_cursor.head(),
            self.used_cursor.wrap(),
            slots,
        ))
    }

    /// Publish the device event structure the driver reads in `kick_prepare`.
    pub fn set_device_event(&self, evt: EventSuppression) -> Result<(), SimError> {
        evt.write_release(&self.mem, self.layout.dev_evt_addr)
            .map_err(|_| SimError::OutOfBounds(self.layout.dev_evt_addr))
    }

    pub fn inject(&mut self, fault: DeviceFault) -> Result<(), SimError> {
        match fault {
            DeviceFault::IdOutOfRange(id) => {
                let id = id.clamp(self.layout.desc_table_len as u32, u16::MAX as u32) as u16;
                self.push_used(id, 0, 1)?;
            }
            DeviceFault::Replay => {
                if let Some((id, len)) = self.last_completed {
                    self.push_used(id, len, 1)?;
                }
            }
            DeviceFault::Overlong => {
                if let Some((&id, chain)) = self.pending.iter().next() {
                    let len = u32::try_from(chain.writable_len() + 1).unwrap_or(u32::MAX);
                    let slots = chain.slots;
                    self.pending.remove(&id);
                    self.push_used(id, len, slots)?;
                }
            }
            DeviceFault::RawId(id) => {
                let slots = self.pending.remove(&id).map_or(1, |c| c.slots);
                self.push_used(id, 0, slots)?;
            }
            DeviceFault::IndexJump(n) => {
                // no used index in this encoding: skip ahead instead
                let skip = n % self.layout.desc_table_len.max(1) + 1;
                self.used_cursor.advance_by(skip.min(self.layout.desc_table_len));
                self.push_used(0, 0, 1)?;
            }
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<u16> {
        self.pending.keys().copied().collect()
    }
}

fn fill_chain<M: MemOps>(mem: &M, chain: &DeviceChain, data: &[u8]) -> Result<u32, SimError> {
    let mut off = 0;
    for e in chain.elems.iter().filter(|e| e.writable) {
        if off == data.len() {
            break;
        }
        let n = (e.len as usize).min(data.len() - off);
        mem.write(e.addr, &data[off..off + n])
            .map_err(|_| SimError::OutOfBounds(e.addr))?;
        off += n;
    }
    Ok(off as u32)
}

/// Either device, matching the ring encoding of a layout.
pub enum SimDevice<M> {
    Split(SplitDevice<M>),
    Packed(PackedDevice<M>),
}

impl<M: MemOps> SimDevice<M> {
    pub fn new(layout: RingLayout, mem: M, event_idx: bool) -> Self {
        match layout {
            RingLayout::Split(l) => Self::Split(SplitDevice::new(l, mem, event_idx)),
            RingLayout::Packed(l) => Self::Packed(PackedDevice::new(l, mem)),
        }
    }

    pub fn poll_avail(&mut self) -> Result<Option<DeviceChain>, SimError> {
        match self {
            Self::Split(d) => d.poll_avail(),
            Self::Packed(d) => d.poll_avail(),
        }
    }

    /// Consume every available chain.
    pub fn poll_all(&mut self) -> Result<Vec<DeviceChain>, SimError> {
        let mut chains = Vec::new();
        while let Some(c) = self.poll_avail()? {
            chains.push(c);
        }
        Ok(chains)
    }

    pub fn fill(&self, chain: &DeviceChain, data: &[u8]) -> Result<u32, SimError> {
        match self {
            Self::Split(d) => d.fill(chain, data),
            Self::Packed(d) => d.fill(chain, data),
        }
    }

    pub fn complete(&mut self, id: u16, len: u32) -> Result<bool, SimError> {
        match self {
            Self::Split(d) => d.complete(id, len),
            Self::Packed(d) => d.complete(id, len),
        }
    }

    pub fn inject(&mut self, fault: DeviceFault) -> Result<(), SimError> {
        match self {
            Self::Split(d) => d.inject(fault),
            Self::Packed(d) => d.inject(fault),
        }
    }

    pub fn pending(&self) -> usize {
        match self {
            Self::Split(d) => d.pending(),
            Self::Packed(d) => d.pending(),
        }
    }

    pub fn pending_ids(&self) -> Vec<u16> {
        match self {
            Self::Split(d) => d.pending_ids(),
            Self::Packed(d) => d.pending_ids(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_rejects_out_of_bounds() {
        let mem = Rc::new(TestMem::new(64));
        let base = mem.base_addr();
        assert!(mem.write_val(base + 60, 0u32).is_ok());
        assert!(mem.write_val(base + 62, 0u32).is_err());
        assert!(mem.read_val::<u16>(base - 2).is_err());
    }

    #[test]
    fn test_dma_ledger_and_failure_injection() {
        let dma = TestDma::new();
        let a = dma.map(0x1000, 8, DmaDirection::ToDevice).unwrap();
        dma.fail_after(1);
        let b = dma.map(0x2000, 8, DmaDirection::FromDevice).unwrap();
        assert!(dma.map(0x3000, 8, DmaDirection::ToDevice).is_err());
        // failure is one-shot
        let c = dma.map(0x3000, 8, DmaDirection::ToDevice).unwrap();
        assert_eq!(dma.live(), 3);

        dma.unmap(a, 8, DmaDirection::ToDevice);
        dma.unmap(b, 8, DmaDirection::FromDevice);
        dma.unmap(c, 8, DmaDirection::ToDevice);
        assert_eq!(dma.live(), 0);
        dma.unmap(c, 8, DmaDirection::ToDevice);
        assert_eq!(dma.bad_unmaps(), 1);
    }
}
