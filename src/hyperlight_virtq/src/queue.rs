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

//! The ring-agnostic driver API.
//!
//! A [`Virtqueue`] picks the split or packed engine once, from the negotiated
//! features, and forwards every operation to it. On top of the engines it
//! owns everything the device must never see: the caller's tokens, the DMA
//! mappings of each chain and the indirect tables.
//!
//! # Lifecycle
//!
//! ```ignore
//! let mut vq = Virtqueue::new(config, layout, mem, dma, notifier)?;
//!
//! vq.add(&[(req, req_len)], &[(resp, resp_len)], token, None)?;
//! vq.kick()?;
//!
//! // from the used-buffer interrupt
//! loop {
//!     vq.disable_callbacks()?;
//!     while let Some((token, written)) = vq.get_buf()? {
//!         complete(token, written);
//!     }
//!     if vq.enable_callbacks()? {
//!         break;
//!     }
//! }
//! ```
//!
//! # Failure
//!
//! A completion that does not match an outstanding chain is a protocol
//! violation. The queue then becomes broken for good: every later operation
//! returns [`VirtqError::QueueBroken`] without touching ring memory, except
//! [`Virtqueue::detach_unused_buf`] which still hands back the caller's
//! tokens during shutdown.

use alloc::vec::Vec;

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::dma::{MappedChain, map_chain};
use super::indirect::{IndirectTable, IndirectTables};
use super::packed::PackedRing;
use super::split::{SplitRing, Used};
use super::{
    BufferChain, DmaDirection, DmaOps, Features, MemOps, QueueConfig, RingLayout, Violation,
    VirtqError,
};

/// Transport side of a queue: the doorbell and the device's liveness.
pub trait Notifier {
    /// Ring the device's doorbell. Returns false if the write failed, which
    /// breaks the queue.
    fn notify(&self, stats: QueueStats) -> bool;

    /// Has the device gone away underneath the queue (surprise removal,
    /// reset in progress)?
    fn is_broken(&self) -> bool {
        false
    }
}

impl<T: Notifier + ?Sized> Notifier for &T {
    fn notify(&self, stats: QueueStats) -> bool {
        (**self).notify(stats)
    }

    fn is_broken(&self) -> bool {
        (**self).is_broken()
    }
}

/// Statistics about the current virtqueue state.
///
/// Provided to the [`Notifier`] when sending notifications, allowing
/// the notifier to make decisions based on queue pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of free descriptor slots available.
    pub num_free: usize,
    /// Number of descriptor slots held by outstanding chains.
    pub num_inflight: usize,
}

/// Position recorded by [`Virtqueue::enable_callbacks_prepare`].
///
/// Opaque: the split encoding stores the used index, the packed encoding
/// an offset and wrap counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackState(u16);

enum Engine<M> {
    Split(SplitRing<M>),
    Packed(PackedRing<M>),
}

impl<M: MemOps> Engine<M> {
    fn add(
        &mut self,
        chain: &MappedChain,
        indirect: Option<&IndirectTable>,
    ) -> Result<u16, VirtqError> {
        match self {
            Self::Split(r) => r.add(chain, indirect),
            Self::Packed(r) => r.add(chain, indirect),
        }
    }

    fn kick_prepare(&mut self) -> Result<bool, VirtqError> {
        match self {
            Self::Split(r) => r.kick_prepare(),
            Self::Packed(r) => r.kick_prepare(),
        }
    }

    fn more_used(&self) -> Result<bool, VirtqError> {
        match self {
            Self::Split(r) => r.more_used(),
            Self::Packed(r) => r.more_used(),
        }
    }

    fn pop_used(&mut self) -> Result<Option<Used>, VirtqError> {
        match self {
            Self::Split(r) => r.pop_used(),
            Self::Packed(r) => r.pop_used(),
        }
    }

    fn disable_cb(&mut self) -> Result<(), VirtqError> {
        match self {
            Self::Split(r) => r.disable_cb(),
            Self::Packed(r) => r.disable_cb(),
        }
    }

    fn enable_cb_prepare(&mut self) -> Result<u16, VirtqError> {
        match self {
            Self::Split(r) => r.enable_cb_prepare(),
            Self::Packed(r) => r.enable_cb_prepare(),
        }
    }

    fn poll(&self, state: u16) -> Result<bool, VirtqError> {
        match self {
            Self::Split(r) => r.poll(state),
            Self::Packed(r) => r.poll(state),
        }
    }

    fn enable_cb_delayed(&mut self) -> Result<bool, VirtqError> {
        match self {
            Self::Split(r) => r.enable_cb_delayed(),
            Self::Packed(r) => r.enable_cb_delayed(),
        }
    }

    fn detach_unused(&mut self, touch_ring: bool) -> Result<Option<u16>, VirtqError> {
        match self {
            Self::Split(r) => r.detach_unused(touch_ring),
            Self::Packed(r) => Ok(r.detach_unused()),
        }
    }

    fn num_free(&self) -> u16 {
        match self {
            Self::Split(r) => r.num_free(),
            Self::Packed(r) => r.num_free(),
        }
    }

    fn num_added(&self) -> u16 {
        match self {
            Self::Split(r) => r.num_added(),
            Self::Packed(r) => r.num_added(),
        }
    }

    fn mem(&self) -> &M {
        match self {
            Self::Split(r) => r.mem(),
            Self::Packed(r) => r.mem(),
        }
    }
}

/// Driver-private record of an outstanding chain, indexed by head id.
struct InFlight<T, C> {
    token: T,
    ctx: Option<C>,
    mapped: MappedChain,
    indirect: Option<IndirectTable>,
    /// Ring slots the chain holds
    descs: u16,
}

/// A virtqueue driven from the driver side.
///
/// `T` is the token handed back when a chain completes, `C` an optional
/// per-chain context returned alongside it.
pub struct Virtqueue<M, D: DmaOps, N, T, C = ()> {
    engine: Engine<M>,
    dma: D,
    notifier: N,
    tables: Option<IndirectTables>,
    inflight: Vec<Option<InFlight<T, C>>>,
    in_flight_descs: usize,
    layout: RingLayout,
    ring_bus_addr: u64,
    ring_len: u32,
    features: Features,
    index: u16,
    broken: bool,
}

impl<M, D, N, T, C> Virtqueue<M, D, N, T, C>
where
    M: MemOps,
    D: DmaOps,
    N: Notifier,
{
    /// Take over the ring at `layout` and map it for the device.
    ///
    /// The ring memory is zeroed. If INDIRECT_DESC was negotiated but no
    /// usable region is configured, the queue runs without indirect tables.
    pub fn new(
        config: QueueConfig,
        layout: RingLayout,
        mem: M,
        dma: D,
        notifier: N,
    ) -> Result<Self, VirtqError> {
        config.validate()?;
        if layout.size() != config.size() || layout.is_packed() != config.is_packed() {
            return Err(VirtqError::InvalidLayout);
        }
        let ring_len = u32::try_from(layout.total_size()).map_err(|_| VirtqError::InvalidLayout)?;
        let index = config.index();

        mem.zero(layout.base(), layout.total_size())
            .map_err(|_| VirtqError::MemoryError)?;

        let engine = match layout {
            RingLayout::Split(l) => Engine::Split(SplitRing::new(
                l,
                mem,
                config.event_idx(),
                config.callbacks(),
            )?),
            RingLayout::Packed(l) => Engine::Packed(PackedRing::new(
                l,
                mem,
                config.event_idx(),
                config.callbacks(),
            )?),
        };

        let tables = Self::indirect_tables(&config);

        let ring_bus_addr = dma
            .map(layout.base(), ring_len, DmaDirection::Bidirectional)
            .map_err(|e| {
                log::error!("queue {}: cannot map ring memory: {:?}", index, e);
                VirtqError::MappingFailed
            })?;

        log::debug!(
            "queue {}: {} ring of {} at {:#x}, features {:?}",
            index,
            if layout.is_packed() { "packed" } else { "split" },
            layout.size(),
            layout.base(),
            config.features()
        );

        let mut inflight = Vec::with_capacity(config.size() as usize);
        inflight.resize_with(config.size() as usize, || None);

        Ok(Self {
            engine,
            dma,
            notifier,
            tables,
            inflight,
            in_flight_descs: 0,
            layout,
            ring_bus_addr,
            ring_len,
            features: config.features(),
            index,
            broken: false,
        })
    }

    fn indirect_tables(config: &QueueConfig) -> Option<IndirectTables> {
        let negotiated = config.features().contains(Features::INDIRECT_DESC);
        match (negotiated, config.indirect_region()) {
            (true, Some(region)) => match IndirectTables::new(region, config.max_indirect()) {
                Ok(tables) => Some(tables),
                Err(e) => {
                    log::warn!(
                        "queue {}: unusable indirect region {:#x}+{:#x} ({}), using direct descriptors",
                        config.index(),
                        region.base,
                        region.len,
                        e
                    );
                    None
                }
            },
            (true, None) => {
                log::warn!(
                    "queue {}: INDIRECT_DESC negotiated without an indirect region",
                    config.index()
                );
                None
            }
            (false, _) => None,
        }
    }

    fn check_broken(&mut self) -> Result<(), VirtqError> {
        if !self.broken && self.notifier.is_broken() {
            log::error!("queue {}: transport reports the device is gone", self.index);
            self.broken = true;
        }
        if self.broken {
            return Err(VirtqError::QueueBroken);
        }
        Ok(())
    }

    /// Break the queue if `err` is the device's fault.
    fn fail(&mut self, err: VirtqError) -> VirtqError {
        if let VirtqError::DeviceProtocolViolation(v) = err {
            log::error!("queue {}: device protocol violation: {}", self.index, v);
            self.broken = true;
        }
        err
    }

    /// Add a chain of device-readable `out` and device-writable `in_`
    /// segments, given as `(addr, len)` pairs.
    pub fn add(
        &mut self,
        out: &[(u64, u32)],
        in_: &[(u64, u32)],
        token: T,
        ctx: Option<C>,
    ) -> Result<(), VirtqError> {
        let chain = BufferChain::new(out, in_)?;
        self.add_chain(&chain, token, ctx)
    }

    pub fn add_outbuf(&mut self, bufs: &[(u64, u32)], token: T) -> Result<(), VirtqError> {
        self.add(bufs, &[], token, None)
    }

    pub fn add_inbuf(&mut self, bufs: &[(u64, u32)], token: T) -> Result<(), VirtqError> {
        self.add(&[], bufs, token, None)
    }

    pub fn add_inbuf_ctx(&mut self, bufs: &[(u64, u32)], token: T, ctx: C) -> Result<(), VirtqError> {
        self.add(&[], bufs, token, Some(ctx))
    }

    /// Map and publish one chain.
    ///
    /// On error nothing is published and every mapping made on the way is
    /// undone. Chains longer than one segment go through an indirect table
    /// when one is available, and fall back to direct descriptors when the
    /// table region is exhausted.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn add_chain(
        &mut self,
        chain: &BufferChain,
        token: T,
        ctx: Option<C>,
    ) -> Result<(), VirtqError> {
        self.check_broken()?;

        let n = chain.len();
        let packed = self.is_packed();

        // keep the batch window below 2^16 entries
        let cost = if packed { n } else { 1 };
        if self.engine.num_added() as usize + cost >= u16::MAX as usize {
            self.kick()?;
        }

        let free = self.engine.num_free() as usize;
        let want_indirect = free >= 1 && self.tables.as_ref().is_some_and(|t| t.accepts(n));
        if !want_indirect && n > free {
            return Err(VirtqError::OutOfDescriptors);
        }

        let mapped = map_chain(&self.dma, chain)?;

        let mut indirect = None;
        if want_indirect && let Some(tables) = self.tables.as_mut() {
            match tables.build(self.engine.mem(), &self.dma, &mapped, packed) {
                Ok(table) => indirect = Some(table),
                Err(VirtqError::MappingFailed) => {
                    mapped.unmap(&self.dma);
                    return Err(VirtqError::MappingFailed);
                }
                Err(e) => {
                    log::debug!(
                        "queue {}: no indirect table for {} segments ({}), using direct descriptors",
                        self.index,
                        n,
                        e
                    );
                    if n > free {
                        mapped.unmap(&self.dma);
                        return Err(VirtqError::OutOfDescriptors);
                    }
                }
            }
        }

        let id = match self.engine.add(&mapped, indirect.as_ref()) {
            Ok(id) => id,
            Err(e) => {
                if let (Some(table), Some(tables)) = (indirect, self.tables.as_mut()) {
                    tables.release(&self.dma, table);
                }
                mapped.unmap(&self.dma);
                return Err(e);
            }
        };

        let descs = if indirect.is_some() { 1 } else { n as u16 };
        log::trace!(
            "queue {}: added chain {} ({} segments, {} slots)",
            self.index,
            id,
            n,
            descs
        );

        self.in_flight_descs += descs as usize;
        if let Some(slot) = self.inflight.get_mut(id as usize) {
            *slot = Some(InFlight {
                token,
                ctx,
                mapped,
                indirect,
                descs,
            });
        }
        Ok(())
    }

    /// Does the device need a doorbell for the chains added since the last
    /// call?
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn kick_prepare(&mut self) -> Result<bool, VirtqError> {
        self.check_broken()?;
        self.engine.kick_prepare()
    }

    /// Ring the doorbell. A failed doorbell breaks the queue.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn notify(&mut self) -> bool {
        if self.check_broken().is_err() {
            return false;
        }
        if !self.notifier.notify(self.stats()) {
            log::error!("queue {}: doorbell write failed", self.index);
            self.broken = true;
            return false;
        }
        true
    }

    /// [`kick_prepare`](Self::kick_prepare) followed by
    /// [`notify`](Self::notify) when needed. Returns whether the doorbell
    /// was rung.
    pub fn kick(&mut self) -> Result<bool, VirtqError> {
        if !self.kick_prepare()? {
            return Ok(false);
        }
        if !self.notify() {
            return Err(VirtqError::QueueBroken);
        }
        Ok(true)
    }

    /// Is there a completion waiting?
    pub fn more_used(&mut self) -> Result<bool, VirtqError> {
        self.check_broken()?;
        self.engine.more_used()
    }

    /// Take one completed chain, returning its token and the number of bytes
    /// the device wrote.
    pub fn get_buf(&mut self) -> Result<Option<(T, u32)>, VirtqError> {
        Ok(self.get_buf_ctx()?.map(|(token, len, _)| (token, len)))
    }

    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn get_buf_ctx(&mut self) -> Result<Option<(T, u32, Option<C>)>, VirtqError> {
        self.check_broken()?;

        let used = match self.engine.pop_used() {
            Ok(Some(used)) => used,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.fail(e)),
        };

        let Some(entry) = self
            .inflight
            .get_mut(used.id as usize)
            .and_then(Option::take)
        else {
            return Err(self.fail(Violation::NotAHead { id: used.id }.into()));
        };

        log::trace!(
            "queue {}: chain {} completed with {} bytes",
            self.index,
            used.id,
            used.len
        );
        let (token, ctx) = self.release(entry);
        Ok(Some((token, used.len, ctx)))
    }

    fn release(&mut self, entry: InFlight<T, C>) -> (T, Option<C>) {
        entry.mapped.unmap(&self.dma);
        if let (Some(table), Some(tables)) = (entry.indirect, self.tables.as_mut()) {
            tables.release(&self.dma, table);
        }
        self.in_flight_descs -= entry.descs as usize;
        (entry.token, entry.ctx)
    }

    /// Ask the device not to interrupt. Best effort: an interrupt may still
    /// arrive.
    pub fn disable_callbacks(&mut self) -> Result<(), VirtqError> {
        self.check_broken()?;
        self.engine.disable_cb()
    }

    /// Re-arm interrupts and record the current position for
    /// [`poll`](Self::poll).
    pub fn enable_callbacks_prepare(&mut self) -> Result<CallbackState, VirtqError> {
        self.check_broken()?;
        self.engine.enable_cb_prepare().map(CallbackState)
    }

    /// Did the device complete anything after `state` was recorded?
    pub fn poll(&mut self, state: CallbackState) -> Result<bool, VirtqError> {
        self.check_broken()?;
        self.engine.poll(state.0)
    }

    /// Re-arm interrupts. Returns false if completions are already waiting,
    /// in which case the caller must drain the queue again.
    pub fn enable_callbacks(&mut self) -> Result<bool, VirtqError> {
        let state = self.enable_callbacks_prepare()?;
        Ok(!self.poll(state)?)
    }

    /// Re-arm interrupts for when most of the outstanding chains are done.
    /// Returns false if that point has already been passed.
    pub fn enable_callbacks_delayed(&mut self) -> Result<bool, VirtqError> {
        self.check_broken()?;
        self.engine.enable_cb_delayed()
    }

    /// Reclaim one outstanding chain that the device will never complete.
    ///
    /// Only valid once the device is quiesced (reset or never started).
    /// Works on a broken queue, but then ring memory is left alone.
    pub fn detach_unused_buf(&mut self) -> Option<T> {
        self.detach_unused_buf_ctx().map(|(token, _)| token)
    }

    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn detach_unused_buf_ctx(&mut self) -> Option<(T, Option<C>)> {
        let head = match self.engine.detach_unused(!self.broken) {
            Ok(head) => head,
            Err(e) => {
                log::warn!(
                    "queue {}: cannot rewind the ring while detaching ({}), reclaiming anyway",
                    self.index,
                    e
                );
                self.engine.detach_unused(false).ok().flatten()
            }
        }?;

        let entry = self.inflight.get_mut(head as usize).and_then(Option::take)?;
        log::trace!("queue {}: detached chain {}", self.index, head);
        Some(self.release(entry))
    }

    pub fn is_broken(&self) -> bool {
        self.broken || self.notifier.is_broken()
    }

    /// Stop using the queue, e.g. before a device reset.
    pub fn break_queue(&mut self) {
        if !self.broken {
            log::error!("queue {}: broken by the driver", self.index);
            self.broken = true;
        }
    }

    pub fn size(&self) -> u16 {
        self.layout.size()
    }

    pub fn num_free(&self) -> u16 {
        self.engine.num_free()
    }

    /// Descriptor slots held by outstanding chains.
    pub fn num_inflight(&self) -> usize {
        self.in_flight_descs
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            num_free: self.num_free() as usize,
            num_inflight: self.in_flight_descs,
        }
    }

    pub fn is_packed(&self) -> bool {
        self.layout.is_packed()
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    fn bus_addr(&self, addr: u64) -> u64 {
        self.ring_bus_addr + (addr - self.layout.base())
    }

    /// Device address of the descriptor table.
    pub fn desc_addr(&self) -> u64 {
        match self.layout {
            RingLayout::Split(l) => self.bus_addr(l.desc_table_addr),
            RingLayout::Packed(l) => self.bus_addr(l.desc_table_addr),
        }
    }

    /// Device address of the avail ring (split) or driver event area (packed).
    pub fn driver_area_addr(&self) -> u64 {
        match self.layout {
            RingLayout::Split(l) => self.bus_addr(l.avail_addr),
            RingLayout::Packed(l) => self.bus_addr(l.drv_evt_addr),
        }
    }

    /// Device address of the used ring (split) or device event area (packed).
    pub fn device_area_addr(&self) -> u64 {
        match self.layout {
            RingLayout::Split(l) => self.bus_addr(l.used_addr),
            RingLayout::Packed(l) => self.bus_addr(l.dev_evt_addr),
        }
    }
}

impl<M, D: DmaOps, N, T, C> Drop for Virtqueue<M, D, N, T, C> {
    fn drop(&mut self) {
        let mut outstanding = 0;
        for entry in self.inflight.iter_mut().filter_map(Option::take) {
            entry.mapped.unmap(&self.dma);
            if let (Some(table), Some(tables)) = (entry.indirect, self.tables.as_mut()) {
                tables.release(&self.dma, table);
            }
            outstanding += 1;
        }
        if outstanding > 0 {
            log::warn!(
                "queue {}: dropped with {} chains outstanding",
                self.index,
                outstanding
            );
        }
        self.dma
            .unmap(self.ring_bus_addr, self.ring_len, DmaDirection::Bidirectional);
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::RefCell;

    use super::*;
    use crate::indirect::INDIRECT_SLOT_SIZE;
    use crate::sim::{DeviceFault, OwnedRing, SimDevice, TestDma, TestMem, TestNotifier};
    use crate::{EventFlags, EventSuppression, IdentityDma, Region};

    type TestQueue = Virtqueue<Rc<TestMem>, TestDma, TestNotifier, u32, u32>;

    struct Harness {
        ring: OwnedRing,
        q: TestQueue,
        dev: SimDevice<Rc<TestMem>>,
        dma: TestDma,
        notifier: TestNotifier,
    }

    impl Harness {
        /// Ask the device side for a doorbell once entry `t` is published.
        fn request_kick_at(&self, t: u16) {
            match &self.dev {
                SimDevice::Split(d) => d.set_avail_event(t).unwrap(),
                SimDevice::Packed(d) => {
                    let size = self.q.size();
                    let mut evt = EventSuppression::new(0, EventFlags::DESC);
                    evt.set_desc_event(t % size, (t / size) % 2 == 0);
                    d.set_device_event(evt).unwrap();
                }
            }
        }

        fn avail_idx(&self) -> Option<u16> {
            match self.ring.layout() {
                RingLayout::Split(l) => Some(self.ring.mem().read_val(l.avail_idx_addr()).unwrap()),
                RingLayout::Packed(_) => None,
            }
        }
    }

    fn harness_with_region(config: QueueConfig, region_len: usize) -> Harness {
        let ring = OwnedRing::new(&config).unwrap();
        let config = if config.features().contains(Features::INDIRECT_DESC) {
            config.with_indirect_region(Region {
                base: ring.indirect_region().base,
                len: region_len,
            })
        } else {
            config
        };

        let dma = TestDma::new();
        let notifier = TestNotifier::new();
        let q = Virtqueue::new(config, ring.layout(), ring.mem(), dma.clone(), notifier.clone())
            .unwrap();
        let dev = SimDevice::new(ring.layout(), ring.mem(), config.event_idx());

        Harness {
            ring,
            q,
            dev,
            dma,
            notifier,
        }
    }

    fn harness(config: QueueConfig) -> Harness {
        harness_with_region(config, OwnedRing::INDIRECT_LEN)
    }

    fn split(size: u16) -> QueueConfig {
        QueueConfig::new(size)
    }

    fn packed(size: u16) -> QueueConfig {
        QueueConfig::new(size).with_features(Features::RING_PACKED)
    }

    fn with(config: QueueConfig, features: Features) -> QueueConfig {
        config.with_features(config.features() | features)
    }

    #[test]
    fn test_round_trip_returns_token_and_len() {
        for config in [split(8), packed(8)] {
            let mut h = harness(config);
            let (req, resp) = (h.ring.buf(0), h.ring.buf(1));
            h.ring.mem().write(req, b"ping").unwrap();

            h.q.add(&[(req, 4)], &[(resp, 64)], 7, None).unwrap();
            assert_eq!(h.q.num_free(), 6);
            assert!(h.q.kick().unwrap());
            assert_eq!(h.notifier.kicks(), 1);

            let chain = h.dev.poll_avail().unwrap().unwrap();
            assert_eq!(chain.elems.len(), 2);
            assert_eq!(chain.readable_len(), 4);
            assert_eq!(chain.writable_len(), 64);
            let mut data = [0u8; 4];
            h.ring.mem().read(chain.elems[0].addr, &mut data).unwrap();
            assert_eq!(&data, b"ping");

            let written = h.dev.fill(&chain, b"pong").unwrap();
            h.dev.complete(chain.id, written).unwrap();

            assert!(h.q.more_used().unwrap());
            assert_eq!(h.q.get_buf().unwrap(), Some((7, 4)));
            assert_eq!(h.q.get_buf().unwrap(), None);
            h.ring.mem().read(resp, &mut data).unwrap();
            assert_eq!(&data, b"pong");

            assert_eq!(h.q.num_free(), 8);
            assert_eq!(h.q.num_inflight(), 0);
            // only the ring itself is still mapped
            assert_eq!(h.dma.live(), 1);
            assert_eq!(h.dma.bad_unmaps(), 0);
        }
    }

    #[test]
    fn test_out_of_order_completion() {
        for config in [split(4), packed(4)] {
            let mut h = harness(config);
            let (a, b, c) = (0xA, 0xB, 0xC);
            for (i, token) in [a, b, c].into_iter().enumerate() {
                h.q.add_inbuf(&[(h.ring.buf(i), 64)], token).unwrap();
            }
            assert!(h.q.kick().unwrap());

            let chains = h.dev.poll_all().unwrap();
            assert_eq!(chains.len(), 3);
            h.dev.complete(chains[1].id, 20).unwrap();
            h.dev.complete(chains[0].id, 10).unwrap();
            h.dev.complete(chains[2].id, 30).unwrap();

            assert_eq!(h.q.get_buf().unwrap(), Some((b, 20)));
            assert_eq!(h.q.get_buf().unwrap(), Some((a, 10)));
            assert_eq!(h.q.get_buf().unwrap(), Some((c, 30)));
            assert_eq!(h.q.get_buf().unwrap(), None);
            assert_eq!(h.q.num_free(), 4);
        }
    }

    #[test]
    fn test_get_buf_without_completions_is_none() {
        for config in [split(4), packed(4)] {
            let mut h = harness(config);
            assert_eq!(h.q.get_buf().unwrap(), None);

            h.q.add_inbuf(&[(h.ring.buf(0), 8)], 1).unwrap();
            assert_eq!(h.q.get_buf().unwrap(), None);

            let chain = h.dev.poll_avail().unwrap().unwrap();
            h.dev.complete(chain.id, 8).unwrap();
            assert_eq!(h.q.get_buf().unwrap(), Some((1, 8)));
            for _ in 0..3 {
                assert_eq!(h.q.get_buf().unwrap(), None);
            }
            assert_eq!(h.q.num_free(), 4);
            assert!(!h.q.is_broken());
        }
    }

    #[test]
    fn test_context_returned_with_token() {
        let mut h = harness(split(4));
        h.q.add_inbuf_ctx(&[(h.ring.buf(0), 8)], 1, 0xC0FFEE).unwrap();
        let chain = h.dev.poll_avail().unwrap().unwrap();
        h.dev.complete(chain.id, 2).unwrap();
        assert_eq!(h.q.get_buf_ctx().unwrap(), Some((1, 2, Some(0xC0FFEE))));
    }

    #[test]
    fn test_full_ring_reports_out_of_descriptors() {
        for config in [split(4), packed(4)] {
            let mut h = harness(config);
            let segs: Vec<(u64, u32)> = (0..5).map(|i| (h.ring.buf(i), 8)).collect();
            assert_eq!(
                h.q.add_outbuf(&segs, 1),
                Err(VirtqError::OutOfDescriptors)
            );
            // nothing was mapped
            assert_eq!(h.dma.maps(), 1);

            for i in 0..4 {
                h.q.add_outbuf(&segs[i..i + 1], i as u32).unwrap();
            }
            assert_eq!(
                h.q.add_outbuf(&segs[..1], 9),
                Err(VirtqError::OutOfDescriptors)
            );
            assert_eq!(h.q.num_free(), 0);
            assert_eq!(h.q.num_inflight(), 4);
        }
    }

    #[test]
    fn test_add_rolls_back_on_mapping_failure() {
        for config in [split(8), packed(8)] {
            let mut h = harness(config);
            let avail_before = h.avail_idx();

            h.dma.fail_after(2);
            let r = h.q.add(
                &[(h.ring.buf(0), 8), (h.ring.buf(1), 8)],
                &[(h.ring.buf(2), 8)],
                1,
                None,
            );
            assert_eq!(r, Err(VirtqError::MappingFailed));

            assert_eq!(h.dma.live(), 1);
            assert_eq!(h.dma.bad_unmaps(), 0);
            assert_eq!(h.q.num_free(), 8);
            assert_eq!(h.avail_idx(), avail_before);
            assert!(h.dev.poll_avail().unwrap().is_none());

            // the queue is still usable
            h.q.add_inbuf(&[(h.ring.buf(0), 8)], 2).unwrap();
            assert!(h.dev.poll_avail().unwrap().is_some());
        }
    }

    #[test]
    fn test_indirect_chain_takes_one_slot() {
        for config in [split(4), packed(4)] {
            let mut h = harness(with(config, Features::INDIRECT_DESC));
            let out: Vec<(u64, u32)> = (0..5).map(|i| (h.ring.buf(i), 16)).collect();
            let in_: Vec<(u64, u32)> = (5..8).map(|i| (h.ring.buf(i), 32)).collect();

            // 8 segments on a ring of 4
            h.q.add(&out, &in_, 1, None).unwrap();
            assert_eq!(h.q.num_free(), 3);
            assert_eq!(h.q.num_inflight(), 1);

            let chain = h.dev.poll_avail().unwrap().unwrap();
            assert_eq!(chain.slots, 1);
            assert_eq!(chain.elems.len(), 8);
            assert_eq!(chain.elems[0].addr, h.ring.buf(0));
            assert!(chain.elems[7].writable);
            assert_eq!(chain.writable_len(), 96);

            h.dev.complete(chain.id, 96).unwrap();
            assert_eq!(h.q.get_buf().unwrap(), Some((1, 96)));
            assert_eq!(h.dma.live(), 1);
            assert_eq!(h.q.num_free(), 4);
        }
    }

    #[test]
    fn test_direct_chain_slots_match_segments() {
        for config in [split(4), packed(4)] {
            let mut h = harness(config);
            let out = [(h.ring.buf(0), 16)];
            let in_ = [(h.ring.buf(1), 16), (h.ring.buf(2), 16)];

            h.q.add(&out, &in_, 1, None).unwrap();
            assert_eq!(h.q.num_free(), 1);

            let chain = h.dev.poll_avail().unwrap().unwrap();
            assert_eq!(chain.slots, 3);
            assert_eq!(chain.elems.len(), 3);
            h.dev.complete(chain.id, 0).unwrap();
            assert_eq!(h.q.get_buf().unwrap(), Some((1, 0)));
        }
    }

    #[test]
    fn test_indirect_limit_exceeded_leaves_counters_unchanged() {
        for config in [split(4), packed(4)] {
            let config = with(config, Features::INDIRECT_DESC).with_max_indirect(4);
            let mut h = harness(config);

            h.q.add_inbuf(&[(h.ring.buf(0), 8), (h.ring.buf(1), 8), (h.ring.buf(2), 8)], 1)
                .unwrap();
            assert_eq!(h.q.num_free(), 3);
            let maps = h.dma.maps();
            let live = h.dma.live();

            // over both the table limit and the free slots
            let segs: Vec<(u64, u32)> = (0..6).map(|i| (h.ring.buf(i), 8)).collect();
            assert_eq!(h.q.add_outbuf(&segs, 2), Err(VirtqError::OutOfDescriptors));

            assert_eq!(h.q.num_free(), 3);
            assert_eq!(h.q.num_inflight(), 1);
            assert_eq!(h.dma.maps(), maps);
            assert_eq!(h.dma.live(), live);
        }
    }

    #[test]
    fn test_exhausted_table_region_falls_back_to_direct() {
        for config in [split(8), packed(8)] {
            // room for a single table
            let mut h = harness_with_region(
                with(config, Features::INDIRECT_DESC),
                INDIRECT_SLOT_SIZE,
            );

            h.q.add_inbuf(&[(h.ring.buf(0), 8), (h.ring.buf(1), 8)], 1)
                .unwrap();
            assert_eq!(h.q.num_free(), 7);
            h.q.add_inbuf(&[(h.ring.buf(2), 8), (h.ring.buf(3), 8)], 2)
                .unwrap();
            assert_eq!(h.q.num_free(), 5);
            assert_eq!(h.q.num_inflight(), 3);

            let chains = h.dev.poll_all().unwrap();
            assert_eq!(chains.len(), 2);
            assert_eq!(chains[0].slots, 1);
            assert_eq!(chains[1].slots, 2);
            assert_eq!(chains[1].elems.len(), 2);

            h.dev.complete(chains[0].id, 16).unwrap();
            h.dev.complete(chains[1].id, 16).unwrap();
            assert_eq!(h.q.get_buf().unwrap(), Some((1, 16)));
            assert_eq!(h.q.get_buf().unwrap(), Some((2, 16)));

            // the freed table is used again
            h.q.add_inbuf(&[(h.ring.buf(0), 8), (h.ring.buf(1), 8)], 3)
                .unwrap();
            assert_eq!(h.q.num_free(), 7);
        }
    }

    #[test]
    fn test_indirect_not_negotiated_without_region() {
        let ring = OwnedRing::new(&split(4)).unwrap();
        let config = with(split(4), Features::INDIRECT_DESC);
        let mut q: Virtqueue<_, _, _, u32> =
            Virtqueue::new(config, ring.layout(), ring.mem(), IdentityDma, TestNotifier::new())
                .unwrap();

        let segs: Vec<(u64, u32)> = (0..2).map(|i| (ring.buf(i), 8)).collect();
        q.add_outbuf(&segs, 1).unwrap();
        assert_eq!(q.num_free(), 2);
    }

    #[test]
    fn test_kick_suppressed_until_avail_event_across_wraps() {
        for config in [split(4), packed(4)] {
            let mut h = harness(with(config, Features::EVENT_IDX));
            let mut targets = [2u16, 5, 9, 10].into_iter();
            let mut next = targets.next();
            h.request_kick_at(2);

            let mut kicked = Vec::new();
            // three laps of a four entry ring
            for i in 0..12u16 {
                h.q.add_inbuf(&[(h.ring.buf(i as usize), 8)], i as u32)
                    .unwrap();
                if h.q.kick_prepare().unwrap() {
                    kicked.push(i);
                    next = targets.next();
                    if let Some(t) = next {
                        h.request_kick_at(t);
                    }
                }

                let chain = h.dev.poll_avail().unwrap().unwrap();
                h.dev.complete(chain.id, 0).unwrap();
                assert_eq!(h.q.get_buf().unwrap(), Some((i as u32, 0)));
            }

            assert_eq!(kicked, vec![2, 5, 9, 10]);
            assert!(next.is_none());
        }
    }

    #[test]
    fn test_interrupt_suppressed_until_used_event_across_wraps() {
        for config in [split(4), packed(4)] {
            let mut h = harness(with(config, Features::EVENT_IDX));
            let armed = [0usize, 5, 9];

            let mut fired = Vec::new();
            for round in 0..12 {
                if round != 0 && armed.contains(&round) {
                    h.q.enable_callbacks_prepare().unwrap();
                }
                h.q.add_inbuf(&[(h.ring.buf(round), 32)], round as u32)
                    .unwrap();

                let chain = h.dev.poll_avail().unwrap().unwrap();
                if h.dev.complete(chain.id, 8).unwrap() {
                    fired.push(round);
                }

                h.q.disable_callbacks().unwrap();
                assert_eq!(h.q.get_buf().unwrap(), Some((round as u32, 8)));
            }

            assert_eq!(fired, armed);
        }
    }

    #[test]
    fn test_no_notify_flag_suppresses_kick() {
        let mut h = harness(split(4));
        if let SimDevice::Split(d) = &h.dev {
            d.set_no_notify(true).unwrap();
        }
        h.q.add_inbuf(&[(h.ring.buf(0), 8)], 1).unwrap();
        assert!(!h.q.kick().unwrap());
        assert_eq!(h.notifier.kicks(), 0);

        let mut h = harness(packed(4));
        if let SimDevice::Packed(d) = &h.dev {
            d.set_device_event(EventSuppression::new(0, EventFlags::DISABLE))
                .unwrap();
        }
        h.q.add_inbuf(&[(h.ring.buf(0), 8)], 1).unwrap();
        assert!(!h.q.kick().unwrap());
    }

    #[test]
    fn test_poll_catches_completion_during_rearm() {
        for config in [split(8), packed(8)] {
            let mut h = harness(config);
            h.q.disable_callbacks().unwrap();
            h.q.add_inbuf(&[(h.ring.buf(0), 16)], 1).unwrap();

            let state = h.q.enable_callbacks_prepare().unwrap();
            assert!(!h.q.poll(state).unwrap());

            let chain = h.dev.poll_avail().unwrap().unwrap();
            h.dev.complete(chain.id, 4).unwrap();
            assert!(h.q.poll(state).unwrap());

            assert!(!h.q.enable_callbacks().unwrap());
            assert_eq!(h.q.get_buf().unwrap(), Some((1, 4)));
            assert!(h.q.enable_callbacks().unwrap());
        }
    }

    #[test]
    fn test_enable_callbacks_delayed() {
        for config in [split(8), packed(8)] {
            let mut h = harness(with(config, Features::EVENT_IDX));
            h.q.disable_callbacks().unwrap();
            for i in 0..4 {
                h.q.add_inbuf(&[(h.ring.buf(i), 8)], i as u32).unwrap();
            }
            assert!(h.q.enable_callbacks_delayed().unwrap());

            let chains = h.dev.poll_all().unwrap();
            let fired: Vec<bool> = chains
                .iter()
                .map(|c| h.dev.complete(c.id, 0).unwrap())
                .collect();
            // used event sits three entries past the last used one
            assert_eq!(fired, vec![false, false, false, true]);
            assert!(!h.q.enable_callbacks_delayed().unwrap());
        }
    }

    #[test]
    fn test_detach_unused_returns_every_token() {
        for config in [split(8), packed(8)] {
            let mut h = harness(with(config, Features::INDIRECT_DESC));
            h.q.add_inbuf(&[(h.ring.buf(0), 8)], 1).unwrap();
            h.q.add_inbuf(&[(h.ring.buf(1), 8), (h.ring.buf(2), 8)], 2)
                .unwrap();
            h.q.add_outbuf(&[(h.ring.buf(3), 8)], 3).unwrap();

            let mut tokens = Vec::new();
            while let Some(t) = h.q.detach_unused_buf() {
                tokens.push(t);
            }
            tokens.sort();
            assert_eq!(tokens, vec![1, 2, 3]);
            assert_eq!(h.q.num_free(), 8);
            assert_eq!(h.q.num_inflight(), 0);
            assert_eq!(h.dma.live(), 1);
            if let Some(idx) = h.avail_idx() {
                assert_eq!(idx, 0);
            }
        }
    }

    #[test]
    fn test_ring_addresses_exposed_for_transport() {
        let h = harness(split(8));
        let RingLayout::Split(l) = h.ring.layout() else {
            panic!("expected split layout");
        };
        assert_eq!(h.q.desc_addr(), l.desc_table_addr);
        assert_eq!(h.q.driver_area_addr(), l.avail_addr);
        assert_eq!(h.q.device_area_addr(), l.used_addr);

        let h = harness(packed(8));
        let RingLayout::Packed(l) = h.ring.layout() else {
            panic!("expected packed layout");
        };
        assert_eq!(h.q.desc_addr(), l.desc_table_addr);
        assert_eq!(h.q.driver_area_addr(), l.drv_evt_addr);
        assert_eq!(h.q.device_area_addr(), l.dev_evt_addr);
        assert!(h.q.is_packed());
    }

    #[test]
    fn test_drop_unmaps_ring_and_outstanding_chains() {
        let mut h = harness(split(8));
        h.q.add_inbuf(&[(h.ring.buf(0), 8)], 1).unwrap();
        assert_eq!(h.dma.live(), 2);

        let dma = h.dma.clone();
        drop(h);
        assert_eq!(dma.live(), 0);
        assert_eq!(dma.bad_unmaps(), 0);
    }

    #[test]
    fn test_mismatched_layout_rejected() {
        let ring = OwnedRing::new(&split(8)).unwrap();
        let r: Result<Virtqueue<_, _, _, u32>, _> =
            Virtqueue::new(split(4), ring.layout(), ring.mem(), IdentityDma, TestNotifier::new());
        assert!(matches!(r, Err(VirtqError::InvalidLayout)));

        let r: Result<Virtqueue<_, _, _, u32>, _> =
            Virtqueue::new(packed(8), ring.layout(), ring.mem(), IdentityDma, TestNotifier::new());
        assert!(matches!(r, Err(VirtqError::InvalidLayout)));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_batch_window_forces_kick() {
        let mut h = harness(split(4));
        for i in 0..u16::MAX as u32 {
            h.q.add_inbuf(&[(h.ring.buf(0), 8)], i).unwrap();
            let chain = h.dev.poll_avail().unwrap().unwrap();
            h.dev.complete(chain.id, 0).unwrap();
            assert_eq!(h.q.get_buf().unwrap(), Some((i, 0)));
        }
        assert_eq!(h.notifier.kicks(), 1);
    }

    fn assert_broken(h: &mut Harness) {
        assert!(h.q.is_broken());
        assert_eq!(
            h.q.add_inbuf(&[(h.ring.buf(0), 8)], 99),
            Err(VirtqError::QueueBroken)
        );
        assert_eq!(h.q.kick_prepare(), Err(VirtqError::QueueBroken));
        assert_eq!(h.q.kick(), Err(VirtqError::QueueBroken));
        assert!(!h.q.notify());
        assert_eq!(h.q.get_buf(), Err(VirtqError::QueueBroken));
        assert_eq!(h.q.more_used(), Err(VirtqError::QueueBroken));
        assert_eq!(h.q.disable_callbacks(), Err(VirtqError::QueueBroken));
        assert_eq!(
            h.q.enable_callbacks_prepare(),
            Err(VirtqError::QueueBroken)
        );
        assert_eq!(
            h.q.enable_callbacks_delayed(),
            Err(VirtqError::QueueBroken)
        );
    }

    /// Submit token 1, let the device take it, then misbehave.
    fn misbehave(config: QueueConfig, fault: DeviceFault) -> (Harness, VirtqError) {
        let mut h = harness(config);
        h.q.add(&[(h.ring.buf(0), 8)], &[(h.ring.buf(1), 16)], 1, None)
            .unwrap();
        h.dev.poll_avail().unwrap().unwrap();
        h.dev.inject(fault).unwrap();

        let err = h.q.get_buf().unwrap_err();
        (h, err)
    }

    #[test]
    fn bad_device_id_out_of_range() {
        for config in [split(4), packed(4)] {
            let (mut h, err) = misbehave(config, DeviceFault::IdOutOfRange(100));
            assert!(matches!(
                err,
                VirtqError::DeviceProtocolViolation(Violation::IdOutOfRange { id: 100, size: 4 })
            ));
            assert_broken(&mut h);
        }
    }

    #[test]
    fn bad_device_completes_chain_tail() {
        for config in [split(4), packed(4)] {
            // the chain holds ids 0 and 1
            let (mut h, err) = misbehave(config, DeviceFault::RawId(1));
            assert!(matches!(
                err,
                VirtqError::DeviceProtocolViolation(Violation::NotAHead { id: 1 })
            ));
            assert_broken(&mut h);
        }
    }

    #[test]
    fn bad_device_overlong_completion() {
        for config in [split(4), packed(4)] {
            let (mut h, err) = misbehave(config, DeviceFault::Overlong);
            assert!(matches!(
                err,
                VirtqError::DeviceProtocolViolation(Violation::UsedLenTooLarge {
                    len: 17,
                    capacity: 16,
                    ..
                })
            ));
            assert_broken(&mut h);
        }
    }

    #[test]
    fn bad_device_used_index_jump() {
        let (mut h, err) = misbehave(split(4), DeviceFault::IndexJump(3));
        assert!(matches!(
            err,
            VirtqError::DeviceProtocolViolation(Violation::UsedIndexAhead { .. })
        ));
        assert_broken(&mut h);
    }

    #[test]
    fn bad_device_double_completion() {
        for config in [split(4), packed(4)] {
            let mut h = harness(config);
            h.q.add_inbuf(&[(h.ring.buf(0), 8)], 1).unwrap();
            let chain = h.dev.poll_avail().unwrap().unwrap();
            h.dev.complete(chain.id, 8).unwrap();
            assert_eq!(h.q.get_buf().unwrap(), Some((1, 8)));

            h.dev.inject(DeviceFault::Replay).unwrap();
            assert!(matches!(
                h.q.get_buf(),
                Err(VirtqError::DeviceProtocolViolation(Violation::NotAHead { .. }))
            ));
            assert_broken(&mut h);
            assert_eq!(h.q.num_free(), 4);
        }
    }

    #[test]
    fn bad_device_broken_queue_still_detaches() {
        for config in [split(4), packed(4)] {
            let (mut h, _) = misbehave(config, DeviceFault::IdOutOfRange(7));
            h.q.add_inbuf(&[(h.ring.buf(2), 8)], 2).unwrap_err();
            let avail_before = h.avail_idx();

            assert_eq!(h.q.detach_unused_buf(), Some(1));
            assert_eq!(h.q.detach_unused_buf(), None);
            assert_eq!(h.q.num_free(), 4);
            assert_eq!(h.dma.live(), 1);
            // ring memory is left alone
            assert_eq!(h.avail_idx(), avail_before);
        }
    }

    #[test]
    fn test_transport_removal_breaks_queue() {
        let mut h = harness(packed(4));
        h.notifier.set_broken(true);
        assert_broken(&mut h);
        assert_eq!(h.notifier.kicks(), 0);
    }

    #[test]
    fn test_notify_after_transport_removal_skips_doorbell() {
        for config in [split(4), packed(4)] {
            let mut h = harness(config);
            h.q.add_inbuf(&[(h.ring.buf(0), 8)], 1).unwrap();
            h.notifier.set_broken(true);

            assert!(!h.q.notify());
            assert_eq!(h.notifier.kicks(), 0);
            assert_eq!(h.q.kick(), Err(VirtqError::QueueBroken));
            assert_eq!(h.notifier.kicks(), 0);
        }
    }

    #[test]
    fn test_failed_doorbell_breaks_queue() {
        let mut h = harness(split(4));
        h.q.add_inbuf(&[(h.ring.buf(0), 8)], 1).unwrap();
        h.notifier.set_fail(true);
        assert_eq!(h.q.kick(), Err(VirtqError::QueueBroken));
        assert_eq!(
            h.notifier.last_stats(),
            Some(QueueStats {
                num_free: 3,
                num_inflight: 1
            })
        );
        assert_broken(&mut h);
    }

    #[test]
    fn test_break_queue_is_sticky() {
        let mut h = harness(split(4));
        h.q.break_queue();
        assert_broken(&mut h);
    }

    #[test]
    fn bad_device_violation_is_logged() {
        use hyperlight_testing::simplelogger::{LOGGER, SimpleLogger};
        use log::Level;

        SimpleLogger::initialize_test_logger();
        let (h, _) = misbehave(split(4).with_index(4242), DeviceFault::IdOutOfRange(9));
        assert!(h.q.is_broken());

        LOGGER.test_log_records(|logs| {
            assert!(logs.iter().any(|l| l.level == Level::Error
                && l.args.contains("queue 4242")
                && l.args.contains("protocol violation")));
        });
    }

    /// Records every write to ring memory.
    struct Recorder {
        inner: Rc<TestMem>,
        writes: RefCell<Vec<(u64, bool)>>,
    }

    impl MemOps for Rc<Recorder> {
        type Error = <Rc<TestMem> as MemOps>::Error;

        fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
            self.inner.read(addr, dst)
        }

        fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
            self.writes.borrow_mut().push((addr, false));
            self.inner.write(addr, src)
        }

        fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
            self.inner.load_acquire(addr)
        }

        fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
            self.writes.borrow_mut().push((addr, true));
            self.inner.store_release(addr, val)
        }
    }

    #[test]
    fn test_publish_is_last_write_of_add() {
        for (config, indirect) in [
            (split(8), false),
            (with(split(8), Features::INDIRECT_DESC), true),
            (packed(8), false),
            (with(packed(8), Features::INDIRECT_DESC), true),
        ] {
            let ring = OwnedRing::new(&config).unwrap();
            let config = if indirect {
                config.with_indirect_region(ring.indirect_region())
            } else {
                config
            };
            let mem = Rc::new(Recorder {
                inner: ring.mem(),
                writes: RefCell::new(Vec::new()),
            });
            let mut q: Virtqueue<_, _, _, u32> =
                Virtqueue::new(config, ring.layout(), mem.clone(), IdentityDma, TestNotifier::new())
                    .unwrap();

            // second chain starts at slot 3 of the packed ring
            for token in 0..2 {
                mem.writes.borrow_mut().clear();
                q.add(
                    &[(ring.buf(0), 8), (ring.buf(1), 8)],
                    &[(ring.buf(2), 8)],
                    token,
                    None,
                )
                .unwrap();

                let writes = mem.writes.borrow();
                let releases: Vec<_> = writes.iter().filter(|w| w.1).collect();
                assert_eq!(releases.len(), 1);

                let publish = match ring.layout() {
                    RingLayout::Split(l) => l.avail_idx_addr(),
                    RingLayout::Packed(l) => {
                        let slot = if indirect { token as u64 } else { 3 * token as u64 };
                        l.desc_table_addr + 16 * slot + 14
                    }
                };
                assert_eq!(writes.last(), Some(&(publish, true)));
            }
        }
    }

    mod fuzz {
        use alloc::collections::BTreeSet;

        use quickcheck::{Arbitrary, Gen, QuickCheck};

        use super::*;
        use crate::sim::DeviceChain;

        const MAX_OPS: usize = 128;

        #[derive(Clone, Debug)]
        enum Op {
            /// add a chain of `out` readable and `in_` writable segments
            Add { out: u8, in_: u8 },
            Kick,
            /// device takes up to N chains
            DevicePoll(u8),
            /// device completes one taken chain, picked by index
            DeviceComplete(u8),
            /// driver reclaims up to N completions
            GetBuf(u8),
            DisableCallbacks,
            EnableCallbacks,
        }

        impl Arbitrary for Op {
            fn arbitrary(g: &mut Gen) -> Self {
                match u8::arbitrary(g) % 7 {
                    0 => Op::Add {
                        out: u8::arbitrary(g) % 4,
                        in_: u8::arbitrary(g) % 4,
                    },
                    1 => Op::Kick,
                    2 => Op::DevicePoll(u8::arbitrary(g) % 4 + 1),
                    3 => Op::DeviceComplete(u8::arbitrary(g)),
                    4 => Op::GetBuf(u8::arbitrary(g) % 4 + 1),
                    5 => Op::DisableCallbacks,
                    _ => Op::EnableCallbacks,
                }
            }
        }

        #[derive(Clone, Debug)]
        struct Scenario {
            packed: bool,
            size: u16,
            features: Features,
            detach_at_end: bool,
            ops: Vec<Op>,
        }

        impl Arbitrary for Scenario {
            fn arbitrary(g: &mut Gen) -> Self {
                let packed = bool::arbitrary(g);
                let size = if packed {
                    u16::arbitrary(g) % 16 + 1
                } else {
                    1 << (u8::arbitrary(g) % 5)
                };
                let mut features = Features::empty();
                features.set(Features::RING_PACKED, packed);
                features.set(Features::EVENT_IDX, bool::arbitrary(g));
                features.set(Features::INDIRECT_DESC, bool::arbitrary(g));

                let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
                let ops = (0..num_ops).map(|_| Op::arbitrary(g)).collect();
                Scenario {
                    packed,
                    size,
                    features,
                    detach_at_end: bool::arbitrary(g),
                    ops,
                }
            }
        }

        fn run_scenario(s: Scenario) -> bool {
            let config = QueueConfig::new(s.size).with_features(s.features);
            let mut h = harness(config);
            let size = s.size as usize;

            let mut next_token = 0u32;
            let mut outstanding: BTreeSet<u32> = BTreeSet::new();
            let mut taken: Vec<DeviceChain> = Vec::new();

            for op in &s.ops {
                match *op {
                    Op::Add { out, in_ } => {
                        let out: Vec<_> = (0..out as usize).map(|i| (h.ring.buf(i), 8)).collect();
                        let in_: Vec<_> =
                            (0..in_ as usize).map(|i| (h.ring.buf(4 + i), 16)).collect();
                        let free_before = h.q.num_free();

                        match h.q.add(&out, &in_, next_token, None) {
                            Ok(()) => {
                                outstanding.insert(next_token);
                            }
                            Err(VirtqError::OutOfDescriptors) | Err(VirtqError::EmptyChain) => {
                                if h.q.num_free() != free_before {
                                    return false;
                                }
                            }
                            Err(_) => return false,
                        }
                        next_token += 1;
                    }
                    Op::Kick => {
                        if h.q.kick().is_err() {
                            return false;
                        }
                    }
                    Op::DevicePoll(n) => {
                        for _ in 0..n {
                            match h.dev.poll_avail() {
                                Ok(Some(c)) => taken.push(c),
                                Ok(None) => break,
                                Err(_) => return false,
                            }
                        }
                    }
                    Op::DeviceComplete(pick) => {
                        if !taken.is_empty() {
                            let c = taken.remove(pick as usize % taken.len());
                            let len = (c.writable_len() as u32).min(pick as u32);
                            if h.dev.complete(c.id, len).is_err() {
                                return false;
                            }
                        }
                    }
                    Op::GetBuf(n) => {
                        for _ in 0..n {
                            match h.q.get_buf() {
                                // a token is returned once, and only if it was given
                                Ok(Some((t, _))) => {
                                    if !outstanding.remove(&t) {
                                        return false;
                                    }
                                }
                                Ok(None) => break,
                                Err(_) => return false,
                            }
                        }
                    }
                    Op::DisableCallbacks => {
                        if h.q.disable_callbacks().is_err() {
                            return false;
                        }
                    }
                    Op::EnableCallbacks => {
                        if h.q.enable_callbacks().is_err() {
                            return false;
                        }
                    }
                }

                if h.q.num_free() as usize + h.q.num_inflight() != size {
                    return false;
                }
            }

            if s.detach_at_end {
                while let Some(t) = h.q.detach_unused_buf() {
                    if !outstanding.remove(&t) {
                        return false;
                    }
                }
            } else {
                loop {
                    match h.dev.poll_avail() {
                        Ok(Some(c)) => taken.push(c),
                        Ok(None) => break,
                        Err(_) => return false,
                    }
                }
                for c in taken.drain(..) {
                    if h.dev.complete(c.id, 0).is_err() {
                        return false;
                    }
                }
                loop {
                    match h.q.get_buf() {
                        Ok(Some((t, _))) => {
                            if !outstanding.remove(&t) {
                                return false;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => return false,
                    }
                }
            }

            outstanding.is_empty()
                && h.q.num_free() as usize == size
                && h.q.num_inflight() == 0
                && h.dma.live() == 1
                && h.dma.bad_unmaps() == 0
                && !h.q.is_broken()
        }

        #[test]
        fn prop_capacity_and_tokens() {
            #[cfg(miri)]
            let tests = 1;
            #[cfg(not(miri))]
            let tests = 100;

            QuickCheck::new()
                .tests(tests)
                .quickcheck(run_scenario as fn(Scenario) -> bool);
        }
    }
}
