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

//! DMA mapping collaborator.
//!
//! The queue never translates addresses itself. Every segment is mapped through
//! [`DmaOps`] before its bus address is written into a descriptor, and unmapped
//! again when the chain is detached.

use smallvec::SmallVec;

use crate::chain::BufferChain;
use crate::error::VirtqError;

/// Direction of a DMA mapping, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// Device reads the buffer.
    ToDevice,
    /// Device writes the buffer.
    FromDevice,
    /// Device reads and writes (ring memory).
    Bidirectional,
}

impl DmaDirection {
    pub(crate) fn for_segment(writable: bool) -> Self {
        if writable {
            Self::FromDevice
        } else {
            Self::ToDevice
        }
    }
}

/// Address translation provided by the transport.
pub trait DmaOps {
    type Error: core::fmt::Debug;

    /// Map `len` bytes at driver address `addr`, returning the bus address
    /// the device must use.
    fn map(&self, addr: u64, len: u32, dir: DmaDirection) -> Result<u64, Self::Error>;

    /// Undo a mapping returned by [`map`](Self::map).
    fn unmap(&self, bus_addr: u64, len: u32, dir: DmaDirection);
}

impl<T: DmaOps + ?Sized> DmaOps for &T {
    type Error = T::Error;

    fn map(&self, addr: u64, len: u32, dir: DmaDirection) -> Result<u64, Self::Error> {
        (**self).map(addr, len, dir)
    }

    fn unmap(&self, bus_addr: u64, len: u32, dir: DmaDirection) {
        (**self).unmap(bus_addr, len, dir)
    }
}

/// Mapping for transports where driver addresses are already bus addresses,
/// e.g. a shared memory region set up by the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDma;

impl DmaOps for IdentityDma {
    type Error = core::convert::Infallible;

    fn map(&self, addr: u64, _len: u32, _dir: DmaDirection) -> Result<u64, Self::Error> {
        Ok(addr)
    }

    fn unmap(&self, _bus_addr: u64, _len: u32, _dir: DmaDirection) {}
}

/// Driver-private record of one mapped segment.
///
/// Kept outside shared memory so that detaching a chain never depends on
/// anything the device could have rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescExtra {
    pub bus_addr: u64,
    pub len: u32,
    pub writable: bool,
}

impl DescExtra {
    pub(crate) fn unmap<D: DmaOps>(&self, dma: &D) {
        dma.unmap(
            self.bus_addr,
            self.len,
            DmaDirection::for_segment(self.writable),
        );
    }
}

/// A chain whose segments have all been mapped.
#[derive(Debug, Default)]
pub(crate) struct MappedChain {
    pub(crate) segs: SmallVec<[DescExtra; 16]>,
}

impl MappedChain {
    pub(crate) fn len(&self) -> usize {
        self.segs.len()
    }

    /// Total bytes the device may write into this chain.
    pub(crate) fn writable_len(&self) -> u64 {
        self.segs
            .iter()
            .filter(|s| s.writable)
            .map(|s| s.len as u64)
            .sum()
    }

    /// Unmap every segment in reverse order.
    pub(crate) fn unmap<D: DmaOps>(&self, dma: &D) {
        for seg in self.segs.iter().rev() {
            seg.unmap(dma);
        }
    }
}

/// Map every segment of `chain`; on failure nothing stays mapped.
pub(crate) fn map_chain<D: DmaOps>(dma: &D, chain: &BufferChain) -> Result<MappedChain, VirtqError> {
    let mut mapped = MappedChain::default();

    for elem in chain.elems() {
        let dir = DmaDirection::for_segment(elem.writable);
        match dma.map(elem.addr, elem.len, dir) {
            Ok(bus_addr) => mapped.segs.push(DescExtra {
                bus_addr,
                len: elem.len,
                writable: elem.writable,
            }),
            Err(e) => {
                log::debug!(
                    "dma map of {:#x}+{} failed: {:?}, unwinding {} mappings",
                    elem.addr,
                    elem.len,
                    e,
                    mapped.len()
                );
                mapped.unmap(dma);
                return Err(VirtqError::MappingFailed);
            }
        }
    }

    Ok(mapped)
}
