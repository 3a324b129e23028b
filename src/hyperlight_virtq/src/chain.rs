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

//! Scatter-gather buffer chains.
//!
//! A chain lists the segments of one request in submission order: every
//! device-readable segment comes before every device-writable one. The
//! builder enforces that order in its type.

use core::marker::PhantomData;

use smallvec::SmallVec;

use super::VirtqError;

/// One contiguous buffer of a chain, as the driver addresses it.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BufferElement {
    pub addr: u64,
    pub len: u32,
    /// Device writes into this segment
    pub writable: bool,
}

impl From<(u64, u32)> for BufferElement {
    fn from((addr, len): (u64, u32)) -> Self {
        Self {
            addr,
            len,
            writable: false,
        }
    }
}

impl From<&(u64, u32)> for BufferElement {
    fn from(&(addr, len): &(u64, u32)) -> Self {
        (addr, len).into()
    }
}

/// Builder state before the first device-writable segment.
#[derive(Debug)]
pub enum Out {}

/// Builder state once a device-writable segment was pushed.
#[derive(Debug)]
pub enum In {}

type Segments = SmallVec<[BufferElement; 16]>;

/// Collects segments for a [`BufferChain`].
///
/// Pushing the first writable segment moves the builder to [`In`], which has
/// no way to push a readable one.
#[derive(Debug)]
pub struct ChainBuilder<S> {
    segs: Segments,
    num_out: usize,
    _state: PhantomData<S>,
}

impl Default for ChainBuilder<Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ChainBuilder<S> {
    fn push(&mut self, addr: u64, len: u32, writable: bool) {
        self.segs.push(BufferElement {
            addr,
            len,
            writable,
        });
    }

    fn into_state<T>(self) -> ChainBuilder<T> {
        ChainBuilder {
            segs: self.segs,
            num_out: self.num_out,
            _state: PhantomData,
        }
    }

    /// Finish the chain. Fails when nothing was pushed or when the chain
    /// could never fit a ring.
    pub fn build(self) -> Result<BufferChain, VirtqError> {
        match self.segs.len() {
            0 => Err(VirtqError::EmptyChain),
            n if n > u16::MAX as usize => Err(VirtqError::OutOfDescriptors),
            _ => Ok(BufferChain {
                segs: self.segs,
                num_out: self.num_out,
            }),
        }
    }
}

impl ChainBuilder<Out> {
    pub fn new() -> Self {
        Self {
            segs: SmallVec::new(),
            num_out: 0,
            _state: PhantomData,
        }
    }

    /// Push a segment the device reads.
    pub fn readable(mut self, addr: u64, len: u32) -> Self {
        self.push(addr, len, false);
        self.num_out += 1;
        self
    }

    pub fn readables<I>(self, segs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<BufferElement>,
    {
        segs.into_iter().fold(self, |b, seg| {
            let seg = seg.into();
            b.readable(seg.addr, seg.len)
        })
    }

    /// Push a segment the device writes. No readable segment may follow.
    pub fn writable(self, addr: u64, len: u32) -> ChainBuilder<In> {
        self.into_state::<In>().writable(addr, len)
    }

    pub fn writables<I>(self, segs: I) -> ChainBuilder<In>
    where
        I: IntoIterator,
        I::Item: Into<BufferElement>,
    {
        self.into_state::<In>().writables(segs)
    }
}

impl ChainBuilder<In> {
    pub fn writable(mut self, addr: u64, len: u32) -> Self {
        self.push(addr, len, true);
        self
    }

    pub fn writables<I>(self, segs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<BufferElement>,
    {
        segs.into_iter().fold(self, |b, seg| {
            let seg = seg.into();
            b.writable(seg.addr, seg.len)
        })
    }
}

/// Segments of one request, readable ones first.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferChain {
    segs: Segments,
    num_out: usize,
}

impl BufferChain {
    pub fn builder() -> ChainBuilder<Out> {
        ChainBuilder::new()
    }

    /// Chain of device-readable `out` and device-writable `in_` segments,
    /// given as `(addr, len)` pairs.
    pub fn new(out: &[(u64, u32)], in_: &[(u64, u32)]) -> Result<Self, VirtqError> {
        Self::builder().readables(out).writables(in_).build()
    }

    pub fn elems(&self) -> &[BufferElement] {
        &self.segs
    }

    pub fn readables(&self) -> &[BufferElement] {
        &self.segs[..self.num_out]
    }

    pub fn writables(&self) -> &[BufferElement] {
        &self.segs[self.num_out..]
    }

    /// Number of segments. Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.segs.len()
    }

    /// Total bytes the device may write.
    pub fn writable_len(&self) -> u64 {
        self.writables().iter().map(|e| u64::from(e.len)).sum()
    }
}
