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

//! Slot allocator for the indirect table region.
//!
//! The region is cut into slots of `N` bytes tracked by one bit each. A
//! table takes the smallest run of consecutive slots that holds it. Search
//! is next-fit: it resumes after the last allocation, so tables freed in
//! completion order are not handed out again straight away while the
//! device may still be prefetching them.

use fixedbitset::FixedBitSet;
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("region base {0:#x} is not slot aligned")]
    Misaligned(u64),
    #[error("region holds no complete slot")]
    EmptyRegion,
    #[error("zero length allocation")]
    ZeroLength,
    #[error("no run of {0} free slots")]
    Exhausted(usize),
    #[error("free of {0:#x} does not match a live allocation")]
    BadFree(u64),
}

/// A run of slots handed out by [`Slab::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub addr: u64,
    /// Whole slots, so at least the requested length
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct Slab<const N: usize> {
    base: u64,
    used: FixedBitSet,
    /// First slot of every live run
    heads: FixedBitSet,
    /// First slot the next search looks at
    cursor: usize,
}

impl<const N: usize> Slab<N> {
    /// Manage `[base, base + len)`. A partial trailing slot is ignored.
    pub fn new(base: u64, len: usize) -> Result<Self, AllocError> {
        if N == 0 || !base.is_multiple_of(N as u64) {
            return Err(AllocError::Misaligned(base));
        }
        let slots = len / N.max(1);
        if slots == 0 {
            return Err(AllocError::EmptyRegion);
        }
        Ok(Self {
            base,
            used: FixedBitSet::with_capacity(slots),
            heads: FixedBitSet::with_capacity(slots),
            cursor: 0,
        })
    }

    fn slots(&self) -> usize {
        self.used.len()
    }

    fn run_is_free(&self, start: usize, n: usize) -> bool {
        start + n <= self.slots() && self.used.count_ones(start..start + n) == 0
    }

    pub fn alloc(&mut self, len: usize) -> Result<Allocation, AllocError> {
        if len == 0 {
            return Err(AllocError::ZeroLength);
        }
        let need = len.div_ceil(N);
        let slots = self.slots();
        if need > slots {
            return Err(AllocError::Exhausted(need));
        }

        let start = (self.cursor..slots)
            .chain(0..self.cursor)
            .find(|&s| self.run_is_free(s, need))
            .ok_or(AllocError::Exhausted(need))?;

        self.used.insert_range(start..start + need);
        self.heads.insert(start);
        self.cursor = (start + need) % slots;
        Ok(Allocation {
            addr: self.base + (start * N) as u64,
            len: need * N,
        })
    }

    /// Return a run. Anything that is not exactly a live run is refused.
    pub fn dealloc(&mut self, alloc: Allocation) -> Result<(), AllocError> {
        let bad = AllocError::BadFree(alloc.addr);
        let off = alloc.addr.checked_sub(self.base).ok_or(bad)? as usize;
        if alloc.len == 0 || !off.is_multiple_of(N) || !alloc.len.is_multiple_of(N) {
            return Err(bad);
        }
        let (start, n) = (off / N, alloc.len / N);
        if !self.is_live_run(start, n) {
            return Err(bad);
        }
        self.used.remove_range(start..start + n);
        self.heads.set(start, false);
        Ok(())
    }

    /// `[start, start + n)` is one whole run: it opens with a head, holds no
    /// other head, is fully used and the slot after it is not part of it.
    fn is_live_run(&self, start: usize, n: usize) -> bool {
        let end = start + n;
        end <= self.slots()
            && self.heads.contains(start)
            && self.heads.count_ones(start + 1..end) == 0
            && self.used.count_ones(start..end) == n
            && (end == self.slots() || !self.used.contains(end) || self.heads.contains(end))
    }

    pub fn free_bytes(&self) -> usize {
        self.used.count_zeroes(..) * N
    }

    pub fn capacity(&self) -> usize {
        self.slots() * N
    }
}
