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

//! Shared Memory Access
//!
//! The rings live in memory that the device reads and writes concurrently.
//! [`MemOps`] is the only path the queue uses to touch that memory, which lets
//! a backend translate addresses (guest physical, host mapped, test arena) and
//! lets the test suites observe or model every access.

use core::sync::atomic::{Ordering, fence};

use bytemuck::Pod;

/// Backend-provided access to ring and buffer memory.
///
/// # Safety
///
/// An implementation guarantees:
/// - addresses handed to the queue at construction stay valid for its lifetime
/// - `load_acquire`/`store_release` are real atomic operations on naturally
///   aligned 16 bit words
/// - plain reads and writes do not tear individual bytes
pub trait MemOps {
    type Error;

    /// Read `dst.len()` bytes starting at `addr`.
    ///
    /// Returns the number of bytes read, which equals `dst.len()` on success.
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write `src` starting at `addr`.
    ///
    /// Returns the number of bytes written, which equals `src.len()` on success.
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Acquire load of the 16 bit word at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` is 2 byte aligned and backed by shared memory.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Release store of the 16 bit word at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` is 2 byte aligned and backed by shared memory.
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Full barrier ordering earlier stores before later loads.
    ///
    /// Release/acquire alone does not keep a store to the avail index from
    /// passing a following load of the device's suppression word.
    fn mb(&self) {
        fence(Ordering::SeqCst);
    }

    /// Read a Pod value at `addr`.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod value at `addr`.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }

    /// Zero `len` bytes starting at `addr`.
    fn zero(&self, addr: u64, len: usize) -> Result<(), Self::Error> {
        const CHUNK: usize = 64;
        let zeroes = [0u8; CHUNK];

        let mut off = 0;
        while off < len {
            let n = core::cmp::min(CHUNK, len - off);
            self.write(addr + off as u64, &zeroes[..n])?;
            off += n;
        }
        Ok(())
    }
}
