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

//! Indirect descriptor tables.
//!
//! A chain of `n` segments can be described by one ring slot pointing at a
//! table of `n` descriptors. Tables are carved from a driver-owned region by
//! a [`Slab`] and live exactly as long as the chain they describe.

use super::dma::MappedChain;
use super::{
    Allocation, DescFlags, Descriptor, DmaDirection, DmaOps, MemOps, Region, Slab,
    SplitDescriptor, VirtqError,
};

/// Slot size of the table slab: room for 16 descriptors.
pub const INDIRECT_SLOT_SIZE: usize = 256;

/// A live table, owned by the ring slot that points at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectTable {
    alloc: Allocation,
    /// Device-visible address of the table
    pub bus_addr: u64,
    /// Table length in bytes
    pub len: u32,
}

#[derive(Debug)]
pub struct IndirectTables {
    slab: Slab<INDIRECT_SLOT_SIZE>,
    max_indirect: u16,
}

impl IndirectTables {
    pub fn new(region: Region, max_indirect: u16) -> Result<Self, VirtqError> {
        let slab = Slab::new(region.base, region.len)?;
        Ok(Self { slab, max_indirect })
    }

    /// Should a chain of `segs` segments go through a table?
    pub fn accepts(&self, segs: usize) -> bool {
        segs > 1 && segs <= self.max_indirect as usize
    }

    pub fn max_indirect(&self) -> u16 {
        self.max_indirect
    }

    pub fn free_bytes(&self) -> usize {
        self.slab.free_bytes()
    }

    /// Write `chain` into a fresh table and map it for the device.
    ///
    /// Split tables link entries through `next`; packed tables are read in
    /// order and carry no NEXT bits. Nothing is left allocated on failure.
    pub fn build<M: MemOps, D: DmaOps>(
        &mut self,
        mem: &M,
        dma: &D,
        chain: &MappedChain,
        packed: bool,
    ) -> Result<IndirectTable, VirtqError> {
        let n = chain.len();
        let bytes = n * Descriptor::SIZE;
        let alloc = self.slab.alloc(bytes)?;

        match Self::fill(mem, dma, alloc.addr, chain, packed) {
            Ok(bus_addr) => Ok(IndirectTable {
                alloc,
                bus_addr,
                len: bytes as u32,
            }),
            Err(e) => {
                if let Err(free_err) = self.slab.dealloc(alloc) {
                    log::error!("indirect table {:#x} not returned: {}", alloc.addr, free_err);
                }
                Err(e)
            }
        }
    }

    fn fill<M: MemOps, D: DmaOps>(
        mem: &M,
        dma: &D,
        table: u64,
        chain: &MappedChain,
        packed: bool,
    ) -> Result<u64, VirtqError> {
        let n = chain.len();
        for (i, seg) in chain.segs.iter().enumerate() {
            let mut flags = DescFlags::empty();
            flags.set(DescFlags::WRITE, seg.writable);
            let addr = table + (i * Descriptor::SIZE) as u64;

            let res = if packed {
                mem.write_val(addr, Descriptor::new(seg.bus_addr, seg.len, 0, flags))
            } else {
                flags.set(DescFlags::NEXT, i + 1 < n);
                let next = if i + 1 < n { (i + 1) as u16 } else { 0 };
                mem.write_val(addr, SplitDescriptor::new(seg.bus_addr, seg.len, flags, next))
            };
            res.map_err(|_| VirtqError::MemoryError)?;
        }

        let len = (n * Descriptor::SIZE) as u32;
        dma.map(table, len, DmaDirection::ToDevice).map_err(|e| {
            log::debug!("dma map of indirect table {:#x} failed: {:?}", table, e);
            VirtqError::MappingFailed
        })
    }

    /// Unmap and free a table whose chain has been detached.
    pub fn release<D: DmaOps>(&mut self, dma: &D, table: IndirectTable) {
        dma.unmap(table.bus_addr, table.len, DmaDirection::ToDevice);
        if let Err(e) = self.slab.dealloc(table.alloc) {
            log::error!("indirect table {:#x} freed twice: {}", table.alloc.addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;

    use super::*;
    use crate::dma::{DescExtra, IdentityDma};
    use crate::sim::{TestDma, TestMem};

    fn mapped(segs: &[(u64, u32, bool)]) -> MappedChain {
        let mut chain = MappedChain::default();
        for &(bus_addr, len, writable) in segs {
            chain.segs.push(DescExtra {
                bus_addr,
                len,
                writable,
            });
        }
        chain
    }

    fn make_tables(mem: &Rc<TestMem>, max_indirect: u16) -> IndirectTables {
        let base = mem.base_addr().next_multiple_of(INDIRECT_SLOT_SIZE as u64);
        IndirectTables::new(
            Region {
                base,
                len: 4 * INDIRECT_SLOT_SIZE,
            },
            max_indirect,
        )
        .unwrap()
    }

    #[test]
    fn test_split_table_links_entries() {
        let mem = Rc::new(TestMem::new(8192));
        let mut tables = make_tables(&mem, 16);
        let chain = mapped(&[(0x1000, 8, false), (0x2000, 16, false), (0x3000, 32, true)]);

        let table = tables.build(&mem, &IdentityDma, &chain, false).unwrap();
        assert_eq!(table.len, 48);

        let d0: SplitDescriptor = mem.read_val(table.bus_addr).unwrap();
        let d2: SplitDescriptor = mem.read_val(table.bus_addr + 32).unwrap();
        assert!(d0.is_next());
        assert_eq!(d0.next, 1);
        assert_eq!(d0.addr, 0x1000);
        assert!(!d2.is_next());
        assert!(d2.is_writeable());
        assert_eq!(d2.len, 32);

        tables.release(&IdentityDma, table);
        assert_eq!(tables.free_bytes(), 4 * INDIRECT_SLOT_SIZE);
    }

    #[test]
    fn test_packed_table_has_no_next_bits() {
        let mem = Rc::new(TestMem::new(8192));
        let mut tables = make_tables(&mem, 16);
        let chain = mapped(&[(0x1000, 8, false), (0x2000, 16, true)]);

        let table = tables.build(&mem, &IdentityDma, &chain, true).unwrap();
        let d0: Descriptor = mem.read_val(table.bus_addr).unwrap();
        let d1: Descriptor = mem.read_val(table.bus_addr + 16).unwrap();
        assert!(!d0.is_next());
        assert!(!d1.is_next());
        assert!(d1.is_writeable());
        assert_eq!(d1.addr, 0x2000);
    }

    #[test]
    fn test_accepts_bounds() {
        let mem = Rc::new(TestMem::new(8192));
        let tables = make_tables(&mem, 4);
        assert!(!tables.accepts(1));
        assert!(tables.accepts(2));
        assert!(tables.accepts(4));
        assert!(!tables.accepts(5));
    }

    #[test]
    fn test_failed_table_mapping_frees_slab() {
        let mem = Rc::new(TestMem::new(8192));
        let mut tables = make_tables(&mem, 16);
        let dma = TestDma::new();
        dma.fail_after(0);

        let chain = mapped(&[(0x1000, 8, false), (0x2000, 16, true)]);
        let r = tables.build(&mem, &dma, &chain, false);
        assert!(matches!(r, Err(VirtqError::MappingFailed)));
        assert_eq!(tables.free_bytes(), 4 * INDIRECT_SLOT_SIZE);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_slab_exhaustion_reported() {
        let mem = Rc::new(TestMem::new(8192));
        let mut tables = make_tables(&mem, 64);
        let chain = mapped(&[(0x1000, 8, false); 64]);

        // 64 descriptors need 1024 bytes: the whole region
        let t = tables.build(&mem, &IdentityDma, &chain, false).unwrap();
        let r = tables.build(&mem, &IdentityDma, &chain, false);
        assert!(matches!(r, Err(VirtqError::Alloc(_))));
        tables.release(&IdentityDma, t);
    }
}
