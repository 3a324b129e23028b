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

//! Descriptor slot allocator.
//!
//! A singly linked free list threaded through an arena of `u16` links. An
//! allocated chain stays linked through the same arena, so walking a chain and
//! returning it to the free list are both plain index walks:
//!
//! ```text
//!  free_head
//!     │
//!     v
//!   ┌───┐   ┌───┐   ┌───┐   ┌───┐
//!   │ 2 │──>│ 5 │──>│ 0 │──>│ 7 │──> ...
//!   └───┘   └───┘   └───┘   └───┘
//!   allocate_chain(2) hands out 2 -> 5 and moves free_head to 0
//! ```
//!
//! The arena is driver-private. Only the head index of a chain is ever given
//! to the device, and [`FreeList::release_chain`] refuses anything that is
//! not a live head.

use alloc::vec::Vec;

use super::VirtqError;

#[derive(Debug, Clone)]
pub struct FreeList {
    /// Link to the next slot, in the free list or inside a chain
    next: Vec<u16>,
    /// Chain length for live heads, 0 otherwise
    chain_len: Vec<u16>,
    head: u16,
    num_free: u16,
}

impl FreeList {
    pub fn new(size: u16) -> Self {
        let next = (0..size).map(|i| i.wrapping_add(1)).collect();
        let chain_len = alloc::vec![0; size as usize];

        Self {
            next,
            chain_len,
            head: 0,
            num_free: size,
        }
    }

    /// Take `n` linked slots off the free list and return the head.
    pub fn allocate_chain(&mut self, n: u16) -> Result<u16, VirtqError> {
        if n == 0 {
            return Err(VirtqError::EmptyChain);
        }
        if self.num_free < n {
            return Err(VirtqError::OutOfDescriptors);
        }

        let head = self.head;
        let mut tail = head;
        for _ in 1..n {
            tail = self.next[tail as usize];
        }

        self.head = self.next[tail as usize];
        self.num_free -= n;
        self.chain_len[head as usize] = n;

        Ok(head)
    }

    /// Return the chain starting at `head` to the free list.
    ///
    /// Returns the chain length, or `None` if `head` is not a live head.
    pub fn release_chain(&mut self, head: u16) -> Option<u16> {
        let n = *self.chain_len.get(head as usize)?;
        if n == 0 {
            return None;
        }

        let mut tail = head;
        for _ in 1..n {
            tail = self.next[tail as usize];
        }

        self.next[tail as usize] = self.head;
        self.head = head;
        self.num_free += n;
        self.chain_len[head as usize] = 0;

        Some(n)
    }

    /// Slot following `idx`.
    #[inline]
    pub fn next(&self, idx: u16) -> u16 {
        self.next[idx as usize]
    }

    /// Iterate the slots of the live chain at `head`, head first.
    pub fn chain(&self, head: u16) -> Chain<'_> {
        Chain {
            list: self,
            cur: head,
            left: self.chain_len(head),
        }
    }

    #[inline]
    pub fn is_head(&self, idx: u16) -> bool {
        self.chain_len(idx) != 0
    }

    #[inline]
    pub fn chain_len(&self, idx: u16) -> u16 {
        self.chain_len.get(idx as usize).copied().unwrap_or(0)
    }

    /// First live head at or after `from`.
    pub fn first_head(&self, from: u16) -> Option<u16> {
        (from..self.capacity()).find(|&i| self.is_head(i))
    }

    #[inline]
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    #[inline]
    pub fn in_flight(&self) -> u16 {
        self.capacity() - self.num_free
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.next.len() as u16
    }
}

pub struct Chain<'a> {
    list: &'a FreeList,
    cur: u16,
    left: u16,
}

impl Iterator for Chain<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.left == 0 {
            return None;
        }
        let idx = self.cur;
        self.left -= 1;
        self.cur = self.list.next(idx);
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(fl: &FreeList) {
        let live: u16 = fl.chain_len.iter().sum();
        assert_eq!(live + fl.num_free(), fl.capacity());

        // walking the free list visits num_free distinct non-live slots
        let mut seen = alloc::vec![false; fl.capacity() as usize];
        for head in (0..fl.capacity()).filter(|&i| fl.is_head(i)) {
            for idx in fl.chain(head) {
                assert!(!seen[idx as usize], "slot {idx} in two chains");
                seen[idx as usize] = true;
            }
        }
        let mut cur = fl.head;
        for _ in 0..fl.num_free() {
            assert!(!seen[cur as usize], "slot {cur} both free and in flight");
            seen[cur as usize] = true;
            cur = fl.next(cur);
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_allocate_links_chain() {
        let mut fl = FreeList::new(8);
        let head = fl.allocate_chain(3).unwrap();
        assert_eq!(head, 0);
        assert_eq!(fl.chain(head).collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(fl.num_free(), 5);
        assert_eq!(fl.in_flight(), 3);
        assert!(fl.is_head(0));
        assert!(!fl.is_head(1));
        assert_invariants(&fl);
    }

    #[test]
    fn test_release_makes_slots_reusable_lifo() {
        let mut fl = FreeList::new(4);
        let a = fl.allocate_chain(2).unwrap();
        let b = fl.allocate_chain(2).unwrap();
        assert_eq!(fl.num_free(), 0);
        assert!(matches!(fl.allocate_chain(1), Err(VirtqError::OutOfDescriptors)));

        assert_eq!(fl.release_chain(a), Some(2));
        assert_invariants(&fl);
        let c = fl.allocate_chain(2).unwrap();
        assert_eq!(c, a);

        assert_eq!(fl.release_chain(b), Some(2));
        assert_eq!(fl.release_chain(c), Some(2));
        assert_eq!(fl.num_free(), 4);
        assert_invariants(&fl);
    }

    #[test]
    fn test_release_rejects_non_heads() {
        let mut fl = FreeList::new(4);
        let head = fl.allocate_chain(3).unwrap();

        // middle of a chain
        assert_eq!(fl.release_chain(head + 1), None);
        // out of range
        assert_eq!(fl.release_chain(99), None);

        assert_eq!(fl.release_chain(head), Some(3));
        // double release
        assert_eq!(fl.release_chain(head), None);
        assert_eq!(fl.num_free(), 4);
        assert_invariants(&fl);
    }

    #[test]
    fn test_zero_length_chain() {
        let mut fl = FreeList::new(4);
        assert!(matches!(fl.allocate_chain(0), Err(VirtqError::EmptyChain)));
        assert_eq!(fl.num_free(), 4);
    }

    #[test]
    fn test_out_of_order_release_interleaved() {
        let mut fl = FreeList::new(8);
        let heads: Vec<u16> = (1..=3).map(|n| fl.allocate_chain(n).unwrap()).collect();
        assert_eq!(fl.num_free(), 2);

        assert_eq!(fl.release_chain(heads[1]), Some(2));
        assert_invariants(&fl);
        let big = fl.allocate_chain(4).unwrap();
        assert_eq!(fl.chain(big).count(), 4);
        assert_invariants(&fl);

        assert_eq!(fl.first_head(0), Some(heads[0]));
        assert_eq!(fl.release_chain(heads[0]), Some(1));
        assert_eq!(fl.release_chain(heads[2]), Some(3));
        assert_eq!(fl.release_chain(big), Some(4));
        assert_eq!(fl.first_head(0), None);
        assert_eq!(fl.num_free(), 8);
        assert_invariants(&fl);
    }
}
