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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
// We use Arbitrary during fuzzing, which requires std
#![cfg_attr(not(any(test, feature = "std", feature = "fuzzing")), no_std)]

//! Driver side of a virtio virtqueue.
//!
//! Both ring encodings from the VIRTIO 1.x specification are supported:
//!
//! - split rings, with a descriptor table, an avail ring written by the
//!   driver and a used ring written by the device
//! - packed rings, with one descriptor ring both sides write, tracked by
//!   wrap counters
//!
//! The encoding is chosen once from the negotiated [`Features`]; callers
//! only ever see [`Virtqueue`]. Shared memory is reached through
//! [`MemOps`], device addresses through [`DmaOps`] and the doorbell
//! through [`Notifier`], so the same queue runs over guest physical memory,
//! a hypervisor mapping or a plain buffer in tests.
//!
//! # Ordering
//!
//! Every publication to the device is a single release store made after all
//! the writes it covers: the avail index for split rings, the head
//! descriptor's flags for packed rings. Completions are read with an
//! acquire load before any field they cover. Full barriers separate a
//! publication from the following read of the device's suppression state.

extern crate alloc;

mod access;
mod chain;
mod config;
mod desc;
mod dma;
mod error;
mod event;
mod freelist;
mod indirect;
mod layout;
mod packed;
mod pool;
mod queue;
mod split;

/// Simulated device and test doubles for the transport seams.
#[cfg(any(test, feature = "fuzzing"))]
pub mod sim;

pub use access::*;
pub use chain::*;
pub use config::*;
pub use desc::*;
pub use dma::{DmaDirection, DmaOps, IdentityDma};
pub use error::*;
pub use event::*;
pub use freelist::*;
pub use indirect::INDIRECT_SLOT_SIZE;
pub use layout::*;
pub use packed::RingCursor;
pub use pool::*;
pub use queue::{CallbackState, Notifier, QueueStats, Virtqueue};
pub use split::Used;
