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

use thiserror::Error;

use super::AllocError;

/// A device-side protocol violation. Any of these breaks the queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("used index {used_idx} is more than {size} entries ahead of {last_used}")]
    UsedIndexAhead {
        used_idx: u16,
        last_used: u16,
        size: u16,
    },
    #[error("completed id {id} is out of range for a ring of {size}")]
    IdOutOfRange { id: u32, size: u16 },
    #[error("completed id {id} is not the head of an outstanding chain")]
    NotAHead { id: u16 },
    #[error("used length {len} for id {id} exceeds writable capacity {capacity}")]
    UsedLenTooLarge { id: u16, len: u32, capacity: u64 },
}

/// Everything a queue operation can fail with.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtqError {
    #[error("Not enough free descriptors")]
    OutOfDescriptors,
    #[error("DMA mapping failed")]
    MappingFailed,
    #[error("Device protocol violation: {0}")]
    DeviceProtocolViolation(Violation),
    #[error("Queue is broken")]
    QueueBroken,
    #[error("Buffer chain is empty")]
    EmptyChain,
    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Invalid memory layout")]
    InvalidLayout,
    #[error("Backend memory error")]
    MemoryError,
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
}

impl From<Violation> for VirtqError {
    fn from(v: Violation) -> Self {
        Self::DeviceProtocolViolation(v)
    }
}
