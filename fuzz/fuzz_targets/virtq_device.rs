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

#![no_main]

use std::collections::BTreeSet;

use arbitrary::Arbitrary;
use hyperlight_virtq::sim::{DeviceChain, DeviceFault, OwnedRing, SimDevice, TestDma, TestNotifier};
use hyperlight_virtq::{Features, QueueConfig, Virtqueue, VirtqError};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Op {
    Add { out: u8, in_: u8 },
    Kick,
    DevicePoll,
    DeviceComplete { pick: u8, len: u16 },
    DeviceFault(DeviceFault),
    GetBuf,
    EnableCallbacks,
    DisableCallbacks,
    FailNextMap(u8),
}

#[derive(Arbitrary, Debug)]
struct Input {
    packed: bool,
    event_idx: bool,
    indirect: bool,
    size_bits: u8,
    ops: Vec<Op>,
}

// Drives a queue against a device that may break the protocol at any point.
// The queue must never panic, never hand back a token twice, and must stay
// broken once it has reported a violation.
fuzz_target!(|input: Input| {
    let size = 1u16 << (input.size_bits % 6);
    let mut features = Features::empty();
    features.set(Features::RING_PACKED, input.packed);
    features.set(Features::EVENT_IDX, input.event_idx);
    features.set(Features::INDIRECT_DESC, input.indirect);

    let config = QueueConfig::new(size).with_features(features);
    let ring = OwnedRing::new(&config).unwrap();
    let config = config.with_indirect_region(ring.indirect_region());

    let dma = TestDma::new();
    let mut q: Virtqueue<_, _, _, u32> = Virtqueue::new(
        config,
        ring.layout(),
        ring.mem(),
        dma.clone(),
        TestNotifier::new(),
    )
    .unwrap();
    let mut dev = SimDevice::new(ring.layout(), ring.mem(), config.event_idx());

    let mut next_token = 0u32;
    let mut outstanding = BTreeSet::new();
    let mut taken: Vec<DeviceChain> = Vec::new();
    let mut broken = false;

    for op in input.ops.iter().take(512) {
        match *op {
            Op::Add { out, in_ } => {
                let out: Vec<_> = (0..(out % 5) as usize).map(|i| (ring.buf(i), 32)).collect();
                let in_: Vec<_> = (0..(in_ % 5) as usize)
                    .map(|i| (ring.buf(8 + i), 32))
                    .collect();
                if q.add(&out, &in_, next_token, None).is_ok() {
                    outstanding.insert(next_token);
                }
                next_token += 1;
            }
            Op::Kick => {
                let _ = q.kick();
            }
            Op::DevicePoll => {
                // a corrupted ring may be unreadable for the device too
                if let Ok(Some(chain)) = dev.poll_avail() {
                    taken.push(chain);
                }
            }
            Op::DeviceComplete { pick, len } => {
                if !taken.is_empty() {
                    let chain = taken.remove(pick as usize % taken.len());
                    let _ = dev.complete(chain.id, len as u32);
                }
            }
            Op::DeviceFault(fault) => {
                let _ = dev.inject(fault);
            }
            Op::GetBuf => match q.get_buf() {
                Ok(Some((token, _))) => assert!(outstanding.remove(&token)),
                Ok(None) => {}
                Err(VirtqError::QueueBroken) => assert!(broken || q.is_broken()),
                Err(VirtqError::DeviceProtocolViolation(_)) => assert!(q.is_broken()),
                Err(e) => panic!("unexpected error from get_buf: {e}"),
            },
            Op::EnableCallbacks => {
                let _ = q.enable_callbacks();
            }
            Op::DisableCallbacks => {
                let _ = q.disable_callbacks();
            }
            Op::FailNextMap(n) => dma.fail_after((n % 4) as usize),
        }

        assert!(!broken || q.is_broken());
        broken = q.is_broken();
        assert_eq!(q.num_free() as usize + q.num_inflight(), size as usize);
    }

    while let Some(token) = q.detach_unused_buf() {
        assert!(outstanding.remove(&token));
    }
    assert!(outstanding.is_empty());
    assert_eq!(q.num_free(), size);
    assert_eq!(dma.bad_unmaps(), 0);
});
