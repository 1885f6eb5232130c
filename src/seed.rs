// SPDX-License-Identifier: AGPL-3.0-only

//! Seed-particle records and the shared seed queue.
//!
//! The queue is a bounded MPMC channel: the seed producer pushes on one end,
//! every device worker pops from the other. End-of-stream is signaled by
//! dropping the last sender; once a pop has observed exhaustion the queue is
//! permanently exhausted. Bounded capacity gives backpressure when workers
//! fall behind the producer.

use bytemuck::{Pod, Zeroable};
use crossbeam_channel::{bounded, Receiver, Sender};

/// One particle's device-resident record: starting position, orientation,
/// and per-particle RNG state. Layout must match `Particle` in
/// `shaders/advance.wgsl`; the host treats the contents as opaque beyond
/// construction.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct ParticleRecord {
    /// Starting position in voxel coordinates (w unused).
    pub position: [f32; 4],
    /// Initial unit direction (w unused).
    pub direction: [f32; 4],
    /// Per-particle RNG state, seeded by the producer.
    pub rng_state: [u32; 8],
}

impl ParticleRecord {
    /// Build a seed record from a position, direction, and RNG seed.
    ///
    /// The RNG state words are derived with splitmix64 so two seeds never
    /// share a stream.
    pub fn at(position: [f32; 3], direction: [f32; 3], rng_seed: u64) -> Self {
        let mut state = rng_seed;
        let mut next = || {
            state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            (z ^ (z >> 31)) as u32
        };
        let rng_state = [
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
        ];
        Self {
            position: [position[0], position[1], position[2], 0.0],
            direction: [direction[0], direction[1], direction[2], 0.0],
            rng_state,
        }
    }
}

/// Producer half of the seed queue. Cloneable; the queue is exhausted once
/// every clone has been dropped and the buffered seeds are consumed.
#[derive(Clone)]
pub struct SeedSender {
    tx: Sender<ParticleRecord>,
}

impl SeedSender {
    /// Push one seed, blocking while the queue is full. Returns `false` if
    /// every consumer is gone.
    pub fn push(&self, record: ParticleRecord) -> bool {
        self.tx.send(record).is_ok()
    }
}

/// Consumer half of the seed queue, cloned into each device worker.
#[derive(Clone)]
pub struct SeedReceiver {
    rx: Receiver<ParticleRecord>,
}

impl SeedReceiver {
    /// Pop one seed, blocking until a seed arrives or the stream ends.
    /// `None` means exhausted — permanently.
    pub fn pop(&self) -> Option<ParticleRecord> {
        self.rx.recv().ok()
    }
}

/// Create the shared seed queue with the given capacity.
pub fn seed_queue(capacity: usize) -> (SeedSender, SeedReceiver) {
    let (tx, rx) = bounded(capacity);
    (SeedSender { tx }, SeedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_matches_device_stride() {
        // 16 B position + 16 B direction + 32 B rng state
        assert_eq!(std::mem::size_of::<ParticleRecord>(), 64);
    }

    #[test]
    fn distinct_seeds_give_distinct_rng_streams() {
        let a = ParticleRecord::at([0.0; 3], [1.0, 0.0, 0.0], 1);
        let b = ParticleRecord::at([0.0; 3], [1.0, 0.0, 0.0], 2);
        assert_ne!(a.rng_state, b.rng_state);
    }

    #[test]
    fn pop_after_producer_drop_reports_exhaustion() {
        let (tx, rx) = seed_queue(4);
        assert!(tx.push(ParticleRecord::at([1.0, 2.0, 3.0], [0.0, 0.0, 1.0], 7)));
        drop(tx);
        assert!(rx.pop().is_some());
        assert!(rx.pop().is_none());
        // Exhaustion is permanent.
        assert!(rx.pop().is_none());
    }

    #[test]
    fn concurrent_pops_partition_the_seed_set() {
        const SEEDS: usize = 1000;
        const WORKERS: usize = 4;

        let (tx, rx) = seed_queue(16);
        let producer = std::thread::spawn(move || {
            for i in 0..SEEDS {
                let rec = ParticleRecord::at([i as f32, 0.0, 0.0], [1.0, 0.0, 0.0], i as u64);
                assert!(tx.push(rec));
            }
        });

        let consumers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let rx = rx.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(rec) = rx.pop() {
                        got.push(rec.position[0] as usize);
                    }
                    got
                })
            })
            .collect();
        drop(rx);

        producer.join().expect("producer");
        let mut all: Vec<usize> = consumers
            .into_iter()
            .flat_map(|c| c.join().expect("consumer"))
            .collect();
        all.sort_unstable();
        // No duplicate, no loss.
        assert_eq!(all, (0..SEEDS).collect::<Vec<_>>());
    }
}
