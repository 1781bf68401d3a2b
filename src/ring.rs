use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

/// Receives batches of access notifications. A `false` return means the
/// batch was dropped; callers treat delivery as best-effort either way.
pub(crate) trait Consumer: Send + Sync {
    fn consume(&self, keys: Vec<u64>) -> bool;
}

const DEFAULT_STRIPE_SIZE: usize = 512;

thread_local! {
    // Random per-thread token; `token & mask` spreads threads across stripes
    // without any cross-thread coordination.
    static STRIPE_TOKEN: u64 = rand::random();
}

/// Striped buffer absorbing per-key access notifications from many threads.
///
/// Each stripe is a short critical section: a pushing thread appends to its
/// own stripe and, when the stripe fills, swaps the backing vector out while
/// still holding the lock but hands it to the consumer only after releasing
/// it. A slow consumer therefore only ever delays the one thread whose push
/// filled the stripe, never threads appending to other stripes, and never
/// anyone waiting on the stripe lock itself.
///
/// Keys pushed by one thread are flushed in FIFO order; no ordering holds
/// across threads.
pub(crate) struct RingBuffer {
    stripes: Box<[CachePadded<Mutex<Vec<u64>>>]>,
    mask: u64,
    stripe_size: usize,
    consumer: Arc<dyn Consumer>,
}

impl RingBuffer {
    pub(crate) fn new(consumer: Arc<dyn Consumer>, num_stripes: usize, stripe_size: usize) -> Self {
        let stripe_size = if stripe_size == 0 {
            DEFAULT_STRIPE_SIZE
        } else {
            stripe_size
        };
        let num_stripes = num_stripes.max(1).next_power_of_two();
        let stripes = (0..num_stripes)
            .map(|_| CachePadded::new(Mutex::new(Vec::with_capacity(stripe_size))))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            stripes,
            mask: num_stripes as u64 - 1,
            stripe_size,
            consumer,
        }
    }

    /// Records one key access. Flushes synchronously on the pushing thread
    /// once the stripe is full; the consumer takes ownership of the batch.
    pub(crate) fn push(&self, key: u64) {
        let idx = STRIPE_TOKEN.with(|token| token & self.mask) as usize;
        let mut stripe = self.stripes[idx].lock();
        stripe.push(key);
        if stripe.len() >= self.stripe_size {
            let batch = std::mem::replace(&mut *stripe, Vec::with_capacity(self.stripe_size));
            drop(stripe);
            let _ = self.consumer.consume(batch);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{Consumer, RingBuffer};

    #[derive(Default)]
    struct Sink {
        batches: Mutex<Vec<Vec<u64>>>,
    }

    impl Consumer for Sink {
        fn consume(&self, keys: Vec<u64>) -> bool {
            self.batches.lock().push(keys);
            true
        }
    }

    #[test]
    fn flushes_full_stripes_in_order() {
        let sink = Arc::new(Sink::default());
        let ring = RingBuffer::new(sink.clone(), 1, 4);
        for key in 0..10 {
            ring.push(key);
        }
        let batches = sink.batches.lock();
        assert_eq!(*batches, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
    }

    #[test]
    fn partial_stripes_stay_buffered() {
        let sink = Arc::new(Sink::default());
        let ring = RingBuffer::new(sink.clone(), 1, 16);
        for key in 0..15 {
            ring.push(key);
        }
        assert!(sink.batches.lock().is_empty());
    }

    #[test]
    fn zero_stripe_size_defaults() {
        let sink = Arc::new(Sink::default());
        let ring = RingBuffer::new(sink, 1, 0);
        assert_eq!(ring.stripe_size, super::DEFAULT_STRIPE_SIZE);
    }

    #[test]
    fn stripe_count_rounds_to_power_of_two() {
        let sink = Arc::new(Sink::default());
        let ring = RingBuffer::new(sink, 30, 4);
        assert_eq!(ring.stripes.len(), 32);
        assert_eq!(ring.mask, 31);
    }

    #[test]
    fn concurrent_pushes_deliver_each_key_at_most_once() {
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 64;

        let sink = Arc::new(Sink::default());
        let ring = Arc::new(RingBuffer::new(sink.clone(), 8, 8));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    ring.push(t * PER_THREAD + i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Unflushed remainders may stay buffered, but nothing is delivered
        // twice and every batch is exactly one stripe worth of keys.
        let batches = sink.batches.lock();
        let delivered: Vec<u64> = batches.iter().flatten().copied().collect();
        let unique: std::collections::HashSet<u64> = delivered.iter().copied().collect();
        assert_eq!(unique.len(), delivered.len());
        assert!(batches.iter().all(|batch| batch.len() == 8));
    }
}
