use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

/// Bounded lock-free multi-producer multi-consumer queue.
///
/// A ticket-based slot queue: each slot carries a `turn` counter that encodes
/// which lap of the ring may touch it next. For the lap `L = pos >> log2(cap)`
/// a producer waits for turn `2L`, publishes at `2L + 1`, and the matching
/// consumer releases the slot at `2L + 2`. Producers and consumers therefore
/// never contend on the same atomic except when the queue is empty or full,
/// and `head`/`tail` live on their own cache lines.
///
/// Sequence numbers grow without wrapping, so slot reuse cannot be confused
/// with a previous lap (no ABA window).
pub struct MpmcQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    shift: u32,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

struct Slot<T> {
    turn: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Builds a queue with `capacity` rounded up to a power of two, never
    /// smaller than 2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| Slot {
                turn: AtomicUsize::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            shift: capacity.trailing_zeros(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Attempts to enqueue without blocking. Returns the value back to the
    /// caller when the queue is full.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let backoff = Backoff::new();
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let turn = (pos >> self.shift) * 2;
            let current = slot.turn.load(Ordering::Acquire);
            if current == turn {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.turn.store(turn + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(observed) => {
                        pos = observed;
                        backoff.spin();
                    }
                }
            } else if current < turn {
                // The slot still holds last lap's value: the ring is full.
                return Err(value);
            } else {
                backoff.spin();
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue without blocking.
    pub fn dequeue(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let turn = (pos >> self.shift) * 2 + 1;
            let current = slot.turn.load(Ordering::Acquire);
            if current == turn {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.turn.store(turn + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(observed) => {
                        pos = observed;
                        backoff.spin();
                    }
                }
            } else if current < turn {
                // Nothing published for this lap yet.
                return None;
            } else {
                backoff.spin();
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueues from `items` until the queue fills up; returns how many were
    /// accepted. Items past the first rejection are not consumed.
    pub fn enqueue_batch<I: IntoIterator<Item = T>>(&self, items: I) -> usize {
        let mut accepted = 0;
        for item in items {
            if self.enqueue(item).is_err() {
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Dequeues up to `max` items.
    pub fn dequeue_batch(&self, max: usize) -> Vec<T> {
        let mut drained = Vec::with_capacity(max.min(self.capacity()));
        while drained.len() < max {
            match self.dequeue() {
                Some(value) => drained.push(value),
                None => break,
            }
        }
        drained
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate number of queued items; exact only while the queue is
    /// quiescent.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.saturating_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Discards everything currently queued.
    pub fn clear(&self) {
        while self.dequeue().is_some() {}
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::MpmcQueue;

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(MpmcQueue::<u32>::new(0).capacity(), 2);
        assert_eq!(MpmcQueue::<u32>::new(1).capacity(), 2);
        assert_eq!(MpmcQueue::<u32>::new(5).capacity(), 8);
        assert_eq!(MpmcQueue::<u32>::new(8).capacity(), 8);
    }

    #[test]
    fn fifo_single_producer() {
        let queue = MpmcQueue::new(8);
        for i in 1..=5 {
            assert!(queue.enqueue(i).is_ok());
        }
        let drained: Vec<i32> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejects_when_full_and_underflows_to_none() {
        let queue = MpmcQueue::new(2);
        assert!(queue.enqueue(1).is_ok());
        assert!(queue.enqueue(2).is_ok());
        assert_eq!(queue.enqueue(3), Err(3));
        assert!(queue.is_full());

        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn slots_are_reusable_across_laps() {
        let queue = MpmcQueue::new(2);
        for lap in 0..100 {
            assert!(queue.enqueue(lap).is_ok());
            assert_eq!(queue.dequeue(), Some(lap));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn batch_operations() {
        let queue = MpmcQueue::new(4);
        assert_eq!(queue.enqueue_batch(0..10), 4);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.dequeue_batch(3), vec![0, 1, 2]);
        assert_eq!(queue.dequeue_batch(10), vec![3]);
    }

    #[test]
    fn clear_discards_pending_items() {
        let queue = MpmcQueue::new(8);
        queue.enqueue_batch(0..6);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 1000;

        let queue = Arc::new(MpmcQueue::new(64));
        let mut handles = Vec::new();
        for producer in 0..PRODUCERS {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = producer * PER_PRODUCER + i;
                    while queue.enqueue(value).is_err() {
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let mut drained = Vec::new();
        while drained.len() < (PRODUCERS * PER_PRODUCER) as usize {
            match queue.dequeue() {
                Some(value) => drained.push(value),
                None => std::thread::yield_now(),
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every value arrives exactly once, and each producer's own values
        // stay in order even though interleaving is unspecified.
        let unique: HashSet<u64> = drained.iter().copied().collect();
        assert_eq!(unique.len(), drained.len());
        for producer in 0..PRODUCERS {
            let own: Vec<u64> = drained
                .iter()
                .copied()
                .filter(|v| v / PER_PRODUCER == producer)
                .collect();
            assert_eq!(own.len(), PER_PRODUCER as usize);
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
