//! Bounded lock-free single-producer / single-consumer ring queue
//!
//! Carries frame-slot pointers from the capture-completion context to the
//! main loop. Capacity is a power of two; producer and consumer indices are
//! monotonic counters, so a slot is addressed by `index & (capacity - 1)`,
//! the queue is empty when the counters are equal and full when they differ
//! by the capacity. There is no blocking and no internal retry; callers spin
//! or back off.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// Keeps the producer and consumer counters off each other's cache line.
#[repr(align(64))]
struct CacheAligned<T>(T);

struct Ring<T> {
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Slot access is partitioned by the head/tail protocol: the producer writes
// a slot strictly before releasing it via `head`, the consumer reads it
// strictly after acquiring `head`.
unsafe impl<T: Send> Sync for Ring<T> {}
unsafe impl<T: Send> Send for Ring<T> {}

/// Producer half. Exactly one context may hold it.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

/// Consumer half. Exactly one context may hold it.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}

/// Creates a queue with capacity `min_capacity` rounded up to a power of two
/// and splits it into its two halves.
pub fn channel<T: Copy>(min_capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = min_capacity.max(2).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let ring = Arc::new(Ring {
        head: CacheAligned(AtomicUsize::new(0)),
        tail: CacheAligned(AtomicUsize::new(0)),
        mask: capacity - 1,
        slots,
    });

    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

impl<T: Copy> Producer<T> {
    /// Enqueues `value`. Returns false if the queue is full.
    pub fn push(&self, value: T) -> bool {
        let ring = &*self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);
        let tail = ring.tail.0.load(Ordering::Acquire);

        if head.wrapping_sub(tail) > ring.mask {
            return false;
        }

        let slot = &ring.slots[head & ring.mask];
        unsafe { (*slot.get()).write(value) };

        // Publish the slot before advancing the index.
        ring.head.0.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Queue capacity (power of two).
    pub fn capacity(&self) -> usize {
        self.ring.mask + 1
    }
}

impl<T: Copy> Consumer<T> {
    /// Dequeues the oldest value, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.0.load(Ordering::Relaxed);
        let head = ring.head.0.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let slot = &ring.slots[tail & ring.mask];
        let value = unsafe { (*slot.get()).assume_init() };

        ring.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Number of values currently enqueued.
    pub fn len(&self) -> usize {
        let ring = &*self.ring;
        ring.head
            .0
            .load(Ordering::Acquire)
            .wrapping_sub(ring.tail.0.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
