//! # Bounded Queue
//!
//! Fixed-capacity FIFO ring shared between submitters and workers.
//!
//! One slot is always left empty so that `head == tail` means empty and
//! `head + 1 == tail` means full. A queue built with capacity `C` holds
//! at most `C - 1` items.
//!
//! Neither `push` nor `pop` blocks. Waiting is layered on top by the
//! [`WorkerPool`](super::WorkerPool).

use parking_lot::Mutex;

/// Slots and cursors, guarded together.
struct Ring<T> {
    slots: Box<[Option<T>]>,
    /// Next slot to write.
    head: usize,
    /// Next slot to read.
    tail: usize,
}

impl<T> Ring<T> {
    #[inline]
    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    #[inline]
    fn len(&self) -> usize {
        (self.head + self.slots.len() - self.tail) % self.slots.len()
    }
}

/// Mutex-guarded ring buffer with non-blocking push and pop.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2`; such a queue could never hold an item.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "queue capacity must be at least 2, got {capacity}");
        let slots = std::iter::repeat_with(|| None).take(capacity).collect();
        Self {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
            }),
        }
    }

    /// Appends an item, handing it back if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item unchanged when there is no free slot.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut ring = self.ring.lock();
        let next = ring.advance(ring.head);
        if next == ring.tail {
            return Err(item);
        }
        let head = ring.head;
        ring.slots[head] = Some(item);
        ring.head = next;
        Ok(())
    }

    /// Removes the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        if ring.head == ring.tail {
            return None;
        }
        let tail = ring.tail;
        let item = ring.slots[tail].take();
        ring.tail = ring.advance(tail);
        item
    }

    /// Items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Whether no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let ring = self.ring.lock();
        ring.head == ring.tail
    }

    /// Whether the next `push` would fail.
    #[must_use]
    pub fn is_full(&self) -> bool {
        let ring = self.ring.lock();
        ring.advance(ring.head) == ring.tail
    }

    /// Number of slots, including the one that is always kept empty.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }

    /// Maximum number of items the queue can hold at once.
    #[must_use]
    pub fn usable_capacity(&self) -> usize {
        self.capacity() - 1
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &ring.slots.len())
            .field("len", &ring.len())
            .finish()
    }
}
