//! Lock-free ring buffer for audio samples
//!
//! This implements a single-producer single-consumer (SPSC) ring buffer
//! used to hand samples and encoded bytes between the real-time audio
//! threads without taking a lock.
//!
//! The buffer is created as a [`Producer`]/[`Consumer`] pair. Neither half
//! is `Clone`, so exactly one thread can push and exactly one thread can
//! pop. Each cursor is written by its owner only: the owner reads its own
//! cursor with `Relaxed`, reads the peer cursor with `Acquire` and publishes
//! with `Release`, so a consumer that observes a new write cursor also sees
//! every element up to it.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared storage and cursors of an SPSC ring
pub struct RingBuffer<T> {
    storage: Box<[UnsafeCell<T>]>,
    capacity: usize,
    mask: usize,
    /// Total elements ever written (producer owned)
    write: CachePadded<AtomicUsize>,
    /// Total elements ever read (consumer owned)
    read: CachePadded<AtomicUsize>,
}

// Slots between `read` and `write` are only touched by the consumer, the
// rest only by the producer; the cursors hand ownership across.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a ring holding at least `capacity - 1` elements.
    ///
    /// The capacity is rounded up to the next power of two (minimum 1) so
    /// index wraparound is a mask instead of a modulo.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (Producer<T>, Consumer<T>) {
        let capacity = effective_capacity(capacity);
        let storage = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let ring = Arc::new(Self {
            storage,
            capacity,
            mask: capacity - 1,
            write: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
        });

        (
            Producer { ring: ring.clone() },
            Consumer { ring },
        )
    }
}

impl<T> RingBuffer<T> {
    /// Effective capacity (a power of two)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of elements waiting to be read. May be stale.
    pub fn available(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity - 1)
    }

    /// Snapshot of free slots. May be stale.
    pub fn free(&self) -> usize {
        self.capacity - 1 - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    fn slots(&self) -> *mut T {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }
}

/// Round a requested capacity up to the next power of two (minimum 1)
pub fn effective_capacity(requested: usize) -> usize {
    requested.max(1).next_power_of_two()
}

/// Writing half of a ring buffer
pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Copy> Producer<T> {
    /// Push as many elements of `data` as fit.
    ///
    /// Returns the number written, which is short when the ring is full.
    /// Never blocks and never overwrites unread data.
    pub fn push(&mut self, data: &[T]) -> usize {
        let ring = &*self.ring;
        let write = ring.write.load(Ordering::Relaxed);
        let read = ring.read.load(Ordering::Acquire);

        let free = ring.capacity - 1 - write.wrapping_sub(read);
        let count = data.len().min(free);
        if count == 0 {
            return 0;
        }

        let pos = write & ring.mask;
        let first = count.min(ring.capacity - pos);
        // SAFETY: slots [write, write + count) are free, so the consumer does
        // not read them until the release store below.
        unsafe {
            let base = ring.slots();
            ptr::copy_nonoverlapping(data.as_ptr(), base.add(pos), first);
            if count > first {
                ptr::copy_nonoverlapping(data.as_ptr().add(first), base, count - first);
            }
        }

        ring.write.store(write.wrapping_add(count), Ordering::Release);
        count
    }

    /// Free slots as seen by the producer. Never over-reports.
    pub fn free(&self) -> usize {
        let ring = &*self.ring;
        let write = ring.write.load(Ordering::Relaxed);
        let read = ring.read.load(Ordering::Acquire);
        ring.capacity - 1 - write.wrapping_sub(read)
    }

    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Shared view for statistics
    pub fn ring(&self) -> &RingBuffer<T> {
        &self.ring
    }
}

/// Reading half of a ring buffer
pub struct Consumer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Copy> Consumer<T> {
    /// Pop up to `out.len()` elements into `out`.
    ///
    /// Returns the number read, which is short when the ring runs dry.
    pub fn pop(&mut self, out: &mut [T]) -> usize {
        let ring = &*self.ring;
        let read = ring.read.load(Ordering::Relaxed);
        let write = ring.write.load(Ordering::Acquire);

        let count = out.len().min(write.wrapping_sub(read));
        if count == 0 {
            return 0;
        }

        let pos = read & ring.mask;
        let first = count.min(ring.capacity - pos);
        // SAFETY: slots [read, read + count) were published by the acquire
        // load above and the producer will not touch them until we release.
        unsafe {
            let base = ring.slots();
            ptr::copy_nonoverlapping(base.add(pos), out.as_mut_ptr(), first);
            if count > first {
                ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), count - first);
            }
        }

        ring.read.store(read.wrapping_add(count), Ordering::Release);
        count
    }

    /// Elements ready as seen by the consumer. Never over-reports.
    pub fn available(&self) -> usize {
        let ring = &*self.ring;
        let read = ring.read.load(Ordering::Relaxed);
        let write = ring.write.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Discard everything currently readable
    pub fn clear(&mut self) {
        let write = self.ring.write.load(Ordering::Acquire);
        self.ring.read.store(write, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Shared view for statistics
    pub fn ring(&self) -> &RingBuffer<T> {
        &self.ring
    }
}
