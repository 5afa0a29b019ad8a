//! Fixed-capacity, lock-free, single-producer single-consumer ring buffer.
//!
//! The producer owns `head`, the consumer owns `tail`; with one writer per
//! index a release store paired with an acquire load is enough, no CAS.
//! Indices run free and are masked per access, so all `capacity` slots are
//! usable: full is `head - tail == capacity`, empty is `head == tail`.
//! Drop-on-full is intentional: upstream quality gating is cheaper than
//! letting the camera block.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Keeps head and tail on separate cache lines.
#[repr(align(64))]
struct CacheAligned<T>(T);

struct Inner<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    head: CacheAligned<AtomicUsize>, // producer writes here
    tail: CacheAligned<AtomicUsize>, // consumer reads here
}

// The SPSC split below guarantees a slot is only touched by one side at a
// time: the producer writes slots it observed free via the acquire load of
// tail, the consumer reads slots published via the release store of head.
unsafe impl<T: Send> Sync for Inner<T> {}

/// Producer half. `Send` but not `Clone`; single-producer is enforced by the
/// type system.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

/// Consumer half. `Send` but not `Clone`.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

/// Create a ring buffer with `capacity` pre-initialized slots. `capacity`
/// must be a power of two. Never allocates after construction.
pub fn ring_buffer<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(
        capacity.is_power_of_two(),
        "ring buffer capacity must be a power of two"
    );

    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(None))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let inner = Arc::new(Inner {
        slots,
        mask: capacity - 1,
        head: CacheAligned(AtomicUsize::new(0)),
        tail: CacheAligned(AtomicUsize::new(0)),
    });

    (
        Producer {
            inner: Arc::clone(&inner),
        },
        Consumer { inner },
    )
}

impl<T> Producer<T> {
    /// Hand `value` to the consumer. On a full buffer the value is returned
    /// to the caller (drop-newest); no occupied slot is overwritten.
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        let inner = &*self.inner;
        let head = inner.head.0.load(Ordering::Relaxed);
        let tail = inner.tail.0.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == inner.slots.len() {
            return Err(value);
        }

        // Safe: only the producer writes slots, and the acquire load above
        // proved the consumer has vacated this one.
        unsafe {
            *inner.slots[head & inner.mask].get() = Some(value);
        }
        inner.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }
}

impl<T> Consumer<T> {
    /// Take the oldest value, or `None` if the buffer is empty.
    pub fn try_pop(&mut self) -> Option<T> {
        let inner = &*self.inner;
        let tail = inner.tail.0.load(Ordering::Relaxed);
        if inner.head.0.load(Ordering::Acquire) == tail {
            return None;
        }

        // Safe: the acquire load of head proved the producer published this
        // slot; the release store below hands it back.
        let value = unsafe { (*inner.slots[tail & inner.mask].get()).take() };
        inner.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        value
    }
}
