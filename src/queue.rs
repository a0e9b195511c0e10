//! Intrusive multi-producer multi-consumer FIFO guarded by a pair of short
//! spin locks.
//!
//! Elements are linked through a `next` slot they provide themselves, so a
//! push never allocates. Producers only take the tail lock and consumers
//! only take the head lock; the two sides meet solely around the sentinel
//! position when the queue is nearly empty. Both task and fiber scheduling
//! queues are instances of this type.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

/// Capability an element must provide to live in a [`SpinLockQueue`]: a
/// link slot with the same lifetime as the element itself.
///
/// # Safety
///
/// The slot must be dedicated to one queue at a time; the queue stores
/// arbitrary pointers in it while the element is enqueued.
pub(crate) unsafe trait Node: Sized {
    fn next_slot(&self) -> &AtomicPtr<Self>;
}

struct SpinLock(AtomicBool);

struct SpinGuard<'a>(&'a SpinLock);

impl SpinLock {
    fn new() -> Self {
        SpinLock(AtomicBool::new(false))
    }

    #[inline]
    fn lock(&self) -> SpinGuard<'_> {
        let backoff = Backoff::new();
        while self.0.swap(true, Ordering::Acquire) {
            backoff.snooze();
        }
        SpinGuard(self)
    }
}

impl<'a> Drop for SpinGuard<'a> {
    #[inline]
    fn drop(&mut self) {
        (self.0).0.store(false, Ordering::Release);
    }
}

/// Intrusive two-lock FIFO.
///
/// `head` is the sentinel's next pointer: the first element, or null when
/// the queue is empty. `tail` is the last element, or null when the tail
/// rests on the sentinel. The queue never owns its elements; callers keep
/// them alive for the duration of their residence.
pub(crate) struct SpinLockQueue<T: Node> {
    head: CachePadded<AtomicPtr<T>>,
    tail: CachePadded<AtomicPtr<T>>,
    head_lock: CachePadded<SpinLock>,
    tail_lock: CachePadded<SpinLock>,
}

unsafe impl<T: Node> Send for SpinLockQueue<T> {}
unsafe impl<T: Node> Sync for SpinLockQueue<T> {}

impl<T: Node> SpinLockQueue<T> {
    pub(crate) fn new() -> Self {
        SpinLockQueue {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            head_lock: CachePadded::new(SpinLock::new()),
            tail_lock: CachePadded::new(SpinLock::new()),
        }
    }

    /// Advisory emptiness check, used by parking predicates only.
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// # Safety
    ///
    /// `node` must stay valid until it is popped, and must not be enqueued
    /// anywhere else in the meantime.
    pub(crate) unsafe fn push(&self, node: NonNull<T>) {
        node.as_ref().next_slot().store(ptr::null_mut(), Ordering::Relaxed);
        self.push_chain(node, node);
    }

    /// Splice a pre-linked chain `first..=last` in one shot, preserving its
    /// internal order. `last`'s next slot must already be null.
    ///
    /// # Safety
    ///
    /// Same conditions as [`push`], for every node of the chain.
    pub(crate) unsafe fn push_chain(&self, first: NonNull<T>, last: NonNull<T>) {
        debug_assert!(last.as_ref().next_slot().load(Ordering::Relaxed).is_null());

        let _tail = self.tail_lock.lock();
        let t = self.tail.load(Ordering::Relaxed);
        if t.is_null() {
            self.head.store(first.as_ptr(), Ordering::Release);
        } else {
            (*t).next_slot().store(first.as_ptr(), Ordering::Release);
        }
        self.tail.store(last.as_ptr(), Ordering::Relaxed);
    }

    pub(crate) fn pop(&self) -> Option<NonNull<T>> {
        let _head = self.head_lock.lock();
        let n = NonNull::new(self.head.load(Ordering::Acquire))?;
        unsafe {
            let next = n.as_ref().next_slot().load(Ordering::Acquire);
            if !next.is_null() {
                self.head.store(next, Ordering::Relaxed);
            } else {
                // Possibly the last element; hold the tail lock so a
                // concurrent push onto `n` is either excluded or observed.
                let _tail = self.tail_lock.lock();
                let next = n.as_ref().next_slot().load(Ordering::Acquire);
                if next.is_null() {
                    debug_assert_eq!(self.tail.load(Ordering::Relaxed), n.as_ptr());
                    self.tail.store(ptr::null_mut(), Ordering::Relaxed);
                    self.head.store(ptr::null_mut(), Ordering::Relaxed);
                } else {
                    self.head.store(next, Ordering::Relaxed);
                }
            }
            n.as_ref().next_slot().store(ptr::null_mut(), Ordering::Relaxed);
        }
        Some(n)
    }
}
