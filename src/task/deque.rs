//! Chase-Lev style work-stealing deque.
//!
//! The owning worker pushes and pops at the bottom; any other worker
//! steals at the top. `Empty` and `Aborted` are distinct results so a
//! caller can tell "nothing to do right now" from "lost a race, try
//! again".

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering::SeqCst};

use crossbeam_utils::CachePadded;

/// Result of a `pop` or `steal`.
pub(crate) enum Popped<T> {
    Item(*mut T),
    Empty,
    Aborted,
}

/// Bounded power-of-two circular buffer with a shared `top` and an
/// owner-only `bottom`. Capacity is fixed at construction; `push` reports
/// failure when the buffer is full.
pub(crate) struct WorkQueue<T> {
    top: CachePadded<AtomicI64>,
    bottom: CachePadded<AtomicI64>,
    buffer: Box<[AtomicPtr<T>]>,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new(log_size: u32) -> WorkQueue<T> {
        let capacity = 1usize << log_size;
        let buffer: Vec<AtomicPtr<T>> = (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        WorkQueue {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            buffer: buffer.into_boxed_slice(),
        }
    }

    #[inline]
    fn slot(&self, index: i64) -> &AtomicPtr<T> {
        debug_assert!(index >= 0);
        &self.buffer[index as usize & (self.buffer.len() - 1)]
    }

    /// Owner only. Fails when the buffer is full; the job pool is sized so
    /// well-behaved callers never see that.
    pub(crate) fn push(&self, item: *mut T) -> bool {
        let bottom = self.bottom.load(SeqCst);
        let top = self.top.load(SeqCst);
        debug_assert!(bottom >= top);
        if bottom - top >= self.buffer.len() as i64 - 1 {
            return false;
        }
        self.slot(bottom).store(item, SeqCst);
        self.bottom.store(bottom + 1, SeqCst);
        true
    }

    /// Owner only.
    pub(crate) fn pop(&self) -> Popped<T> {
        // Publish the decrement first; stealers reading bottom afterwards
        // will not touch the slot we are about to read.
        let bottom = self.bottom.fetch_sub(1, SeqCst) - 1;
        let top = self.top.load(SeqCst);
        let size = bottom - top;

        if size < 0 {
            self.bottom.store(top, SeqCst);
            return Popped::Empty;
        }

        let item = self.slot(bottom).load(SeqCst);
        if size > 0 {
            return Popped::Item(item);
        }

        // Last element: a stealer may be looking at the same top index.
        // Whoever advances top owns the item.
        let result = if self.top.compare_exchange(top, top + 1, SeqCst, SeqCst).is_ok() {
            Popped::Item(item)
        } else {
            Popped::Aborted
        };
        self.bottom.store(top + 1, SeqCst);
        result
    }

    /// Any thread.
    pub(crate) fn steal(&self) -> Popped<T> {
        // top is read before bottom: any pop that happened has already
        // moved bottom, so reading the other way around could see a stale
        // size and steal an item the owner is taking.
        let top = self.top.load(SeqCst);
        let bottom = self.bottom.load(SeqCst);
        if bottom - top <= 0 {
            return Popped::Empty;
        }
        let item = self.slot(top).load(SeqCst);
        if self.top.compare_exchange(top, top + 1, SeqCst, SeqCst).is_err() {
            return Popped::Aborted;
        }
        Popped::Item(item)
    }
}
