use std::sync::atomic::{AtomicUsize, Ordering};

/// Join barrier for a batch of tasks.
///
/// A `Counter` is incremented once per task when a batch is submitted and
/// decremented exactly once when each task function returns. Waiters poll
/// `is_zero` while helping with other work; a counter reading zero means
/// every task that was charged against it has completed, and the effects of
/// those tasks are visible to the waiter.
///
/// The counter is never reset. Once a wait on it has returned, the same
/// storage may be reused for a fresh batch.
pub struct Counter(AtomicUsize);

impl Counter {
    pub const fn new() -> Self {
        Counter(AtomicUsize::new(0))
    }

    /// True once all associated work has completed. The load carries
    /// acquire semantics so the waiter observes everything the completing
    /// tasks wrote.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    /// Charge `n` pending completions. Relaxed is enough here: the queue
    /// push that publishes the work orders the increment for consumers.
    #[inline]
    pub(crate) fn increment(&self, n: usize) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Retire one completion. The last decrement publishes the task's
    /// results to any waiter that subsequently observes zero.
    #[inline]
    pub(crate) fn decrement(&self) {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "counter underflow: unbalanced decrement");
    }

    #[cfg(test)]
    pub(crate) fn value(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let c = Counter::new();
        assert!(c.is_zero());
    }

    #[test]
    fn balanced_increments() {
        let c = Counter::new();
        c.increment(3);
        assert!(!c.is_zero());
        c.decrement();
        c.decrement();
        assert!(!c.is_zero());
        c.decrement();
        assert!(c.is_zero());
    }

    #[test]
    fn reuse_after_zero() {
        let c = Counter::new();
        c.increment(1);
        c.decrement();
        assert!(c.is_zero());

        c.increment(2);
        assert_eq!(c.value(), 2);
        c.decrement();
        c.decrement();
        assert!(c.is_zero());
    }
}
