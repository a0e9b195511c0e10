use std::cell::Cell;
use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::counter::Counter;
use crate::queue::Node;

/// A task function: plain function pointer plus an untyped user-data
/// pointer, so a `Task` stays trivially movable and free of allocation.
pub type TaskFn = fn(*mut ());

/// Submission priority. High-priority tasks are always popped before
/// low-priority ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    High,
}

/// A unit of work for the fiber scheduler.
///
/// Tasks are typically built in a caller-owned array, submitted as one
/// batch with [`run_tasks`](crate::fiber::run_tasks), and released once the
/// counter they were charged against reads zero. The scheduler links tasks
/// through the intrusive `next` slot, so the caller must keep them alive
/// and in place until the batch has completed.
///
/// [`run_tasks`]: crate::fiber::run_tasks
pub struct Task {
    next: AtomicPtr<Task>,
    func: TaskFn,
    user_data: *mut (),
    large_stack: bool,
    counter: Cell<*const Counter>,
}

// Tasks move through shared queues by pointer and are then executed by
// exactly one worker; the counter cell is written once, before
// publication.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

unsafe impl Node for Task {
    fn next_slot(&self) -> &AtomicPtr<Task> {
        &self.next
    }
}

impl Task {
    pub fn new(func: TaskFn, user_data: *mut ()) -> Task {
        Task {
            next: AtomicPtr::new(ptr::null_mut()),
            func,
            user_data,
            large_stack: false,
            counter: Cell::new(ptr::null()),
        }
    }

    /// Like [`new`](Task::new), but hints that the task wants a fiber from
    /// the large-stack class of the pool.
    pub fn with_large_stack(func: TaskFn, user_data: *mut ()) -> Task {
        Task {
            large_stack: true,
            ..Task::new(func, user_data)
        }
    }

    pub fn is_large_stack(&self) -> bool {
        self.large_stack
    }

    /// Attach the batch counter. Happens on the submitting thread before
    /// the task becomes visible in any queue.
    pub(crate) fn set_counter(&self, counter: *const Counter) {
        debug_assert!(self.counter.get().is_null(), "task already has a counter");
        self.counter.set(counter);
    }

    pub(crate) fn counter(&self) -> *const Counter {
        self.counter.get()
    }

    /// Clear the counter backref so the task storage can be resubmitted.
    pub(crate) fn clear_counter(&self) {
        self.counter.set(ptr::null());
    }

    pub(crate) fn invoke(&self) {
        (self.func)(self.user_data)
    }
}
