//! Cooperative fiber scheduling.
//!
//! A fixed pool of stackful fibers is multiplexed over a small set of
//! worker threads. Work is submitted as batches of [`Task`]s charged
//! against a [`Counter`](crate::Counter); waiting on the counter runs
//! other tasks instead of blocking, and a task may yield or wait from any
//! call depth. Blocking operations are pushed onto [`FiberService`]
//! threads so workers never stall.
//!
//! The thread that creates the [`Scheduler`] becomes worker 0: it submits
//! batches and joins in through its own waits and yields.
//!
//! A fiber that suspends may be resumed on a different worker thread.
//! Task code must therefore not hold references into thread-local storage
//! across [`yield_fiber`], [`wait_for_counter`], or a service request;
//! everything else moves with the fiber's stack.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use weft::fiber::{Config, Priority, Scheduler, Task};
//! use weft::Counter;
//!
//! fn compute(data: *mut ()) {
//!     let hits = unsafe { &*(data as *const AtomicUsize) };
//!     hits.fetch_add(1, Ordering::Relaxed);
//! }
//!
//! let scheduler = Scheduler::new(Config::default()).unwrap();
//!
//! let hits = AtomicUsize::new(0);
//! let counter = Counter::new();
//! let mut tasks: Vec<Task> = (0..8)
//!     .map(|_| Task::new(compute, &hits as *const AtomicUsize as *mut ()))
//!     .collect();
//!
//! unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };
//! scheduler.wait_for_counter(&counter);
//! assert_eq!(hits.load(Ordering::Relaxed), 8);
//!
//! scheduler.purge();
//! ```

mod fiber;
mod scheduler;
mod service;
mod task;

pub use self::scheduler::Scheduler;
pub use self::service::{FiberService, Request, ServiceContext, ServiceHandler};
pub use self::task::{Priority, Task, TaskFn};

use crate::counter::Counter;

/// The type of a panic handling closure for task panics. The same closure
/// may be invoked from several workers in parallel. Without one, a
/// panicking task aborts the process.
pub type PanicHandler = dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync;

/// Scheduler construction parameters.
///
/// The pool holds two classes of fibers: small-stack fibers for ordinary
/// tasks and large-stack fibers for tasks flagged with
/// [`Task::with_large_stack`]. High-priority workers get their own,
/// usually smaller, per-thread fiber counts.
pub struct Config {
    /// Total worker threads, including the submitting thread (worker 0).
    pub num_worker_threads: usize,
    /// Workers dedicated to high-priority work; a subset of the total.
    pub num_high_priority_worker_threads: usize,
    pub small_stack_bytes: usize,
    pub large_stack_bytes: usize,
    pub num_small_fibers_per_thread: usize,
    pub num_large_fibers_per_thread: usize,
    pub num_small_fibers_per_hp_thread: usize,
    pub num_large_fibers_per_hp_thread: usize,
    pub panic_handler: Option<Box<PanicHandler>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_worker_threads: 1,
            num_high_priority_worker_threads: 0,
            small_stack_bytes: 32 << 10,
            large_stack_bytes: 64 << 10,
            num_small_fibers_per_thread: 32,
            num_large_fibers_per_thread: 4,
            num_small_fibers_per_hp_thread: 4,
            num_large_fibers_per_hp_thread: 2,
            panic_handler: None,
        }
    }
}

/// Submit a batch of tasks from a scheduler thread (worker 0 or inside a
/// task). Counter accounting happens before the batch becomes visible,
/// and the batch keeps its submission order in the queue.
///
/// Submitting an empty batch is a no-op and leaves the counter untouched.
///
/// # Safety
///
/// Every task, and the counter, must stay alive and in place until a wait
/// on `counter` has returned; the scheduler links the tasks through their
/// intrusive slots for the duration.
///
/// # Panics
///
/// Panics when called from a thread that serves no scheduler.
pub unsafe fn run_tasks(tasks: &mut [Task], counter: &Counter, priority: Priority) {
    let core = scheduler::current_core();
    assert!(
        !core.is_null(),
        "run_tasks called off the scheduler; use Scheduler::run_tasks"
    );
    (*core).run_tasks(tasks, counter, priority);
}

/// [`run_tasks`] into the high-priority queue.
///
/// # Safety
///
/// Same contract as [`run_tasks`].
pub unsafe fn run_high_priority_tasks(tasks: &mut [Task], counter: &Counter) {
    run_tasks(tasks, counter, Priority::High);
}

/// Suspend until `counter` reads zero, executing other tasks meanwhile.
///
/// Must run inside a fiber: either a task, or worker 0 (the submitting
/// thread counts as a fiber for the lifetime of the scheduler). Returns
/// immediately when the counter is already zero.
pub fn wait_for_counter(counter: &Counter) {
    let core = scheduler::current_core();
    assert!(
        !core.is_null(),
        "wait_for_counter called outside the fiber scheduler"
    );
    unsafe { (*core).wait_for_counter(counter) };
}

/// Cooperatively give another ready fiber a turn on this worker.
pub fn yield_fiber() {
    let core = scheduler::current_core();
    assert!(!core.is_null(), "yield_fiber called outside the fiber scheduler");
    unsafe { (*core).yield_fiber() };
}

/// Whether the current thread belongs to a fiber scheduler.
pub fn is_in_fiber_thread() -> bool {
    scheduler::current_index() >= 0
}

/// Worker index of the current thread, `0..num_workers`, or -1 when the
/// thread serves no scheduler.
pub fn fiber_thread_id() -> isize {
    scheduler::current_index()
}
