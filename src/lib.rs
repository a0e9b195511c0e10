//! Cooperative multitasking building blocks: a stackful fiber scheduler
//! and a work-stealing task manager.
//!
//! The [`fiber`] module multiplexes pooled, stackful fibers over worker
//! threads: batches of tasks join on a [`Counter`], tasks may yield or
//! wait at any call depth, and blocking work is absorbed by dedicated
//! service threads. The [`task`] module is the lighter alternative for
//! fine-grained jobs: cache-line-sized records scheduled over per-worker
//! work-stealing deques with parent/child completion tracking.
//!
//! The two schedulers are independent; use whichever fits the grain of
//! the work, or both side by side.

pub mod errors;
pub mod fiber;
pub mod prelude;
pub mod task;

mod counter;
mod queue;
mod unwind;

pub use self::counter::Counter;
