//! Work-stealing task manager for cache-line-sized jobs.
//!
//! The alternative to fiber scheduling for fine-grained work: a [`Job`] is
//! a single cache line carrying a function pointer, a parent link for
//! completion tracking, and a small inline data region, so running one
//! costs no stack switch and no allocation. Each worker owns a bounded
//! deque; idle workers steal from the top of their neighbours'.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use weft::task::{Job, TaskManager};
//!
//! static HITS: AtomicUsize = AtomicUsize::new(0);
//!
//! fn count(_job: &Job, _data: &[u8]) {
//!     HITS.fetch_add(1, Ordering::SeqCst);
//! }
//!
//! let manager = TaskManager::new(2);
//! let root = manager.create_task(count).unwrap();
//! for _ in 0..15 {
//!     let child = manager.create_child_task(&root, count).unwrap();
//!     assert!(manager.run(&child));
//! }
//! assert!(manager.run(&root));
//! manager.wait(&root);
//! assert_eq!(HITS.load(Ordering::SeqCst), 16);
//! manager.shutdown();
//! ```

mod deque;
mod job;
mod manager;
mod pool;

pub use self::job::{Job, JobFn, JobHandle};
pub use self::manager::TaskManager;
