use std::mem;
use std::sync::atomic::{AtomicI32, Ordering::SeqCst};
use std::sync::Arc;

use super::manager::TaskCore;

/// A job function. The job itself is passed along with its inline data
/// region, sized by the preceding [`JobHandle::set_data`] call.
pub type JobFn = fn(&Job, &[u8]);

pub(crate) const CACHE_LINE: usize = 64;

const DATA_CAPACITY: usize = 32;

/// A unit of work for the task manager: exactly one cache line holding the
/// function pointer, the completion-tracking links, and a small inline
/// data region.
///
/// `unfinished` starts at 1 for the job itself and grows by one per child;
/// a job is complete when it has run and every transitive child has
/// finished, which propagates up the parent chain. `users` counts the
/// outstanding references: one per live handle plus one held by the
/// execution itself; the job returns to its owner's pool when the last
/// reference goes away.
#[repr(C, align(64))]
pub struct Job {
    function: JobFn,
    parent: *mut Job,
    owner: i32,
    pub(crate) unfinished: AtomicI32,
    pub(crate) users: AtomicI32,
    data_size: u32,
    data: [u8; DATA_CAPACITY],
}

const _: () = assert!(mem::size_of::<Job>() == CACHE_LINE);

impl Job {
    /// Bytes of inline data a job can carry.
    pub const DATA_CAPACITY: usize = DATA_CAPACITY;

    pub(crate) fn new(function: JobFn, parent: *mut Job, owner: i32) -> Job {
        Job {
            function,
            parent,
            owner,
            unfinished: AtomicI32::new(1),
            // One reference for the handle, one for the execution.
            users: AtomicI32::new(2),
            data_size: 0,
            data: [0; Job::DATA_CAPACITY],
        }
    }

    /// The job's inline payload, as sized by `set_data`.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_size as usize]
    }

    pub(crate) fn function(&self) -> JobFn {
        self.function
    }

    pub(crate) fn parent(&self) -> *mut Job {
        self.parent
    }

    pub(crate) fn owner(&self) -> i32 {
        self.owner
    }

    pub(crate) fn set_data(&mut self, data: &[u8]) {
        assert!(
            data.len() <= Job::DATA_CAPACITY,
            "job payload of {} bytes exceeds the inline capacity of {}",
            data.len(),
            Job::DATA_CAPACITY
        );
        self.data[..data.len()].copy_from_slice(data);
        self.data_size = data.len() as u32;
    }

    // Freed jobs are threaded through their parent field on the pool free
    // lists.

    pub(crate) fn next_free(&self) -> *mut Job {
        self.parent
    }

    pub(crate) fn set_next_free(&mut self, next: *mut Job) {
        self.parent = next;
    }
}

/// Refcounted reference to a [`Job`].
///
/// Handles keep the job's storage alive: cloning bumps the user count,
/// dropping releases it, and the job is recycled once it has finished and
/// the last handle is gone.
pub struct JobHandle {
    job: *mut Job,
    core: Arc<TaskCore>,
}

unsafe impl Send for JobHandle {}

impl JobHandle {
    pub(crate) fn new(core: Arc<TaskCore>, job: *mut Job) -> JobHandle {
        JobHandle { job, core }
    }

    pub(crate) fn raw(&self) -> *mut Job {
        self.job
    }

    /// Copy `data` into the job's inline region. Must happen before the
    /// job is submitted with [`run`](super::TaskManager::run).
    ///
    /// # Panics
    ///
    /// Panics when `data` exceeds [`Job::DATA_CAPACITY`].
    pub fn set_data(&self, data: &[u8]) {
        debug_assert!(!self.is_finished(), "set_data on a finished job");
        unsafe { (*self.job).set_data(data) };
    }

    /// Whether the job and all of its children have completed.
    pub fn is_finished(&self) -> bool {
        unsafe { (*self.job).unfinished.load(SeqCst) == 0 }
    }
}

impl Clone for JobHandle {
    fn clone(&self) -> JobHandle {
        unsafe { (*self.job).users.fetch_add(1, SeqCst) };
        JobHandle {
            job: self.job,
            core: self.core.clone(),
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        unsafe { self.core.release_user(self.job) };
    }
}
