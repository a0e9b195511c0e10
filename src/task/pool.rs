use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};

use super::job::Job;

/// Fixed-capacity job pool owned by one worker.
///
/// Allocation is a bump over the slab until it runs dry, then reuse from
/// the free lists. A job freed on its owner's thread goes straight onto a
/// local list; a job freed anywhere else is pushed onto the owner's atomic
/// list with a compare-exchange loop and reclaimed on the owner's next
/// allocation. Freed jobs are linked through their parent field, so the
/// lists cost no extra storage.
pub(crate) struct JobPool {
    slab: Box<[UnsafeCell<MaybeUninit<Job>>]>,
    bump: Cell<usize>,
    local_free: Cell<*mut Job>,
    remote_free: AtomicPtr<Job>,
}

// The slab and bump/local fields are touched only by the owning worker;
// remote_free is the one cross-thread entry point.
unsafe impl Send for JobPool {}
unsafe impl Sync for JobPool {}

impl JobPool {
    pub(crate) fn new(capacity: usize) -> JobPool {
        let slab: Vec<UnsafeCell<MaybeUninit<Job>>> =
            (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();
        JobPool {
            slab: slab.into_boxed_slice(),
            bump: Cell::new(0),
            local_free: Cell::new(ptr::null_mut()),
            remote_free: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Owner thread only. Returns uninitialized job storage, or `None`
    /// when the pool is exhausted.
    pub(crate) fn allocate(&self) -> Option<*mut Job> {
        // Reclaim whatever other threads freed since the last call.
        let mut remote = self.remote_free.swap(ptr::null_mut(), SeqCst);
        while !remote.is_null() {
            let next = unsafe { (*remote).next_free() };
            self.push_local(remote);
            remote = next;
        }

        let free = self.local_free.get();
        if !free.is_null() {
            self.local_free.set(unsafe { (*free).next_free() });
            return Some(free);
        }

        let bump = self.bump.get();
        if bump < self.slab.len() {
            self.bump.set(bump + 1);
            return Some(self.slab[bump].get() as *mut Job);
        }
        None
    }

    fn push_local(&self, job: *mut Job) {
        unsafe { (*job).set_next_free(self.local_free.get()) };
        self.local_free.set(job);
    }

    /// Owner thread fast path.
    pub(crate) fn free_local(&self, job: *mut Job) {
        self.push_local(job);
    }

    /// Any thread.
    pub(crate) fn free_remote(&self, job: *mut Job) {
        let mut head = self.remote_free.load(SeqCst);
        loop {
            unsafe { (*job).set_next_free(head) };
            match self.remote_free.compare_exchange_weak(head, job, SeqCst, SeqCst) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }
}
