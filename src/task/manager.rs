use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info};

use super::deque::{Popped, WorkQueue};
use super::job::{Job, JobFn, JobHandle};
use super::pool::JobPool;
use crate::unwind::trap_panic;

/// Deque capacity and pool size per owner; jobs cannot outnumber deque
/// slots.
const LOG_SIZE: u32 = 12;

thread_local! {
    /// Task manager this thread is attached to, and its owner index.
    static OWNER: Cell<(*const TaskCore, isize)> = Cell::new((ptr::null(), -1));
}

pub(crate) struct OwnerData {
    pub(crate) pool: JobPool,
    pub(crate) queue: WorkQueue<Job>,
    steal_index: AtomicUsize,
}

impl OwnerData {
    fn new() -> OwnerData {
        OwnerData {
            pool: JobPool::new(1 << LOG_SIZE),
            queue: WorkQueue::new(LOG_SIZE),
            steal_index: AtomicUsize::new(0),
        }
    }
}

pub(crate) struct TaskCore {
    done: AtomicBool,
    pub(crate) owners: Box<[OwnerData]>,
}

impl TaskCore {
    fn worker_main(core: Arc<TaskCore>, me: usize) {
        OWNER.with(|c| c.set((&*core as *const TaskCore, me as isize)));
        debug!("job worker {} online", me);
        while !core.done.load(Ordering::Acquire) {
            if let Some(job) = core.get_task(me) {
                unsafe { core.execute(job) };
            }
        }
        debug!("job worker {} offline", me);
    }

    /// One round of work acquisition: the own deque first, then one steal
    /// attempt from the current victim. Yields the OS thread on an empty
    /// or aborted round to keep contention storms down.
    pub(crate) fn get_task(&self, me: usize) -> Option<*mut Job> {
        match self.owners[me].queue.pop() {
            Popped::Item(job) => return Some(job),
            Popped::Empty | Popped::Aborted => {}
        }
        match self.steal_target(me) {
            Some(victim) => match victim.queue.steal() {
                Popped::Item(job) => Some(job),
                Popped::Empty | Popped::Aborted => {
                    thread::yield_now();
                    None
                }
            },
            None => {
                thread::yield_now();
                None
            }
        }
    }

    /// Round-robin victim selection, skipping self, advancing one slot per
    /// attempt.
    fn steal_target(&self, me: usize) -> Option<&OwnerData> {
        let count = self.owners.len();
        if count <= 1 {
            return None;
        }
        let data = &self.owners[me];
        let mut index = data.steal_index.load(Ordering::Relaxed) % count;
        if index == me {
            index = (index + 1) % count;
        }
        if index == me {
            return None;
        }
        data.steal_index.store((index + 1) % count, Ordering::Relaxed);
        Some(&self.owners[index])
    }

    pub(crate) unsafe fn execute(&self, job: *mut Job) {
        {
            let j = &*job;
            let function = j.function();
            if trap_panic(|| function(j, j.data())).is_some() {
                // The job surface has no panic handler; a lost panic would
                // leave the parent chain half-finished.
                let (_, me) = OWNER.with(|c| c.get());
                error!("job panicked on worker {}; aborting", me);
                std::process::abort();
            }
        }
        self.finish(job);
    }

    /// Retire one completion of `job`. When the job and its children are
    /// all done, completion propagates to the parent and the execution's
    /// reference is released.
    unsafe fn finish(&self, job: *mut Job) {
        let remaining = (*job).unfinished.fetch_sub(1, SeqCst) - 1;
        if remaining == 0 {
            let parent = (*job).parent();
            if !parent.is_null() {
                self.finish(parent);
            }
            self.release_user(job);
        }
    }

    /// Drop one reference to `job`; the last reference frees it back to
    /// its owner's pool.
    pub(crate) unsafe fn release_user(&self, job: *mut Job) {
        if (*job).users.fetch_sub(1, SeqCst) == 1 {
            debug_assert_eq!((*job).unfinished.load(SeqCst), 0);
            self.free(job);
        }
    }

    unsafe fn free(&self, job: *mut Job) {
        let owner = (*job).owner() as usize;
        debug_assert!(owner < self.owners.len());
        let (core, index) = OWNER.with(|c| c.get());
        if ptr::eq(core, self as *const TaskCore) && index >= 0 && index as usize == owner {
            self.owners[owner].pool.free_local(job);
        } else {
            self.owners[owner].pool.free_remote(job);
        }
    }
}

/// Handle to a running work-stealing task manager.
///
/// The creating thread becomes owner 0; it allocates and submits jobs and
/// helps execute them in [`wait`](TaskManager::wait). Worker threads spin
/// over their own deques and steal from each other when empty.
pub struct TaskManager {
    core: Arc<TaskCore>,
    threads: Vec<thread::JoinHandle<()>>,
    down: bool,
}

impl TaskManager {
    /// Spawn `num_workers` worker threads; the calling thread joins the
    /// pool as owner 0.
    ///
    /// # Panics
    ///
    /// Panics when this thread is already attached to a task manager.
    pub fn new(num_workers: usize) -> TaskManager {
        let core = Arc::new(TaskCore {
            done: AtomicBool::new(false),
            owners: (0..num_workers + 1)
                .map(|_| OwnerData::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        });

        OWNER.with(|c| {
            assert!(
                c.get().0.is_null(),
                "this thread is already attached to a task manager"
            );
            c.set((&*core as *const TaskCore, 0));
        });

        let threads = (1..=num_workers)
            .map(|i| {
                let core = core.clone();
                thread::Builder::new()
                    .name(format!("weft-job-{}", i))
                    .spawn(move || TaskCore::worker_main(core, i))
                    .expect("failed to spawn job worker")
            })
            .collect();

        info!("task manager online: {} workers", num_workers);
        TaskManager {
            core,
            threads,
            down: false,
        }
    }

    /// A manager sized for the machine: all processors but the one the
    /// submitting thread occupies.
    pub fn with_default_workers() -> TaskManager {
        TaskManager::new(num_cpus::get().saturating_sub(1).max(1))
    }

    /// Allocate a root job from this thread's pool. `None` when the pool
    /// is exhausted, i.e. too many jobs are outstanding.
    pub fn create_task(&self, function: JobFn) -> Option<JobHandle> {
        let me = self.owner_index();
        let job = self.core.owners[me].pool.allocate()?;
        unsafe { ptr::write(job, Job::new(function, ptr::null_mut(), me as i32)) };
        Some(JobHandle::new(self.core.clone(), job))
    }

    /// Allocate a job whose completion is folded into `parent`'s. The
    /// parent is charged before the child can become visible to any
    /// worker.
    pub fn create_child_task(&self, parent: &JobHandle, function: JobFn) -> Option<JobHandle> {
        let me = self.owner_index();
        let job = self.core.owners[me].pool.allocate()?;
        unsafe {
            (*parent.raw()).unfinished.fetch_add(1, SeqCst);
            ptr::write(job, Job::new(function, parent.raw(), me as i32));
        }
        Some(JobHandle::new(self.core.clone(), job))
    }

    /// Push a job onto this thread's deque. `false` when the deque is
    /// full; well-behaved callers never see that, since the pool is sized
    /// to the deque.
    pub fn run(&self, task: &JobHandle) -> bool {
        let me = self.owner_index();
        self.core.owners[me].queue.push(task.raw())
    }

    /// Run jobs (own deque first, stealing otherwise) until `task` and
    /// all of its children have completed.
    pub fn wait(&self, task: &JobHandle) {
        let me = self.owner_index();
        while !task.is_finished() {
            if let Some(job) = self.core.get_task(me) {
                unsafe { self.core.execute(job) };
            }
        }
    }

    /// Stop and join the workers. Queued jobs that never ran are reclaimed
    /// with the pools.
    pub fn shutdown(mut self) {
        self.halt();
    }

    fn owner_index(&self) -> usize {
        let (core, index) = OWNER.with(|c| c.get());
        assert!(
            ptr::eq(core, &*self.core as *const TaskCore) && index >= 0,
            "this thread is not attached to the task manager"
        );
        index as usize
    }

    fn halt(&mut self) {
        if self.down {
            return;
        }
        self.down = true;
        self.core.done.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            handle.join().expect("job worker panicked");
        }
        OWNER.with(|c| {
            if ptr::eq(c.get().0, &*self.core as *const TaskCore) {
                c.set((ptr::null(), -1));
            }
        });
        debug!("task manager offline");
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.halt();
    }
}
