//! The fiber scheduler core: fiber pool, worker threads, task queues, and
//! the cooperative dispatch machinery.
//!
//! Workers multiplex pooled fibers over OS threads. Each worker's root
//! context is the trampoline every fiber suspends back to; the root acts
//! on the fiber's verdict only after the switch has completed, so a fiber
//! can never be observed in a ready queue while some thread still runs its
//! stack. The thread that creates the scheduler becomes worker 0 and
//! participates through its wait and yield calls rather than a loop of its
//! own.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use corosensei::CoroutineResult;
use failure::bail;
use log::{debug, error, info};

use crate::counter::Counter;
use crate::errors::Result;
use crate::fiber::fiber::{FiberSlot, FiberYielder, Suspend};
use crate::fiber::service::{ServiceInner, ServiceRequest};
use crate::fiber::task::{Priority, Task};
use crate::fiber::Config;
use crate::queue::{Node, SpinLockQueue};
use crate::unwind::{trap_panic, AbortFence};

thread_local! {
    /// Scheduler this thread serves, and its worker index (-1 off pool).
    static CURRENT: Cell<(*const SchedulerCore, isize)> = Cell::new((ptr::null(), -1));
    /// Fiber currently resumed on this thread, null in a root context.
    static CURRENT_FIBER: Cell<*mut FiberSlot> = Cell::new(ptr::null_mut());
}

fn bind_thread(core: *const SchedulerCore, index: isize) {
    CURRENT.with(|c| {
        debug_assert!(c.get().0.is_null(), "thread already serves a fiber scheduler");
        c.set((core, index));
    });
}

fn unbind_thread() {
    CURRENT.with(|c| c.set((ptr::null(), -1)));
}

pub(crate) fn current_core() -> *const SchedulerCore {
    CURRENT.with(|c| c.get().0)
}

pub(crate) fn current_index() -> isize {
    CURRENT.with(|c| c.get().1)
}

fn current_fiber() -> *mut FiberSlot {
    CURRENT_FIBER.with(|c| c.get())
}

/// What a resumed fiber did before control came back to the root context.
enum ResumeOutcome {
    Rescheduled,
    WentIdle,
    Blocked,
    Retired,
}

/// Per-worker shared state.
pub(crate) struct WorkerData {
    /// Ready fibers pinned to this worker.
    pub(crate) affinity_queue: SpinLockQueue<FiberSlot>,
    /// Parking slot: the fiber this worker is currently executing, while
    /// it is absent from every queue. Non-null only between a resume and
    /// the hand-off of its verdict.
    last_fiber: AtomicPtr<FiberSlot>,
}

impl WorkerData {
    fn new() -> WorkerData {
        WorkerData {
            affinity_queue: SpinLockQueue::new(),
            last_fiber: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Startup handshake. Spawned workers report in once their thread-local
/// state is bound; the constructor blocks until the whole pool is online,
/// so no submission can race a half-initialized worker.
struct StartupGate {
    online: Mutex<usize>,
    all_online: Condvar,
}

impl StartupGate {
    fn new() -> StartupGate {
        StartupGate {
            online: Mutex::new(0),
            all_online: Condvar::new(),
        }
    }

    fn worker_online(&self, index: usize) {
        let mut online = self.online.lock().unwrap();
        *online += 1;
        debug!("fiber worker {} online ({} workers up)", index, *online);
        self.all_online.notify_all();
    }

    fn wait_for(&self, expected: usize) {
        let mut online = self.online.lock().unwrap();
        while *online < expected {
            online = self.all_online.wait(online).unwrap();
        }
    }
}

pub(crate) struct SchedulerCore {
    exit_requested: AtomicBool,

    high_priority_tasks: SpinLockQueue<Task>,
    low_priority_tasks: SpinLockQueue<Task>,
    /// Ready fibers with no thread affinity.
    ready_fibers: SpinLockQueue<FiberSlot>,
    pub(crate) workers: Vec<WorkerData>,

    /// Tasks submitted and not yet completed. Guards the parking of
    /// non-primary workers.
    pending_tasks: AtomicUsize,
    tasks_mutex: Mutex<()>,
    tasks_cv: Condvar,

    /// Fiber-availability parking for workers that have tasks but no
    /// runnable fiber (every fiber suspended on a service).
    fibers_mutex: Mutex<()>,
    fibers_cv: Condvar,
    parked_workers: AtomicUsize,

    waiting_service_fibers: AtomicUsize,
    max_waiting_service_fibers: usize,
    live_services: AtomicUsize,

    startup: StartupGate,

    /// Pool storage; queues link the boxed slots by pointer.
    fibers: Mutex<Vec<Box<FiberSlot>>>,

    panic_handler: Option<Box<crate::fiber::PanicHandler>>,
}

impl SchedulerCore {
    fn new(workers: usize, panic_handler: Option<Box<crate::fiber::PanicHandler>>) -> SchedulerCore {
        SchedulerCore {
            exit_requested: AtomicBool::new(false),
            high_priority_tasks: SpinLockQueue::new(),
            low_priority_tasks: SpinLockQueue::new(),
            ready_fibers: SpinLockQueue::new(),
            workers: (0..workers).map(|_| WorkerData::new()).collect(),
            pending_tasks: AtomicUsize::new(0),
            tasks_mutex: Mutex::new(()),
            tasks_cv: Condvar::new(),
            fibers_mutex: Mutex::new(()),
            fibers_cv: Condvar::new(),
            parked_workers: AtomicUsize::new(0),
            waiting_service_fibers: AtomicUsize::new(0),
            max_waiting_service_fibers: 0,
            live_services: AtomicUsize::new(0),
            startup: StartupGate::new(),
            fibers: Mutex::new(Vec::new()),
            panic_handler,
        }
    }

    #[inline]
    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // submission

    /// See [`crate::fiber::run_tasks`] for the contract. The counter is
    /// charged before the batch becomes visible in any queue, and the
    /// batch keeps its submission order.
    pub(crate) unsafe fn run_tasks(&self, tasks: &mut [Task], counter: &Counter, priority: Priority) {
        if tasks.is_empty() {
            return;
        }
        assert!(
            !self.exit_requested(),
            "tasks submitted to a scheduler that is shutting down"
        );

        counter.increment(tasks.len());
        for task in tasks.iter() {
            task.set_counter(counter as *const Counter);
        }
        for i in 0..tasks.len() - 1 {
            let next = &tasks[i + 1] as *const Task as *mut Task;
            tasks[i].next_slot().store(next, Ordering::Relaxed);
        }
        tasks[tasks.len() - 1]
            .next_slot()
            .store(ptr::null_mut(), Ordering::Relaxed);

        let first = NonNull::from(&tasks[0]);
        let last = NonNull::from(&tasks[tasks.len() - 1]);
        match priority {
            Priority::High => self.high_priority_tasks.push_chain(first, last),
            Priority::Low => self.low_priority_tasks.push_chain(first, last),
        }
        self.notify_tasks_submitted(tasks.len());
    }

    fn notify_tasks_submitted(&self, count: usize) {
        // Workers only park when the pending count is zero, so only the
        // zero-to-nonzero transition needs the mutex and the broadcast.
        if self.pending_tasks.load(Ordering::Acquire) == 0 {
            let guard = self.tasks_mutex.lock().unwrap();
            self.pending_tasks.fetch_add(count, Ordering::AcqRel);
            drop(guard);
            self.tasks_cv.notify_all();
        } else {
            self.pending_tasks.fetch_add(count, Ordering::AcqRel);
        }
    }

    fn notify_task_complete(&self) {
        if self.pending_tasks.load(Ordering::Acquire) == 1 {
            let _guard = self.tasks_mutex.lock().unwrap();
            self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
        } else {
            self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        self.tasks_cv.notify_all();
    }

    pub(crate) fn pop_task(&self) -> Option<NonNull<Task>> {
        self.high_priority_tasks
            .pop()
            .or_else(|| self.low_priority_tasks.pop())
    }

    /// Run one task to completion on the current stack. The counter is
    /// decremented exactly once, panic or not, and always after the task
    /// function has stopped running.
    pub(crate) unsafe fn execute_task(&self, task: NonNull<Task>) {
        let task = task.as_ref();
        let counter = task.counter();
        task.clear_counter();
        if let Some(payload) = trap_panic(|| task.invoke()) {
            self.contain_task_panic(payload);
        }
        // `task` may be released by the waiter as soon as the counter
        // drops; it must not be touched past this point.
        (*counter).decrement();
        self.notify_task_complete();
    }

    /// A task panicked. Its counter still gets the decrement, so waiters
    /// make progress either way; the payload goes to the installed
    /// handler, and with no handler the process goes down rather than
    /// swallow the panic.
    fn contain_task_panic(&self, payload: Box<dyn std::any::Any + Send>) {
        let worker = current_index();
        error!("task panicked on worker {}", worker);
        match self.panic_handler {
            Some(ref handler) => {
                let fence = AbortFence::new("the task panic handler", worker);
                handler(payload);
                fence.disarm();
            }
            None => {
                error!("no panic handler is installed; aborting");
                std::process::abort();
            }
        }
    }

    // ---------------------------------------------------------------------
    // fiber selection and hand-off

    /// Pick the next ready fiber for `me`: the worker's own affinity queue
    /// first, then the global queue. A global fiber pinned elsewhere is
    /// forwarded to its owner and the global queue is consulted once more.
    fn pick_next_fiber(&self, me: usize) -> Option<NonNull<FiberSlot>> {
        if let Some(fiber) = self.workers[me].affinity_queue.pop() {
            return Some(fiber);
        }
        let fiber = self.ready_fibers.pop()?;
        let owner = unsafe { fiber.as_ref().owner() };
        if owner >= 0 && owner as usize != me {
            unsafe { self.workers[owner as usize].affinity_queue.push(fiber) };
            self.notify_fibers();
            return self.ready_fibers.pop();
        }
        Some(fiber)
    }

    /// Put a fiber back where it can be resumed: its owner's affinity
    /// queue when pinned, the global ready queue otherwise.
    pub(crate) fn ready_fiber(&self, fiber: NonNull<FiberSlot>) {
        let owner = unsafe { fiber.as_ref().owner() };
        unsafe {
            if owner >= 0 {
                self.workers[owner as usize].affinity_queue.push(fiber);
            } else {
                self.ready_fibers.push(fiber);
            }
        }
        self.notify_fibers();
    }

    /// Resume `fiber` on worker `me` and act on its verdict. The verdict
    /// is handled only after `resume` has returned, i.e. after the fiber's
    /// stack has gone quiescent; this is the parking-slot invariant.
    fn resume_fiber(&self, me: usize, fiber: NonNull<FiberSlot>) -> ResumeOutcome {
        let data = &self.workers[me];
        debug_assert!(data.last_fiber.load(Ordering::Relaxed).is_null());
        data.last_fiber.store(fiber.as_ptr(), Ordering::Relaxed);
        CURRENT_FIBER.with(|c| c.set(fiber.as_ptr()));

        let result = unsafe { fiber.as_ref().resume() };

        CURRENT_FIBER.with(|c| c.set(ptr::null_mut()));
        data.last_fiber.store(ptr::null_mut(), Ordering::Relaxed);

        match result {
            CoroutineResult::Yield(Suspend::Reschedule) => {
                self.ready_fiber(fiber);
                ResumeOutcome::Rescheduled
            }
            CoroutineResult::Yield(Suspend::Idle) => {
                self.ready_fiber(fiber);
                ResumeOutcome::WentIdle
            }
            CoroutineResult::Yield(Suspend::Service { service, request }) => {
                // The fiber is quiescent now, so the request may become
                // visible to the service thread.
                unsafe {
                    (*service).publish(NonNull::new_unchecked(request));
                }
                ResumeOutcome::Blocked
            }
            CoroutineResult::Return(()) => ResumeOutcome::Retired,
        }
    }

    // ---------------------------------------------------------------------
    // parking

    fn wait_for_tasks(&self, me: usize) {
        // Worker 0 is the application's submitting thread: its wait loops
        // end on conditions other than "a task is pending", so parking it
        // here could strand it after the final completion. It spins with
        // yield hints instead.
        if me == 0 {
            return;
        }
        let mut guard = self.tasks_mutex.lock().unwrap();
        while self.pending_tasks.load(Ordering::Acquire) == 0 && !self.exit_requested() {
            guard = self.tasks_cv.wait(guard).unwrap();
        }
    }

    /// Park until some fiber may be runnable again. This is the
    /// backpressure path: it engages when tasks are pending but every
    /// fiber is suspended on a service, and it is bounded so a missed
    /// notification costs a millisecond, not a hang.
    fn wait_for_fibers(&self, me: usize) {
        self.parked_workers.fetch_add(1, Ordering::SeqCst);
        let guard = self.fibers_mutex.lock().unwrap();
        if self.no_runnable_fiber(me) && !self.exit_requested() {
            let _ = self
                .fibers_cv
                .wait_timeout(guard, Duration::from_millis(1))
                .unwrap();
        }
        self.parked_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn no_runnable_fiber(&self, me: usize) -> bool {
        self.workers[me].affinity_queue.is_empty() && self.ready_fibers.is_empty()
    }

    fn notify_fibers(&self) {
        if self.parked_workers.load(Ordering::SeqCst) > 0 {
            let _guard = self.fibers_mutex.lock().unwrap();
            self.fibers_cv.notify_all();
        }
    }

    // ---------------------------------------------------------------------
    // dispatch

    /// Body of every pooled fiber.
    pub(crate) fn dispatch_loop(&self, yielder: &FiberYielder) {
        while !self.exit_requested() {
            if let Some(task) = self.pop_task() {
                unsafe { self.execute_task(task) };
            } else {
                yielder.suspend(Suspend::Idle);
            }
        }
    }

    /// Worker thread entry point for workers 1..n.
    fn worker_main(core: Arc<SchedulerCore>, me: usize) {
        bind_thread(&*core as *const SchedulerCore, me as isize);
        core.startup.worker_online(me);

        while !core.exit_requested() {
            match core.pick_next_fiber(me) {
                Some(fiber) => {
                    if let ResumeOutcome::WentIdle = core.resume_fiber(me, fiber) {
                        if core.pending_tasks.load(Ordering::Acquire) == 0 {
                            core.wait_for_tasks(me);
                        } else {
                            thread::yield_now();
                        }
                    }
                }
                None => {
                    if core.pending_tasks.load(Ordering::Acquire) == 0 {
                        core.wait_for_tasks(me);
                    } else {
                        core.wait_for_fibers(me);
                    }
                }
            }
        }

        // Retire fibers pinned to this worker on this worker, so their
        // stacks unwind where they were promised to run.
        while let Some(fiber) = core.workers[me].affinity_queue.pop() {
            core.resume_fiber(me, fiber);
        }
        debug!("fiber worker {} offline", me);
    }

    /// Wait loop for the submitting thread's root context: run tasks
    /// inline, rotate ready fibers, and spin politely when neither is
    /// available.
    pub(crate) fn wait_root<F: Fn() -> bool>(&self, done: F) {
        debug_assert_eq!(current_index(), 0);
        debug_assert!(current_fiber().is_null());
        while !done() {
            if let Some(task) = self.pop_task() {
                unsafe { self.execute_task(task) };
                continue;
            }
            match self.pick_next_fiber(0) {
                Some(fiber) => {
                    if let ResumeOutcome::WentIdle = self.resume_fiber(0, fiber) {
                        thread::yield_now();
                    }
                }
                None => {
                    self.wait_for_tasks(0);
                    thread::yield_now();
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // waits, yields, services

    pub(crate) fn wait_for_counter(&self, counter: &Counter) {
        if counter.is_zero() {
            return;
        }
        let fiber = current_fiber();
        if fiber.is_null() {
            assert_eq!(
                current_index(),
                0,
                "wait_for_counter called outside the fiber scheduler"
            );
            self.wait_root(|| counter.is_zero());
        } else {
            let yielder = unsafe { &*(*fiber).yielder() };
            while !counter.is_zero() {
                if let Some(task) = self.pop_task() {
                    // Running another task inline keeps the pool making
                    // progress when subtasks wait on further counters; the
                    // price is depth on this fiber's stack.
                    unsafe { self.execute_task(task) };
                } else {
                    yielder.suspend(Suspend::Idle);
                }
            }
        }
    }

    pub(crate) fn yield_fiber(&self) {
        let fiber = current_fiber();
        if fiber.is_null() {
            assert_eq!(
                current_index(),
                0,
                "yield_fiber called outside the fiber scheduler"
            );
            // The root context cannot suspend; give a ready fiber its turn
            // instead.
            if let Some(fiber) = self.pick_next_fiber(0) {
                self.resume_fiber(0, fiber);
            }
        } else {
            let yielder = unsafe { &*(*fiber).yielder() };
            yielder.suspend(Suspend::Reschedule);
        }
    }

    pub(crate) fn yield_to_service(&self, service: &ServiceInner, payload: *mut ()) {
        let fiber = current_fiber();
        let counter = Counter::new();
        counter.increment(1);
        let request = ServiceRequest::new(fiber, payload, &counter as *const Counter);
        let request_ptr = &request as *const ServiceRequest as *mut ServiceRequest;

        let waiting = self.waiting_service_fibers.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(
            waiting <= self.max_waiting_service_fibers,
            "service backpressure ceiling exceeded"
        );

        if fiber.is_null() {
            assert_eq!(
                current_index(),
                0,
                "enqueue_request called outside the fiber scheduler"
            );
            // The root context keeps its stack, so the request can be
            // published right away; it polls the private counter while
            // driving other work.
            unsafe { service.publish(NonNull::new_unchecked(request_ptr)) };
            self.wait_root(|| counter.is_zero());
        } else {
            let yielder = unsafe { &*(*fiber).yielder() };
            yielder.suspend(Suspend::Service {
                service: service as *const ServiceInner,
                request: request_ptr,
            });
            // Completion re-readies this fiber after releasing the
            // counter, so one resume normally suffices.
            while !counter.is_zero() {
                yielder.suspend(Suspend::Idle);
            }
        }
    }

    pub(crate) fn notify_service_complete(&self) {
        self.waiting_service_fibers.fetch_sub(1, Ordering::AcqRel);
        self.notify_fibers();
    }

    pub(crate) fn service_started(&self) {
        self.live_services.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn service_stopped(&self) {
        self.live_services.fetch_sub(1, Ordering::SeqCst);
    }
}

// -------------------------------------------------------------------------
// public handle

/// Handle to a running fiber scheduler.
///
/// The creating thread becomes worker 0 and stays bound to the scheduler
/// until [`purge`](Scheduler::purge); it submits work, and participates in
/// execution through [`wait_for_counter`](crate::fiber::wait_for_counter)
/// and [`yield_fiber`](crate::fiber::yield_fiber).
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    threads: Vec<thread::JoinHandle<()>>,
    purged: bool,
}

impl Scheduler {
    /// Bring up the fiber pool and worker threads. Fails on nonsensical
    /// configurations, if this thread already serves a scheduler, or if a
    /// fiber stack cannot be allocated.
    pub fn new(config: Config) -> Result<Scheduler> {
        let Config {
            num_worker_threads,
            num_high_priority_worker_threads,
            small_stack_bytes,
            large_stack_bytes,
            num_small_fibers_per_thread,
            num_large_fibers_per_thread,
            num_small_fibers_per_hp_thread,
            num_large_fibers_per_hp_thread,
            panic_handler,
        } = config;

        if num_worker_threads == 0 {
            bail!("fiber scheduler needs at least one worker thread");
        }
        if num_high_priority_worker_threads > num_worker_threads {
            bail!(
                "{} high priority workers requested but only {} workers total",
                num_high_priority_worker_threads,
                num_worker_threads
            );
        }
        if small_stack_bytes == 0 || large_stack_bytes == 0 {
            bail!("fiber stack sizes must be non-zero");
        }
        let regular = num_worker_threads - num_high_priority_worker_threads;
        let num_small = num_small_fibers_per_thread * regular
            + num_small_fibers_per_hp_thread * num_high_priority_worker_threads;
        let num_large = num_large_fibers_per_thread * regular
            + num_large_fibers_per_hp_thread * num_high_priority_worker_threads;
        if num_small + num_large == 0 {
            bail!("configuration allocates no fibers");
        }
        if !current_core().is_null() {
            bail!("this thread already serves a fiber scheduler");
        }

        let mut core = SchedulerCore::new(num_worker_threads, panic_handler);
        core.max_waiting_service_fibers = num_small + num_large + num_worker_threads;
        let core = Arc::new(core);

        {
            let mut fibers = core.fibers.lock().unwrap();
            for _ in 0..num_small {
                let slot = FiberSlot::spawn(&*core as *const SchedulerCore, false, small_stack_bytes)?;
                unsafe { core.ready_fibers.push(NonNull::from(&*slot)) };
                fibers.push(slot);
            }
            for _ in 0..num_large {
                let slot = FiberSlot::spawn(&*core as *const SchedulerCore, true, large_stack_bytes)?;
                unsafe { core.ready_fibers.push(NonNull::from(&*slot)) };
                fibers.push(slot);
            }
        }

        let mut threads = Vec::with_capacity(num_worker_threads - 1);
        for i in 1..num_worker_threads {
            let worker_core = core.clone();
            let thread = thread::Builder::new()
                .name(format!("weft-worker-{}", i))
                .spawn(move || SchedulerCore::worker_main(worker_core, i));
            match thread {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    core.exit_requested.store(true, Ordering::Relaxed);
                    {
                        let _guard = core.tasks_mutex.lock().unwrap();
                    }
                    core.tasks_cv.notify_all();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    core.fibers.lock().unwrap().clear();
                    bail!("failed to spawn fiber worker {}: {}", i, err);
                }
            }
        }
        core.startup.wait_for(num_worker_threads - 1);

        bind_thread(&*core as *const SchedulerCore, 0);
        info!(
            "fiber scheduler online: {} workers ({} high priority), {} small + {} large fibers",
            num_worker_threads, num_high_priority_worker_threads, num_small, num_large
        );

        Ok(Scheduler {
            core,
            threads,
            purged: false,
        })
    }

    pub(crate) fn core(&self) -> Arc<SchedulerCore> {
        self.core.clone()
    }

    /// Submit a batch of tasks. Order within the batch is preserved.
    ///
    /// # Safety
    ///
    /// Every task, and the counter, must stay alive and in place until a
    /// wait on `counter` has returned. The scheduler links the tasks
    /// through their intrusive slots for the duration.
    pub unsafe fn run_tasks(&self, tasks: &mut [Task], counter: &Counter, priority: Priority) {
        self.core.run_tasks(tasks, counter, priority);
    }

    /// Wait until `counter` reads zero, executing other tasks meanwhile.
    /// Must be called from worker 0 or from inside a task.
    pub fn wait_for_counter(&self, counter: &Counter) {
        self.core.wait_for_counter(counter);
    }

    pub fn yield_fiber(&self) {
        self.core.yield_fiber();
    }

    pub fn num_workers(&self) -> usize {
        self.core.workers.len()
    }

    /// Drain outstanding tasks, stop the workers, and release the fiber
    /// pool. Must run on the thread that created the scheduler.
    pub fn purge(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.purged {
            return;
        }
        self.purged = true;
        debug_assert!(
            ptr::eq(current_core(), &*self.core) && current_index() == 0,
            "purge must run on the thread that created the scheduler"
        );

        // Every submitted task runs to completion before workers go down;
        // this thread helps, so a one-worker scheduler drains too.
        debug!("fiber scheduler draining");
        let core = self.core.clone();
        core.wait_root(|| core.pending_tasks.load(Ordering::Acquire) == 0);

        debug_assert_eq!(
            core.live_services.load(Ordering::SeqCst),
            0,
            "stop services before purging the scheduler"
        );

        // Relaxed is enough: the condvar handshakes below order the store
        // for every parked worker.
        core.exit_requested.store(true, Ordering::Relaxed);
        {
            let _guard = core.tasks_mutex.lock().unwrap();
        }
        core.tasks_cv.notify_all();
        {
            let _guard = core.fibers_mutex.lock().unwrap();
        }
        core.fibers_cv.notify_all();

        for handle in self.threads.drain(..) {
            handle.join().expect("fiber worker panicked");
        }

        // Retire what is left: fibers pinned to worker 0, then the global
        // ready queue. Each observes the exit flag and returns.
        while let Some(fiber) = core.workers[0].affinity_queue.pop() {
            core.resume_fiber(0, fiber);
        }
        while let Some(fiber) = core.ready_fibers.pop() {
            core.resume_fiber(0, fiber);
        }

        let mut fibers = core.fibers.lock().unwrap();
        for fiber in fibers.iter() {
            unsafe { fiber.unwind() };
        }
        fibers.clear();
        drop(fibers);

        unbind_thread();
        info!("fiber scheduler purged");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fiber::Config;

    #[test]
    fn forwarding_respects_affinity() {
        // A pinned fiber popped from the global queue must land in its
        // owner's affinity queue, not run on the popping worker.
        let core = Arc::new(SchedulerCore::new(2, None));
        let slot = FiberSlot::spawn(&*core as *const SchedulerCore, false, 64 * 1024).unwrap();
        slot.pin_to(1);
        unsafe { core.ready_fibers.push(NonNull::from(&*slot)) };

        assert!(core.pick_next_fiber(0).is_none());
        let forwarded = core.workers[1].affinity_queue.pop().unwrap();
        assert_eq!(forwarded.as_ptr(), &*slot as *const FiberSlot as *mut FiberSlot);
        // Owner finds it through the normal path.
        unsafe { core.workers[1].affinity_queue.push(forwarded) };
        assert!(core.pick_next_fiber(1).is_some());
    }

    #[test]
    fn pool_composition_follows_config() {
        let scheduler = Scheduler::new(Config {
            num_worker_threads: 2,
            num_high_priority_worker_threads: 1,
            num_small_fibers_per_thread: 3,
            num_large_fibers_per_thread: 2,
            num_small_fibers_per_hp_thread: 1,
            num_large_fibers_per_hp_thread: 1,
            ..Config::default()
        })
        .unwrap();

        {
            let fibers = scheduler.core.fibers.lock().unwrap();
            let large = fibers.iter().filter(|f| f.is_large_stack()).count();
            let small = fibers.len() - large;
            assert_eq!(small, 3 + 1);
            assert_eq!(large, 2 + 1);
        }
        assert_eq!(
            scheduler.core.max_waiting_service_fibers,
            (3 + 1) + (2 + 1) + 2
        );
        scheduler.purge();
    }

    #[test]
    fn rejects_bad_configurations() {
        assert!(Scheduler::new(Config {
            num_worker_threads: 0,
            ..Config::default()
        })
        .is_err());
        assert!(Scheduler::new(Config {
            num_worker_threads: 1,
            num_high_priority_worker_threads: 2,
            ..Config::default()
        })
        .is_err());
        assert!(Scheduler::new(Config {
            num_small_fibers_per_thread: 0,
            num_large_fibers_per_thread: 0,
            ..Config::default()
        })
        .is_err());
    }
}
