use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use weft::fiber::{
    self, Config, FiberService, Priority, Scheduler, ServiceContext, ServiceHandler, Task,
};
use weft::Counter;

fn init_logger() {
    let _ = env_logger::try_init();
}

// ---------------------------------------------------------------------------
// ten thousand nested fibers

struct NestedCtx {
    completed: AtomicUsize,
}

fn nested_child(data: *mut ()) {
    let ctx = unsafe { &*(data as *const NestedCtx) };
    fiber::yield_fiber();
    fiber::yield_fiber();
    ctx.completed.fetch_add(1, Ordering::SeqCst);
}

fn nested_outer(data: *mut ()) {
    let ctx = unsafe { &*(data as *const NestedCtx) };
    fiber::yield_fiber();
    fiber::yield_fiber();

    let child_counter = Counter::new();
    let mut child = [Task::new(nested_child, data)];
    unsafe { fiber::run_high_priority_tasks(&mut child, &child_counter) };
    fiber::wait_for_counter(&child_counter);

    ctx.completed.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn ten_thousand_nested_fibers() {
    init_logger();
    const OUTER: usize = 10_000;

    let scheduler = Scheduler::new(Config {
        num_worker_threads: 4,
        // Inline task execution during waits nests on the fiber stacks.
        small_stack_bytes: 1 << 20,
        large_stack_bytes: 1 << 20,
        ..Config::default()
    })
    .unwrap();

    let ctx = NestedCtx {
        completed: AtomicUsize::new(0),
    };
    let counter = Counter::new();
    let mut tasks: Vec<Task> = (0..OUTER)
        .map(|_| Task::new(nested_outer, &ctx as *const NestedCtx as *mut ()))
        .collect();

    unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };
    scheduler.wait_for_counter(&counter);

    assert!(counter.is_zero());
    assert_eq!(ctx.completed.load(Ordering::SeqCst), 2 * OUTER);
    scheduler.purge();
}

// ---------------------------------------------------------------------------
// single-worker correctness

fn yield_thrice(data: *mut ()) {
    assert_eq!(fiber::fiber_thread_id(), 0);
    let completed = unsafe { &*(data as *const AtomicUsize) };
    for _ in 0..3 {
        fiber::yield_fiber();
    }
    completed.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn single_worker_runs_everything_on_the_submitter() {
    init_logger();
    let scheduler = Scheduler::new(Config {
        num_worker_threads: 1,
        ..Config::default()
    })
    .unwrap();
    assert_eq!(scheduler.num_workers(), 1);
    assert!(fiber::is_in_fiber_thread());
    assert_eq!(fiber::fiber_thread_id(), 0);

    let completed = AtomicUsize::new(0);
    let counter = Counter::new();
    let mut tasks: Vec<Task> = (0..100)
        .map(|_| Task::new(yield_thrice, &completed as *const AtomicUsize as *mut ()))
        .collect();

    unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };
    scheduler.wait_for_counter(&counter);

    assert!(counter.is_zero());
    assert_eq!(completed.load(Ordering::SeqCst), 100);
    scheduler.purge();
}

// ---------------------------------------------------------------------------
// service offload

struct SleepService;

impl ServiceHandler for SleepService {
    fn update(&mut self, ctx: &ServiceContext) -> bool {
        let mut any = false;
        while let Some(request) = ctx.pop_request() {
            thread::sleep(Duration::from_millis(1));
            let served = unsafe { &*(request.payload() as *const AtomicUsize) };
            served.fetch_add(1, Ordering::SeqCst);
            ctx.complete_request(request);
            any = true;
        }
        any
    }
}

struct ServiceCtx {
    service: *const FiberService,
    served: AtomicUsize,
    resumed: AtomicUsize,
}

fn service_task(data: *mut ()) {
    let ctx = unsafe { &*(data as *const ServiceCtx) };
    let service = unsafe { &*ctx.service };
    service.enqueue_request(&ctx.served as *const AtomicUsize as *mut ());
    // The request completed before this fiber was resumed.
    assert!(ctx.served.load(Ordering::SeqCst) > 0);
    ctx.resumed.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn service_requests_complete_and_resume_fibers() {
    init_logger();
    const REQUESTS: usize = 50;

    let scheduler = Scheduler::new(Config {
        num_worker_threads: 2,
        ..Config::default()
    })
    .unwrap();
    let mut service = FiberService::start(&scheduler, SleepService);

    let ctx = ServiceCtx {
        service: &service as *const FiberService,
        served: AtomicUsize::new(0),
        resumed: AtomicUsize::new(0),
    };
    let counter = Counter::new();
    let mut tasks: Vec<Task> = (0..REQUESTS)
        .map(|_| Task::new(service_task, &ctx as *const ServiceCtx as *mut ()))
        .collect();

    unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };
    scheduler.wait_for_counter(&counter);

    assert_eq!(ctx.served.load(Ordering::SeqCst), REQUESTS);
    assert_eq!(ctx.resumed.load(Ordering::SeqCst), REQUESTS);

    service.stop();
    scheduler.purge();
}

// ---------------------------------------------------------------------------
// cancellation on service stop

struct StallService {
    cancelled: *const AtomicUsize,
}

unsafe impl Send for StallService {}

impl ServiceHandler for StallService {
    fn update(&mut self, _ctx: &ServiceContext) -> bool {
        // Never completes anything while running; requests pile up until
        // the stop-time drain cancels them.
        false
    }

    fn cancel(&mut self, _request: &fiber::Request) {
        unsafe { &*self.cancelled }.fetch_add(1, Ordering::SeqCst);
    }
}

struct StallCtx {
    service: *const FiberService,
    entered: AtomicUsize,
    resumed: AtomicUsize,
}

fn stalled_task(data: *mut ()) {
    let ctx = unsafe { &*(data as *const StallCtx) };
    ctx.entered.fetch_add(1, Ordering::SeqCst);
    let service = unsafe { &*ctx.service };
    service.enqueue_request(std::ptr::null_mut());
    ctx.resumed.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn stopping_a_service_cancels_queued_requests() {
    init_logger();
    const REQUESTS: usize = 5;

    let scheduler = Scheduler::new(Config {
        num_worker_threads: 2,
        ..Config::default()
    })
    .unwrap();

    let cancelled = AtomicUsize::new(0);
    let mut service = FiberService::start(
        &scheduler,
        StallService {
            cancelled: &cancelled as *const AtomicUsize,
        },
    );

    let ctx = StallCtx {
        service: &service as *const FiberService,
        entered: AtomicUsize::new(0),
        resumed: AtomicUsize::new(0),
    };
    let counter = Counter::new();
    let mut tasks: Vec<Task> = (0..REQUESTS)
        .map(|_| Task::new(stalled_task, &ctx as *const StallCtx as *mut ()))
        .collect();
    unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };

    while ctx.entered.load(Ordering::SeqCst) < REQUESTS {
        thread::sleep(Duration::from_millis(1));
    }
    // Generous margin for the last fibers to suspend and publish.
    thread::sleep(Duration::from_millis(100));

    service.stop();
    scheduler.wait_for_counter(&counter);

    assert_eq!(cancelled.load(Ordering::SeqCst), REQUESTS);
    assert_eq!(ctx.resumed.load(Ordering::SeqCst), REQUESTS);
    scheduler.purge();
}

// ---------------------------------------------------------------------------
// shutdown mid-flight

struct SpinCtx {
    completed: AtomicUsize,
    sink: AtomicUsize,
}

fn spin_task(data: *mut ()) {
    let ctx = unsafe { &*(data as *const SpinCtx) };
    let mut x: u64 = 0;
    for i in 0..2_000u64 {
        x = x.wrapping_mul(31).wrapping_add(i);
    }
    ctx.sink.fetch_xor(x as usize, Ordering::Relaxed);
    ctx.completed.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn purge_waits_for_submitted_tasks() {
    init_logger();
    const TASKS: usize = 1_000;

    let scheduler = Scheduler::new(Config {
        num_worker_threads: 4,
        ..Config::default()
    })
    .unwrap();

    let ctx = SpinCtx {
        completed: AtomicUsize::new(0),
        sink: AtomicUsize::new(0),
    };
    let counter = Counter::new();
    let mut tasks: Vec<Task> = (0..TASKS)
        .map(|_| Task::new(spin_task, &ctx as *const SpinCtx as *mut ()))
        .collect();
    unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };

    while ctx.completed.load(Ordering::SeqCst) < 100 {
        thread::yield_now();
    }
    scheduler.purge();

    assert_eq!(ctx.completed.load(Ordering::SeqCst), TASKS);
    assert!(counter.is_zero());
}

// ---------------------------------------------------------------------------
// boundaries

#[test]
fn empty_batch_leaves_the_counter_alone() {
    init_logger();
    let scheduler = Scheduler::new(Config::default()).unwrap();
    let counter = Counter::new();
    let mut tasks: [Task; 0] = [];
    unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };
    assert!(counter.is_zero());
    scheduler.wait_for_counter(&counter);
    scheduler.purge();
}

#[test]
fn wait_on_a_zero_counter_returns_immediately() {
    init_logger();
    let scheduler = Scheduler::new(Config::default()).unwrap();
    scheduler.wait_for_counter(&Counter::new());
    scheduler.purge();
}

#[test]
fn init_and_purge_can_be_repeated() {
    init_logger();
    for _ in 0..3 {
        let scheduler = Scheduler::new(Config::default()).unwrap();
        scheduler.purge();
    }
}

#[test]
fn double_init_on_one_thread_fails() {
    init_logger();
    let scheduler = Scheduler::new(Config::default()).unwrap();
    assert!(Scheduler::new(Config::default()).is_err());
    scheduler.purge();
}

#[test]
fn introspection_off_scheduler_threads() {
    assert!(!fiber::is_in_fiber_thread());
    assert_eq!(fiber::fiber_thread_id(), -1);
}

#[test]
fn idle_yields_are_harmless() {
    init_logger();
    let scheduler = Scheduler::new(Config::default()).unwrap();
    scheduler.yield_fiber();
    scheduler.yield_fiber();

    // The scheduler still works afterwards.
    let completed = AtomicUsize::new(0);
    let counter = Counter::new();
    let mut tasks = [Task::new(yield_thrice, &completed as *const AtomicUsize as *mut ())];
    unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };
    scheduler.wait_for_counter(&counter);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    scheduler.purge();
}

// ---------------------------------------------------------------------------
// priority and counter reuse

fn record_hp(data: *mut ()) {
    let order = unsafe { &*(data as *const Mutex<Vec<&'static str>>) };
    order.lock().unwrap().push("high");
}

fn record_lp(data: *mut ()) {
    let order = unsafe { &*(data as *const Mutex<Vec<&'static str>>) };
    order.lock().unwrap().push("low");
}

#[test]
fn high_priority_tasks_run_first() {
    init_logger();
    // One worker: nothing runs until the submitter waits, so the pop
    // order is observable.
    let scheduler = Scheduler::new(Config {
        num_worker_threads: 1,
        ..Config::default()
    })
    .unwrap();

    let order: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    let data = &order as *const Mutex<Vec<&'static str>> as *mut ();
    let counter = Counter::new();
    let mut low = [Task::new(record_lp, data)];
    let mut high = [Task::new(record_hp, data)];
    unsafe {
        scheduler.run_tasks(&mut low, &counter, Priority::Low);
        scheduler.run_tasks(&mut high, &counter, Priority::High);
    }
    scheduler.wait_for_counter(&counter);

    assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    scheduler.purge();
}

fn bump(data: *mut ()) {
    let completed = unsafe { &*(data as *const AtomicUsize) };
    completed.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn a_counter_can_be_reused_across_batches() {
    init_logger();
    let scheduler = Scheduler::new(Config {
        num_worker_threads: 2,
        ..Config::default()
    })
    .unwrap();

    let completed = AtomicUsize::new(0);
    let counter = Counter::new();
    for round in 1..=3usize {
        let mut tasks: Vec<Task> = (0..10)
            .map(|_| Task::new(bump, &completed as *const AtomicUsize as *mut ()))
            .collect();
        unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };
        scheduler.wait_for_counter(&counter);
        assert!(counter.is_zero());
        assert_eq!(completed.load(Ordering::SeqCst), round * 10);
    }
    scheduler.purge();
}

// ---------------------------------------------------------------------------
// gate: an AtomicBool the test flips to release tasks

struct GateCtx {
    gate: AtomicBool,
    completed: AtomicUsize,
}

fn gated_task(data: *mut ()) {
    let ctx = unsafe { &*(data as *const GateCtx) };
    while !ctx.gate.load(Ordering::Acquire) {
        fiber::yield_fiber();
    }
    ctx.completed.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn waiting_tasks_rotate_until_released() {
    init_logger();
    let scheduler = Scheduler::new(Config {
        num_worker_threads: 2,
        ..Config::default()
    })
    .unwrap();

    let ctx = GateCtx {
        gate: AtomicBool::new(false),
        completed: AtomicUsize::new(0),
    };
    let counter = Counter::new();
    let mut tasks: Vec<Task> = (0..8)
        .map(|_| Task::new(gated_task, &ctx as *const GateCtx as *mut ()))
        .collect();
    unsafe { scheduler.run_tasks(&mut tasks, &counter, Priority::Low) };

    thread::sleep(Duration::from_millis(10));
    assert_eq!(ctx.completed.load(Ordering::SeqCst), 0);
    assert!(!counter.is_zero());

    ctx.gate.store(true, Ordering::Release);
    scheduler.wait_for_counter(&counter);
    assert_eq!(ctx.completed.load(Ordering::SeqCst), 8);
    scheduler.purge();
}
