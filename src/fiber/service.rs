//! Service offload: dedicated threads that absorb blocking work on behalf
//! of fibers.
//!
//! A fiber that would otherwise block calls [`FiberService::enqueue_request`];
//! it is suspended, ignored by the ready queues, and resumed once the
//! service thread has completed (or cancelled) the request. The service's
//! `update` hook runs on its own OS thread and may block freely.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

use crate::counter::Counter;
use crate::fiber::fiber::FiberSlot;
use crate::fiber::scheduler::{Scheduler, SchedulerCore};
use crate::queue::{Node, SpinLockQueue};

/// A suspended fiber's request, parked in the service queue. The record
/// lives on the requesting context's stack for the duration of the wait.
pub(crate) struct ServiceRequest {
    next: AtomicPtr<ServiceRequest>,
    /// Fiber to re-ready on completion; null for requests issued from the
    /// submitting thread's root context, which polls instead.
    pub(crate) fiber: *mut FiberSlot,
    pub(crate) payload: *mut (),
    /// Private one-shot barrier, starting at 1; the service decrements it
    /// exactly once per request, on completion or cancellation.
    pub(crate) counter: *const Counter,
}

unsafe impl Send for ServiceRequest {}
unsafe impl Sync for ServiceRequest {}

unsafe impl Node for ServiceRequest {
    fn next_slot(&self) -> &AtomicPtr<ServiceRequest> {
        &self.next
    }
}

impl ServiceRequest {
    pub(crate) fn new(fiber: *mut FiberSlot, payload: *mut (), counter: *const Counter) -> ServiceRequest {
        ServiceRequest {
            next: AtomicPtr::new(ptr::null_mut()),
            fiber,
            payload,
            counter,
        }
    }
}

/// A pending request as seen by a [`ServiceHandler`].
pub struct Request(pub(crate) NonNull<ServiceRequest>);

impl Request {
    /// The opaque payload the requesting fiber passed to
    /// [`FiberService::enqueue_request`].
    pub fn payload(&self) -> *mut () {
        unsafe { self.0.as_ref().payload }
    }
}

/// User extension point: the blocking half of a service.
///
/// `update` runs on the service thread. It should pop whatever requests
/// are pending, perform their blocking work, and complete each one; it
/// returns whether it did any work, so the thread knows when to park.
/// `cancel` is invoked for requests still queued when the service stops;
/// the request is completed regardless, so its fiber always resumes.
pub trait ServiceHandler: Send + 'static {
    fn update(&mut self, ctx: &ServiceContext) -> bool;

    fn cancel(&mut self, _request: &Request) {}
}

/// Handle the service thread uses to drain and complete requests.
pub struct ServiceContext {
    inner: Arc<ServiceInner>,
}

impl ServiceContext {
    pub fn pop_request(&self) -> Option<Request> {
        self.inner.queue.pop().map(Request)
    }

    /// Complete a request: releases its private counter and, for fiber
    /// requests, puts the fiber back in a ready queue. The completion
    /// happens-before the fiber's resume.
    pub fn complete_request(&self, request: Request) {
        // Copy the fields out first: once the counter drops, a polling
        // root context may return and invalidate the request's storage.
        let (fiber, counter) = unsafe {
            let r = request.0.as_ref();
            (r.fiber, r.counter)
        };
        unsafe { (*counter).decrement() };
        self.inner.core.notify_service_complete();
        if let Some(fiber) = NonNull::new(fiber) {
            self.inner.core.ready_fiber(fiber);
        }
    }
}

pub(crate) struct ServiceInner {
    queue: SpinLockQueue<ServiceRequest>,
    finished: AtomicBool,
    notified: AtomicBool,
    signal: Mutex<()>,
    available: Condvar,
    pub(crate) core: Arc<SchedulerCore>,
}

impl ServiceInner {
    /// Hand a request to the service thread. For fiber requests this runs
    /// in the worker's root context, after the requesting fiber has
    /// actually suspended.
    pub(crate) unsafe fn publish(&self, request: NonNull<ServiceRequest>) {
        self.queue.push(request);
        self.notify();
    }

    fn notify(&self) {
        if !self.notified.swap(true, Ordering::AcqRel) {
            let _guard = self.signal.lock().unwrap();
            self.available.notify_one();
        }
    }

    fn wait_for_update(&self) {
        if !self.notified.swap(false, Ordering::AcqRel) {
            let mut guard = self.signal.lock().unwrap();
            while !self.notified.swap(false, Ordering::AcqRel) {
                if self.finished.load(Ordering::Acquire) {
                    break;
                }
                guard = self.available.wait(guard).unwrap();
            }
        }
    }
}

/// A running service: an OS thread plus the queue of suspended fibers
/// waiting on it.
///
/// Stop (or drop) the service before purging the scheduler; outstanding
/// requests are cancelled on stop, and cancellation still completes each
/// request's counter so every waiting fiber resumes.
pub struct FiberService {
    inner: Arc<ServiceInner>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FiberService {
    pub fn start<H: ServiceHandler>(scheduler: &Scheduler, mut handler: H) -> FiberService {
        let core = scheduler.core();
        core.service_started();

        let inner = Arc::new(ServiceInner {
            queue: SpinLockQueue::new(),
            finished: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            signal: Mutex::new(()),
            available: Condvar::new(),
            core,
        });

        let thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("weft-service".into())
                .spawn(move || {
                    debug!("service thread online");
                    let ctx = ServiceContext { inner: inner.clone() };
                    while !inner.finished.load(Ordering::Acquire) {
                        if !handler.update(&ctx) {
                            inner.wait_for_update();
                        }
                    }
                    // Drain by cancellation so no fiber stays suspended.
                    while let Some(request) = ctx.pop_request() {
                        handler.cancel(&request);
                        ctx.complete_request(request);
                    }
                    debug!("service thread offline");
                })
                .expect("failed to spawn service thread")
        };

        FiberService {
            inner,
            thread: Some(thread),
        }
    }

    /// Issue a blocking request from a fiber (or from the submitting
    /// thread's root context). Returns once the service has completed or
    /// cancelled the request; other tasks and fibers run in the meantime.
    pub fn enqueue_request(&self, payload: *mut ()) {
        let core = self.inner.core.clone();
        core.yield_to_service(&self.inner, payload);
    }

    /// Stop the service thread and cancel whatever is still queued.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.inner.finished.store(true, Ordering::Release);
            self.inner.notify();
            thread.join().expect("service thread panicked");
            self.inner.core.service_stopped();
            debug!("service stopped");
        }
    }
}

impl Drop for FiberService {
    fn drop(&mut self) {
        self.stop();
    }
}
