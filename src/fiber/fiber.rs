use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use failure::format_err;

use crate::errors::Result;
use crate::fiber::scheduler::SchedulerCore;
use crate::fiber::service::{ServiceInner, ServiceRequest};
use crate::queue::Node;

/// Verdict a fiber hands back to its worker's root context when it
/// suspends. The worker acts on it only after the switch has completed,
/// which is what keeps a fiber out of every ready queue while its stack is
/// still live.
pub(crate) enum Suspend {
    /// Cooperative yield; put the fiber back in a ready queue.
    Reschedule,
    /// Found nothing to run; put the fiber back and let the worker decide
    /// whether to park.
    Idle,
    /// The fiber is blocked on a service request. Publish the request to
    /// the service now that the fiber is quiescent, and do not re-enqueue:
    /// completion of the request readies the fiber again.
    Service {
        service: *const ServiceInner,
        request: *mut ServiceRequest,
    },
}

pub(crate) type FiberCo = Coroutine<(), Suspend, (), DefaultStack>;
pub(crate) type FiberYielder = Yielder<(), Suspend>;

struct CorePtr(*const SchedulerCore);
unsafe impl Send for CorePtr {}

struct SlotPtr(*mut FiberSlot);
unsafe impl Send for SlotPtr {}

/// A pooled fiber: a stackful coroutine plus the scheduling metadata the
/// queues link through.
///
/// `owner` is the index of the worker the fiber is pinned to, or -1 for an
/// unpinned fiber that any worker may resume. Exactly one thread resumes a
/// fiber at a time; the hand-off through `Suspend` verdicts serializes
/// ownership of the coroutine cell.
pub(crate) struct FiberSlot {
    next: AtomicPtr<FiberSlot>,
    owner: AtomicI32,
    large_stack: bool,
    co: UnsafeCell<Option<FiberCo>>,
    yielder: AtomicPtr<FiberYielder>,
}

// The coroutine itself is !Send: a suspended stack could hold references
// into thread-local storage. The scheduler moves fibers between workers
// anyway, which is sound for everything the crate itself keeps on fiber
// stacks (scheduler core references, queue nodes, request records); task
// code is forbidden from holding thread-local borrows across a suspension
// point, see the module docs.
unsafe impl Send for FiberSlot {}
unsafe impl Sync for FiberSlot {}

unsafe impl Node for FiberSlot {
    fn next_slot(&self) -> &AtomicPtr<FiberSlot> {
        &self.next
    }
}

impl FiberSlot {
    /// Allocate a fiber and its stack. The coroutine body is the dispatch
    /// loop; it runs until the scheduler requests exit.
    pub(crate) fn spawn(
        core: *const SchedulerCore,
        large_stack: bool,
        stack_bytes: usize,
    ) -> Result<Box<FiberSlot>> {
        let mut slot = Box::new(FiberSlot {
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicI32::new(-1),
            large_stack,
            co: UnsafeCell::new(None),
            yielder: AtomicPtr::new(ptr::null_mut()),
        });

        let stack = DefaultStack::new(stack_bytes)
            .map_err(|err| format_err!("failed to allocate a {} byte fiber stack: {}", stack_bytes, err))?;

        let core_ptr = CorePtr(core);
        let slot_ptr = SlotPtr(&mut *slot as *mut FiberSlot);
        let co = Coroutine::with_stack(stack, move |yielder: &FiberYielder, _input: ()| {
            let slot = unsafe { &*slot_ptr.0 };
            let core = unsafe { &*core_ptr.0 };
            slot.yielder
                .store(yielder as *const FiberYielder as *mut FiberYielder, Ordering::Release);
            core.dispatch_loop(yielder);
        });
        unsafe {
            *slot.co.get() = Some(co);
        }
        Ok(slot)
    }

    #[inline]
    pub(crate) fn owner(&self) -> i32 {
        self.owner.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn pin_to(&self, worker: i32) {
        self.owner.store(worker, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_large_stack(&self) -> bool {
        self.large_stack
    }

    /// Pointer to the fiber's yielder, valid from the first resume until
    /// the coroutine returns. Suspension points reach it through the
    /// current-fiber TLS slot.
    #[inline]
    pub(crate) fn yielder(&self) -> *const FiberYielder {
        self.yielder.load(Ordering::Acquire)
    }

    /// Resume the fiber until its next suspension point.
    ///
    /// # Safety
    ///
    /// The caller must be the only thread resuming this fiber; the
    /// scheduler guarantees this by removing a fiber from every queue
    /// while it runs.
    pub(crate) unsafe fn resume(&self) -> CoroutineResult<Suspend, ()> {
        (*self.co.get())
            .as_mut()
            .expect("fiber resumed after retirement")
            .resume(())
    }

    /// Tear down a fiber that is still suspended, unwinding whatever is
    /// left on its stack. Only called during purge, after the drain has
    /// parked every live fiber at a dispatch-loop suspension point.
    pub(crate) unsafe fn unwind(&self) {
        if let Some(co) = (*self.co.get()).as_mut() {
            if co.started() && !co.done() {
                co.force_unwind();
            }
        }
    }
}
