use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process;

use log::error;

/// Run a user task function, trapping any panic at the dispatch boundary:
/// a fiber stack has to make it back to its suspension point and a job
/// worker has to keep draining its deque, so an unwind must never tear
/// through either loop. Returns the payload of the trapped panic, if any.
pub(crate) fn trap_panic<F>(func: F) -> Option<Box<dyn Any + Send>>
where
    F: FnOnce(),
{
    panic::catch_unwind(AssertUnwindSafe(func)).err()
}

/// Fence around a user panic handler. If the handler itself panics the
/// fence is dropped while still armed and takes the process down, with a
/// record of which worker tripped it; the scheduler cannot tell what a
/// half-run handler left behind.
pub(crate) struct AbortFence {
    what: &'static str,
    worker: isize,
    armed: bool,
}

impl AbortFence {
    pub(crate) fn new(what: &'static str, worker: isize) -> AbortFence {
        AbortFence {
            what,
            worker,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortFence {
    fn drop(&mut self) {
        if self.armed {
            error!("{} panicked on worker {}; aborting", self.what, self.worker);
            process::abort();
        }
    }
}
