pub use crate::counter::Counter;
pub use crate::errors::Result;
pub use crate::fiber::{Config, FiberService, Priority, Scheduler, ServiceHandler, Task};
pub use crate::task::{Job, JobHandle, TaskManager};
