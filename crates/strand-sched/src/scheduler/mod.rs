//! Task Scheduler - Sequential Dispatch
//!
//! This module implements the context-bound scheduler: tasks submitted from
//! any thread are queued in FIFO order and each one is run by a drain step
//! posted to the host's dispatch context, so at most one runs at a time.

mod queue;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;

pub(crate) use queue::PendingQueue;
pub use scheduler::{
    current_scheduler, SchedulerId, SchedulerOptions, SchedulerStats, SequentialScheduler,
    SerializationMode, TaskScheduler,
};
pub use task::{Task, TaskFault, TaskId, TaskState};
