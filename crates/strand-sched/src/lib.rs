//! Strand Sequential Scheduler
//!
//! This crate provides a task scheduler that runs at most one task at a time
//! by routing every task through a host-supplied dispatch context:
//! - Dispatch context abstraction (post a callback to one logical thread)
//! - Tasks with their own completion/fault state machine
//! - A FIFO pending queue that accepts work from any thread
//! - The sequential scheduler that posts one drain step per submitted task
//!
//! The scheduler owns no threads. Whoever pumps the dispatch context decides
//! where and when tasks run; the scheduler only guarantees that each task is
//! queued once and dispatched through exactly one posted callback.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod scheduler;

pub use context::{Callback, DispatchContext, InlineContext, ManualContext};
pub use scheduler::{
    current_scheduler, SchedulerId, SchedulerOptions, SchedulerStats, SequentialScheduler,
    SerializationMode, Task, TaskFault, TaskId, TaskScheduler, TaskState,
};

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The task cannot be queued because it already left the `Created` state
    #[error("Task {id} cannot be scheduled from state {state:?}")]
    InvalidTask {
        /// Id of the rejected task
        id: TaskId,
        /// State the task was in when it was submitted
        state: TaskState,
    },
}

/// Scheduler result
pub type SchedulerResult<T> = Result<T, SchedulerError>;
