//! Task structure and completion state

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Just created, not yet submitted
    Created,
    /// Waiting in a scheduler queue
    Queued,
    /// Currently executing
    Running,
    /// Body returned successfully
    Completed,
    /// Body returned an error or panicked
    Faulted,
}

impl TaskState {
    /// Whether the task has finished, successfully or not
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Faulted)
    }
}

/// Failure recorded on a task whose body did not complete
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFault {
    /// The body returned an error
    #[error("Task failed: {0}")]
    Error(String),

    /// The body panicked
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskFault {
    /// Build a fault from any displayable error
    pub fn error(err: impl fmt::Display) -> Self {
        TaskFault::Error(err.to_string())
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskFault::Panicked(message)
    }
}

type TaskBody = Box<dyn FnOnce() -> Result<(), TaskFault> + Send + 'static>;

/// Mutable task bookkeeping, guarded by one lock so state and outcome agree
struct TaskInner {
    state: TaskState,
    body: Option<TaskBody>,
    fault: Option<TaskFault>,
}

/// An opaque unit of work with its own completion state machine
///
/// The creator owns the task (normally through an `Arc`). A scheduler only
/// holds a reference while the task waits in its queue, and once queued the
/// task runs only from that scheduler's drain step. Completion and faults are
/// recorded here and observed by whoever holds the task.
pub struct Task {
    /// Unique identifier
    id: TaskId,

    /// Optional diagnostic name
    name: Option<String>,

    /// State, body and outcome
    inner: Mutex<TaskInner>,

    /// Signalled when the task reaches a terminal state
    done: Condvar,
}

impl Task {
    /// Create a new Task from a fallible body
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce() -> Result<(), TaskFault> + Send + 'static,
    {
        Self {
            id: TaskId::new(),
            name: None,
            inner: Mutex::new(TaskInner {
                state: TaskState::Created,
                body: Some(Box::new(body)),
                fault: None,
            }),
            done: Condvar::new(),
        }
    }

    /// Create a new Task from a body that cannot fail except by panicking
    pub fn from_fn<F>(body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move || {
            body();
            Ok(())
        })
    }

    /// Attach a diagnostic name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the diagnostic name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Whether the body ran to completion
    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// Whether the body failed or panicked
    pub fn is_faulted(&self) -> bool {
        self.state() == TaskState::Faulted
    }

    /// Get the recorded fault, if the task faulted
    pub fn fault(&self) -> Option<TaskFault> {
        self.inner.lock().fault.clone()
    }

    /// Move a freshly created task into the queued state
    ///
    /// Returns the state the task was actually in when the transition is
    /// refused.
    pub(crate) fn mark_queued(&self) -> Result<(), TaskState> {
        let mut inner = self.inner.lock();
        match inner.state {
            TaskState::Created => {
                inner.state = TaskState::Queued;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Execute a task that was never submitted on the calling thread
    ///
    /// The body runs at most once. Returns false without doing anything when
    /// the task is not in the `Created` state: a queued task belongs to its
    /// scheduler and only runs from that scheduler's drain step. Errors and
    /// panics from the body are captured as a [`TaskFault`] on the task and
    /// never escape this call.
    pub fn run(&self) -> bool {
        self.execute(TaskState::Created)
    }

    /// Execute a queued task; reserved for the owning scheduler's drain step
    pub(crate) fn run_queued(&self) -> bool {
        self.execute(TaskState::Queued)
    }

    fn execute(&self, expected: TaskState) -> bool {
        let body = {
            let mut inner = self.inner.lock();
            if inner.state != expected {
                return false;
            }
            let Some(body) = inner.body.take() else {
                return false;
            };
            inner.state = TaskState::Running;
            body
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => result,
            Err(payload) => Err(TaskFault::from_panic(payload)),
        };

        let mut inner = self.inner.lock();
        match outcome {
            Ok(()) => inner.state = TaskState::Completed,
            Err(fault) => {
                inner.state = TaskState::Faulted;
                inner.fault = Some(fault);
            }
        }
        drop(inner);
        self.done.notify_all();
        true
    }

    /// Block until the task completes or faults, returning the final state
    ///
    /// Must not be called from the thread that pumps the task's dispatch
    /// context, or the task can never run.
    pub fn wait(&self) -> TaskState {
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            self.done.wait(&mut inner);
        }
        inner.state
    }

    /// Block until the task finishes or `timeout` elapses
    ///
    /// Returns the final state, or `None` on timeout. A timeout too large to
    /// represent as a deadline waits without limit.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskState> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            if self.done.wait_until(&mut inner, deadline).timed_out() {
                return inner.state.is_terminal().then_some(inner.state);
            }
        }
        Some(inner.state)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
