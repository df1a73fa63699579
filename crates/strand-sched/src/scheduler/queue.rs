//! Pending task queue

use crate::scheduler::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// FIFO queue of tasks waiting for a drain step
///
/// Any thread may push. Pops happen from drain steps, which the dispatch
/// context is expected to serialize. The lock is held only for the O(1)
/// queue operation itself, never while a task runs.
#[derive(Default)]
pub(crate) struct PendingQueue {
    tasks: Mutex<VecDeque<Arc<Task>>>,
}

impl PendingQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task at the tail, returning the depth after the push
    pub fn push(&self, task: Arc<Task>) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.push_back(task);
        tasks.len()
    }

    /// Remove the task at the head
    pub fn pop(&self) -> Option<Arc<Task>> {
        self.tasks.lock().pop_front()
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Point-in-time copy of the queued tasks, head first
    pub fn snapshot(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("len", &self.len())
            .finish()
    }
}
