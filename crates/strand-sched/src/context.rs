//! Dispatch contexts
//!
//! A dispatch context is the host's "post a callback" primitive: it accepts
//! zero-argument callbacks and invokes them later, one at a time, in the order
//! they were posted, on the logical thread it represents. The scheduler relies
//! on that contract but never checks it.
//!
//! Two contexts ship with the crate. [`InlineContext`] runs callbacks inside
//! `post`, and [`ManualContext`] records them so a host loop or a test can pump
//! them explicitly.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Zero-argument callback handed to a dispatch context
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Host-provided capability that schedules callbacks onto one logical thread
///
/// Implementations are expected to invoke posted callbacks strictly in post
/// order and never two at once. Schedulers built on top of a context inherit
/// their ordering and concurrency guarantees from it.
pub trait DispatchContext: Send + Sync + 'static {
    /// Schedule `callback` for later invocation on the context's thread
    fn post(&self, callback: Callback);
}

impl<C: DispatchContext + ?Sized> DispatchContext for Arc<C> {
    fn post(&self, callback: Callback) {
        (**self).post(callback)
    }
}

impl<F> DispatchContext for F
where
    F: Fn(Callback) + Send + Sync + 'static,
{
    fn post(&self, callback: Callback) {
        self(callback)
    }
}

/// Context that runs every callback synchronously inside `post`
///
/// Serialization only holds when `post` itself is never called concurrently,
/// e.g. a single-threaded host.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineContext;

impl DispatchContext for InlineContext {
    fn post(&self, callback: Callback) {
        callback();
    }
}

/// Context that queues callbacks until they are pumped explicitly
#[derive(Default)]
pub struct ManualContext {
    /// Posted callbacks in post order
    callbacks: SegQueue<Callback>,

    /// Total callbacks ever posted
    posted: AtomicU64,
}

impl ManualContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the oldest posted callback, returning false if none was pending
    pub fn run_one(&self) -> bool {
        match self.callbacks.pop() {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Run callbacks until none are pending, including ones posted meanwhile
    ///
    /// Returns the number of callbacks invoked.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        while self.run_one() {
            count += 1;
        }
        count
    }

    /// Number of callbacks posted but not yet run
    pub fn pending(&self) -> usize {
        self.callbacks.len()
    }

    /// Total number of callbacks ever posted
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Acquire)
    }
}

impl DispatchContext for ManualContext {
    fn post(&self, callback: Callback) {
        self.callbacks.push(callback);
        self.posted.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ManualContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualContext")
            .field("pending", &self.pending())
            .field("posted", &self.posted())
            .finish()
    }
}
