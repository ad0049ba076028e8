//! Explicit context hand-off between execution paths.
//!
//! Nothing propagates implicitly to spawned tasks or threads. A parent path captures a
//! [`ContextSnapshot`] and runs the child inside it; the child works on its own copy
//! of the frames, so pushes and pops on either side stay invisible to the other.

use super::run_context::{execution_stack, RunContext, TASK_STACK};
use std::cell::RefCell;
use std::future::Future;

/// Copy of a context stack that can seed another execution path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSnapshot {
    frames: Vec<RunContext>,
}

impl ContextSnapshot {
    /// Capture the current path's stack.
    pub fn capture() -> Self {
        Self {
            frames: execution_stack(),
        }
    }

    /// A snapshot with no frames, for fully isolated work.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[RunContext] {
        &self.frames
    }

    pub fn run_id(&self) -> Option<&str> {
        self.frames.last().map(|frame| frame.run_id.as_str())
    }

    /// Run `future` with its own task-local stack seeded from this snapshot.
    ///
    /// The stack travels with the future across worker threads, so context frames can
    /// be held across `.await` points.
    ///
    /// ```
    /// use runscope::context::{self, ContextSnapshot};
    ///
    /// let rt = tokio::runtime::Runtime::new().unwrap();
    /// rt.block_on(async {
    ///     let _guard = context::run_scope(Some("r1".to_string()));
    ///     let snapshot = ContextSnapshot::capture();
    ///
    ///     let child = tokio::spawn(snapshot.scope(async { context::current_run_id() }));
    ///     assert_eq!(child.await.unwrap().as_deref(), Some("r1"));
    /// });
    /// ```
    pub fn scope<F: Future>(self, future: F) -> impl Future<Output = F::Output> {
        TASK_STACK.scope(RefCell::new(self.frames), future)
    }

    /// Run `f` synchronously with a stack seeded from this snapshot.
    ///
    /// Intended for the body of a freshly spawned thread.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        TASK_STACK.sync_scope(RefCell::new(self.frames), f)
    }
}
