//! Per-execution-path run context stacks.
//!
//! Every thread owns a stack in thread-local storage. Code running inside
//! [`run_scope_async`] or a [`ContextSnapshot::scope`](super::ContextSnapshot::scope)
//! uses a task-local stack instead, which follows the task across worker threads.
//! Nothing is shared between paths; hand-off is always explicit.
//!
//! Tasks that interleave on one worker thread share that thread's stack, so a frame
//! must never stay open across an `.await` outside a task-local scope. [`ContextGuard`]
//! is not `Send`, which keeps it out of spawned futures; async code opens its frame
//! with [`run_scope_async`] instead.

use crate::error::TraceError;
use crate::event::generate_run_id;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use tracing::{debug, warn};

/// One frame of the context stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub parent_run_id: Option<String>,
    /// Event that subsequently created events reference as their parent
    pub current_parent_event_id: Option<String>,
    /// Position of this frame in its stack (0 for the root)
    pub depth: usize,
}

impl RunContext {
    fn root(run_id: String) -> Self {
        Self {
            run_id,
            parent_run_id: None,
            current_parent_event_id: None,
            depth: 0,
        }
    }
}

thread_local! {
    static THREAD_STACK: RefCell<Vec<RunContext>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    pub(super) static TASK_STACK: RefCell<Vec<RunContext>>;
}

/// Run `f` against the stack of the current execution path.
///
/// Returns `None` only when thread-local storage is already torn down.
fn with_stack<R>(f: impl FnOnce(&mut Vec<RunContext>) -> R) -> Option<R> {
    if TASK_STACK.try_with(|_| ()).is_ok() {
        return TASK_STACK.try_with(|cell| f(&mut cell.borrow_mut())).ok();
    }
    THREAD_STACK.try_with(|cell| f(&mut cell.borrow_mut())).ok()
}

/// Frame that `run_id` gets when pushed onto `stack`.
fn next_frame(stack: &[RunContext], run_id: String) -> RunContext {
    match stack.last() {
        Some(current) => RunContext {
            parent_run_id: Some(current.run_id.clone()),
            // a same-run sub-scope keeps nesting under the current event
            current_parent_event_id: if current.run_id == run_id {
                current.current_parent_event_id.clone()
            } else {
                None
            },
            depth: stack.len(),
            run_id,
        },
        None => RunContext::root(run_id),
    }
}

fn report(err: TraceError) {
    warn!("{}", err);
}

fn push_frame(explicit_run_id: Option<String>) -> (String, Option<usize>) {
    let run_id = explicit_run_id.unwrap_or_else(generate_run_id);

    let depth = with_stack(|stack| {
        let frame = next_frame(stack, run_id.clone());
        let depth = frame.depth;
        debug!(run_id = %frame.run_id, depth, "Entered run context");
        stack.push(frame);
        depth
    });

    if depth.is_none() {
        report(TraceError::ContextError(format!(
            "context storage unavailable, run {} is not tracked",
            run_id
        )));
    }
    (run_id, depth)
}

/// Push a new frame and return its run id.
///
/// With an active context the new frame records the current run as its parent and
/// sits one level deeper. Without one, the frame is a root at depth 0. A fresh run id
/// is generated unless `explicit_run_id` is given.
pub fn enter_context(explicit_run_id: Option<String>) -> String {
    push_frame(explicit_run_id).0
}

/// Pop the top frame, restoring the previous one.
///
/// Exiting with an empty stack is a logged no-op.
pub fn exit_context() -> Option<RunContext> {
    let popped = with_stack(|stack| stack.pop()).flatten();
    match &popped {
        Some(frame) => debug!(run_id = %frame.run_id, depth = frame.depth, "Exited run context"),
        None => report(TraceError::ContextError(
            "exit_context called without an active run context".to_string(),
        )),
    }
    popped
}

/// Enter a context that is exited when the returned guard drops.
///
/// The guard exits on every path out of the enclosing scope: normal return, early
/// `?` return, or panic unwinding. It belongs to the current thread's stack; use
/// [`run_scope_async`] to open a frame for a future.
pub fn run_scope(explicit_run_id: Option<String>) -> ContextGuard {
    let (run_id, depth) = push_frame(explicit_run_id);
    ContextGuard {
        run_id,
        depth,
        _thread_bound: PhantomData,
    }
}

/// Run `future` inside a new frame on its own task-local stack.
///
/// The stack is seeded with the caller's frames at the time of the call, followed by
/// the new frame, so the future nests under the caller's run like [`run_scope`] would.
/// Other tasks never see the frame, however they interleave with this one, and
/// dropping the future discards it.
///
/// ```
/// use runscope::context::{self, run_scope_async};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let seen = run_scope_async(Some("r1".to_string()), async {
///     tokio::task::yield_now().await;
///     context::current_run_id()
/// })
/// .await;
///
/// assert_eq!(seen.as_deref(), Some("r1"));
/// assert!(context::current_run_id().is_none());
/// # });
/// ```
pub fn run_scope_async<F: Future>(
    explicit_run_id: Option<String>,
    future: F,
) -> impl Future<Output = F::Output> {
    let mut frames = execution_stack();
    let frame = next_frame(&frames, explicit_run_id.unwrap_or_else(generate_run_id));
    debug!(run_id = %frame.run_id, depth = frame.depth, "Entered task run context");
    frames.push(frame);
    TASK_STACK.scope(RefCell::new(frames), future)
}

/// Scoped ownership of one context frame
///
/// Not `Send`: the frame lives on the stack of the thread that opened it.
#[must_use = "the run context is exited as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ContextGuard {
    run_id: String,
    depth: Option<usize>,
    _thread_bound: PhantomData<*const ()>,
}

impl ContextGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let Some(depth) = self.depth else {
            return;
        };

        let outcome = with_stack(|stack| match stack.get(depth) {
            Some(frame) if frame.run_id == self.run_id => {
                let unbalanced = stack.len() - depth - 1;
                stack.truncate(depth);
                Some(unbalanced)
            }
            _ => None,
        });

        match outcome {
            Some(Some(0)) => debug!(run_id = %self.run_id, depth, "Exited run context"),
            Some(Some(unbalanced)) => report(TraceError::ContextError(format!(
                "closed {} unbalanced inner context(s) while exiting run {}",
                unbalanced, self.run_id
            ))),
            Some(None) => report(TraceError::ContextError(format!(
                "run context {} was already exited",
                self.run_id
            ))),
            None => {}
        }
    }
}

/// Top frame of the current path's stack.
pub fn current_context() -> Option<RunContext> {
    with_stack(|stack| stack.last().cloned()).flatten()
}

pub fn current_run_id() -> Option<String> {
    with_stack(|stack| stack.last().map(|frame| frame.run_id.clone())).flatten()
}

pub fn current_parent_event_id() -> Option<String> {
    with_stack(|stack| stack.last().and_then(|frame| frame.current_parent_event_id.clone())).flatten()
}

/// Record the event that subsequent sibling events should reference as parent.
pub fn set_parent_event_id(event_id: impl Into<String>) {
    let event_id = event_id.into();
    let updated = with_stack(|stack| match stack.last_mut() {
        Some(frame) => {
            frame.current_parent_event_id = Some(event_id.clone());
            true
        }
        None => false,
    });
    if updated != Some(true) {
        report(TraceError::ContextError(format!(
            "set_parent_event_id({}) called without an active run context",
            event_id
        )));
    }
}

/// Depth of the top frame, if any.
pub fn current_depth() -> Option<usize> {
    with_stack(|stack| stack.last().map(|frame| frame.depth)).flatten()
}

/// Copy of the full stack, root first.
pub fn execution_stack() -> Vec<RunContext> {
    with_stack(|stack| stack.clone()).unwrap_or_default()
}

/// Drop every frame on the current path.
pub fn clear_context() {
    with_stack(|stack| stack.clear());
}
