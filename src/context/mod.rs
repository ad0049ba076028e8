//! Context management for traced executions.
//!
//! The context manager decides which `run_id` and `parent_event_id` a newly created
//! event carries. Each execution path (a thread, or a task running inside a
//! [`ContextSnapshot::scope`]) owns a private LIFO stack of [`RunContext`] frames:
//!
//! - [`enter_context`] / [`exit_context`] push and pop frames
//! - [`run_scope`] returns a [`ContextGuard`] that pops on every exit path
//! - [`run_scope_async`] runs a future inside a frame on its own task-local stack
//! - [`set_parent_event_id`] records the event later siblings nest under
//! - [`ContextSnapshot`] hands the current frames to a spawned task or thread
//!
//! # Examples
//!
//! ```
//! use runscope::context;
//!
//! let run_id = {
//!     let guard = context::run_scope(None);
//!     context::set_parent_event_id("agent-start");
//!     assert_eq!(context::current_parent_event_id().as_deref(), Some("agent-start"));
//!     guard.run_id().to_string()
//! };
//!
//! assert!(!run_id.is_empty());
//! assert!(context::current_run_id().is_none());
//! ```

pub mod run_context;
pub mod snapshot;

pub use run_context::{
    clear_context, current_context, current_depth, current_parent_event_id, current_run_id,
    enter_context, execution_stack, exit_context, run_scope, run_scope_async, set_parent_event_id,
    ContextGuard, RunContext,
};
pub use snapshot::ContextSnapshot;
