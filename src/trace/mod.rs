//! Trace reconstruction.
//!
//! Rebuilds the parent/child hierarchy of a run from its persisted events and rolls
//! cost, duration and token usage up the tree. Problems in the data (orphans, parent
//! cycles, non-numeric metrics) are reported as [`TraceFlag`]s on the affected nodes;
//! reconstruction itself never fails.
//!
//! # Examples
//!
//! ```
//! use runscope::event::{Event, EventType};
//! use runscope::trace::ExecutionTrace;
//! use serde_json::json;
//!
//! let root = Event::new(EventType::AgentStart, "r1", "agent");
//! let call = Event::new(EventType::LlmCall, "r1", "agent")
//!     .with_parent(root.event_id())
//!     .with_field("cost", json!(0.01));
//!
//! let trace = ExecutionTrace::from_events("r1", vec![root, call]);
//! assert_eq!(trace.tree.roots.len(), 1);
//! assert_eq!(trace.summary.event_count, 2);
//! ```

pub mod summary;
pub mod tree;

pub use summary::TraceSummary;
pub use tree::{reconstruct, ExecutionTree, TraceFlag, TreeNode};

use crate::event::Event;
use serde::Serialize;

/// Tree and totals answered for a run query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionTrace {
    pub tree: ExecutionTree,
    pub summary: TraceSummary,
}

impl ExecutionTrace {
    pub fn from_events(run_id: &str, events: Vec<Event>) -> Self {
        let tree = reconstruct(run_id, events);
        let summary = TraceSummary::from_tree(&tree);
        Self { tree, summary }
    }
}
