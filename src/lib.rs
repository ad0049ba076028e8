pub mod buffer;
pub mod client;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod trace;
pub mod tracer;
pub mod usage;

pub use error::{Result, TraceError};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::buffer::{Batch, BatchSink, EventBuffer, MemorySink};
    pub use crate::client::DeliveryClient;
    pub use crate::collector::{Collector, EventRepository, MemoryEventRepository};
    pub use crate::config::TracerConfig;
    pub use crate::context::{run_scope, run_scope_async, ContextSnapshot};
    pub use crate::error::{Result, TraceError};
    pub use crate::event::{
        AgentEnd, AgentStart, Event, EventData, EventType, LlmCall, NodeExecution, Step, ToolCall,
    };
    pub use crate::trace::{ExecutionTrace, ExecutionTree, TraceSummary};
    pub use crate::tracer::{EventExtractor, Tracer};
}
