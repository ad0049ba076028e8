//! Producer-side tracing facade.
//!
//! A [`Tracer`] is created by the host application and passed to whatever records
//! events. It combines the context stack, the event buffer and a sink:
//!
//! - **Tracer::init / Tracer::with_sink**: explicit construction from a [`TracerConfig`](crate::config::TracerConfig)
//! - **record / track_event**: tag and buffer single events
//! - **track_agent, track_tool, track_step, track_node**: wrap an operation and record
//!   what it did, nesting everything recorded inside under its event
//! - **track_agent_async**: the same for futures, with a task-local context
//! - **capture**: record what an [`EventExtractor`] maps out of a framework object
//! - **flush / shutdown**: drain the pipeline when the host exits
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use runscope::config::TracerConfig;
//! use runscope::event::LlmCall;
//! use runscope::tracer::Tracer;
//!
//! # async fn run() -> runscope::Result<()> {
//! let tracer = Tracer::init(TracerConfig::from_env()?)?;
//!
//! let answer: Result<String, String> = tracer.track_agent("What is 2+2?", || {
//!     tracer.record(LlmCall::new("gpt-4").with_usage(12, 1).with_latency_ms(420.0));
//!     Ok("4".to_string())
//! });
//!
//! tracer.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod extractor;
pub mod tracer_system;
mod tracking;

pub use extractor::{ChatCompletionExtractor, EventExtractor};
pub use tracer_system::Tracer;
