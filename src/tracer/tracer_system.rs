//! The tracer instance producers hold.
//!
//! A [`Tracer`] owns the event buffer and its sink, tags events from the calling
//! path's context, and is constructed and shut down explicitly by the host
//! application. Clones share the same pipeline.

use super::extractor::EventExtractor;
use crate::buffer::{BatchSink, BufferConfig, EventBuffer};
use crate::client::DeliveryClient;
use crate::config::TracerConfig;
use crate::context::{current_parent_event_id, current_run_id};
use crate::error::Result;
use crate::event::{generate_event_id, generate_run_id, numeric_field, Event, EventData, EventType, NumericField};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

pub(super) struct TracerInner {
    pub(super) config: TracerConfig,
    buffer: EventBuffer,
    handle: Handle,
    runtime: Option<Runtime>,
    /// Cost accumulated by runs with an open `track_agent` scope
    run_costs: Mutex<HashMap<String, f64>>,
}

impl TracerInner {
    pub(super) fn event(&self, data: EventData, run_id: String, parent: Option<String>) -> Event {
        Event::from_data(data, run_id, &self.config.agent_name).with_parent_opt(parent)
    }

    pub(super) fn emit(&self, event: Event) {
        if *event.event_type() != EventType::AgentEnd {
            if let NumericField::Value(cost) = numeric_field(event.payload(), "cost") {
                if let Some(total) = self.costs().get_mut(event.run_id()) {
                    *total += cost;
                }
            }
        }
        debug!("Tracking {} event {} (run {})", event.event_type(), event.event_id(), event.run_id());
        self.buffer.add(event);
    }

    fn costs(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.run_costs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn open_run_cost(&self, run_id: &str) {
        self.costs().insert(run_id.to_string(), 0.0);
    }

    /// Close a run's cost account, folding it into the parent run's account if open.
    pub(super) fn close_run_cost(&self, run_id: &str, parent_run_id: Option<&str>) -> f64 {
        let mut costs = self.costs();
        let total = costs.remove(run_id).unwrap_or(0.0);
        if let Some(parent_total) = parent_run_id.and_then(|parent| costs.get_mut(parent)) {
            *parent_total += total;
        }
        total
    }
}

impl Drop for TracerInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Handle to a tracing pipeline.
///
/// # Examples
///
/// ```
/// use runscope::buffer::MemorySink;
/// use runscope::config::TracerConfig;
/// use runscope::event::{EventType, LlmCall};
/// use runscope::tracer::Tracer;
/// use std::sync::Arc;
///
/// let sink = MemorySink::new();
/// let tracer = Tracer::with_sink(TracerConfig::default(), Arc::new(sink.clone())).unwrap();
///
/// let answer: Result<&str, String> = tracer.track_agent(&"question", || {
///     tracer.record(LlmCall::new("gpt-4").with_usage(12, 3));
///     Ok("answer")
/// });
/// tracer.flush();
///
/// assert_eq!(answer, Ok("answer"));
/// let types: Vec<_> = sink.events().iter().map(|e| e.event_type().clone()).collect();
/// assert_eq!(types, vec![EventType::AgentStart, EventType::LlmCall, EventType::AgentEnd]);
/// ```
#[derive(Clone)]
pub struct Tracer {
    pub(super) inner: Option<Arc<TracerInner>>,
}

impl Tracer {
    /// Build a tracer that delivers to the collector named in `config`.
    ///
    /// The flush worker and deliveries run on the current tokio runtime, or on a small
    /// runtime owned by the tracer when called outside one. A disabled config yields
    /// [`Tracer::disabled`].
    pub fn init(config: TracerConfig) -> Result<Self> {
        config.validate()?;
        if !config.enabled {
            info!("Tracing disabled by configuration");
            return Ok(Self::disabled());
        }

        let (runtime, handle) = runtime_for_tracer()?;
        let client = DeliveryClient::new(&config, handle.clone())?;
        Ok(Self::assemble(config, Arc::new(client), runtime, handle))
    }

    /// Build a tracer that hands flushed batches to `sink` instead of the network.
    pub fn with_sink(config: TracerConfig, sink: Arc<dyn BatchSink>) -> Result<Self> {
        config.validate()?;
        if !config.enabled {
            info!("Tracing disabled by configuration");
            return Ok(Self::disabled());
        }

        let (runtime, handle) = runtime_for_tracer()?;
        Ok(Self::assemble(config, sink, runtime, handle))
    }

    /// A tracer whose operations do nothing.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    fn assemble(config: TracerConfig, sink: Arc<dyn BatchSink>, runtime: Option<Runtime>, handle: Handle) -> Self {
        let buffer = EventBuffer::new(sink, BufferConfig::from(&config));
        buffer.start(&handle);

        info!(
            "Tracer initialized for agent '{}' ({})",
            config.agent_name, config.environment
        );
        Self {
            inner: Some(Arc::new(TracerInner {
                config,
                buffer,
                handle,
                runtime,
                run_costs: Mutex::new(HashMap::new()),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn config(&self) -> Option<&TracerConfig> {
        self.inner.as_ref().map(|inner| &inner.config)
    }

    /// Events waiting in the buffer.
    pub fn pending(&self) -> usize {
        self.inner.as_ref().map(|inner| inner.buffer.len()).unwrap_or(0)
    }

    /// Buffer an already built event as is.
    pub fn track_event(&self, event: Event) {
        if let Some(inner) = &self.inner {
            inner.emit(event);
        }
    }

    /// Record a typed event tagged with the current run and parent event.
    ///
    /// Outside any context the event starts a fresh run. Returns the new event's id; a
    /// disabled tracer returns an id that was never recorded.
    pub fn record(&self, data: impl Into<EventData>) -> String {
        let Some(inner) = &self.inner else {
            return generate_event_id();
        };

        let run_id = current_run_id().unwrap_or_else(generate_run_id);
        let event = inner.event(data.into(), run_id, current_parent_event_id());
        let event_id = event.event_id().to_string();
        inner.emit(event);
        event_id
    }

    /// Record every event `extractor` maps out of a framework-native `source`.
    pub fn capture<X: EventExtractor>(&self, extractor: &X, source: &X::Source) -> Vec<String> {
        if !self.is_enabled() {
            return Vec::new();
        }
        extractor
            .extract(source)
            .into_iter()
            .map(|data| self.record(data))
            .collect()
    }

    /// Send pending events now.
    pub fn flush(&self) {
        if let Some(inner) = &self.inner {
            inner.buffer.flush();
        }
    }

    /// Flush everything and wait, up to `shutdown_timeout`, for deliveries to finish.
    ///
    /// Idempotent. Returns `false` if deliveries were still running at the deadline.
    pub async fn shutdown(&self) -> bool {
        let Some(inner) = &self.inner else {
            return true;
        };
        let drained = inner.buffer.shutdown(inner.config.shutdown_timeout).await;
        info!("Tracer for agent '{}' shut down", inner.config.agent_name);
        drained
    }

    /// [`shutdown`](Self::shutdown) for callers outside any async runtime.
    pub fn shutdown_blocking(&self) -> bool {
        let Some(inner) = &self.inner else {
            return true;
        };
        if Handle::try_current().is_ok() {
            warn!("shutdown_blocking called from inside a runtime, use shutdown().await");
            return false;
        }
        inner.handle.block_on(self.shutdown())
    }
}

fn runtime_for_tracer() -> Result<(Option<Runtime>, Handle)> {
    if let Ok(handle) = Handle::try_current() {
        return Ok((None, handle));
    }

    debug!("No tokio runtime found, starting a dedicated one");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("runscope-delivery")
        .enable_all()
        .build()?;
    let handle = runtime.handle().clone();
    Ok((Some(runtime), handle))
}
