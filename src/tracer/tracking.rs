//! Scoped tracking helpers.
//!
//! Each helper wraps one operation of the host application, records the matching
//! event, and keeps the context stack balanced whether the operation returns `Ok`,
//! returns `Err`, or panics. Events recorded inside the operation nest under the
//! operation's own event.

use super::tracer_system::{Tracer, TracerInner};
use crate::context::{
    current_context, current_parent_event_id, current_run_id, run_scope, run_scope_async, set_parent_event_id,
};
use crate::event::payload::{serialize_field, Payload};
use crate::event::{generate_event_id, generate_run_id, AgentEnd, AgentStart, ErrorInfo, EventData, NodeExecution, Step, ToolCall};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::time::Instant;

/// How a wrapped operation ended
type Outcome<'a, T> = std::result::Result<&'a T, ErrorInfo>;

fn error_info<E: Display>(err: &E) -> ErrorInfo {
    let kind = std::any::type_name::<E>().rsplit("::").next().unwrap_or("Error");
    ErrorInfo::new(kind, err.to_string())
}

fn panic_info(payload: &(dyn Any + Send)) -> ErrorInfo {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "operation panicked".to_string());
    ErrorInfo::new("panic", message)
}

fn outcome_of<'a, T, E: Display>(result: &'a std::thread::Result<Result<T, E>>) -> Outcome<'a, T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(error_info(err)),
        Err(payload) => Err(panic_info(payload.as_ref())),
    }
}

fn output_value<T: Serialize + Debug>(outcome: &Outcome<'_, T>) -> (Value, Option<ErrorInfo>) {
    match outcome {
        Ok(value) => (serialize_field("output", *value), None),
        Err(info) => (Value::Null, Some(info.clone())),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Bookkeeping of an open agent run
struct AgentRun {
    run_id: String,
    parent_run_id: Option<String>,
    start_event_id: String,
    started: Instant,
}

impl TracerInner {
    /// Record `agent_start` for the run that the caller just entered.
    fn begin_agent(&self, input: Value) -> AgentRun {
        let ctx = current_context();
        let run_id = ctx.as_ref().map(|c| c.run_id.clone()).unwrap_or_else(generate_run_id);
        let parent_run_id = ctx.and_then(|c| c.parent_run_id);

        let mut metadata = Payload::new();
        metadata.insert("environment".into(), Value::String(self.config.environment.clone()));
        if let Some(parent) = &parent_run_id {
            metadata.insert("parent_run_id".into(), Value::String(parent.clone()));
        }

        self.open_run_cost(&run_id);
        let start = self.event(AgentStart { input, metadata }.into(), run_id.clone(), None);
        let start_event_id = start.event_id().to_string();
        self.emit(start);
        set_parent_event_id(start_event_id.clone());

        AgentRun {
            run_id,
            parent_run_id,
            start_event_id,
            started: Instant::now(),
        }
    }

    /// Record `agent_end`, parented to the run's `agent_start`.
    fn end_agent(&self, run: AgentRun, output: Value, error: Option<ErrorInfo>) {
        let total_cost = self.close_run_cost(&run.run_id, run.parent_run_id.as_deref());
        let end = AgentEnd {
            output,
            total_duration_ms: elapsed_ms(run.started),
            total_cost,
            error,
        };
        self.emit(self.event(end.into(), run.run_id, Some(run.start_event_id)));
    }
}

impl Tracer {
    /// Run `f` as a new agent run.
    ///
    /// Opens a fresh run (nested under the current run, if any), records `agent_start`,
    /// and records `agent_end` with the output or error, the total duration and the
    /// cost of LLM calls made during the run.
    pub fn track_agent<I, T, E, F>(&self, input: &I, f: F) -> Result<T, E>
    where
        I: Serialize + Debug + ?Sized,
        T: Serialize + Debug,
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let Some(inner) = &self.inner else {
            return f();
        };

        let guard = run_scope(None);
        let run = inner.begin_agent(serialize_field("input", input));

        let result = catch_unwind(AssertUnwindSafe(f));
        let (output, error) = output_value(&outcome_of(&result));
        inner.end_agent(run, output, error);
        drop(guard);

        match result {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Async form of [`track_agent`](Self::track_agent).
    ///
    /// The future runs with its own task-local copy of the caller's context, so it can
    /// be spawned or interleaved with other tracked futures.
    pub async fn track_agent_async<I, T, E, Fut>(&self, input: &I, future: Fut) -> Result<T, E>
    where
        I: Serialize + Debug + ?Sized,
        T: Serialize + Debug,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(inner) = &self.inner else {
            return future.await;
        };
        let input = serialize_field("input", input);

        run_scope_async(None, async move {
            let run = inner.begin_agent(input);

            let result = AssertUnwindSafe(future).catch_unwind().await;
            let (output, error) = output_value(&outcome_of(&result));
            inner.end_agent(run, output, error);

            match result {
                Ok(value) => value,
                Err(payload) => resume_unwind(payload),
            }
        })
        .await
    }

    /// Run `f` inside the current run and record one event describing it.
    ///
    /// The event id is reserved before `f` runs so events recorded by `f` can name it
    /// as their parent; the event itself is recorded afterwards, stamped with the start
    /// time.
    fn instrument<T, E, F, D>(&self, f: F, describe: D) -> Result<T, E>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
        D: FnOnce(Outcome<'_, T>, f64) -> EventData,
    {
        let Some(inner) = &self.inner else {
            return f();
        };

        let parent = current_parent_event_id();
        let guard = run_scope(Some(current_run_id().unwrap_or_else(generate_run_id)));
        let run_id = guard.run_id().to_string();
        let event_id = generate_event_id();
        set_parent_event_id(event_id.clone());

        let timestamp = Utc::now();
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(f));
        let elapsed = elapsed_ms(started);
        drop(guard);

        let data = describe(outcome_of(&result), elapsed);
        let event = inner
            .event(data, run_id, parent)
            .with_event_id(event_id)
            .with_timestamp(timestamp);
        inner.emit(event);

        match result {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Run `f` as a tool invocation and record a `tool_call` event.
    pub fn track_tool<I, T, E, F>(&self, tool_name: &str, input: &I, f: F) -> Result<T, E>
    where
        I: Serialize + Debug + ?Sized,
        T: Serialize + Debug,
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let input = serialize_field("input", input);
        self.instrument(f, |outcome, latency_ms| {
            let (output, error) = output_value(&outcome);
            ToolCall {
                tool_name: tool_name.to_string(),
                input,
                output,
                latency_ms,
                error,
            }
            .into()
        })
    }

    /// Run `f` as a named step and record a `step` event.
    pub fn track_step<I, T, E, F>(&self, step_name: &str, input: &I, f: F) -> Result<T, E>
    where
        I: Serialize + Debug + ?Sized,
        T: Serialize + Debug,
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let input = serialize_field("input", input);
        self.instrument(f, |outcome, duration_ms| {
            let (output, error) = output_value(&outcome);
            Step {
                step_name: step_name.to_string(),
                input,
                output,
                duration_ms,
                metadata: Payload::new(),
                error,
            }
            .into()
        })
    }

    /// Run `f` as a graph node and record a `node_execution` event.
    ///
    /// `f` returns the state after the node; `state_before` is recorded as given.
    pub fn track_node<S, T, E, F>(&self, node_name: &str, state_before: &S, f: F) -> Result<T, E>
    where
        S: Serialize + Debug + ?Sized,
        T: Serialize + Debug,
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let state_before = serialize_field("state_before", state_before);
        self.instrument(f, |outcome, duration_ms| {
            let (state_after, error) = output_value(&outcome);
            NodeExecution {
                node_name: node_name.to_string(),
                state_before,
                state_after,
                duration_ms,
                error,
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemorySink;
    use crate::config::TracerConfig;
    use crate::context::{clear_context, execution_stack};
    use crate::event::{Event, EventType, LlmCall};
    use serde_json::json;
    use std::sync::Arc;

    fn tracer() -> (Tracer, MemorySink) {
        let sink = MemorySink::new();
        let config = TracerConfig::default().with_batch_size(1000);
        let tracer = Tracer::with_sink(config, Arc::new(sink.clone())).unwrap();
        (tracer, sink)
    }

    fn by_type<'a>(events: &'a [Event], event_type: EventType) -> Vec<&'a Event> {
        events.iter().filter(|e| *e.event_type() == event_type).collect()
    }

    #[test]
    fn test_track_agent_records_start_and_end() {
        clear_context();
        let (tracer, sink) = tracer();

        let result: Result<String, String> = tracer.track_agent(&json!({"question": "2+2"}), || {
            tracer.record(LlmCall::new("gpt-4").with_cost(0.25));
            tracer.record(LlmCall::new("gpt-4").with_cost(0.5));
            Ok("4".to_string())
        });
        tracer.flush();

        assert_eq!(result.unwrap(), "4");
        let events = sink.events();
        assert_eq!(events.len(), 4);

        let start = &events[0];
        let end = &events[3];
        assert_eq!(*start.event_type(), EventType::AgentStart);
        assert!(start.parent_event_id().is_none());
        assert_eq!(start.payload()["input"], json!({"question": "2+2"}));

        for call in by_type(&events, EventType::LlmCall) {
            assert_eq!(call.run_id(), start.run_id());
            assert_eq!(call.parent_event_id(), Some(start.event_id()));
        }

        assert_eq!(*end.event_type(), EventType::AgentEnd);
        assert_eq!(end.parent_event_id(), Some(start.event_id()));
        assert_eq!(end.payload()["output"], json!("4"));
        assert_eq!(end.payload()["total_cost"], json!(0.75));
        assert!(end.payload().get("error").is_none());
        assert!(execution_stack().is_empty());
    }

    #[test]
    fn test_track_agent_error_path() {
        clear_context();
        let (tracer, sink) = tracer();

        let result: Result<u32, String> = tracer.track_agent("input", || Err("model refused".to_string()));
        tracer.flush();

        assert_eq!(result, Err("model refused".to_string()));
        let end = sink.events().pop().unwrap();
        assert_eq!(end.payload()["error"]["message"], json!("model refused"));
        assert_eq!(end.payload()["error"]["type"], json!("String"));
        assert!(execution_stack().is_empty());
    }

    #[test]
    fn test_track_agent_panic_still_records_end() {
        clear_context();
        let (tracer, sink) = tracer();

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), String> = tracer.track_agent("input", || panic!("tool exploded"));
        }));
        tracer.flush();

        assert!(outcome.is_err());
        let end = sink.events().pop().unwrap();
        assert_eq!(*end.event_type(), EventType::AgentEnd);
        assert_eq!(end.payload()["error"]["type"], json!("panic"));
        assert_eq!(end.payload()["error"]["message"], json!("tool exploded"));
        assert!(execution_stack().is_empty());
    }

    #[test]
    fn test_tool_children_nest_under_tool_event() {
        clear_context();
        let (tracer, sink) = tracer();

        let _: Result<(), String> = tracer.track_agent("go", || {
            let found: Result<Vec<String>, String> = tracer.track_tool("search", &json!({"q": "rust"}), || {
                tracer.record(LlmCall::new("gpt-3.5-turbo"));
                Ok(vec!["result".to_string()])
            });
            found.map(|_| ())
        });
        tracer.flush();

        let events = sink.events();
        let start = by_type(&events, EventType::AgentStart)[0];
        let tool = by_type(&events, EventType::ToolCall)[0];
        let call = by_type(&events, EventType::LlmCall)[0];

        assert_eq!(tool.run_id(), start.run_id());
        assert_eq!(tool.parent_event_id(), Some(start.event_id()));
        assert_eq!(call.parent_event_id(), Some(tool.event_id()));
        assert!(tool.timestamp() <= call.timestamp());
        assert_eq!(tool.payload()["output"], json!(["result"]));
        assert_eq!(tool.payload()["tool_name"], json!("search"));
    }

    #[test]
    fn test_siblings_share_parent_after_scoped_operation() {
        clear_context();
        let (tracer, sink) = tracer();

        let _: Result<(), String> = tracer.track_agent("go", || {
            tracer.track_step("plan", "goal", || Ok::<_, String>("plan"))?;
            tracer.track_node("act", &json!({"n": 0}), || Ok::<_, String>(json!({"n": 1})))?;
            Ok(())
        });
        tracer.flush();

        let events = sink.events();
        let start = by_type(&events, EventType::AgentStart)[0];
        let step = by_type(&events, EventType::Step)[0];
        let node = by_type(&events, EventType::NodeExecution)[0];

        assert_eq!(step.parent_event_id(), Some(start.event_id()));
        assert_eq!(node.parent_event_id(), Some(start.event_id()));
        assert_eq!(node.payload()["state_before"], json!({"n": 0}));
        assert_eq!(node.payload()["state_after"], json!({"n": 1}));
    }

    #[test]
    fn test_failed_tool_records_error() {
        clear_context();
        let (tracer, sink) = tracer();

        let result: Result<(), String> = tracer.track_tool("fetch", "url", || Err("timeout".to_string()));
        tracer.flush();

        assert!(result.is_err());
        let tool = sink.events().pop().unwrap();
        assert_eq!(tool.payload()["error"]["message"], json!("timeout"));
        assert_eq!(tool.payload()["output"], Value::Null);
        assert!(execution_stack().is_empty());
    }

    #[test]
    fn test_nested_agent_gets_own_run() {
        clear_context();
        let (tracer, sink) = tracer();

        let _: Result<(), String> = tracer.track_agent("outer", || {
            tracer.track_agent("inner", || {
                tracer.record(LlmCall::new("gpt-4").with_cost(0.1));
                Ok::<_, String>(())
            })
        });
        tracer.flush();

        let events = sink.events();
        let starts = by_type(&events, EventType::AgentStart);
        let ends = by_type(&events, EventType::AgentEnd);
        let (outer, inner) = (starts[0], starts[1]);

        assert_ne!(outer.run_id(), inner.run_id());
        assert!(inner.parent_event_id().is_none());
        assert_eq!(inner.payload()["metadata"]["parent_run_id"], json!(outer.run_id()));

        let outer_end = ends.iter().find(|e| e.run_id() == outer.run_id()).unwrap();
        assert_eq!(outer_end.payload()["total_cost"], json!(0.1));
    }

    #[test]
    fn test_disabled_tracer_still_runs_operations() {
        let tracer = Tracer::disabled();
        let result: Result<i32, String> = tracer.track_agent("x", || tracer.track_tool("t", "y", || Ok(7)));
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_async_agents_stay_isolated() {
        let (tracer, sink) = tracer();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let tracer = tracer.clone();
                tokio::spawn(async move {
                    tracer
                        .track_agent_async(&i, async {
                            for _ in 0..3 {
                                tracer.record(LlmCall::new("gpt-4"));
                                tokio::task::yield_now().await;
                            }
                            Ok::<_, String>(i)
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        tracer.flush();

        let events = sink.events();
        assert_eq!(events.len(), 8 * 5);
        for start in by_type(&events, EventType::AgentStart) {
            let run: Vec<_> = events.iter().filter(|e| e.run_id() == start.run_id()).collect();
            assert_eq!(run.len(), 5);
            for event in run.iter().filter(|e| e.event_id() != start.event_id()) {
                assert_eq!(event.parent_event_id(), Some(start.event_id()));
            }
        }
    }

    #[tokio::test]
    async fn test_interleaved_async_agents_on_one_thread() {
        clear_context();
        let (tracer, sink) = tracer();

        let agent = |name: &'static str, yields: usize| {
            let tracer = tracer.clone();
            async move {
                tracer
                    .track_agent_async(name, async {
                        for _ in 0..yields {
                            tokio::task::yield_now().await;
                            tracer.record(LlmCall::new("gpt-4").with_cost(0.01));
                        }
                        Ok::<_, String>(name)
                    })
                    .await
            }
        };
        let (a, b) = tokio::join!(agent("a", 1), agent("b", 2));
        assert_eq!((a, b), (Ok("a"), Ok("b")));
        assert!(execution_stack().is_empty());
        tracer.flush();

        let events = sink.events();
        let starts = by_type(&events, EventType::AgentStart);
        assert_eq!(starts.len(), 2);
        assert_ne!(starts[0].run_id(), starts[1].run_id());
        for start in starts {
            for event in events.iter().filter(|e| e.run_id() == start.run_id() && e.event_id() != start.event_id()) {
                assert_eq!(event.parent_event_id(), Some(start.event_id()));
            }
        }
        assert_eq!(by_type(&events, EventType::LlmCall).len(), 3);
        for end in by_type(&events, EventType::AgentEnd) {
            let calls = events
                .iter()
                .filter(|e| e.run_id() == end.run_id() && *e.event_type() == EventType::LlmCall)
                .count();
            let total = end.payload()["total_cost"].as_f64().unwrap();
            assert!((total - 0.01 * calls as f64).abs() < 1e-9);
        }
    }
}
