//! Typed event records.
//!
//! Each record describes one kind of operation and converts into the event type
//! discriminator plus the payload map that travels on the wire. Producers and
//! [`EventExtractor`](crate::tracer::EventExtractor) adapters build these instead of
//! assembling payload maps by hand.

use super::payload::{to_payload, Payload};
use super::EventType;
use crate::usage::{calculate_cost, TokenCounter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error details attached to records whose operation failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// An agent run began
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStart {
    pub input: Value,
    #[serde(default)]
    pub metadata: Payload,
}

/// An agent run finished, successfully or not
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEnd {
    pub output: Value,
    pub total_duration_ms: f64,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// A single model invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmCall {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: f64,
    pub cost: f64,
}

impl LlmCall {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_completion(mut self, completion: impl Into<String>) -> Self {
        self.completion = Some(completion.into());
        self
    }

    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Fill in token counts the provider did not report, then price the call if no
    /// cost was set.
    pub fn with_estimated_usage(mut self, counter: &TokenCounter) -> Self {
        if self.tokens_in == 0 {
            let system = self.system_prompt.as_deref().map(|s| counter.count(s)).unwrap_or(0);
            let prompt = self.prompt.as_deref().map(|p| counter.count(p)).unwrap_or(0);
            self.tokens_in = (system + prompt) as u64;
        }
        if self.tokens_out == 0 {
            self.tokens_out = self.completion.as_deref().map(|c| counter.count(c)).unwrap_or(0) as u64;
        }
        if self.cost == 0.0 {
            self.cost = calculate_cost(&self.model, self.tokens_in, self.tokens_out);
        }
        self
    }
}

/// A tool invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub input: Value,
    pub output: Value,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// One node of a graph-structured agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_name: String,
    pub state_before: Value,
    pub state_after: Value,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// A named step inside an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_name: String,
    pub input: Value,
    pub output: Value,
    pub duration_ms: f64,
    #[serde(default)]
    pub metadata: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Any record a producer can hand to the tracer
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    AgentStart(AgentStart),
    AgentEnd(AgentEnd),
    LlmCall(LlmCall),
    ToolCall(ToolCall),
    NodeExecution(NodeExecution),
    Step(Step),
    Custom { event_type: EventType, payload: Payload },
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            EventData::AgentStart(_) => EventType::AgentStart,
            EventData::AgentEnd(_) => EventType::AgentEnd,
            EventData::LlmCall(_) => EventType::LlmCall,
            EventData::ToolCall(_) => EventType::ToolCall,
            EventData::NodeExecution(_) => EventType::NodeExecution,
            EventData::Step(_) => EventType::Step,
            EventData::Custom { event_type, .. } => event_type.clone(),
        }
    }

    /// Split into the discriminator and the wire payload.
    pub fn into_parts(self) -> (EventType, Payload) {
        let event_type = self.event_type();
        let payload = match self {
            EventData::AgentStart(r) => to_payload(&r),
            EventData::AgentEnd(r) => to_payload(&r),
            EventData::LlmCall(r) => to_payload(&r),
            EventData::ToolCall(r) => to_payload(&r),
            EventData::NodeExecution(r) => to_payload(&r),
            EventData::Step(r) => to_payload(&r),
            EventData::Custom { payload, .. } => payload,
        };
        (event_type, payload)
    }
}

impl From<AgentStart> for EventData {
    fn from(record: AgentStart) -> Self {
        EventData::AgentStart(record)
    }
}

impl From<AgentEnd> for EventData {
    fn from(record: AgentEnd) -> Self {
        EventData::AgentEnd(record)
    }
}

impl From<LlmCall> for EventData {
    fn from(record: LlmCall) -> Self {
        EventData::LlmCall(record)
    }
}

impl From<ToolCall> for EventData {
    fn from(record: ToolCall) -> Self {
        EventData::ToolCall(record)
    }
}

impl From<NodeExecution> for EventData {
    fn from(record: NodeExecution) -> Self {
        EventData::NodeExecution(record)
    }
}

impl From<Step> for EventData {
    fn from(record: Step) -> Self {
        EventData::Step(record)
    }
}
