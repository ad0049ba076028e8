//! Event model.
//!
//! An [`Event`] is the atomic unit of observability: one immutable record of an
//! operation starting, ending, or being called within a run. Events carry identity
//! (`event_id`, `run_id`, `parent_event_id`), timing, the producing agent, and an open
//! payload map. Typed [`EventData`] records produce the payload for the well-known
//! event kinds.
//!
//! # Examples
//!
//! ```
//! use runscope::event::{Event, EventType};
//! use serde_json::json;
//!
//! let root = Event::new(EventType::AgentStart, "run-1", "planner");
//! let call = Event::new(EventType::LlmCall, "run-1", "planner")
//!     .with_parent(root.event_id())
//!     .with_field("cost", json!(0.01));
//!
//! assert_eq!(call.parent_event_id(), Some(root.event_id()));
//! assert_eq!(call.run_id(), "run-1");
//! ```

pub mod payload;
pub mod records;

pub use payload::{insert_serialized, numeric_field, NumericField, Payload};
pub use records::{
    AgentEnd, AgentStart, ErrorInfo, EventData, LlmCall, NodeExecution, Step, ToolCall,
};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Generate a globally unique event identifier.
pub fn generate_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a globally unique run identifier.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Event type discriminator.
///
/// Serialized as its snake_case name. Names outside the well-known set round-trip
/// through [`EventType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    AgentStart,
    AgentEnd,
    LlmCall,
    ToolCall,
    NodeExecution,
    Step,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::AgentStart => "agent_start",
            EventType::AgentEnd => "agent_end",
            EventType::LlmCall => "llm_call",
            EventType::ToolCall => "tool_call",
            EventType::NodeExecution => "node_execution",
            EventType::Step => "step",
            EventType::Other(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "agent_start" => EventType::AgentStart,
            "agent_end" => EventType::AgentEnd,
            "llm_call" => EventType::LlmCall,
            "tool_call" => EventType::ToolCall,
            "node_execution" => EventType::NodeExecution,
            "step" => EventType::Step,
            _ => EventType::Other(value),
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        EventType::from(value.to_string())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one operation within a run.
///
/// Fields are fixed once the builder chain that creates the event ends; there are no
/// setters on a constructed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: String,
    event_type: EventType,
    run_id: String,
    parent_event_id: Option<String>,
    timestamp: DateTime<Utc>,
    agent_name: String,
    #[serde(rename = "data", alias = "payload", default)]
    payload: Payload,
}

impl Event {
    /// Create an event with a fresh id, stamped with the current time.
    pub fn new(
        event_type: impl Into<EventType>,
        run_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            event_id: generate_event_id(),
            event_type: event_type.into(),
            run_id: run_id.into(),
            parent_event_id: None,
            timestamp: Utc::now(),
            agent_name: agent_name.into(),
            payload: Payload::new(),
        }
    }

    /// Create an event from a typed record.
    pub fn from_data(data: impl Into<EventData>, run_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        let (event_type, payload) = data.into().into_parts();
        Self::new(event_type, run_id, agent_name).with_payload(payload)
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_parent(mut self, parent_event_id: impl Into<String>) -> Self {
        self.parent_event_id = Some(parent_event_id.into());
        self
    }

    pub fn with_parent_opt(mut self, parent_event_id: Option<String>) -> Self {
        self.parent_event_id = parent_event_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn parent_event_id(&self) -> Option<&str> {
        self.parent_event_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Structural check applied at the ingestion boundary.
    ///
    /// Returns the name of the first missing required field.
    pub fn missing_required_field(&self) -> Option<&'static str> {
        if self.event_id.trim().is_empty() {
            Some("event_id")
        } else if self.run_id.trim().is_empty() {
            Some("run_id")
        } else if self.event_type.as_str().trim().is_empty() {
            Some("event_type")
        } else {
            None
        }
    }

    /// Get a formatted string summary of the event
    pub fn printable_summary(&self) -> String {
        let time_str = self.timestamp.with_timezone(&Local).format("%H:%M:%S%.3f").to_string();

        let mut summary = format!(
            "[{}] {} (event_id: {}, run_id: {})\n   Agent: {}",
            time_str, self.event_type, self.event_id, self.run_id, self.agent_name
        );

        if let Some(parent) = &self.parent_event_id {
            summary.push_str(&format!("\n   Parent: {}", parent));
        }

        for key in ["model", "tool_name", "node_name", "step_name"] {
            if let Some(name) = payload::str_field(&self.payload, key) {
                summary.push_str(&format!("\n   {}: {}", key, name));
            }
        }

        if let NumericField::Value(cost) = numeric_field(&self.payload, "cost") {
            if cost > 0.0 {
                summary.push_str(&format!("\n   Cost: ${:.4}", cost));
            }
        }

        for key in ["latency_ms", "duration_ms", "total_duration_ms"] {
            if let NumericField::Value(ms) = numeric_field(&self.payload, key) {
                summary.push_str(&format!("\n   Duration: {:.2}ms", ms));
                break;
            }
        }

        if self.payload.contains_key("error") {
            summary.push_str("\n   Failed");
        }

        summary
    }
}
