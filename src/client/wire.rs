//! Request and response bodies of the batch ingestion endpoint.

use crate::event::Event;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/events`
#[derive(Debug, Serialize)]
pub struct EventBatchRequest<'a> {
    pub events: &'a [Event],
}

/// Owned form of [`EventBatchRequest`], as the collector receives it
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IncomingBatch {
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Answer to an ingestion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Events accepted, including duplicates that were already stored
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub failed: usize,
}

impl IngestResponse {
    pub fn success(count: usize, failed: usize) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(format!("Processed {} events", count + failed)),
            count,
            failed,
        }
    }
}
