//! Ingestion and query boundary.
//!
//! [`Collector`] is what an HTTP layer mounts behind `POST /api/events` and the trace
//! queries. Ingestion is where at-least-once delivery becomes exactly-once storage:
//! every event goes through insert-or-ignore on `event_id`, so a re-delivered batch
//! changes nothing.

pub mod repository;

pub use repository::{EventRepository, InsertCallback, MemoryEventRepository, StoredEvent};

use crate::client::{IncomingBatch, IngestResponse};
use crate::error::{Result, TraceError};
use crate::event::Event;
use crate::trace::ExecutionTrace;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default cap on events per ingested batch
pub const DEFAULT_MAX_BATCH_EVENTS: usize = 10_000;

pub struct Collector {
    repository: Arc<dyn EventRepository>,
    max_batch_events: usize,
}

impl Collector {
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self {
            repository,
            max_batch_events: DEFAULT_MAX_BATCH_EVENTS,
        }
    }

    /// Collector over a fresh [`MemoryEventRepository`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryEventRepository::new()))
    }

    pub fn with_max_batch_events(mut self, max_batch_events: usize) -> Self {
        self.max_batch_events = max_batch_events;
        self
    }

    pub fn repository(&self) -> &Arc<dyn EventRepository> {
        &self.repository
    }

    /// Store a batch of events.
    ///
    /// An empty batch or one above the cap is rejected outright. Within an accepted
    /// batch, events missing a required field or parented to an event of another run
    /// are counted as failed; the rest are stored with insert-or-ignore. Duplicates
    /// count as accepted.
    pub async fn ingest(&self, events: Vec<Event>) -> Result<IngestResponse> {
        if events.is_empty() {
            return Err(TraceError::EmptyBatch);
        }
        if events.len() > self.max_batch_events {
            return Err(TraceError::BatchTooLarge {
                count: events.len(),
                max: self.max_batch_events,
            });
        }

        let batch_runs: HashMap<String, String> = events
            .iter()
            .map(|e| (e.event_id().to_string(), e.run_id().to_string()))
            .collect();

        let mut accepted = 0;
        let mut inserted = 0;
        let mut failed = 0;

        for event in events {
            if let Some(field) = event.missing_required_field() {
                warn!("Rejecting event without {}: {:?}", field, event.event_id());
                failed += 1;
                continue;
            }

            if let Some(parent_id) = event.parent_event_id() {
                let parent_run = match batch_runs.get(parent_id) {
                    Some(run_id) => Some(run_id.clone()),
                    None => self
                        .repository
                        .find(parent_id)
                        .await?
                        .map(|stored| stored.event.run_id().to_string()),
                };
                if let Some(parent_run) = parent_run.filter(|run| run != event.run_id()) {
                    warn!(
                        "Rejecting event {}: parent {} belongs to run {}, not {}",
                        event.event_id(),
                        parent_id,
                        parent_run,
                        event.run_id()
                    );
                    failed += 1;
                    continue;
                }
            }

            if self.repository.insert_or_ignore(event).await? {
                inserted += 1;
            }
            accepted += 1;
        }

        info!(
            "Ingested batch: {} accepted ({} new, {} duplicate), {} failed",
            accepted,
            inserted,
            accepted - inserted,
            failed
        );
        Ok(IngestResponse::success(accepted, failed))
    }

    /// Parse a `{"events": [...]}` request body and ingest it.
    pub async fn ingest_json(&self, body: &str) -> Result<IngestResponse> {
        let batch: IncomingBatch = serde_json::from_str(body)?;
        self.ingest(batch.events).await
    }

    /// Execution tree and totals of a run.
    pub async fn trace(&self, run_id: &str) -> Result<ExecutionTrace> {
        let stored = self.repository.events_for_run(run_id).await?;
        if stored.is_empty() {
            return Err(TraceError::RunNotFound(run_id.to_string()));
        }

        debug!("Rebuilding run {} from {} events", run_id, stored.len());
        let events = stored.into_iter().map(|s| s.event).collect();
        Ok(ExecutionTrace::from_events(run_id, events))
    }

    /// Direct children of an event, in timestamp order.
    pub async fn children(&self, event_id: &str) -> Result<Vec<Event>> {
        if self.repository.find(event_id).await?.is_none() {
            return Err(TraceError::EventNotFound(event_id.to_string()));
        }
        let children = self.repository.children_of(event_id).await?;
        Ok(children.into_iter().map(|s| s.event).collect())
    }

    /// Remove a run and all of its events.
    pub async fn delete_run(&self, run_id: &str) -> Result<usize> {
        let removed = self.repository.delete_run(run_id).await?;
        if removed == 0 {
            return Err(TraceError::RunNotFound(run_id.to_string()));
        }
        info!("Deleted run {} ({} events)", run_id, removed);
        Ok(removed)
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::in_memory()
    }
}
