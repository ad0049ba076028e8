//! Event persistence seam.
//!
//! The collector talks to storage through [`EventRepository`]. Any store with a unique
//! index on `event_id` and an index on `run_id` can implement it; the bundled
//! [`MemoryEventRepository`] keeps everything in process.

use crate::error::{Result, TraceError};
use crate::event::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A persisted event with its storage sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Insertion order across the whole store; breaks timestamp ties
    pub sequence: u64,
    pub event: Event,
}

/// Type alias for insert callback functions
pub type InsertCallback = Arc<dyn Fn(&StoredEvent) + Send + Sync>;

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Store `event` unless its id is already present.
    ///
    /// Returns `true` if the event was stored, `false` if it was a duplicate.
    async fn insert_or_ignore(&self, event: Event) -> Result<bool>;

    async fn find(&self, event_id: &str) -> Result<Option<StoredEvent>>;

    /// Events of a run ordered by timestamp, then sequence.
    async fn events_for_run(&self, run_id: &str) -> Result<Vec<StoredEvent>>;

    /// Direct children of an event, ordered like [`events_for_run`](Self::events_for_run).
    async fn children_of(&self, event_id: &str) -> Result<Vec<StoredEvent>>;

    async fn count(&self) -> Result<usize>;

    /// Remove every event of a run, returning how many were removed.
    async fn delete_run(&self, run_id: &str) -> Result<usize>;
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<String, StoredEvent>,
    runs: HashMap<String, Vec<String>>,
    next_sequence: u64,
}

impl MemoryState {
    fn collect<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<StoredEvent> {
        let mut found: Vec<StoredEvent> = ids.filter_map(|id| self.events.get(id)).cloned().collect();
        found.sort_by(|a, b| {
            a.event
                .timestamp()
                .cmp(&b.event.timestamp())
                .then(a.sequence.cmp(&b.sequence))
        });
        found
    }
}

/// In-process [`EventRepository`]
///
/// An optional callback sees every newly stored event (duplicates are not reported).
/// An optional capacity turns inserts past it into storage errors.
#[derive(Clone, Default)]
pub struct MemoryEventRepository {
    state: Arc<Mutex<MemoryState>>,
    on_insert: Option<InsertCallback>,
    max_events: Option<usize>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(on_insert: InsertCallback) -> Self {
        Self {
            on_insert: Some(on_insert),
            ..Self::default()
        }
    }

    /// Refuse new events once `max_events` are stored.
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = Some(max_events);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn insert_or_ignore(&self, event: Event) -> Result<bool> {
        let stored = {
            let mut state = self.lock();
            if state.events.contains_key(event.event_id()) {
                return Ok(false);
            }
            if let Some(max) = self.max_events.filter(|max| state.events.len() >= *max) {
                return Err(TraceError::StorageError(format!(
                    "in-memory repository is full ({} events), refusing {}",
                    max,
                    event.event_id()
                )));
            }

            state.next_sequence += 1;
            let stored = StoredEvent {
                sequence: state.next_sequence,
                event,
            };
            let event_id = stored.event.event_id().to_string();
            state
                .runs
                .entry(stored.event.run_id().to_string())
                .or_default()
                .push(event_id.clone());
            state.events.insert(event_id, stored.clone());
            stored
        };

        if let Some(callback) = &self.on_insert {
            callback(&stored);
        }
        Ok(true)
    }

    async fn find(&self, event_id: &str) -> Result<Option<StoredEvent>> {
        Ok(self.lock().events.get(event_id).cloned())
    }

    async fn events_for_run(&self, run_id: &str) -> Result<Vec<StoredEvent>> {
        let state = self.lock();
        Ok(match state.runs.get(run_id) {
            Some(ids) => state.collect(ids.iter()),
            None => Vec::new(),
        })
    }

    async fn children_of(&self, event_id: &str) -> Result<Vec<StoredEvent>> {
        let state = self.lock();
        let Some(parent) = state.events.get(event_id) else {
            return Ok(Vec::new());
        };
        let siblings = state.runs.get(parent.event.run_id()).into_iter().flatten();
        let children = state
            .collect(siblings)
            .into_iter()
            .filter(|s| s.event.parent_event_id() == Some(event_id))
            .collect();
        Ok(children)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.lock().events.len())
    }

    async fn delete_run(&self, run_id: &str) -> Result<usize> {
        let mut state = self.lock();
        let Some(ids) = state.runs.remove(run_id) else {
            return Ok(0);
        };
        for id in &ids {
            state.events.remove(id);
        }
        Ok(ids.len())
    }
}
