//! Batches and the sink seam the buffer flushes into.

use crate::error::Result;
use crate::event::Event;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Ordered group of events flushed together.
///
/// A batch is immutable once it leaves the buffer. `sequence` increases by one per
/// flush of the owning buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    sequence: u64,
    events: Vec<Event>,
}

impl Batch {
    pub fn new(sequence: u64, events: Vec<Event>) -> Self {
        Self { sequence, events }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

/// Receiver of flushed batches.
///
/// `deliver` is called with the buffer lock held, in batch sequence order. It must hand
/// the batch off without blocking and must not call back into the buffer. Errors are
/// logged by the buffer and the batch is not retried there.
#[async_trait]
pub trait BatchSink: Send + Sync {
    fn deliver(&self, batch: Batch) -> Result<()>;

    /// Wait for deliveries started by `deliver` to settle.
    ///
    /// Returns `false` if `timeout` elapsed first.
    async fn drain(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Sink that keeps every delivered batch in memory.
///
/// Useful for in-process pipelines and for asserting on what a tracer produced.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<Batch>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every batch received so far, in delivery order.
    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// All received events, flattened in delivery order.
    pub fn events(&self) -> Vec<Event> {
        self.batches().into_iter().flat_map(Batch::into_events).collect()
    }

    /// Remove and return the received batches.
    pub fn take(&self) -> Vec<Batch> {
        std::mem::take(&mut *self.batches.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl BatchSink for MemorySink {
    fn deliver(&self, batch: Batch) -> Result<()> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    #[test]
    fn test_batch_accessors() {
        let events = vec![
            Event::new(EventType::AgentStart, "r1", "a"),
            Event::new(EventType::LlmCall, "r1", "a"),
        ];
        let batch = Batch::new(3, events.clone());

        assert_eq!(batch.sequence(), 3);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert_eq!(batch.into_events(), events);
    }

    #[test]
    fn test_memory_sink_records_and_takes() {
        let sink = MemorySink::new();
        sink.deliver(Batch::new(1, vec![Event::new(EventType::Step, "r1", "a")])).unwrap();
        sink.deliver(Batch::new(2, vec![Event::new(EventType::Step, "r1", "a")])).unwrap();

        assert_eq!(sink.batches().len(), 2);
        assert_eq!(sink.events().len(), 2);

        let taken = sink.take();
        assert_eq!(taken.len(), 2);
        assert!(sink.batches().is_empty());
    }
}
