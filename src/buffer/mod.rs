//! Event buffer.
//!
//! [`EventBuffer`] decouples the rate at which producers create events from the rate
//! at which they are delivered. Events accumulate under a mutex and leave as a
//! [`Batch`] when either `batch_size` events are pending or the background worker
//! finds that `flush_interval` has passed since the last flush. A batch is cut and
//! handed to the [`BatchSink`] under the same lock, so the sink sees batches in
//! sequence order. Sinks only enqueue there; network delivery happens elsewhere.

pub mod batch;

pub use batch::{Batch, BatchSink, MemorySink};

use crate::config::TracerConfig;
use crate::event::Event;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Flush thresholds for an [`EventBuffer`]
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl From<&TracerConfig> for BufferConfig {
    fn from(config: &TracerConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
        }
    }
}

struct Pending {
    events: Vec<Event>,
    last_flush: Instant,
    next_sequence: u64,
}

impl Pending {
    /// Swap the pending events out for an empty vector.
    fn take_batch(&mut self) -> Option<Batch> {
        if self.events.is_empty() {
            return None;
        }
        let events = std::mem::take(&mut self.events);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.last_flush = Instant::now();
        Some(Batch::new(sequence, events))
    }
}

struct Shared {
    pending: Mutex<Pending>,
    sink: Arc<dyn BatchSink>,
    config: BufferConfig,
    stop: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self) {
        let mut pending = self.lock_pending();
        if let Some(batch) = pending.take_batch() {
            self.dispatch(batch);
        }
    }

    fn flush_if_due(&self) {
        let mut pending = self.lock_pending();
        if pending.last_flush.elapsed() < self.config.flush_interval {
            return;
        }
        if let Some(batch) = pending.take_batch() {
            debug!("Interval flush of batch {}", batch.sequence());
            self.dispatch(batch);
        }
    }

    /// Hand `batch` to the sink. Callers hold the pending lock.
    fn dispatch(&self, batch: Batch) {
        let sequence = batch.sequence();
        let count = batch.len();
        debug!("Flushing batch {} with {} events", sequence, count);

        match catch_unwind(AssertUnwindSafe(|| self.sink.deliver(batch))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Flush callback failed for batch {} ({} events dropped): {}", sequence, count, e)
            }
            Err(_) => error!("Flush callback panicked on batch {} ({} events dropped)", sequence, count),
        }
    }
}

/// Thread-safe batching queue between producers and a [`BatchSink`].
///
/// # Examples
///
/// ```
/// use runscope::buffer::{BufferConfig, EventBuffer, MemorySink};
/// use runscope::event::{Event, EventType};
/// use std::sync::Arc;
///
/// let sink = MemorySink::new();
/// let buffer = EventBuffer::new(
///     Arc::new(sink.clone()),
///     BufferConfig { batch_size: 2, ..Default::default() },
/// );
///
/// buffer.add(Event::new(EventType::AgentStart, "r1", "agent"));
/// buffer.add(Event::new(EventType::LlmCall, "r1", "agent"));
///
/// assert_eq!(sink.batches().len(), 1);
/// assert!(buffer.is_empty());
/// ```
pub struct EventBuffer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBuffer {
    pub fn new(sink: Arc<dyn BatchSink>, config: BufferConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending {
                    events: Vec::new(),
                    last_flush: Instant::now(),
                    next_sequence: 1,
                }),
                sink,
                config,
                stop: Notify::new(),
                closed: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the interval flush worker on `runtime`.
    ///
    /// Calling this again while the worker runs has no effect.
    pub fn start(&self, runtime: &Handle) {
        if self.is_closed() {
            warn!("Event buffer is shut down, not starting flush worker");
            return;
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }

        let shared = self.shared.clone();
        *worker = Some(runtime.spawn(flush_loop(shared)));
        info!(
            "Event buffer started (batch_size: {}, flush_interval: {:?})",
            self.shared.config.batch_size, self.shared.config.flush_interval
        );
    }

    /// Append an event, flushing immediately once `batch_size` events are pending.
    pub fn add(&self, event: Event) {
        let mut pending = self.shared.lock_pending();
        if self.is_closed() {
            warn!("Event buffer is shut down, dropping event {}", event.event_id());
            return;
        }

        pending.events.push(event);
        if pending.events.len() >= self.shared.config.batch_size {
            if let Some(batch) = pending.take_batch() {
                self.shared.dispatch(batch);
            }
        }
    }

    /// Hand every pending event to the sink now.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Number of events waiting for the next flush.
    pub fn len(&self) -> usize {
        self.shared.lock_pending().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop the worker, flush what remains, and wait for the sink to drain.
    ///
    /// Safe to call more than once; later calls return immediately. Returns `false` if
    /// the sink did not drain within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let already_closed = {
            let _pending = self.shared.lock_pending();
            self.shared.closed.swap(true, Ordering::SeqCst)
        };
        if already_closed {
            return true;
        }

        debug!("Stopping event buffer");
        self.shared.stop.notify_one();
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!("Flush worker ended abnormally: {}", e);
            }
        }

        self.shared.flush();
        let drained = self.shared.sink.drain(timeout).await;
        if drained {
            info!("Event buffer stopped");
        } else {
            warn!("Event buffer stopped before in-flight deliveries finished ({:?})", timeout);
        }
        drained
    }
}

impl Drop for EventBuffer {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.stop.notify_one();
    }
}

/// Background interval flush loop.
async fn flush_loop(shared: Arc<Shared>) {
    let period = shared.config.flush_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.stop.notified() => break,
            _ = ticker.tick() => shared.flush_if_due(),
        }
    }

    debug!("Flush loop exiting");
}
