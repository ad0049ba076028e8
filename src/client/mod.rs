//! Delivery client.
//!
//! [`DeliveryClient`] moves flushed batches to the ingestion endpoint. Every request is
//! attempted up to `max_retries + 1` times; each attempt yields an [`AttemptOutcome`]
//! and the retry loop acts only on that value:
//!
//! - 2xx: delivered
//! - 429, 5xx, timeouts, connection failures: retried after `backoff_base * 2^attempt`
//! - any other 4xx: dropped without retry
//!
//! A batch that cannot be delivered is dropped with an `error!` log line. Delivery is
//! at-least-once; the collector deduplicates on `event_id`.

pub mod wire;

pub use wire::{EventBatchRequest, IncomingBatch, IngestResponse};

use crate::buffer::{Batch, BatchSink};
use crate::config::TracerConfig;
use crate::error::{Result, TraceError};
use crate::event::Event;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of a single HTTP attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Delivered(Option<IngestResponse>),
    Retryable(String),
    Permanent { status: Option<u16>, reason: String },
}

impl AttemptOutcome {
    /// Classify a response by its status.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        let reason = if body.is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body)
        };

        if status.is_success() {
            AttemptOutcome::Delivered(serde_json::from_str(&body).ok())
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            AttemptOutcome::Retryable(reason)
        } else {
            AttemptOutcome::Permanent {
                status: Some(status.as_u16()),
                reason,
            }
        }
    }

    /// Classify a transport failure.
    pub fn from_transport_error(err: &reqwest::Error) -> Self {
        if err.is_builder() {
            AttemptOutcome::Permanent {
                status: None,
                reason: err.to_string(),
            }
        } else {
            AttemptOutcome::Retryable(err.to_string())
        }
    }
}

/// Final fate of one request
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Rejected { status: Option<u16>, reason: String },
    Exhausted { attempts: u32, last_error: String },
}

/// What happened to one request's worth of events
#[derive(Debug, Clone, PartialEq)]
pub struct RequestReport {
    pub events: usize,
    pub outcome: DeliveryOutcome,
}

/// What happened to a batch, one entry per request it was split into
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub sequence: u64,
    pub requests: Vec<RequestReport>,
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        self.requests
            .iter()
            .all(|r| matches!(r.outcome, DeliveryOutcome::Delivered { .. }))
    }

    pub fn delivered_events(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| matches!(r.outcome, DeliveryOutcome::Delivered { .. }))
            .map(|r| r.events)
            .sum()
    }

    pub fn dropped_events(&self) -> usize {
        self.requests.iter().map(|r| r.events).sum::<usize>() - self.delivered_events()
    }

    /// Delivered event count, or the first failed request as a delivery error.
    pub fn into_result(self) -> Result<usize> {
        let delivered = self.delivered_events();
        let failure = self.requests.into_iter().find_map(|r| match r.outcome {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Rejected { status, reason } => Some(format!(
                "{} events rejected with status {}: {}",
                r.events,
                status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()),
                reason
            )),
            DeliveryOutcome::Exhausted { attempts, last_error } => Some(format!(
                "{} events dropped after {} attempts: {}",
                r.events, attempts, last_error
            )),
        });

        match failure {
            Some(reason) => Err(TraceError::DeliveryError(format!("batch {}: {}", self.sequence, reason))),
            None => Ok(delivered),
        }
    }
}

/// Wait before the retry that follows attempt `attempt` (zero-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

struct Sender {
    http: Client,
    events_url: String,
    api_key: Option<String>,
    max_retries: u32,
    backoff_base: Duration,
    max_batch_events: usize,
}

impl Sender {
    async fn attempt(&self, events: &[Event]) -> AttemptOutcome {
        let mut request = self.http.post(&self.events_url).json(&EventBatchRequest { events });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                AttemptOutcome::from_status(status, body)
            }
            Err(e) => AttemptOutcome::from_transport_error(&e),
        }
    }

    async fn deliver_request(&self, sequence: u64, events: &[Event]) -> DeliveryOutcome {
        let attempts = self.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.attempt(events).await {
                AttemptOutcome::Delivered(response) => {
                    if let Some(response) = response.filter(|r| r.failed > 0) {
                        warn!(
                            "Collector stored {} of batch {} and failed {}",
                            response.count, sequence, response.failed
                        );
                    }
                    debug!("Delivered {} events of batch {} (attempt {})", events.len(), sequence, attempt + 1);
                    return DeliveryOutcome::Delivered {
                        attempts: attempt + 1,
                    };
                }
                AttemptOutcome::Permanent { status, reason } => {
                    error!(
                        "Collector rejected batch {}, dropping {} events: {}",
                        sequence,
                        events.len(),
                        reason
                    );
                    return DeliveryOutcome::Rejected { status, reason };
                }
                AttemptOutcome::Retryable(reason) => {
                    last_error = reason;
                    if attempt + 1 < attempts {
                        let wait = backoff_delay(self.backoff_base, attempt);
                        warn!(
                            "Delivery of batch {} failed (attempt {}/{}), retrying in {:?}: {}",
                            sequence,
                            attempt + 1,
                            attempts,
                            wait,
                            last_error
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        error!(
            "Giving up on batch {} after {} attempts, dropping {} events: {}",
            sequence,
            attempts,
            events.len(),
            last_error
        );
        DeliveryOutcome::Exhausted {
            attempts,
            last_error,
        }
    }

    async fn deliver(&self, batch: Batch) -> DeliveryReport {
        let mut requests = Vec::new();
        for chunk in batch.events().chunks(self.max_batch_events.max(1)) {
            let outcome = self.deliver_request(batch.sequence(), chunk).await;
            requests.push(RequestReport {
                events: chunk.len(),
                outcome,
            });
        }
        DeliveryReport {
            sequence: batch.sequence(),
            requests,
        }
    }
}

/// HTTP sender for flushed batches.
///
/// [`send`](DeliveryClient::send) spawns delivery onto the runtime and returns at
/// once; [`drain`](BatchSink::drain) waits for those spawned deliveries.
pub struct DeliveryClient {
    sender: Arc<Sender>,
    runtime: Handle,
    in_flight: Mutex<Vec<JoinHandle<DeliveryReport>>>,
}

impl DeliveryClient {
    /// Create a client that spawns deliveries on `runtime`.
    pub fn new(config: &TracerConfig, runtime: Handle) -> Result<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;

        info!("Delivery client targeting {}", config.events_url());
        Ok(Self {
            sender: Arc::new(Sender {
                http,
                events_url: config.events_url(),
                api_key: config.api_key.clone(),
                max_retries: config.max_retries,
                backoff_base: config.backoff_base,
                max_batch_events: config.max_batch_events,
            }),
            runtime,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    /// Deliver `batch` in the background.
    pub fn send(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        let sender = self.sender.clone();
        let handle = self.runtime.spawn(async move { sender.deliver(batch).await });

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// Deliver `batch` on the caller's task and report the outcome.
    pub async fn deliver_now(&self, batch: Batch) -> DeliveryReport {
        self.sender.deliver(batch).await
    }

    /// Number of background deliveries not yet finished.
    pub fn in_flight(&self) -> usize {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|h| !h.is_finished());
        in_flight.len()
    }
}

#[async_trait]
impl BatchSink for DeliveryClient {
    fn deliver(&self, batch: Batch) -> Result<()> {
        self.send(batch);
        Ok(())
    }

    async fn drain(&self, timeout: Duration) -> bool {
        let handles = std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
        if handles.is_empty() {
            return true;
        }

        debug!("Waiting for {} in-flight deliveries", handles.len());
        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for report in results.into_iter().filter_map(|r| r.ok()) {
                    if let Err(err) = report.into_result() {
                        warn!("{}", err);
                    }
                }
                true
            }
            Err(_) => {
                warn!("In-flight deliveries still running after {:?}", timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use mockito::Matcher;

    fn test_config(url: impl Into<String>) -> TracerConfig {
        TracerConfig::default()
            .with_backend_url(url)
            .with_retry(2, Duration::from_millis(1))
    }

    fn batch(count: usize) -> Batch {
        let events = (0..count)
            .map(|n| Event::new(EventType::LlmCall, "r1", "agent").with_event_id(format!("e{}", n)))
            .collect();
        Batch::new(1, events)
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            AttemptOutcome::from_status(StatusCode::OK, String::new()),
            AttemptOutcome::Delivered(None)
        ));
        assert!(matches!(
            AttemptOutcome::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            AttemptOutcome::Retryable(_)
        ));
        assert!(matches!(
            AttemptOutcome::from_status(StatusCode::BAD_GATEWAY, String::new()),
            AttemptOutcome::Retryable(_)
        ));
        assert_eq!(
            AttemptOutcome::from_status(StatusCode::PAYLOAD_TOO_LARGE, "too big".into()),
            AttemptOutcome::Permanent {
                status: Some(413),
                reason: "413 Payload Too Large: too big".into()
            }
        );
        assert!(matches!(
            AttemptOutcome::from_status(StatusCode::REQUEST_TIMEOUT, String::new()),
            AttemptOutcome::Permanent { status: Some(408), .. }
        ));
    }

    #[test]
    fn test_success_body_is_parsed() {
        let outcome = AttemptOutcome::from_status(
            StatusCode::OK,
            r#"{"status":"success","count":2,"failed":0}"#.into(),
        );
        match outcome {
            AttemptOutcome::Delivered(Some(response)) => assert_eq!(response.count, 2),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deliver_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/events")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Regex(r#""event_id":"e0""#.to_string()))
            .with_status(200)
            .with_body(r#"{"status":"success","count":2,"failed":0}"#)
            .expect(1)
            .create_async()
            .await;

        let client = DeliveryClient::new(&test_config(server.url()), Handle::current()).unwrap();
        let report = client.deliver_now(batch(2)).await;

        mock.assert_async().await;
        assert!(report.is_delivered());
        assert_eq!(report.delivered_events(), 2);
        assert_eq!(report.requests[0].outcome, DeliveryOutcome::Delivered { attempts: 1 });
        assert_eq!(report.into_result().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_api_key_sent_as_bearer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/events")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .create_async()
            .await;

        let config = test_config(server.url()).with_api_key("secret");
        let client = DeliveryClient::new(&config, Handle::current()).unwrap();
        let report = client.deliver_now(batch(1)).await;

        mock.assert_async().await;
        assert!(report.is_delivered());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/events")
            .with_status(400)
            .with_body("Event batch cannot be empty")
            .expect(1)
            .create_async()
            .await;

        let client = DeliveryClient::new(&test_config(server.url()), Handle::current()).unwrap();
        let report = client.deliver_now(batch(1)).await;

        mock.assert_async().await;
        assert!(matches!(
            report.requests[0].outcome,
            DeliveryOutcome::Rejected { status: Some(400), .. }
        ));
        assert_eq!(report.dropped_events(), 1);

        match report.into_result() {
            Err(TraceError::DeliveryError(message)) => {
                assert!(message.contains("batch 1"));
                assert!(message.contains("status 400"));
            }
            other => panic!("expected a delivery error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retried_until_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/events")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let client = DeliveryClient::new(&test_config(server.url()), Handle::current()).unwrap();
        let report = client.deliver_now(batch(1)).await;

        mock.assert_async().await;
        match &report.requests[0].outcome {
            DeliveryOutcome::Exhausted { attempts, last_error } => {
                assert_eq!(*attempts, 3);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/events")
            .with_status(429)
            .expect(3)
            .create_async()
            .await;

        let client = DeliveryClient::new(&test_config(server.url()), Handle::current()).unwrap();
        let report = client.deliver_now(batch(1)).await;

        mock.assert_async().await;
        assert!(!report.is_delivered());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retried() {
        let config = TracerConfig::default()
            .with_backend_url("http://127.0.0.1:1")
            .with_retry(1, Duration::from_millis(1));
        let client = DeliveryClient::new(&config, Handle::current()).unwrap();

        let report = client.deliver_now(batch(1)).await;

        assert!(matches!(
            report.requests[0].outcome,
            DeliveryOutcome::Exhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_oversized_batch_is_split() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/events")
            .with_status(200)
            .expect(3)
            .create_async()
            .await;

        let config = test_config(server.url()).with_max_batch_events(2);
        let client = DeliveryClient::new(&config, Handle::current()).unwrap();
        let report = client.deliver_now(batch(5)).await;

        mock.assert_async().await;
        assert_eq!(
            report.requests.iter().map(|r| r.events).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert!(report.is_delivered());
    }

    #[tokio::test]
    async fn test_send_then_drain() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/events")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        let client = DeliveryClient::new(&test_config(server.url()), Handle::current()).unwrap();
        client.send(batch(1));
        client.send(batch(3));

        assert!(client.drain(Duration::from_secs(5)).await);
        mock.assert_async().await;
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_sent() {
        let client = DeliveryClient::new(&test_config("http://127.0.0.1:1"), Handle::current()).unwrap();
        client.send(Batch::new(1, Vec::new()));
        assert_eq!(client.in_flight(), 0);
    }
}
