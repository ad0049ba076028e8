//! Tracer configuration.
//!
//! [`TracerConfig`] carries everything the producer side needs: where the collector
//! lives, how events are batched, and how hard delivery retries. Values come from
//! [`Default`], from `RUNSCOPE_*` environment variables (optionally loaded from a
//! `.env` file), or from the builder-style `with_*` methods.

use crate::error::{Result, TraceError};
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a [`Tracer`](crate::tracer::Tracer) and the components it owns.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub api_key: Option<String>,
    pub agent_name: String,
    pub environment: String,
    pub backend_url: String,
    /// Pending events that trigger an immediate flush
    pub batch_size: usize,
    /// Period of the background flush worker
    pub flush_interval: Duration,
    pub request_timeout: Duration,
    /// Retries after the first attempt; total attempts is `max_retries + 1`
    pub max_retries: u32,
    /// Base of the exponential backoff (`backoff_base * 2^attempt`)
    pub backoff_base: Duration,
    /// Largest batch sent in one request
    pub max_batch_events: usize,
    /// Upper bound on how long shutdown waits for in-flight deliveries
    pub shutdown_timeout: Duration,
    pub enabled: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            agent_name: "default_agent".to_string(),
            environment: "development".to_string(),
            backend_url: "http://localhost:8000".to_string(),
            batch_size: 10,
            flush_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            max_batch_events: 10_000,
            shutdown_timeout: Duration::from_secs(5),
            enabled: true,
        }
    }
}

impl TracerConfig {
    /// Build a configuration from defaults overridden by `RUNSCOPE_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(api_key) = lookup("RUNSCOPE_API_KEY").filter(|k| !k.is_empty()) {
            config.api_key = Some(api_key);
        }
        if let Some(agent_name) = lookup("RUNSCOPE_AGENT_NAME") {
            config.agent_name = agent_name;
        }
        if let Some(environment) = lookup("RUNSCOPE_ENVIRONMENT") {
            config.environment = environment;
        }
        if let Some(backend_url) = lookup("RUNSCOPE_BACKEND_URL") {
            config.backend_url = backend_url;
        }
        if let Some(raw) = lookup("RUNSCOPE_BATCH_SIZE") {
            config.batch_size = parse_var("RUNSCOPE_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("RUNSCOPE_FLUSH_INTERVAL") {
            let seconds: f64 = parse_var("RUNSCOPE_FLUSH_INTERVAL", &raw)?;
            config.flush_interval = Duration::try_from_secs_f64(seconds).map_err(|_| {
                TraceError::ConfigError(format!("RUNSCOPE_FLUSH_INTERVAL out of range: {}", raw))
            })?;
        }
        if let Some(raw) = lookup("RUNSCOPE_MAX_RETRIES") {
            config.max_retries = parse_var("RUNSCOPE_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("RUNSCOPE_ENABLED") {
            config.enabled = parse_flag(&raw);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that every field holds a usable value.
    pub fn validate(&self) -> Result<()> {
        if self.agent_name.trim().is_empty() {
            return Err(TraceError::ConfigError("agent_name must be a non-empty string".into()));
        }
        if self.environment.trim().is_empty() {
            return Err(TraceError::ConfigError("environment must be a non-empty string".into()));
        }
        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://")) {
            return Err(TraceError::ConfigError(
                "backend_url must start with http:// or https://".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(TraceError::ConfigError("batch_size must be greater than 0".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(TraceError::ConfigError("flush_interval must be greater than 0".into()));
        }
        if self.max_batch_events == 0 {
            return Err(TraceError::ConfigError("max_batch_events must be greater than 0".into()));
        }
        Ok(())
    }

    /// URL of the batch ingestion endpoint.
    pub fn events_url(&self) -> String {
        format!("{}/api/events", self.backend_url.trim_end_matches('/'))
    }

    pub fn with_backend_url(mut self, backend_url: impl Into<String>) -> Self {
        self.backend_url = backend_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_agent_name(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = agent_name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_max_batch_events(mut self, max_batch_events: usize) -> Self {
        self.max_batch_events = max_batch_events;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| TraceError::ConfigError(format!("{} has an invalid value: {}", key, raw)))
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}
