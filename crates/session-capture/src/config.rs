// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::CaptureError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "https://r.sessioncapture.io";
const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_HIGH_WATER_MARK: usize = 1_000;
const DEFAULT_MAX_BATCH_SIZE: usize = 500;
/// Largest serialized payload accepted for a single event (1MB).
const DEFAULT_MAX_EVENT_SIZE_BYTES: usize = 1024 * 1024;
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the queue gives up when it is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the lowest sequence number present and accept the new event.
    #[default]
    DropOldest,
    /// Keep the queue as is and reject the new event.
    DropIncoming,
}

/// Text sanitizer applied to free-form text before events are queued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizerType {
    /// Mask sensitive-looking sequences (emails, card numbers, custom rules).
    #[default]
    Excluded,
    /// Leave text untouched. Tag-based suppression still applies.
    None,
}

/// Reads a snake_case enum variant such as `drop_oldest` from `name`.
fn enum_from_env<T: DeserializeOwned>(name: &str, what: &str) -> Result<Option<T>, CaptureError> {
    let Ok(val) = env::var(name) else {
        return Ok(None);
    };
    serde_json::from_value(serde_json::Value::String(val.trim().to_lowercase()))
        .map(Some)
        .map_err(|_| CaptureError::InvalidConfig(format!("Unknown {what} '{val}'")))
}

/// A named pattern whose matches are replaced before upload.
///
/// ```json
/// {"name": "mask_tokens", "pattern": "tok_[a-z0-9]+", "replace_placeholder": "[TOKEN]"}
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct MaskRule {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub replace_placeholder: Option<String>,
}

/// Outbound proxy used by the uploader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub auth_header_name: Option<String>,
    pub auth_header_value: Option<String>,
}

impl ProxyConfig {
    /// Parses `http://host:port` style proxy URLs such as `HTTPS_PROXY`.
    fn from_url(value: &str) -> Option<Self> {
        let without_scheme = value
            .trim()
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        let (host, port) = without_scheme.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port: port.parse().ok()?,
            auth_header_name: None,
            auth_header_value: None,
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Bounded exponential backoff for batch delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total delivery attempts per batch, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on the time spent sleeping between attempts of one batch.
    pub max_total_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
            max_total_wait: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Configuration of the capture pipeline.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Application identifier sessions are recorded under
    pub app_id: String,
    /// Base URL of the ingest server
    pub server_url: String,
    /// Interval between regular uploads
    pub upload_interval: Duration,
    /// Maximum number of events held by the queue
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Queue size that triggers an early upload
    pub high_water_mark: usize,
    /// Maximum number of events per uploaded batch
    pub max_batch_size: usize,
    pub max_event_size_bytes: usize,
    /// Field names suppressed from every event
    pub redaction_tags: Vec<String>,
    pub text_sanitizer: SanitizerType,
    /// Extra masking rules used by the pattern sanitizer
    pub mask_rules: Vec<MaskRule>,
    pub proxy: Option<ProxyConfig>,
    /// Timeout of a single upload request
    pub flush_timeout: Duration,
    pub retry: RetryPolicy,
    /// Upper bound on the final flush performed by shutdown
    pub shutdown_timeout: Duration,
    pub use_compression: bool,
    pub compression_level: i32,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            upload_interval: DEFAULT_UPLOAD_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_event_size_bytes: DEFAULT_MAX_EVENT_SIZE_BYTES,
            redaction_tags: Vec::new(),
            text_sanitizer: SanitizerType::default(),
            mask_rules: Vec::new(),
            proxy: None,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            retry: RetryPolicy::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            use_compression: true,
            compression_level: 3,
            log_level: "info".to_string(),
        }
    }
}

impl CaptureConfig {
    /// Create a default configuration for the given application.
    #[must_use]
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, CaptureError> {
        let defaults = Self::default();

        let app_id = env::var("SESSION_CAPTURE_APP_ID").unwrap_or_default();
        let server_url = env::var("SESSION_CAPTURE_SERVER_URL").unwrap_or(defaults.server_url);
        let upload_interval = env::var("SESSION_CAPTURE_UPLOAD_INTERVAL_MS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .map_or(defaults.upload_interval, Duration::from_millis);
        let queue_capacity = env::var("SESSION_CAPTURE_QUEUE_CAPACITY")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(defaults.queue_capacity);
        let high_water_mark = env::var("SESSION_CAPTURE_HIGH_WATER_MARK")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or_else(|| defaults.high_water_mark.min(queue_capacity));
        let overflow_policy =
            enum_from_env("SESSION_CAPTURE_OVERFLOW_POLICY", "overflow policy")?
                .unwrap_or(defaults.overflow_policy);
        let redaction_tags = env::var("SESSION_CAPTURE_REDACTION_TAGS")
            .map(|val| {
                val.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let text_sanitizer = enum_from_env("SESSION_CAPTURE_TEXT_SANITIZER", "text sanitizer")?
            .unwrap_or(defaults.text_sanitizer);
        let mask_rules = match env::var("SESSION_CAPTURE_MASK_RULES") {
            Ok(val) => serde_json::from_str::<Vec<MaskRule>>(&val).map_err(|e| {
                CaptureError::InvalidConfig(format!("Unable to parse mask rules: {e}"))
            })?,
            Err(_) => Vec::new(),
        };
        let proxy = Self::proxy_from_env();
        let log_level = env::var("SESSION_CAPTURE_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            app_id,
            server_url,
            upload_interval,
            queue_capacity,
            overflow_policy,
            high_water_mark,
            redaction_tags,
            text_sanitizer,
            mask_rules,
            proxy,
            log_level,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    fn proxy_from_env() -> Option<ProxyConfig> {
        let explicit = env::var("SESSION_CAPTURE_PROXY_HOST").ok().and_then(|host| {
            let port = env::var("SESSION_CAPTURE_PROXY_PORT")
                .ok()
                .and_then(|port| port.parse::<u16>().ok())?;
            Some(ProxyConfig {
                host,
                port,
                auth_header_name: env::var("SESSION_CAPTURE_PROXY_AUTH_HEADER_NAME").ok(),
                auth_header_value: env::var("SESSION_CAPTURE_PROXY_AUTH_HEADER_VALUE").ok(),
            })
        });
        explicit.or_else(|| {
            env::var("HTTPS_PROXY")
                .ok()
                .and_then(|val| ProxyConfig::from_url(&val))
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.app_id.trim().is_empty() {
            return Err(CaptureError::InvalidConfig(
                "App ID cannot be empty".to_string(),
            ));
        }

        let server_url = self.server_url.trim();
        if !(server_url.starts_with("http://") || server_url.starts_with("https://"))
            || reqwest::Url::parse(server_url).is_err()
        {
            return Err(CaptureError::InvalidConfig(format!(
                "Invalid server URL '{}'",
                self.server_url
            )));
        }

        if self.queue_capacity == 0 {
            return Err(CaptureError::InvalidConfig(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.high_water_mark == 0 || self.high_water_mark > self.queue_capacity {
            return Err(CaptureError::InvalidConfig(format!(
                "High-water mark must be between 1 and the queue capacity ({})",
                self.queue_capacity
            )));
        }

        if self.max_batch_size == 0 {
            return Err(CaptureError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.upload_interval.is_zero() {
            return Err(CaptureError::InvalidConfig(
                "Upload interval must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(CaptureError::InvalidConfig(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(CaptureError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}
