// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background delivery of queued events to the ingest endpoint.
//!
//! ```text
//!   EventQueue ──drain──> Batch ──encode──> zstd? ──POST──> ingest
//!                                                   │
//!                                        5xx / network error
//!                                                   │
//!                                       backoff, retry (bounded)
//! ```
//!
//! # Scheduling
//!
//! [`Uploader::run`] ticks on the configured upload interval and also wakes up
//! early when the queue crosses its high-water mark. A tick that finds another
//! upload in flight is skipped rather than queued, so there is never more
//! than one drain running and batches leave in sequence order.
//!
//! # Failure policy
//!
//! - **2xx**: delivered.
//! - **401/403**: rejected, batch dropped, host told to disable capture.
//! - **other 4xx**: rejected, batch dropped without retry.
//! - **5xx, timeouts, connection errors**: retried with exponential backoff
//!   until the attempt cap or the total-wait cap is hit, then dropped.
//!
//! A dropped batch is never re-queued.

use crate::codec;
use crate::config::CaptureConfig;
use crate::diagnostics::{DiagnosticEvent, DiagnosticKind, Diagnostics};
use crate::error::CaptureError;
use crate::queue::{Batch, EventQueue};
use bytes::Bytes;
use reqwest::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Outcome of one flush pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches_delivered: u64,
    pub batches_dropped: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
}

impl FlushReport {
    fn delivered(&mut self, batch: &Batch) {
        self.batches_delivered += 1;
        self.events_delivered += batch.len() as u64;
    }

    fn dropped(&mut self, batch: &Batch) {
        self.batches_dropped += 1;
        self.events_dropped += batch.len() as u64;
    }
}

/// Lifetime counters of an uploader.
#[derive(Debug, Default)]
pub struct UploaderStats {
    batches_delivered: AtomicU64,
    batches_dropped: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    ticks_coalesced: AtomicU64,
}

impl UploaderStats {
    fn record(&self, report: &FlushReport) {
        self.batches_delivered
            .fetch_add(report.batches_delivered, Ordering::Relaxed);
        self.batches_dropped
            .fetch_add(report.batches_dropped, Ordering::Relaxed);
        self.events_delivered
            .fetch_add(report.events_delivered, Ordering::Relaxed);
        self.events_dropped
            .fetch_add(report.events_dropped, Ordering::Relaxed);
    }

    #[must_use]
    pub fn totals(&self) -> FlushReport {
        FlushReport {
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn ticks_coalesced(&self) -> u64 {
        self.ticks_coalesced.load(Ordering::Relaxed)
    }
}

enum Delivery {
    Delivered,
    Rejected(String),
    Transient(String),
}

pub struct Uploader {
    client: reqwest::Client,
    endpoint: String,
    session_id: String,
    config: Arc<CaptureConfig>,
    queue: Arc<EventQueue>,
    diagnostics: Arc<Diagnostics>,
    in_flight: TokioMutex<()>,
    stats: UploaderStats,
}

impl Uploader {
    #[must_use]
    pub fn new(
        config: Arc<CaptureConfig>,
        queue: Arc<EventQueue>,
        diagnostics: Arc<Diagnostics>,
        session_id: String,
    ) -> Self {
        let endpoint = format!(
            "{}/v1/ingest/{}",
            config.server_url.trim().trim_end_matches('/'),
            config.app_id
        );
        Self {
            client: get_client(&config),
            endpoint,
            session_id,
            config,
            queue,
            diagnostics,
            in_flight: TokioMutex::new(()),
            stats: UploaderStats::default(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn stats(&self) -> &UploaderStats {
        &self.stats
    }

    /// Runs the upload loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("UPLOAD | Uploader started for {}", self.endpoint);

        let mut ticker = interval(self.config.upload_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // discard first tick

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("UPLOAD | Uploader stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                () = self.queue.high_water_reached() => {
                    debug!("UPLOAD | High-water mark reached, uploading early");
                    self.tick().await;
                }
            }
        }
    }

    /// One scheduled pass. Returns `None` when another upload is in flight.
    pub async fn tick(&self) -> Option<FlushReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            self.stats.ticks_coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("UPLOAD | Upload already in flight, skipping tick");
            return None;
        };
        Some(self.flush_locked().await)
    }

    /// Waits for any in-flight upload, then drains what is queued.
    pub async fn force_flush(&self) -> FlushReport {
        let _guard = self.in_flight.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> FlushReport {
        let mut report = FlushReport::default();
        // Only what is queued now; events arriving meanwhile wait for the next pass.
        let mut remaining = self.queue.len();

        while remaining > 0 {
            let batch = self
                .queue
                .drain(self.config.max_batch_size.min(remaining));
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());

            match self.deliver(&batch).await {
                Ok(()) => {
                    debug!(
                        "UPLOAD | Delivered batch {:?}..={:?} ({} events)",
                        batch.first_seq(),
                        batch.last_seq(),
                        batch.len()
                    );
                    report.delivered(&batch);
                }
                Err(e) => {
                    report.dropped(&batch);
                    self.diagnostics
                        .report(DiagnosticEvent::from_error("upload", &e));
                }
            }
        }

        self.stats.record(&report);
        report
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), CaptureError> {
        let (body, compressed) = self.prepare(batch)?;
        let retry = &self.config.retry;
        let mut waited = Duration::ZERO;
        let mut attempts = 0;
        let started = Instant::now();

        loop {
            attempts += 1;
            let reason = match self.send(batch, body.clone(), compressed).await {
                Delivery::Delivered => return Ok(()),
                Delivery::Rejected(reason) => return Err(CaptureError::UploadFailure(reason)),
                Delivery::Transient(reason) => reason,
            };

            let backoff = retry.backoff(attempts);
            if attempts >= retry.max_attempts || waited + backoff > retry.max_total_wait {
                error!(
                    "UPLOAD | Failed to send batch after {} ms and {} attempts: {}",
                    started.elapsed().as_millis(),
                    attempts,
                    reason
                );
                return Err(CaptureError::UploadFailure(format!(
                    "failed after {attempts} attempts: {reason}"
                )));
            }

            debug!("UPLOAD | Attempt {attempts} failed ({reason}), retrying in {backoff:?}");
            tokio::time::sleep(backoff).await;
            waited += backoff;
        }
    }

    fn prepare(&self, batch: &Batch) -> Result<(Bytes, bool), CaptureError> {
        let encoded = codec::encode_batch(batch)?;
        if !self.config.use_compression {
            return Ok((encoded, false));
        }

        match zstd::stream::encode_all(&encoded[..], self.config.compression_level) {
            Ok(compressed) => Ok((Bytes::from(compressed), true)),
            Err(e) => {
                debug!("UPLOAD | Failed to compress batch: {}", e);
                Ok((encoded, false))
            }
        }
    }

    async fn send(&self, batch: &Batch, body: Bytes, compressed: bool) -> Delivery {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.config.flush_timeout)
            .header(CONTENT_TYPE, codec::CONTENT_TYPE)
            .header("X-Session-Id", &self.session_id)
            .header(
                "X-Batch-Seq-Start",
                batch.first_seq().unwrap_or_default().to_string(),
            );
        if compressed {
            request = request.header(CONTENT_ENCODING, "zstd");
        }

        match request.body(body).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Delivery::Delivered
                } else if status == StatusCode::FORBIDDEN
                    || status == StatusCode::UNAUTHORIZED
                {
                    error!(
                        "UPLOAD | Request was denied by the ingest server ({}). Please verify the app ID.",
                        status
                    );
                    self.diagnostics.report(
                        DiagnosticEvent::new(
                            DiagnosticKind::UploadFailure,
                            format!("ingest server denied access: {status}"),
                        )
                        .with_disable(),
                    );
                    Delivery::Rejected(format!("access denied: {status}"))
                } else if status.is_client_error() {
                    Delivery::Rejected(format!("rejected by ingest server: {status}"))
                } else {
                    Delivery::Transient(format!("ingest server returned {status}"))
                }
            }
            Err(e) => Delivery::Transient(e.to_string()),
        }
    }
}

/// Builds the HTTP client, falling back to a direct connection when the
/// proxy configuration cannot be used.
fn get_client(config: &CaptureConfig) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "UPLOAD | Unable to use proxy configuration: {}, falling back to direct connection",
                e
            );
            build_client(config, false).unwrap_or_else(|inner| {
                error!(
                    "UPLOAD | Failed to build HTTP client: {}, using reqwest defaults",
                    inner
                );
                reqwest::Client::new()
            })
        }
    }
}

fn build_client(
    config: &CaptureConfig,
    allow_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.flush_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if let Some(proxy_config) = config.proxy.as_ref().filter(|_| allow_proxy) {
        let mut proxy = reqwest::Proxy::all(proxy_config.url())?;
        if let (Some(name), Some(value)) = (
            proxy_config.auth_header_name.as_deref(),
            proxy_config.auth_header_value.as_deref(),
        ) {
            if !name.eq_ignore_ascii_case("proxy-authorization") {
                warn!("UPLOAD | Proxy auth header '{name}' is sent as Proxy-Authorization");
            }
            match HeaderValue::from_str(value) {
                Ok(value) => proxy = proxy.custom_http_auth(value),
                Err(e) => warn!("UPLOAD | Ignoring invalid proxy auth header value: {e}"),
            }
        }
        builder = builder.proxy(proxy);
    }

    builder.build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{OverflowPolicy, ProxyConfig, RetryPolicy};
    use crate::event::{EventPayload, LogEvent, LogLevel};
    use mockito::Server;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    const PATH: &str = "/v1/ingest/org/app";

    fn test_config(server_url: String) -> CaptureConfig {
        CaptureConfig {
            server_url,
            use_compression: false,
            flush_timeout: Duration::from_secs(2),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                max_total_wait: Duration::from_secs(1),
            },
            ..CaptureConfig::new("org/app")
        }
    }

    fn uploader(config: CaptureConfig) -> (Arc<Uploader>, Arc<EventQueue>, Arc<Diagnostics>) {
        let queue = Arc::new(EventQueue::new(
            config.queue_capacity,
            OverflowPolicy::DropOldest,
            config.high_water_mark,
        ));
        let diagnostics = Arc::new(Diagnostics::default());
        let uploader = Arc::new(Uploader::new(
            Arc::new(config),
            Arc::clone(&queue),
            Arc::clone(&diagnostics),
            "session-1".to_string(),
        ));
        (uploader, queue, diagnostics)
    }

    fn push_logs(queue: &EventQueue, count: usize) {
        for i in 0..count {
            queue
                .push(EventPayload::Log(LogEvent {
                    level: LogLevel::Info,
                    args: vec![format!("message {i}")],
                }))
                .unwrap();
        }
    }

    #[test]
    fn test_endpoint() {
        let (uploader, _, _) = uploader(test_config("https://ingest.example.com/".to_string()));
        assert_eq!(uploader.endpoint(), "https://ingest.example.com/v1/ingest/org/app");
    }

    #[test]
    fn test_client_with_proxy() {
        let mut config = test_config("https://ingest.example.com".to_string());
        config.proxy = Some(ProxyConfig {
            host: "proxy.local".to_string(),
            port: 3128,
            auth_header_name: Some("Proxy-Authorization".to_string()),
            auth_header_value: Some("Basic dXNlcjpwYXNz".to_string()),
        });
        assert!(build_client(&config, true).is_ok());
    }

    #[tokio::test]
    async fn test_force_flush_delivers_queued_events() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .match_header("content-type", codec::CONTENT_TYPE)
            .match_header("x-session-id", "session-1")
            .match_header("x-batch-seq-start", "1")
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let (uploader, queue, _) = uploader(test_config(server.url()));
        push_logs(&queue, 3);

        let report = uploader.force_flush().await;

        mock.assert_async().await;
        assert_eq!(report.batches_delivered, 1);
        assert_eq!(report.events_delivered, 3);
        assert!(queue.is_empty());
        assert_eq!(uploader.stats().totals(), report);
    }

    #[tokio::test]
    async fn test_batches_respect_max_batch_size_and_order() {
        let mut server = Server::new_async().await;
        let starts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&starts);
        let mock = server
            .mock("POST", PATH)
            .match_request(move |request| {
                let events = codec::decode_batch(request.body().unwrap()).unwrap();
                recorded
                    .lock()
                    .unwrap()
                    .push(events.iter().map(|e| e.seq()).collect::<Vec<_>>());
                true
            })
            .with_status(200)
            .expect(3)
            .create_async()
            .await;

        let mut config = test_config(server.url());
        config.max_batch_size = 2;
        let (uploader, queue, _) = uploader(config);
        push_logs(&queue, 5);

        let report = uploader.force_flush().await;

        mock.assert_async().await;
        assert_eq!(report.batches_delivered, 3);
        assert_eq!(
            *starts.lock().unwrap(),
            vec![vec![1, 2], vec![3, 4], vec![5]]
        );
    }

    #[tokio::test]
    async fn test_compressed_upload() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .match_header("content-encoding", "zstd")
            .match_request(|request| {
                let body = zstd::stream::decode_all(&request.body().unwrap()[..]).unwrap();
                codec::decode_batch(&body).unwrap().len() == 2
            })
            .with_status(200)
            .create_async()
            .await;

        let mut config = test_config(server.url());
        config.use_compression = true;
        let (uploader, queue, _) = uploader(config);
        push_logs(&queue, 2);

        let report = uploader.force_flush().await;

        mock.assert_async().await;
        assert_eq!(report.events_delivered, 2);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_dropped() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let (uploader, queue, diagnostics) = uploader(test_config(server.url()));
        push_logs(&queue, 2);

        let report = uploader.force_flush().await;

        mock.assert_async().await;
        assert_eq!(report.batches_dropped, 1);
        assert_eq!(report.events_dropped, 2);
        assert!(queue.is_empty(), "dropped batches are not re-queued");
        assert_eq!(diagnostics.reported(), 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let (uploader, queue, _) = uploader(test_config(server.url()));
        push_logs(&queue, 1);

        let report = uploader.force_flush().await;

        mock.assert_async().await;
        assert_eq!(report.batches_dropped, 1);
    }

    #[tokio::test]
    async fn test_forbidden_asks_host_to_disable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", PATH)
            .with_status(403)
            .create_async()
            .await;

        let (uploader, queue, diagnostics) = uploader(test_config(server.url()));
        let disabled = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&disabled);
        diagnostics.register(Arc::new(move |event: &DiagnosticEvent| {
            if event.should_disable_and_free_memory {
                *flag.lock().unwrap() = true;
            }
        }));
        push_logs(&queue, 1);

        uploader.force_flush().await;

        assert!(*disabled.lock().unwrap());
    }

    #[tokio::test]
    async fn test_total_wait_caps_retries() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let mut config = test_config(server.url());
        config.retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            max_total_wait: Duration::from_millis(50),
        };
        let (uploader, queue, _) = uploader(config);
        push_logs(&queue, 1);

        let report = uploader.force_flush().await;

        // 20ms after the first attempt, 40ms more would exceed the 50ms cap.
        mock.assert_async().await;
        assert_eq!(report.batches_dropped, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failure_log_reports_time_across_all_attempts() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", PATH)
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let mut config = test_config(server.url());
        config.retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(40),
            max_backoff: Duration::from_millis(40),
            max_total_wait: Duration::from_secs(1),
        };
        let (uploader, queue, _) = uploader(config);
        push_logs(&queue, 1);

        uploader.force_flush().await;

        // Two 40ms backoffs separate the three attempts.
        logs_assert(|lines: &[&str]| {
            let line = lines
                .iter()
                .find(|line| line.contains("Failed to send batch after"))
                .ok_or("no failure log")?;
            let millis: u128 = line
                .split("after ")
                .nth(1)
                .and_then(|rest| rest.split(' ').next())
                .and_then(|ms| ms.parse().ok())
                .ok_or("no elapsed time")?;
            if millis >= 80 {
                Ok(())
            } else {
                Err(format!("elapsed {millis} ms covers only the last attempt"))
            }
        });
    }

    #[tokio::test]
    async fn test_connection_errors_are_dropped() {
        let (uploader, queue, _) = uploader(test_config("http://127.0.0.1:1".to_string()));
        push_logs(&queue, 4);

        let report = uploader.force_flush().await;

        assert_eq!(report.batches_dropped, 1);
        assert_eq!(report.events_dropped, 4);
    }

    #[tokio::test]
    async fn test_tick_is_coalesced_while_in_flight() {
        let (uploader, queue, _) = uploader(test_config("http://127.0.0.1:1".to_string()));
        push_logs(&queue, 1);

        let guard = uploader.in_flight.lock().await;
        assert!(uploader.tick().await.is_none());
        assert_eq!(uploader.stats().ticks_coalesced(), 1);
        assert_eq!(queue.len(), 1, "a coalesced tick does not drain");
        drop(guard);
    }

    #[tokio::test]
    async fn test_empty_queue_sends_nothing() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .expect(0)
            .create_async()
            .await;

        let (uploader, _, _) = uploader(test_config(server.url()));

        assert_eq!(uploader.tick().await, Some(FlushReport::default()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_run_uploads_on_high_water_mark() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(200)
            .create_async()
            .await;

        let mut config = test_config(server.url());
        config.upload_interval = Duration::from_secs(3600);
        config.high_water_mark = 2;
        let (uploader, queue, _) = uploader(config);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&uploader).run(cancel.clone()));
        push_logs(&queue, 2);

        let delivered = tokio::time::timeout(Duration::from_secs(2), async {
            while !mock.matched_async().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        cancel.cancel();
        task.await.unwrap();
        assert!(delivered.is_ok(), "high-water mark did not trigger an upload");
    }

    #[tokio::test]
    async fn test_run_uploads_on_interval() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(200)
            .create_async()
            .await;

        let mut config = test_config(server.url());
        config.upload_interval = Duration::from_millis(20);
        let (uploader, queue, _) = uploader(config);
        push_logs(&queue, 1);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&uploader).run(cancel.clone()));

        let delivered = tokio::time::timeout(Duration::from_secs(2), async {
            while !mock.matched_async().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        cancel.cancel();
        task.await.unwrap();
        assert!(delivered.is_ok(), "interval tick did not upload");
    }
}
