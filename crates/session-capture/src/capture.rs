// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capture context and its public surface.
//!
//! [`SessionCapture`] is created once per process by the host bridge and
//! passed to every capture call. Each call validates its input, checks that
//! the session accepts events, redacts the payload and enqueues it. Failures
//! are returned as values and mirrored onto the diagnostics channel; a capture
//! call never panics into the host.

use crate::config::CaptureConfig;
use crate::diagnostics::{DiagnosticEvent, DiagnosticKind, DiagnosticObserver, Diagnostics};
use crate::error::CaptureError;
use crate::event::{
    self, CaptureException, CaptureMessage, CustomEvent, EventPayload, Identify, LogEvent,
    LogLevel, PropertyValue, ReduxAction, ReduxInitialState,
};
use crate::network::{NetworkCaptures, RequestCapture, ResponseCapture};
use crate::queue::EventQueue;
use crate::redaction::Redactor;
use crate::session::{
    Session, SessionManager, SessionState, ShutdownCallback, ShutdownGuard, ShutdownOutcome,
};
use crate::uploader::{FlushReport, Uploader};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REVENUE_PROPERTY: &str = "revenue";

/// A failed capture call, plus how it should be reported.
struct Rejection {
    error: CaptureError,
    redux_size: bool,
}

impl From<CaptureError> for Rejection {
    fn from(error: CaptureError) -> Self {
        Self {
            error,
            redux_size: false,
        }
    }
}

struct UploaderHandle {
    uploader: Arc<Uploader>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SessionCapture {
    config: Arc<CaptureConfig>,
    session: SessionManager,
    queue: Arc<EventQueue>,
    redactor: Redactor,
    network: NetworkCaptures,
    diagnostics: Arc<Diagnostics>,
    uploader: Mutex<Option<UploaderHandle>>,
}

impl std::fmt::Debug for SessionCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCapture")
            .field("app_id", &self.config.app_id)
            .field("session", &self.session)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl SessionCapture {
    pub fn new(config: CaptureConfig) -> Result<Self, CaptureError> {
        config.validate()?;

        let diagnostics = Arc::new(Diagnostics::default());
        let queue = Arc::new(EventQueue::new(
            config.queue_capacity,
            config.overflow_policy,
            config.high_water_mark,
        ));
        Ok(Self {
            redactor: Redactor::from_config(&config),
            session: SessionManager::new(Arc::clone(&diagnostics)),
            network: NetworkCaptures::default(),
            config: Arc::new(config),
            queue,
            diagnostics,
            uploader: Mutex::new(None),
        })
    }

    fn uploader_slot(&self) -> MutexGuard<'_, Option<UploaderHandle>> {
        self.uploader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a capture call, containing panics and reporting failures.
    fn boundary<T>(
        &self,
        operation: &str,
        f: impl FnOnce() -> Result<T, Rejection>,
    ) -> Result<T, CaptureError> {
        let result = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
            Err(CaptureError::Runtime(format!("{operation} panicked")).into())
        });

        result.map_err(|rejection| {
            let mut event = DiagnosticEvent::from_error(operation, &rejection.error);
            if rejection.redux_size {
                event = event.with_redux_size_warning();
            }
            self.diagnostics.report(event);
            rejection.error
        })
    }

    /// Redacts a payload and enforces the event size limit.
    fn prepare(&self, payload: EventPayload) -> Result<EventPayload, Rejection> {
        let payload = self.redactor.redact(payload);
        let kind = payload.kind();
        let size = payload
            .encode_body()
            .map_err(|e| CaptureError::invalid(format!("{kind} event cannot be serialized: {e}")))?
            .len();

        if size > self.config.max_event_size_bytes {
            return Err(Rejection {
                error: CaptureError::invalid(format!(
                    "{kind} event is {size} bytes, above the {} byte limit",
                    self.config.max_event_size_bytes
                )),
                redux_size: kind.is_redux(),
            });
        }
        Ok(payload)
    }

    /// Pushes prepared payloads and returns the sequence numbers evicted to
    /// make room. Runs under the session lock, so it never reports anything.
    fn push(&self, payloads: Vec<EventPayload>) -> Result<Vec<u64>, CaptureError> {
        Ok(self.queue.push_all(payloads)?.evicted)
    }

    /// Reports evictions. Must be called with no session lock held, since
    /// observers may call back into the capture context.
    fn report_evictions(&self, evicted: &[u64]) {
        if evicted.is_empty() {
            return;
        }
        self.diagnostics.report(DiagnosticEvent::new(
            DiagnosticKind::QueueOverflow,
            format!(
                "queue full, dropped {} oldest event(s) (seq {:?})",
                evicted.len(),
                evicted
            ),
        ));
    }

    fn enqueue(&self, payloads: Vec<EventPayload>) -> Result<(), Rejection> {
        let evicted = self.session.with_active(|_| {
            let prepared = payloads
                .into_iter()
                .map(|payload| self.prepare(payload))
                .collect::<Result<Vec<_>, _>>()?;
            self.push(prepared).map_err(Rejection::from)
        })?;
        self.report_evictions(&evicted);
        Ok(())
    }

    /// Starts the session and the background uploader. Must be called from
    /// within a tokio runtime.
    ///
    /// Returns the session URL. A second call fails with
    /// [`CaptureError::AlreadyInitialized`] carrying the existing URL.
    pub fn init(&self) -> Result<String, CaptureError> {
        self.boundary("init", || {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
                CaptureError::Runtime(format!("init requires a tokio runtime: {e}"))
            })?;

            let mut identify_pushed = Ok(Vec::new());
            let session = self.session.activate(
                &self.config.server_url,
                &self.config.app_id,
                |session, pending_identify| {
                    self.start_uploader(&runtime, session);
                    if let Some(identify) = pending_identify {
                        // Still exclusive here, so this lands before any other capture.
                        identify_pushed = self.push(vec![identify]);
                    }
                    Ok(())
                },
            )?;

            match identify_pushed {
                Ok(evicted) => self.report_evictions(&evicted),
                Err(e) => self
                    .diagnostics
                    .report(DiagnosticEvent::from_error("identify", &e)),
            }
            Ok(session.url().to_string())
        })
    }

    fn start_uploader(&self, runtime: &tokio::runtime::Handle, session: &Session) {
        let uploader = Arc::new(Uploader::new(
            Arc::clone(&self.config),
            Arc::clone(&self.queue),
            Arc::clone(&self.diagnostics),
            session.id().to_string(),
        ));
        let cancel = CancellationToken::new();
        let task = runtime.spawn(Arc::clone(&uploader).run(cancel.clone()));
        debug!("CAPTURE | Uploader scheduled for {}", uploader.endpoint());

        *self.uploader_slot() = Some(UploaderHandle {
            uploader,
            cancel,
            task,
        });
    }

    /// Associates the session with a user. Allowed before [`Self::init`]; the
    /// latest such call is delivered once the session starts.
    pub fn identify(
        &self,
        user_id: &str,
        traits: &Value,
        is_anonymous: bool,
    ) -> Result<(), CaptureError> {
        self.boundary("identify", || {
            if user_id.trim().is_empty() {
                return Err(CaptureError::invalid("user id cannot be empty").into());
            }
            let payload = self.prepare(EventPayload::Identify(Identify {
                user_id: user_id.to_string(),
                traits: event::string_map("traits", Some(traits))?,
                is_anonymous,
            }))?;

            match self.session.identify_or_defer(payload, |p| self.push(vec![p]))? {
                Some(evicted) => self.report_evictions(&evicted),
                None => debug!("CAPTURE | Identify buffered until the session starts"),
            }
            Ok(())
        })
    }

    pub fn track(&self, name: &str, properties: &Value) -> Result<(), CaptureError> {
        self.boundary("track", || {
            if name.trim().is_empty() {
                return Err(CaptureError::invalid("event name cannot be empty").into());
            }
            let properties = match properties {
                Value::Null => BTreeMap::new(),
                Value::Object(object) => object
                    .iter()
                    .map(|(key, value)| {
                        if key == REVENUE_PROPERTY && !value.is_number() {
                            return Err(CaptureError::invalid("'revenue' must be a single number"));
                        }
                        PropertyValue::from_json(key, value).map(|v| (key.clone(), v))
                    })
                    .collect::<Result<_, _>>()?,
                _ => return Err(CaptureError::invalid("properties must be an object").into()),
            };

            self.enqueue(vec![EventPayload::Custom(CustomEvent {
                name: name.to_string(),
                properties,
            })])
        })
    }

    /// `level` is one of `DEBUG`, `INFO`, `LOG`, `WARN` or `ERROR`.
    pub fn log(&self, level: &str, args: Vec<String>) -> Result<(), CaptureError> {
        self.boundary("log", || {
            let level: LogLevel = level.parse()?;
            self.enqueue(vec![EventPayload::Log(LogEvent { level, args })])
        })
    }

    /// `options` may carry `tags` and `extra` objects of scalar values.
    pub fn capture_message(&self, message: &str, options: &Value) -> Result<(), CaptureError> {
        self.boundary("captureMessage", || {
            if message.is_empty() {
                return Err(CaptureError::invalid("message cannot be empty").into());
            }
            if !(options.is_null() || options.is_object()) {
                return Err(CaptureError::invalid("options must be an object").into());
            }

            self.enqueue(vec![EventPayload::Message(CaptureMessage {
                message: message.to_string(),
                tags: event::string_map("tags", options.get("tags"))?,
                extra: event::string_map("extra", options.get("extra"))?,
            })])
        })
    }

    pub fn capture_exception(
        &self,
        error_message: &str,
        error_type: &str,
        exception_type: &str,
        stack_trace: &str,
    ) -> Result<(), CaptureError> {
        self.boundary("captureException", || {
            if error_message.is_empty() {
                return Err(CaptureError::invalid("error message cannot be empty").into());
            }

            self.enqueue(vec![EventPayload::Exception(CaptureException {
                error_message: error_message.to_string(),
                error_type: error_type.to_string(),
                exception_type: exception_type.to_string(),
                stack_trace: stack_trace.to_string(),
            })])
        })
    }

    pub fn capture_request(
        &self,
        request_id: &str,
        request: RequestCapture,
    ) -> Result<(), CaptureError> {
        self.boundary("captureRequest", || {
            self.session
                .with_active(|_| self.network.begin(request_id, request))
                .map_err(Rejection::from)
        })
    }

    /// Completes a captured request and enqueues the request/response pair.
    ///
    /// A response for an unknown id is ignored. The pending request is
    /// removed whatever the outcome.
    pub fn capture_response(
        &self,
        request_id: &str,
        response: ResponseCapture,
    ) -> Result<(), CaptureError> {
        self.boundary("captureResponse", || {
            let Some((request, response)) = self.network.complete(request_id, response)? else {
                return Ok(());
            };
            self.enqueue(vec![
                EventPayload::NetworkRequest(request),
                EventPayload::NetworkResponse(response),
            ])
        })
    }

    /// Forgets a captured request whose response will never arrive.
    pub fn abandon_request(&self, request_id: &str) -> bool {
        self.network.abandon(request_id)
    }

    pub fn capture_redux_initial_state(
        &self,
        store_id: i32,
        state: &str,
    ) -> Result<(), CaptureError> {
        self.boundary("captureReduxInitialState", || {
            self.enqueue(vec![EventPayload::ReduxInitialState(ReduxInitialState {
                store_id,
                state: state.to_string(),
            })])
        })
    }

    pub fn capture_redux_action(
        &self,
        store_id: i32,
        action: &str,
        state_delta: &str,
        duration_ms: f64,
        count: u32,
    ) -> Result<(), CaptureError> {
        self.boundary("captureReduxAction", || {
            if action.is_empty() {
                return Err(CaptureError::invalid("redux action cannot be empty").into());
            }
            if !duration_ms.is_finite() || duration_ms < 0.0 {
                return Err(CaptureError::invalid(format!(
                    "redux action duration {duration_ms} is invalid"
                ))
                .into());
            }

            self.enqueue(vec![EventPayload::ReduxAction(ReduxAction {
                store_id,
                action: action.to_string(),
                state_delta: state_delta.to_string(),
                duration_ms,
                count,
            })])
        })
    }

    pub fn session_url(&self) -> Result<String, CaptureError> {
        self.session.session_url()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn pause(&self) -> bool {
        self.session.pause()
    }

    pub fn unpause(&self) -> bool {
        self.session.unpause()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.session.is_paused()
    }

    pub fn on_shutdown(&self, callback: impl FnOnce(&ShutdownOutcome) + Send + 'static) {
        let callback: ShutdownCallback = Box::new(callback);
        self.session.on_shutdown(callback);
    }

    pub fn on_error(&self, observer: impl Fn(&DiagnosticEvent) + Send + Sync + 'static) {
        let observer: DiagnosticObserver = Arc::new(observer);
        self.session.on_error(observer);
    }

    /// Number of events waiting for upload.
    #[must_use]
    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }

    /// Number of events lost to queue overflow.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }

    /// Lifetime upload totals, once the session has started.
    #[must_use]
    pub fn upload_totals(&self) -> Option<FlushReport> {
        self.uploader_slot()
            .as_ref()
            .map(|handle| handle.uploader.stats().totals())
    }

    /// Uploads everything queued now, waiting for any in-flight upload first.
    pub async fn flush(&self) -> Result<FlushReport, CaptureError> {
        let uploader = self
            .uploader_slot()
            .as_ref()
            .map(|handle| Arc::clone(&handle.uploader))
            .ok_or(CaptureError::SessionNotActive)?;
        Ok(uploader.force_flush().await)
    }

    /// Stops capturing, runs a final bounded flush and fires the shutdown
    /// callbacks.
    ///
    /// Returns `None` when shutdown was already requested. Callbacks fire
    /// even if this future is dropped before the flush completes.
    pub async fn shutdown(&self) -> Option<ShutdownOutcome> {
        if !self.session.begin_shutdown() {
            debug!("CAPTURE | Shutdown already requested");
            return None;
        }
        let mut guard = ShutdownGuard::new(&self.session);
        self.network.clear();

        let handle = self.uploader_slot().take();
        match handle {
            Some(UploaderHandle {
                uploader,
                cancel,
                task,
            }) => {
                cancel.cancel();
                let timeout = self.config.shutdown_timeout;
                match tokio::time::timeout(timeout, uploader.force_flush()).await {
                    Ok(report) => guard.flushed(report),
                    Err(_) => warn!("CAPTURE | Final flush did not finish within {timeout:?}"),
                }
                task.abort();
            }
            None => guard.flushed(FlushReport::default()),
        }

        let outcome = guard.finish();
        info!("CAPTURE | Capture stopped, {} events left unsent", self.queue.len());
        Some(outcome)
    }
}

impl Drop for SessionCapture {
    fn drop(&mut self) {
        if let Some(handle) = self.uploader_slot().take() {
            handle.cancel.cancel();
        }
    }
}
