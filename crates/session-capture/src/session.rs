// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide session lifecycle.
//!
//! ```text
//! Uninitialized ──init──> Active <──pause/unpause──> Paused
//!       │                   │                          │
//!       └───────────────────┴──────shutdown────────────┘
//!                           │
//!                           v
//!                     ShuttingDown ──flush done / timed out──> Shutdown
//! ```
//!
//! Transitions take the write side of the state lock, so `init`, `pause` and
//! `shutdown` racing from different threads are applied one at a time.
//! Capture calls hold the read side while they enqueue, which guarantees that
//! nothing reaches the queue once shutdown has started.

use crate::diagnostics::{DiagnosticObserver, Diagnostics};
use crate::error::CaptureError;
use crate::event::EventPayload;
use crate::uploader::FlushReport;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Paused,
    ShuttingDown,
    Shutdown,
}

impl SessionState {
    /// Whether capture calls are accepted in this state.
    #[must_use]
    pub fn accepts_events(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::ShuttingDown => "shutting_down",
            SessionState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    id: String,
    url: String,
    started_at: SystemTime,
}

impl Session {
    fn start(server_url: &str, app_id: &str) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let url = format!(
            "{}/s/{}/{}",
            server_url.trim().trim_end_matches('/'),
            app_id,
            id
        );
        Self {
            id,
            url,
            started_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }
}

/// Passed to shutdown callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// `false` when the final flush hit the shutdown timeout or was abandoned.
    pub completed: bool,
    pub report: FlushReport,
}

pub type ShutdownCallback = Box<dyn FnOnce(&ShutdownOutcome) + Send>;

enum Callbacks {
    Waiting(Vec<ShutdownCallback>),
    Fired(ShutdownOutcome),
}

struct Inner {
    state: SessionState,
    session: Option<Session>,
    pending_identify: Option<EventPayload>,
}

pub struct SessionManager {
    inner: RwLock<Inner>,
    callbacks: Mutex<Callbacks>,
    diagnostics: Arc<Diagnostics>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("session", &self.session())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: SessionState::Uninitialized,
                session: None,
                pending_identify: None,
            }),
            callbacks: Mutex::new(Callbacks::Waiting(Vec::new())),
            diagnostics,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.read().state
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.read().session.clone()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state() == SessionState::Paused
    }

    pub fn session_url(&self) -> Result<String, CaptureError> {
        let inner = self.read();
        match (&inner.session, inner.state.accepts_events()) {
            (Some(session), true) => Ok(session.url.clone()),
            _ => Err(CaptureError::SessionNotActive),
        }
    }

    /// Starts a new session.
    ///
    /// `on_start` runs while the transition is still exclusive and receives
    /// the identify call buffered before initialization, if any.
    pub fn activate<F>(
        &self,
        server_url: &str,
        app_id: &str,
        on_start: F,
    ) -> Result<Session, CaptureError>
    where
        F: FnOnce(&Session, Option<EventPayload>) -> Result<(), CaptureError>,
    {
        let mut inner = self.write();
        match inner.state {
            SessionState::Uninitialized => {}
            SessionState::Active | SessionState::Paused => {
                let session_url = inner
                    .session
                    .as_ref()
                    .map(|s| s.url.clone())
                    .unwrap_or_default();
                return Err(CaptureError::AlreadyInitialized { session_url });
            }
            SessionState::ShuttingDown | SessionState::Shutdown => {
                return Err(CaptureError::SessionNotActive);
            }
        }

        let session = Session::start(server_url, app_id);
        on_start(&session, inner.pending_identify.take())?;
        inner.session = Some(session.clone());
        inner.state = SessionState::Active;
        info!("SESSION | Session {} started", session.id);
        Ok(session)
    }

    /// Runs `f` only while the session accepts events.
    pub fn with_active<T, E>(&self, f: impl FnOnce(&Session) -> Result<T, E>) -> Result<T, E>
    where
        E: From<CaptureError>,
    {
        let inner = self.read();
        match (&inner.session, inner.state.accepts_events()) {
            (Some(session), true) => f(session),
            _ => Err(CaptureError::SessionNotActive.into()),
        }
    }

    /// Enqueues an identify call, or buffers it until the session starts.
    ///
    /// Only one identify call is buffered; a later one replaces it. Returns
    /// `Ok(None)` when the call was buffered.
    pub fn identify_or_defer<T>(
        &self,
        identify: EventPayload,
        enqueue: impl FnOnce(EventPayload) -> Result<T, CaptureError>,
    ) -> Result<Option<T>, CaptureError> {
        let mut inner = self.write();
        match inner.state {
            SessionState::Uninitialized => {
                if inner.pending_identify.replace(identify).is_some() {
                    debug!("SESSION | Replacing identify call buffered before init");
                }
                Ok(None)
            }
            SessionState::Active | SessionState::Paused => enqueue(identify).map(Some),
            SessionState::ShuttingDown | SessionState::Shutdown => {
                Err(CaptureError::SessionNotActive)
            }
        }
    }

    pub fn pause(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Paused)
    }

    pub fn unpause(&self) -> bool {
        self.transition(SessionState::Paused, SessionState::Active)
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut inner = self.write();
        if inner.state != from {
            debug!("SESSION | Ignoring {from} -> {to}, session is {}", inner.state);
            return false;
        }
        inner.state = to;
        debug!("SESSION | Session is now {to}");
        true
    }

    /// Moves into `ShuttingDown`. Returns `false` if shutdown already started.
    pub fn begin_shutdown(&self) -> bool {
        let mut inner = self.write();
        match inner.state {
            SessionState::ShuttingDown | SessionState::Shutdown => false,
            SessionState::Uninitialized | SessionState::Active | SessionState::Paused => {
                inner.state = SessionState::ShuttingDown;
                inner.pending_identify = None;
                info!("SESSION | Shutting down");
                true
            }
        }
    }

    /// Moves into `Shutdown` and fires the shutdown callbacks, once.
    pub fn finish_shutdown(&self, outcome: ShutdownOutcome) {
        self.write().state = SessionState::Shutdown;

        let waiting = {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *callbacks, Callbacks::Fired(outcome)) {
                Callbacks::Waiting(waiting) => waiting,
                Callbacks::Fired(previous) => {
                    *callbacks = Callbacks::Fired(previous);
                    return;
                }
            }
        };

        info!(
            "SESSION | Shutdown complete (flushed: {}, delivered {} events, dropped {})",
            outcome.completed, outcome.report.events_delivered, outcome.report.events_dropped
        );
        for callback in waiting {
            run_callback(callback, &outcome);
        }
    }

    /// Registers a callback fired once shutdown completes. Fires immediately
    /// if shutdown already completed.
    pub fn on_shutdown(&self, callback: ShutdownCallback) {
        let fired = {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *callbacks {
                Callbacks::Waiting(waiting) => {
                    waiting.push(callback);
                    return;
                }
                Callbacks::Fired(outcome) => *outcome,
            }
        };
        run_callback(callback, &fired);
    }

    pub fn on_error(&self, observer: DiagnosticObserver) {
        self.diagnostics.register(observer);
    }
}

fn run_callback(callback: ShutdownCallback, outcome: &ShutdownOutcome) {
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        error!("SESSION | Shutdown callback panicked");
    }
}

/// Completes shutdown when dropped, on every exit path of the final flush.
pub(crate) struct ShutdownGuard<'a> {
    manager: &'a SessionManager,
    outcome: ShutdownOutcome,
}

impl<'a> ShutdownGuard<'a> {
    pub(crate) fn new(manager: &'a SessionManager) -> Self {
        Self {
            manager,
            outcome: ShutdownOutcome::default(),
        }
    }

    pub(crate) fn flushed(&mut self, report: FlushReport) {
        self.outcome = ShutdownOutcome {
            completed: true,
            report,
        };
    }

    pub(crate) fn finish(self) -> ShutdownOutcome {
        self.outcome
    }
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        self.manager.finish_shutdown(self.outcome);
    }
}
