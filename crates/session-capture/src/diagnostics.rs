// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Out-of-band channel for internal failures.
//!
//! Capture calls never surface failures to the host application as panics.
//! Instead every failure is logged and handed to the observers registered
//! here, which a host bridge can forward to its own event system.

use crate::error::CaptureError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    InvalidArgument,
    SessionNotActive,
    AlreadyInitialized,
    QueueOverflow,
    UploadFailure,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub kind: DiagnosticKind,
    pub error_message: String,
    /// The host should stop capturing and release the SDK.
    pub should_disable_and_free_memory: bool,
    /// A redux payload was too large to capture.
    pub should_warn_about_redux_size: bool,
}

impl DiagnosticEvent {
    #[must_use]
    pub fn new(kind: DiagnosticKind, error_message: impl Into<String>) -> Self {
        Self {
            kind,
            error_message: error_message.into(),
            should_disable_and_free_memory: false,
            should_warn_about_redux_size: false,
        }
    }

    #[must_use]
    pub fn from_error(operation: &str, err: &CaptureError) -> Self {
        let kind = match err {
            CaptureError::InvalidArgument(_) => DiagnosticKind::InvalidArgument,
            CaptureError::SessionNotActive => DiagnosticKind::SessionNotActive,
            CaptureError::AlreadyInitialized { .. } => DiagnosticKind::AlreadyInitialized,
            CaptureError::QueueOverflow { .. } => DiagnosticKind::QueueOverflow,
            CaptureError::UploadFailure(_) => DiagnosticKind::UploadFailure,
            CaptureError::InvalidConfig(_) | CaptureError::Runtime(_) => DiagnosticKind::Internal,
        };
        Self::new(kind, format!("{operation}: {err}"))
    }

    #[must_use]
    pub fn with_redux_size_warning(mut self) -> Self {
        self.should_warn_about_redux_size = true;
        self
    }

    #[must_use]
    pub fn with_disable(mut self) -> Self {
        self.should_disable_and_free_memory = true;
        self
    }
}

pub type DiagnosticObserver = Arc<dyn Fn(&DiagnosticEvent) + Send + Sync>;

#[derive(Default)]
pub struct Diagnostics {
    observers: RwLock<Vec<DiagnosticObserver>>,
    reported: AtomicU64,
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("reported", &self.reported())
            .finish_non_exhaustive()
    }
}

impl Diagnostics {
    pub fn register(&self, observer: DiagnosticObserver) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn report(&self, event: DiagnosticEvent) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        match event.kind {
            // Expected around startup and shutdown.
            DiagnosticKind::SessionNotActive | DiagnosticKind::AlreadyInitialized => {
                debug!("DIAGNOSTICS | {}", event.error_message);
            }
            DiagnosticKind::InvalidArgument | DiagnosticKind::QueueOverflow => {
                warn!("DIAGNOSTICS | {}", event.error_message);
            }
            DiagnosticKind::UploadFailure | DiagnosticKind::Internal => {
                error!("DIAGNOSTICS | {}", event.error_message);
            }
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                error!("DIAGNOSTICS | Observer panicked while handling a diagnostic");
            }
        }
    }

    /// Total number of diagnostics reported so far.
    #[must_use]
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}
