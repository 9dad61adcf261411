// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event capture and delivery pipeline for session replay telemetry.
//!
//! ```text
//! capture call ──> redaction ──> EventQueue ──> Uploader ──> ingest endpoint
//!                      ^
//!          SessionManager gates every capture
//! ```
//!
//! A host bridge creates one [`SessionCapture`] per process, calls
//! [`SessionCapture::init`] from within a tokio runtime, forwards capture
//! calls to it and finally awaits [`SessionCapture::shutdown`].

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod capture;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod logger;
pub mod network;
pub mod queue;
pub mod redaction;
pub mod session;
pub mod uploader;

pub use capture::SessionCapture;
pub use config::{CaptureConfig, OverflowPolicy, RetryPolicy, SanitizerType};
pub use diagnostics::{DiagnosticEvent, DiagnosticKind};
pub use error::CaptureError;
pub use event::{Event, EventKind, EventPayload, LogLevel, PropertyValue};
pub use network::{RequestCapture, ResponseCapture};
pub use session::{SessionState, ShutdownOutcome};
pub use uploader::FlushReport;
