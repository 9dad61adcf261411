// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors produced by the capture pipeline.
///
/// None of these ever escape a capture call as a panic: the capture surface
/// returns them as values and mirrors them onto the diagnostics channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Session is not active")]
    SessionNotActive,

    #[error("Session already initialized: {session_url}")]
    AlreadyInitialized { session_url: String },

    #[error("Upload failed: {0}")]
    UploadFailure(String),

    #[error("Queue overflow: capacity of {capacity} events reached")]
    QueueOverflow { capacity: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl CaptureError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        CaptureError::InvalidArgument(message.into())
    }
}
