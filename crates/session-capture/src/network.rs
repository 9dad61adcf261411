// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Correlation of captured network requests with their responses.
//!
//! A request is parked here until its response arrives. Completing or
//! abandoning a request always removes its entry, whatever the outcome.

use crate::error::CaptureError;
use crate::event::{NetworkRequest, NetworkResponse};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const DEFAULT_METHOD: &str = "GET";

/// Caller-supplied fields of an outgoing request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestCapture {
    pub url: String,
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Caller-supplied fields of a response. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseCapture {
    pub status_code: Option<u16>,
    pub duration_ms: Option<f64>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Default)]
pub struct NetworkCaptures {
    pending: Mutex<HashMap<String, NetworkRequest>>,
}

impl NetworkCaptures {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, NetworkRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks a request until its response is captured. A second request with
    /// the same id replaces the first.
    pub fn begin(&self, request_id: &str, capture: RequestCapture) -> Result<(), CaptureError> {
        if request_id.trim().is_empty() {
            return Err(CaptureError::invalid("request id cannot be empty"));
        }
        if capture.url.trim().is_empty() {
            return Err(CaptureError::invalid(format!(
                "request '{request_id}' has no url"
            )));
        }
        let method = capture
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_METHOD)
            .to_ascii_uppercase();

        let request = NetworkRequest {
            request_id: request_id.to_string(),
            url: capture.url,
            method,
            headers: capture.headers,
            body: capture.body,
        };
        if self.lock().insert(request_id.to_string(), request).is_some() {
            debug!("CAPTURE | Request '{request_id}' was captured twice, keeping the latest");
        }
        Ok(())
    }

    /// Removes the pending request and pairs it with `capture`.
    ///
    /// Returns `Ok(None)` for an id with no pending request. The entry is
    /// removed even when the response fields are rejected.
    pub fn complete(
        &self,
        request_id: &str,
        capture: ResponseCapture,
    ) -> Result<Option<(NetworkRequest, NetworkResponse)>, CaptureError> {
        let Some(request) = self.lock().remove(request_id) else {
            debug!("CAPTURE | Ignoring response for unknown request '{request_id}'");
            return Ok(None);
        };

        if let Some(status) = capture.status_code {
            if !(100..=599).contains(&status) {
                return Err(CaptureError::invalid(format!(
                    "response '{request_id}' has invalid status code {status}"
                )));
            }
        }
        if let Some(duration) = capture.duration_ms {
            if !duration.is_finite() || duration < 0.0 {
                return Err(CaptureError::invalid(format!(
                    "response '{request_id}' has invalid duration {duration}"
                )));
            }
        }

        let response = NetworkResponse {
            request_id: request.request_id.clone(),
            status_code: capture.status_code,
            duration_ms: capture.duration_ms,
            headers: capture.headers,
            body: capture.body,
        };
        Ok(Some((request, response)))
    }

    /// Drops a pending request without emitting anything.
    pub fn abandon(&self, request_id: &str) -> bool {
        self.lock().remove(request_id).is_some()
    }

    /// Drops every pending request.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(url: &str) -> RequestCapture {
        RequestCapture {
            url: url.to_string(),
            method: Some("post".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_response_pair() {
        let captures = NetworkCaptures::default();
        captures.begin("r1", request("https://api.example.com/cart")).unwrap();
        assert!(captures.contains("r1"));

        let (req, resp) = captures
            .complete(
                "r1",
                ResponseCapture {
                    status_code: Some(201),
                    duration_ms: Some(12.5),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.request_id, "r1");
        assert_eq!(resp.request_id, "r1");
        assert_eq!(resp.status_code, Some(201));
        assert!(captures.is_empty());
    }

    #[test]
    fn test_response_without_fields_still_pairs() {
        let captures = NetworkCaptures::default();
        captures.begin("r1", request("https://api.example.com")).unwrap();

        let (_, resp) = captures
            .complete("r1", ResponseCapture::default())
            .unwrap()
            .unwrap();

        assert_eq!(resp.status_code, None);
        assert_eq!(resp.duration_ms, None);
    }

    #[test]
    fn test_unknown_response_is_noop() {
        let captures = NetworkCaptures::default();
        captures.begin("r1", request("https://api.example.com")).unwrap();

        assert_eq!(captures.complete("other", ResponseCapture::default()).unwrap(), None);
        assert_eq!(captures.len(), 1);
    }

    #[test]
    fn test_invalid_response_still_removes_entry() {
        let captures = NetworkCaptures::default();
        captures.begin("r1", request("https://api.example.com")).unwrap();

        let err = captures
            .complete(
                "r1",
                ResponseCapture {
                    duration_ms: Some(f64::NAN),
                    ..Default::default()
                },
            )
            .unwrap_err();

        assert!(matches!(err, CaptureError::InvalidArgument(_)));
        assert!(captures.is_empty());
    }

    #[test]
    fn test_begin_validates_input() {
        let captures = NetworkCaptures::default();
        assert!(captures.begin("", request("https://api.example.com")).is_err());
        assert!(captures.begin("r1", request(" ")).is_err());
        assert!(captures.is_empty());
    }

    #[test]
    fn test_default_method_and_abandon() {
        let captures = NetworkCaptures::default();
        captures
            .begin(
                "r1",
                RequestCapture {
                    url: "https://api.example.com".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(captures.abandon("r1"));
        assert!(!captures.abandon("r1"));

        captures.begin("r2", RequestCapture {
            url: "https://api.example.com".to_string(),
            ..Default::default()
        }).unwrap();
        let (req, _) = captures.complete("r2", ResponseCapture::default()).unwrap().unwrap();
        assert_eq!(req.method, "GET");
    }
}
