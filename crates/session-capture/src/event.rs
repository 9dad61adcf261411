// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed events produced by the capture surface.
//!
//! An [`EventPayload`] is what a capture call builds. Once the payload is
//! accepted by the queue it is stamped with a sequence number and capture
//! timestamp and becomes an immutable [`Event`].

use crate::error::CaptureError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Log,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "LOG" => Ok(LogLevel::Log),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(CaptureError::invalid(format!("unknown log level '{other}'"))),
        }
    }
}

/// Value of a custom event property.
///
/// Every property fans out to exactly one element type. Scalars are stored as
/// single-element lists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum PropertyValue {
    Doubles(Vec<f64>),
    Bools(Vec<bool>),
    Strings(Vec<String>),
}

impl PropertyValue {
    /// Converts a raw JSON property into its typed form.
    ///
    /// Mixed-type arrays, nulls and nested objects are rejected rather than
    /// coerced. An empty array carries no element type and is stored as an
    /// empty string list.
    pub fn from_json(key: &str, value: &Value) -> Result<Self, CaptureError> {
        match value {
            Value::Number(n) => Ok(PropertyValue::Doubles(vec![number(key, n)?])),
            Value::Bool(b) => Ok(PropertyValue::Bools(vec![*b])),
            Value::String(s) => Ok(PropertyValue::Strings(vec![s.clone()])),
            Value::Array(items) => Self::from_array(key, items),
            Value::Null | Value::Object(_) => Err(CaptureError::invalid(format!(
                "property '{key}' must be a number, boolean, string or a list of one of those"
            ))),
        }
    }

    fn from_array(key: &str, items: &[Value]) -> Result<Self, CaptureError> {
        let mixed = || CaptureError::invalid(format!("property '{key}' mixes element types"));

        match items.first() {
            None => Ok(PropertyValue::Strings(Vec::new())),
            Some(Value::Number(_)) => items
                .iter()
                .map(|item| match item {
                    Value::Number(n) => number(key, n),
                    _ => Err(mixed()),
                })
                .collect::<Result<_, _>>()
                .map(PropertyValue::Doubles),
            Some(Value::Bool(_)) => items
                .iter()
                .map(|item| item.as_bool().ok_or_else(mixed))
                .collect::<Result<_, _>>()
                .map(PropertyValue::Bools),
            Some(Value::String(_)) => items
                .iter()
                .map(|item| item.as_str().map(ToString::to_string).ok_or_else(mixed))
                .collect::<Result<_, _>>()
                .map(PropertyValue::Strings),
            Some(_) => Err(CaptureError::invalid(format!(
                "property '{key}' contains unsupported element types"
            ))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            PropertyValue::Doubles(v) => v.len(),
            PropertyValue::Bools(v) => v.len(),
            PropertyValue::Strings(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn number(key: &str, n: &serde_json::Number) -> Result<f64, CaptureError> {
    n.as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CaptureError::invalid(format!("property '{key}' is not a finite number")))
}

/// Flattens a JSON object of scalar values into a string map.
///
/// `None`/`null` yields an empty map. Nested objects and arrays are rejected.
pub(crate) fn string_map(
    field: &str,
    value: Option<&Value>,
) -> Result<BTreeMap<String, String>, CaptureError> {
    let object = match value {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Object(object)) => object,
        Some(_) => return Err(CaptureError::invalid(format!("'{field}' must be an object"))),
    };

    object
        .iter()
        .map(|(key, val)| {
            let flattened = match val {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(CaptureError::invalid(format!(
                        "'{field}.{key}' must be a string, number or boolean"
                    )))
                }
            };
            Ok((key.clone(), flattened))
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub name: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureMessage {
    pub message: String,
    pub tags: BTreeMap<String, String>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureException {
    pub error_message: String,
    pub error_type: String,
    pub exception_type: String,
    pub stack_trace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub request_id: String,
    pub status_code: Option<u16>,
    pub duration_ms: Option<f64>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReduxInitialState {
    pub store_id: i32,
    pub state: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReduxAction {
    pub store_id: i32,
    pub action: String,
    pub state_delta: String,
    pub duration_ms: f64,
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub user_id: String,
    pub traits: BTreeMap<String, String>,
    pub is_anonymous: bool,
}

/// Kind discriminant of an event, stable on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Log,
    Custom,
    Message,
    Exception,
    NetworkRequest,
    NetworkResponse,
    ReduxInitialState,
    ReduxAction,
    Identify,
}

impl EventKind {
    #[must_use]
    pub fn tag(self) -> u16 {
        match self {
            EventKind::Log => 1,
            EventKind::Custom => 2,
            EventKind::Message => 3,
            EventKind::Exception => 4,
            EventKind::NetworkRequest => 5,
            EventKind::NetworkResponse => 6,
            EventKind::ReduxInitialState => 7,
            EventKind::ReduxAction => 8,
            EventKind::Identify => 9,
        }
    }

    /// `None` for tags written by a newer encoder.
    #[must_use]
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(EventKind::Log),
            2 => Some(EventKind::Custom),
            3 => Some(EventKind::Message),
            4 => Some(EventKind::Exception),
            5 => Some(EventKind::NetworkRequest),
            6 => Some(EventKind::NetworkResponse),
            7 => Some(EventKind::ReduxInitialState),
            8 => Some(EventKind::ReduxAction),
            9 => Some(EventKind::Identify),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_redux(self) -> bool {
        matches!(self, EventKind::ReduxInitialState | EventKind::ReduxAction)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Log => "log",
            EventKind::Custom => "custom",
            EventKind::Message => "message",
            EventKind::Exception => "exception",
            EventKind::NetworkRequest => "network_request",
            EventKind::NetworkResponse => "network_response",
            EventKind::ReduxInitialState => "redux_initial_state",
            EventKind::ReduxAction => "redux_action",
            EventKind::Identify => "identify",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Log(LogEvent),
    Custom(CustomEvent),
    Message(CaptureMessage),
    Exception(CaptureException),
    NetworkRequest(NetworkRequest),
    NetworkResponse(NetworkResponse),
    ReduxInitialState(ReduxInitialState),
    ReduxAction(ReduxAction),
    Identify(Identify),
}

impl EventPayload {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Log(_) => EventKind::Log,
            EventPayload::Custom(_) => EventKind::Custom,
            EventPayload::Message(_) => EventKind::Message,
            EventPayload::Exception(_) => EventKind::Exception,
            EventPayload::NetworkRequest(_) => EventKind::NetworkRequest,
            EventPayload::NetworkResponse(_) => EventKind::NetworkResponse,
            EventPayload::ReduxInitialState(_) => EventKind::ReduxInitialState,
            EventPayload::ReduxAction(_) => EventKind::ReduxAction,
            EventPayload::Identify(_) => EventKind::Identify,
        }
    }

    /// Serializes the kind-specific body. The kind itself travels separately.
    pub fn encode_body(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            EventPayload::Log(e) => serde_json::to_vec(e),
            EventPayload::Custom(e) => serde_json::to_vec(e),
            EventPayload::Message(e) => serde_json::to_vec(e),
            EventPayload::Exception(e) => serde_json::to_vec(e),
            EventPayload::NetworkRequest(e) => serde_json::to_vec(e),
            EventPayload::NetworkResponse(e) => serde_json::to_vec(e),
            EventPayload::ReduxInitialState(e) => serde_json::to_vec(e),
            EventPayload::ReduxAction(e) => serde_json::to_vec(e),
            EventPayload::Identify(e) => serde_json::to_vec(e),
        }
    }

    pub fn decode_body(kind: EventKind, body: &[u8]) -> serde_json::Result<Self> {
        Ok(match kind {
            EventKind::Log => EventPayload::Log(serde_json::from_slice(body)?),
            EventKind::Custom => EventPayload::Custom(serde_json::from_slice(body)?),
            EventKind::Message => EventPayload::Message(serde_json::from_slice(body)?),
            EventKind::Exception => EventPayload::Exception(serde_json::from_slice(body)?),
            EventKind::NetworkRequest => {
                EventPayload::NetworkRequest(serde_json::from_slice(body)?)
            }
            EventKind::NetworkResponse => {
                EventPayload::NetworkResponse(serde_json::from_slice(body)?)
            }
            EventKind::ReduxInitialState => {
                EventPayload::ReduxInitialState(serde_json::from_slice(body)?)
            }
            EventKind::ReduxAction => EventPayload::ReduxAction(serde_json::from_slice(body)?),
            EventKind::Identify => EventPayload::Identify(serde_json::from_slice(body)?),
        })
    }
}

/// An accepted event. Only the queue (and the batch decoder) create these.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    seq: u64,
    timestamp_ms: i64,
    payload: EventPayload,
}

impl Event {
    pub(crate) fn new(seq: u64, timestamp_ms: i64, payload: EventPayload) -> Self {
        Self {
            seq,
            timestamp_ms,
            payload,
        }
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Capture time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }
}
