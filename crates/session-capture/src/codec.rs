// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upload wire format.
//!
//! ```text
//! batch  := magic "SCB1" | version: u16 | count: u32 | record*
//! record := kind: u16 | seq: u64 | timestamp_ms: i64 | len: u32 | body[len]
//! ```
//!
//! Integers are big-endian and bodies are JSON. Every record carries its own
//! length, so a decoder skips kinds it does not know instead of failing.

use crate::error::CaptureError;
use crate::event::{Event, EventKind, EventPayload};
use crate::queue::Batch;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

pub const MAGIC: &[u8; 4] = b"SCB1";
pub const FORMAT_VERSION: u16 = 1;
pub const CONTENT_TYPE: &str = "application/x-session-capture-batch";

const HEADER_LEN: usize = 4 + 2 + 4;
const RECORD_HEADER_LEN: usize = 2 + 8 + 8 + 4;

pub fn encode_batch(batch: &Batch) -> Result<Bytes, CaptureError> {
    let count = u32::try_from(batch.len())
        .map_err(|_| CaptureError::UploadFailure("batch has too many events".to_string()))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + batch.len() * 128);
    buf.put_slice(MAGIC);
    buf.put_u16(FORMAT_VERSION);
    buf.put_u32(count);

    for event in batch.events() {
        let body = event.payload().encode_body().map_err(|e| {
            CaptureError::UploadFailure(format!(
                "failed to serialize event {}: {e}",
                event.seq()
            ))
        })?;
        let len = u32::try_from(body.len()).map_err(|_| {
            CaptureError::UploadFailure(format!("event {} is too large", event.seq()))
        })?;

        buf.put_u16(event.kind().tag());
        buf.put_u64(event.seq());
        buf.put_i64(event.timestamp_ms());
        buf.put_u32(len);
        buf.put_slice(&body);
    }

    Ok(buf.freeze())
}

/// Decodes a batch, skipping records of unknown kinds.
pub fn decode_batch(mut data: &[u8]) -> Result<Vec<Event>, CaptureError> {
    let malformed = |what: &str| CaptureError::InvalidArgument(format!("malformed batch: {what}"));

    if data.remaining() < HEADER_LEN || &data[..MAGIC.len()] != MAGIC {
        return Err(malformed("missing header"));
    }
    data.advance(MAGIC.len());
    let version = data.get_u16();
    if version > FORMAT_VERSION {
        debug!("CODEC | Decoding batch written with newer format version {version}");
    }
    let count = data.get_u32();

    let mut events = Vec::with_capacity(usize::try_from(count).unwrap_or_default().min(4096));
    for _ in 0..count {
        if data.remaining() < RECORD_HEADER_LEN {
            return Err(malformed("truncated record header"));
        }
        let tag = data.get_u16();
        let seq = data.get_u64();
        let timestamp_ms = data.get_i64();
        let len = usize::try_from(data.get_u32()).map_err(|_| malformed("record length"))?;
        if data.remaining() < len {
            return Err(malformed("truncated record body"));
        }
        let (body, rest) = data.split_at(len);
        data = rest;

        let Some(kind) = EventKind::from_tag(tag) else {
            debug!("CODEC | Skipping record {seq} of unknown kind {tag}");
            continue;
        };
        let payload = EventPayload::decode_body(kind, body)
            .map_err(|e| malformed(&format!("record {seq}: {e}")))?;
        events.push(Event::new(seq, timestamp_ms, payload));
    }

    Ok(events)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::event::{CustomEvent, LogEvent, LogLevel, PropertyValue};
    use crate::queue::EventQueue;
    use std::collections::BTreeMap;

    fn sample_batch() -> Batch {
        let queue = EventQueue::new(10, OverflowPolicy::DropOldest, 10);
        let mut properties = BTreeMap::new();
        properties.insert("amount".to_string(), PropertyValue::Doubles(vec![9.99]));
        queue
            .push_all(vec![
                EventPayload::Log(LogEvent {
                    level: LogLevel::Warn,
                    args: vec!["low disk".to_string()],
                }),
                EventPayload::Custom(CustomEvent {
                    name: "purchase".to_string(),
                    properties,
                }),
            ])
            .unwrap();
        queue.drain(10)
    }

    #[test]
    fn test_encoded_header() {
        let encoded = encode_batch(&sample_batch()).unwrap();
        assert_eq!(&encoded[..4], MAGIC);
        assert_eq!(u16::from_be_bytes([encoded[4], encoded[5]]), FORMAT_VERSION);
        assert_eq!(
            u32::from_be_bytes([encoded[6], encoded[7], encoded[8], encoded[9]]),
            2
        );
    }

    #[test]
    fn test_decode_restores_events() {
        let batch = sample_batch();
        let decoded = decode_batch(&encode_batch(&batch).unwrap()).unwrap();
        assert_eq!(decoded, batch.events());
    }

    #[test]
    fn test_decode_skips_unknown_kinds() {
        let batch = sample_batch();
        let encoded = encode_batch(&batch).unwrap();

        // Splice a record of a future kind between the header and the records.
        let mut spliced = BytesMut::new();
        spliced.put_slice(MAGIC);
        spliced.put_u16(FORMAT_VERSION + 1);
        spliced.put_u32(3);
        spliced.put_u16(4242);
        spliced.put_u64(99);
        spliced.put_i64(0);
        spliced.put_u32(7);
        spliced.put_slice(b"{\"x\":1}");
        spliced.put_slice(&encoded[HEADER_LEN..]);

        let decoded = decode_batch(&spliced).unwrap();
        assert_eq!(decoded, batch.events());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_batch(b"").is_err());
        assert!(decode_batch(b"NOPE\0\x01\0\0\0\0").is_err());

        let encoded = encode_batch(&sample_batch()).unwrap();
        assert!(decode_batch(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn test_empty_batch() {
        let encoded = encode_batch(&Batch::default()).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert!(decode_batch(&encoded).unwrap().is_empty());
    }
}
