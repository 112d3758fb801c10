//! Codec trait - turns one event into wire bytes
//!
//! Outputs are generic over the codec so the same windowed client can carry
//! JSON today and something denser tomorrow. Encoding happens per event: a
//! failure drops that one event, never the batch.

use crate::error::CodecError;
use crate::event::{Event, Fields};
use bytes::Bytes;
use chrono::SecondsFormat;
use serde::Serialize;

/// Per-event serializer
pub trait Codec: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Serialize a single event
    fn encode(&self, event: &Event) -> Result<Bytes, CodecError>;
}

/// JSON object per event, with the timestamp under `@timestamp`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// New JSON codec
    pub fn new() -> Self {
        Self
    }
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    #[serde(flatten)]
    fields: &'a Fields,
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, event: &Event) -> Result<Bytes, CodecError> {
        let doc = JsonEvent {
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            fields: &event.fields,
        };
        Ok(Bytes::from(serde_json::to_vec(&doc)?))
    }
}
