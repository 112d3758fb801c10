//! Event - the opaque record shipped by outputs
//!
//! The delivery machinery never looks inside an event. It only carries the
//! fields to a [`Codec`](crate::Codec) and keeps the timestamp around for
//! ordering diagnostics in logs.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Structured fields of an event
pub type Fields = Map<String, Value>;

/// A single structured record
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub fields: Fields,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(fields: Fields) -> Self {
        Self {
            timestamp: Utc::now(),
            fields,
        }
    }

    /// Create an event with an explicit timestamp
    pub fn with_timestamp(timestamp: DateTime<Utc>, fields: Fields) -> Self {
        Self { timestamp, fields }
    }

    /// Builder-style field insertion
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a field by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(Fields::new())
    }
}

impl From<Fields> for Event {
    fn from(fields: Fields) -> Self {
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_inserts_fields() {
        let event = Event::default()
            .field("message", "hello")
            .field("count", 3);

        assert_eq!(event.get("message"), Some(&Value::from("hello")));
        assert_eq!(event.get("count"), Some(&Value::from(3)));
        assert!(event.get("missing").is_none());
    }

    #[test]
    fn explicit_timestamp_is_kept() {
        let ts = DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default();
        let event = Event::with_timestamp(ts, Fields::new());
        assert_eq!(event.timestamp, ts);
    }
}
