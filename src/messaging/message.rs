//! Outgoing message model shared by the producer and the wire codec.

use crate::messaging::stream::{BodySource, BytesSource};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Address the message was sent to before a dead-letter or expiry move.
pub const ORIGINAL_ADDRESS_PROPERTY: &str = "_HQ_ORIG_ADDRESS";
/// Queue the message was taken from before a dead-letter or expiry move.
pub const ORIGINAL_QUEUE_PROPERTY: &str = "_HQ_ORIG_QUEUE";
/// Time the message was expired, in epoch milliseconds.
pub const ACTUAL_EXPIRY_PROPERTY: &str = "_HQ_ACTUAL_EXPIRY";
/// Key used by last-value queues to replace older messages.
pub const LAST_VALUE_PROPERTY: &str = "_HQ_LVQ_NAME";

/// Scalar property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Fields common to every message regardless of body shape.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageHeader {
    pub id: u64,
    pub address: String,
    pub durable: bool,
    /// Epoch milliseconds; 0 never expires.
    pub expiration: u64,
    pub timestamp: u64,
    pub properties: Properties,
}

impl MessageHeader {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expiration != 0 && self.expiration <= now_ms
    }

    pub fn string_property(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Body of a message about to be sent.
pub enum OutgoingBody {
    Bytes(Bytes),
    /// Pulled chunk by chunk; never buffered whole unless it turns out to fit
    /// under the large-message threshold.
    Stream(Box<dyn BodySource>),
}

impl fmt::Debug for OutgoingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutgoingBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            OutgoingBody::Stream(s) => f
                .debug_struct("Stream")
                .field("declared_size", &s.declared_size())
                .finish(),
        }
    }
}

/// A message built by a client before it is handed to a producer.
#[derive(Debug)]
pub struct Message {
    pub header: MessageHeader,
    pub body: OutgoingBody,
}

impl Message {
    pub fn new(durable: bool) -> Self {
        Self {
            header: MessageHeader {
                durable,
                timestamp: now_millis(),
                ..Default::default()
            },
            body: OutgoingBody::Bytes(Bytes::new()),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = OutgoingBody::Bytes(body.into());
        self
    }

    /// Attach a streamed body; see `set_body_source`.
    pub fn with_body_source(mut self, source: impl BodySource + 'static) -> Self {
        self.set_body_source(source);
        self
    }

    pub fn set_body_source(&mut self, source: impl BodySource + 'static) {
        self.body = OutgoingBody::Stream(Box::new(source));
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.header.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_expiration(mut self, epoch_ms: u64) -> Self {
        self.header.expiration = epoch_ms;
        self
    }

    pub fn declared_body_size(&self) -> Option<u64> {
        match &self.body {
            OutgoingBody::Bytes(b) => Some(b.len() as u64),
            OutgoingBody::Stream(s) => s.declared_size(),
        }
    }

    /// Turn the body into a pull source for the framer.
    pub fn into_parts(self) -> (MessageHeader, Box<dyn BodySource>) {
        let source: Box<dyn BodySource> = match self.body {
            OutgoingBody::Bytes(b) => Box::new(BytesSource::new(b)),
            OutgoingBody::Stream(s) => s,
        };
        (self.header, source)
    }
}
