//! Messages as the broker stores them.
//!
//! The header is kept in memory; the body is either inline bytes or a shared
//! handle to a file in the large-message store.

use crate::messaging::message::{MessageHeader, PropertyValue};
use crate::server::large_store::LargeMessageFile;
use bytes::Bytes;
use std::sync::Arc;

/// Stored body of a routed message.
#[derive(Debug, Clone)]
pub enum Body {
    Inline { payload: Bytes, compressed: bool },
    Large(Arc<LargeMessageFile>),
}

#[derive(Debug, Clone)]
pub struct ServerMessage {
    pub header: MessageHeader,
    pub body: Body,
}

impl ServerMessage {
    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn address(&self) -> &str {
        &self.header.address
    }

    pub fn is_large(&self) -> bool {
        matches!(self.body, Body::Large(_))
    }

    /// Bytes the message occupies in memory or on disk, used for address
    /// size accounting.
    pub fn stored_size(&self) -> u64 {
        match &self.body {
            Body::Inline { payload, .. } => payload.len() as u64,
            Body::Large(file) => file.stored_size(),
        }
    }

    /// A new message with the same body addressed to `address`. The body is
    /// shared, so a large file is not copied.
    pub fn copy_to(&self, id: u64, address: &str, extra: Vec<(&str, PropertyValue)>) -> Self {
        let mut header = self.header.clone();
        header.id = id;
        header.address = address.to_string();
        header.expiration = 0;
        for (key, value) in extra {
            header.properties.insert(key.to_string(), value);
        }
        Self {
            header,
            body: self.body.clone(),
        }
    }

    pub(crate) fn add_refs(&self, count: usize) {
        if let Body::Large(file) = &self.body {
            file.add_refs(count);
        }
    }

    /// Release one queue reference; the large file goes with the last one.
    pub(crate) fn release(&self) {
        if let Body::Large(file) = &self.body {
            file.release();
        }
    }

    /// Discard a message that was never routed anywhere.
    pub(crate) fn discard(&self) {
        if let Body::Large(file) = &self.body {
            if file.ref_count() == 0 {
                file.delete();
            }
        }
    }
}
