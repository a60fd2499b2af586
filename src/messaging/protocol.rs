//! Invocations exchanged between a client connection and the broker.
//!
//! Message payloads travel as encoded frames so the same codec runs on
//! every path, in-VM included.

use crate::messaging::message::MessageHeader;
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Idempotent: re-creating an existing session reattaches to it.
    CreateSession {
        session: String,
        user: Option<String>,
        auto_commit_sends: bool,
        auto_commit_acks: bool,
    },
    CloseSession {
        session: String,
    },
    CreateQueue {
        session: String,
        address: String,
        queue: String,
        durable: bool,
        temporary: bool,
    },
    DeleteQueue {
        session: String,
        queue: String,
    },
    /// Idempotent per `(session, consumer_id)`.
    CreateConsumer {
        session: String,
        consumer_id: u64,
        queue: String,
    },
    CloseConsumer {
        session: String,
        consumer_id: u64,
    },
    Send {
        session: String,
        frame: Bytes,
    },
    Receive {
        session: String,
        consumer_id: u64,
        timeout: Duration,
    },
    ReadLargeChunk {
        session: String,
        message_id: u64,
        offset: u64,
        max_len: u32,
    },
    Acknowledge {
        session: String,
        message_id: u64,
    },
    Commit {
        session: String,
    },
    Rollback {
        session: String,
    },
    Ping,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::CreateSession { .. } => "create_session",
            Request::CloseSession { .. } => "close_session",
            Request::CreateQueue { .. } => "create_queue",
            Request::DeleteQueue { .. } => "delete_queue",
            Request::CreateConsumer { .. } => "create_consumer",
            Request::CloseConsumer { .. } => "close_consumer",
            Request::Send { .. } => "send",
            Request::Receive { .. } => "receive",
            Request::ReadLargeChunk { .. } => "read_large_chunk",
            Request::Acknowledge { .. } => "acknowledge",
            Request::Commit { .. } => "commit",
            Request::Rollback { .. } => "rollback",
            Request::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    Delivery(Option<Delivery>),
    /// An encoded `LARGE_CHUNK` frame.
    Chunk(Bytes),
    Pong,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub consumer_id: u64,
    pub header: MessageHeader,
    pub delivery_count: u32,
    pub body: DeliveredBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveredBody {
    Inline {
        payload: Bytes,
        compressed: bool,
    },
    /// Stored on the broker; chunks are pulled with `ReadLargeChunk`.
    Large {
        stored_size: u64,
        declared_size: i64,
        compressed: bool,
    },
}
