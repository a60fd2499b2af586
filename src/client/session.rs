//! Client API.
//!
//! A [`ServerLocator`] opens a [`ClientSessionFactory`], which owns one
//! failover-protected [`ClientConnection`]. Sessions, producers and
//! consumers created from the factory share that connection.

use crate::client::locator::{LocatorError, NodeLocator, TopologyMember};
use crate::client::pipeline::{
    Interceptor, Invocation, InvocationError, Pipeline, TracingInterceptor,
};
use crate::client::recovery::{ConnectionRegistry, HaRecovery};
use crate::client::transport::{Connector, RemotingConnection};
use crate::client::valve::FailoverValve;
use crate::core::config::ClientConfig;
use crate::messaging::flow::CreditWindow;
use crate::messaging::framer::{LargeMessageFramer, SendOutcome};
use crate::messaging::frames::{Frame, FrameError, LargeChunk};
use crate::messaging::message::{now_millis, Message, MessageHeader, PropertyValue};
use crate::messaging::protocol::{DeliveredBody, Delivery, Reply, Request};
use crate::messaging::stream::{
    write_inline, BodySink, ChunkFeed, CloseHandle, LargeBodyReceiver, StreamError,
};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Longest single server-side wait of a receive call.
pub const RECEIVE_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
    #[error("session is closed")]
    SessionClosed,
    #[error("consumer is closed")]
    ConsumerClosed,
}

fn expect_done(reply: Reply, kind: &'static str) -> Result<(), ClientError> {
    match reply {
        Reply::Done => Ok(()),
        _ => Err(ClientError::UnexpectedReply(kind)),
    }
}

// ---------------------------------------------------------------------------
// Locator and factory
// ---------------------------------------------------------------------------

pub struct ServerLocator {
    config: ClientConfig,
    node_locator: Arc<NodeLocator>,
    connector: Arc<dyn Connector>,
    pipeline: Pipeline,
}

impl ServerLocator {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            node_locator: Arc::new(NodeLocator::new()),
            connector,
            pipeline: Pipeline::new().with_interceptor(Arc::new(TracingInterceptor)),
        }
    }

    pub fn with_node_locator(mut self, node_locator: Arc<NodeLocator>) -> Self {
        self.node_locator = node_locator;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.pipeline = self.pipeline.with_interceptor(interceptor);
        self
    }

    pub fn with_member(self, member: TopologyMember) -> Self {
        self.node_locator.node_up(member);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn node_locator(&self) -> &Arc<NodeLocator> {
        &self.node_locator
    }

    pub fn create_session_factory(&self) -> Result<ClientSessionFactory, ClientError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let recovery = Arc::new(
            HaRecovery::new(self.node_locator.clone(), self.connector.clone(), registry.clone())
                .with_reconnect_attempts(self.config.reconnect_attempts)
                .with_locate_timeout(Duration::from_millis(self.config.locate_timeout_ms)),
        );
        let remoting = recovery.establish()?;
        debug!(
            connection = remoting.id(),
            endpoint = %remoting.endpoint(),
            "session factory connected"
        );
        let valve = FailoverValve::new(remoting, recovery, self.config.max_io_retry);
        Ok(ClientSessionFactory {
            config: self.config.clone(),
            connection: Arc::new(ClientConnection {
                valve,
                pipeline: self.pipeline.clone(),
                registry,
            }),
            framer: Arc::new(LargeMessageFramer::new(self.config.framer_config())),
        })
    }
}

/// One failover-protected connection.
pub struct ClientConnection {
    valve: Arc<FailoverValve>,
    pipeline: Pipeline,
    registry: Arc<ConnectionRegistry>,
}

impl ClientConnection {
    pub fn invoke(&self, request: Request) -> Result<Reply, InvocationError> {
        let reply = self.valve.invoke(|remoting| {
            self.pipeline.invoke(&Invocation {
                request: &request,
                remoting,
            })
        })?;
        self.registry.record(&request);
        Ok(reply)
    }

    pub fn remoting(&self) -> Arc<RemotingConnection> {
        self.valve.current()
    }

    pub fn valve(&self) -> &Arc<FailoverValve> {
        &self.valve
    }

    pub fn failover_count(&self) -> u64 {
        self.valve.stats().failovers()
    }

    pub fn close(&self) {
        self.valve.close();
    }
}

pub struct ClientSessionFactory {
    config: ClientConfig,
    connection: Arc<ClientConnection>,
    framer: Arc<LargeMessageFramer>,
}

impl ClientSessionFactory {
    pub fn create_session(
        &self,
        auto_commit_sends: bool,
        auto_commit_acks: bool,
    ) -> Result<ClientSession, ClientError> {
        self.create_session_as(None, auto_commit_sends, auto_commit_acks)
    }

    pub fn create_session_as(
        &self,
        user: Option<&str>,
        auto_commit_sends: bool,
        auto_commit_acks: bool,
    ) -> Result<ClientSession, ClientError> {
        let name = Uuid::new_v4().to_string();
        let reply = self.connection.invoke(Request::CreateSession {
            session: name.clone(),
            user: user.map(str::to_string),
            auto_commit_sends,
            auto_commit_acks,
        })?;
        expect_done(reply, "create_session")?;
        Ok(ClientSession {
            shared: Arc::new(SessionShared {
                name,
                connection: self.connection.clone(),
                framer: self.framer.clone(),
                config: self.config.clone(),
                next_consumer_id: AtomicU64::new(1),
                next_message_id: AtomicU64::new(1),
                started: Mutex::new(false),
                start_changed: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionShared {
    name: String,
    connection: Arc<ClientConnection>,
    framer: Arc<LargeMessageFramer>,
    config: ClientConfig,
    next_consumer_id: AtomicU64,
    next_message_id: AtomicU64,
    started: Mutex<bool>,
    start_changed: Condvar,
    closed: AtomicBool,
}

impl SessionShared {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::SessionClosed);
        }
        Ok(())
    }

    fn call(&self, request: Request, kind: &'static str) -> Result<(), ClientError> {
        self.ensure_open()?;
        expect_done(self.connection.invoke(request)?, kind)
    }

    /// Wait until the session is started or `deadline` passes.
    fn wait_started(&self, deadline: Instant) -> bool {
        let mut started = self.started.lock();
        while !*started {
            if self.start_changed.wait_until(&mut started, deadline).timed_out() {
                return *started;
            }
        }
        true
    }
}

pub struct ClientSession {
    shared: Arc<SessionShared>,
}

impl ClientSession {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn create_queue(
        &self,
        address: &str,
        queue: &str,
        durable: bool,
    ) -> Result<(), ClientError> {
        self.shared.call(
            Request::CreateQueue {
                session: self.shared.name.clone(),
                address: address.to_string(),
                queue: queue.to_string(),
                durable,
                temporary: false,
            },
            "create_queue",
        )
    }

    /// A non-durable queue deleted when this session closes.
    pub fn create_temporary_queue(&self, address: &str, queue: &str) -> Result<(), ClientError> {
        self.shared.call(
            Request::CreateQueue {
                session: self.shared.name.clone(),
                address: address.to_string(),
                queue: queue.to_string(),
                durable: false,
                temporary: true,
            },
            "create_queue",
        )
    }

    pub fn delete_queue(&self, queue: &str) -> Result<(), ClientError> {
        self.shared.call(
            Request::DeleteQueue {
                session: self.shared.name.clone(),
                queue: queue.to_string(),
            },
            "delete_queue",
        )
    }

    pub fn create_producer(&self, address: &str) -> Result<ClientProducer, ClientError> {
        self.shared.ensure_open()?;
        Ok(ClientProducer {
            session: self.shared.clone(),
            address: address.to_string(),
            window: CreditWindow::new(self.shared.config.producer_window_size),
            cancel: CloseHandle::default(),
        })
    }

    pub fn create_consumer(&self, queue: &str) -> Result<ClientConsumer, ClientError> {
        let consumer_id = self.shared.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        self.shared.call(
            Request::CreateConsumer {
                session: self.shared.name.clone(),
                consumer_id,
                queue: queue.to_string(),
            },
            "create_consumer",
        )?;
        Ok(ClientConsumer {
            session: self.shared.clone(),
            consumer_id,
            queue: queue.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    /// Let consumers receive.
    pub fn start(&self) {
        *self.shared.started.lock() = true;
        self.shared.start_changed.notify_all();
    }

    pub fn stop(&self) {
        *self.shared.started.lock() = false;
    }

    pub fn is_started(&self) -> bool {
        *self.shared.started.lock()
    }

    pub fn commit(&self) -> Result<(), ClientError> {
        self.shared.call(
            Request::Commit {
                session: self.shared.name.clone(),
            },
            "commit",
        )
    }

    pub fn rollback(&self) -> Result<(), ClientError> {
        self.shared.call(
            Request::Rollback {
                session: self.shared.name.clone(),
            },
            "rollback",
        )
    }

    /// Close the session; uncommitted work is rolled back on the server.
    pub fn close(&self) -> Result<(), ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.shared.call(
            Request::CloseSession {
                session: self.shared.name.clone(),
            },
            "close_session",
        );
        self.shared.closed.store(true, Ordering::SeqCst);
        self.start();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

pub struct ClientProducer {
    session: Arc<SessionShared>,
    address: String,
    window: CreditWindow,
    cancel: CloseHandle,
}

impl ClientProducer {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn window(&self) -> &CreditWindow {
        &self.window
    }

    /// Send one message, streaming its body when it is large.
    pub fn send(&self, message: Message) -> Result<SendOutcome, ClientError> {
        self.session.ensure_open()?;
        let (mut header, source) = message.into_parts();
        header.id = self.session.next_message_id.fetch_add(1, Ordering::SeqCst);
        if header.address.is_empty() {
            header.address.clone_from(&self.address);
        }
        if header.timestamp == 0 {
            header.timestamp = now_millis();
        }
        let session = &self.session;
        let window = &self.window;
        session
            .framer
            .send(header, source, window, &self.cancel, |frame: Frame| -> Result<(), ClientError> {
                let credits = match &frame {
                    Frame::LargeChunk(chunk) => chunk.payload.len(),
                    Frame::Inline(_) | Frame::LargeInit(_) => 0,
                };
                let reply = session.connection.invoke(Request::Send {
                    session: session.name.clone(),
                    frame: frame.encode(),
                })?;
                expect_done(reply, "send")?;
                if credits > 0 {
                    window.replenish(credits);
                }
                Ok(())
            })
    }

    /// Abort a send in progress and refuse further credits.
    pub fn close(&self) {
        self.cancel.close();
        self.window.close();
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

pub struct ClientConsumer {
    session: Arc<SessionShared>,
    consumer_id: u64,
    queue: String,
    closed: AtomicBool,
}

impl ClientConsumer {
    pub fn id(&self) -> u64 {
        self.consumer_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait up to `timeout` for a message. The server is polled in short
    /// slices so a failover never queues behind a long wait.
    pub fn receive(&self, timeout: Duration) -> Result<Option<ClientMessage>, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ClientError::ConsumerClosed);
            }
            self.session.ensure_open()?;
            if !self.session.wait_started(deadline) {
                return Ok(None);
            }
            let slice = deadline.saturating_duration_since(Instant::now()).min(RECEIVE_SLICE);
            let reply = self.session.connection.invoke(Request::Receive {
                session: self.session.name.clone(),
                consumer_id: self.consumer_id,
                timeout: slice,
            })?;
            match reply {
                Reply::Delivery(Some(delivery)) => {
                    return Ok(Some(ClientMessage::from_delivery(self.session.clone(), delivery)));
                }
                Reply::Delivery(None) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                _ => return Err(ClientError::UnexpectedReply("receive")),
            }
        }
    }

    pub fn receive_immediate(&self) -> Result<Option<ClientMessage>, ClientError> {
        self.receive(Duration::ZERO)
    }

    pub fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.call(
            Request::CloseConsumer {
                session: self.session.name.clone(),
                consumer_id: self.consumer_id,
            },
            "close_consumer",
        )
    }
}

// ---------------------------------------------------------------------------
// Received messages
// ---------------------------------------------------------------------------

/// Pulls `LARGE_CHUNK` frames for one delivered message from the server.
struct RemoteChunkFeed {
    connection: Arc<ClientConnection>,
    session: String,
    message_id: u64,
    offset: u64,
    chunk_size: u32,
}

impl ChunkFeed for RemoteChunkFeed {
    fn next_chunk(&mut self) -> Result<LargeChunk, StreamError> {
        let reply = self
            .connection
            .invoke(Request::ReadLargeChunk {
                session: self.session.clone(),
                message_id: self.message_id,
                offset: self.offset,
                max_len: self.chunk_size,
            })
            .map_err(|err| StreamError::Feed(err.to_string()))?;
        let Reply::Chunk(encoded) = reply else {
            return Err(StreamError::Feed("unexpected reply to read_large_chunk".into()));
        };
        let chunk = Frame::decode(encoded)
            .and_then(Frame::into_large_chunk)
            .map_err(|err| StreamError::Feed(err.to_string()))?;
        self.offset += chunk.payload.len() as u64;
        Ok(chunk)
    }
}

enum ClientBody {
    Inline { payload: Bytes, compressed: bool },
    Large { receiver: LargeBodyReceiver, declared_size: i64 },
}

pub struct ClientMessage {
    header: MessageHeader,
    delivery_count: u32,
    body: ClientBody,
    session: Arc<SessionShared>,
}

impl ClientMessage {
    fn from_delivery(session: Arc<SessionShared>, delivery: Delivery) -> Self {
        let body = match delivery.body {
            DeliveredBody::Inline {
                payload,
                compressed,
            } => ClientBody::Inline {
                payload,
                compressed,
            },
            DeliveredBody::Large {
                declared_size,
                compressed,
                ..
            } => {
                let chunk_size =
                    u32::try_from(session.config.large_message_chunk_size).unwrap_or(u32::MAX);
                let feed = RemoteChunkFeed {
                    connection: session.connection.clone(),
                    session: session.name.clone(),
                    message_id: delivery.header.id,
                    offset: 0,
                    chunk_size,
                };
                let mut receiver = LargeBodyReceiver::new(Box::new(feed), compressed);
                if let Some(dir) = &session.config.large_messages_dir {
                    receiver = receiver.with_spool_dir(dir);
                }
                ClientBody::Large {
                    receiver,
                    declared_size,
                }
            }
        };
        Self {
            header: delivery.header,
            delivery_count: delivery.delivery_count,
            body,
            session,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn address(&self) -> &str {
        &self.header.address
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.header.properties.get(key)
    }

    pub fn is_large(&self) -> bool {
        matches!(self.body, ClientBody::Large { .. })
    }

    /// Decoded body size when known without reading the body.
    pub fn body_size(&self) -> Option<u64> {
        match &self.body {
            ClientBody::Inline {
                payload,
                compressed: false,
            } => Some(payload.len() as u64),
            ClientBody::Inline { compressed: true, .. } => None,
            ClientBody::Large {
                receiver,
                declared_size,
            } => u64::try_from(*declared_size)
                .ok()
                .or_else(|| receiver.completed_bytes()),
        }
    }

    /// The whole body in memory.
    pub fn body_bytes(&self) -> Result<Bytes, ClientError> {
        match &self.body {
            ClientBody::Inline { payload, compressed } => {
                if !compressed {
                    return Ok(payload.clone());
                }
                let sink = write_inline(payload, true, BodySink::memory())?;
                Ok(Bytes::from(sink.into_bytes().unwrap_or_default()))
            }
            ClientBody::Large { receiver, .. } => {
                let mut buf = Vec::new();
                receiver.open_reader()?.read_to_end(&mut buf).map_err(StreamError::from_io)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// A reader over the body. Large bodies are spooled to a temporary file
    /// first.
    pub fn body_reader(&self) -> Result<Box<dyn Read + Send>, ClientError> {
        match &self.body {
            ClientBody::Inline { .. } => Ok(Box::new(Cursor::new(self.body_bytes()?))),
            ClientBody::Large { receiver, .. } => Ok(Box::new(receiver.open_reader()?)),
        }
    }

    /// Stream the body into `writer`. Inline bodies are written before this
    /// returns; large bodies are written by a background pump.
    pub fn set_output_stream(&self, writer: Box<dyn Write + Send>) -> Result<(), ClientError> {
        match &self.body {
            ClientBody::Inline { payload, compressed } => {
                write_inline(payload, *compressed, BodySink::caller(writer))?;
                Ok(())
            }
            ClientBody::Large { receiver, .. } => Ok(receiver.set_output_stream(writer)?),
        }
    }

    /// Wait for `set_output_stream` to finish. A zero timeout waits forever.
    pub fn wait_output_stream_completion(&self, timeout: Duration) -> Result<(), ClientError> {
        match &self.body {
            ClientBody::Inline { .. } => Ok(()),
            ClientBody::Large { receiver, .. } => {
                Ok(receiver.wait_output_stream_completion(timeout)?)
            }
        }
    }

    pub fn save_to_output_stream(&self, writer: Box<dyn Write + Send>) -> Result<(), ClientError> {
        match &self.body {
            ClientBody::Inline { .. } => self.set_output_stream(writer),
            ClientBody::Large { receiver, .. } => Ok(receiver.save_to_output_stream(writer)?),
        }
    }

    /// Acknowledge this message. With transactional acks the ack takes effect
    /// at commit; until then the body can still be read.
    pub fn acknowledge(&self) -> Result<(), ClientError> {
        self.session.call(
            Request::Acknowledge {
                session: self.session.name.clone(),
                message_id: self.header.id,
            },
            "acknowledge",
        )
    }
}
