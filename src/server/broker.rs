//! In-VM broker.
//!
//! The broker owns the post office (queues and their address bindings), the
//! server sessions and the large-message store. Address settings are resolved
//! per message through the hierarchical repository and drive dead-lettering,
//! expiry, redelivery delay, no-route handling, last-value queues and the
//! address-full policy.

use crate::core::config::Config;
use crate::messaging::frames::{Frame, FrameError};
use crate::messaging::message::{
    now_millis, PropertyValue, ACTUAL_EXPIRY_PROPERTY, ORIGINAL_ADDRESS_PROPERTY,
    ORIGINAL_QUEUE_PROPERTY,
};
use crate::messaging::protocol::{Reply, Request};
use crate::messaging::stream::StreamError;
use crate::server::destinations::{
    Destination, DestinationKind, DestinationRegistry, InMemoryDirectory, RegistryError,
};
use crate::server::large_store::LargeMessageStore;
use crate::server::message::ServerMessage;
use crate::server::queue::{MessageReference, Queue};
use crate::server::security::{CheckType, SecurityError, SecurityManager};
use crate::server::session::ServerSession;
use crate::settings::address_settings::{AddressFullPolicy, AddressSettings};
use crate::settings::repository::HierarchicalRepository;
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue '{0}' already exists")]
    QueueExists(String),
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),
    #[error("queue '{0}' has consumers")]
    QueueInUse(String),
    #[error("session '{0}' does not exist")]
    SessionNotFound(String),
    #[error("consumer {0} does not exist")]
    ConsumerNotFound(u64),
    #[error("message {0} is not delivered to this session")]
    UnknownMessage(u64),
    #[error("no large message upload in progress for message {0}")]
    UnknownUpload(u64),
    #[error("address '{0}' is full")]
    AddressFull(String),
    #[error("transaction rolled back: {0}")]
    TransactionRolledBack(String),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Routing counters.
#[derive(Debug, Default)]
pub struct BrokerStats {
    routed: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
}

impl BrokerStats {
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct PostOffice {
    queues: HashMap<String, Arc<Queue>>,
    bindings: HashMap<String, Vec<Arc<Queue>>>,
}

pub struct Broker {
    settings: Arc<HierarchicalRepository<AddressSettings>>,
    security: Option<Arc<dyn SecurityManager>>,
    store: LargeMessageStore,
    post_office: RwLock<PostOffice>,
    address_sizes: Mutex<HashMap<String, i64>>,
    sessions: Mutex<HashMap<String, Arc<ServerSession>>>,
    destinations: DestinationRegistry,
    next_message_id: AtomicU64,
    stats: BrokerStats,
}

impl Broker {
    pub fn new(
        store: LargeMessageStore,
        settings: Arc<HierarchicalRepository<AddressSettings>>,
    ) -> Self {
        Self {
            settings,
            security: None,
            store,
            post_office: RwLock::new(PostOffice::default()),
            address_sizes: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            destinations: DestinationRegistry::new(Arc::new(InMemoryDirectory::new())),
            next_message_id: AtomicU64::new(1),
            stats: BrokerStats::default(),
        }
    }

    /// A broker with default address settings storing large messages in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let store = LargeMessageStore::open(dir)?;
        Ok(Self::new(
            store,
            Arc::new(HierarchicalRepository::new(AddressSettings::broker_defaults())),
        ))
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let settings = config.build_settings_repository()?;
        let store = LargeMessageStore::open(&config.broker.large_messages_dir).with_context(|| {
            format!(
                "unable to open large message directory {}",
                config.broker.large_messages_dir.display()
            )
        })?;
        let mut broker = Self::new(store, Arc::new(settings));
        if config.broker.security_enabled {
            broker = broker.with_security(Arc::new(config.build_security()?));
        }
        Ok(broker)
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn settings(&self) -> &Arc<HierarchicalRepository<AddressSettings>> {
        &self.settings
    }

    pub fn large_message_store(&self) -> &LargeMessageStore {
        &self.store
    }

    pub fn destinations(&self) -> &DestinationRegistry {
        &self.destinations
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    pub(crate) fn next_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn authorize(
        &self,
        user: Option<&str>,
        address: &str,
        check: CheckType,
    ) -> Result<(), SecurityError> {
        match &self.security {
            Some(security) => security.check(user, address, check),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Post office
    // ---------------------------------------------------------------------

    pub fn create_queue(
        &self,
        address: &str,
        name: &str,
        durable: bool,
        temporary: bool,
    ) -> Result<Arc<Queue>, BrokerError> {
        let last_value = self.settings.get_match(address).is_last_value_queue();
        let mut post_office = self.post_office.write();
        if post_office.queues.contains_key(name) {
            return Err(BrokerError::QueueExists(name.to_string()));
        }
        let queue = Arc::new(
            Queue::new(name, address, durable)
                .with_temporary(temporary)
                .with_last_value(last_value),
        );
        post_office.queues.insert(name.to_string(), queue.clone());
        post_office
            .bindings
            .entry(address.to_string())
            .or_default()
            .push(queue.clone());
        debug!(queue = name, address, durable, temporary, last_value, "queue created");
        Ok(queue)
    }

    /// Remove a queue and drop every message it still holds.
    pub fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let queue = {
            let mut post_office = self.post_office.write();
            let queue = post_office
                .queues
                .get(name)
                .cloned()
                .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
            if queue.consumer_count() > 0 {
                return Err(BrokerError::QueueInUse(name.to_string()));
            }
            post_office.queues.remove(name);
            if let Some(bound) = post_office.bindings.get_mut(queue.address()) {
                bound.retain(|q| q.name() != name);
                if bound.is_empty() {
                    post_office.bindings.remove(queue.address());
                }
            }
            queue
        };
        let drained = queue.drain();
        debug!(queue = name, dropped = drained.len(), "queue deleted");
        for reference in drained {
            self.discard_reference(&reference);
        }
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.post_office.read().queues.get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.post_office.read().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Bytes currently accounted against `address`.
    pub fn address_size(&self, address: &str) -> i64 {
        self.address_sizes.lock().get(address).copied().unwrap_or(0)
    }

    /// Deploy a named destination. A queue destination gets a durable queue
    /// named after its core address.
    pub fn deploy(
        &self,
        destination: Destination,
        binding: Option<&str>,
    ) -> Result<String, BrokerError> {
        let address = destination.address();
        let created = destination.kind == DestinationKind::Queue && self.queue(&address).is_none();
        if created {
            self.create_queue(&address, &address, true, false)?;
        }
        match self.destinations.register(destination, binding) {
            Ok(name) => Ok(name),
            Err(err) => {
                if created {
                    self.delete_queue(&address)?;
                }
                Err(err.into())
            }
        }
    }

    pub fn undeploy(&self, destination: &Destination) -> Result<bool, BrokerError> {
        if !self.destinations.unregister(destination) {
            return Ok(false);
        }
        if destination.kind == DestinationKind::Queue {
            match self.delete_queue(&destination.address()) {
                Ok(()) | Err(BrokerError::QueueNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    fn bindings_for(&self, address: &str) -> Vec<Arc<Queue>> {
        self.post_office
            .read()
            .bindings
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Route a message to every queue bound to its address and return how
    /// many queues took it.
    pub fn route(&self, message: ServerMessage) -> Result<usize, BrokerError> {
        let settings = self.settings.get_match(message.address());
        let queues = self.bindings_for(message.address());
        if queues.is_empty() {
            self.route_unbound(message, &settings)?;
            return Ok(0);
        }

        let size = i64::try_from(message.stored_size()).unwrap_or(i64::MAX);
        let added = size.saturating_mul(queues.len() as i64);
        let max_size = settings.max_size_bytes();
        if max_size >= 0 && self.address_size(message.address()).saturating_add(added) > max_size {
            match settings.address_full_policy() {
                AddressFullPolicy::Drop => {
                    warn!(
                        address = message.address(),
                        message_id = message.id(),
                        max_size,
                        "address full, dropping message"
                    );
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    message.discard();
                    return Ok(0);
                }
                AddressFullPolicy::Fail => {
                    warn!(
                        address = message.address(),
                        message_id = message.id(),
                        max_size,
                        "address full, rejecting message"
                    );
                    message.discard();
                    return Err(BrokerError::AddressFull(message.address().to_string()));
                }
                policy @ (AddressFullPolicy::Page | AddressFullPolicy::Block) => {
                    debug!(
                        address = message.address(),
                        ?policy,
                        "address over max size, accepting message"
                    );
                }
            }
        }

        let message = Arc::new(message);
        message.add_refs(queues.len());
        *self
            .address_sizes
            .lock()
            .entry(message.address().to_string())
            .or_insert(0) += added;
        for queue in &queues {
            if let Some(replaced) = queue.add(MessageReference::new(message.clone())) {
                debug!(
                    queue = queue.name(),
                    message_id = replaced.message.id(),
                    "last value replaced"
                );
                self.discard_reference(&replaced);
            }
        }
        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        Ok(queues.len())
    }

    fn route_unbound(
        &self,
        message: ServerMessage,
        settings: &AddressSettings,
    ) -> Result<(), BrokerError> {
        let already_diverted = message.header.properties.contains_key(ORIGINAL_ADDRESS_PROPERTY);
        match settings.dead_letter_address.as_deref() {
            Some(dla)
                if settings.is_send_to_dla_on_no_route()
                    && !already_diverted
                    && dla != message.address() =>
            {
                let copy = message.copy_to(
                    self.next_message_id(),
                    dla,
                    vec![(ORIGINAL_ADDRESS_PROPERTY, message.address().into())],
                );
                info!(
                    address = message.address(),
                    dla,
                    "no route, sending message to dead letter address"
                );
                let result = self.route(copy);
                message.discard();
                result.map(|_| ())
            }
            _ => {
                warn!(
                    address = message.address(),
                    message_id = message.id(),
                    "no route for message, dropping"
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                message.discard();
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Delivery outcomes
    // ---------------------------------------------------------------------

    /// Finalize an acknowledged delivery.
    pub(crate) fn acknowledge(&self, queue: &Queue, reference: MessageReference) {
        queue.delivery_done();
        self.discard_reference(&reference);
    }

    /// Return a delivery that was not acknowledged. Exhausted messages go to
    /// the dead letter address.
    pub(crate) fn cancel(&self, queue: &Queue, reference: MessageReference) {
        let settings = self.settings.get_match(queue.address());
        if reference.delivery_count >= settings.max_delivery_attempts() {
            queue.delivery_done();
            self.dead_letter(queue, reference, &settings);
            return;
        }
        let delay = settings.redelivery_delay_ms();
        if delay > 0 {
            queue.cancel_scheduled(reference, Duration::from_millis(delay));
        } else {
            queue.cancel(reference);
        }
    }

    /// Handle a message found expired at delivery time.
    pub(crate) fn expire(&self, queue: &Queue, reference: MessageReference) {
        queue.delivery_done();
        self.stats.expired.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings.get_match(queue.address());
        match settings.expiry_address.as_deref() {
            Some(expiry) => {
                let copy = reference.message.copy_to(
                    self.next_message_id(),
                    expiry,
                    vec![
                        (ORIGINAL_ADDRESS_PROPERTY, queue.address().into()),
                        (ORIGINAL_QUEUE_PROPERTY, queue.name().into()),
                        (
                            ACTUAL_EXPIRY_PROPERTY,
                            PropertyValue::Int(i64::try_from(now_millis()).unwrap_or(i64::MAX)),
                        ),
                    ],
                );
                info!(
                    message_id = reference.message.id(),
                    queue = queue.name(),
                    expiry,
                    "message expired, moving to expiry address"
                );
                if let Err(err) = self.route(copy) {
                    warn!(expiry, error = %err, "failed to route expired message");
                }
            }
            None => {
                debug!(
                    message_id = reference.message.id(),
                    queue = queue.name(),
                    "message expired, dropping"
                );
            }
        }
        self.discard_reference(&reference);
    }

    fn dead_letter(&self, queue: &Queue, reference: MessageReference, settings: &AddressSettings) {
        match settings.dead_letter_address.as_deref() {
            Some(dla) => {
                let copy = reference.message.copy_to(
                    self.next_message_id(),
                    dla,
                    vec![
                        (ORIGINAL_ADDRESS_PROPERTY, queue.address().into()),
                        (ORIGINAL_QUEUE_PROPERTY, queue.name().into()),
                    ],
                );
                info!(
                    message_id = reference.message.id(),
                    queue = queue.name(),
                    dla,
                    delivery_count = reference.delivery_count,
                    "moving message to dead letter address"
                );
                // Route the copy first so a shared large file keeps a reference.
                match self.route(copy) {
                    Ok(_) => {
                        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => warn!(dla, error = %err, "failed to route dead letter"),
                }
            }
            None => {
                warn!(
                    message_id = reference.message.id(),
                    queue = queue.name(),
                    delivery_count = reference.delivery_count,
                    "max delivery attempts reached and no dead letter address, dropping message"
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.discard_reference(&reference);
    }

    fn discard_reference(&self, reference: &MessageReference) {
        let size = i64::try_from(reference.message.stored_size()).unwrap_or(i64::MAX);
        if let Some(current) = self.address_sizes.lock().get_mut(reference.message.address()) {
            *current = current.saturating_sub(size).max(0);
        }
        reference.message.release();
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    pub fn session(&self, name: &str) -> Result<Arc<ServerSession>, BrokerError> {
        self.sessions
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::SessionNotFound(name.to_string()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Dispatch one client invocation.
    pub fn handle(&self, request: Request) -> Result<Reply, BrokerError> {
        match request {
            Request::CreateSession {
                session,
                user,
                auto_commit_sends,
                auto_commit_acks,
            } => {
                let mut sessions = self.sessions.lock();
                if !sessions.contains_key(&session) {
                    debug!(session = %session, "session created");
                    let created = ServerSession::new(
                        session.clone(),
                        user,
                        auto_commit_sends,
                        auto_commit_acks,
                    );
                    sessions.insert(session, Arc::new(created));
                }
                Ok(Reply::Done)
            }
            Request::CloseSession { session } => {
                let removed = self.sessions.lock().remove(&session);
                if let Some(session) = removed {
                    session.close(self);
                }
                Ok(Reply::Done)
            }
            Request::CreateQueue {
                session,
                address,
                queue,
                durable,
                temporary,
            } => {
                let session = self.session(&session)?;
                self.authorize(session.user(), &address, CheckType::create_queue(durable))?;
                self.create_queue(&address, &queue, durable, temporary)?;
                if temporary {
                    session.track_temporary_queue(&queue);
                }
                Ok(Reply::Done)
            }
            Request::DeleteQueue { session, queue } => {
                let session = self.session(&session)?;
                let target = self
                    .queue(&queue)
                    .ok_or_else(|| BrokerError::QueueNotFound(queue.clone()))?;
                self.authorize(
                    session.user(),
                    target.address(),
                    CheckType::delete_queue(target.is_durable()),
                )?;
                self.delete_queue(&queue)?;
                Ok(Reply::Done)
            }
            Request::CreateConsumer {
                session,
                consumer_id,
                queue,
            } => {
                self.session(&session)?.create_consumer(self, consumer_id, &queue)?;
                Ok(Reply::Done)
            }
            Request::CloseConsumer { session, consumer_id } => {
                self.session(&session)?.close_consumer(self, consumer_id)?;
                Ok(Reply::Done)
            }
            Request::Send { session, frame } => {
                let frame = Frame::decode(frame)?;
                self.session(&session)?.send(self, frame)?;
                Ok(Reply::Done)
            }
            Request::Receive {
                session,
                consumer_id,
                timeout,
            } => {
                let delivery = self.session(&session)?.receive(self, consumer_id, timeout)?;
                Ok(Reply::Delivery(delivery))
            }
            Request::ReadLargeChunk {
                session,
                message_id,
                offset,
                max_len,
            } => {
                let chunk = self.session(&session)?.read_chunk(message_id, offset, max_len)?;
                Ok(Reply::Chunk(chunk))
            }
            Request::Acknowledge { session, message_id } => {
                self.session(&session)?.acknowledge(self, message_id)?;
                Ok(Reply::Done)
            }
            Request::Commit { session } => {
                self.session(&session)?.commit(self)?;
                Ok(Reply::Done)
            }
            Request::Rollback { session } => {
                self.session(&session)?.rollback(self);
                Ok(Reply::Done)
            }
            Request::Ping => Ok(Reply::Pong),
        }
    }

    /// Close every session, returning unacknowledged deliveries to their
    /// queues.
    pub fn stop(&self) {
        let sessions: Vec<Arc<ServerSession>> = self.sessions.lock().drain().map(|(
            _,
            s,
        )| s).collect();
        for session in sessions {
            session.close(self);
        }
        self.destinations.clear();
        info!("broker stopped");
    }
}
