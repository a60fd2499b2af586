//! Broker-side session state.
//!
//! A session owns its consumers, the deliveries it has not acknowledged yet,
//! its transaction (staged sends and acks) and the large messages it is
//! receiving. Session methods take the broker explicitly; the broker never
//! calls back into a session while holding its own locks.

use crate::messaging::frames::{Frame, LargeChunk};
use crate::messaging::message::{now_millis, MessageHeader};
use crate::messaging::protocol::{DeliveredBody, Delivery};
use crate::server::broker::{Broker, BrokerError};
use crate::server::large_store::LargeMessageWriter;
use crate::server::message::{Body, ServerMessage};
use crate::server::queue::{MessageReference, Queue};
use crate::server::security::CheckType;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct Delivered {
    consumer_id: u64,
    queue: Arc<Queue>,
    reference: MessageReference,
}

struct Upload {
    header: MessageHeader,
    writer: LargeMessageWriter,
}

#[derive(Default)]
struct Transaction {
    sends: Vec<ServerMessage>,
    acks: Vec<Delivered>,
}

#[derive(Default)]
struct SessionState {
    delivered: Vec<Delivered>,
    tx: Transaction,
    /// Keyed by the producer's message id.
    uploads: HashMap<u64, Upload>,
    temporary_queues: Vec<String>,
}

pub struct ServerSession {
    name: String,
    user: Option<String>,
    auto_commit_sends: bool,
    auto_commit_acks: bool,
    consumers: Mutex<HashMap<u64, Arc<Queue>>>,
    state: Mutex<SessionState>,
}

impl ServerSession {
    pub fn new(
        name: impl Into<String>,
        user: Option<String>,
        auto_commit_sends: bool,
        auto_commit_acks: bool,
    ) -> Self {
        Self {
            name: name.into(),
            user,
            auto_commit_sends,
            auto_commit_acks,
            consumers: Mutex::new(HashMap::new()),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.state.lock().delivered.len()
    }

    pub(crate) fn track_temporary_queue(&self, queue: &str) {
        self.state.lock().temporary_queues.push(queue.to_string());
    }

    pub fn create_consumer(
        &self,
        broker: &Broker,
        consumer_id: u64,
        queue: &str,
    ) -> Result<(), BrokerError> {
        let mut consumers = self.consumers.lock();
        if consumers.contains_key(&consumer_id) {
            return Ok(());
        }
        let queue = broker
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        broker.authorize(self.user(), queue.address(), CheckType::Consume)?;
        queue.add_consumer();
        consumers.insert(consumer_id, queue);
        debug!(session = %self.name, consumer_id, "consumer created");
        Ok(())
    }

    /// Close a consumer and return its unacknowledged deliveries.
    pub fn close_consumer(&self, broker: &Broker, consumer_id: u64) -> Result<(), BrokerError> {
        let queue = self
            .consumers
            .lock()
            .remove(&consumer_id)
            .ok_or(BrokerError::ConsumerNotFound(consumer_id))?;
        queue.remove_consumer();
        let cancelled: Vec<Delivered> = {
            let mut state = self.state.lock();
            let (theirs, ours) = std::mem::take(&mut state.delivered)
                .into_iter()
                .partition(|d| d.consumer_id == consumer_id);
            state.delivered = ours;
            theirs
        };
        for delivered in cancelled.into_iter().rev() {
            broker.cancel(&delivered.queue, delivered.reference);
        }
        Ok(())
    }

    pub fn send(&self, broker: &Broker, frame: Frame) -> Result<(), BrokerError> {
        match frame {
            Frame::Inline(inline) => {
                broker.authorize(self.user(), &inline.header.address, CheckType::Send)?;
                let mut header = inline.header;
                header.id = broker.next_message_id();
                self.stage_or_route(
                    broker,
                    ServerMessage {
                        header,
                        body: Body::Inline {
                            payload: inline.payload,
                            compressed: inline.compressed,
                        },
                    },
                )
            }
            Frame::LargeInit(init) => {
                broker.authorize(self.user(), &init.header.address, CheckType::Send)?;
                let producer_id = init.header.id;
                let mut header = init.header;
                header.id = broker.next_message_id();
                let writer = broker
                    .large_message_store()
                    .create(header.id, init.declared_size, init.compressed)?;
                self.state
                    .lock()
                    .uploads
                    .insert(producer_id, Upload { header, writer });
                Ok(())
            }
            Frame::LargeChunk(chunk) => self.append_chunk(broker, chunk),
        }
    }

    fn append_chunk(&self, broker: &Broker, chunk: LargeChunk) -> Result<(), BrokerError> {
        let finished = {
            let mut state = self.state.lock();
            let upload = state
                .uploads
                .get_mut(&chunk.message_id)
                .ok_or(BrokerError::UnknownUpload(chunk.message_id))?;
            if let Err(err) = upload.writer.append(chunk.seq, &chunk.payload) {
                // Dropping the writer removes the partial file.
                state.uploads.remove(&chunk.message_id);
                return Err(err.into());
            }
            if chunk.is_last {
                state.uploads.remove(&chunk.message_id)
            } else {
                None
            }
        };
        let Some(upload) = finished else {
            return Ok(());
        };
        let file = upload.writer.finish()?;
        debug!(
            message_id = upload.header.id,
            stored = file.stored_size(),
            "large message received"
        );
        self.stage_or_route(
            broker,
            ServerMessage {
                header: upload.header,
                body: Body::Large(file),
            },
        )
    }

    fn stage_or_route(&self, broker: &Broker, message: ServerMessage) -> Result<(), BrokerError> {
        if self.auto_commit_sends {
            broker.route(message).map(|_| ())
        } else {
            self.state.lock().tx.sends.push(message);
            Ok(())
        }
    }

    /// Deliver the next message for `consumer_id`, waiting up to `timeout`.
    pub fn receive(
        &self,
        broker: &Broker,
        consumer_id: u64,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let queue = self
            .consumers
            .lock()
            .get(&consumer_id)
            .cloned()
            .ok_or(BrokerError::ConsumerNotFound(consumer_id))?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(mut reference) = queue.poll(remaining) else {
                return Ok(None);
            };
            if reference.message.header.is_expired_at(now_millis()) {
                broker.expire(&queue, reference);
                continue;
            }
            reference.delivery_count += 1;
            let delivery = Delivery {
                consumer_id,
                header: reference.message.header.clone(),
                delivery_count: reference.delivery_count,
                body: match &reference.message.body {
                    Body::Inline {
                        payload,
                        compressed,
                    } => DeliveredBody::Inline {
                        payload: payload.clone(),
                        compressed: *compressed,
                    },
                    Body::Large(file) => DeliveredBody::Large {
                        stored_size: file.stored_size(),
                        declared_size: file.declared_size(),
                        compressed: file.is_compressed(),
                    },
                },
            };
            self.state.lock().delivered.push(Delivered {
                consumer_id,
                queue,
                reference,
            });
            return Ok(Some(delivery));
        }
    }

    /// Serve one chunk of a delivered large message as an encoded frame.
    pub fn read_chunk(
        &self,
        message_id: u64,
        offset: u64,
        max_len: u32,
    ) -> Result<Bytes, BrokerError> {
        let message = {
            let state = self.state.lock();
            state
                .delivered
                .iter()
                .chain(state.tx.acks.iter())
                .find(|d| d.reference.message.id() == message_id)
                .map(|d| d.reference.message.clone())
                .ok_or(BrokerError::UnknownMessage(message_id))?
        };
        let Body::Large(file) = &message.body else {
            return Err(BrokerError::UnknownMessage(message_id));
        };
        let max_len = max_len.max(1);
        let (payload, is_last) = file.read_at(offset, max_len as usize)?;
        Ok(Frame::LargeChunk(LargeChunk {
            message_id,
            seq: (offset / u64::from(max_len)) as u32,
            payload,
            is_last,
        })
        .encode())
    }

    pub fn acknowledge(&self, broker: &Broker, message_id: u64) -> Result<(), BrokerError> {
        let delivered = {
            let mut state = self.state.lock();
            let pos = state
                .delivered
                .iter()
                .position(|d| d.reference.message.id() == message_id)
                .ok_or(BrokerError::UnknownMessage(message_id))?;
            let delivered = state.delivered.remove(pos);
            if !self.auto_commit_acks {
                state.tx.acks.push(delivered);
                return Ok(());
            }
            delivered
        };
        broker.acknowledge(&delivered.queue, delivered.reference);
        Ok(())
    }

    /// Route staged sends, then finalize staged acks.
    ///
    /// If a staged send is refused, the remaining sends are discarded, the
    /// staged acks are cancelled and `TransactionRolledBack` is returned.
    pub fn commit(&self, broker: &Broker) -> Result<(), BrokerError> {
        let tx = std::mem::take(&mut self.state.lock().tx);
        let mut sends = tx.sends.into_iter();
        while let Some(message) = sends.next() {
            if let Err(err) = broker.route(message) {
                warn!(session = %self.name, error = %err, "commit failed, rolling back");
                for rest in sends {
                    rest.discard();
                }
                for delivered in tx.acks.into_iter().rev() {
                    broker.cancel(&delivered.queue, delivered.reference);
                }
                return Err(BrokerError::TransactionRolledBack(err.to_string()));
            }
        }
        for delivered in tx.acks {
            broker.acknowledge(&delivered.queue, delivered.reference);
        }
        Ok(())
    }

    /// Discard staged sends and return every unacknowledged or staged-ack
    /// delivery to its queue.
    pub fn rollback(&self, broker: &Broker) {
        let (tx, delivered) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.tx),
                std::mem::take(&mut state.delivered),
            )
        };
        for message in tx.sends {
            message.discard();
        }
        let mut cancelled = tx.acks;
        cancelled.extend(delivered);
        cancelled.sort_by_key(|d| d.reference.message.id());
        for delivered in cancelled.into_iter().rev() {
            broker.cancel(&delivered.queue, delivered.reference);
        }
    }

    pub fn close(&self, broker: &Broker) {
        self.rollback(broker);
        let consumers: Vec<Arc<Queue>> = self.consumers.lock().drain().map(|(_, q)| q).collect();
        for queue in consumers {
            queue.remove_consumer();
        }
        let (uploads, temporary) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.uploads),
                std::mem::take(&mut state.temporary_queues),
            )
        };
        if !uploads.is_empty() {
            debug!(
                session = %self.name,
                count = uploads.len(),
                "dropping unfinished large messages"
            );
        }
        drop(uploads);
        for queue in temporary {
            if let Err(err) = broker.delete_queue(&queue) {
                debug!(queue, error = %err, "temporary queue not deleted");
            }
        }
        debug!(session = %self.name, "session closed");
    }
}
