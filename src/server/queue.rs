//! Server-side queues.
//!
//! A queue holds references to routed messages. References carry their own
//! delivery count so the broker can decide on redelivery or dead-lettering
//! when a delivery is cancelled.

use crate::messaging::message::LAST_VALUE_PROPERTY;
use crate::server::message::ServerMessage;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct MessageReference {
    pub message: Arc<ServerMessage>,
    pub delivery_count: u32,
}

impl MessageReference {
    pub fn new(message: Arc<ServerMessage>) -> Self {
        Self {
            message,
            delivery_count: 0,
        }
    }

    fn last_value(&self) -> Option<&str> {
        self.message.header.string_property(LAST_VALUE_PROPERTY)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<MessageReference>,
    scheduled: Vec<(Instant, MessageReference)>,
    delivering: usize,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        if self.scheduled.is_empty() {
            return;
        }
        self.scheduled.sort_by_key(|(at, _)| *at);
        while self.scheduled.first().is_some_and(|(at, _)| *at <= now) {
            let (_, reference) = self.scheduled.remove(0);
            self.ready.push_back(reference);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.scheduled.iter().map(|(at, _)| *at).min()
    }
}

#[derive(Debug)]
pub struct Queue {
    name: String,
    address: String,
    durable: bool,
    temporary: bool,
    last_value: bool,
    state: Mutex<QueueState>,
    available: Condvar,
    consumers: AtomicUsize,
}

impl Queue {
    pub fn new(name: impl Into<String>, address: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            durable,
            temporary: false,
            last_value: false,
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            consumers: AtomicUsize::new(0),
        }
    }

    pub fn with_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn with_last_value(mut self, last_value: bool) -> Self {
        self.last_value = last_value;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_last_value(&self) -> bool {
        self.last_value
    }

    /// Append a reference. On a last-value queue the displaced reference with
    /// the same key is returned so the caller can release it.
    pub fn add(&self, reference: MessageReference) -> Option<MessageReference> {
        let mut state = self.state.lock();
        let mut replaced = None;
        if self.last_value {
            if let Some(key) = reference.last_value() {
                if let Some(pos) = state.ready.iter().position(|r| r.last_value() == Some(key)) {
                    replaced = state.ready.remove(pos);
                }
            }
        }
        state.ready.push_back(reference);
        self.available.notify_one();
        replaced
    }

    /// Return a cancelled delivery to the head of the queue.
    pub fn cancel(&self, reference: MessageReference) {
        let mut state = self.state.lock();
        state.delivering = state.delivering.saturating_sub(1);
        state.ready.push_front(reference);
        self.available.notify_one();
    }

    /// Return a cancelled delivery to be redelivered after `delay`.
    pub fn cancel_scheduled(&self, reference: MessageReference, delay: Duration) {
        let mut state = self.state.lock();
        state.delivering = state.delivering.saturating_sub(1);
        state.scheduled.push((Instant::now() + delay, reference));
        self.available.notify_all();
    }

    /// A delivery finished without going back on the queue (acked, expired or
    /// moved).
    pub fn delivery_done(&self) {
        let mut state = self.state.lock();
        state.delivering = state.delivering.saturating_sub(1);
    }

    /// Take the next ready reference, waiting up to `timeout`.
    pub fn poll(&self, timeout: Duration) -> Option<MessageReference> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            state.promote_due(now);
            if let Some(reference) = state.ready.pop_front() {
                state.delivering += 1;
                return Some(reference);
            }
            if now >= deadline {
                return None;
            }
            let wake = state.next_due().map_or(deadline, |due| due.min(deadline));
            self.available.wait_until(&mut state, wake);
        }
    }

    /// Remove every queued reference.
    pub fn drain(&self) -> Vec<MessageReference> {
        let mut state = self.state.lock();
        let mut drained: Vec<MessageReference> = state.ready.drain(..).collect();
        drained.extend(state.scheduled.drain(..).map(|(_, r)| r));
        drained
    }

    /// Ready plus scheduled references.
    pub fn message_count(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.scheduled.len()
    }

    pub fn scheduled_count(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    pub fn delivering_count(&self) -> usize {
        self.state.lock().delivering
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.load(Ordering::SeqCst)
    }

    pub(crate) fn add_consumer(&self) {
        self.consumers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_consumer(&self) {
        let _ = self
            .consumers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::{MessageHeader, PropertyValue};
    use crate::server::message::Body;
    use bytes::Bytes;
    use std::thread;

    fn reference(id: u64, lvq: Option<&str>) -> MessageReference {
        let mut header = MessageHeader {
            id,
            address: "a".into(),
            ..Default::default()
        };
        if let Some(key) = lvq {
            header
                .properties
                .insert(LAST_VALUE_PROPERTY.into(), PropertyValue::String(key.into()));
        }
        MessageReference::new(Arc::new(ServerMessage {
            header,
            body: Body::Inline {
                payload: Bytes::new(),
                compressed: false,
            },
        }))
    }

    #[test]
    fn test_poll_and_cancel_returns_to_head() {
        let queue = Queue::new("q", "a", true);
        queue.add(reference(1, None));
        queue.add(reference(2, None));
        let first = queue.poll(Duration::ZERO).unwrap();
        assert_eq!(first.message.id(), 1);
        assert_eq!(queue.delivering_count(), 1);
        queue.cancel(first);
        assert_eq!(queue.delivering_count(), 0);
        assert_eq!(queue.poll(Duration::ZERO).unwrap().message.id(), 1);
    }

    #[test]
    fn test_poll_waits_for_add() {
        let queue = Arc::new(Queue::new("q", "a", false));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.add(reference(5, None));
            })
        };
        let got = queue.poll(Duration::from_secs(5)).unwrap();
        assert_eq!(got.message.id(), 5);
        producer.join().unwrap();
        assert!(queue.poll(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_scheduled_redelivery() {
        let queue = Queue::new("q", "a", false);
        queue.add(reference(1, None));
        let r = queue.poll(Duration::ZERO).unwrap();
        queue.cancel_scheduled(r, Duration::from_millis(30));
        assert_eq!(queue.scheduled_count(), 1);
        assert!(queue.poll(Duration::ZERO).is_none());
        assert_eq!(queue.poll(Duration::from_secs(5)).unwrap().message.id(), 1);
    }

    #[test]
    fn test_last_value_replaces_same_key() {
        let queue = Queue::new("q", "a", false).with_last_value(true);
        assert!(queue.add(reference(1, Some("price"))).is_none());
        assert!(queue.add(reference(2, Some("other"))).is_none());
        let replaced = queue.add(reference(3, Some("price"))).unwrap();
        assert_eq!(replaced.message.id(), 1);
        assert_eq!(queue.message_count(), 2);
    }
}
