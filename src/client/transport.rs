//! Client transports.
//!
//! A [`Transport`] carries one [`Request`] at a time to a server and reports
//! asynchronous failures to an installed listener. [`RemotingConnection`]
//! wraps a transport with the `failed` latch the failover valve coordinates
//! on. The in-VM implementation calls straight into a [`Broker`] and can be
//! broken on demand.

use crate::client::locator::Endpoint;
use crate::client::pipeline::InvocationError;
use crate::messaging::protocol::{Reply, Request};
use crate::server::broker::Broker;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("cannot connect to {endpoint}: {reason}")]
    CannotConnect { endpoint: String, reason: String },
    #[error("transport failure: {0}")]
    Io(String),
    #[error("transport closed")]
    Closed,
}

pub type FailureListener = Arc<dyn Fn(&TransportError) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn call(&self, request: &Request) -> Result<Reply, InvocationError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Replace the listener notified when the remote side fails.
    fn set_failure_listener(&self, listener: FailureListener);
}

pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError>;
}

/// A transport plus the latch recording that it failed.
pub struct RemotingConnection {
    id: u64,
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    failed: AtomicBool,
}

impl RemotingConnection {
    pub fn new(id: u64, endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            endpoint,
            transport,
            failed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Set the latch. True only for the call that flipped it.
    pub fn mark_failed(&self) -> bool {
        !self.failed.swap(true, Ordering::SeqCst)
    }

    pub fn call(&self, request: &Request) -> Result<Reply, InvocationError> {
        self.transport.call(request)
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

impl std::fmt::Debug for RemotingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("failed", &self.is_failed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// In-VM
// ---------------------------------------------------------------------------

pub struct InVmTransport {
    endpoint: Endpoint,
    broker: Arc<Broker>,
    broken: AtomicBool,
    closed: AtomicBool,
    listener: Mutex<Option<FailureListener>>,
    calls: AtomicU64,
}

impl InVmTransport {
    fn new(endpoint: Endpoint, broker: Arc<Broker>) -> Self {
        Self {
            endpoint,
            broker,
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listener: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Break the transport without telling anyone; every later call fails
    /// with an I/O error.
    pub fn inject_failure(&self) {
        warn!(endpoint = %self.endpoint, "injecting transport failure");
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Break the transport and notify the failure listener.
    pub fn disconnect(&self) {
        self.broken.store(true, Ordering::SeqCst);
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(&TransportError::Io(format!("connection to {} lost", self.endpoint)));
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Transport for InVmTransport {
    fn call(&self, request: &Request) -> Result<Reply, InvocationError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed.into());
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::Io(format!(
                "connection to {} broken",
                self.endpoint
            )).into());
        }
        self.broker.handle(request.clone()).map_err(InvocationError::Remote)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "transport closed");
        }
        self.listener.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_failure_listener(&self, listener: FailureListener) {
        *self.listener.lock() = Some(listener);
    }
}

/// Connects to brokers registered under an endpoint in this process.
#[derive(Default)]
pub struct InVmConnector {
    brokers: RwLock<HashMap<Endpoint, Arc<Broker>>>,
    transports: Mutex<Vec<Weak<InVmTransport>>>,
}

impl InVmConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: impl Into<Endpoint>, broker: Arc<Broker>) {
        self.brokers.write().insert(endpoint.into(), broker);
    }

    /// Take a broker off the endpoint. Open transports to it are disconnected.
    pub fn unregister(&self, endpoint: &Endpoint) -> Option<Arc<Broker>> {
        let removed = self.brokers.write().remove(endpoint);
        for transport in self.transports(endpoint) {
            transport.disconnect();
        }
        removed
    }

    /// Open transports to `endpoint`, oldest first.
    pub fn transports(&self, endpoint: &Endpoint) -> Vec<Arc<InVmTransport>> {
        let mut transports = self.transports.lock();
        transports.retain(|t| t.upgrade().is_some_and(|t| !t.is_closed()));
        transports
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| &t.endpoint == endpoint)
            .collect()
    }
}

impl Connector for InVmConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError> {
        let broker = self
            .brokers
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| TransportError::CannotConnect {
                endpoint: endpoint.to_string(),
                reason: "no broker registered".into(),
            })?;
        let transport = Arc::new(InVmTransport::new(endpoint.clone(), broker));
        self.transports.lock().push(Arc::downgrade(&transport));
        debug!(endpoint = %endpoint, "in-vm transport connected");
        Ok(transport)
    }
}
