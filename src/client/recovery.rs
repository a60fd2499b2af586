//! HA recovery: reconnect through the node locator and replay the client's
//! open sessions and consumers onto the new connection.

use crate::client::locator::NodeLocator;
use crate::client::pipeline::InvocationError;
use crate::client::transport::{Connector, RemotingConnection, TransportError};
use crate::client::valve::Recovery;
use crate::messaging::protocol::Request;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionRecord {
    user: Option<String>,
    auto_commit_sends: bool,
    auto_commit_acks: bool,
    consumers: BTreeMap<u64, String>,
}

/// Sessions and consumers a connection has open, in creation order of their
/// names.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<BTreeMap<String, SessionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the effect of a request that succeeded.
    pub fn record(&self, request: &Request) {
        let mut sessions = self.sessions.lock();
        match request {
            Request::CreateSession {
                session,
                user,
                auto_commit_sends,
                auto_commit_acks,
            } => {
                sessions.entry(session.clone()).or_insert_with(|| SessionRecord {
                    user: user.clone(),
                    auto_commit_sends: *auto_commit_sends,
                    auto_commit_acks: *auto_commit_acks,
                    consumers: BTreeMap::new(),
                });
            }
            Request::CloseSession { session } => {
                sessions.remove(session);
            }
            Request::CreateConsumer {
                session,
                consumer_id,
                queue,
            } => {
                if let Some(record) = sessions.get_mut(session) {
                    record.consumers.insert(*consumer_id, queue.clone());
                }
            }
            Request::CloseConsumer { session, consumer_id } => {
                if let Some(record) = sessions.get_mut(session) {
                    record.consumers.remove(consumer_id);
                }
            }
            _ => {}
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn consumer_count(&self) -> usize {
        self.sessions.lock().values().map(|s| s.consumers.len()).sum()
    }

    /// Requests that recreate every tracked session and consumer.
    pub fn replay_requests(&self) -> Vec<Request> {
        let sessions = self.sessions.lock();
        let mut requests = Vec::new();
        for (name, record) in sessions.iter() {
            requests.push(Request::CreateSession {
                session: name.clone(),
                user: record.user.clone(),
                auto_commit_sends: record.auto_commit_sends,
                auto_commit_acks: record.auto_commit_acks,
            });
            for (consumer_id, queue) in &record.consumers {
                requests.push(Request::CreateConsumer {
                    session: name.clone(),
                    consumer_id: *consumer_id,
                    queue: queue.clone(),
                });
            }
        }
        requests
    }

    pub fn replay(&self, remoting: &RemotingConnection) -> Result<usize, InvocationError> {
        let requests = self.replay_requests();
        for request in &requests {
            remoting.call(request)?;
        }
        Ok(requests.len())
    }
}

/// Recovery through the node locator: live first, then its backup.
pub struct HaRecovery {
    locator: Arc<NodeLocator>,
    connector: Arc<dyn Connector>,
    registry: Arc<ConnectionRegistry>,
    reconnect_attempts: u32,
    locate_timeout: Duration,
    next_connection_id: AtomicU64,
}

impl HaRecovery {
    pub fn new(
        locator: Arc<NodeLocator>,
        connector: Arc<dyn Connector>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            locator,
            connector,
            registry,
            reconnect_attempts: 3,
            locate_timeout: Duration::from_secs(30),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts.max(1);
        self
    }

    pub fn with_locate_timeout(mut self, timeout: Duration) -> Self {
        self.locate_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Open the first connection.
    pub fn establish(&self) -> Result<Arc<RemotingConnection>, InvocationError> {
        let mut last = None;
        for attempt in 1..=self.reconnect_attempts {
            match self.connect_once() {
                Ok(remoting) => return Ok(remoting),
                Err(err) if err.is_retriable() => {
                    debug!(attempt, error = %err, "connection attempt failed");
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| {
            InvocationError::RecoveryFailed("no connection attempt made".into())
        }))
    }

    fn connect_once(&self) -> Result<Arc<RemotingConnection>, InvocationError> {
        self.locator
            .locate_node_timeout(self.locate_timeout)
            .map_err(|err| InvocationError::RecoveryFailed(err.to_string()))?;
        let Some((live, backup)) = self.locator.get_live_configuration() else {
            return Err(InvocationError::RecoveryFailed("no candidate node".into()));
        };
        let mut last_error = None;
        for endpoint in std::iter::once(live).chain(backup) {
            match self.connector.connect(&endpoint) {
                Ok(transport) => {
                    let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
                    debug!(connection = id, endpoint = %endpoint, "connected");
                    return Ok(Arc::new(RemotingConnection::new(id, endpoint, transport)));
                }
                Err(err) => {
                    debug!(endpoint = %endpoint, error = %err, "connect failed");
                    last_error = Some(err);
                }
            }
        }
        self.locator.notify_registration_failed(false);
        Err(last_error
            .unwrap_or_else(|| TransportError::CannotConnect {
                endpoint: "<none>".into(),
                reason: "no endpoint".into(),
            })
            .into())
    }
}

impl Recovery for HaRecovery {
    fn recover(
        &self,
        failed: &RemotingConnection,
    ) -> Result<Arc<RemotingConnection>, InvocationError> {
        failed.close();
        for attempt in 1..=self.reconnect_attempts {
            let remoting = match self.connect_once() {
                Ok(remoting) => remoting,
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                    continue;
                }
            };
            match self.registry.replay(&remoting) {
                Ok(replayed) => {
                    info!(
                        connection = remoting.id(),
                        endpoint = %remoting.endpoint(),
                        replayed,
                        "connection re-established"
                    );
                    return Ok(remoting);
                }
                Err(err) if err.is_retriable() => {
                    warn!(attempt, error = %err, "session replay failed");
                    remoting.close();
                }
                Err(err) => {
                    remoting.close();
                    return Err(InvocationError::RecoveryFailed(err.to_string()));
                }
            }
        }
        Err(InvocationError::RecoveryFailed(format!(
            "no server reachable after {} attempts",
            self.reconnect_attempts
        )))
    }
}
