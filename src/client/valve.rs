//! Failover valve.
//!
//! Serializes connection recovery against in-flight invocations on one
//! connection. First attempts run under the read lock so invocations proceed
//! in parallel; retries and recovery take the write lock. The `failed` latch
//! on the remoting connection ensures that many invocations observing the
//! same broken transport produce a single recovery episode.

use crate::client::pipeline::InvocationError;
use crate::client::transport::{RemotingConnection, TransportError};
use crate::messaging::protocol::Reply;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_IO_RETRY: u32 = 5;

/// Replaces a failed connection with a working one.
pub trait Recovery: Send + Sync {
    fn recover(
        &self,
        failed: &RemotingConnection,
    ) -> Result<Arc<RemotingConnection>, InvocationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValveState {
    Open = 0,
    /// A recovery episode holds the write lock.
    Draining = 1,
    /// Recovery failed or the valve was closed; invocations fail fast.
    Closed = 2,
}

impl ValveState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ValveState::Open,
            1 => ValveState::Draining,
            _ => ValveState::Closed,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValveStats {
    invocations: AtomicU64,
    retries: AtomicU64,
    failovers: AtomicU64,
    ignored_failures: AtomicU64,
}

impl ValveStats {
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Completed recovery episodes.
    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    /// Failure reports for a connection that was already handled.
    pub fn ignored_failures(&self) -> u64 {
        self.ignored_failures.load(Ordering::Relaxed)
    }
}

pub struct FailoverValve {
    remoting: RwLock<Arc<RemotingConnection>>,
    // Written only while `remoting` is write-locked; read without the lock.
    state: AtomicU8,
    recovery: Arc<dyn Recovery>,
    max_io_retry: u32,
    stats: ValveStats,
    this: Weak<FailoverValve>,
}

impl FailoverValve {
    pub fn new(
        remoting: Arc<RemotingConnection>,
        recovery: Arc<dyn Recovery>,
        max_io_retry: u32,
    ) -> Arc<Self> {
        let valve = Arc::new_cyclic(|this| Self {
            remoting: RwLock::new(remoting.clone()),
            state: AtomicU8::new(ValveState::Open as u8),
            recovery,
            max_io_retry,
            stats: ValveStats::default(),
            this: this.clone(),
        });
        valve.install_listener(&remoting);
        valve
    }

    /// Current state. Does not wait for a recovery episode in progress.
    pub fn state(&self) -> ValveState {
        ValveState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn current(&self) -> Arc<RemotingConnection> {
        self.remoting.read().clone()
    }

    pub fn stats(&self) -> &ValveStats {
        &self.stats
    }

    pub fn max_io_retry(&self) -> u32 {
        self.max_io_retry
    }

    fn set_state(&self, state: ValveState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn usable(
        &self,
        remoting: &Arc<RemotingConnection>,
    ) -> Result<Arc<RemotingConnection>, InvocationError> {
        match self.state() {
            ValveState::Closed => Err(closed()),
            ValveState::Open | ValveState::Draining => Ok(remoting.clone()),
        }
    }

    /// Run `call` against the current connection, retrying transport errors
    /// and recovering the connection once retries are exhausted.
    pub fn invoke<F>(&self, mut call: F) -> Result<Reply, InvocationError>
    where
        F: FnMut(&RemotingConnection) -> Result<Reply, InvocationError>,
    {
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);
        let mut last_failed: Option<Arc<RemotingConnection>> = None;
        for attempt in 0..self.max_io_retry {
            let (remoting, result) = if attempt == 0 {
                let guard = self.remoting.read();
                let remoting = self.usable(&guard)?;
                let result = call(&remoting);
                (remoting, result)
            } else {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                let guard = self.remoting.write();
                let remoting = self.usable(&guard)?;
                let result = call(&remoting);
                (remoting, result)
            };
            match result {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_retriable() => {
                    debug!(
                        attempt,
                        connection = remoting.id(),
                        error = %err,
                        "invocation failed, retrying"
                    );
                    last_failed = Some(remoting);
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(failed) = last_failed {
            self.handle_connection_failure(&failed)?;
        }
        let remoting = self.usable(&self.remoting.read())?;
        call(&remoting)
    }

    /// Recover `failed` unless another episode already did.
    pub fn handle_connection_failure(
        &self,
        failed: &RemotingConnection,
    ) -> Result<(), InvocationError> {
        let mut guard = self.remoting.write();
        if self.state() == ValveState::Closed {
            return Err(closed());
        }
        if !failed.mark_failed() {
            self.stats.ignored_failures.fetch_add(1, Ordering::Relaxed);
            debug!(connection = failed.id(), "connection failure already handled");
            return Ok(());
        }
        warn!(
            connection = failed.id(),
            endpoint = %failed.endpoint(),
            "connection failed, starting failover"
        );
        self.set_state(ValveState::Draining);
        match self.recovery.recover(failed) {
            Ok(remoting) => {
                self.install_listener(&remoting);
                info!(
                    failed = failed.id(),
                    connection = remoting.id(),
                    endpoint = %remoting.endpoint(),
                    "failover complete"
                );
                *guard = remoting;
                self.set_state(ValveState::Open);
                self.stats.failovers.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                warn!(
                    connection = failed.id(),
                    error = %err,
                    "failover failed, closing connection"
                );
                self.set_state(ValveState::Closed);
                Err(match err {
                    InvocationError::RecoveryFailed(reason) => {
                        InvocationError::RecoveryFailed(reason)
                    }
                    other => InvocationError::RecoveryFailed(other.to_string()),
                })
            }
        }
    }

    /// Listener entry point for failures reported by the transport.
    pub fn connection_failed(&self, remoting: &RemotingConnection, error: &TransportError) {
        debug!(connection = remoting.id(), error = %error, "transport reported failure");
        if let Err(err) = self.handle_connection_failure(remoting) {
            warn!(
                connection = remoting.id(),
                error = %err,
                "recovery after transport failure failed"
            );
        }
    }

    pub fn close(&self) {
        let guard = self.remoting.write();
        self.set_state(ValveState::Closed);
        guard.close();
    }

    fn install_listener(&self, remoting: &Arc<RemotingConnection>) {
        let valve = self.this.clone();
        let target = Arc::downgrade(remoting);
        remoting.transport().set_failure_listener(Arc::new(move |error| {
            if let (Some(valve), Some(remoting)) = (valve.upgrade(), target.upgrade()) {
                valve.connection_failed(&remoting, error);
            }
        }));
    }
}

fn closed() -> InvocationError {
    InvocationError::RecoveryFailed("connection is closed".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::{Connector, InVmConnector};
    use crate::messaging::protocol::Request;
    use crate::server::broker::Broker;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    struct Reconnect {
        connector: Arc<InVmConnector>,
        episodes: AtomicUsize,
        fail: bool,
    }

    impl Recovery for Reconnect {
        fn recover(
            &self,
            failed: &RemotingConnection,
        ) -> Result<Arc<RemotingConnection>, InvocationError> {
            self.episodes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(InvocationError::RecoveryFailed("no backup".into()));
            }
            failed.close();
            let transport = self.connector.connect(failed.endpoint())?;
            Ok(Arc::new(RemotingConnection::new(
                failed.id() + 1,
                failed.endpoint().clone(),
                transport,
            )))
        }
    }

    /// Holds the recovery episode open until the test releases it.
    struct Gated {
        inner: Arc<Reconnect>,
        entered: Barrier,
        release: Barrier,
    }

    impl Recovery for Gated {
        fn recover(
            &self,
            failed: &RemotingConnection,
        ) -> Result<Arc<RemotingConnection>, InvocationError> {
            self.entered.wait();
            self.release.wait();
            self.inner.recover(failed)
        }
    }

    fn setup(
        fail: bool,
    ) -> (tempfile::TempDir, Arc<InVmConnector>, Arc<Reconnect>, Arc<FailoverValve>) {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(InVmConnector::new());
        connector.register("vm://0", Arc::new(Broker::open(dir.path()).unwrap()));
        let recovery = Arc::new(Reconnect {
            connector: connector.clone(),
            episodes: AtomicUsize::new(0),
            fail,
        });
        let remoting = Arc::new(RemotingConnection::new(
            1,
            "vm://0".into(),
            connector.connect(&"vm://0".into()).unwrap(),
        ));
        let valve = FailoverValve::new(remoting, recovery.clone(), DEFAULT_MAX_IO_RETRY);
        (dir, connector, recovery, valve)
    }

    #[test]
    fn test_concurrent_failures_recover_once() {
        let (_dir, connector, recovery, valve) = setup(false);
        connector.transports(&"vm://0".into())[0].inject_failure();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let valve = valve.clone();
                thread::spawn(move || valve.invoke(|remoting| remoting.call(&Request::Ping)))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), Reply::Pong);
        }
        assert_eq!(recovery.episodes.load(Ordering::SeqCst), 1);
        assert_eq!(valve.stats().failovers(), 1);
        assert_eq!(valve.current().id(), 2);
        assert_eq!(valve.state(), ValveState::Open);
    }

    #[test]
    fn test_non_transport_errors_propagate_without_recovery() {
        let (_dir, _connector, recovery, valve) = setup(false);
        let err = valve
            .invoke(|remoting| {
                remoting.call(&Request::Commit {
                    session: "missing".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, InvocationError::Remote(_)));
        assert_eq!(recovery.episodes.load(Ordering::SeqCst), 0);
        assert_eq!(valve.stats().retries(), 0);
    }

    #[test]
    fn test_failed_recovery_poisons_valve() {
        let (_dir, connector, _recovery, valve) = setup(true);
        connector.transports(&"vm://0".into())[0].inject_failure();
        let err = valve.invoke(|remoting| remoting.call(&Request::Ping)).unwrap_err();
        assert!(matches!(err, InvocationError::RecoveryFailed(_)));
        assert_eq!(valve.state(), ValveState::Closed);
        assert!(matches!(
            valve.invoke(|remoting| remoting.call(&Request::Ping)),
            Err(InvocationError::RecoveryFailed(_))
        ));
    }

    #[test]
    fn test_listener_triggers_recovery_and_duplicates_are_ignored() {
        let (_dir, connector, recovery, valve) = setup(false);
        let first = valve.current();
        connector.transports(&"vm://0".into())[0].disconnect();
        assert_eq!(recovery.episodes.load(Ordering::SeqCst), 1);
        valve.handle_connection_failure(&first).unwrap();
        assert_eq!(recovery.episodes.load(Ordering::SeqCst), 1);
        assert_eq!(valve.stats().ignored_failures(), 1);
        assert_eq!(valve.invoke(|remoting| remoting.call(&Request::Ping)).unwrap(), Reply::Pong);
    }

    #[test]
    fn test_state_reports_draining_during_recovery() {
        let (_dir, connector, reconnect, _) = setup(false);
        let gated = Arc::new(Gated {
            inner: reconnect.clone(),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let remoting = Arc::new(RemotingConnection::new(
            10,
            "vm://0".into(),
            connector.connect(&"vm://0".into()).unwrap(),
        ));
        let valve = FailoverValve::new(remoting, gated.clone(), DEFAULT_MAX_IO_RETRY);
        assert_eq!(valve.state(), ValveState::Open);

        let episode = {
            let valve = valve.clone();
            thread::spawn(move || valve.handle_connection_failure(&valve.current()))
        };
        gated.entered.wait();
        assert_eq!(valve.state(), ValveState::Draining);
        gated.release.wait();
        episode.join().unwrap().unwrap();

        assert_eq!(valve.state(), ValveState::Open);
        assert_eq!(valve.current().id(), 11);
        assert_eq!(reconnect.episodes.load(Ordering::SeqCst), 1);
    }
}
