//! Candidate-set node locator.
//!
//! Known cluster members are split into `untried` and `tried`. Recovery picks
//! a member from `untried`; a member whose live and backup both refused a
//! connection moves to `tried` until a topology change makes it worth another
//! attempt.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("node locator shut down")]
    Cancelled,
    #[error("no node became available within {0:?}")]
    TimedOut(Duration),
}

/// Connector address of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Endpoint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A live server and its optional backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyMember {
    pub node_id: String,
    pub live: Endpoint,
    pub backup: Option<Endpoint>,
}

impl TopologyMember {
    pub fn new(node_id: impl Into<String>, live: impl Into<Endpoint>) -> Self {
        Self {
            node_id: node_id.into(),
            live: live.into(),
            backup: None,
        }
    }

    pub fn with_backup(mut self, backup: impl Into<Endpoint>) -> Self {
        self.backup = Some(backup.into());
        self
    }
}

/// Inbound topology callbacks.
pub trait TopologyListener: Send + Sync {
    fn node_up(&self, member: TopologyMember, last: bool);
    fn node_down(&self, event_uid: u64, node_id: &str);
}

/// Hook run when a registration against the current node failed.
pub trait RegistrationObserver: Send + Sync {
    fn registration_failed(&self, node_id: &str, already_replicating: bool);
}

type Pair = (Endpoint, Option<Endpoint>);

#[derive(Default)]
struct Candidates {
    untried: BTreeMap<String, Pair>,
    tried: BTreeMap<String, Pair>,
    current: Option<String>,
    shutdown: bool,
}

#[derive(Default)]
pub struct NodeLocator {
    state: Mutex<Candidates>,
    available: Condvar,
    observer: Option<Arc<dyn RegistrationObserver>>,
}

impl NodeLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn RegistrationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn node_up(&self, member: TopologyMember) {
        let mut state = self.state.lock();
        state.tried.remove(&member.node_id);
        debug!(node_id = %member.node_id, live = %member.live, "node up");
        state
            .untried
            .insert(member.node_id, (member.live, member.backup));
        self.available.notify_all();
    }

    /// Forget `node_id` and give every previously tried member another
    /// chance. Returns how many tried members moved back to untried.
    ///
    /// The departed node may have held any of the tried backups.
    pub fn node_down(&self, node_id: &str) -> usize {
        let mut state = self.state.lock();
        state.untried.remove(node_id);
        state.tried.remove(node_id);
        if state.current.as_deref() == Some(node_id) {
            state.current = None;
        }
        let tried = std::mem::take(&mut state.tried);
        let moved = tried.len();
        state.untried.extend(tried);
        debug!(node_id, moved, "node down");
        if !state.untried.is_empty() {
            self.available.notify_all();
        }
        moved
    }

    /// Block until at least one untried member exists.
    pub fn locate_node(&self) -> Result<(), LocatorError> {
        let mut state = self.state.lock();
        while state.untried.is_empty() && !state.shutdown {
            self.available.wait(&mut state);
        }
        if state.shutdown {
            return Err(LocatorError::Cancelled);
        }
        Ok(())
    }

    pub fn locate_node_timeout(&self, timeout: Duration) -> Result<(), LocatorError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.untried.is_empty() && !state.shutdown {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.shutdown {
            return Err(LocatorError::Cancelled);
        }
        if state.untried.is_empty() {
            return Err(LocatorError::TimedOut(timeout));
        }
        Ok(())
    }

    /// Pick an untried member and make it current.
    pub fn get_live_configuration(&self) -> Option<(Endpoint, Option<Endpoint>)> {
        let mut state = self.state.lock();
        let (node_id, pair) = state
            .untried
            .iter()
            .next()
            .map(|(id, pair)| (id.clone(), pair.clone()))?;
        state.current = Some(node_id);
        Some(pair)
    }

    /// Move the current member to `tried`.
    pub fn notify_registration_failed(&self, already_replicating: bool) {
        let node_id = {
            let mut state = self.state.lock();
            let Some(node_id) = state.current.clone() else {
                return;
            };
            if let Some(pair) = state.untried.remove(&node_id) {
                state.tried.insert(node_id.clone(), pair);
            }
            node_id
        };
        match &self.observer {
            Some(observer) => observer.registration_failed(&node_id, already_replicating),
            None => warn!(node_id = %node_id, already_replicating, "registration with node failed"),
        }
    }

    /// Wake every waiter with `Cancelled`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn current_node_id(&self) -> Option<String> {
        self.state.lock().current.clone()
    }

    pub fn untried_count(&self) -> usize {
        self.state.lock().untried.len()
    }

    pub fn tried_count(&self) -> usize {
        self.state.lock().tried.len()
    }

    /// Node ids of the untried and tried members.
    pub fn members(&self) -> (Vec<String>, Vec<String>) {
        let state = self.state.lock();
        (
            state.untried.keys().cloned().collect(),
            state.tried.keys().cloned().collect(),
        )
    }
}

impl TopologyListener for NodeLocator {
    fn node_up(&self, member: TopologyMember, _last: bool) {
        NodeLocator::node_up(self, member);
    }

    fn node_down(&self, _event_uid: u64, node_id: &str) {
        NodeLocator::node_down(self, node_id);
    }
}
