//! Destination name registry.
//!
//! Deployed queues and topics are bound under a name in a directory so
//! clients can look them up. Without an explicit binding a destination lands
//! in the default context for its kind (`/queue/<name>` or `/topic/<name>`).

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_QUEUE_CONTEXT: &str = "/queue";
pub const DEFAULT_TOPIC_CONTEXT: &str = "/topic";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("name '{0}' is already bound")]
    NameInUse(String),
    #[error("destination {0} already exists")]
    AlreadyDeployed(Destination),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKind {
    Queue,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    /// Core address backing this destination.
    pub fn address(&self) -> String {
        match self.kind {
            DestinationKind::Queue => format!("jms.queue.{}", self.name),
            DestinationKind::Topic => format!("jms.topic.{}", self.name),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue '{}'", self.name),
            DestinationKind::Topic => write!(f, "topic '{}'", self.name),
        }
    }
}

/// Name service the registry binds into.
pub trait Directory: Send + Sync {
    fn bind(&self, name: &str, destination: Destination) -> Result<(), RegistryError>;
    fn unbind(&self, name: &str) -> bool;
    fn lookup(&self, name: &str) -> Option<Destination>;
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    names: RwLock<HashMap<String, Destination>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for InMemoryDirectory {
    fn bind(&self, name: &str, destination: Destination) -> Result<(), RegistryError> {
        let mut names = self.names.write();
        if names.contains_key(name) {
            return Err(RegistryError::NameInUse(name.to_string()));
        }
        names.insert(name.to_string(), destination);
        Ok(())
    }

    fn unbind(&self, name: &str) -> bool {
        self.names.write().remove(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<Destination> {
        self.names.read().get(name).cloned()
    }
}

pub struct DestinationRegistry {
    directory: Arc<dyn Directory>,
    deployed: Mutex<BTreeMap<Destination, String>>,
}

impl DestinationRegistry {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            deployed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bind a destination and return the name it was bound under.
    pub fn register(
        &self,
        destination: Destination,
        binding: Option<&str>,
    ) -> Result<String, RegistryError> {
        let mut deployed = self.deployed.lock();
        if deployed.contains_key(&destination) {
            return Err(RegistryError::AlreadyDeployed(destination));
        }
        let name = match binding {
            Some(name) => name.to_string(),
            None => {
                let context = match destination.kind {
                    DestinationKind::Queue => DEFAULT_QUEUE_CONTEXT,
                    DestinationKind::Topic => DEFAULT_TOPIC_CONTEXT,
                };
                format!("{context}/{}", destination.name)
            }
        };
        self.directory.bind(&name, destination.clone())?;
        debug!(%destination, binding = %name, "destination registered");
        deployed.insert(destination, name.clone());
        Ok(name)
    }

    /// Unbind a destination. Unknown destinations are ignored.
    pub fn unregister(&self, destination: &Destination) -> bool {
        let Some(name) = self.deployed.lock().remove(destination) else {
            return false;
        };
        self.directory.unbind(&name);
        debug!(%destination, "destination unregistered");
        true
    }

    pub fn is_deployed(&self, destination: &Destination) -> bool {
        self.deployed.lock().contains_key(destination)
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.deployed.lock().keys().cloned().collect()
    }

    pub fn lookup(&self, name: &str) -> Option<Destination> {
        self.directory.lookup(name)
    }

    /// Unbind everything.
    pub fn clear(&self) {
        let deployed = std::mem::take(&mut *self.deployed.lock());
        for name in deployed.values() {
            self.directory.unbind(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DestinationRegistry {
        DestinationRegistry::new(Arc::new(InMemoryDirectory::new()))
    }

    #[test]
    fn test_default_binding_contexts() {
        let registry = registry();
        assert_eq!(registry.register(Destination::queue("orders"), None).unwrap(), "/queue/orders");
        assert_eq!(registry.register(Destination::topic("news"), None).unwrap(), "/topic/news");
        assert_eq!(registry.lookup("/queue/orders"), Some(Destination::queue("orders")));
        assert_eq!(Destination::queue("orders").address(), "jms.queue.orders");
        assert_eq!(registry.destinations().len(), 2);
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let registry = registry();
        registry.register(Destination::queue("a"), Some("/shared")).unwrap();
        assert_eq!(
            registry.register(Destination::topic("b"), Some("/shared")),
            Err(RegistryError::NameInUse("/shared".into()))
        );
        assert!(!registry.is_deployed(&Destination::topic("b")));
        assert!(matches!(
            registry.register(Destination::queue("a"), None),
            Err(RegistryError::AlreadyDeployed(_))
        ));
    }

    #[test]
    fn test_unregister_unbinds() {
        let registry = registry();
        registry.register(Destination::queue("a"), None).unwrap();
        assert!(registry.unregister(&Destination::queue("a")));
        assert!(!registry.unregister(&Destination::queue("a")));
        assert_eq!(registry.lookup("/queue/a"), None);
        registry.register(Destination::queue("a"), None).unwrap();
        registry.clear();
        assert!(registry.destinations().is_empty());
    }
}
