//! Embedded broker.
//!
//! This module hosts the server side used by in-VM clients:
//! - `broker` - Post office, routing, dead-lettering and request dispatch
//! - `session` - Server sessions, transactions and large-message uploads
//! - `queue` - Queues with delivery counts, scheduling and last-value replacement
//! - `message` - Routed messages and their stored bodies
//! - `large_store` - Reference-counted large-message files
//! - `security` - Roles and permission checks
//! - `destinations` - Named destination registry

pub mod broker;
pub mod destinations;
pub mod large_store;
pub mod message;
pub mod queue;
pub mod security;
pub mod session;

pub use broker::*;
pub use destinations::*;
pub use large_store::*;
pub use message::*;
pub use queue::*;
pub use security::*;
pub use session::*;
