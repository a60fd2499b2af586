//! Client side of the broker connection.
//!
//! - `transport` - Transports, connectors and the remoting connection latch
//! - `pipeline` - Interceptor chain around every invocation
//! - `locator` - Candidate-node bookkeeping for (re)connection
//! - `valve` - Failover valve serializing recovery against invocations
//! - `recovery` - Reconnect through the locator and replay sessions
//! - `session` - Session factory, sessions, producers and consumers

pub mod locator;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod transport;
pub mod valve;

pub use locator::*;
pub use pipeline::*;
pub use recovery::*;
pub use session::*;
pub use transport::*;
pub use valve::*;
