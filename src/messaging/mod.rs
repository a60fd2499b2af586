//! Message model and the large-message streaming path.
//!
//! This module provides the pieces shared by clients and the broker:
//! - `message` - Outgoing messages, headers and properties
//! - `frames` - Wire codec for inline, `LARGE_INIT` and `LARGE_CHUNK` frames
//! - `flow` - Credit-based producer backpressure
//! - `stream` - Body sources, closable sinks and the chunk receiver
//! - `framer` - Large-message classification, compression and chunking
//! - `protocol` - Client/broker invocations and replies

pub mod flow;
pub mod framer;
pub mod frames;
pub mod message;
pub mod protocol;
pub mod stream;

pub use flow::*;
pub use framer::*;
pub use frames::*;
pub use message::*;
pub use protocol::*;
pub use stream::*;
