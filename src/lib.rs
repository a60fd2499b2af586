#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Import style
#![allow(clippy::wildcard_imports)]
// Struct field patterns
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::struct_field_names)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Self usage
#![allow(clippy::unused_self)]
#![allow(clippy::used_underscore_binding)]
// Clone/assign patterns
#![allow(clippy::assigning_clones)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Type defaults
#![allow(clippy::default_trait_access)]
#![allow(clippy::implicit_hasher)]
// Inlining
#![allow(clippy::inline_always)]
// Iterator patterns
#![allow(clippy::iter_without_into_iter)]
// Reference patterns
#![allow(clippy::ref_option)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Unit patterns
#![allow(clippy::ignored_unit_patterns)]
// Large types
#![allow(clippy::large_enum_variant)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
// Copy vs clone style
#![allow(clippy::cloned_instead_of_copied)]
// String conversion efficiency
#![allow(clippy::inefficient_to_string)]
// Sort stability
#![allow(clippy::stable_sort_primitive)]
// Debug impl completeness
#![allow(clippy::missing_fields_in_debug)]
// Error handling style
#![allow(clippy::result_large_err)]
#![allow(clippy::unnecessary_box_returns)]
// Boolean ops
#![allow(clippy::nonminimal_bool)]
// Explicit returns
#![allow(clippy::needless_return)]
#![allow(clippy::semicolon_if_nothing_returned)]
// Cast wrapping
#![allow(clippy::cast_possible_wrap)]
// Iteration style
#![allow(clippy::explicit_iter_loop)]
#![allow(clippy::explicit_into_iter_loop)]
// Bool conversion
#![allow(clippy::bool_to_int_with_if)]
// String allocation efficiency
#![allow(clippy::format_push_string)]
// File extension comparison
#![allow(clippy::case_sensitive_file_extension_comparisons)]
// Pointer casts
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ptr_cast_constness)]

//! hornetq-core - address settings, large-message streaming and client failover
//! for a JMS-style message broker.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//!
//! ## Settings
//! - `settings::wildcard` - Address pattern matching and specificity
//! - `settings::address_settings` - Per-address policy record
//! - `settings::repository` - Hierarchical pattern-keyed repository
//!
//! ## Messaging
//! - `messaging::message` - Outgoing messages and headers
//! - `messaging::frames` - Inline and large-message frame codec
//! - `messaging::flow` - Credit-based producer flow control
//! - `messaging::stream` - Body sources, sinks and the chunk receiver
//! - `messaging::framer` - Large-message classification and chunking
//! - `messaging::protocol` - Client/broker invocations
//!
//! ## Server
//! - `server::broker` - In-VM broker, post office and request dispatch
//! - `server::session` - Server sessions and transactions
//! - `server::queue` - Queues and message references
//! - `server::large_store` - Large-messages directory
//! - `server::security` - Roles and permission checks
//! - `server::destinations` - Destination registry
//!
//! ## Client
//! - `client::transport` - Transports and the remoting connection
//! - `client::pipeline` - Invocation interceptors
//! - `client::locator` - Node locator
//! - `client::valve` - Failover valve
//! - `client::recovery` - HA reconnect and session replay
//! - `client::session` - Sessions, producers and consumers
//!
//! ## Operations
//! - `ops::telemetry` - Structured logging

// Core infrastructure
pub mod core;

// Address settings
pub mod settings;

// Messaging
pub mod messaging;

// Broker
pub mod server;

// Client
pub mod client;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::config;
pub use client::{
    ClientConsumer, ClientMessage, ClientProducer, ClientSession, ClientSessionFactory,
    FailoverValve, NodeLocator, ServerLocator,
};
pub use messaging::{LargeMessageFramer, Message};
pub use ops::telemetry;
pub use server::Broker;
pub use settings::{AddressSettings, HierarchicalRepository};
