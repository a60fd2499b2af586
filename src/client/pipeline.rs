//! Invocation pipeline.
//!
//! Each interceptor sees the invocation and a [`Next`] handle for the rest of
//! the chain; the end of the chain calls the remoting connection.

use crate::client::transport::{RemotingConnection, TransportError};
use crate::messaging::protocol::{Reply, Request};
use crate::server::broker::BrokerError;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Remote(#[from] BrokerError),
    #[error("failover recovery failed: {0}")]
    RecoveryFailed(String),
    #[error("invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    /// Errors the failover valve retries and recovers from.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InvocationError::Transport(TransportError::CannotConnect { .. } | TransportError::Io(_))
        )
    }
}

pub struct Invocation<'a> {
    pub request: &'a Request,
    pub remoting: &'a RemotingConnection,
}

pub trait Interceptor: Send + Sync {
    fn intercept(
        &self,
        invocation: &Invocation<'_>,
        next: Next<'_>,
    ) -> Result<Reply, InvocationError>;
}

/// The remainder of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
}

impl Next<'_> {
    pub fn run(self, invocation: &Invocation<'_>) -> Result<Reply, InvocationError> {
        match self.rest.split_first() {
            Some((head, rest)) => head.intercept(invocation, Next { rest }),
            None => invocation.remoting.call(invocation.request),
        }
    }
}

#[derive(Clone, Default)]
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn invoke(&self, invocation: &Invocation<'_>) -> Result<Reply, InvocationError> {
        Next {
            rest: &self.interceptors,
        }
        .run(invocation)
    }
}

/// Logs every invocation with its latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInterceptor;

impl Interceptor for TracingInterceptor {
    fn intercept(
        &self,
        invocation: &Invocation<'_>,
        next: Next<'_>,
    ) -> Result<Reply, InvocationError> {
        let started = Instant::now();
        let result = next.run(invocation);
        let elapsed_us = started.elapsed().as_micros() as u64;
        match &result {
            Ok(_) => trace!(
                kind = invocation.request.kind(),
                connection = invocation.remoting.id(),
                elapsed_us,
                "invocation complete"
            ),
            Err(err) => debug!(
                kind = invocation.request.kind(),
                connection = invocation.remoting.id(),
                elapsed_us,
                error = %err,
                "invocation failed"
            ),
        }
        result
    }
}
