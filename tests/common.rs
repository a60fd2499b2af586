//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Starting an in-VM broker over a temporary large-messages directory
//! - Connecting clients to it through a node locator
//! - Recording frames on the wire and capturing streamed bodies

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use hornetq_core::client::{
    ClientMessage, InVmConnector, Interceptor, Invocation, InvocationError, Next, ServerLocator,
    TopologyMember,
};
use hornetq_core::core::ClientConfig;
use hornetq_core::messaging::{Frame, Reply, Request};
use hornetq_core::server::{Broker, LargeMessageStore};
use hornetq_core::settings::{AddressSettings, HierarchicalRepository};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const LIVE: &str = "vm://live";
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deterministic body byte at offset `i`.
pub fn sample_byte(i: u64) -> u8 {
    b'a' + (i % 26) as u8
}

pub fn sample_body(len: usize) -> Vec<u8> {
    (0..len as u64).map(sample_byte).collect()
}

pub struct TestBroker {
    pub dir: TempDir,
    pub broker: Arc<Broker>,
    pub connector: Arc<InVmConnector>,
}

impl TestBroker {
    pub fn start(patterns: &[(&str, AddressSettings)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = HierarchicalRepository::new(AddressSettings::broker_defaults());
        for (pattern, value) in patterns {
            settings.add_match(pattern, value.clone()).unwrap();
        }
        let store = LargeMessageStore::open(dir.path().join("large-messages")).unwrap();
        let broker = Arc::new(Broker::new(store, Arc::new(settings)));
        let connector = Arc::new(InVmConnector::new());
        connector.register(LIVE, broker.clone());
        Self { dir, broker, connector }
    }

    pub fn locator(&self, config: ClientConfig) -> ServerLocator {
        ServerLocator::new(
            config,
            self.connector.clone(),
        ).with_member(TopologyMember::new("live", LIVE))
    }

    pub fn large_file_count(&self) -> usize {
        self.broker.large_message_store().file_count().unwrap()
    }
}

pub fn body_string(message: &ClientMessage) -> String {
    String::from_utf8(message.body_bytes().unwrap().to_vec()).unwrap()
}

/// Records the kind of every frame a producer puts on the wire.
#[derive(Default)]
pub struct FrameRecorder {
    kinds: Mutex<Vec<&'static str>>,
}

impl FrameRecorder {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.kinds.lock().clone()
    }
}

impl Interceptor for FrameRecorder {
    fn intercept(
        &self,
        invocation: &Invocation<'_>,
        next: Next<'_>,
    ) -> Result<Reply, InvocationError> {
        if let Request::Send { frame, .. } = invocation.request {
            if let Ok(decoded) = Frame::decode(frame.clone()) {
                self.kinds.lock().push(decoded.kind());
            }
        }
        next.run(invocation)
    }
}

/// A `Write` sink whose contents stay reachable after it is boxed away.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Counts bytes written and how many differ from `expected`.
#[derive(Clone)]
pub struct CountingWriter {
    expected: u8,
    written: Arc<AtomicU64>,
    mismatched: Arc<AtomicU64>,
}

impl CountingWriter {
    pub fn new(expected: u8) -> Self {
        Self {
            expected,
            written: Arc::new(AtomicU64::new(0)),
            mismatched: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    pub fn mismatched(&self) -> u64 {
        self.mismatched.load(Ordering::SeqCst)
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let bad = buf.iter().filter(|b| **b != self.expected).count() as u64;
        self.mismatched.fetch_add(bad, Ordering::SeqCst);
        self.written.fetch_add(buf.len() as u64, Ordering::SeqCst);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
