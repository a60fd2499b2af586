//! Large-message streaming through producer, broker storage and consumer.

mod common;

use common::{sample_body, CountingWriter, FrameRecorder, SharedBuffer, TestBroker, RECEIVE_TIMEOUT};
use hornetq_core::client::{ClientConsumer, ClientSession, ClientSessionFactory};
use hornetq_core::core::ClientConfig;
use hornetq_core::messaging::{Message, ReaderSource, DEFAULT_MIN_LARGE_MESSAGE_SIZE};
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

const QUEUE: &str = "large";

struct Fixture {
    broker: TestBroker,
    recorder: Arc<FrameRecorder>,
    _factory: ClientSessionFactory,
    session: ClientSession,
    consumer: ClientConsumer,
}

fn fixture(config: ClientConfig) -> Fixture {
    let broker = TestBroker::start(&[]);
    let recorder = Arc::new(FrameRecorder::default());
    let factory = broker
        .locator(config)
        .with_interceptor(recorder.clone())
        .create_session_factory()
        .unwrap();
    let session = factory.create_session(true, false).unwrap();
    session.create_queue(QUEUE, QUEUE, true).unwrap();
    let consumer = session.create_consumer(QUEUE).unwrap();
    session.start();
    Fixture {
        broker,
        recorder,
        _factory: factory,
        session,
        consumer,
    }
}

fn send(fixture: &Fixture, message: Message) -> hornetq_core::messaging::SendOutcome {
    fixture.session.create_producer(QUEUE).unwrap().send(message).unwrap()
}

#[test]
fn large_message_round_trip_via_save_to_output_stream() {
    let fx = fixture(ClientConfig::default());
    let size = DEFAULT_MIN_LARGE_MESSAGE_SIZE * 7 / 2;
    let body = sample_body(size);
    let outcome = send(&fx, Message::new(true).with_body(body.clone()));
    assert!(outcome.large);
    assert!(!outcome.compressed);
    assert_eq!(outcome.body_bytes, size as u64);
    assert_eq!(fx.broker.large_file_count(), 1);
    assert_eq!(fx.recorder.kinds()[0], "large_init");

    let message = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
    assert!(message.is_large());
    assert_eq!(message.body_size(), Some(size as u64));
    let out = fx.broker.dir.path().join("received.bin");
    message
        .save_to_output_stream(Box::new(File::create(&out).unwrap()))
        .unwrap();
    message.acknowledge().unwrap();
    fx.session.commit().unwrap();

    assert_eq!(fs::read(&out).unwrap(), body);
    assert_eq!(fx.broker.large_file_count(), 0);
}

#[test]
fn large_message_round_trip_via_background_output_stream() {
    let fx = fixture(ClientConfig::default());
    let body = sample_body(DEFAULT_MIN_LARGE_MESSAGE_SIZE * 3 + 17);
    send(&fx, Message::new(false).with_body(body.clone()));

    let message = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
    let sink = SharedBuffer::default();
    message.set_output_stream(Box::new(sink.clone())).unwrap();
    message.wait_output_stream_completion(Duration::ZERO).unwrap();
    message.acknowledge().unwrap();
    fx.session.commit().unwrap();

    assert_eq!(sink.contents(), body);
    assert_eq!(fx.broker.large_file_count(), 0);
}

#[test]
fn streamed_source_without_declared_size_is_read_back() {
    let fx = fixture(ClientConfig::default());
    let body = sample_body(DEFAULT_MIN_LARGE_MESSAGE_SIZE * 2);
    let outcome = send(
        &fx,
        Message::new(false).with_body_source(ReaderSource::new(Cursor::new(body.clone()))),
    );
    assert!(outcome.large);

    let message = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
    let mut received = Vec::new();
    message.body_reader().unwrap().read_to_end(&mut received).unwrap();
    assert_eq!(received, body);
    assert_eq!(message.body_size(), Some(body.len() as u64));
    message.acknowledge().unwrap();
    fx.session.commit().unwrap();
    assert_eq!(fx.broker.large_file_count(), 0);
}

#[test]
fn compressed_large_message_round_trip() {
    let config = ClientConfig {
        min_large_message_size: 256,
        compress_large_message: true,
        ..ClientConfig::default()
    };
    let fx = fixture(config);
    let body = sample_body(DEFAULT_MIN_LARGE_MESSAGE_SIZE * 7 / 2);
    let outcome = send(&fx, Message::new(false).with_body(body.clone()));
    assert!(outcome.large);
    assert!(outcome.compressed);
    assert!(outcome.wire_bytes < body.len() as u64);

    let message = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
    assert_eq!(message.body_bytes().unwrap().as_ref(), body.as_slice());
    message.acknowledge().unwrap();
    fx.session.commit().unwrap();
    assert_eq!(fx.broker.large_file_count(), 0);
}

#[test]
fn threshold_boundary_decides_inline_or_large() {
    let config = ClientConfig {
        min_large_message_size: 1024,
        ..ClientConfig::default()
    };
    let fx = fixture(config);

    let outcome = send(&fx, Message::new(false).with_body(sample_body(1024)));
    assert!(!outcome.large);
    assert_eq!(fx.broker.large_file_count(), 0);
    assert_eq!(fx.recorder.kinds(), vec!["inline"]);

    let outcome = send(&fx, Message::new(false).with_body(sample_body(1025)));
    assert!(outcome.large);
    assert_eq!(fx.broker.large_file_count(), 1);
    assert_eq!(fx.recorder.kinds(), vec!["inline", "large_init", "large_chunk"]);

    for expected in [1024usize, 1025] {
        let message = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
        assert_eq!(message.is_large(), expected == 1025);
        assert_eq!(message.body_bytes().unwrap().len(), expected);
        message.acknowledge().unwrap();
    }
    fx.session.commit().unwrap();
    assert_eq!(fx.broker.large_file_count(), 0);
}

#[test]
fn rolled_back_large_message_keeps_its_file_until_acknowledged() {
    let fx = fixture(ClientConfig::default());
    let body = sample_body(DEFAULT_MIN_LARGE_MESSAGE_SIZE + 1);
    send(&fx, Message::new(false).with_body(body.clone()));

    let first = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
    first.acknowledge().unwrap();
    fx.session.rollback().unwrap();
    assert_eq!(fx.broker.large_file_count(), 1);

    let again = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
    assert_eq!(again.delivery_count(), 2);
    assert_eq!(again.body_bytes().unwrap().as_ref(), body.as_slice());
    again.acknowledge().unwrap();
    fx.session.commit().unwrap();
    assert_eq!(fx.broker.large_file_count(), 0);
}

fn spool_file_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[test]
fn received_large_body_spools_under_configured_directory() {
    let spool_root = tempfile::tempdir().unwrap();
    let spool_dir = spool_root.path().join("client-large-messages");
    let config = ClientConfig {
        large_messages_dir: Some(spool_dir.clone()),
        ..ClientConfig::default()
    };
    let fx = fixture(config);
    let body = sample_body(DEFAULT_MIN_LARGE_MESSAGE_SIZE * 2);
    send(&fx, Message::new(false).with_body(body.clone()));

    let message = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
    assert!(message.is_large());
    let mut reader = message.body_reader().unwrap();
    assert_eq!(spool_file_count(&spool_dir), 1);
    let mut received = Vec::new();
    reader.read_to_end(&mut received).unwrap();
    assert_eq!(received, body);
    message.acknowledge().unwrap();
    fx.session.commit().unwrap();

    drop(reader);
    drop(message);
    let deadline = Instant::now() + RECEIVE_TIMEOUT;
    while spool_file_count(&spool_dir) > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(spool_file_count(&spool_dir), 0);
    assert_eq!(fx.broker.large_file_count(), 0);
}

fn compressible_stream_round_trip(total: u64, threshold: usize) {
    let config = ClientConfig {
        min_large_message_size: threshold,
        compress_large_message: true,
        ..ClientConfig::default()
    };
    let fx = fixture(config);
    let source = ReaderSource::new(io::repeat(0x20).take(total)).with_declared_size(total);
    let outcome = send(&fx, Message::new(false).with_body_source(source));
    assert!(!outcome.large);
    assert!(outcome.compressed);
    assert_eq!(outcome.body_bytes, total);
    assert_eq!(fx.recorder.kinds(), vec!["inline"]);
    assert_eq!(fx.broker.large_file_count(), 0);

    let message = fx.consumer.receive(RECEIVE_TIMEOUT).unwrap().unwrap();
    assert!(!message.is_large());
    let sink = CountingWriter::new(0x20);
    message.set_output_stream(Box::new(sink.clone())).unwrap();
    message.wait_output_stream_completion(Duration::ZERO).unwrap();
    assert_eq!(sink.written(), total);
    assert_eq!(sink.mismatched(), 0);
    message.acknowledge().unwrap();
    fx.session.commit().unwrap();
    assert_eq!(fx.broker.large_file_count(), 0);
}

#[test]
fn compressible_stream_travels_as_one_inline_frame() {
    compressible_stream_round_trip(16 * 1024 * 1024, 1024 * 1024);
}

#[test]
#[ignore = "streams 1 GiB through deflate; run explicitly"]
fn huge_compressible_stream_travels_as_one_inline_frame() {
    compressible_stream_round_trip(1024 * 1024 * 1024, 100 * 1024 * 1024);
}
