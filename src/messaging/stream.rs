//! Streaming message bodies.
//!
//! - `BodySource` - pull side used by producers (`ReaderSource`, `BytesSource`)
//! - `BodySink` - closable destination for a received body (memory, spool
//!   file or caller writer)
//! - `ChunkFeed` - pulls `LARGE_CHUNK` frames for one delivered message
//! - `LargeBodyReceiver` - pumps a feed into a sink on a background thread and
//!   lets callers wait for completion
//!
//! Compressed bodies are inflated on the way into the sink, so the sink always
//! sees the original bytes.

use crate::messaging::frames::LargeChunk;
use bytes::Bytes;
use flate2::write::DeflateDecoder;
use parking_lot::{Condvar, Mutex};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("stream closed")]
    StreamClosed,
    #[error("timed out waiting for stream")]
    TimedOut,
    #[error("stream cancelled")]
    Cancelled,
    #[error("chunk {got} arrived out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("body already streaming to another sink")]
    AlreadyStreaming,
    #[error("body was delivered to a caller sink and cannot be read again")]
    BodyConsumed,
    #[error("no output stream registered")]
    NoOutputStream,
    #[error("chunk feed failed: {0}")]
    Feed(String),
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl StreamError {
    /// Recover a `StreamError` that travelled through an `io::Error`.
    pub fn from_io(err: io::Error) -> Self {
        let is_wrapped = err
            .get_ref()
            .is_some_and(|inner| inner.is::<StreamError>());
        if is_wrapped {
            if let Some(inner) = err.into_inner() {
                if let Ok(stream) = inner.downcast::<StreamError>() {
                    return *stream;
                }
            }
            return StreamError::Feed("unrecoverable stream error".into());
        }
        StreamError::Io(Arc::new(err))
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            StreamError::Io(err) => io::Error::new(err.kind(), err.to_string()),
            other => io::Error::other(other),
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::from_io(err)
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Result of one pull from a [`BodySource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRead {
    /// Bytes written to the front of the buffer; never zero for a non-empty buffer.
    Data(usize),
    Eof,
}

/// Pull-based body producer. Exactly one reader drains a source to EOF.
pub trait BodySource: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ChunkRead, StreamError>;

    /// Body size if known up front.
    fn declared_size(&self) -> Option<u64> {
        None
    }
}

/// Shared close switch for sources and sinks.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle(Arc<AtomicBool>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Adapts any `Read` into a body source.
pub struct ReaderSource<R> {
    reader: R,
    declared: Option<u64>,
    closed: CloseHandle,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            declared: None,
            closed: CloseHandle::default(),
        }
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared = Some(size);
        self
    }

    /// Handle that closes the source; the next read fails with `StreamClosed`.
    pub fn close_handle(&self) -> CloseHandle {
        self.closed.clone()
    }
}

impl ReaderSource<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        Ok(Self::new(file).with_declared_size(size))
    }
}

impl<R: Read + Send> BodySource for ReaderSource<R> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ChunkRead, StreamError> {
        if self.closed.is_closed() {
            return Err(StreamError::StreamClosed);
        }
        if buf.is_empty() {
            return Ok(ChunkRead::Data(0));
        }
        loop {
            match self.reader.read(buf) {
                Ok(0) => return Ok(ChunkRead::Eof),
                Ok(n) => return Ok(ChunkRead::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn declared_size(&self) -> Option<u64> {
        self.declared
    }
}

/// In-memory body.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
    pos: usize,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl BodySource for BytesSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ChunkRead, StreamError> {
        if self.pos >= self.data.len() {
            return Ok(ChunkRead::Eof);
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(ChunkRead::Data(n))
    }

    fn declared_size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// `Read` view of a body source that counts the bytes it hands out.
pub struct SourceReader {
    source: Box<dyn BodySource>,
    consumed: u64,
}

impl SourceReader {
    pub fn new(source: Box<dyn BodySource>) -> Self {
        Self {
            source,
            consumed: 0,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.source.read_chunk(buf).map_err(StreamError::into_io)? {
            ChunkRead::Data(n) => {
                self.consumed += n as u64;
                Ok(n)
            }
            ChunkRead::Eof => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

enum SinkTarget {
    Memory(Vec<u8>),
    Spool(File),
    Caller(Box<dyn Write + Send>),
}

/// Destination for a received body. Writes after `close` fail with
/// `StreamClosed`.
pub struct BodySink {
    target: SinkTarget,
    closed: CloseHandle,
    written: u64,
}

impl BodySink {
    fn with_target(target: SinkTarget) -> Self {
        Self {
            target,
            closed: CloseHandle::default(),
            written: 0,
        }
    }

    pub fn memory() -> Self {
        Self::with_target(SinkTarget::Memory(Vec::new()))
    }

    pub fn spool(file: File) -> Self {
        Self::with_target(SinkTarget::Spool(file))
    }

    pub fn caller(writer: Box<dyn Write + Send>) -> Self {
        Self::with_target(SinkTarget::Caller(writer))
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.closed.clone()
    }

    pub fn close(&mut self) -> Result<(), StreamError> {
        self.flush()?;
        self.closed.close();
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Collected bytes for a memory sink.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self.target {
            SinkTarget::Memory(buf) => Some(buf),
            _ => None,
        }
    }
}

impl Write for BodySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.is_closed() {
            return Err(StreamError::StreamClosed.into_io());
        }
        let n = match &mut self.target {
            SinkTarget::Memory(v) => {
                v.extend_from_slice(buf);
                buf.len()
            }
            SinkTarget::Spool(f) => f.write(buf)?,
            SinkTarget::Caller(w) => w.write(buf)?,
        };
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.target {
            SinkTarget::Memory(_) => Ok(()),
            SinkTarget::Spool(f) => f.flush(),
            SinkTarget::Caller(w) => w.flush(),
        }
    }
}

/// Sink wrapped with an optional inflater.
enum SinkWriter {
    Plain(BodySink),
    Inflate(DeflateDecoder<BodySink>),
}

impl SinkWriter {
    fn new(sink: BodySink, compressed: bool) -> Self {
        if compressed {
            SinkWriter::Inflate(DeflateDecoder::new(sink))
        } else {
            SinkWriter::Plain(sink)
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        match self {
            SinkWriter::Plain(sink) => sink.write_all(data)?,
            SinkWriter::Inflate(decoder) => decoder.write_all(data)?,
        }
        Ok(())
    }

    fn finish(self) -> Result<BodySink, StreamError> {
        let mut sink = match self {
            SinkWriter::Plain(sink) => sink,
            SinkWriter::Inflate(decoder) => decoder.finish()?,
        };
        sink.flush()?;
        Ok(sink)
    }
}

/// Write an inline payload to a sink, inflating it when compressed.
pub fn write_inline(
    payload: &[u8],
    compressed: bool,
    sink: BodySink,
) -> Result<BodySink, StreamError> {
    let mut writer = SinkWriter::new(sink, compressed);
    for chunk in payload.chunks(64 * 1024) {
        writer.write_all(chunk)?;
    }
    writer.finish()
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Supplies the chunks of one delivered large message, in order.
pub trait ChunkFeed: Send {
    fn next_chunk(&mut self) -> Result<LargeChunk, StreamError>;
}

enum Phase {
    Pending,
    Streaming,
    Complete { bytes: u64 },
    Failed(StreamError),
}

struct ReceiveState {
    feed: Option<Box<dyn ChunkFeed>>,
    phase: Phase,
    spool: Option<Arc<NamedTempFile>>,
    sink_closer: Option<CloseHandle>,
}

struct Shared {
    state: Mutex<ReceiveState>,
    done: Condvar,
}

/// Receive side of one large message body.
///
/// The body goes to exactly one sink: a caller writer registered with
/// `set_output_stream`, or a temporary spool file created on first read.
pub struct LargeBodyReceiver {
    shared: Arc<Shared>,
    compressed: bool,
    spool_dir: Option<PathBuf>,
    cancel: CloseHandle,
}

impl LargeBodyReceiver {
    pub fn new(feed: Box<dyn ChunkFeed>, compressed: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ReceiveState {
                    feed: Some(feed),
                    phase: Phase::Pending,
                    spool: None,
                    sink_closer: None,
                }),
                done: Condvar::new(),
            }),
            compressed,
            spool_dir: None,
            cancel: CloseHandle::default(),
        }
    }

    /// Directory for spool files; the system temp dir when unset.
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Start streaming the body into `writer` on a background thread.
    pub fn set_output_stream(&self, writer: Box<dyn Write + Send>) -> Result<(), StreamError> {
        self.start(BodySink::caller(writer), None)
    }

    /// Wait for the body to reach its sink. A zero timeout waits forever.
    pub fn wait_output_stream_completion(&self, timeout: Duration) -> Result<(), StreamError> {
        self.wait(timeout).map(|_| ())
    }

    /// Blocking variant of `set_output_stream`.
    pub fn save_to_output_stream(&self, writer: Box<dyn Write + Send>) -> Result<(), StreamError> {
        self.set_output_stream(writer)?;
        self.wait_output_stream_completion(Duration::ZERO)
    }

    /// Spool the body to a temporary file (once) and open it for reading.
    pub fn open_reader(&self) -> Result<File, StreamError> {
        let pending = matches!(self.shared.state.lock().phase, Phase::Pending);
        if pending {
            let spool = match &self.spool_dir {
                Some(dir) => {
                    fs::create_dir_all(dir)?;
                    NamedTempFile::new_in(dir)?
                }
                None => NamedTempFile::new()?,
            };
            let file = spool.reopen()?;
            match self.start(BodySink::spool(file), Some(Arc::new(spool))) {
                Ok(()) | Err(StreamError::AlreadyStreaming) => {}
                Err(e) => return Err(e),
            }
        }
        self.wait(Duration::ZERO)?;
        let state = self.shared.state.lock();
        match &state.spool {
            Some(spool) => Ok(spool.reopen()?),
            None => Err(StreamError::BodyConsumed),
        }
    }

    /// Decoded body size once streaming has finished.
    pub fn completed_bytes(&self) -> Option<u64> {
        match self.shared.state.lock().phase {
            Phase::Complete { bytes } => Some(bytes),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_bytes().is_some()
    }

    /// Stop between chunks; the sink keeps whatever arrived so far.
    pub fn cancel(&self) {
        self.cancel.close();
    }

    /// Close the sink; the pump fails its next write with `StreamClosed`.
    pub fn close(&self) {
        self.cancel.close();
        if let Some(closer) = &self.shared.state.lock().sink_closer {
            closer.close();
        }
    }

    fn start(&self, sink: BodySink, spool: Option<Arc<NamedTempFile>>) -> Result<(), StreamError> {
        let feed = {
            let mut state = self.shared.state.lock();
            if !matches!(state.phase, Phase::Pending) {
                return Err(StreamError::AlreadyStreaming);
            }
            let Some(feed) = state.feed.take() else {
                return Err(StreamError::AlreadyStreaming);
            };
            state.phase = Phase::Streaming;
            state.spool = spool;
            state.sink_closer = Some(sink.close_handle());
            feed
        };
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let writer = SinkWriter::new(sink, self.compressed);
        thread::Builder::new()
            .name("large-body-pump".into())
            .spawn(move || pump(&shared, feed, writer, &cancel))
            .map_err(StreamError::from)?;
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<u64, StreamError> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut state = self.shared.state.lock();
        loop {
            match &state.phase {
                Phase::Complete { bytes } => return Ok(*bytes),
                Phase::Failed(err) => return Err(err.clone()),
                Phase::Pending => return Err(StreamError::NoOutputStream),
                Phase::Streaming => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.done.wait_until(&mut state, deadline).timed_out()
                        && matches!(state.phase, Phase::Streaming)
                    {
                        return Err(StreamError::TimedOut);
                    }
                }
                None => self.shared.done.wait(&mut state),
            }
        }
    }
}

impl Drop for LargeBodyReceiver {
    fn drop(&mut self) {
        self.cancel.close();
    }
}

fn pump(
    shared: &Shared,
    mut feed: Box<dyn ChunkFeed>,
    mut writer: SinkWriter,
    cancel: &CloseHandle,
) {
    let result = (|| -> Result<u64, StreamError> {
        let mut expected = 0u32;
        loop {
            if cancel.is_closed() {
                return Err(StreamError::Cancelled);
            }
            let chunk = feed.next_chunk()?;
            if chunk.seq != expected {
                return Err(StreamError::OutOfOrder {
                    expected,
                    got: chunk.seq,
                });
            }
            expected += 1;
            writer.write_all(&chunk.payload)?;
            if chunk.is_last {
                break;
            }
        }
        Ok(writer.finish()?.written())
    })();
    let mut state = shared.state.lock();
    state.phase = match result {
        Ok(bytes) => {
            debug!(bytes, "large body delivered to sink");
            Phase::Complete { bytes }
        }
        Err(err) => {
            warn!(error = %err, "large body stream failed");
            Phase::Failed(err)
        }
    };
    shared.done.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::collections::VecDeque;

    struct VecFeed(VecDeque<LargeChunk>);

    impl VecFeed {
        fn from_body(body: &[u8], chunk: usize) -> Box<dyn ChunkFeed> {
            let pieces: Vec<&[u8]> = body.chunks(chunk).collect();
            let count = pieces.len();
            let chunks = pieces
                .into_iter()
                .enumerate()
                .map(|(i, p)| LargeChunk {
                    message_id: 1,
                    seq: i as u32,
                    payload: Bytes::copy_from_slice(p),
                    is_last: i + 1 == count,
                })
                .collect();
            Box::new(VecFeed(chunks))
        }
    }

    impl ChunkFeed for VecFeed {
        fn next_chunk(&mut self) -> Result<LargeChunk, StreamError> {
            self.0.pop_front().ok_or(StreamError::StreamClosed)
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_bytes_source_reads_in_chunks() {
        let mut source = BytesSource::new(vec![7u8; 10]);
        let mut buf = [0u8; 4];
        assert_eq!(source.read_chunk(&mut buf).unwrap(), ChunkRead::Data(4));
        assert_eq!(source.read_chunk(&mut buf).unwrap(), ChunkRead::Data(4));
        assert_eq!(source.read_chunk(&mut buf).unwrap(), ChunkRead::Data(2));
        assert_eq!(source.read_chunk(&mut buf).unwrap(), ChunkRead::Eof);
    }

    #[test]
    fn test_closed_source_fails_next_read() {
        let mut source = ReaderSource::new(io::repeat(1));
        let closer = source.close_handle();
        let mut buf = [0u8; 8];
        assert!(matches!(source.read_chunk(&mut buf), Ok(ChunkRead::Data(8))));
        closer.close();
        assert!(matches!(
            source.read_chunk(&mut buf),
            Err(StreamError::StreamClosed)
        ));
    }

    #[test]
    fn test_stream_closed_survives_io_round_trip() {
        let err = StreamError::from_io(StreamError::StreamClosed.into_io());
        assert!(matches!(err, StreamError::StreamClosed));
    }

    #[test]
    fn test_closed_sink_rejects_writes() {
        let mut sink = BodySink::memory();
        sink.write_all(b"abc").unwrap();
        sink.close().unwrap();
        let err = StreamError::from_io(sink.write_all(b"d").unwrap_err());
        assert!(matches!(err, StreamError::StreamClosed));
        assert_eq!(sink.into_bytes().unwrap(), b"abc");
    }

    #[test]
    fn test_receiver_streams_to_caller_sink() {
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let receiver = LargeBodyReceiver::new(VecFeed::from_body(&body, 1000), false);
        let out = SharedBuf::default();
        receiver.set_output_stream(Box::new(out.clone())).unwrap();
        receiver
            .wait_output_stream_completion(Duration::from_secs(10))
            .unwrap();
        assert_eq!(*out.0.lock(), body);
        assert_eq!(receiver.completed_bytes(), Some(10_000));
        assert!(matches!(receiver.open_reader(), Err(StreamError::BodyConsumed)));
    }

    #[test]
    fn test_receiver_inflates_compressed_chunks_to_spool() {
        let body = vec![b' '; 200_000];
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).unwrap();
        let compressed = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let receiver = LargeBodyReceiver::new(VecFeed::from_body(&compressed, 64), true)
            .with_spool_dir(dir.path());
        let mut file = receiver.open_reader().unwrap();
        let mut read_back = Vec::new();
        file.read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, body);
        assert!(matches!(
            receiver.set_output_stream(Box::new(io::sink())),
            Err(StreamError::AlreadyStreaming)
        ));
    }

    #[test]
    fn test_wait_without_sink_reports_no_output_stream() {
        let receiver = LargeBodyReceiver::new(VecFeed::from_body(b"x", 1), false);
        assert!(matches!(
            receiver.wait_output_stream_completion(Duration::from_millis(5)),
            Err(StreamError::NoOutputStream)
        ));
    }

    #[test]
    fn test_inline_write_inflates() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello hello hello").unwrap();
        let compressed = encoder.finish().unwrap();
        let sink = write_inline(&compressed, true, BodySink::memory()).unwrap();
        assert_eq!(sink.written(), 17);
        assert_eq!(sink.into_bytes().unwrap(), b"hello hello hello");
    }
}
