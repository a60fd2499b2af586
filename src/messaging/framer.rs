//! Large-message framing on the send path.
//!
//! A body larger than `min_large_message_size` travels as a `LARGE_INIT` frame
//! followed by `LARGE_CHUNK` frames; anything else goes out as one inline
//! frame. With compression enabled the body is deflated while it is read, and a
//! body whose compressed form fits under the threshold is downgraded to a
//! single compressed inline frame.

use crate::messaging::flow::CreditWindow;
use crate::messaging::frames::{Frame, InlineFrame, LargeChunk, LargeInit};
use crate::messaging::message::MessageHeader;
use crate::messaging::stream::{BodySource, CloseHandle, SourceReader, StreamError};
use bytes::Bytes;
use flate2::read::DeflateEncoder;
use flate2::Compression;
use std::io::{self, Cursor, Read};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MIN_LARGE_MESSAGE_SIZE: usize = 100 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FramerConfig {
    pub min_large_message_size: usize,
    pub chunk_size: usize,
    pub compress: bool,
    /// How long to wait for producer credits; zero waits forever.
    pub credit_timeout: Duration,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            min_large_message_size: DEFAULT_MIN_LARGE_MESSAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: false,
            credit_timeout: Duration::from_secs(30),
        }
    }
}

/// What the framer put on the wire for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub large: bool,
    pub compressed: bool,
    pub frames: u32,
    /// Original body bytes read from the source.
    pub body_bytes: u64,
    /// Payload bytes placed in frames.
    pub wire_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct LargeMessageFramer {
    config: FramerConfig,
}

impl LargeMessageFramer {
    pub fn new(config: FramerConfig) -> Self {
        let mut config = config;
        config.chunk_size = config.chunk_size.max(1);
        Self { config }
    }

    pub fn config(&self) -> &FramerConfig {
        &self.config
    }

    pub fn is_large(&self, body_size: u64) -> bool {
        body_size > self.config.min_large_message_size as u64
    }

    /// Frame `source` and hand each frame to `emit` in order.
    ///
    /// Chunks take credits from `credits` before they are emitted; the emitter
    /// replenishes them once the transport accepted the frame. `cancel` is
    /// checked between chunks.
    pub fn send<F, E>(
        &self,
        header: MessageHeader,
        source: Box<dyn BodySource>,
        credits: &CreditWindow,
        cancel: &CloseHandle,
        mut emit: F,
    ) -> Result<SendOutcome, E>
    where
        F: FnMut(Frame) -> Result<(), E>,
        E: From<StreamError>,
    {
        let threshold = self.config.min_large_message_size;
        let declared = source.declared_size();
        let reader = SourceReader::new(source);

        if self.config.compress && declared.map_or(true, |d| self.is_large(d)) {
            return self.send_compressed(header, reader, declared, credits, cancel, emit);
        }

        if let Some(size) = declared.filter(|d| self.is_large(*d)) {
            let (frames, wire, reader) =
                self.stream_large(
                    header,
                    Vec::new(),
                    reader,
                    size as i64,
                    false,
                    credits,
                    cancel,
                    &mut emit,
                )?;
            return Ok(SendOutcome {
                large: true,
                compressed: false,
                frames,
                body_bytes: reader.consumed(),
                wire_bytes: wire,
            });
        }

        let mut reader = reader;
        let head = read_up_to(&mut reader, threshold + 1, cancel)?;
        if head.len() <= threshold {
            let len = head.len() as u64;
            debug!(message_id = header.id, bytes = len, "sending inline message");
            emit(Frame::Inline(InlineFrame {
                header,
                payload: Bytes::from(head),
                compressed: false,
            }))?;
            return Ok(SendOutcome {
                large: false,
                compressed: false,
                frames: 1,
                body_bytes: len,
                wire_bytes: len,
            });
        }
        let declared_size = declared.map_or(-1, |d| d as i64);
        let (frames, wire, reader) =
            self.stream_large(
                header,
                head,
                reader,
                declared_size,
                false,
                credits,
                cancel,
                &mut emit,
            )?;
        Ok(SendOutcome {
            large: true,
            compressed: false,
            frames,
            body_bytes: reader.consumed(),
            wire_bytes: wire,
        })
    }

    fn send_compressed<F, E>(
        &self,
        header: MessageHeader,
        reader: SourceReader,
        declared: Option<u64>,
        credits: &CreditWindow,
        cancel: &CloseHandle,
        mut emit: F,
    ) -> Result<SendOutcome, E>
    where
        F: FnMut(Frame) -> Result<(), E>,
        E: From<StreamError>,
    {
        let threshold = self.config.min_large_message_size;
        let mut encoder = DeflateEncoder::new(reader, Compression::default());
        let head = read_up_to(&mut encoder, threshold + 1, cancel)?;
        if head.len() <= threshold {
            let wire = head.len() as u64;
            let body_bytes = encoder.get_ref().consumed();
            debug!(
                message_id = header.id,
                body_bytes,
                compressed_bytes = wire,
                "compressed body fits inline"
            );
            emit(Frame::Inline(InlineFrame {
                header,
                payload: Bytes::from(head),
                compressed: true,
            }))?;
            return Ok(SendOutcome {
                large: false,
                compressed: true,
                frames: 1,
                body_bytes,
                wire_bytes: wire,
            });
        }
        let declared_size = declared.map_or(-1, |d| d as i64);
        let (frames, wire, encoder) =
            self.stream_large(
                header,
                head,
                encoder,
                declared_size,
                true,
                credits,
                cancel,
                &mut emit,
            )?;
        Ok(SendOutcome {
            large: true,
            compressed: true,
            frames,
            body_bytes: encoder.get_ref().consumed(),
            wire_bytes: wire,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_large<R, F, E>(
        &self,
        header: MessageHeader,
        head: Vec<u8>,
        rest: R,
        declared_size: i64,
        compressed: bool,
        credits: &CreditWindow,
        cancel: &CloseHandle,
        emit: &mut F,
    ) -> Result<(u32, u64, R), E>
    where
        R: Read,
        F: FnMut(Frame) -> Result<(), E>,
        E: From<StreamError>,
    {
        let message_id = header.id;
        let chunk_size = self.config.chunk_size;
        debug!(message_id, declared_size, compressed, "sending large message");
        emit(Frame::LargeInit(LargeInit {
            header,
            declared_size,
            compressed,
        }))?;

        let mut reader = Cursor::new(head).chain(rest);
        let mut frames = 1u32;
        let mut wire = 0u64;
        let mut seq = 0u32;
        let mut current = read_up_to(&mut reader, chunk_size, cancel)?;
        loop {
            if cancel.is_closed() {
                return Err(StreamError::Cancelled.into());
            }
            let next = if current.len() == chunk_size {
                read_up_to(&mut reader, chunk_size, cancel)?
            } else {
                Vec::new()
            };
            let is_last = next.is_empty();
            credits.acquire(current.len(), self.config.credit_timeout)?;
            wire += current.len() as u64;
            emit(Frame::LargeChunk(LargeChunk {
                message_id,
                seq,
                payload: Bytes::from(current),
                is_last,
            }))?;
            frames += 1;
            seq += 1;
            if is_last {
                break;
            }
            current = next;
        }
        let (_, rest) = reader.into_inner();
        Ok((frames, wire, rest))
    }
}

/// Read until `limit` bytes or EOF.
fn read_up_to<R: Read>(
    reader: &mut R,
    limit: usize,
    cancel: &CloseHandle,
) -> Result<Vec<u8>, StreamError> {
    const STEP: usize = 64 * 1024;
    let mut buf = Vec::with_capacity(limit.min(STEP));
    let mut scratch = vec![0u8; limit.min(STEP).max(1)];
    while buf.len() < limit {
        if cancel.is_closed() {
            return Err(StreamError::Cancelled);
        }
        let want = (limit - buf.len()).min(scratch.len());
        match reader.read(&mut scratch[..want]) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StreamError::from_io(e)),
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::stream::{BytesSource, ReaderSource};
    use flate2::read::DeflateDecoder;

    fn framer(threshold: usize, chunk: usize, compress: bool) -> LargeMessageFramer {
        LargeMessageFramer::new(FramerConfig {
            min_large_message_size: threshold,
            chunk_size: chunk,
            compress,
            credit_timeout: Duration::from_secs(5),
        })
    }

    fn collect(
        framer: &LargeMessageFramer,
        source: Box<dyn BodySource>,
    ) -> (SendOutcome, Vec<Frame>) {
        let credits = CreditWindow::new(1024);
        let mut frames = Vec::new();
        let outcome = framer
            .send::<_, StreamError>(
                MessageHeader::default(),
                source,
                &credits,
                &CloseHandle::default(),
                |frame| {
                    if let Frame::LargeChunk(chunk) = &frame {
                        credits.replenish(chunk.payload.len());
                    }
                    frames.push(frame);
                    Ok(())
                },
            )
            .unwrap();
        (outcome, frames)
    }

    #[test]
    fn test_threshold_sized_body_is_inline() {
        let framer = framer(100, 32, false);
        let (outcome, frames) = collect(&framer, Box::new(BytesSource::new(vec![1u8; 100])));
        assert!(!outcome.large);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Inline(f) if f.payload.len() == 100 && !f.compressed));
    }

    #[test]
    fn test_one_past_threshold_is_large() {
        let framer = framer(100, 32, false);
        let (outcome, frames) = collect(&framer, Box::new(BytesSource::new(vec![1u8; 101])));
        assert!(outcome.large);
        assert_eq!(outcome.body_bytes, 101);
        let inits = frames.iter().filter(|f| matches!(f, Frame::LargeInit(_))).count();
        assert_eq!(inits, 1);
        // 32 + 32 + 32 + 5
        assert_eq!(frames.len(), 5);
        match frames.last() {
            Some(Frame::LargeChunk(c)) => {
                assert!(c.is_last);
                assert_eq!(c.seq, 3);
                assert_eq!(c.payload.len(), 5);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_unknown_size_stream_is_classified_by_reading() {
        let framer = framer(64, 16, false);
        let source = ReaderSource::new(io::repeat(3).take(64));
        let (outcome, _) = collect(&framer, Box::new(source));
        assert!(!outcome.large);

        let source = ReaderSource::new(io::repeat(3).take(65));
        let (outcome, frames) = collect(&framer, Box::new(source));
        assert!(outcome.large);
        assert!(matches!(&frames[0], Frame::LargeInit(init) if init.declared_size == -1));
    }

    #[test]
    fn test_compressible_body_downgrades_to_inline() {
        let framer = framer(4096, 256, true);
        let source = ReaderSource::new(io::repeat(b' ').take(1_000_000));
        let (outcome, frames) = collect(&framer, Box::new(source));
        assert!(!outcome.large && outcome.compressed);
        assert_eq!(outcome.frames, 1);
        assert_eq!(outcome.body_bytes, 1_000_000);
        let Frame::Inline(inline) = &frames[0] else {
            panic!("expected inline frame");
        };
        let mut restored = Vec::new();
        DeflateDecoder::new(&inline.payload[..])
            .read_to_end(&mut restored)
            .unwrap();
        assert_eq!(restored.len(), 1_000_000);
        assert!(restored.iter().all(|b| *b == b' '));
    }

    #[test]
    fn test_incompressible_body_streams_compressed_chunks() {
        let body: Vec<u8> = (0..50_000u64)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let framer = framer(1024, 4096, true);
        let (outcome, frames) = collect(&framer, Box::new(BytesSource::new(body.clone())));
        assert!(outcome.large && outcome.compressed);
        let compressed: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::LargeChunk(c) => Some(c.payload.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        let mut restored = Vec::new();
        DeflateDecoder::new(&compressed[..])
            .read_to_end(&mut restored)
            .unwrap();
        assert_eq!(restored, body);
    }

    #[test]
    fn test_cancelled_send_stops() {
        let framer = framer(10, 4, false);
        let credits = CreditWindow::new(64);
        let cancel = CloseHandle::default();
        cancel.close();
        let result = framer.send::<_, StreamError>(
            MessageHeader::default(),
            Box::new(BytesSource::new(vec![0u8; 100])),
            &credits,
            &cancel,
            |_| Ok(()),
        );
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }
}
