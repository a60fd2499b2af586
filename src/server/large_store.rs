//! On-disk store for large message bodies.
//!
//! One file per message (`<id>.msg`) under the large-messages directory. A
//! file is reference counted by the queues it was routed to and removed when
//! the last reference is acknowledged or dropped, so the directory is empty
//! whenever no large message is in flight.

use crate::messaging::stream::StreamError;
use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const FILE_EXTENSION: &str = "msg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeFileInfo {
    pub message_id: u64,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub struct LargeMessageStore {
    dir: PathBuf,
}

impl LargeMessageStore {
    /// Open the store, creating the directory and deleting files left behind
    /// by a previous run.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let store = Self { dir };
        let orphans = store.list()?;
        if !orphans.is_empty() {
            warn!(
                dir = %store.dir.display(),
                count = orphans.len(),
                "removing unreferenced large message files"
            );
            for orphan in orphans {
                fs::remove_file(&orphan.path)?;
            }
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, message_id: u64) -> PathBuf {
        self.dir.join(format!("{message_id:020}.{FILE_EXTENSION}"))
    }

    pub fn create(
        &self,
        message_id: u64,
        declared_size: i64,
        compressed: bool,
    ) -> Result<LargeMessageWriter, StreamError> {
        let path = self.path_for(message_id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        debug!(message_id, path = %path.display(), "large message file created");
        Ok(LargeMessageWriter {
            message_id,
            path,
            file: Some(BufWriter::new(file)),
            written: 0,
            next_seq: 0,
            declared_size,
            compressed,
        })
    }

    pub fn list(&self) -> Result<Vec<LargeFileInfo>, StreamError> {
        inspect(&self.dir)
    }

    pub fn file_count(&self) -> Result<usize, StreamError> {
        Ok(self.list()?.len())
    }
}

/// List large message files in `dir` without touching them.
pub fn inspect(dir: &Path) -> Result<Vec<LargeFileInfo>, StreamError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
            continue;
        }
        let Some(message_id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        files.push(LargeFileInfo {
            message_id,
            size: entry.metadata()?.len(),
            path,
        });
    }
    files.sort_by_key(|f| f.message_id);
    Ok(files)
}

/// Appends chunks of one incoming large message. Dropping an unfinished
/// writer deletes its file.
#[derive(Debug)]
pub struct LargeMessageWriter {
    message_id: u64,
    path: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
    next_seq: u32,
    declared_size: i64,
    compressed: bool,
}

impl LargeMessageWriter {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn append(&mut self, seq: u32, payload: &[u8]) -> Result<(), StreamError> {
        if seq != self.next_seq {
            return Err(StreamError::OutOfOrder {
                expected: self.next_seq,
                got: seq,
            });
        }
        let file = self.file.as_mut().ok_or(StreamError::StreamClosed)?;
        file.write_all(payload)?;
        self.written += payload.len() as u64;
        self.next_seq += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<Arc<LargeMessageFile>, StreamError> {
        let file = self.file.take().ok_or(StreamError::StreamClosed)?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        Ok(Arc::new(LargeMessageFile {
            message_id: self.message_id,
            path: self.path.clone(),
            stored_size: self.written,
            declared_size: self.declared_size,
            compressed: self.compressed,
            refs: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
        }))
    }
}

impl Drop for LargeMessageWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(
                    message_id = self.message_id,
                    error = %err,
                    "failed to remove aborted large message file"
                );
            } else {
                debug!(message_id = self.message_id, "aborted large message file removed");
            }
        }
    }
}

/// A finished large message body on disk.
#[derive(Debug)]
pub struct LargeMessageFile {
    message_id: u64,
    path: PathBuf,
    stored_size: u64,
    declared_size: i64,
    compressed: bool,
    refs: AtomicUsize,
    deleted: AtomicBool,
}

impl LargeMessageFile {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes on disk (compressed when `is_compressed`).
    pub fn stored_size(&self) -> u64 {
        self.stored_size
    }

    pub fn declared_size(&self) -> i64 {
        self.declared_size
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn add_refs(&self, count: usize) {
        self.refs.fetch_add(count, Ordering::SeqCst);
    }

    /// Drop one reference; the file is deleted with the last one.
    pub fn release(&self) {
        let previous = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.delete();
        }
    }

    pub fn delete(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(message_id = self.message_id, "large message file deleted"),
            Err(err) => warn!(
                message_id = self.message_id,
                error = %err,
                "failed to delete large message file"
            ),
        }
    }

    /// Read up to `max_len` stored bytes at `offset`. The flag is true when
    /// the read reaches the end of the body.
    pub fn read_at(&self, offset: u64, max_len: usize) -> Result<(Bytes, bool), StreamError> {
        if self.is_deleted() {
            return Err(StreamError::StreamClosed);
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let remaining = self.stored_size.saturating_sub(offset);
        let len = remaining.min(max_len as u64) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok((Bytes::from(buf), offset + len as u64 >= self.stored_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_and_release() {
        let dir = tempdir().unwrap();
        let store = LargeMessageStore::open(dir.path()).unwrap();
        let mut writer = store.create(7, 10, false).unwrap();
        writer.append(0, b"hello").unwrap();
        writer.append(1, b"world").unwrap();
        let file = writer.finish().unwrap();
        assert_eq!(file.stored_size(), 10);
        assert_eq!(store.file_count().unwrap(), 1);

        let (first, last) = file.read_at(0, 6).unwrap();
        assert_eq!(&first[..], b"hellow");
        assert!(!last);
        let (rest, last) = file.read_at(6, 6).unwrap();
        assert_eq!(&rest[..], b"orld");
        assert!(last);

        file.add_refs(2);
        file.release();
        assert_eq!(store.file_count().unwrap(), 1);
        file.release();
        assert_eq!(store.file_count().unwrap(), 0);
        assert!(file.read_at(0, 1).is_err());
    }

    #[test]
    fn test_out_of_order_chunk_rejected_and_dropped_writer_cleans_up() {
        let dir = tempdir().unwrap();
        let store = LargeMessageStore::open(dir.path()).unwrap();
        let mut writer = store.create(1, -1, false).unwrap();
        assert!(matches!(
            writer.append(1, b"x"),
            Err(StreamError::OutOfOrder { expected: 0, got: 1 })
        ));
        drop(writer);
        assert_eq!(store.file_count().unwrap(), 0);
    }

    #[test]
    fn test_open_removes_orphans() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("00000000000000000003.msg"), b"left over").unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
        let store = LargeMessageStore::open(dir.path()).unwrap();
        assert_eq!(store.file_count().unwrap(), 0);
        assert!(dir.path().join("notes.txt").exists());
    }
}
