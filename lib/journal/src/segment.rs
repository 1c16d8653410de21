//! A single segment file: an append-only, forward-only stream of [`Record`]s with a magic/version
//! header, used for both writer segments (`Q.<ts>`, `Put`-only) and reader state files
//! (`Q.read.<name>`, `ReadHead`/`ReadDone`-only).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, trace};

use crate::config::SyncPolicy;
use crate::error::SegmentError;
use crate::record::{self, Record};

fn io_err(path: &Path, source: std::io::Error) -> SegmentError {
    SegmentError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Append-only writer over a single segment file.
///
/// Writes land in the OS page cache immediately; durability is only guaranteed after the next
/// sync tick (per `sync_policy`) or an explicit [`SegmentWriter::flush`].
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    file: File,
    len: u64,
    sync_policy: SyncPolicy,
    dirty_since: Option<Instant>,
}

impl SegmentWriter {
    /// Opens `path` for append, creating it (and writing the header) if it doesn't exist yet.
    /// Validates the header and seeks to end-of-file if it does.
    pub fn create_or_open(
        path: impl Into<PathBuf>,
        sync_policy: SyncPolicy,
    ) -> Result<Self, SegmentError> {
        Self::open_with(path, sync_policy, false)
    }

    /// Always recreates `path` from scratch, discarding any existing contents. Used by reader
    /// state checkpointing, which rewrites its sibling `~~` file wholesale on every call.
    pub fn create_truncated(
        path: impl Into<PathBuf>,
        sync_policy: SyncPolicy,
    ) -> Result<Self, SegmentError> {
        Self::open_with(path, sync_policy, true)
    }

    fn open_with(
        path: impl Into<PathBuf>,
        sync_policy: SyncPolicy,
        truncate: bool,
    ) -> Result<Self, SegmentError> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(truncate)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let len = file.metadata().map_err(|e| io_err(&path, e))?.len();

        if len == 0 {
            record::write_header(&mut file).map_err(|e| io_err(&path, e))?;
            file.sync_all().map_err(|e| io_err(&path, e))?;
        } else {
            file.seek(SeekFrom::Start(0)).map_err(|e| io_err(&path, e))?;
            record::read_header(&mut file).map_err(|e| SegmentError::BadHeader {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }

        let len = file.seek(SeekFrom::End(0)).map_err(|e| io_err(&path, e))?;

        debug!(path = %path.display(), len, "opened segment for append");

        Ok(Self {
            path,
            file,
            len,
            sync_policy,
            dirty_since: None,
        })
    }

    /// Byte length of the segment, including the header.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == record::HEADER_LEN
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `record`, encoding it first. Returns the number of bytes written (including
    /// framing). Does not guarantee durability; see [`SegmentWriter::flush`] and `sync_policy`.
    pub fn append(&mut self, record: &Record, max_record_size: usize) -> Result<u64, SegmentError> {
        let frame = record::encode_record(record, max_record_size)?;
        self.file.write_all(&frame).map_err(|e| io_err(&self.path, e))?;
        self.len += frame.len() as u64;

        if self.dirty_since.is_none() {
            self.dirty_since = Some(Instant::now());
        }

        match self.sync_policy {
            SyncPolicy::Always => self.flush()?,
            SyncPolicy::Interval(interval) => {
                if self.dirty_since.map(|t| t.elapsed() >= interval).unwrap_or(false) {
                    self.flush()?;
                }
            }
            SyncPolicy::Never => {}
        }

        Ok(frame.len() as u64)
    }

    /// Forces a durable `fsync` of any unsynced writes, regardless of `sync_policy`.
    pub fn flush(&mut self) -> Result<(), SegmentError> {
        self.file.sync_data().map_err(|e| io_err(&self.path, e))?;
        self.dirty_since = None;
        trace!(path = %self.path.display(), "synced segment");
        Ok(())
    }

    /// Flushes and drops the underlying file handle.
    pub fn close(mut self) -> Result<(), SegmentError> {
        self.flush()
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.dirty_since.is_some() {
            let _ = self.file.sync_data();
        }
    }
}

/// Forward-only reader over a single segment file.
#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,
    file: BufReader<File>,
    offset: u64,
}

impl SegmentReader {
    /// Opens `path` for reading, validating its header and positioning just past it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SegmentError> {
        let path = path.into();
        let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
        record::read_header(&mut file).map_err(|e| SegmentError::BadHeader {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            path,
            file: BufReader::new(file),
            offset: record::HEADER_LEN,
        })
    }

    /// Seeks to the given absolute byte offset, which must point at a record boundary (typically
    /// one previously returned by this reader, or `HEADER_LEN`).
    pub fn seek_to(&mut self, offset: u64) -> Result<(), SegmentError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| io_err(&self.path, e))?;
        self.offset = offset;
        Ok(())
    }

    /// Byte offset of the next record to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the next record, or `None` at end-of-stream (including a truncated tail record,
    /// which is not treated as an error -- see [`record::decode_record`]).
    pub fn next(&mut self) -> Result<Option<Record>, SegmentError> {
        let start = self.offset;
        match record::decode_record(&mut self.file, start) {
            Ok(Some((rec, consumed))) => {
                self.offset += consumed;
                Ok(Some(rec))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(SegmentError::Codec(e)),
        }
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Item;

    fn item(id: u64) -> Record {
        Record::Put(Item {
            id,
            add_time: 1_700_000_000_000,
            expire_time: None,
            data: format!("item-{id}").into_bytes(),
        })
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.100");

        let mut writer = SegmentWriter::create_or_open(&path, SyncPolicy::Always).unwrap();
        for id in 1..=5 {
            writer.append(&item(id), 1024).unwrap();
        }
        writer.close().unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some(Record::Put(it)) = reader.next().unwrap() {
            seen.push(it.id);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn truncated_tail_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.100");

        let mut writer = SegmentWriter::create_or_open(&path, SyncPolicy::Always).unwrap();
        writer.append(&item(1), 1024).unwrap();
        writer.append(&item(2), 1024).unwrap();
        writer.close().unwrap();

        // Chop off the last byte of the file, landing in the middle of record 2's frame.
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 1).unwrap();
        drop(file);

        let mut reader = SegmentReader::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some(Record::Put(it)) = reader.next().unwrap() {
            seen.push(it.id);
        }
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn reopen_for_append_seeks_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.100");

        let mut writer = SegmentWriter::create_or_open(&path, SyncPolicy::Always).unwrap();
        writer.append(&item(1), 1024).unwrap();
        drop(writer);

        let mut writer = SegmentWriter::create_or_open(&path, SyncPolicy::Always).unwrap();
        writer.append(&item(2), 1024).unwrap();
        writer.close().unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some(Record::Put(it)) = reader.next().unwrap() {
            seen.push(it.id);
        }
        assert_eq!(seen, vec![1, 2]);
    }
}
