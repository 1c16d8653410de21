//! The `Journal` façade: owns a queue's writer segment, id index, and the set of registered
//! readers, and exposes the operations a queue implementation builds its durability story on top
//! of.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, instrument, warn};

use crate::config::JournalConfig;
use crate::error::JournalError;
use crate::index::IdIndex;
use crate::reader::Reader;
use crate::record::{Item, Record};
use crate::segment::SegmentWriter;

type ReaderMap = Arc<HashMap<String, Arc<Reader>>>;

/// Shared state behind every `Arc<JournalInner>` a `Journal` and its `Reader`s hold a reference
/// to. `Reader` keeps a `Weak` back-reference to this so it can resolve ids against the id index
/// without the journal itself needing to mediate every read-behind call.
pub(crate) struct JournalInner {
    queue_name: String,
    dir: PathBuf,
    config: JournalConfig,
    pub(crate) index: IdIndex,
    writer: RwLock<SegmentWriter>,
    readers: RwLock<ReaderMap>,
}

/// A durable, append-only journal for one queue.
///
/// Cloning a `Journal` is cheap and shares the same underlying segments and readers -- it is an
/// `Arc` handle, mirroring the teacher's `Writer`/`Reader` pair sharing one `Ledger`.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<JournalInner>,
}

fn segment_file_name(queue_name: &str, first_id: u64) -> String {
    format!("{queue_name}.{first_id}")
}

fn reader_file_name(queue_name: &str, reader_name: &str) -> String {
    format!("{queue_name}.read.{reader_name}")
}

/// Parses a writer segment's first-item-id out of a `<queue_name>.<digits>` file name, rejecting
/// reader state files (`<queue_name>.read.<name>`) and transient checkpoint files (anything
/// containing `~~`).
fn parse_segment_first_id(queue_name: &str, file_name: &str) -> Option<u64> {
    if file_name.contains("~~") {
        return None;
    }
    let rest = file_name.strip_prefix(queue_name)?.strip_prefix('.')?;
    if rest.starts_with("read.") {
        return None;
    }
    rest.parse().ok()
}

/// Parses a reader name out of a `<queue_name>.read.<name>` file name.
fn parse_reader_name(queue_name: &str, file_name: &str) -> Option<String> {
    if file_name.contains("~~") {
        return None;
    }
    let rest = file_name.strip_prefix(queue_name)?.strip_prefix('.')?;
    rest.strip_prefix("read.").map(ToString::to_string)
}

impl Journal {
    /// Opens (or creates) the journal for `queue_name` rooted at `config.dir()`, scanning the
    /// directory for existing writer segments to rebuild the id index and opening the most recent
    /// one (by first-item-id) for append, creating a fresh initial segment if none exist.
    #[instrument(skip(config), fields(queue = %queue_name))]
    pub fn open(queue_name: &str, config: JournalConfig) -> Result<Self, JournalError> {
        let queue_name = queue_name.to_string();
        let dir = config.dir().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segment_paths = Vec::new();
        let mut reader_names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if parse_segment_first_id(&queue_name, &file_name).is_some() {
                segment_paths.push(dir.join(file_name.as_ref()));
            } else if let Some(reader_name) = parse_reader_name(&queue_name, &file_name) {
                reader_names.push(reader_name);
            }
        }

        let index = IdIndex::build(segment_paths)?;

        // Only a segment that made it into the index passed header validation; picking the
        // writer's append target from the raw directory listing instead could hand a corrupt
        // file to `SegmentWriter`, which requires a valid header to open.
        let latest_segment = index.snapshot().iter().next_back().map(|(_, path)| path.clone());

        let writer = match latest_segment {
            Some(path) => SegmentWriter::create_or_open(path, config.sync_policy())?,
            None => {
                let path = dir.join(segment_file_name(&queue_name, 1));
                let writer = SegmentWriter::create_or_open(&path, config.sync_policy())?;
                index.insert_segment(1, path);
                writer
            }
        };

        info!(
            segments = index.snapshot().len(),
            readers = reader_names.len(),
            "opened journal"
        );

        let inner = Arc::new(JournalInner {
            queue_name,
            dir,
            config,
            index,
            writer: RwLock::new(writer),
            readers: RwLock::new(Arc::new(HashMap::new())),
        });

        let mut readers = HashMap::with_capacity(reader_names.len());
        for name in reader_names {
            let state_path = inner.dir.join(reader_file_name(&inner.queue_name, &name));
            let reader = Arc::new(Reader::new(name.clone(), state_path, Arc::downgrade(&inner), 0));
            if let Err(e) = reader.read_state() {
                warn!(reader = %name, error = %e, "failed to replay reader state; dropping reader");
                continue;
            }
            readers.insert(name, reader);
        }
        *inner.readers.write().expect("readers lock poisoned") = Arc::new(readers);

        Ok(Self { inner })
    }

    /// Lists every queue name present in `dir`, identified by the prefix before the first `.` of
    /// each filename (covering both writer segments and reader state files), ignoring transient
    /// `~~` rewrite files.
    pub fn queue_names_from_dir(dir: impl AsRef<Path>) -> Result<Vec<String>, JournalError> {
        let mut names = std::collections::BTreeSet::new();
        for entry in fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.contains("~~") {
                continue;
            }
            if let Some((name, _rest)) = file_name.split_once('.') {
                names.insert(name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Appends `item` to the writer segment, returning the number of bytes written.
    #[instrument(skip(self, item), fields(queue = %self.inner.queue_name, id = item.id))]
    pub fn append(&self, item: Item) -> Result<u64, JournalError> {
        let mut writer = self.inner.writer.write().expect("writer lock poisoned");
        let written = writer.append(&Record::Put(item), self.inner.config.max_record_size())?;
        Ok(written)
    }

    /// Forces a durable sync of the writer segment, bypassing `sync_policy`.
    pub fn flush(&self) -> Result<(), JournalError> {
        self.inner.writer.write().expect("writer lock poisoned").flush()?;
        Ok(())
    }

    /// Returns the path of the segment whose first item id is the greatest `≤ id`, if any.
    pub fn file_for_id(&self, id: u64) -> Option<PathBuf> {
        self.inner.index.file_for_id(id)
    }

    /// Total on-disk size, in bytes, of every live writer segment.
    pub fn archive_size(&self) -> Result<u64, JournalError> {
        Ok(self.inner.index.total_size()?)
    }

    /// Returns the reader named `name`, creating it if this is the first call for that name.
    ///
    /// A fresh reader replays its checkpoint file if one already exists on disk, or starts at
    /// `initial_head` otherwise; `initial_head` is ignored when the reader already exists (either
    /// already registered in this process, or restored from a prior `commit`/`checkpoint`).
    ///
    /// Uncontended lookups of an already-registered reader never take the insertion mutex: the
    /// reader map is read first as a lock-free `Arc` clone, and the mutex guarding insertion is
    /// only acquired on the slow path, double-checking under it in case of a race.
    #[instrument(skip(self), fields(queue = %self.inner.queue_name, reader = %name))]
    pub fn reader(&self, name: &str, initial_head: u64) -> Result<Arc<Reader>, JournalError> {
        if let Some(reader) = self.get_reader(name) {
            return Ok(reader);
        }

        let mut readers = self.inner.readers.write().expect("readers lock poisoned");
        if let Some(reader) = readers.get(name) {
            return Ok(reader.clone());
        }

        let state_path = self.inner.dir.join(reader_file_name(&self.inner.queue_name, name));
        let reader = Arc::new(Reader::new(
            name.to_string(),
            state_path,
            Arc::downgrade(&self.inner),
            initial_head,
        ));
        reader.read_state()?;

        let mut next = HashMap::clone(&readers);
        next.insert(name.to_string(), reader.clone());
        *readers = Arc::new(next);

        Ok(reader)
    }

    /// Returns the registered reader named `name`, if any.
    pub fn get_reader(&self, name: impl AsRef<str>) -> Option<Arc<Reader>> {
        self.inner
            .readers
            .read()
            .expect("readers lock poisoned")
            .get(name.as_ref())
            .cloned()
    }

    /// Checkpoints every registered reader. A failure for one reader does not stop the others from
    /// being attempted; the first error encountered, if any, is returned after all have run.
    pub fn checkpoint(&self) -> Result<(), JournalError> {
        let readers = self.inner.readers.read().expect("readers lock poisoned").clone();
        let mut first_err = None;
        for (name, reader) in readers.iter() {
            if let Err(e) = reader.checkpoint() {
                warn!(reader = %name, error = %e, "checkpoint failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Closes the current writer segment and opens a fresh one whose first id is `next_id`,
    /// publishing it into the id index before returning.
    #[instrument(skip(self), fields(queue = %self.inner.queue_name))]
    pub fn rotate(&self, next_id: u64) -> Result<(), JournalError> {
        let path = self.inner.dir.join(segment_file_name(&self.inner.queue_name, next_id));
        let new_writer = SegmentWriter::create_or_open(&path, self.inner.config.sync_policy())?;

        let mut writer = self.inner.writer.write().expect("writer lock poisoned");
        let old = std::mem::replace(&mut *writer, new_writer);
        old.close()?;

        self.inner.index.insert_segment(next_id, path);
        debug!(next_id, "rotated to new segment");
        Ok(())
    }

    /// Deletes every writer segment whose first item id is `< through_id`, removing them from the
    /// id index first so no reader can be handed a path to a file about to disappear.
    #[instrument(skip(self), fields(queue = %self.inner.queue_name))]
    pub fn truncate_through(&self, through_id: u64) -> Result<(), JournalError> {
        let snapshot = self.inner.index.snapshot();
        let to_remove: Vec<PathBuf> = snapshot
            .range(..through_id)
            .map(|(_, path)| path.clone())
            .collect();

        self.inner.index.remove_through(through_id);

        for path in to_remove {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove truncated segment");
            }
        }
        Ok(())
    }

    /// Flushes the writer segment and checkpoints every registered reader.
    pub fn close(&self) -> Result<(), JournalError> {
        self.flush()?;
        self.checkpoint()
    }
}
