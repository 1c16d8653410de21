//! Per-reader checkpoint state: the head pointer, the out-of-order done-set, and the optional
//! read-behind cursor that lets a reader stream items directly from segment files instead of the
//! in-memory tail the journal's external collaborator owns.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Mutex, Weak};

use tracing::{instrument, trace, warn};

use crate::config::SyncPolicy;
use crate::error::ReaderStateError;
use crate::journal::JournalInner;
use crate::record::{Item, Record};
use crate::segment::{SegmentReader, SegmentWriter};

/// `(head, done_set)` observable at a single instant -- the unit a checkpoint snapshots and the
/// unit `read_state` restores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitState {
    pub head: u64,
    pub done_set: BTreeSet<u64>,
}

impl CommitState {
    fn new(initial_head: u64) -> Self {
        Self {
            head: initial_head,
            done_set: BTreeSet::new(),
        }
    }
}

struct ReadBehindCursor {
    segment: SegmentReader,
    last_yielded_id: u64,
}

/// A single named reader's durable progress through a queue.
///
/// `commit`, `set_head`, `start_read_behind`, `next_read_behind`, and `end_read_behind` all require
/// external serialization -- exactly one consumer thread may call them for a given `Reader` at a
/// time. `checkpoint` is the exception: it may run concurrently with any of the above, since it
/// only ever takes the commit-state lock long enough to clone it before doing I/O.
pub struct Reader {
    name: String,
    state_path: PathBuf,
    journal: Weak<JournalInner>,
    commit_state: Mutex<CommitState>,
    read_behind: Mutex<Option<ReadBehindCursor>>,
}

impl Reader {
    pub(crate) fn new(name: String, state_path: PathBuf, journal: Weak<JournalInner>, initial_head: u64) -> Self {
        Self {
            name,
            state_path,
            journal,
            commit_state: Mutex::new(CommitState::new(initial_head)),
            read_behind: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every id `≤ head` has been durably consumed by this reader.
    pub fn head(&self) -> u64 {
        self.commit_state.lock().expect("commit state lock poisoned").head
    }

    /// Ids strictly greater than `head + 1` that have been acknowledged out of order.
    pub fn done_set(&self) -> BTreeSet<u64> {
        self.commit_state
            .lock()
            .expect("commit state lock poisoned")
            .done_set
            .clone()
    }

    /// Forces `head` forward to `id`, dropping any done ids it now subsumes, then keeps absorbing
    /// any done ids that are now contiguous with the new head -- same coalescing `commit` does, so
    /// `head + 1` is never left sitting in `done_set`.
    pub fn set_head(&self, id: u64) {
        let mut state = self.commit_state.lock().expect("commit state lock poisoned");
        state.head = id;
        state.done_set.retain(|d| *d > id);
        while state.done_set.remove(&(state.head + 1)) {
            state.head += 1;
        }
    }

    /// Acknowledges `id`.
    ///
    /// If `id` is exactly `head + 1`, `head` advances to `id` and then keeps absorbing any
    /// already-done ids that are now contiguous. Otherwise `id` is recorded in the done-set to be
    /// absorbed later.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderStateError::ProtocolMisuse`] if `id ≤ head` or `id` is already in the
    /// done-set -- both are contract violations by the caller, not recoverable conditions.
    #[instrument(skip(self), fields(reader = %self.name), level = "trace")]
    pub fn commit(&self, id: u64) -> Result<(), ReaderStateError> {
        let mut state = self.commit_state.lock().expect("commit state lock poisoned");

        if id <= state.head {
            return Err(ReaderStateError::ProtocolMisuse(format!(
                "commit({id}) but head is already {}",
                state.head
            )));
        }
        if state.done_set.contains(&id) {
            return Err(ReaderStateError::ProtocolMisuse(format!(
                "commit({id}) but {id} is already in the done-set"
            )));
        }

        if id == state.head + 1 {
            state.head = id;
            while state.done_set.remove(&(state.head + 1)) {
                state.head += 1;
            }
        } else {
            state.done_set.insert(id);
        }

        trace!(head = state.head, done_set_len = state.done_set.len(), "committed");
        Ok(())
    }

    /// Replays this reader's on-disk state file, if any, applying each `ReadHead` as the absolute
    /// head (last one wins) and each `ReadDone` as a full replacement of the done-set.
    pub(crate) fn read_state(&self) -> Result<(), ReaderStateError> {
        if !self.state_path.exists() {
            return Ok(());
        }

        let mut reader = SegmentReader::open(&self.state_path)?;
        let mut head = None;
        let mut done_set = BTreeSet::new();

        while let Some(record) = reader.next()? {
            match record {
                Record::ReadHead(id) => head = Some(id),
                Record::ReadDone(ids) => done_set = ids.into_iter().collect(),
                Record::Put(_) => {
                    return Err(ReaderStateError::ProtocolMisuse(
                        "reader state file contains a Put record".to_string(),
                    ))
                }
            }
        }

        if let Some(head) = head {
            let mut state = self.commit_state.lock().expect("commit state lock poisoned");
            state.head = head;
            state.done_set = done_set;
        }
        Ok(())
    }

    /// Atomically rewrites this reader's state file from a consistent snapshot of `(head,
    /// done_set)`. Algorithm: write a fresh sibling `<name>~~` file, sync and close it, then
    /// `rename` it over the original -- the rename is what publishes the new state, so a crash
    /// between the write and the rename leaves the previous valid file untouched.
    #[instrument(skip(self), fields(reader = %self.name), level = "debug")]
    pub fn checkpoint(&self) -> Result<(), ReaderStateError> {
        let snapshot = self.commit_state.lock().expect("commit state lock poisoned").clone();

        let mut tmp_path = self.state_path.clone();
        tmp_path.set_file_name(format!(
            "{}~~",
            self.state_path.file_name().unwrap().to_string_lossy()
        ));

        let mut writer = SegmentWriter::create_truncated(&tmp_path, SyncPolicy::Always)?;
        writer.append(&Record::ReadHead(snapshot.head), usize::MAX)?;
        writer.append(
            &Record::ReadDone(snapshot.done_set.into_iter().collect()),
            usize::MAX,
        )?;
        writer.close()?;

        std::fs::rename(&tmp_path, &self.state_path)?;
        trace!("checkpoint published");
        Ok(())
    }

    /// Enters read-behind mode, positioned just before item `id` so the next
    /// [`Reader::next_read_behind`] call yields it.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderStateError::ProtocolMisuse`] if already in read-behind, or
    /// [`ReaderStateError::UnknownId`] if `id` precedes the earliest live segment or the segment
    /// that should contain it ends before `id` is found.
    pub fn start_read_behind(&self, id: u64) -> Result<(), ReaderStateError> {
        let mut cursor = self.read_behind.lock().expect("read-behind lock poisoned");
        if cursor.is_some() {
            return Err(ReaderStateError::ProtocolMisuse(
                "start_read_behind called while already in read-behind".to_string(),
            ));
        }

        let journal = self.journal.upgrade().expect("reader outlived its journal");
        let path = journal.index.file_for_id(id).ok_or(ReaderStateError::UnknownId(id))?;

        let mut segment = SegmentReader::open(&path)?;
        loop {
            match segment.next()? {
                Some(Record::Put(item)) if item.id == id => {
                    *cursor = Some(ReadBehindCursor {
                        segment,
                        last_yielded_id: id,
                    });
                    return Ok(());
                }
                Some(Record::Put(item)) if item.id > id => {
                    return Err(ReaderStateError::UnknownId(id));
                }
                Some(_) => continue,
                None => return Err(ReaderStateError::UnknownId(id)),
            }
        }
    }

    /// Yields the next item strictly greater in id than the last one returned, transparently
    /// crossing into the next segment when the current one is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderStateError::ProtocolMisuse`] if not currently in read-behind. Returns
    /// [`ReaderStateError::UnknownId`] when no segment holds the next expected id -- this signals
    /// the reader has caught up to the writer and the caller should call
    /// [`Reader::end_read_behind`].
    pub fn next_read_behind(&self) -> Result<Item, ReaderStateError> {
        let mut guard = self.read_behind.lock().expect("read-behind lock poisoned");
        let cursor = guard.as_mut().ok_or_else(|| {
            ReaderStateError::ProtocolMisuse("next_read_behind called outside of read-behind".to_string())
        })?;

        loop {
            match cursor.segment.next()? {
                Some(Record::Put(item)) if item.id > cursor.last_yielded_id => {
                    cursor.last_yielded_id = item.id;
                    return Ok(item);
                }
                Some(_) => continue,
                None => {
                    let next_id = cursor.last_yielded_id + 1;
                    let journal = self.journal.upgrade().expect("reader outlived its journal");
                    match journal.index.file_starting_at(next_id) {
                        Some(path) => {
                            cursor.segment = SegmentReader::open(&path)?;
                        }
                        None => return Err(ReaderStateError::UnknownId(next_id)),
                    }
                }
            }
        }
    }

    /// Exits read-behind mode, closing the open segment.
    pub fn end_read_behind(&self) {
        let mut guard = self.read_behind.lock().expect("read-behind lock poisoned");
        if let Some(cursor) = guard.take() {
            cursor.segment.close();
        } else {
            warn!(reader = %self.name, "end_read_behind called while not in read-behind");
        }
    }

    /// Whether this reader is currently streaming from disk rather than the in-memory tail.
    pub fn is_read_behind(&self) -> bool {
        self.read_behind.lock().expect("read-behind lock poisoned").is_some()
    }
}
