//! Ordered mapping from a segment's first item id to that segment's file, rebuilt once at journal
//! open and thereafter kept as an immutable, copy-on-write snapshot.
//!
//! Mutations (segment rotation, truncation) are rare; lookups (`file_for_id`, called on every
//! read-behind transition) are frequent, so this mirrors the copy-on-write discipline the teacher
//! expresses with an atomic pointer swap over `Ledger` state, adapted to plain
//! `std::sync::{RwLock, Arc}` since this crate has no async runtime to lean on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::error::JournalError;
use crate::record::Record;
use crate::segment::SegmentReader;

/// Snapshot of the id index: first-item-id -> segment path, ordered ascending.
pub type IndexSnapshot = Arc<BTreeMap<u64, PathBuf>>;

/// Copy-on-write id index.
#[derive(Debug)]
pub struct IdIndex {
    inner: RwLock<IndexSnapshot>,
}

impl IdIndex {
    /// Builds the index by opening every `<queue_name>.<digits>` file in `dir` and reading its
    /// first record. Files whose first record isn't a `Put`, or that fail to open at all, are
    /// logged and skipped -- startup scanning is lenient (§7).
    pub fn build(segment_paths: impl IntoIterator<Item = PathBuf>) -> Result<Self, JournalError> {
        let mut map = BTreeMap::new();

        for path in segment_paths {
            match first_put_id(&path) {
                Ok(Some(id)) => {
                    map.insert(id, path);
                }
                Ok(None) => {
                    warn!(path = %path.display(), "segment's first record is not a Put; skipping");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to scan segment; skipping");
                }
            }
        }

        Ok(Self {
            inner: RwLock::new(Arc::new(map)),
        })
    }

    /// Returns the segment whose first id is the greatest key `≤ id`, if any.
    pub fn file_for_id(&self, id: u64) -> Option<PathBuf> {
        let snapshot = self.snapshot();
        snapshot.range(..=id).next_back().map(|(_, path)| path.clone())
    }

    /// Returns the segment whose first id equals `id` exactly, if any.
    pub fn file_starting_at(&self, id: u64) -> Option<PathBuf> {
        let snapshot = self.snapshot();
        snapshot.get(&id).cloned()
    }

    /// A cheap, lock-free-after-clone read of the current mapping.
    pub fn snapshot(&self) -> IndexSnapshot {
        self.inner.read().expect("id index lock poisoned").clone()
    }

    /// Publishes `first_id -> path` as part of the index, replacing the whole map wholesale.
    pub fn insert_segment(&self, first_id: u64, path: PathBuf) {
        let mut guard = self.inner.write().expect("id index lock poisoned");
        let mut next = BTreeMap::clone(&guard);
        next.insert(first_id, path);
        *guard = Arc::new(next);
    }

    /// Removes every segment whose first id is `< through_first_id`, used when segments have been
    /// deleted by truncation.
    pub fn remove_through(&self, through_first_id: u64) {
        let mut guard = self.inner.write().expect("id index lock poisoned");
        let next: BTreeMap<_, _> = guard
            .iter()
            .filter(|(first_id, _)| **first_id >= through_first_id)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        *guard = Arc::new(next);
    }

    /// Sum of the byte lengths of every indexed segment file.
    pub fn total_size(&self) -> std::io::Result<u64> {
        let snapshot = self.snapshot();
        let mut total = 0u64;
        for path in snapshot.values() {
            total += std::fs::metadata(path)?.len();
        }
        Ok(total)
    }
}

fn first_put_id(path: &Path) -> Result<Option<u64>, JournalError> {
    let mut reader = SegmentReader::open(path)?;
    match reader.next()? {
        Some(Record::Put(item)) => Ok(Some(item.id)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncPolicy;
    use crate::record::Item;
    use crate::segment::SegmentWriter;

    fn write_segment(path: &Path, ids: impl IntoIterator<Item = u64>) {
        let mut w = SegmentWriter::create_or_open(path, SyncPolicy::Always).unwrap();
        for id in ids {
            w.append(
                &Record::Put(Item {
                    id,
                    add_time: 0,
                    expire_time: None,
                    data: Vec::new(),
                }),
                1024,
            )
            .unwrap();
        }
        w.close().unwrap();
    }

    #[test]
    fn file_for_id_picks_floor_segment() {
        let dir = tempfile::tempdir().unwrap();
        let seg100 = dir.path().join("q.100");
        let seg200 = dir.path().join("q.200");
        write_segment(&seg100, 1..=5);
        write_segment(&seg200, 6..=10);

        let index = IdIndex::build(vec![seg100.clone(), seg200.clone()]).unwrap();

        assert_eq!(index.file_for_id(7), Some(seg200.clone()));
        assert_eq!(index.file_for_id(5), Some(seg100.clone()));
        assert_eq!(index.file_for_id(0), None);
        assert_eq!(index.file_for_id(10), Some(seg200));
    }

    #[test]
    fn bad_header_segment_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("q.999");
        std::fs::write(&bad, b"not a segment").unwrap();

        let index = IdIndex::build(vec![bad]).unwrap();
        assert_eq!(index.file_for_id(1), None);
    }
}
