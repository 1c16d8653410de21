//! Randomised invariants over reader commit/checkpoint state.

use std::collections::BTreeSet;

use journal::{Journal, JournalConfig, SyncPolicy};
use proptest::prelude::*;

fn open(dir: &std::path::Path, queue: &str) -> Journal {
    Journal::open(queue, JournalConfig::from_dir(dir).sync_policy(SyncPolicy::Always).build()).unwrap()
}

proptest! {
    /// Across any permutation of commits, `head` only increases and every surviving done-set
    /// member stays strictly greater than `head + 1`.
    #[test]
    fn head_monotonic_and_done_set_disjoint(ids in prop::collection::vec(1u64..200, 1..150)) {
        let mut ids: Vec<u64> = ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        // Shuffle deterministically from the proptest-generated order itself (already arbitrary
        // relative to sorted order since input is a Vec, not a BTreeSet, before dedup above).
        ids.reverse();

        let dir = tempfile::tempdir().unwrap();
        let journal = open(dir.path(), "q");
        for &id in &ids {
            journal.append(journal::Item { id, add_time: 0, expire_time: None, data: Vec::new() }).ok();
        }
        let reader = journal.reader("r1", 0).unwrap();

        let mut prev_head = 0;
        for &id in &ids {
            if id <= reader.head() || reader.done_set().contains(&id) {
                continue;
            }
            reader.commit(id).unwrap();

            let head = reader.head();
            prop_assert!(head >= prev_head, "head must never decrease");
            prev_head = head;

            for d in reader.done_set() {
                prop_assert!(d > head + 1, "done-set member {} must exceed head+1 ({})", d, head + 1);
            }
        }
    }

    /// Checkpointing then replaying a reader's state file restores the same `(head, done_set)`.
    #[test]
    fn checkpoint_round_trips_arbitrary_state(
        head in 0u64..500,
        extra_done in prop::collection::btree_set(600u64..1000, 0..20),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(dir.path(), "q");
        let reader = journal.reader("r1", 0).unwrap();

        reader.set_head(head);
        for &id in &extra_done {
            reader.commit(id).unwrap();
        }
        journal.checkpoint().unwrap();

        let reopened = open(dir.path(), "q");
        let restored = reopened.reader("r1", 0).unwrap();

        prop_assert_eq!(restored.head(), head);
        prop_assert_eq!(restored.done_set(), extra_done);
    }
}

/// Commit coalescing on the specific permutation called out in the design doc.
#[test]
fn commit_permutation_coalesces_to_contiguous_head() {
    let dir = tempfile::tempdir().unwrap();
    let journal = open(dir.path(), "q");
    for id in 1..=5 {
        journal
            .append(journal::Item { id, add_time: 0, expire_time: None, data: Vec::new() })
            .unwrap();
    }
    let reader = journal.reader("r1", 0).unwrap();

    for id in [3, 5, 4, 2, 1] {
        reader.commit(id).unwrap();
    }

    assert_eq!(reader.head(), 5);
    assert!(reader.done_set().is_empty());
}
