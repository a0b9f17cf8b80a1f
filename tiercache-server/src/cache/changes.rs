//! Key-level change tracking for incremental and differential backups

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct Change {
    seq: u64,
    kind: ChangeKind,
}

/// Keys mutated after a given sequence number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Whole keyspace was reset after the base sequence; only a full backup is valid
    pub reset: bool,
    pub upserts: Vec<String>,
    pub deletes: Vec<String>,
    /// Highest sequence covered by this set
    pub through_seq: u64,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        !self.reset && self.upserts.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    seq: u64,
    changes: HashMap<String, Change>,
    /// Sequence of the last clear / untracked bulk change
    reset_seq: u64,
    /// Changes at or below this sequence were compacted away
    compacted_through: u64,
}

/// Stamps every mutation with a monotonically increasing sequence.
///
/// Only the latest change per key is retained; deletes stay as tombstones
/// until compacted. Sequences are only comparable within one epoch; every
/// tracker starts a fresh one.
#[derive(Debug)]
pub struct ChangeTracker {
    epoch: String,
    state: RwLock<TrackerState>,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self {
            epoch: uuid::Uuid::new_v4().simple().to_string(),
            state: RwLock::new(TrackerState::default()),
        }
    }

    /// Identifies the sequence space this tracker numbers changes in
    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn record_upsert(&self, key: &str) -> u64 {
        self.record(key, ChangeKind::Upsert)
    }

    pub fn record_delete(&self, key: &str) -> u64 {
        self.record(key, ChangeKind::Delete)
    }

    fn record(&self, key: &str, kind: ChangeKind) -> u64 {
        let mut state = self.state.write();
        state.seq += 1;
        let seq = state.seq;
        state.changes.insert(key.to_string(), Change { seq, kind });
        seq
    }

    /// Mark a change that cannot be described key by key
    pub fn record_reset(&self) -> u64 {
        let mut state = self.state.write();
        state.seq += 1;
        state.reset_seq = state.seq;
        state.changes.clear();
        debug!("Change tracker reset at seq {}", state.seq);
        state.seq
    }

    pub fn current_seq(&self) -> u64 {
        self.state.read().seq
    }

    /// Changes strictly after `since`
    pub fn changes_since(&self, since: u64) -> ChangeSet {
        let state = self.state.read();
        let mut set = ChangeSet {
            reset: state.reset_seq > since || state.compacted_through > since,
            through_seq: state.seq,
            ..Default::default()
        };
        if set.reset {
            return set;
        }

        for (key, change) in &state.changes {
            if change.seq <= since {
                continue;
            }
            match change.kind {
                ChangeKind::Upsert => set.upserts.push(key.clone()),
                ChangeKind::Delete => set.deletes.push(key.clone()),
            }
        }
        set.upserts.sort();
        set.deletes.sort();
        set
    }

    /// Forget changes at or below `upto`
    pub fn compact(&self, upto: u64) -> usize {
        let mut state = self.state.write();
        let before = state.changes.len();
        state.changes.retain(|_, c| c.seq > upto);
        state.compacted_through = state.compacted_through.max(upto);
        before - state.changes.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.state.read().changes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_change_wins() {
        let tracker = ChangeTracker::new();
        tracker.record_upsert("a");
        tracker.record_upsert("b");
        tracker.record_delete("a");

        let set = tracker.changes_since(0);
        assert!(!set.reset);
        assert_eq!(set.upserts, vec!["b"]);
        assert_eq!(set.deletes, vec!["a"]);
        assert_eq!(set.through_seq, 3);
    }

    #[test]
    fn test_changes_since_sequence() {
        let tracker = ChangeTracker::new();
        tracker.record_upsert("old");
        let mark = tracker.current_seq();
        tracker.record_upsert("new");

        let set = tracker.changes_since(mark);
        assert_eq!(set.upserts, vec!["new"]);
        assert!(tracker.changes_since(tracker.current_seq()).is_empty());
    }

    #[test]
    fn test_reset_forces_full() {
        let tracker = ChangeTracker::new();
        tracker.record_upsert("a");
        let mark = tracker.current_seq();
        tracker.record_reset();
        tracker.record_upsert("b");

        assert!(tracker.changes_since(mark).reset);
        let after = tracker.changes_since(tracker.current_seq() - 1);
        assert!(!after.reset);
        assert_eq!(after.upserts, vec!["b"]);
    }

    #[test]
    fn test_each_tracker_has_its_own_epoch() {
        let first = ChangeTracker::new();
        let second = ChangeTracker::new();
        assert_eq!(first.epoch().len(), 32);
        assert_ne!(first.epoch(), second.epoch());
        // Both count from zero, so their sequences must never be mixed
        first.record_upsert("a");
        second.record_upsert("b");
        assert_eq!(first.current_seq(), second.current_seq());
    }

    #[test]
    fn test_compact() {
        let tracker = ChangeTracker::new();
        tracker.record_upsert("a");
        tracker.record_upsert("b");
        let mark = tracker.current_seq();
        tracker.record_upsert("c");

        assert_eq!(tracker.compact(mark), 2);
        assert_eq!(tracker.tracked_keys(), 1);
        // Anything older than the compaction point can no longer be diffed
        assert!(tracker.changes_since(0).reset);
        assert_eq!(tracker.changes_since(mark).upserts, vec!["c"]);
    }
}
