//! Compares a pre-rebuild index snapshot against the records actually
//! visited during the walk.
//!
//! Built from the sorted array of primary ids present in the index when a
//! background rebuild starts, plus a same-sized bitset. Observing a visited
//! id sets its bit (idempotently) if the id was in the snapshot, otherwise
//! appends it to the `unindexed` list in first-observed order. After the
//! walk completes, `orphans` is every snapshot id whose bit never got set:
//! records that were in the index but no longer exist in the store.

use parking_lot::Mutex;

use crate::batcher::RecordSpy;
use crate::record::{Record, RecordId};

/// Snapshot-vs-visited reconciliation state for one background rebuild.
pub struct Reconciler {
    /// Snapshot ids, sorted ascending. Immutable for the rebuild's duration.
    snapshot: Vec<RecordId>,
    state: Mutex<ReconcilerState>,
}

struct ReconcilerState {
    /// One bit per snapshot id; set when the id is observed.
    seen: Vec<u64>,
    /// Visited ids absent from the snapshot, in first-observed order.
    unindexed: Vec<RecordId>,
}

impl Reconciler {
    /// Build from the index snapshot. The input need not be sorted; a copy
    /// is sorted and deduplicated here.
    pub fn new(mut snapshot: Vec<RecordId>) -> Self {
        snapshot.sort_unstable();
        snapshot.dedup();
        let words = snapshot.len().div_ceil(64);
        Self {
            snapshot,
            state: Mutex::new(ReconcilerState {
                seen: vec![0; words],
                unindexed: Vec::new(),
            }),
        }
    }

    /// Mark an id as visited. Idempotent: observing the same id twice sets
    /// the same bit / appends nothing new.
    pub fn observe(&self, id: RecordId) {
        match self.snapshot.binary_search(&id) {
            Ok(pos) => {
                let mut state = self.state.lock();
                state.seen[pos / 64] |= 1 << (pos % 64);
            }
            Err(_) => {
                let mut state = self.state.lock();
                if !state.unindexed.contains(&id) {
                    state.unindexed.push(id);
                }
            }
        }
    }

    /// Snapshot ids never observed. Only meaningful after the full walk.
    pub fn orphans(&self) -> Vec<RecordId> {
        let state = self.state.lock();
        self.snapshot
            .iter()
            .enumerate()
            .filter(|(pos, _)| state.seen[pos / 64] & (1 << (pos % 64)) == 0)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Visited ids that were missing from the snapshot, in first-observed
    /// order. Valid incrementally during the walk.
    pub fn unindexed(&self) -> Vec<RecordId> {
        self.state.lock().unindexed.clone()
    }

    /// Number of ids in the snapshot.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }
}

impl RecordSpy for Reconciler {
    fn observe(&self, record: &Record) {
        Reconciler::observe(self, record.id);
    }
}
