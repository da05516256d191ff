//! Transient listener capturing record mutations that race a rebuild.
//!
//! Registered on the event bus only for the duration of a background
//! rebuild. While the walk is in flight, every update-flavored event lands
//! in the `updated` set and every deletion in the `deleted` set, both
//! deduplicated. The rebuild's fix-up phase replays these sets once the walk
//! finishes, closing the race window between the pre-walk snapshot and live
//! edits. The tracker must never stay registered past the rebuild, on any
//! exit path; registration is via an RAII subscription for that reason.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::bus::{RecordEvent, RecordEventListener};
use crate::record::RecordId;

/// The mutation ledger of one background rebuild.
#[derive(Default)]
pub struct MutationTracker {
    updated: Mutex<BTreeSet<RecordId>>,
    deleted: Mutex<BTreeSet<RecordId>>,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids updated (any field/comment/worklog/transition change) during the
    /// rebuild window, ascending.
    pub fn updated_ids(&self) -> Vec<RecordId> {
        self.updated.lock().iter().copied().collect()
    }

    /// Ids deleted during the rebuild window, ascending.
    pub fn deleted_ids(&self) -> Vec<RecordId> {
        self.deleted.lock().iter().copied().collect()
    }

    pub fn updated_count(&self) -> usize {
        self.updated.lock().len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.lock().len()
    }

    /// Total distinct records touched while the rebuild ran.
    pub fn total_mutations(&self) -> usize {
        self.updated_count() + self.deleted_count()
    }
}

impl RecordEventListener for MutationTracker {
    fn on_event(&self, event: &RecordEvent) {
        if event.is_deletion() {
            self.deleted.lock().insert(event.record_id());
        } else {
            self.updated.lock().insert(event.record_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use std::sync::Arc;

    #[test]
    fn updates_and_deletions_land_in_their_sets() {
        let tracker = MutationTracker::new();
        tracker.on_event(&RecordEvent::Updated { id: 5 });
        tracker.on_event(&RecordEvent::CommentChanged { id: 6 });
        tracker.on_event(&RecordEvent::Transitioned { id: 7 });
        tracker.on_event(&RecordEvent::Deleted { id: 2 });
        assert_eq!(tracker.updated_ids(), vec![5, 6, 7]);
        assert_eq!(tracker.deleted_ids(), vec![2]);
        assert_eq!(tracker.total_mutations(), 4);
    }

    #[test]
    fn sets_deduplicate_repeat_events() {
        let tracker = MutationTracker::new();
        for _ in 0..3 {
            tracker.on_event(&RecordEvent::Updated { id: 9 });
            tracker.on_event(&RecordEvent::WorklogChanged { id: 9 });
        }
        assert_eq!(tracker.updated_ids(), vec![9]);
        assert_eq!(tracker.updated_count(), 1);
    }

    #[test]
    fn unsubscribed_tracker_stops_capturing() {
        let bus = Arc::new(EventBus::new());
        let tracker = Arc::new(MutationTracker::new());
        {
            let _sub = bus.register(tracker.clone());
            bus.publish(&RecordEvent::Updated { id: 1 });
        }
        bus.publish(&RecordEvent::Updated { id: 2 });
        assert_eq!(tracker.updated_ids(), vec![1]);
    }
}
