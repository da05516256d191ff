//! The record-store collaborator.
//!
//! The engine never owns the authoritative data; it consumes it through
//! [`RecordStore`]: descending, conditionable, paginated iteration over
//! primary records, retrieval of a record's children, and cheap approximate
//! counts for consistency checks. [`MemoryRecordStore`] is the in-memory
//! implementation used by tests and small embedders; the sqlite adapter
//! lives in `store_sqlite`.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;

use crate::record::{ChangeGroup, Comment, Record, RecordId};

/// Failure in the record-store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store query failed: {0}")]
    Query(String),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Condition pushed down into paged record iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Restrict the walk to one project key.
    pub project: Option<String>,
}

impl RecordFilter {
    /// Filter matching every record.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn project(key: impl Into<String>) -> Self {
        Self {
            project: Some(key.into()),
        }
    }

    fn matches(&self, record: &Record) -> bool {
        self.project
            .as_deref()
            .is_none_or(|p| record.project == p)
    }
}

/// Ordered, conditionable access to the authoritative record population.
///
/// `records_page` must return records with `id <= upper`, ordered by id
/// descending, at most `limit` of them; two identical calls against the same
/// store state must return the same records in the same order (the pager's
/// determinism depends on it).
pub trait RecordStore: Send + Sync {
    /// Current maximum primary-record id, `None` for an empty store.
    fn max_record_id(&self) -> Result<Option<RecordId>, StoreError>;

    /// One descending page of records with `id <= upper`.
    fn records_page(
        &self,
        upper: RecordId,
        limit: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, StoreError>;

    /// Fetch one record by id.
    fn record(&self, id: RecordId) -> Result<Option<Record>, StoreError>;

    /// All comments of one record.
    fn comments(&self, id: RecordId) -> Result<Vec<Comment>, StoreError>;

    /// All change-history groups of one record.
    fn change_history(&self, id: RecordId) -> Result<Vec<ChangeGroup>, StoreError>;

    /// Cheap approximate record count; `None` when the store cannot provide
    /// one (the consistency check is skipped in that case).
    fn approximate_record_count(&self) -> Result<Option<u64>, StoreError>;

    /// Cheap approximate comment count; `None` when unavailable.
    fn approximate_comment_count(&self) -> Result<Option<u64>, StoreError>;
}

/// In-memory [`RecordStore`] backed by ordered maps.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<RecordId, Record>,
    comments: BTreeMap<RecordId, Vec<Comment>>,
    history: BTreeMap<RecordId, Vec<ChangeGroup>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn put_record(&self, record: Record) {
        self.inner.lock().records.insert(record.id, record);
    }

    /// Remove a record and its children.
    pub fn remove_record(&self, id: RecordId) {
        let mut inner = self.inner.lock();
        inner.records.remove(&id);
        inner.comments.remove(&id);
        inner.history.remove(&id);
    }

    pub fn put_comment(&self, comment: Comment) {
        self.inner
            .lock()
            .comments
            .entry(comment.record_id)
            .or_default()
            .push(comment);
    }

    pub fn put_change_group(&self, group: ChangeGroup) {
        self.inner
            .lock()
            .history
            .entry(group.record_id)
            .or_default()
            .push(group);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn max_record_id(&self) -> Result<Option<RecordId>, StoreError> {
        Ok(self.inner.lock().records.keys().next_back().copied())
    }

    fn records_page(
        &self,
        upper: RecordId,
        limit: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .range(..=upper)
            .rev()
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    fn record(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        Ok(self.inner.lock().records.get(&id).cloned())
    }

    fn comments(&self, id: RecordId) -> Result<Vec<Comment>, StoreError> {
        Ok(self.inner.lock().comments.get(&id).cloned().unwrap_or_default())
    }

    fn change_history(&self, id: RecordId) -> Result<Vec<ChangeGroup>, StoreError> {
        Ok(self.inner.lock().history.get(&id).cloned().unwrap_or_default())
    }

    fn approximate_record_count(&self) -> Result<Option<u64>, StoreError> {
        Ok(Some(self.inner.lock().records.len() as u64))
    }

    fn approximate_comment_count(&self) -> Result<Option<u64>, StoreError> {
        Ok(Some(
            self.inner.lock().comments.values().map(Vec::len).sum::<usize>() as u64,
        ))
    }
}
