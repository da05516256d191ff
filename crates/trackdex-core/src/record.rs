//! Domain model for indexed tracker records.
//!
//! A [`Record`] is the primary entity owned by the record store; the index
//! only ever holds a derived, disposable projection of it. [`Comment`] and
//! [`ChangeGroup`] are child entities retrieved per record when their
//! sub-indexes are refreshed.

use serde::{Deserialize, Serialize};

/// Numeric identifier of a primary record. Unique within the store.
pub type RecordId = u64;

/// A primary tracker record.
///
/// `key` is the human-readable identifier (`"OPS-1042"`); `id` is the store's
/// numeric id. `updated_at_ms` doubles as the optimistic-concurrency stamp
/// for conditional reindexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub key: String,
    pub project: String,
    pub summary: String,
    pub description: Option<String>,
    pub status: String,
    pub resolution: Option<String>,
    pub assignee: Option<String>,
    pub reporter: Option<String>,
    pub labels: Vec<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Record {
    /// Minimal record for tests and fixtures.
    pub fn new(id: RecordId, key: impl Into<String>) -> Self {
        let key = key.into();
        let project = key
            .split_once('-')
            .map_or_else(|| key.clone(), |(p, _)| p.to_string());
        Self {
            id,
            key,
            project,
            summary: String::new(),
            description: None,
            status: "open".to_string(),
            resolution: None,
            assignee: None,
            reporter: None,
            labels: Vec::new(),
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }
}

/// A comment attached to a record.
///
/// Comments with no body are not indexed (the builder returns `None` for
/// them), but they still exist in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub record_id: RecordId,
    pub record_key: String,
    pub author: Option<String>,
    pub body: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// One field-level change inside a change-history group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeItem {
    /// Name of the changed field (`"status"`, `"assignee"`, ...).
    pub field: String,
    pub from_value: Option<String>,
    pub to_value: Option<String>,
}

/// A group of field changes sharing one change-transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeGroup {
    /// The change-transaction id; identifies the group within its record.
    pub id: u64,
    pub record_id: RecordId,
    pub record_key: String,
    pub author: Option<String>,
    pub created_at_ms: u64,
    pub items: Vec<ChangeItem>,
}
