//! trackdex-core: concurrent search-index maintenance for tracker records.
//!
//! Keeps a tantivy full-text index synchronized with an authoritative
//! record store. The index is really three coupled sub-indexes (primary
//! records, their discussion comments, and their change-history trail)
//! updated together per logical record.
//!
//! # Architecture
//!
//! ```text
//! edit handlers ──► IndexCoordinator ──► RecordIndexer ──► SubIndexSet (tantivy ×3)
//!                        │                    ▲
//!                   LockArbiter          DocumentFactory
//!                        │
//!  background rebuild: BatchPager + Reconciler + MutationTracker (event bus)
//! ```
//!
//! Two update modes coexist: small synchronous online updates under the
//! shared maintenance lock, and full rebuilds: either stop-the-world
//! (exclusive lock, delete + direct-mode repopulation) or background
//! (shared lock, snapshot/walk/reconcile with fix-up passes for edits that
//! raced the walk).
//!
//! # Modules
//!
//! - `coordinator`: public operations, locking wrapper, rebuild flows
//! - `indexer`: per-record execution over the three sub-indexes
//! - `subindex`: sub-index lifecycle, queued/direct writer discipline
//! - `documents`: record → document builders with per-contributor isolation
//! - `schema`: tantivy schemas and field handles
//! - `batcher`: deterministic descending-id store walk
//! - `reconciler`, `tracker`: background-rebuild drift detection
//! - `strategy`, `result`: serial/pooled execution and composite results
//! - `arbiter`: the maintenance/rebuild two-tier lock
//! - `consistency`: count-based drift checks
//! - `store`, `store_sqlite`: the record-store collaborator
//! - `bus`: the minimal event-bus collaborator
//! - `config`, `logging`, `error`, `record`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod arbiter;
pub mod batcher;
pub mod bus;
pub mod config;
pub mod consistency;
pub mod coordinator;
pub mod documents;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod reconciler;
pub mod record;
pub mod result;
pub mod schema;
pub mod store;
pub mod store_sqlite;
pub mod strategy;
pub mod subindex;
pub mod tracker;

pub use coordinator::{CancelFlag, IndexCoordinator, ReindexAllOptions};
pub use error::IndexError;
pub use indexer::ReindexOptions;
pub use record::{ChangeGroup, ChangeItem, Comment, Record, RecordId};
pub use store::{MemoryRecordStore, RecordFilter, RecordStore};
