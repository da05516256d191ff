//! Orchestrates all index operations behind the lock arbiter.
//!
//! Every public operation follows the same wrapper: acquire the maintenance
//! lock, execute, release, flush the cached read handles (so stale file
//! handles never leak across operations), and return elapsed milliseconds,
//! or −1 when the operation could not proceed. Lock timeouts and
//! unavailability are return-value signals, never panics or errors;
//! configuration problems are logged distinctly and also yield −1.
//!
//! Two rebuild flows coexist:
//! - **Stop-the-world** (`reindex_all` with `background = false`): takes the
//!   exclusive rebuild lock, pauses the external job scheduler, deletes all
//!   three sub-indexes, repopulates them batch-by-batch in direct write
//!   mode, compacts, and always restarts the scheduler. Not cancellable.
//! - **Background** (`background = true`): takes the *shared* maintenance
//!   lock so online edits keep flowing, snapshots the indexed ids, tracks
//!   concurrent mutations via a transient bus listener, walks the store,
//!   then runs the ledger fix-up and corruption fix-up passes.
//!   Cooperatively cancellable at batch boundaries; cancellation skips both
//!   fix-up passes.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::arbiter::LockArbiter;
use crate::batcher::BatchPager;
use crate::bus::EventBus;
use crate::config::IndexConfig;
use crate::consistency::{self, ExpectedCount};
use crate::error::IndexError;
use crate::indexer::{RecordIndexer, ReindexOptions};
use crate::record::{Comment, Record, RecordId};
use crate::reconciler::Reconciler;
use crate::result::ResultAccumulator;
use crate::store::RecordStore;
use crate::subindex::{OpenSet, SubIndexName, SubIndexSet, WriteMode};
use crate::tracker::MutationTracker;

/// External job scheduler paused around the stop-the-world rebuild.
pub trait MaintenanceScheduler: Send + Sync {
    fn is_active(&self) -> bool;
    fn standby(&self);
    fn restart(&self);
}

/// Cooperative cancellation flag for a background rebuild. Checked once per
/// batch; never preemptive.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for `reindex_all`.
#[derive(Debug, Clone, Default)]
pub struct ReindexAllOptions {
    /// Background (shared lock) vs stop-the-world (exclusive lock).
    pub background: bool,
    pub comments: bool,
    pub history: bool,
    pub cancel: CancelFlag,
}

impl ReindexAllOptions {
    pub fn background() -> Self {
        Self {
            background: true,
            comments: true,
            history: true,
            cancel: CancelFlag::new(),
        }
    }

    pub fn stop_the_world() -> Self {
        Self {
            background: false,
            comments: true,
            history: true,
            cancel: CancelFlag::new(),
        }
    }
}

/// Explicit cache of per-operation read handles. The coordinator flushes it
/// after every lock release so no handle outlives the operation that
/// created it.
#[derive(Default)]
struct ReaderCache {
    cached: Mutex<HashMap<SubIndexName, tantivy::Searcher>>,
}

impl ReaderCache {
    fn searcher(
        &self,
        open: &OpenSet,
        name: SubIndexName,
    ) -> Result<tantivy::Searcher, IndexError> {
        let mut cached = self.cached.lock();
        if let Some(searcher) = cached.get(&name) {
            return Ok(searcher.clone());
        }
        let searcher = open.get(name).searcher()?;
        cached.insert(name, searcher.clone());
        Ok(searcher)
    }

    fn flush(&self) {
        self.cached.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cached.lock().len()
    }
}

/// The public face of the index-maintenance engine.
pub struct IndexCoordinator {
    config: IndexConfig,
    arbiter: LockArbiter,
    indexer: RecordIndexer,
    store: Arc<dyn RecordStore>,
    bus: Arc<EventBus>,
    scheduler: Option<Arc<dyn MaintenanceScheduler>>,
    reader_cache: ReaderCache,
    enabled: AtomicBool,
    writes_since_optimize: AtomicU64,
}

impl IndexCoordinator {
    pub fn new(
        config: IndexConfig,
        store: Arc<dyn RecordStore>,
        bus: Arc<EventBus>,
    ) -> Result<Self, IndexError> {
        config.validate()?;
        let set = Arc::new(SubIndexSet::new(
            config.index_root.clone(),
            config.writer_heap_bytes,
        ));
        let indexer = RecordIndexer::new(set, Arc::clone(&store), config.parallel.clone());
        let arbiter = LockArbiter::new(config.lock_wait());
        Ok(Self {
            config,
            arbiter,
            indexer,
            store,
            bus,
            scheduler: None,
            reader_cache: ReaderCache::default(),
            enabled: AtomicBool::new(true),
            writes_since_optimize: AtomicU64::new(0),
        })
    }

    /// Attach the external job scheduler paused around stop-the-world runs.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn MaintenanceScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Whether the engine accepts operations at all.
    pub fn is_available(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.config.index_root.as_os_str().is_empty()
    }

    /// Stop accepting operations and close the sub-indexes.
    pub fn deactivate(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.shutdown();
    }

    pub fn activate(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Close sub-indexes and drop cached read handles.
    pub fn shutdown(&self) {
        self.reader_cache.flush();
        self.indexer.sub_indexes().close();
    }

    /// Record writes applied since compaction last began.
    pub fn writes_since_optimize(&self) -> u64 {
        self.writes_since_optimize.load(Ordering::SeqCst)
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ---------------------------------------------------------------------
    // Online operations
    // ---------------------------------------------------------------------

    /// Pure insert for known-new records. Elapsed ms, or −1.
    pub fn index_records(&self, records: &[Record]) -> i64 {
        if records.is_empty() {
            return 0;
        }
        self.maintenance_op("index", first_key(records), |this| {
            let acc = this.indexer.index_records(records)?;
            this.note_writes(records.len());
            this.await_batch(acc);
            Ok(())
        })
    }

    /// Remove records from all three sub-indexes. Elapsed ms, or −1.
    pub fn deindex_records(&self, records: &[Record]) -> i64 {
        if records.is_empty() {
            return 0;
        }
        self.maintenance_op("deindex", first_key(records), |this| {
            let acc = this.indexer.deindex_records(records)?;
            this.await_batch(acc);
            Ok(())
        })
    }

    /// Replace-by-identifying-key. Elapsed ms, or −1.
    pub fn reindex_records(&self, records: &[Record], options: ReindexOptions) -> i64 {
        if records.is_empty() {
            return 0;
        }
        self.maintenance_op("reindex", first_key(records), |this| {
            let acc = this.indexer.reindex_records(records, options)?;
            this.note_writes(records.len());
            this.await_batch(acc);
            Ok(())
        })
    }

    /// Replace individual comment documents. Elapsed ms, or −1.
    pub fn reindex_comments(&self, comments: &[Comment]) -> i64 {
        if comments.is_empty() {
            return 0;
        }
        let key = comments[0].record_key.clone();
        self.maintenance_op("reindex comments", key, |this| {
            let acc = this.indexer.reindex_comments(comments)?;
            this.note_writes(comments.len());
            this.await_batch(acc);
            Ok(())
        })
    }

    /// Compact all three sub-indexes. Takes the maintenance lock, never the
    /// rebuild lock; returns elapsed ms or −1. The writes-since-optimize
    /// counter resets when compaction begins, so writes landing during the
    /// compaction count toward the next cycle.
    pub fn optimize(&self) -> i64 {
        if !self.is_available() {
            return 0;
        }
        let start = Instant::now();
        let Some(_guard) = self.arbiter.maintenance() else {
            error!("could not optimize: maintenance lock unavailable");
            return -1;
        };
        let result = self.optimize_locked();
        drop(_guard);
        self.reader_cache.flush();
        match result {
            Ok(()) => start.elapsed().as_millis() as i64,
            Err(err) => {
                error!(error = %err, "optimize failed");
                -1
            }
        }
    }

    /// Compact while a lock is already held. No timeout on the await.
    fn optimize_locked(&self) -> Result<(), IndexError> {
        self.writes_since_optimize.store(0, Ordering::SeqCst);
        let acc = self.indexer.optimize()?;
        let outcome = acc.await_all(None);
        if !outcome.failures.is_empty() {
            warn!(failures = outcome.failures.len(), "optimize reported failures");
        }
        Ok(())
    }

    /// Cheap drift check across all three sub-indexes. Any fault counts as
    /// inconsistent: fail toward re-indexing, never toward trusting a
    /// broken index.
    pub fn is_consistent(&self) -> bool {
        let run = || -> Result<bool, IndexError> {
            let open = self.indexer.sub_indexes().open()?;
            let primary = consistency::is_consistent(
                SubIndexName::Primary.display_name(),
                ExpectedCount::from(self.store.approximate_record_count()?),
                || open.primary.num_docs(),
            );
            let comments = consistency::is_consistent(
                SubIndexName::Comments.display_name(),
                ExpectedCount::from(self.store.approximate_comment_count()?),
                || open.comments.num_docs(),
            );
            // History counts are too expensive to compute store-side.
            let history = consistency::is_consistent(
                SubIndexName::History.display_name(),
                ExpectedCount::Unknown,
                || open.history.num_docs(),
            );
            Ok(primary && comments && history)
        };
        match run() {
            Ok(consistent) => consistent,
            Err(err) => {
                warn!(error = %err, "exception during index consistency check");
                false
            }
        }
    }

    /// A read handle over one sub-index, cached for the duration of the
    /// current operation.
    pub fn searcher(&self, name: SubIndexName) -> Result<tantivy::Searcher, IndexError> {
        if !self.is_available() {
            return Err(IndexError::Unavailable);
        }
        let Some(_guard) = self.arbiter.maintenance() else {
            return Err(IndexError::Unavailable);
        };
        let open = self.indexer.sub_indexes().open()?;
        self.reader_cache.searcher(&open, name)
    }

    /// Defer single-record reindexing inside a scope; see [`HoldScope`].
    pub fn hold(&self) -> HoldScope<'_> {
        HoldScope {
            coordinator: self,
            queue: Mutex::new(BTreeMap::new()),
        }
    }

    // ---------------------------------------------------------------------
    // Full rebuilds
    // ---------------------------------------------------------------------

    /// Rebuild the whole index. Elapsed ms, or −1 on lock failure,
    /// cancellation, or error.
    pub fn reindex_all(&self, options: &ReindexAllOptions) -> i64 {
        if !self.is_available() {
            error!("index root not configured or engine disabled; not reindexing");
            return -1;
        }
        let start = Instant::now();
        info!(background = options.background, "reindexing all records");

        if options.background {
            let Some(_guard) = self.arbiter.maintenance() else {
                error!("could not perform background reindex: lock unavailable");
                return -1;
            };
            let result = self.background_reindex(options);
            drop(_guard);
            self.reader_cache.flush();
            match result {
                Ok(()) => start.elapsed().as_millis() as i64,
                Err(err) if err.is_cancelled() => {
                    info!("background reindex cancelled");
                    -1
                }
                Err(err) => {
                    error!(error = %err, "background reindex failed");
                    -1
                }
            }
        } else {
            let Some(_guard) = self.arbiter.rebuild() else {
                error!("could not perform stop-the-world reindex: rebuild lock unavailable");
                return -1;
            };
            let result = self.stop_the_world_reindex(options);
            drop(_guard);
            self.reader_cache.flush();
            match result {
                Ok(()) => start.elapsed().as_millis() as i64,
                Err(err) => {
                    error!(error = %err, "stop-the-world reindex failed");
                    -1
                }
            }
        }
    }

    /// Shared-lock rebuild with reconciliation. The caller holds the
    /// maintenance lock.
    fn background_reindex(&self, options: &ReindexAllOptions) -> Result<(), IndexError> {
        let snapshot = self.indexer.snapshot_primary_ids()?;
        let reconciler = Reconciler::new(snapshot);
        info!(
            indexed = reconciler.snapshot_len(),
            "reindexing records in the background"
        );

        let tracker = Arc::new(MutationTracker::new());
        // RAII subscription: no exit path leaves the tracker registered.
        let subscription = self.bus.register(tracker.clone());

        let reindex_options = ReindexOptions {
            comments: options.comments,
            history: options.history,
            conditional: false,
        };

        let walk = (|| -> Result<bool, IndexError> {
            let acc = ResultAccumulator::new();
            let mut pager =
                BatchPager::new(self.store.as_ref(), self.config.batch_size)?.with_spy(&reconciler);
            let mut cancelled = false;
            loop {
                if options.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let Some(batch) = pager.next_batch()? else {
                    break;
                };
                acc.merge(self.indexer.reindex_records(&batch, reindex_options)?);
            }
            let outcome = acc.await_all(None);
            if !outcome.failures.is_empty() {
                warn!(
                    failures = outcome.failures.len(),
                    "background walk finished with per-record failures"
                );
            }
            Ok(cancelled)
        })();

        drop(subscription);
        let cancelled = walk?;
        info!(
            concurrent_mutations = tracker.total_mutations(),
            "background walk complete"
        );

        if cancelled {
            // Partial state is not trusted enough for the fix-up passes.
            return Err(IndexError::Cancelled);
        }

        self.fixup_concurrent_mutations(&tracker, reindex_options)?;
        self.fixup_index_corruption(&reconciler, reindex_options)?;
        Ok(())
    }

    /// Step 5: replay the mutation ledger accumulated during the walk.
    fn fixup_concurrent_mutations(
        &self,
        tracker: &MutationTracker,
        options: ReindexOptions,
    ) -> Result<(), IndexError> {
        if tracker.total_mutations() == 0 {
            return Ok(());
        }
        info!(
            updated = tracker.updated_count(),
            deleted = tracker.deleted_count(),
            "fixing up concurrently modified records"
        );

        let mut refresh = Vec::new();
        let mut remove: Vec<RecordId> = tracker.deleted_ids();
        for id in tracker.updated_ids() {
            match self.store.record(id)? {
                Some(record) => refresh.push(record),
                // Updated then deleted before we got here.
                None => remove.push(id),
            }
        }
        remove.sort_unstable();
        remove.dedup();

        let acc = self.indexer.reindex_records(&refresh, options)?;
        acc.merge(self.indexer.deindex_ids(&remove)?);
        self.await_batch(acc);
        Ok(())
    }

    /// Step 6: repair drift the reconciler observed between the pre-rebuild
    /// snapshot and the walked store.
    fn fixup_index_corruption(
        &self,
        reconciler: &Reconciler,
        options: ReindexOptions,
    ) -> Result<(), IndexError> {
        let missing = reconciler.unindexed();
        let orphans = reconciler.orphans();
        if missing.is_empty() && orphans.is_empty() {
            return Ok(());
        }
        warn!(
            missing = missing.len(),
            orphaned = orphans.len(),
            "repairing index drift found during background reindex"
        );

        let mut refresh = Vec::new();
        let mut remove = orphans;
        for id in missing {
            match self.store.record(id)? {
                Some(record) => refresh.push(record),
                None => remove.push(id),
            }
        }
        remove.sort_unstable();
        remove.dedup();

        let acc = self.indexer.reindex_records(&refresh, options)?;
        acc.merge(self.indexer.deindex_ids(&remove)?);
        self.await_batch(acc);
        Ok(())
    }

    /// Exclusive-lock rebuild: delete everything, repopulate in direct
    /// mode, compact. The caller holds the rebuild lock. Cannot be
    /// cancelled once started.
    fn stop_the_world_reindex(&self, _options: &ReindexAllOptions) -> Result<(), IndexError> {
        let resume_scheduler = match &self.scheduler {
            Some(scheduler) if scheduler.is_active() => {
                scheduler.standby();
                true
            }
            _ => false,
        };

        let set = self.indexer.sub_indexes();
        let result = (|| -> Result<(), IndexError> {
            self.indexer.delete_indexes()?;
            set.set_write_mode(WriteMode::Direct);

            let populate = (|| -> Result<(), IndexError> {
                let mut pager = BatchPager::new(self.store.as_ref(), self.config.batch_size)?;
                while let Some(batch) = pager.next_batch()? {
                    let acc = self.indexer.index_batch(&batch)?;
                    // No timeout on a full rebuild.
                    let outcome = acc.await_all(None);
                    if !outcome.failures.is_empty() {
                        warn!(
                            failures = outcome.failures.len(),
                            "stop-the-world batch finished with per-record failures"
                        );
                    }
                    self.indexer.commit_all()?;
                }
                self.optimize_locked()
            })();

            // Back to queued mode for online traffic, even on error.
            set.close();
            set.set_write_mode(WriteMode::Queued);
            populate
        })();

        // The scheduler restarts on every exit path.
        if resume_scheduler {
            if let Some(scheduler) = &self.scheduler {
                scheduler.restart();
            }
        }
        result
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// The standard operation wrapper: availability check → maintenance
    /// lock → execute → release → flush cached read handles → elapsed ms.
    /// A lock timeout aborts before anything opens, so there is nothing to
    /// flush on that path.
    fn maintenance_op(
        &self,
        what: &str,
        subject: String,
        op: impl FnOnce(&Self) -> Result<(), IndexError>,
    ) -> i64 {
        if !self.is_available() {
            error!(operation = what, subject = %subject, "index unavailable; operation aborted");
            return -1;
        }
        let start = Instant::now();
        let Some(_guard) = self.arbiter.maintenance() else {
            error!(operation = what, subject = %subject, "could not acquire index lock");
            return -1;
        };
        let result = op(self);
        drop(_guard);
        self.reader_cache.flush();
        match result {
            Ok(()) => start.elapsed().as_millis() as i64,
            Err(err) => {
                error!(operation = what, subject = %subject, error = %err, "index operation failed");
                -1
            }
        }
    }

    fn await_batch(&self, acc: ResultAccumulator) {
        let outcome = acc.await_all(Some(self.config.result_wait()));
        if !outcome.completed {
            warn!("timed out awaiting index writes");
        }
    }

    fn note_writes(&self, count: usize) {
        self.writes_since_optimize
            .fetch_add(count as u64, Ordering::SeqCst);
    }
}

fn first_key(records: &[Record]) -> String {
    records.first().map(|r| r.key.clone()).unwrap_or_default()
}

/// Deferred-reindex scope: while held, single-record reindex requests can
/// be queued here (deduplicated by record key) instead of hitting the index
/// one at a time; `release` flushes them as one batch.
pub struct HoldScope<'a> {
    coordinator: &'a IndexCoordinator,
    queue: Mutex<BTreeMap<String, Record>>,
}

impl HoldScope<'_> {
    /// Queue a record for reindexing at release time. The latest queued
    /// version of a key wins.
    pub fn reindex(&self, record: Record) {
        self.queue.lock().insert(record.key.clone(), record);
    }

    /// Records currently queued.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Flush the queue as one reindex batch. Elapsed ms, 0 for an empty
    /// queue, or −1 when the flush could not proceed.
    pub fn release(self) -> i64 {
        let records: Vec<Record> = self.queue.into_inner().into_values().collect();
        if records.is_empty() {
            return 0;
        }
        self.coordinator
            .reindex_records(&records, ReindexOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RecordEvent;
    use crate::store::MemoryRecordStore;
    use std::path::Path;
    use tempfile::tempdir;

    fn coordinator(root: &Path) -> (Arc<IndexCoordinator>, Arc<MemoryRecordStore>, Arc<EventBus>) {
        let store = Arc::new(MemoryRecordStore::new());
        let bus = Arc::new(EventBus::new());
        let config = IndexConfig {
            index_root: root.to_path_buf(),
            batch_size: 2,
            writer_heap_bytes: 20_000_000,
            ..IndexConfig::default()
        };
        let coordinator = IndexCoordinator::new(
            config,
            Arc::<MemoryRecordStore>::clone(&store) as Arc<dyn RecordStore>,
            Arc::clone(&bus),
        )
        .unwrap();
        (Arc::new(coordinator), store, bus)
    }

    fn record(id: RecordId, stamp: u64) -> Record {
        let mut r = Record::new(id, format!("OPS-{id}"));
        r.summary = format!("record {id}");
        r.updated_at_ms = stamp;
        r
    }

    fn seed(store: &MemoryRecordStore, ids: &[RecordId]) {
        for &id in ids {
            store.put_record(record(id, id));
        }
    }

    fn primary_ids(coordinator: &IndexCoordinator) -> Vec<RecordId> {
        coordinator
            .indexer
            .snapshot_primary_ids()
            .expect("snapshot")
    }

    #[test]
    fn online_reindex_returns_elapsed_and_lands_documents() {
        let dir = tempdir().unwrap();
        let (coordinator, store, _) = coordinator(dir.path());
        seed(&store, &[1, 2]);
        let records: Vec<_> = [1, 2]
            .iter()
            .map(|id| store.record(*id).unwrap().unwrap())
            .collect();
        let elapsed = coordinator.reindex_records(&records, ReindexOptions::default());
        assert!(elapsed >= 0);
        assert_eq!(primary_ids(&coordinator), vec![1, 2]);
        assert_eq!(coordinator.writes_since_optimize(), 2);
    }

    #[test]
    fn empty_input_is_a_zero_cost_noop() {
        let dir = tempdir().unwrap();
        let (coordinator, _, _) = coordinator(dir.path());
        assert_eq!(coordinator.index_records(&[]), 0);
        assert_eq!(coordinator.deindex_records(&[]), 0);
    }

    #[test]
    fn unavailable_engine_reports_minus_one() {
        let dir = tempdir().unwrap();
        let (coordinator, store, _) = coordinator(dir.path());
        seed(&store, &[1]);
        coordinator.deactivate();
        let rec = store.record(1).unwrap().unwrap();
        assert_eq!(
            coordinator.reindex_records(&[rec], ReindexOptions::default()),
            -1
        );
        assert_eq!(coordinator.reindex_all(&ReindexAllOptions::background()), -1);
    }

    #[test]
    fn lock_timeout_returns_minus_one_and_flushes_nothing() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        seed(&store, &[1]);
        let config = IndexConfig {
            index_root: dir.path().to_path_buf(),
            lock_wait_ms: 30,
            writer_heap_bytes: 20_000_000,
            ..IndexConfig::default()
        };
        let coordinator = IndexCoordinator::new(
            config,
            Arc::<MemoryRecordStore>::clone(&store) as Arc<dyn RecordStore>,
            Arc::new(EventBus::new()),
        )
        .unwrap();

        // Warm the reader cache, then hold the exclusive lock so the
        // maintenance acquisition times out.
        let _ = coordinator.searcher(SubIndexName::Primary).unwrap();
        assert_eq!(coordinator.reader_cache.len(), 1);
        let guard = coordinator.arbiter.rebuild().unwrap();

        let rec = store.record(1).unwrap().unwrap();
        assert_eq!(
            coordinator.reindex_records(&[rec], ReindexOptions::default()),
            -1
        );
        // No writes happened and the unacquired attempt flushed nothing.
        assert_eq!(coordinator.reader_cache.len(), 1);
        drop(guard);
        assert!(primary_ids(&coordinator).is_empty());
    }

    #[test]
    fn stop_the_world_rebuild_repopulates_and_restarts_scheduler() {
        #[derive(Default)]
        struct FakeScheduler {
            active: AtomicBool,
            standbys: AtomicU64,
            restarts: AtomicU64,
        }
        impl MaintenanceScheduler for FakeScheduler {
            fn is_active(&self) -> bool {
                self.active.load(Ordering::SeqCst)
            }
            fn standby(&self) {
                self.standbys.fetch_add(1, Ordering::SeqCst);
            }
            fn restart(&self) {
                self.restarts.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        let scheduler = Arc::new(FakeScheduler::default());
        scheduler.active.store(true, Ordering::SeqCst);
        let config = IndexConfig {
            index_root: dir.path().to_path_buf(),
            batch_size: 3,
            writer_heap_bytes: 20_000_000,
            ..IndexConfig::default()
        };
        let coordinator = IndexCoordinator::new(
            config,
            Arc::<MemoryRecordStore>::clone(&store) as Arc<dyn RecordStore>,
            Arc::new(EventBus::new()),
        )
        .unwrap()
        .with_scheduler(Arc::<FakeScheduler>::clone(&scheduler) as Arc<dyn MaintenanceScheduler>);

        seed(&store, &(1..=10).collect::<Vec<_>>());
        // Leave a stale document behind to prove deletion happens.
        let stale = record(99, 1);
        let elapsed = coordinator.reindex_records(&[stale], ReindexOptions::default());
        assert!(elapsed >= 0);

        let elapsed = coordinator.reindex_all(&ReindexAllOptions::stop_the_world());
        assert!(elapsed >= 0);
        assert_eq!(primary_ids(&coordinator), (1..=10).collect::<Vec<_>>());
        assert_eq!(scheduler.standbys.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.restarts.load(Ordering::SeqCst), 1);
        // Back in queued mode for online traffic.
        assert_eq!(
            coordinator.indexer.sub_indexes().write_mode(),
            WriteMode::Queued
        );
    }

    /// Store wrapper that performs live edits on the first page fetch,
    /// i.e. after the pager snapshotted its watermark but before any
    /// record is visited. This is exactly the race a background rebuild must
    /// absorb.
    struct RacingStore {
        inner: Arc<MemoryRecordStore>,
        bus: Arc<EventBus>,
        raced: AtomicBool,
    }

    impl RecordStore for RacingStore {
        fn max_record_id(&self) -> Result<Option<RecordId>, crate::store::StoreError> {
            self.inner.max_record_id()
        }

        fn records_page(
            &self,
            upper: RecordId,
            limit: usize,
            filter: &crate::store::RecordFilter,
        ) -> Result<Vec<Record>, crate::store::StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.put_record(record(5, 50));
                self.bus.publish(&RecordEvent::Updated { id: 5 });
                self.inner.remove_record(2);
                self.bus.publish(&RecordEvent::Deleted { id: 2 });
            }
            self.inner.records_page(upper, limit, filter)
        }

        fn record(&self, id: RecordId) -> Result<Option<Record>, crate::store::StoreError> {
            self.inner.record(id)
        }

        fn comments(
            &self,
            id: RecordId,
        ) -> Result<Vec<Comment>, crate::store::StoreError> {
            self.inner.comments(id)
        }

        fn change_history(
            &self,
            id: RecordId,
        ) -> Result<Vec<crate::record::ChangeGroup>, crate::store::StoreError> {
            self.inner.change_history(id)
        }

        fn approximate_record_count(&self) -> Result<Option<u64>, crate::store::StoreError> {
            self.inner.approximate_record_count()
        }

        fn approximate_comment_count(&self) -> Result<Option<u64>, crate::store::StoreError> {
            self.inner.approximate_comment_count()
        }
    }

    #[test]
    fn background_rebuild_reconciles_live_edits() {
        let dir = tempdir().unwrap();
        let inner = Arc::new(MemoryRecordStore::new());
        seed(&inner, &[1, 2, 3, 4]);
        let bus = Arc::new(EventBus::new());
        let racing = Arc::new(RacingStore {
            inner: Arc::clone(&inner),
            bus: Arc::clone(&bus),
            raced: AtomicBool::new(false),
        });
        let config = IndexConfig {
            index_root: dir.path().to_path_buf(),
            batch_size: 2,
            writer_heap_bytes: 20_000_000,
            ..IndexConfig::default()
        };
        let coordinator = IndexCoordinator::new(
            config,
            Arc::<RacingStore>::clone(&racing) as Arc<dyn RecordStore>,
            Arc::clone(&bus),
        )
        .unwrap();

        // Index snapshot at rebuild start = {1, 2, 3, 4}.
        let records: Vec<_> = (1..=4)
            .map(|id| inner.record(id).unwrap().unwrap())
            .collect();
        assert!(coordinator.reindex_records(&records, ReindexOptions::default()) >= 0);
        assert_eq!(primary_ids(&coordinator), vec![1, 2, 3, 4]);

        // During the walk, record 5 is created and record 2 deleted (the
        // RacingStore injects both, with events, after the watermark
        // snapshot). Record 5 sits above the watermark so only the
        // mutation ledger can bring it in; record 2's documents can only
        // leave via the ledger-deletion fix-up.
        let elapsed = coordinator.reindex_all(&ReindexAllOptions::background());
        assert!(elapsed >= 0);
        assert_eq!(primary_ids(&coordinator), vec![1, 3, 4, 5]);
        // The transient tracker is gone again.
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn cancelled_background_rebuild_skips_fixups() {
        let dir = tempdir().unwrap();
        let (coordinator, store, bus) = coordinator(dir.path());
        seed(&store, &[1, 2, 3]);

        // Stale state the fix-up passes would repair if they ran: an
        // orphaned doc for 42 and a pending deletion for 1.
        let orphan = record(42, 1);
        assert!(coordinator.reindex_records(&[orphan], ReindexOptions::default()) >= 0);
        bus.publish(&RecordEvent::Deleted { id: 1 });

        let options = ReindexAllOptions {
            cancel: CancelFlag::new(),
            ..ReindexAllOptions::background()
        };
        options.cancel.cancel(); // cancelled before the first batch
        assert_eq!(coordinator.reindex_all(&options), -1);

        // Neither the ledger deletion of 1 nor the orphan removal of 42 ran.
        let ids = primary_ids(&coordinator);
        assert!(ids.contains(&42), "corruption fix-up must not run");
        // No listener leaked on the cancellation path.
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn background_rebuild_removes_orphans_and_adds_unindexed() {
        let dir = tempdir().unwrap();
        let (coordinator, store, _) = coordinator(dir.path());

        // Index state diverges from the store both ways: 7 exists only in
        // the index (orphan), 1..=3 exist only in the store (unindexed).
        let orphan = record(7, 1);
        assert!(coordinator.reindex_records(&[orphan], ReindexOptions::default()) >= 0);
        seed(&store, &[1, 2, 3]);
        store.remove_record(7);

        assert!(coordinator.reindex_all(&ReindexAllOptions::background()) >= 0);
        assert_eq!(primary_ids(&coordinator), vec![1, 2, 3]);
    }

    #[test]
    fn optimize_resets_write_counter_when_compaction_begins() {
        let dir = tempdir().unwrap();
        let (coordinator, store, _) = coordinator(dir.path());
        seed(&store, &[1, 2]);
        let records: Vec<_> = [1, 2]
            .iter()
            .map(|id| store.record(*id).unwrap().unwrap())
            .collect();
        assert!(coordinator.reindex_records(&records, ReindexOptions::default()) >= 0);
        assert_eq!(coordinator.writes_since_optimize(), 2);
        assert!(coordinator.optimize() >= 0);
        assert_eq!(coordinator.writes_since_optimize(), 0);
    }

    #[test]
    fn consistency_check_follows_store_counts() {
        let dir = tempdir().unwrap();
        let (coordinator, store, _) = coordinator(dir.path());
        seed(&store, &[1, 2, 3]);
        let records: Vec<_> = (1..=3)
            .map(|id| store.record(id).unwrap().unwrap())
            .collect();
        assert!(coordinator.reindex_records(&records, ReindexOptions::default()) >= 0);
        assert!(coordinator.is_consistent());

        // Blow the tolerance band: 30 store records, 3 indexed.
        seed(&store, &(10..=40).collect::<Vec<_>>());
        assert!(!coordinator.is_consistent());
    }

    #[test]
    fn hold_scope_defers_and_deduplicates() {
        let dir = tempdir().unwrap();
        let (coordinator, store, _) = coordinator(dir.path());
        seed(&store, &[1]);

        let scope = coordinator.hold();
        scope.reindex(record(1, 10));
        scope.reindex(record(1, 20)); // same key, latest wins
        assert_eq!(scope.pending(), 1);
        assert!(primary_ids(&coordinator).is_empty(), "nothing indexed while held");
        assert!(scope.release() >= 0);
        assert_eq!(primary_ids(&coordinator), vec![1]);
    }
}
