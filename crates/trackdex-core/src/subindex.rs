//! Lifecycle and writer discipline of the three sub-indexes.
//!
//! [`SubIndexSet`] opens the primary / comments / history indexes lazily and
//! as one unit: concurrent openers race, one initializer wins, everyone
//! observes the same handles. `close` is idempotent; a write-mode change
//! only takes effect on the next open, so callers flip mode by
//! close-then-reopen (the coordinator does this around the stop-the-world
//! rebuild).
//!
//! Writer discipline per sub-index:
//! - **Queued** (incremental loads): ops are handed to a dedicated writer
//!   thread over a bounded channel and acknowledged after the group commit
//!   that makes them durable; callers get a pending result.
//! - **Direct** (bulk loads): ops apply on the calling thread with no
//!   queue handoff; the caller commits explicitly at batch boundaries.
//!
//! Within one sub-index, writes to an identifying key are linearized by the
//! writer mutex; last write wins. There is no transaction across the three
//! sub-indexes; drift between them is the consistency checker's problem.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::TermQuery;
use tantivy::schema::{Field, IndexRecordOption, Schema, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info, warn};

use crate::error::IndexError;
use crate::record::RecordId;
use crate::result::{OpResult, WriteOutcome};
use crate::schema::{
    RECORD_ID_FIELD, comment_schema, history_schema, primary_schema, register_tokenizers,
};

/// Depth of each sub-index's queued-write channel.
const WRITE_QUEUE_CAPACITY: usize = 1024;

/// The three sub-indexes, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubIndexName {
    Primary,
    Comments,
    History,
}

impl SubIndexName {
    pub const ALL: [Self; 3] = [Self::Primary, Self::Comments, Self::History];

    /// Directory name and result label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Comments => "comments",
            Self::History => "history",
        }
    }

    /// Human-facing name used in consistency reports.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Primary => "Primary",
            Self::Comments => "Comments",
            Self::History => "History",
        }
    }
}

/// How writes reach a sub-index. Changing the mode requires a close/reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Incremental: queued behind a writer thread, group-committed.
    #[default]
    Queued,
    /// Bulk: applied on the calling thread, committed by the caller.
    Direct,
}

/// One write against one sub-index, addressed by an identifying term where
/// it replaces or removes. The term is usually the record id, but callers
/// may address finer keys (a single comment) within a sub-index.
pub enum WriteOp {
    /// Pure insert for known-new documents (no prior document to remove).
    Create { docs: Vec<TantivyDocument> },
    /// Replace every document under the identifying term.
    Replace {
        term: Term,
        docs: Vec<TantivyDocument>,
    },
    /// Replace the record's documents only if the stored `updated_at_ms`
    /// stamp is not newer than the incoming one (optimistic guard against
    /// out-of-order writes).
    ReplaceIf {
        id: RecordId,
        incoming_stamp: u64,
        docs: Vec<TantivyDocument>,
    },
    /// Remove every document under the identifying term.
    Delete { term: Term },
}

struct Core {
    name: SubIndexName,
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    record_id_field: Field,
    updated_at_field: Option<Field>,
}

impl Core {
    fn identifying_term(&self, id: RecordId) -> Term {
        Term::from_field_u64(self.record_id_field, id)
    }

    /// Fresh searcher over the latest committed state.
    fn searcher(&self) -> Result<tantivy::Searcher, IndexError> {
        self.reader.reload()?;
        Ok(self.reader.searcher())
    }

    /// Stored `updated_at_ms` of the current document for `id`, if any.
    fn current_stamp(&self, id: RecordId) -> Result<Option<u64>, IndexError> {
        let Some(field) = self.updated_at_field else {
            return Ok(None);
        };
        let searcher = self.searcher()?;
        let query = TermQuery::new(self.identifying_term(id), IndexRecordOption::Basic);
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        match top.first() {
            Some((_, addr)) => {
                let doc: TantivyDocument = searcher.doc(*addr)?;
                Ok(doc.get_first(field).and_then(|v| v.as_u64()))
            }
            None => Ok(None),
        }
    }

    /// Apply one op without committing.
    fn apply(&self, op: WriteOp) -> WriteOutcome {
        match op {
            WriteOp::Create { docs } => {
                let writer = self.writer.lock();
                for doc in docs {
                    writer.add_document(doc)?;
                }
                Ok(())
            }
            WriteOp::Replace { term, docs } => {
                let writer = self.writer.lock();
                writer.delete_term(term);
                for doc in docs {
                    writer.add_document(doc)?;
                }
                Ok(())
            }
            WriteOp::ReplaceIf {
                id,
                incoming_stamp,
                docs,
            } => {
                if let Some(existing) = self.current_stamp(id)? {
                    if existing > incoming_stamp {
                        return Err(IndexError::Stale {
                            record_id: id,
                            existing,
                            incoming: incoming_stamp,
                        });
                    }
                }
                let writer = self.writer.lock();
                writer.delete_term(self.identifying_term(id));
                for doc in docs {
                    writer.add_document(doc)?;
                }
                Ok(())
            }
            WriteOp::Delete { term } => {
                let writer = self.writer.lock();
                writer.delete_term(term);
                Ok(())
            }
        }
    }

    fn commit(&self) -> WriteOutcome {
        self.writer.lock().commit()?;
        Ok(())
    }
}

struct QueuedJob {
    op: WriteOp,
    ack: Sender<WriteOutcome>,
}

/// Dedicated writer thread for queued mode; dropping it drains the queue,
/// commits, and joins.
struct QueuedWriter {
    name: &'static str,
    tx: Option<Sender<QueuedJob>>,
    handle: Option<JoinHandle<()>>,
}

impl QueuedWriter {
    fn spawn(core: Arc<Core>) -> Self {
        let (tx, rx) = channel::bounded::<QueuedJob>(WRITE_QUEUE_CAPACITY);
        let name = core.name.as_str();
        let handle = std::thread::Builder::new()
            .name(format!("trackdex-{name}-writer"))
            .spawn(move || {
                let mut group: Vec<(Sender<WriteOutcome>, WriteOutcome)> = Vec::new();
                loop {
                    match rx.recv() {
                        Ok(job) => {
                            let outcome = core.apply(job.op);
                            group.push((job.ack, outcome));
                            // Group-commit once the queue momentarily drains.
                            if rx.is_empty() {
                                commit_group(&core, &mut group);
                            }
                        }
                        Err(_) => {
                            commit_group(&core, &mut group);
                            break;
                        }
                    }
                }
                debug!(sub_index = name, "queued writer stopped");
            })
            .expect("spawning sub-index writer thread");
        Self {
            name,
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn submit(&self, op: WriteOp) -> OpResult {
        let (ack_tx, ack_rx) = channel::bounded(1);
        let job = QueuedJob { op, ack: ack_tx };
        match &self.tx {
            Some(tx) if tx.send(job).is_ok() => OpResult::Pending(ack_rx),
            _ => OpResult::Done(Err(IndexError::WriterClosed { name: self.name })),
        }
    }
}

fn commit_group(core: &Core, group: &mut Vec<(Sender<WriteOutcome>, WriteOutcome)>) {
    if group.is_empty() {
        return;
    }
    let commit_outcome = core.commit();
    for (ack, outcome) in group.drain(..) {
        let merged = match (&commit_outcome, outcome) {
            (Ok(()), op_outcome) => op_outcome,
            (Err(err), Ok(())) => Err(IndexError::Commit {
                name: core.name.as_str(),
                reason: err.to_string(),
            }),
            // The op itself failed; its own error wins over the commit's.
            (Err(_), Err(op_err)) => Err(op_err),
        };
        let _ = ack.send(merged);
    }
}

impl Drop for QueuedWriter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One open sub-index.
pub struct SubIndex {
    // Declared before `core` so the queue drains and joins first on drop.
    queue: Option<QueuedWriter>,
    core: Arc<Core>,
    mode: WriteMode,
}

impl SubIndex {
    fn open(
        name: SubIndexName,
        dir: &Path,
        schema: Schema,
        updated_at_field: Option<Field>,
        mode: WriteMode,
        heap_bytes: usize,
    ) -> Result<Self, IndexError> {
        fs::create_dir_all(dir).map_err(|e| {
            IndexError::config(format!(
                "cannot create sub-index directory {}: {e}",
                dir.display()
            ))
        })?;
        let directory = MmapDirectory::open(dir).map_err(tantivy::TantivyError::from)?;
        let index = Index::open_or_create(directory, schema.clone())?;
        register_tokenizers(&index);
        let record_id_field = schema
            .get_field(RECORD_ID_FIELD)
            .map_err(tantivy::TantivyError::from)?;
        let writer = index.writer_with_num_threads(1, heap_bytes)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let core = Arc::new(Core {
            name,
            index,
            writer: Mutex::new(writer),
            reader,
            record_id_field,
            updated_at_field,
        });
        let queue = match mode {
            WriteMode::Queued => Some(QueuedWriter::spawn(Arc::clone(&core))),
            WriteMode::Direct => None,
        };
        Ok(Self { queue, core, mode })
    }

    pub fn name(&self) -> SubIndexName {
        self.core.name
    }

    /// Identifying term locating all of one record's documents here.
    pub fn record_term(&self, id: RecordId) -> Term {
        self.core.identifying_term(id)
    }

    pub fn write_mode(&self) -> WriteMode {
        self.mode
    }

    /// Apply a write according to the current mode: queued ops come back
    /// pending, direct ops come back completed (and uncommitted).
    pub fn apply(&self, op: WriteOp) -> OpResult {
        match &self.queue {
            Some(queue) => queue.submit(op),
            None => OpResult::Done(self.core.apply(op)),
        }
    }

    /// Commit outstanding direct-mode writes.
    pub fn commit(&self) -> WriteOutcome {
        self.core.commit()
    }

    /// Compact the sub-index down to a single segment.
    pub fn optimize(&self) -> WriteOutcome {
        let mut writer = self.core.writer.lock();
        writer.commit()?;
        let segments = self.core.index.searchable_segment_ids()?;
        if segments.len() > 1 {
            writer.merge(&segments).wait()?;
        }
        Ok(())
    }

    /// Fresh searcher over the latest committed state.
    pub fn searcher(&self) -> Result<tantivy::Searcher, IndexError> {
        self.core.searcher()
    }

    /// Number of live documents.
    pub fn num_docs(&self) -> Result<u64, IndexError> {
        Ok(self.core.searcher()?.num_docs())
    }

    /// Every record id currently present, sorted ascending and deduplicated.
    /// Used as the background rebuild's index snapshot.
    pub fn all_record_ids(&self) -> Result<Vec<RecordId>, IndexError> {
        let searcher = self.core.searcher()?;
        let mut ids = Vec::new();
        for segment_reader in searcher.segment_readers() {
            let column = segment_reader.fast_fields().u64(RECORD_ID_FIELD)?;
            let alive = segment_reader.alive_bitset();
            for doc in 0..segment_reader.max_doc() {
                if alive.is_none_or(|bitset| bitset.is_alive(doc)) {
                    if let Some(id) = column.first(doc) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Stored documents under one identifying key.
    pub fn documents_for(&self, id: RecordId) -> Result<Vec<TantivyDocument>, IndexError> {
        let searcher = self.core.searcher()?;
        let query = TermQuery::new(self.core.identifying_term(id), IndexRecordOption::Basic);
        let top = searcher.search(&query, &TopDocs::with_limit(1024))?;
        let mut docs = Vec::with_capacity(top.len());
        for (_, addr) in top {
            docs.push(searcher.doc(addr)?);
        }
        Ok(docs)
    }
}

/// The three sub-indexes opened and swapped as one unit.
pub struct SubIndexSet {
    root: PathBuf,
    heap_bytes: usize,
    mode: Mutex<WriteMode>,
    open: Mutex<Option<Arc<OpenSet>>>,
}

/// Handles to the currently open sub-indexes.
pub struct OpenSet {
    pub primary: SubIndex,
    pub comments: SubIndex,
    pub history: SubIndex,
}

impl OpenSet {
    pub fn get(&self, name: SubIndexName) -> &SubIndex {
        match name {
            SubIndexName::Primary => &self.primary,
            SubIndexName::Comments => &self.comments,
            SubIndexName::History => &self.history,
        }
    }

    /// Commit all three (direct-mode batch boundary).
    pub fn commit_all(&self) -> WriteOutcome {
        for name in SubIndexName::ALL {
            self.get(name).commit()?;
        }
        Ok(())
    }
}

impl SubIndexSet {
    pub fn new(root: impl Into<PathBuf>, heap_bytes: usize) -> Self {
        Self {
            root: root.into(),
            heap_bytes,
            mode: Mutex::new(WriteMode::Queued),
            open: Mutex::new(None),
        }
    }

    /// Directory of one sub-index under the root.
    pub fn sub_dir(&self, name: SubIndexName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Open (or return the already-open) set. Only one initializer runs;
    /// concurrent openers observe its result.
    pub fn open(&self) -> Result<Arc<OpenSet>, IndexError> {
        let mut slot = self.open.lock();
        if let Some(set) = slot.as_ref() {
            return Ok(Arc::clone(set));
        }
        let mode = *self.mode.lock();
        let (primary_sch, primary_fields) = primary_schema();
        let (comment_sch, _) = comment_schema();
        let (history_sch, _) = history_schema();
        let set = Arc::new(OpenSet {
            primary: SubIndex::open(
                SubIndexName::Primary,
                &self.sub_dir(SubIndexName::Primary),
                primary_sch,
                Some(primary_fields.updated_at_ms),
                mode,
                self.heap_bytes,
            )?,
            comments: SubIndex::open(
                SubIndexName::Comments,
                &self.sub_dir(SubIndexName::Comments),
                comment_sch,
                None,
                mode,
                self.heap_bytes,
            )?,
            history: SubIndex::open(
                SubIndexName::History,
                &self.sub_dir(SubIndexName::History),
                history_sch,
                None,
                mode,
                self.heap_bytes,
            )?,
        });
        info!(root = %self.root.display(), mode = ?mode, "opened sub-index set");
        *slot = Some(Arc::clone(&set));
        Ok(set)
    }

    /// Close the set. Idempotent; queued writers drain and join.
    pub fn close(&self) {
        let taken = self.open.lock().take();
        if taken.is_some() {
            debug!(root = %self.root.display(), "closed sub-index set");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.lock().is_some()
    }

    /// Set the mode used by the *next* open. The current open set keeps its
    /// mode; callers close and reopen to switch.
    pub fn set_write_mode(&self, mode: WriteMode) {
        *self.mode.lock() = mode;
    }

    pub fn write_mode(&self) -> WriteMode {
        *self.mode.lock()
    }

    /// Close and delete all three sub-index directories outright. The next
    /// open recreates them empty.
    pub fn delete_all(&self) -> Result<(), IndexError> {
        self.close();
        for name in SubIndexName::ALL {
            let dir = self.sub_dir(name);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "failed deleting sub-index directory");
                    return Err(IndexError::Directory(e));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::DocumentFactory;
    use crate::record::Record;
    use crate::schema as schemas;
    use std::time::Duration;
    use tempfile::tempdir;

    fn factory() -> DocumentFactory {
        let (_, p) = schemas::primary_schema();
        let (_, c) = schemas::comment_schema();
        let (_, h) = schemas::history_schema();
        DocumentFactory::new(p, c, h)
    }

    fn record_doc(id: u64, stamp: u64) -> TantivyDocument {
        let mut record = Record::new(id, format!("OPS-{id}"));
        record.summary = format!("record {id}");
        record.updated_at_ms = stamp;
        factory().record_document(&record).unwrap().doc
    }

    fn await_op(result: OpResult) -> WriteOutcome {
        match result {
            OpResult::Done(outcome) => outcome,
            OpResult::Pending(rx) => rx
                .recv_timeout(Duration::from_secs(10))
                .expect("queued writer must ack"),
        }
    }

    #[test]
    fn open_is_lazy_and_single_shot() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        assert!(!set.is_open());
        let a = set.open().unwrap();
        let b = set.open().unwrap();
        assert!(Arc::ptr_eq(&a, &b), "second opener must observe the first");
        set.close();
        set.close(); // idempotent
        assert!(!set.is_open());
    }

    #[test]
    fn write_mode_takes_effect_on_next_open() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        let open = set.open().unwrap();
        assert_eq!(open.primary.write_mode(), WriteMode::Queued);
        set.set_write_mode(WriteMode::Direct);
        // Still the old mode until reopened.
        assert_eq!(set.open().unwrap().primary.write_mode(), WriteMode::Queued);
        drop(open);
        set.close();
        assert_eq!(set.open().unwrap().primary.write_mode(), WriteMode::Direct);
    }

    #[test]
    fn queued_replace_is_visible_after_ack() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        let open = set.open().unwrap();
        let outcome = await_op(open.primary.apply(WriteOp::Replace {
            term: open.primary.record_term(1),
            docs: vec![record_doc(1, 100)],
        }));
        outcome.unwrap();
        assert_eq!(open.primary.num_docs().unwrap(), 1);
        assert_eq!(open.primary.all_record_ids().unwrap(), vec![1]);
    }

    #[test]
    fn replace_by_key_keeps_a_single_document() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        let open = set.open().unwrap();
        for stamp in [10, 20, 30] {
            await_op(open.primary.apply(WriteOp::Replace {
                term: open.primary.record_term(7),
                docs: vec![record_doc(7, stamp)],
            }))
            .unwrap();
        }
        assert_eq!(open.primary.num_docs().unwrap(), 1);
        let docs = open.primary.documents_for(7).unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn conditional_replace_rejects_stale_write() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        let open = set.open().unwrap();
        await_op(open.primary.apply(WriteOp::Replace {
            term: open.primary.record_term(3),
            docs: vec![record_doc(3, 2_000)],
        }))
        .unwrap();

        let stale = await_op(open.primary.apply(WriteOp::ReplaceIf {
            id: 3,
            incoming_stamp: 1_000,
            docs: vec![record_doc(3, 1_000)],
        }));
        assert!(matches!(stale, Err(IndexError::Stale { .. })));

        let fresh = await_op(open.primary.apply(WriteOp::ReplaceIf {
            id: 3,
            incoming_stamp: 3_000,
            docs: vec![record_doc(3, 3_000)],
        }));
        fresh.unwrap();
        assert_eq!(open.primary.num_docs().unwrap(), 1);
    }

    #[test]
    fn direct_mode_defers_visibility_to_commit() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        set.set_write_mode(WriteMode::Direct);
        let open = set.open().unwrap();
        let outcome = open.primary.apply(WriteOp::Create {
            docs: vec![record_doc(5, 1)],
        });
        assert!(matches!(outcome, OpResult::Done(Ok(()))));
        assert_eq!(open.primary.num_docs().unwrap(), 0, "not yet committed");
        open.commit_all().unwrap();
        assert_eq!(open.primary.num_docs().unwrap(), 1);
    }

    #[test]
    fn delete_all_wipes_every_sub_index() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        let open = set.open().unwrap();
        await_op(open.primary.apply(WriteOp::Replace {
            term: open.primary.record_term(1),
            docs: vec![record_doc(1, 1)],
        }))
        .unwrap();
        drop(open);
        set.delete_all().unwrap();
        let reopened = set.open().unwrap();
        assert_eq!(reopened.primary.num_docs().unwrap(), 0);
    }

    #[test]
    fn optimize_leaves_one_segment() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        set.set_write_mode(WriteMode::Direct);
        let open = set.open().unwrap();
        for id in 0..4u64 {
            open.primary
                .apply(WriteOp::Create {
                    docs: vec![record_doc(id, id)],
                });
            open.primary.commit().unwrap();
        }
        open.primary.optimize().unwrap();
        assert_eq!(open.primary.num_docs().unwrap(), 4);
        let searcher = open.primary.searcher().unwrap();
        assert_eq!(searcher.segment_readers().len(), 1);
    }

    #[test]
    fn delete_removes_all_documents_for_key() {
        let dir = tempdir().unwrap();
        let set = SubIndexSet::new(dir.path(), 20_000_000);
        let open = set.open().unwrap();
        await_op(open.primary.apply(WriteOp::Replace {
            term: open.primary.record_term(11),
            docs: vec![record_doc(11, 1)],
        }))
        .unwrap();
        await_op(open.primary.apply(WriteOp::Delete {
            term: open.primary.record_term(11),
        }))
        .unwrap();
        assert_eq!(open.primary.num_docs().unwrap(), 0);
        assert!(open.primary.all_record_ids().unwrap().is_empty());
    }
}
