//! Per-record index/deindex/reindex execution over the sub-index set.
//!
//! Every operation here assumes the caller already holds the appropriate
//! arbiter lock; the coordinator wraps these calls. Each record's write
//! against each sub-index becomes one named entry in a
//! [`ResultAccumulator`]; a partial write (primary succeeded, comments
//! failed) is therefore recorded as a partial failure, never dropped.
//!
//! Bulk loads go through [`RecordIndexer::index_batch`], which picks the
//! bounded-pool strategy for batches at or above the configured minimum and
//! falls back to serial below it.

use std::sync::Arc;

use tracing::debug;

use crate::config::ParallelismConfig;
use crate::documents::DocumentFactory;
use crate::error::IndexError;
use crate::record::{Comment, Record, RecordId};
use crate::result::{ResultAccumulator, ResultEntry};
use crate::schema::{comment_schema, history_schema, primary_schema};
use crate::store::RecordStore;
use crate::strategy::{IndexTask, IndexingStrategy, ParallelStrategy, SimpleStrategy};
use crate::subindex::{OpenSet, SubIndexName, SubIndexSet, WriteOp};
use tantivy::Term;

/// Which parts of a record to refresh, and how strictly.
#[derive(Debug, Clone, Copy)]
pub struct ReindexOptions {
    pub comments: bool,
    pub history: bool,
    /// Reject the write if the index already holds a newer document.
    pub conditional: bool,
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            comments: true,
            history: true,
            conditional: false,
        }
    }
}

/// Executes per-record writes against the three sub-indexes.
pub struct RecordIndexer {
    set: Arc<SubIndexSet>,
    store: Arc<dyn RecordStore>,
    factory: Arc<DocumentFactory>,
    parallel: ParallelismConfig,
    comment_id_field: tantivy::schema::Field,
}

impl RecordIndexer {
    pub fn new(
        set: Arc<SubIndexSet>,
        store: Arc<dyn RecordStore>,
        parallel: ParallelismConfig,
    ) -> Self {
        let (_, primary_fields) = primary_schema();
        let (_, comment_fields) = comment_schema();
        let (_, history_fields) = history_schema();
        let factory = Arc::new(DocumentFactory::new(
            primary_fields,
            comment_fields,
            history_fields,
        ));
        Self {
            set,
            store,
            factory,
            parallel,
            comment_id_field: comment_fields.comment_id,
        }
    }

    /// Pure insert for known-new records: no prior documents to remove.
    pub fn index_records(&self, records: &[Record]) -> Result<ResultAccumulator, IndexError> {
        let open = self.set.open()?;
        let acc = ResultAccumulator::new();
        let strategy = SimpleStrategy;
        for record in records {
            let task = create_task(
                Arc::clone(&open),
                Arc::clone(&self.factory),
                Arc::clone(&self.store),
                record.clone(),
            );
            acc.add_task(strategy.execute(task));
        }
        strategy.close();
        Ok(acc)
    }

    /// Replace-by-identifying-key for possibly-existing records.
    pub fn reindex_records(
        &self,
        records: &[Record],
        options: ReindexOptions,
    ) -> Result<ResultAccumulator, IndexError> {
        let open = self.set.open()?;
        let acc = ResultAccumulator::new();
        let strategy = SimpleStrategy;
        for record in records {
            let task = reindex_task(
                Arc::clone(&open),
                Arc::clone(&self.factory),
                Arc::clone(&self.store),
                record.clone(),
                options,
            );
            acc.add_task(strategy.execute(task));
        }
        strategy.close();
        Ok(acc)
    }

    /// Remove primary + comment + history documents for each record.
    pub fn deindex_records(&self, records: &[Record]) -> Result<ResultAccumulator, IndexError> {
        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        self.deindex_ids(&ids)
    }

    /// Remove by id alone (used by rebuild fix-up passes, where the record
    /// no longer exists in the store).
    pub fn deindex_ids(&self, ids: &[RecordId]) -> Result<ResultAccumulator, IndexError> {
        let open = self.set.open()?;
        let acc = ResultAccumulator::new();
        for &id in ids {
            for name in SubIndexName::ALL {
                let sub = open.get(name);
                let term = sub.record_term(id);
                acc.add_entries(vec![ResultEntry {
                    sub_index: name.as_str(),
                    record_id: id,
                    result: sub.apply(WriteOp::Delete { term }),
                }]);
            }
        }
        Ok(acc)
    }

    /// Replace individual comment documents by their own identifying keys,
    /// leaving sibling comments alone.
    pub fn reindex_comments(&self, comments: &[Comment]) -> Result<ResultAccumulator, IndexError> {
        let open = self.set.open()?;
        let acc = ResultAccumulator::new();
        for comment in comments {
            let term = Term::from_field_u64(self.comment_id_field, comment.id);
            let docs = self.factory.comment_document(comment).into_iter().collect();
            acc.add_entries(vec![ResultEntry {
                sub_index: SubIndexName::Comments.as_str(),
                record_id: comment.record_id,
                result: open.comments.apply(WriteOp::Replace { term, docs }),
            }]);
        }
        Ok(acc)
    }

    /// Bulk insert for the stop-the-world rebuild. The sub-index set must
    /// already be open in direct mode; batches at or above the parallel
    /// minimum run on the bounded pool.
    pub fn index_batch(&self, records: &[Record]) -> Result<ResultAccumulator, IndexError> {
        if records.len() < self.parallel.min_batch_size {
            return self.index_records(records);
        }
        let open = self.set.open()?;
        let acc = ResultAccumulator::new();
        let strategy = ParallelStrategy::new(&self.parallel, "trackdex-bulk");
        for record in records {
            let task = create_task(
                Arc::clone(&open),
                Arc::clone(&self.factory),
                Arc::clone(&self.store),
                record.clone(),
            );
            acc.add_task(strategy.execute(task));
        }
        strategy.close();
        debug!(records = records.len(), "bulk batch dispatched");
        Ok(acc)
    }

    /// Commit all three sub-indexes (direct-mode batch boundary).
    pub fn commit_all(&self) -> Result<(), IndexError> {
        self.set.open()?.commit_all()
    }

    /// Compact all three sub-indexes.
    pub fn optimize(&self) -> Result<ResultAccumulator, IndexError> {
        let open = self.set.open()?;
        let acc = ResultAccumulator::new();
        for name in SubIndexName::ALL {
            acc.add_entries(vec![ResultEntry::done(
                name.as_str(),
                0,
                open.get(name).optimize(),
            )]);
        }
        Ok(acc)
    }

    /// Sorted ids currently present in the primary sub-index (the rebuild
    /// snapshot).
    pub fn snapshot_primary_ids(&self) -> Result<Vec<RecordId>, IndexError> {
        self.set.open()?.primary.all_record_ids()
    }

    /// Live document count of one sub-index.
    pub fn num_docs(&self, name: SubIndexName) -> Result<u64, IndexError> {
        self.set.open()?.get(name).num_docs()
    }

    /// Delete all three sub-indexes outright; they reopen empty.
    pub fn delete_indexes(&self) -> Result<(), IndexError> {
        self.set.delete_all()
    }

    pub fn sub_indexes(&self) -> &Arc<SubIndexSet> {
        &self.set
    }

    pub fn document_factory(&self) -> &Arc<DocumentFactory> {
        &self.factory
    }
}

/// Build the three-sub-index create operation for one known-new record.
fn create_task(
    open: Arc<OpenSet>,
    factory: Arc<DocumentFactory>,
    store: Arc<dyn RecordStore>,
    record: Record,
) -> IndexTask {
    Box::new(move || {
        let id = record.id;
        let mut entries = Vec::with_capacity(3);

        match factory.record_document(&record) {
            Some(built) => entries.push(ResultEntry {
                sub_index: SubIndexName::Primary.as_str(),
                record_id: id,
                result: open.primary.apply(WriteOp::Create {
                    docs: vec![built.doc],
                }),
            }),
            None => entries.push(ResultEntry::done(
                SubIndexName::Primary.as_str(),
                id,
                Err(IndexError::DocumentAbsent { record_id: id }),
            )),
        }

        match child_documents(&factory, &store, &record) {
            Ok((comment_docs, history_docs)) => {
                if !comment_docs.is_empty() {
                    entries.push(ResultEntry {
                        sub_index: SubIndexName::Comments.as_str(),
                        record_id: id,
                        result: open.comments.apply(WriteOp::Create { docs: comment_docs }),
                    });
                }
                if !history_docs.is_empty() {
                    entries.push(ResultEntry {
                        sub_index: SubIndexName::History.as_str(),
                        record_id: id,
                        result: open.history.apply(WriteOp::Create { docs: history_docs }),
                    });
                }
            }
            Err(err) => entries.push(ResultEntry::done(
                SubIndexName::Comments.as_str(),
                id,
                Err(err),
            )),
        }

        entries
    })
}

/// Build the replace operation for one possibly-existing record.
fn reindex_task(
    open: Arc<OpenSet>,
    factory: Arc<DocumentFactory>,
    store: Arc<dyn RecordStore>,
    record: Record,
    options: ReindexOptions,
) -> IndexTask {
    Box::new(move || {
        let id = record.id;
        let mut entries = Vec::with_capacity(3);

        match factory.record_document(&record) {
            Some(built) => {
                let op = if options.conditional {
                    WriteOp::ReplaceIf {
                        id,
                        incoming_stamp: record.updated_at_ms,
                        docs: vec![built.doc],
                    }
                } else {
                    WriteOp::Replace {
                        term: open.primary.record_term(id),
                        docs: vec![built.doc],
                    }
                };
                entries.push(ResultEntry {
                    sub_index: SubIndexName::Primary.as_str(),
                    record_id: id,
                    result: open.primary.apply(op),
                });
            }
            None => entries.push(ResultEntry::done(
                SubIndexName::Primary.as_str(),
                id,
                Err(IndexError::DocumentAbsent { record_id: id }),
            )),
        }

        if options.comments {
            let result = match comment_documents(&factory, &store, &record) {
                Ok(docs) => open.comments.apply(WriteOp::Replace {
                    term: open.comments.record_term(id),
                    docs,
                }),
                Err(err) => crate::result::OpResult::Done(Err(err)),
            };
            entries.push(ResultEntry {
                sub_index: SubIndexName::Comments.as_str(),
                record_id: id,
                result,
            });
        }

        if options.history {
            let result = match history_documents(&factory, &store, &record) {
                Ok(docs) => open.history.apply(WriteOp::Replace {
                    term: open.history.record_term(id),
                    docs,
                }),
                Err(err) => crate::result::OpResult::Done(Err(err)),
            };
            entries.push(ResultEntry {
                sub_index: SubIndexName::History.as_str(),
                record_id: id,
                result,
            });
        }

        entries
    })
}

fn comment_documents(
    factory: &DocumentFactory,
    store: &Arc<dyn RecordStore>,
    record: &Record,
) -> Result<Vec<tantivy::TantivyDocument>, IndexError> {
    Ok(store
        .comments(record.id)?
        .iter()
        .filter_map(|c| factory.comment_document(c))
        .collect())
}

fn history_documents(
    factory: &DocumentFactory,
    store: &Arc<dyn RecordStore>,
    record: &Record,
) -> Result<Vec<tantivy::TantivyDocument>, IndexError> {
    Ok(store
        .change_history(record.id)?
        .iter()
        .filter_map(|g| factory.history_document(g))
        .collect())
}

fn child_documents(
    factory: &DocumentFactory,
    store: &Arc<dyn RecordStore>,
    record: &Record,
) -> Result<(Vec<tantivy::TantivyDocument>, Vec<tantivy::TantivyDocument>), IndexError> {
    Ok((
        comment_documents(factory, store, record)?,
        history_documents(factory, store, record)?,
    ))
}
