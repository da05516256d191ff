//! Deterministic descending-id walk over the record store.
//!
//! The pager computes the store's maximum record id once at construction (a
//! descending high-water mark), then yields fixed-size pages of records with
//! `id <= watermark`, ordered descending. After each page the watermark
//! drops by the batch size, clamped further down past any id gaps
//! (`min(watermark, lowest_visited_id - 1)`) so pages stay full even when
//! ids are sparse. The walk ends when the watermark falls below zero or a
//! page comes back empty.
//!
//! Each visited record passes through an optional spy before it is yielded;
//! the background rebuild hooks its reconciler in here.

use crate::record::Record;
use crate::store::{RecordFilter, RecordStore, StoreError};

/// Observes every record the pager visits, in visit order.
pub trait RecordSpy: Send + Sync {
    fn observe(&self, record: &Record);
}

/// Fixed-size, descending batch iterator over a record store.
pub struct BatchPager<'a> {
    store: &'a dyn RecordStore,
    batch_size: usize,
    filter: RecordFilter,
    spy: Option<&'a dyn RecordSpy>,
    /// Upper bound (inclusive) of the next page; negative = exhausted.
    watermark: i64,
}

impl<'a> BatchPager<'a> {
    /// Pager over the whole store. Snapshots the current max id once; two
    /// pagers built against the same store state visit the same ids in the
    /// same order.
    pub fn new(store: &'a dyn RecordStore, batch_size: usize) -> Result<Self, StoreError> {
        let watermark = store.max_record_id()?.map_or(-1, |id| id as i64);
        Ok(Self {
            store,
            batch_size: batch_size.max(1),
            filter: RecordFilter::any(),
            spy: None,
            watermark,
        })
    }

    /// Restrict the walk with a store-side filter.
    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Attach a spy observing each visited record.
    pub fn with_spy(mut self, spy: &'a dyn RecordSpy) -> Self {
        self.spy = Some(spy);
        self
    }

    /// Produce the next page, or `None` when the walk is complete.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Record>>, StoreError> {
        if self.watermark < 0 {
            return Ok(None);
        }
        let upper = self.watermark as u64;
        let records = self
            .store
            .records_page(upper, self.batch_size, &self.filter)?;
        if records.is_empty() {
            self.watermark = -1;
            return Ok(None);
        }

        let mut next = self.watermark - self.batch_size as i64;
        for record in &records {
            if let Some(spy) = self.spy {
                spy.observe(record);
            }
            next = next.min(record.id as i64 - 1);
        }
        self.watermark = next;
        Ok(Some(records))
    }
}

impl Iterator for BatchPager<'_> {
    type Item = Result<Vec<Record>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}
