//! Configuration for the index-maintenance engine.
//!
//! Plain serde structs with defaults; loading them from disk or wiring them
//! into a process is the embedder's concern.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Top-level indexing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Root directory holding the three sub-index directories.
    pub index_root: PathBuf,

    /// How long a lock acquisition may wait before the operation is aborted
    /// with a "temporarily unavailable" signal.
    pub lock_wait_ms: u64,

    /// How long `ResultAccumulator::await_all` waits for queued writes.
    pub result_wait_ms: u64,

    /// Records per page during full walks of the record store.
    pub batch_size: usize,

    /// Heap budget handed to each tantivy writer.
    pub writer_heap_bytes: usize,

    /// Parallel bulk-write tuning.
    pub parallel: ParallelismConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_root: PathBuf::new(),
            lock_wait_ms: 30_000,
            result_wait_ms: 30_000,
            batch_size: 1000,
            writer_heap_bytes: 50_000_000,
            parallel: ParallelismConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Lock acquisition timeout as a [`Duration`].
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Composite-result await timeout as a [`Duration`].
    pub fn result_wait(&self) -> Duration {
        Duration::from_millis(self.result_wait_ms)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.index_root.as_os_str().is_empty() {
            return Err(IndexError::config("index root path not set"));
        }
        if self.batch_size == 0 {
            return Err(IndexError::config("batch_size must be >= 1"));
        }
        if self.parallel.threads == 0 {
            return Err(IndexError::config("parallel.threads must be >= 1"));
        }
        if self.parallel.max_queue == 0 {
            return Err(IndexError::config("parallel.max_queue must be >= 1"));
        }
        Ok(())
    }
}

/// Tuning for the bounded-pool indexing strategy used by bulk direct-mode
/// writes. Batches below `min_batch_size` fall back to the serial strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelismConfig {
    pub min_batch_size: usize,
    pub threads: usize,
    pub max_queue: usize,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 50,
            threads: 20,
            max_queue: 1000,
        }
    }
}
