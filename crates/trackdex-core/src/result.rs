//! Composite results for batched index writes.
//!
//! Every per-record write yields one or more named [`ResultEntry`]s (one per
//! touched sub-index). Entries may be completed already (direct writes) or
//! pending on a channel (queued writes, pooled tasks). The
//! [`ResultAccumulator`] merges them all into one awaitable outcome:
//! `await_all` blocks until every constituent completes or the timeout
//! elapses, and a single failure never short-circuits its siblings; all
//! errors are surfaced together at the end.

use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::IndexError;
use crate::record::RecordId;

/// Outcome of one write against one sub-index.
pub type WriteOutcome = Result<(), IndexError>;

/// A single write's result: already done, or pending on a channel.
pub enum OpResult {
    Done(WriteOutcome),
    Pending(Receiver<WriteOutcome>),
}

impl OpResult {
    fn resolve(self, deadline: Option<Instant>) -> Result<WriteOutcome, Expired> {
        match self {
            Self::Done(outcome) => Ok(outcome),
            Self::Pending(rx) => match deadline {
                None => rx
                    .recv()
                    .map_err(|_| Expired::ChannelClosed),
                Some(deadline) => rx.recv_deadline(deadline).map_err(|e| match e {
                    RecvTimeoutError::Timeout => Expired::Timeout,
                    RecvTimeoutError::Disconnected => Expired::ChannelClosed,
                }),
            },
        }
    }
}

enum Expired {
    Timeout,
    ChannelClosed,
}

/// One named per-record, per-sub-index result.
pub struct ResultEntry {
    pub sub_index: &'static str,
    pub record_id: RecordId,
    pub result: OpResult,
}

impl ResultEntry {
    pub fn done(sub_index: &'static str, record_id: RecordId, outcome: WriteOutcome) -> Self {
        Self {
            sub_index,
            record_id,
            result: OpResult::Done(outcome),
        }
    }

    pub fn pending(
        sub_index: &'static str,
        record_id: RecordId,
        rx: Receiver<WriteOutcome>,
    ) -> Self {
        Self {
            sub_index,
            record_id,
            result: OpResult::Pending(rx),
        }
    }
}

/// What a strategy execution hands back: the entries themselves, or a
/// channel that will carry them once a pool worker has run the task.
pub enum TaskResult {
    Done(Vec<ResultEntry>),
    Pending(Receiver<Vec<ResultEntry>>),
}

/// One failure surfaced by `await_all`.
#[derive(Debug)]
pub struct FailureReport {
    pub sub_index: &'static str,
    pub record_id: RecordId,
    pub error: IndexError,
}

/// Aggregate outcome of awaiting a batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// `false` when the await timed out before every result completed.
    pub completed: bool,
    /// Entries resolved (successes + failures).
    pub resolved: usize,
    pub failures: Vec<FailureReport>,
}

impl BatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.completed && self.failures.is_empty()
    }
}

/// Thread-safe, append-only collector of task results; consumed exactly
/// once via [`ResultAccumulator::await_all`].
#[derive(Default)]
pub struct ResultAccumulator {
    tasks: Mutex<Vec<TaskResult>>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one strategy execution's result.
    pub fn add_task(&self, task: TaskResult) {
        self.tasks.lock().push(task);
    }

    /// Append already-materialized entries.
    pub fn add_entries(&self, entries: Vec<ResultEntry>) {
        self.add_task(TaskResult::Done(entries));
    }

    /// Fold another accumulator's tasks into this one.
    pub fn merge(&self, other: ResultAccumulator) {
        let mut mine = self.tasks.lock();
        mine.extend(other.tasks.into_inner());
    }

    /// Block until every constituent result completes, or until `timeout`
    /// elapses (`None` waits indefinitely, used by optimize and the
    /// stop-the-world rebuild). Failures are logged with the record
    /// identity and collected; they never abort the await.
    pub fn await_all(self, timeout: Option<Duration>) -> BatchOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outcome = BatchOutcome {
            completed: true,
            ..BatchOutcome::default()
        };

        let tasks = self.tasks.into_inner();
        let mut entries = Vec::new();
        for task in tasks {
            match task {
                TaskResult::Done(batch) => entries.extend(batch),
                TaskResult::Pending(rx) => {
                    let received = match deadline {
                        None => rx.recv().map_err(|_| Expired::ChannelClosed),
                        Some(deadline) => rx.recv_deadline(deadline).map_err(|e| match e {
                            RecvTimeoutError::Timeout => Expired::Timeout,
                            RecvTimeoutError::Disconnected => Expired::ChannelClosed,
                        }),
                    };
                    match received {
                        Ok(batch) => entries.extend(batch),
                        Err(Expired::Timeout) => {
                            warn!("timed out waiting for a pooled index task");
                            outcome.completed = false;
                            return outcome;
                        }
                        Err(Expired::ChannelClosed) => {
                            warn!("a pooled index task was dropped before reporting");
                            outcome.failures.push(FailureReport {
                                sub_index: "pool",
                                record_id: 0,
                                error: IndexError::WriterClosed { name: "pool" },
                            });
                        }
                    }
                }
            }
        }

        for entry in entries {
            let ResultEntry {
                sub_index,
                record_id,
                result,
            } = entry;
            match result.resolve(deadline) {
                Ok(Ok(())) => outcome.resolved += 1,
                Ok(Err(err)) => {
                    outcome.resolved += 1;
                    error!(
                        sub_index,
                        record_id,
                        error = %err,
                        "index write failed"
                    );
                    outcome.failures.push(FailureReport {
                        sub_index,
                        record_id,
                        error: err,
                    });
                }
                Err(Expired::Timeout) => {
                    warn!(sub_index, record_id, "timed out awaiting index write");
                    outcome.completed = false;
                    return outcome;
                }
                Err(Expired::ChannelClosed) => {
                    outcome.resolved += 1;
                    outcome.failures.push(FailureReport {
                        sub_index,
                        record_id,
                        error: IndexError::WriterClosed { name: sub_index },
                    });
                }
            }
        }

        outcome
    }
}
