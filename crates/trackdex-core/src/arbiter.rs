//! Two-tier lock keeping online maintenance and full rebuilds apart.
//!
//! *Maintenance* holders (single-record edits, the background rebuild's
//! shared walk) may run concurrently with each other. A *rebuild* holder
//! (the stop-the-world reindex that deletes and recreates everything) is
//! exclusive: it waits out all maintenance holders and blocks new ones.
//!
//! Acquisition is timed and never panics or errors on contention: a `None`
//! return means "index temporarily unavailable" and the caller aborts its
//! operation, logging the identity of whatever it could not service.

use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// The shared/exclusive gate over all index mutation.
pub struct LockArbiter {
    inner: RwLock<()>,
    wait: Duration,
}

/// Shared hold: online edits and the background walk.
pub struct MaintenanceGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive hold: the stop-the-world rebuild.
pub struct RebuildGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl LockArbiter {
    /// Arbiter whose acquisitions wait at most `wait` before giving up.
    pub fn new(wait: Duration) -> Self {
        Self {
            inner: RwLock::new(()),
            wait,
        }
    }

    /// Try to join the maintenance tier. Any number of holders may coexist;
    /// fails only while a rebuild holds (or drains toward) the exclusive
    /// lock past the configured wait.
    pub fn maintenance(&self) -> Option<MaintenanceGuard<'_>> {
        match self.inner.try_read_for(self.wait) {
            Some(guard) => Some(MaintenanceGuard { _guard: guard }),
            None => {
                warn!(
                    wait_ms = self.wait.as_millis() as u64,
                    "maintenance lock wait timed out"
                );
                None
            }
        }
    }

    /// Try to take the exclusive rebuild lock. Blocks until every
    /// maintenance holder releases (a background rebuild releases at its
    /// next batch-boundary cancellation check) or the wait elapses.
    pub fn rebuild(&self) -> Option<RebuildGuard<'_>> {
        match self.inner.try_write_for(self.wait) {
            Some(guard) => Some(RebuildGuard { _guard: guard }),
            None => {
                warn!(
                    wait_ms = self.wait.as_millis() as u64,
                    "rebuild lock wait timed out"
                );
                None
            }
        }
    }
}
