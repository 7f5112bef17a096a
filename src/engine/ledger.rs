//! Step ledger: the per-run idempotency counter.
//!
//! Every run's tick stream carries a `WorkEvent` row whose `process` column
//! is the highest committed step index. `advance_if_next` is a database
//! compare-and-set: the write is the commit point, so a crash or duplicate
//! tick between "step done" and "ledger advanced" cannot replay an
//! externally visible side effect.

use crate::error::Result;
use crate::storage::SqliteStorage;

/// Sentinel index marking "run is logically finished".
pub const PROCESS_FINISHED: i64 = 999;

/// Step index for the "run started" notification.
pub const STEP_NOTIFY_START: i64 = 1;
/// First step index owned by the executor (its one-shot side effect, e.g.
/// a remote submission or a local process launch).
pub const STEP_EXECUTE: i64 = 2;

/// Step ledger over a run's work event row.
#[derive(Clone)]
pub struct StepLedger {
    storage: SqliteStorage,
}

impl StepLedger {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// If the stored index is exactly `target - 1`, persist `target` and
    /// return true: the caller must perform the step's side effect now.
    /// Otherwise return false: the step already happened (or is out of
    /// order) and the caller must skip to reading its result instead of
    /// re-executing it.
    pub async fn advance_if_next(&self, event_id: &str, target: i64) -> Result<bool> {
        self.storage.advance_event_process(event_id, target).await
    }

    /// Jump the counter to the finished sentinel, regardless of the current
    /// index. Returns true exactly once per run, which is what gates the
    /// "ended" notification. The row itself is deleted by the ticker when
    /// it observes the finished outcome.
    pub async fn mark_finished(&self, event_id: &str) -> Result<bool> {
        self.storage
            .finish_event_process(event_id, PROCESS_FINISHED)
            .await
    }

    /// Drop the ledger row once the tick stream is done.
    pub async fn finish(&self, event_id: &str) -> Result<()> {
        self.storage.delete_work_event(event_id).await
    }
}
