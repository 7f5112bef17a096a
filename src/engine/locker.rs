//! Distributed locker backed by the shared database.
//!
//! A lock is a queue of rows in the `locks` table: whoever holds the row
//! with the minimum id for a name holds the lock. This works across tasks
//! and across processes sharing the same database file. Unlock is an
//! idempotent row delete, so double release (including after a forced
//! `clear`) never raises.

use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::Result;
use crate::storage::SqliteStorage;

/// How long a blocking acquire waits between queue polls.
const ACQUIRE_POLL: Duration = Duration::from_millis(25);
/// Give up on a blocking acquire after this many polls and force the queue
/// clear, so a crashed holder cannot wedge a run group forever.
const ACQUIRE_MAX_POLLS: u32 = 2400;

/// Handle for a held (or queued) lock row.
#[derive(Debug)]
pub struct LockHandle {
    id: i64,
    name: String,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named mutual exclusion over the storage lock table.
#[derive(Clone)]
pub struct Locker {
    storage: SqliteStorage,
}

impl Locker {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// Blocking acquire: enqueue a row and wait until it is the head of the
    /// queue for `name`.
    pub async fn lock(&self, name: &str) -> Result<LockHandle> {
        let id = self.storage.insert_lock(name).await?;
        let mut polls = 0u32;
        loop {
            match self.storage.min_lock_id(name).await? {
                Some(min) if min == id => {
                    return Ok(LockHandle {
                        id,
                        name: name.to_string(),
                    })
                }
                // Our row vanished (forced clear); re-enqueue.
                None => {
                    let id = self.storage.insert_lock(name).await?;
                    return self.wait_for_head(name, id).await;
                }
                Some(_) => {}
            }
            polls += 1;
            if polls >= ACQUIRE_MAX_POLLS {
                warn!(lock = name, "Lock acquire timed out, clearing stale queue");
                self.storage.clear_locks(name).await?;
                let id = self.storage.insert_lock(name).await?;
                return self.wait_for_head(name, id).await;
            }
            sleep(ACQUIRE_POLL).await;
        }
    }

    async fn wait_for_head(&self, name: &str, id: i64) -> Result<LockHandle> {
        loop {
            if self.storage.min_lock_id(name).await? == Some(id) {
                return Ok(LockHandle {
                    id,
                    name: name.to_string(),
                });
            }
            sleep(ACQUIRE_POLL).await;
        }
    }

    /// Non-blocking acquire: `None` means somebody else holds the lock.
    pub async fn try_lock(&self, name: &str) -> Result<Option<LockHandle>> {
        let id = self.storage.insert_lock(name).await?;
        if self.storage.min_lock_id(name).await? == Some(id) {
            Ok(Some(LockHandle {
                id,
                name: name.to_string(),
            }))
        } else {
            // Leave the queue; somebody beat us to it.
            self.storage.delete_lock(id).await?;
            Ok(None)
        }
    }

    /// Release a held lock. Tolerant of double release.
    pub async fn unlock(&self, handle: LockHandle) -> Result<()> {
        self.storage.delete_lock(handle.id).await
    }

    /// Whether anyone currently holds or waits on the lock.
    pub async fn is_locked(&self, name: &str) -> Result<bool> {
        self.storage.locks_exist(name).await
    }

    /// Forced clear of the whole queue for a name.
    pub async fn clear(&self, name: &str) -> Result<()> {
        self.storage.clear_locks(name).await
    }
}
