//! SQLite storage implementation.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};
use crate::workflow::{WorkDefinition, WorkType, WorkflowDefinition};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking, so it
/// is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_datetime_utc(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_datetime_utc(&v)).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

/// SQLite-based storage.
///
/// A single connection behind an async mutex, WAL mode, busy timeout. The
/// same database backs entity storage, the step ledger, and the lock table,
/// which is what makes the locker work across processes sharing the file.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS works (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                work_type TEXT NOT NULL,
                config TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                node_list TEXT NOT NULL,
                node_mapping TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS work_instances (
                id TEXT PRIMARY KEY,
                work_id TEXT NOT NULL,
                workflow_instance_id TEXT,
                status TEXT NOT NULL,
                instance_type TEXT NOT NULL,
                timer_fired INTEGER NOT NULL DEFAULT 0,
                version_id TEXT,
                submit_log TEXT NOT NULL DEFAULT '',
                result_data TEXT,
                remote_handle TEXT,
                pid INTEGER,
                started_at TEXT,
                finished_at TEXT,
                duration_seconds INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_work_instances_flow
                ON work_instances(workflow_instance_id);
            CREATE INDEX IF NOT EXISTS idx_work_instances_work
                ON work_instances(work_id);

            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                instance_type TEXT NOT NULL,
                run_log TEXT NOT NULL DEFAULT '',
                started_at TEXT,
                finished_at TEXT,
                duration_seconds INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS work_events (
                id TEXT PRIMARY KEY,
                process INTEGER NOT NULL DEFAULT 0,
                context TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS locks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_locks_name ON locks(name);
            "#,
        )?;
        Ok(())
    }

    // ----- work definitions -----

    pub async fn save_work(&self, work: &WorkDefinition) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO works (id, name, work_type, config) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, work_type = ?3, config = ?4",
            params![
                work.id,
                work.name,
                work.work_type.to_string(),
                serde_json::to_string(&work.config)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_work(&self, id: &str) -> Result<WorkDefinition> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, work_type, config FROM works WHERE id = ?1",
            params![id],
            |row| {
                Ok(WorkDefinition {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    work_type: parse_enum::<WorkType>(&row.get::<_, String>(2)?)?,
                    config: serde_json::from_str(&row.get::<_, String>(3)?).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("work '{}'", id)))
    }

    // ----- workflow definitions -----

    pub async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflows (id, name, node_list, node_mapping) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, node_list = ?3, node_mapping = ?4",
            params![
                workflow.id,
                workflow.name,
                serde_json::to_string(&workflow.node_list)?,
                serde_json::to_string(&workflow.node_mapping)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<WorkflowDefinition> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, node_list, node_mapping FROM workflows WHERE id = ?1",
            params![id],
            |row| {
                Ok(WorkflowDefinition {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    node_list: serde_json::from_str(&row.get::<_, String>(2)?).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    node_mapping: serde_json::from_str(&row.get::<_, String>(3)?).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("workflow '{}'", id)))
    }

    // ----- work instances -----

    fn work_instance_from_row(row: &Row<'_>) -> rusqlite::Result<WorkInstance> {
        Ok(WorkInstance {
            id: row.get(0)?,
            work_id: row.get(1)?,
            workflow_instance_id: row.get(2)?,
            status: parse_enum::<InstanceStatus>(&row.get::<_, String>(3)?)?,
            instance_type: parse_enum::<InstanceType>(&row.get::<_, String>(4)?)?,
            timer_fired: row.get::<_, i64>(5)? != 0,
            version_id: row.get(6)?,
            submit_log: row.get(7)?,
            result_data: row.get(8)?,
            remote_handle: row.get(9)?,
            pid: row.get::<_, Option<i64>>(10)?.map(|p| p as u32),
            started_at: parse_opt_datetime_utc(row.get(11)?)?,
            finished_at: parse_opt_datetime_utc(row.get(12)?)?,
            duration_seconds: row.get(13)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(14)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(15)?)?,
        })
    }

    const WORK_INSTANCE_COLUMNS: &'static str = "id, work_id, workflow_instance_id, status, \
        instance_type, timer_fired, version_id, submit_log, result_data, remote_handle, pid, \
        started_at, finished_at, duration_seconds, created_at, updated_at";

    pub async fn save_work_instance(&self, instance: &WorkInstance) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO work_instances (id, work_id, workflow_instance_id, status, instance_type, \
             timer_fired, version_id, submit_log, result_data, remote_handle, pid, started_at, \
             finished_at, duration_seconds, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                 status = ?4, instance_type = ?5, timer_fired = ?6, version_id = ?7,
                 submit_log = ?8, result_data = ?9, remote_handle = ?10, pid = ?11,
                 started_at = ?12, finished_at = ?13, duration_seconds = ?14, updated_at = ?16",
            params![
                instance.id,
                instance.work_id,
                instance.workflow_instance_id,
                instance.status.to_string(),
                instance.instance_type.to_string(),
                instance.timer_fired as i64,
                instance.version_id,
                instance.submit_log,
                instance.result_data,
                instance.remote_handle,
                instance.pid.map(|p| p as i64),
                instance.started_at.map(|t| t.to_rfc3339()),
                instance.finished_at.map(|t| t.to_rfc3339()),
                instance.duration_seconds,
                instance.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_work_instance(&self, id: &str) -> Result<WorkInstance> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM work_instances WHERE id = ?1",
            Self::WORK_INSTANCE_COLUMNS
        );
        conn.query_row(&sql, params![id], Self::work_instance_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("work instance '{}'", id)))
    }

    /// Compare-and-set on the status column: the write applies only while the
    /// stored status is one of `expected`, so a racing terminal write cannot
    /// be overwritten. Returns whether the transition took effect.
    pub async fn set_instance_status_if(
        &self,
        id: &str,
        expected: &[InstanceStatus],
        next: InstanceStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        // Status strings come from the enum's Display, not from user input.
        let guard = expected
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE work_instances SET status = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status IN ({})",
            guard
        );
        let updated = conn.execute(
            &sql,
            params![next.to_string(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated == 1)
    }

    /// The member instance of a workflow run that executes the given work.
    pub async fn find_instance_by_work_and_flow(
        &self,
        work_id: &str,
        workflow_instance_id: &str,
    ) -> Result<WorkInstance> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM work_instances WHERE work_id = ?1 AND workflow_instance_id = ?2",
            Self::WORK_INSTANCE_COLUMNS
        );
        conn.query_row(&sql, params![work_id, workflow_instance_id], Self::work_instance_from_row)
            .optional()?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "instance of work '{}' in workflow run '{}'",
                    work_id, workflow_instance_id
                ))
            })
    }

    /// Member instances of a workflow run restricted to the given works
    /// (parent or end-node lookups).
    pub async fn find_instances_by_works_and_flow(
        &self,
        work_ids: &[String],
        workflow_instance_id: &str,
    ) -> Result<Vec<WorkInstance>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM work_instances WHERE workflow_instance_id = ?1",
            Self::WORK_INSTANCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workflow_instance_id], Self::work_instance_from_row)?;
        let mut instances = Vec::new();
        for row in rows {
            let instance = row?;
            if work_ids.contains(&instance.work_id) {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    /// All run instances of a work, oldest first.
    pub async fn find_instances_by_work(&self, work_id: &str) -> Result<Vec<WorkInstance>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM work_instances WHERE work_id = ?1 ORDER BY created_at",
            Self::WORK_INSTANCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![work_id], Self::work_instance_from_row)?;
        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    /// All member instances of a workflow run.
    pub async fn find_instances_by_flow(
        &self,
        workflow_instance_id: &str,
    ) -> Result<Vec<WorkInstance>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM work_instances WHERE workflow_instance_id = ?1 ORDER BY created_at",
            Self::WORK_INSTANCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workflow_instance_id], Self::work_instance_from_row)?;
        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    /// The shared workflow-run log: concatenation of all member runs'
    /// transition lines. Callers hold the flow lock.
    pub async fn workflow_log(&self, workflow_instance_id: &str) -> Result<String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT submit_log FROM work_instances
             WHERE workflow_instance_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![workflow_instance_id], |row| row.get::<_, String>(0))?;
        let mut log = String::new();
        for row in rows {
            log.push_str(&row?);
        }
        Ok(log)
    }

    // ----- workflow instances -----

    pub async fn save_workflow_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflow_instances (id, workflow_id, status, instance_type, run_log, \
             started_at, finished_at, duration_seconds, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 status = ?3, instance_type = ?4, run_log = ?5, started_at = ?6,
                 finished_at = ?7, duration_seconds = ?8",
            params![
                instance.id,
                instance.workflow_id,
                instance.status.to_string(),
                instance.instance_type.to_string(),
                instance.run_log,
                instance.started_at.map(|t| t.to_rfc3339()),
                instance.finished_at.map(|t| t.to_rfc3339()),
                instance.duration_seconds,
                instance.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_workflow_instance(&self, id: &str) -> Result<WorkflowInstance> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, workflow_id, status, instance_type, run_log, started_at, finished_at, \
             duration_seconds, created_at FROM workflow_instances WHERE id = ?1",
            params![id],
            |row| {
                Ok(WorkflowInstance {
                    id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    status: parse_enum::<InstanceStatus>(&row.get::<_, String>(2)?)?,
                    instance_type: parse_enum::<InstanceType>(&row.get::<_, String>(3)?)?,
                    run_log: row.get(4)?,
                    started_at: parse_opt_datetime_utc(row.get(5)?)?,
                    finished_at: parse_opt_datetime_utc(row.get(6)?)?,
                    duration_seconds: row.get(7)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("workflow instance '{}'", id)))
    }

    // ----- step ledger (work events) -----

    pub async fn save_work_event(&self, event: &WorkEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO work_events (id, process, context, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET process = ?2, context = ?3, updated_at = ?5",
            params![
                event.id,
                event.process,
                event.context,
                event.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Insert a ledger row unless one already exists for the id. Never
    /// resets the process counter of a live tick stream.
    pub async fn create_work_event_if_absent(&self, event: &WorkEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO work_events (id, process, context, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id,
                event.process,
                event.context,
                event.created_at.to_rfc3339(),
                event.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_work_event(&self, id: &str) -> Result<WorkEvent> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, process, context, created_at, updated_at FROM work_events WHERE id = ?1",
            params![id],
            |row| {
                Ok(WorkEvent {
                    id: row.get(0)?,
                    process: row.get(1)?,
                    context: row.get(2)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(3)?)?,
                    updated_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("work event '{}'", id)))
    }

    /// Compare-and-advance on the ledger counter. Returns true when the
    /// stored process was exactly `target - 1` and is now `target`.
    pub async fn advance_event_process(&self, id: &str, target: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE work_events SET process = ?2, updated_at = ?3
             WHERE id = ?1 AND process = ?2 - 1",
            params![id, target, Utc::now().to_rfc3339()],
        )?;
        Ok(updated == 1)
    }

    /// Jump the counter to the finished sentinel. Returns true only for the
    /// caller that performed the jump.
    pub async fn finish_event_process(&self, id: &str, sentinel: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE work_events SET process = ?2, updated_at = ?3
             WHERE id = ?1 AND process < ?2",
            params![id, sentinel, Utc::now().to_rfc3339()],
        )?;
        Ok(updated == 1)
    }

    pub async fn delete_work_event(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM work_events WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// All live ledger rows, for crash recovery at startup.
    pub async fn list_work_events(&self) -> Result<Vec<WorkEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, process, context, created_at, updated_at
             FROM work_events ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WorkEvent {
                id: row.get(0)?,
                process: row.get(1)?,
                context: row.get(2)?,
                created_at: parse_datetime_utc(&row.get::<_, String>(3)?)?,
                updated_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub async fn work_event_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM work_events WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ----- lock rows -----

    pub async fn insert_lock(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute("INSERT INTO locks (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn min_lock_id(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let min: Option<i64> = conn.query_row(
            "SELECT MIN(id) FROM locks WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(min)
    }

    /// Idempotent: deleting an already-released lock row is a no-op.
    pub async fn delete_lock(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM locks WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub async fn locks_exist(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM locks WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn clear_locks(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM locks WHERE name = ?1", params![name])?;
        Ok(())
    }
}
