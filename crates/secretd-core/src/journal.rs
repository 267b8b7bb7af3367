//! The durable operation journal, backed by `SQLite`.
//!
//! Three tables: `secret` (the per-secret active-instance pointer),
//! `instance` (with the plan JSON pinned at creation time), and `operation`
//! (one row per lifecycle attempt). Operation ids are assigned by the
//! autoincrementing primary key, so they strictly increase with insertion
//! order; they are not gap-free after rollback.
//!
//! The journal only exposes reads and single-transaction mutations; the
//! admission rules and the three-phase execution protocol live in
//! [`crate::lifecycle`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{Error, Result};
use crate::instance::{Instance, Instances};
use crate::operation::{Operation, OperationName, OperationParameters, Range, Status};
use crate::secrets::Secret;

const SCHEMA_SQL: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS secret (
        id TEXT NOT NULL PRIMARY KEY,
        active_instance_id TEXT REFERENCES instance(id)
    );
    CREATE TABLE IF NOT EXISTS instance (
        id TEXT NOT NULL PRIMARY KEY,
        secret_id TEXT NOT NULL REFERENCES secret(id),
        plan TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS operation (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        secret_id TEXT NOT NULL REFERENCES secret(id),
        instance_id TEXT NOT NULL REFERENCES instance(id),
        name TEXT NOT NULL,
        forced INTEGER NOT NULL,
        reason TEXT NOT NULL,
        started_by TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        failed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS instance_operation ON operation (instance_id, id DESC);
    CREATE INDEX IF NOT EXISTS secret_operation ON operation (secret_id, id DESC);
";

/// The instance-level state read under Phase A's transaction: everything
/// admission needs to decide.
#[derive(Debug, Clone)]
pub(crate) struct InstanceState {
    /// The plan pinned on the instance row.
    pub plan: Secret,
    /// The secret's active-instance pointer.
    pub active_instance_id: Option<String>,
    /// Name of the latest operation.
    pub last_name: OperationName,
    /// Completion timestamp of the latest operation, if it succeeded.
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// A handle to the journal database.
#[derive(Debug, Clone)]
pub struct Journal {
    conn: Arc<Mutex<Connection>>,
}

impl Journal {
    /// Opens (and if necessary initializes) the journal at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// An ephemeral in-memory journal, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside one transaction, committing on success. Any error
    /// rolls the transaction back.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Journal("connection lock poisoned".to_string()))
    }

    /// Inserts the secret row if absent.
    pub(crate) fn ensure_secret(tx: &Transaction<'_>, secret_id: &str) -> Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO secret (id) VALUES (?1)",
            params![secret_id],
        )?;
        Ok(())
    }

    /// Inserts a fresh instance row with its pinned plan.
    pub(crate) fn insert_instance(
        tx: &Transaction<'_>,
        instance_id: &str,
        secret_id: &str,
        plan: &Secret,
    ) -> Result<()> {
        let plan_json = serde_json::to_string(plan)
            .map_err(|e| Error::Journal(format!("failed to serialize plan: {e}")))?;
        tx.execute(
            "INSERT INTO instance (id, secret_id, plan) VALUES (?1, ?2, ?3)",
            params![instance_id, secret_id, plan_json],
        )?;
        Ok(())
    }

    /// Reads the admission-relevant state of an instance, scoped to its
    /// secret. `None` when the instance does not exist under that secret.
    pub(crate) fn instance_state(
        tx: &Transaction<'_>,
        secret_id: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceState>> {
        let row = tx
            .query_row(
                "SELECT i.plan, s.active_instance_id, o.name, o.completed_at
                 FROM instance i
                 INNER JOIN secret s ON s.id = i.secret_id
                 INNER JOIN operation o
                     ON o.id = (SELECT MAX(id) FROM operation WHERE instance_id = i.id)
                 WHERE i.id = ?1 AND i.secret_id = ?2",
                params![instance_id, secret_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<DateTime<Utc>>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((plan_json, active_instance_id, name, last_completed_at)) = row else {
            return Ok(None);
        };
        Ok(Some(InstanceState {
            plan: parse_plan(&plan_json)?,
            active_instance_id,
            last_name: name.parse()?,
            last_completed_at,
        }))
    }

    /// Appends a started operation, returning the journalled record.
    pub(crate) fn start_operation(
        tx: &Transaction<'_>,
        secret_id: &str,
        instance_id: &str,
        name: OperationName,
        parameters: &OperationParameters,
    ) -> Result<Operation> {
        let started_at = Utc::now();
        tx.execute(
            "INSERT INTO operation
                 (secret_id, instance_id, name, forced, reason, started_by, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                secret_id,
                instance_id,
                name.as_str(),
                parameters.forced,
                parameters.reason,
                parameters.started_by,
                started_at,
            ],
        )?;
        Ok(Operation {
            id: tx.last_insert_rowid(),
            secret_id: secret_id.to_string(),
            instance_id: instance_id.to_string(),
            status: Status {
                name,
                forced: parameters.forced,
                reason: parameters.reason.clone(),
                started_by: parameters.started_by.clone(),
                started_at,
                completed_at: None,
                failed_at: None,
            },
        })
    }

    /// Stamps an operation as completed.
    pub(crate) fn complete_operation(
        tx: &Transaction<'_>,
        operation_id: i64,
    ) -> Result<DateTime<Utc>> {
        let completed_at = Utc::now();
        tx.execute(
            "UPDATE operation SET completed_at = ?1 WHERE id = ?2",
            params![completed_at, operation_id],
        )?;
        Ok(completed_at)
    }

    /// Stamps an operation as failed.
    pub(crate) fn fail_operation(tx: &Transaction<'_>, operation_id: i64) -> Result<DateTime<Utc>> {
        let failed_at = Utc::now();
        tx.execute(
            "UPDATE operation SET failed_at = ?1 WHERE id = ?2",
            params![failed_at, operation_id],
        )?;
        Ok(failed_at)
    }

    /// Points the secret at `instance_id` as its active instance.
    pub(crate) fn set_active(
        tx: &Transaction<'_>,
        secret_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        tx.execute(
            "UPDATE secret SET active_instance_id = ?1 WHERE id = ?2",
            params![instance_id, secret_id],
        )?;
        Ok(())
    }

    /// Clears the active pointer iff it still points at `instance_id`.
    pub(crate) fn clear_active(
        tx: &Transaction<'_>,
        secret_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        tx.execute(
            "UPDATE secret SET active_instance_id = NULL
             WHERE id = ?1 AND active_instance_id = ?2",
            params![secret_id, instance_id],
        )?;
        Ok(())
    }

    /// Operations recorded against a secret, newest first.
    pub fn secret_history(&self, secret_id: &str, range: Range) -> Result<Vec<Operation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, secret_id, instance_id, name, forced, reason,
                    started_by, started_at, completed_at, failed_at
             FROM operation
             WHERE secret_id = ?1
             ORDER BY id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let operations = stmt
            .query_map(params![secret_id, range.count(), range.from], row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    /// Operations recorded against one instance, newest first.
    pub fn instance_history(
        &self,
        secret_id: &str,
        instance_id: &str,
        range: Range,
    ) -> Result<Vec<Operation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, secret_id, instance_id, name, forced, reason,
                    started_by, started_at, completed_at, failed_at
             FROM operation
             WHERE instance_id = ?1 AND secret_id = ?2
             ORDER BY id DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let operations = stmt
            .query_map(
                params![instance_id, secret_id, range.count(), range.from],
                row_to_operation,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    /// Every instance of a secret joined with its latest operation, ordered
    /// by that operation's id, newest first.
    pub fn list_instances(&self, secret_id: &str, range: Range) -> Result<Instances> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS}
             FROM instance i
             INNER JOIN operation o
                 ON o.id = (SELECT MAX(id) FROM operation WHERE instance_id = i.id)
             WHERE i.secret_id = ?1
             ORDER BY o.id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let instances = stmt
            .query_map(params![secret_id, range.count(), range.from], row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        instances
            .into_iter()
            .map(finish_instance)
            .collect::<Result<Vec<_>>>()
            .map(Instances)
    }

    /// One instance of a secret, or `None`.
    pub fn get_instance(&self, secret_id: &str, instance_id: &str) -> Result<Option<Instance>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {INSTANCE_COLUMNS}
                     FROM instance i
                     INNER JOIN operation o
                         ON o.id = (SELECT MAX(id) FROM operation WHERE instance_id = i.id)
                     WHERE i.id = ?1 AND i.secret_id = ?2"
                ),
                params![instance_id, secret_id],
                row_to_instance,
            )
            .optional()?;
        row.map(finish_instance).transpose()
    }

    /// The active instance of a secret, resolved through the pointer.
    pub fn get_active(&self, secret_id: &str) -> Result<Option<Instance>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {INSTANCE_COLUMNS}
                     FROM secret s
                     INNER JOIN instance i ON i.id = s.active_instance_id
                     INNER JOIN operation o
                         ON o.id = (SELECT MAX(id) FROM operation WHERE instance_id = i.id)
                     WHERE s.id = ?1"
                ),
                params![secret_id],
                row_to_instance,
            )
            .optional()?;
        row.map(finish_instance).transpose()
    }

    /// The secret's active-instance pointer, for invariant checks.
    pub fn active_instance_id(&self, secret_id: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT active_instance_id FROM secret WHERE id = ?1",
                params![secret_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(id.flatten())
    }

    /// Operations with `started_at` set and neither terminal timestamp:
    /// attempts interrupted by a crash or still running. Surfaced for
    /// operator tooling.
    pub fn in_flight_operations(&self) -> Result<Vec<Operation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, secret_id, instance_id, name, forced, reason,
                    started_by, started_at, completed_at, failed_at
             FROM operation
             WHERE completed_at IS NULL AND failed_at IS NULL
             ORDER BY id ASC",
        )?;
        let operations = stmt
            .query_map([], row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }
}

const INSTANCE_COLUMNS: &str = "i.id, i.plan, o.name, o.forced, o.reason, o.started_by, \
                                o.started_at, o.completed_at, o.failed_at";

/// Intermediate row shape: the plan still as JSON, the operation name still
/// as text. Conversion completes outside the rusqlite row callback so
/// failures map to [`Error`] rather than panics.
type InstanceRow = (String, String, String, bool, String, String,
    DateTime<Utc>, Option<DateTime<Utc>>, Option<DateTime<Utc>>);

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn finish_instance(row: InstanceRow) -> Result<Instance> {
    let (id, plan_json, name, forced, reason, started_by, started_at, completed_at, failed_at) =
        row;
    Ok(Instance {
        id,
        secret: parse_plan(&plan_json)?,
        status: Status {
            name: name.parse()?,
            forced,
            reason,
            started_by,
            started_at,
            completed_at,
            failed_at,
        },
    })
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
    let name: String = row.get(3)?;
    let name = name.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown operation name {name}").into(),
        )
    })?;
    Ok(Operation {
        id: row.get(0)?,
        secret_id: row.get(1)?,
        instance_id: row.get(2)?,
        status: Status {
            name,
            forced: row.get(4)?,
            reason: row.get(5)?,
            started_by: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            failed_at: row.get(9)?,
        },
    })
}

fn parse_plan(plan_json: &str) -> Result<Secret> {
    serde_json::from_str(plan_json)
        .map_err(|e| Error::Journal(format!("failed to parse pinned plan: {e}")))
}
