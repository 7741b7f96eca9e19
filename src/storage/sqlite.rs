//! SQLite-backed runtime storage.
//!
//! Uses a split reader/writer pool in WAL mode: SQLite allows one writer at
//! a time, so all mutations go through a single-connection pool and the
//! atomic dequeue is a single `DELETE ... RETURNING` statement. The schema
//! is created through versioned inline migrations keyed off a meta table.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::StorageError;
use crate::status::Status;

use super::{RunRecord, RuntimeStore, StoredAssignment};

const LATEST_VERSION: i64 = 1;

fn migrations(version: i64) -> &'static [&'static str] {
    match version {
        1 => &[
            "CREATE TABLE IF NOT EXISTS steps (
                workflow_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                state TEXT NOT NULL,
                result TEXT,
                worker_id TEXT,
                deadline_ms INTEGER,
                PRIMARY KEY (workflow_id, instance_id, step_name)
            )",
            "CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                UNIQUE (workflow_id, instance_id, step_name)
            )",
            "CREATE TABLE IF NOT EXISTS runs (
                workflow_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at_ms INTEGER NOT NULL,
                finished_at_ms INTEGER,
                inputs TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (workflow_id, instance_id)
            )",
        ],
        _ => &[],
    }
}

fn encode_status(status: Status) -> &'static str {
    match status {
        Status::Pending => "PENDING",
        Status::Running => "RUNNING",
        Status::Succeeded => "SUCCEEDED",
        Status::Failed => "FAILED",
        Status::Cancelled => "CANCELLED",
        Status::Skipped => "SKIPPED",
    }
}

fn decode_status(raw: &str) -> Result<Status, StorageError> {
    match raw {
        "PENDING" => Ok(Status::Pending),
        "RUNNING" => Ok(Status::Running),
        "SUCCEEDED" => Ok(Status::Succeeded),
        "FAILED" => Ok(Status::Failed),
        "CANCELLED" => Ok(Status::Cancelled),
        "SKIPPED" => Ok(Status::Skipped),
        other => Err(StorageError::Corrupt(format!("unknown status '{other}'"))),
    }
}

/// [`RuntimeStore`] persisted in a SQLite database.
pub struct SqliteRuntimeStore {
    reader: SqlitePool,
    writer: SqlitePool,
}

impl SqliteRuntimeStore {
    /// Open (creating if missing) and migrate the database at `database_url`,
    /// e.g. `sqlite:///var/lib/stepflow/runtime.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let base_opts = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::backend)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await
            .map_err(StorageError::backend)?;

        let store = Self {
            reader: SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(base_opts.read_only(true))
                .await
                .map_err(StorageError::backend)?,
            writer,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS stepflow_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.writer)
            .await
            .map_err(StorageError::backend)?;
        let row = sqlx::query("SELECT value FROM stepflow_meta WHERE key = 'version'")
            .fetch_optional(&self.writer)
            .await
            .map_err(StorageError::backend)?;
        let mut version: i64 = match row {
            Some(row) => {
                let raw: String = row.try_get("value").map_err(StorageError::backend)?;
                raw.parse().map_err(|_| {
                    StorageError::Corrupt(format!("invalid schema version '{raw}'"))
                })?
            }
            None => 0,
        };
        while version < LATEST_VERSION {
            version += 1;
            for stmt in migrations(version) {
                sqlx::query(stmt)
                    .execute(&self.writer)
                    .await
                    .map_err(StorageError::backend)?;
            }
            sqlx::query(
                "INSERT INTO stepflow_meta (key, value) VALUES ('version', ?1)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            )
            .bind(version.to_string())
            .execute(&self.writer)
            .await
            .map_err(StorageError::backend)?;
        }
        Ok(())
    }

    fn decode_run(row: &SqliteRow) -> Result<RunRecord, StorageError> {
        let raw: String = row.try_get("status").map_err(StorageError::backend)?;
        Ok(RunRecord {
            status: decode_status(&raw)?,
            started_at_ms: row.try_get("started_at_ms").map_err(StorageError::backend)?,
            finished_at_ms: row.try_get("finished_at_ms").map_err(StorageError::backend)?,
        })
    }
}

#[async_trait]
impl RuntimeStore for SqliteRuntimeStore {
    async fn create_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        steps: &[String],
        started_at_ms: i64,
    ) -> Result<(), StorageError> {
        let mut tx = self.writer.begin().await.map_err(StorageError::backend)?;
        for table in ["steps", "queue"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE workflow_id = ?1 AND instance_id = ?2"
            ))
            .bind(workflow_id)
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::backend)?;
        }
        for step in steps {
            sqlx::query(
                "INSERT INTO steps (workflow_id, instance_id, step_name, state)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(workflow_id)
            .bind(instance_id)
            .bind(step)
            .bind(encode_status(Status::Pending))
            .execute(&mut *tx)
            .await
            .map_err(StorageError::backend)?;
        }
        sqlx::query(
            "INSERT INTO runs (workflow_id, instance_id, status, started_at_ms, finished_at_ms, inputs)
             VALUES (?1, ?2, ?3, ?4, NULL, '{}')
             ON CONFLICT (workflow_id, instance_id) DO UPDATE
             SET status = excluded.status, started_at_ms = excluded.started_at_ms,
                 finished_at_ms = NULL, inputs = '{}'",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(encode_status(Status::Running))
        .bind(started_at_ms)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::backend)?;
        tx.commit().await.map_err(StorageError::backend)
    }

    async fn enqueue(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR IGNORE INTO queue (workflow_id, instance_id, step_name)
             SELECT ?1, ?2, ?3
             WHERE EXISTS (
                 SELECT 1 FROM steps
                 WHERE workflow_id = ?1 AND instance_id = ?2
                   AND step_name = ?3 AND state = 'PENDING'
             )",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .execute(&self.writer)
        .await
        .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn fetch_next(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>, StorageError> {
        // Single statement on the serialized writer: atomic across callers.
        let row = sqlx::query(
            "DELETE FROM queue WHERE id = (
                 SELECT id FROM queue
                 WHERE workflow_id = ?1 AND instance_id = ?2
                 ORDER BY id LIMIT 1
             )
             RETURNING step_name",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .fetch_optional(&self.writer)
        .await
        .map_err(StorageError::backend)?;
        row.map(|r| r.try_get("step_name").map_err(StorageError::backend))
            .transpose()
    }

    async fn set_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        state: Status,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO steps (workflow_id, instance_id, step_name, state)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (workflow_id, instance_id, step_name)
             DO UPDATE SET state = excluded.state",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .bind(encode_status(state))
        .execute(&self.writer)
        .await
        .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn get_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Status>, StorageError> {
        let row = sqlx::query(
            "SELECT state FROM steps
             WHERE workflow_id = ?1 AND instance_id = ?2 AND step_name = ?3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .fetch_optional(&self.reader)
        .await
        .map_err(StorageError::backend)?;
        row.map(|r| {
            let raw: String = r.try_get("state").map_err(StorageError::backend)?;
            decode_status(&raw)
        })
        .transpose()
    }

    async fn set_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
        inputs: &HashMap<String, Value>,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(inputs).map_err(StorageError::backend)?;
        sqlx::query(
            "UPDATE runs SET inputs = ?3 WHERE workflow_id = ?1 AND instance_id = ?2",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(payload)
        .execute(&self.writer)
        .await
        .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn get_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<HashMap<String, Value>, StorageError> {
        let row = sqlx::query(
            "SELECT inputs FROM runs WHERE workflow_id = ?1 AND instance_id = ?2",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .fetch_optional(&self.reader)
        .await
        .map_err(StorageError::backend)?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("inputs").map_err(StorageError::backend)?;
                serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt(e.to_string()))
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn set_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        result: &Value,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(result).map_err(StorageError::backend)?;
        sqlx::query(
            "UPDATE steps SET result = ?4
             WHERE workflow_id = ?1 AND instance_id = ?2 AND step_name = ?3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .bind(payload)
        .execute(&self.writer)
        .await
        .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn get_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Value>, StorageError> {
        let row = sqlx::query(
            "SELECT result FROM steps
             WHERE workflow_id = ?1 AND instance_id = ?2 AND step_name = ?3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .fetch_optional(&self.reader)
        .await
        .map_err(StorageError::backend)?;
        match row {
            Some(row) => {
                let raw: Option<String> = row.try_get("result").map_err(StorageError::backend)?;
                raw.map(|r| serde_json::from_str(&r).map_err(|e| StorageError::Corrupt(e.to_string())))
                    .transpose()
            }
            None => Ok(None),
        }
    }

    async fn assign_step(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        worker_id: &str,
        deadline_ms: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE steps SET worker_id = ?4, deadline_ms = ?5
             WHERE workflow_id = ?1 AND instance_id = ?2 AND step_name = ?3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .bind(worker_id)
        .bind(deadline_ms)
        .execute(&self.writer)
        .await
        .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn get_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<StoredAssignment>, StorageError> {
        let row = sqlx::query(
            "SELECT worker_id, deadline_ms FROM steps
             WHERE workflow_id = ?1 AND instance_id = ?2 AND step_name = ?3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .fetch_optional(&self.reader)
        .await
        .map_err(StorageError::backend)?;
        match row {
            Some(row) => {
                let worker_id: Option<String> =
                    row.try_get("worker_id").map_err(StorageError::backend)?;
                let deadline_ms: Option<i64> =
                    row.try_get("deadline_ms").map_err(StorageError::backend)?;
                Ok(worker_id.zip(deadline_ms).map(|(worker_id, deadline_ms)| {
                    StoredAssignment {
                        worker_id,
                        deadline_ms,
                    }
                }))
            }
            None => Ok(None),
        }
    }

    async fn clear_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE steps SET worker_id = NULL, deadline_ms = NULL
             WHERE workflow_id = ?1 AND instance_id = ?2 AND step_name = ?3",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(step_name)
        .execute(&self.writer)
        .await
        .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn finalize_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        status: Status,
        finished_at_ms: i64,
    ) -> Result<(), StorageError> {
        let mut tx = self.writer.begin().await.map_err(StorageError::backend)?;
        sqlx::query(
            "UPDATE steps SET worker_id = NULL, deadline_ms = NULL
             WHERE workflow_id = ?1 AND instance_id = ?2",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::backend)?;
        let updated = sqlx::query(
            "UPDATE runs SET status = ?3, finished_at_ms = ?4
             WHERE workflow_id = ?1 AND instance_id = ?2",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .bind(encode_status(status))
        .bind(finished_at_ms)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::backend)?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::UnknownRun {
                workflow_id: workflow_id.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        tx.commit().await.map_err(StorageError::backend)
    }

    async fn run_record(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<RunRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT status, started_at_ms, finished_at_ms FROM runs
             WHERE workflow_id = ?1 AND instance_id = ?2",
        )
        .bind(workflow_id)
        .bind(instance_id)
        .fetch_optional(&self.reader)
        .await
        .map_err(StorageError::backend)?;
        row.map(|r| Self::decode_run(&r)).transpose()
    }
}
