use super::pending::PendingRows;
use super::tasks::InFlightTasks;
use super::traits::{RetrievedBatch, Storage, StorageError};
use crate::model::{JsonLogSerializer, Log, LogSerializer};
use async_trait::async_trait;
use duckdb::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract the owning PID from a DuckDB lock error ("... (PID 12345) ...")
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), "Removed stale database file");
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex.lock().map_err(|_| StorageError::Poisoned)
}

/// DuckDB-backed log queue shared by every channel of a group.
///
/// The table holds `(row_id, stream, payload)`; claims on rows live only in
/// memory, so a restarted process sees every surviving row as available.
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
    pending: Arc<Mutex<PendingRows>>,
    serializer: Arc<dyn LogSerializer>,
    tasks: Arc<InFlightTasks>,
}

impl DuckDbStorage {
    /// Open (or create) the database at `path`.
    ///
    /// A lock left behind by a process that no longer exists is removed and
    /// the open is retried once.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        let err = match Connection::open(path) {
            Ok(conn) => return Ok(Self::from_connection(conn)),
            Err(e) => e,
        };

        let error_msg = err.to_string();
        if error_msg.contains("Could not set lock") {
            tracing::warn!(error = %error_msg, "Database lock detected");

            if let Some(pid) = extract_pid_from_lock_error(&error_msg) {
                if is_process_running(pid) {
                    tracing::error!(pid, "Database is locked by a running process");
                } else {
                    tracing::warn!(pid, "Lock owner is gone, removing stale lock files");
                    if let Err(io_err) = remove_lock_files(path) {
                        tracing::error!(error = %io_err, "Failed to remove lock files");
                        return Err(err.into());
                    }
                    let conn = Connection::open(path)?;
                    return Ok(Self::from_connection(conn));
                }
            }
        }

        Err(err.into())
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn LogSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            pending: Arc::new(Mutex::new(PendingRows::new())),
            serializer: Arc::new(JsonLogSerializer),
            tasks: Arc::new(InFlightTasks::new()),
        }
    }

    #[cfg(test)]
    fn insert_raw(&self, stream: &str, payload: &str) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO logs (stream, payload) VALUES (?, ?)",
            duckdb::params![stream, payload],
        )?;
        Ok(())
    }
}

fn retrieve_blocking(
    conn: &Connection,
    pending: &mut PendingRows,
    serializer: &dyn LogSerializer,
    stream: &str,
    limit: usize,
) -> Result<Option<RetrievedBatch>, StorageError> {
    let mut selected: HashSet<i64> = HashSet::new();
    let mut row_ids = Vec::new();
    let mut logs = Vec::new();
    let mut corrupt = 0usize;

    while logs.len() < limit {
        // Claimed rows are skipped below, so over-fetch by that many.
        let fetch = (limit - logs.len()) + pending.pending_for(stream) + selected.len();

        let candidates: Vec<(i64, String)> = {
            let mut stmt = conn.prepare(
                "SELECT row_id, payload FROM logs WHERE stream = ? ORDER BY row_id LIMIT ?",
            )?;
            let rows = stmt.query_map(duckdb::params![stream, fetch as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let exhausted = candidates.len() < fetch;

        let mut found_corrupt = false;
        for (row_id, payload) in candidates {
            if logs.len() >= limit {
                break;
            }
            if pending.is_pending(row_id) || selected.contains(&row_id) {
                continue;
            }
            match serializer.deserialize(&payload) {
                Ok(log) => {
                    selected.insert(row_id);
                    row_ids.push(row_id);
                    logs.push(log);
                }
                Err(e) => {
                    tracing::error!(
                        stream,
                        row_id,
                        error = %e,
                        "Cannot deserialize a log in storage"
                    );
                    conn.execute("DELETE FROM logs WHERE row_id = ?", duckdb::params![row_id])?;
                    corrupt += 1;
                    found_corrupt = true;
                }
            }
        }

        if exhausted || !found_corrupt {
            break;
        }
    }

    if corrupt > 0 {
        tracing::warn!(stream, count = corrupt, "Deleted logs that could not be deserialized");
    }

    if row_ids.is_empty() {
        tracing::debug!(stream, "No available logs in storage");
        return Ok(None);
    }

    let batch_id = Uuid::new_v4();
    tracing::debug!(
        stream,
        batch_id = %batch_id,
        count = row_ids.len(),
        first_row = row_ids[0],
        "Claimed logs for batch"
    );
    pending.claim(stream, batch_id, row_ids);

    Ok(Some(RetrievedBatch { batch_id, logs }))
}

#[async_trait]
impl Storage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let task = self.tasks.begin();
        tokio::task::spawn_blocking(move || {
            let _task = task;
            let conn = lock(&conn)?;

            conn.execute("CREATE SEQUENCE IF NOT EXISTS logs_row_id_seq START 1", [])?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS logs (
                    row_id BIGINT PRIMARY KEY DEFAULT nextval('logs_row_id_seq'),
                    stream VARCHAR NOT NULL,
                    payload VARCHAR NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_logs_stream ON logs(stream)",
                [],
            )?;

            Ok::<(), StorageError>(())
        })
        .await?
    }

    async fn append(&self, stream: &str, log: &Log) -> Result<(), StorageError> {
        let payload = self.serializer.serialize(log)?;
        let conn = self.conn.clone();
        let stream = stream.to_string();
        let task = self.tasks.begin();

        tokio::task::spawn_blocking(move || {
            let _task = task;
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT INTO logs (stream, payload) VALUES (?, ?)",
                duckdb::params![stream, payload],
            )?;
            Ok::<(), StorageError>(())
        })
        .await?
    }

    async fn retrieve_batch(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Option<RetrievedBatch>, StorageError> {
        if limit == 0 {
            return Ok(None);
        }

        let conn = self.conn.clone();
        let pending = self.pending.clone();
        let serializer = self.serializer.clone();
        let stream = stream.to_string();
        let task = self.tasks.begin();

        tokio::task::spawn_blocking(move || {
            let _task = task;
            // Claim and select under the same critical section so two
            // retrievals can never hand out the same row.
            let mut pending = lock(&pending)?;
            let conn = lock(&conn)?;
            retrieve_blocking(&conn, &mut pending, serializer.as_ref(), &stream, limit)
        })
        .await?
    }

    async fn delete_batch(&self, stream: &str, batch_id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let pending = self.pending.clone();
        let stream = stream.to_string();
        let task = self.tasks.begin();

        tokio::task::spawn_blocking(move || {
            let _task = task;
            let mut pending = lock(&pending)?;
            let Some(row_ids) = pending.rows_of(&stream, batch_id).map(<[i64]>::to_vec) else {
                tracing::debug!(
                    stream = %stream,
                    batch_id = %batch_id,
                    "Batch has no claimed rows, nothing to delete"
                );
                return Ok(());
            };

            // The claim is dropped only once the rows are gone, so a failed
            // delete never makes sent rows retrievable again.
            if !row_ids.is_empty() {
                let conn = lock(&conn)?;
                let placeholders = vec!["?"; row_ids.len()].join(", ");
                let sql = format!("DELETE FROM logs WHERE row_id IN ({})", placeholders);
                conn.execute(&sql, duckdb::params_from_iter(row_ids.iter().copied()))?;
            }
            pending.release(&stream, batch_id);

            tracing::debug!(
                stream = %stream,
                batch_id = %batch_id,
                count = row_ids.len(),
                "Deleted batch from storage"
            );
            Ok::<(), StorageError>(())
        })
        .await?
    }

    async fn release_batch(&self, stream: &str, batch_id: Uuid) -> Result<(), StorageError> {
        let mut pending = lock(&self.pending)?;
        if let Some(row_ids) = pending.release(stream, batch_id) {
            tracing::debug!(stream, batch_id = %batch_id, count = row_ids.len(), "Released batch");
        }
        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let pending = self.pending.clone();
        let stream = stream.to_string();
        let task = self.tasks.begin();

        tokio::task::spawn_blocking(move || {
            let _task = task;
            let mut pending = lock(&pending)?;
            let conn = lock(&conn)?;
            let deleted =
                conn.execute("DELETE FROM logs WHERE stream = ?", duckdb::params![stream])?;
            pending.forget_stream(&stream);

            tracing::debug!(stream = %stream, count = deleted, "Deleted all logs for stream");
            Ok::<(), StorageError>(())
        })
        .await?
    }

    async fn count(&self, stream: &str) -> Result<usize, StorageError> {
        let conn = self.conn.clone();
        let stream = stream.to_string();
        let task = self.tasks.begin();

        tokio::task::spawn_blocking(move || {
            let _task = task;
            let conn = lock(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM logs WHERE stream = ?",
                duckdb::params![stream],
                |row| row.get(0),
            )?;
            Ok::<usize, StorageError>(count.max(0) as usize)
        })
        .await?
    }

    fn clear_pending_state(&self, stream: &str) {
        match lock(&self.pending) {
            Ok(mut pending) => {
                let released = pending.abandon_stream(stream);
                tracing::debug!(stream, count = released, "Cleared pending log state");
            }
            Err(e) => {
                tracing::error!(stream, error = %e, "Could not clear pending log state");
            }
        }
    }

    async fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.tasks.wait_idle(timeout).await;
        if drained {
            tracing::debug!("Storage tasks completed");
        } else {
            tracing::error!(
                in_flight = self.tasks.in_flight(),
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting for storage tasks to complete"
            );
        }
        drained
    }
}
