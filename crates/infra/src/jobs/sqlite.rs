//! Durable job store persisted in SQLite.
//!
//! One `jobs` table holding `(id, version, document)`. Every write is a
//! single statement, which SQLite applies as its own transaction, so a job
//! record is never observed half-written after a crash. The database runs
//! in WAL mode with `synchronous = FULL`; a committed write survives power
//! loss, and several connections (or processes) can share the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use verdant_core::JobId;

use super::record;
use super::store::{DurableStore, Scan, StoreError, WriteCondition};
use super::types::{Job, JobFilter};

/// SQLite-backed durable store.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("failed to create store directory at {parent:?}: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!(path = ?path, error = %e, "failed to open job store");
                StoreError::Unavailable(format!("failed to open SQLite store at {path:?}: {e}"))
            })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id        TEXT PRIMARY KEY,
                version   INTEGER NOT NULL,
                document  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(unavailable)?;

        debug!(path = ?path, "job store opened");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close all connections. Outstanding clones become unusable.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job, StoreError> {
        let id: String = row.try_get("id").map_err(unavailable)?;
        let version: i64 = row.try_get("version").map_err(unavailable)?;
        let document: String = row.try_get("document").map_err(unavailable)?;

        let mut job = record::decode(&document).map_err(|e| StoreError::corrupt(&id, e))?;
        job.version = version as u64;
        Ok(job)
    }
}

#[async_trait]
impl DurableStore for SqliteJobStore {
    async fn put(&self, job: &Job, condition: WriteCondition) -> Result<u64, StoreError> {
        let document = record::encode(job).map_err(|e| StoreError::corrupt(job.id, e))?;
        let id = job.id.to_string();

        match condition {
            WriteCondition::Create => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO jobs (id, version, document)
                    VALUES (?1, 1, ?2)
                    ON CONFLICT(id) DO NOTHING
                    "#,
                )
                .bind(&id)
                .bind(&document)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::Conflict(job.id));
                }
                Ok(1)
            }
            WriteCondition::Version(expected) => {
                let result = sqlx::query(
                    r#"
                    UPDATE jobs
                    SET version = version + 1,
                        document = ?3
                    WHERE id = ?1
                      AND version = ?2
                    "#,
                )
                .bind(&id)
                .bind(expected as i64)
                .bind(&document)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::Conflict(job.id));
                }
                Ok(expected + 1)
            }
            WriteCondition::Any => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO jobs (id, version, document)
                    VALUES (?1, 1, ?2)
                    ON CONFLICT(id) DO UPDATE
                    SET version = jobs.version + 1,
                        document = excluded.document
                    RETURNING version
                    "#,
                )
                .bind(&id)
                .bind(&document)
                .fetch_one(&self.pool)
                .await
                .map_err(unavailable)?;

                let version: i64 = row.try_get("version").map_err(unavailable)?;
                Ok(version as u64)
            }
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT id, version, document FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn scan(&self, filter: &JobFilter) -> Result<Scan, StoreError> {
        let rows = sqlx::query("SELECT id, version, document FROM jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        let mut scan = Scan::default();
        for row in &rows {
            scan.push(Self::decode_row(row), filter)?;
        }
        Ok(scan.finish())
    }

    async fn delete(&self, id: JobId, expected: Option<u64>) -> Result<bool, StoreError> {
        let result = match expected {
            Some(version) => sqlx::query("DELETE FROM jobs WHERE id = ?1 AND version = ?2")
                .bind(id.to_string())
                .bind(version as i64)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?,
            None => sqlx::query("DELETE FROM jobs WHERE id = ?1")
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(unavailable)?,
        };

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if expected.is_some() && self.get(id).await?.is_some() {
            return Err(StoreError::Conflict(id));
        }
        Ok(false)
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// `{data_dir}/verdant/queue.db`.
pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut dir = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .ok_or_else(|| StoreError::Unavailable("failed to resolve OS app data directory".to_string()))?;

    dir.push("verdant");
    dir.push("queue.db");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobStatus;
    use verdant_core::JobKind;

    fn job() -> Job {
        Job::new(JobKind::SubmitWork, serde_json::json!({"title": "Planted 3 trees"}), 5)
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let job = job();
        {
            let store = SqliteJobStore::open(&path).await.unwrap();
            store.put(&job, WriteCondition::Create).await.unwrap();
            store.close().await;
        }

        let store = SqliteJobStore::open(&path).await.unwrap();
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.payload, job.payload);
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn versioned_writes_detect_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(dir.path().join("queue.db")).await.unwrap();
        let mut job = job();

        store.put(&job, WriteCondition::Create).await.unwrap();
        assert_eq!(store.put(&job, WriteCondition::Create).await, Err(StoreError::Conflict(job.id)));

        job.status = JobStatus::Active;
        assert_eq!(store.put(&job, WriteCondition::Version(1)).await.unwrap(), 2);
        assert_eq!(store.put(&job, WriteCondition::Version(1)).await, Err(StoreError::Conflict(job.id)));
        assert_eq!(store.put(&job, WriteCondition::Any).await.unwrap(), 3);

        assert_eq!(store.delete(job.id, Some(2)).await, Err(StoreError::Conflict(job.id)));
        assert!(store.delete(job.id, Some(3)).await.unwrap());
        assert!(store.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_handles_on_one_file_see_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let foreground = SqliteJobStore::open(&path).await.unwrap();
        let background = SqliteJobStore::open(&path).await.unwrap();

        let job = job();
        foreground.put(&job, WriteCondition::Create).await.unwrap();

        let seen = background.get_all(&JobFilter::all()).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, job.id);
    }

    #[tokio::test]
    async fn v1_rows_are_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(dir.path().join("queue.db")).await.unwrap();
        let id = JobId::new();
        let v1 = serde_json::json!({
            "id": id,
            "kind": "submit-work",
            "payload": {},
            "status": "PENDING",
            "attempt": 0,
            "maxAttempts": 3,
            "createdAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-01T10:00:00Z"
        });
        sqlx::query("INSERT INTO jobs (id, version, document) VALUES (?1, 4, ?2)")
            .bind(id.to_string())
            .bind(v1.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.version, 4);
        assert_eq!(job.priority, 0);
        assert!(job.workflow_state.last_completed_step.is_none());
        assert!(job.lease_token.is_none());
    }

    #[tokio::test]
    async fn garbled_row_does_not_hide_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(dir.path().join("queue.db")).await.unwrap();
        let healthy = job();
        store.put(&healthy, WriteCondition::Create).await.unwrap();
        sqlx::query("INSERT INTO jobs (id, version, document) VALUES ('garbled', 1, '{\"schemaVersion\": 2')")
            .execute(&store.pool)
            .await
            .unwrap();

        let scan = store.scan(&JobFilter::all()).await.unwrap();
        assert_eq!(scan.jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![healthy.id]);
        assert_eq!(scan.unreadable.len(), 1);
        assert_eq!(scan.unreadable[0].id, "garbled");
    }
}
