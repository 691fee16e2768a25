//! Durable mutation-state store.

use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use super::model::{JobId, MutationJob};
use crate::{AccountId, Result};

/// Durable persistence for mutation jobs, keyed by job id.
///
/// A write counts as done only once the returned future resolves `Ok`.
pub trait MutationStore: Send + Sync + 'static {
    /// Inserts or replaces a job's serialized state.
    fn put(&self, job: &MutationJob) -> impl Future<Output = Result<()>> + Send;

    /// Removes a job.
    fn delete(&self, id: JobId) -> impl Future<Output = Result<()>> + Send;

    /// Loads every persisted job in id order.
    fn load_all(&self) -> impl Future<Output = Result<Vec<MutationJob>>> + Send;

    /// Appends a permanently failed job to the outcome log.
    fn record_failure(
        &self,
        job: &MutationJob,
        reason: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Highest job id ever stored, including jobs since removed or failed.
    fn last_job_id(&self) -> impl Future<Output = Result<Option<JobId>>> + Send;
}

/// A permanently failed job as kept in the outcome log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMutation {
    /// The job as it was when it failed.
    pub job: MutationJob,
    /// Why it was given up on.
    pub reason: String,
    /// When it was given up on.
    pub failed_at: DateTime<Utc>,
}

/// Sqlite-backed [`MutationStore`] for one account.
pub struct SqliteMutationStore {
    account_id: AccountId,
    pool: SqlitePool,
}

impl SqliteMutationStore {
    /// Opens (creating if needed) the store at the given database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(account_id: AccountId, database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { account_id, pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory(account_id: AccountId) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { account_id, pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS mutation_jobs (
                account_id INTEGER NOT NULL,
                job_id INTEGER NOT NULL,
                folder_path TEXT NOT NULL,
                op_type TEXT NOT NULL,
                status TEXT NOT NULL,
                try_count INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY(account_id, job_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS failed_mutations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                job_id INTEGER NOT NULL,
                op_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                failed_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS mutation_job_ids (
                account_id INTEGER PRIMARY KEY,
                last_id INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_failed_mutations_account
            ON failed_mutations(account_id, failed_at)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Outcome log of permanently failed jobs, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn failures(&self) -> Result<Vec<FailedMutation>> {
        let rows = sqlx::query(
            r"
            SELECT payload, reason, failed_at
            FROM failed_mutations
            WHERE account_id = ?
            ORDER BY id ASC
            ",
        )
        .bind(self.account_id.0)
        .fetch_all(&self.pool)
        .await?;

        let failures = rows
            .iter()
            .filter_map(|row| {
                let payload: String = row.get("payload");
                let failed_at: String = row.get("failed_at");
                let job = serde_json::from_str(&payload)
                    .inspect_err(|err| tracing::warn!(?err, "Unreadable failed mutation"))
                    .ok()?;
                Some(FailedMutation {
                    job,
                    reason: row.get("reason"),
                    failed_at: DateTime::parse_from_rfc3339(&failed_at)
                        .ok()?
                        .with_timezone(&Utc),
                })
            })
            .collect();

        Ok(failures)
    }
}

impl MutationStore for SqliteMutationStore {
    async fn put(&self, job: &MutationJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        sqlx::query(
            r"
            INSERT INTO mutation_jobs
                (account_id, job_id, folder_path, op_type, status, try_count, payload, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, job_id) DO UPDATE SET
                folder_path = excluded.folder_path,
                op_type = excluded.op_type,
                status = excluded.status,
                try_count = excluded.try_count,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            ",
        )
        .bind(self.account_id.0)
        .bind(job.id.0)
        .bind(job.folder.as_str())
        .bind(job.op.name())
        .bind(job.status.as_str())
        .bind(job.try_count)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            INSERT INTO mutation_job_ids (account_id, last_id)
            VALUES (?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                last_id = MAX(last_id, excluded.last_id)
            ",
        )
        .bind(self.account_id.0)
        .bind(job.id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        sqlx::query(r"DELETE FROM mutation_jobs WHERE account_id = ? AND job_id = ?")
            .bind(self.account_id.0)
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<MutationJob>> {
        let rows = sqlx::query(
            r"
            SELECT payload
            FROM mutation_jobs
            WHERE account_id = ?
            ORDER BY job_id ASC
            ",
        )
        .bind(self.account_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload: String = row.get("payload");
            jobs.push(serde_json::from_str(&payload)?);
        }
        Ok(jobs)
    }

    async fn record_failure(&self, job: &MutationJob, reason: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO failed_mutations
                (account_id, job_id, op_type, payload, reason, failed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(self.account_id.0)
        .bind(job.id.0)
        .bind(job.op.name())
        .bind(serde_json::to_string(job)?)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_job_id(&self) -> Result<Option<JobId>> {
        let row = sqlx::query(
            r"
            SELECT MAX(id) AS last_id FROM (
                SELECT last_id AS id FROM mutation_job_ids WHERE account_id = ?
                UNION ALL
                SELECT job_id FROM mutation_jobs WHERE account_id = ?
                UNION ALL
                SELECT job_id FROM failed_mutations WHERE account_id = ?
            )
            ",
        )
        .bind(self.account_id.0)
        .bind(self.account_id.0)
        .bind(self.account_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<Option<i64>, _>("last_id").map(JobId))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jobs::{JobStatus, OperationType};
    use crate::model::FolderId;

    fn job(id: i64) -> MutationJob {
        MutationJob::new(
            JobId(id),
            OperationType::Move {
                target_folder: FolderId::new("Archive"),
            },
            FolderId::new("INBOX"),
            vec![7, 8],
        )
    }

    #[tokio::test]
    async fn test_put_and_load_in_id_order() {
        let store = SqliteMutationStore::in_memory(AccountId(1)).await.unwrap();
        store.put(&job(2)).await.unwrap();
        store.put(&job(1)).await.unwrap();

        let jobs = store.load_all().await.unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![JobId(1), JobId(2)]);
        assert_eq!(jobs[0].target_ids, vec![7, 8]);
        assert_eq!(
            jobs[0].op,
            OperationType::Move {
                target_folder: FolderId::new("Archive")
            }
        );
    }

    #[tokio::test]
    async fn test_put_upserts_state() {
        let store = SqliteMutationStore::in_memory(AccountId(1)).await.unwrap();
        let mut j = job(1);
        store.put(&j).await.unwrap();
        j.status = JobStatus::Running;
        j.try_count = 3;
        store.put(&j).await.unwrap();

        let jobs = store.load_all().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert_eq!(jobs[0].try_count, 3);
    }

    #[tokio::test]
    async fn test_delete_and_account_isolation() {
        let store = SqliteMutationStore::in_memory(AccountId(1)).await.unwrap();
        store.put(&job(1)).await.unwrap();
        store.delete(JobId(1)).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());

        let other = SqliteMutationStore {
            account_id: AccountId(2),
            pool: store.pool.clone(),
        };
        store.put(&job(5)).await.unwrap();
        assert!(other.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_log() {
        let store = SqliteMutationStore::in_memory(AccountId(1)).await.unwrap();
        store.record_failure(&job(4), "message-not-found").await.unwrap();

        let failures = store.failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].job.id, JobId(4));
        assert_eq!(failures[0].reason, "message-not-found");
    }

    #[tokio::test]
    async fn test_last_job_id_survives_removal() {
        let store = SqliteMutationStore::in_memory(AccountId(1)).await.unwrap();
        assert_eq!(store.last_job_id().await.unwrap(), None);

        store.put(&job(3)).await.unwrap();
        store.put(&job(1)).await.unwrap();
        store.delete(JobId(3)).await.unwrap();
        assert_eq!(store.last_job_id().await.unwrap(), Some(JobId(3)));

        store.record_failure(&job(9), "gone").await.unwrap();
        assert_eq!(store.last_job_id().await.unwrap(), Some(JobId(9)));

        let other = SqliteMutationStore {
            account_id: AccountId(2),
            pool: store.pool.clone(),
        };
        assert_eq!(other.last_job_id().await.unwrap(), None);
    }
}
