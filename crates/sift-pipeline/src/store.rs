use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sift_memory::RepositoryId;
use sqlx::SqlitePool;

use crate::error::{PipelineError, Result};
use crate::job::{EmbeddingJob, JobId, JobPriority, JobStatus, QueueStats};

const JOB_COLUMNS: &str = "id, repository_id, status, priority, attempts, max_attempts, \
     total_chunks, processed_chunks, failed_chunks, progress, last_error, created_at, \
     started_at, completed_at, next_attempt_at";

/// Timestamps are written in one fixed-width format so they compare as text.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: JobId,
    repository_id: RepositoryId,
    status: String,
    priority: i64,
    attempts: i64,
    max_attempts: i64,
    total_chunks: i64,
    processed_chunks: i64,
    failed_chunks: i64,
    progress: f64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    next_attempt_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for EmbeddingJob {
    type Error = PipelineError;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            PipelineError::Database(sqlx::Error::Decode(
                format!("unknown job status {:?}", row.status).into(),
            ))
        })?;
        Ok(Self {
            id: row.id,
            repository_id: row.repository_id,
            status,
            priority: JobPriority::from_rank(row.priority),
            attempts: u32::try_from(row.attempts)?,
            max_attempts: u32::try_from(row.max_attempts)?,
            total_chunks: u64::try_from(row.total_chunks)?,
            processed_chunks: u64::try_from(row.processed_chunks)?,
            failed_chunks: u64::try_from(row.failed_chunks)?,
            progress: row.progress,
            last_error: row.last_error,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            next_attempt_at: row.next_attempt_at,
        })
    }
}

fn rows_to_jobs(rows: Vec<JobRow>) -> Result<Vec<EmbeddingJob>> {
    rows.into_iter().map(EmbeddingJob::try_from).collect()
}

/// Embedding jobs in the `embedding_jobs` table.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Queue a new job for a repository.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyQueued`] if the repository already has a pending
    /// or processing job, or a database error.
    pub async fn create(
        &self,
        repository_id: RepositoryId,
        priority: JobPriority,
        max_attempts: u32,
    ) -> Result<EmbeddingJob> {
        let now = ts(Utc::now());
        let row: JobRow = sqlx::query_as(&format!(
            "INSERT INTO embedding_jobs \
             (repository_id, status, priority, max_attempts, created_at, next_attempt_at) \
             VALUES (?, 'pending', ?, ?, ?, ?) RETURNING {JOB_COLUMNS}"
        ))
        .bind(repository_id)
        .bind(priority.rank())
        .bind(i64::from(max_attempts.max(1)))
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PipelineError::AlreadyQueued { repository_id }
            }
            other => PipelineError::Database(other),
        })?;
        EmbeddingJob::try_from(row)
    }

    /// Move a pending job to `processing`, counting one attempt.
    ///
    /// Returns `None` if the job is not pending or has no attempts left.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn claim(&self, id: JobId) -> Result<Option<EmbeddingJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE embedding_jobs \
             SET status = 'processing', attempts = attempts + 1, started_at = ? \
             WHERE id = ? AND status = 'pending' AND attempts < max_attempts \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(ts(Utc::now()))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EmbeddingJob::try_from).transpose()
    }

    /// Reset counters at the start of an attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn begin_attempt(&self, id: JobId, total_chunks: u64) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_jobs \
             SET total_chunks = ?, processed_chunks = 0, failed_chunks = 0, progress = 0 \
             WHERE id = ?",
        )
        .bind(i64::try_from(total_chunks)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist per-batch progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_progress(
        &self,
        id: JobId,
        processed_chunks: u64,
        failed_chunks: u64,
        progress: f64,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_jobs \
             SET processed_chunks = ?, failed_chunks = ?, progress = ?, \
                 last_error = COALESCE(?, last_error) \
             WHERE id = ?",
        )
        .bind(i64::try_from(processed_chunks)?)
        .bind(i64::try_from(failed_chunks)?)
        .bind(progress.clamp(0.0, 100.0))
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn complete(&self, id: JobId) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_jobs \
             SET status = 'completed', completed_at = ?, \
                 progress = CASE WHEN total_chunks = 0 THEN 100 ELSE progress END \
             WHERE id = ?",
        )
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_jobs SET status = 'failed', last_error = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Send a processing job back to `pending`, not to be claimed before `delay` elapses.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn retry(&self, id: JobId, error: &str, delay: Duration) -> Result<()> {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let next = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        sqlx::query(
            "UPDATE embedding_jobs SET status = 'pending', last_error = ?, next_attempt_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(ts(next))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Return an interrupted job to `pending` without charging the attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn requeue(&self, id: JobId) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_jobs \
             SET status = 'pending', attempts = MAX(attempts - 1, 0) \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pending jobs whose backoff has elapsed, by priority then age.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<EmbeddingJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM embedding_jobs \
             WHERE status = 'pending' AND next_attempt_at <= ? AND attempts < max_attempts \
             ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?"
        ))
        .bind(ts(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows_to_jobs(rows)
    }

    /// Recover jobs left `processing` by a previous process. They keep their attempt
    /// count; jobs with no attempts left are failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reset_stale_processing(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE embedding_jobs \
             SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END, \
                 last_error = COALESCE(last_error, 'interrupted while processing'), \
                 completed_at = CASE WHEN attempts >= max_attempts THEN ? ELSE completed_at END \
             WHERE status = 'processing'",
        )
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, id: JobId) -> Result<Option<EmbeddingJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM embedding_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EmbeddingJob::try_from).transpose()
    }

    /// All jobs of a repository, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn jobs_for_repository(
        &self,
        repository_id: RepositoryId,
    ) -> Result<Vec<EmbeddingJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM embedding_jobs WHERE repository_id = ? ORDER BY id DESC"
        ))
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        rows_to_jobs(rows)
    }

    /// The most recent job of a repository, carrying its latest progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn latest_for_repository(
        &self,
        repository_id: RepositoryId,
    ) -> Result<Option<EmbeddingJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM embedding_jobs WHERE repository_id = ? \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EmbeddingJob::try_from).transpose()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM embedding_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count)?;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                None => tracing::warn!(status, "unknown job status in queue"),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> JobStore {
        let pool = sift_memory::open_pool(":memory:").await.unwrap();
        JobStore::new(pool)
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = ts(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let b = ts(DateTime::from_timestamp(1_700_000_000, 123_000_000).unwrap());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert!(a.ends_with('Z'));
    }

    #[tokio::test]
    async fn create_rejects_second_live_job() {
        let store = store().await;
        let repo = RepositoryId(1);
        let job = store.create(repo, JobPriority::Normal, 3).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);

        let err = store.create(repo, JobPriority::High, 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyQueued { repository_id } if repository_id == repo));

        store.claim(job.id).await.unwrap().unwrap();
        let err = store.create(repo, JobPriority::Normal, 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyQueued { .. }));

        store.complete(job.id).await.unwrap();
        assert!(store.create(repo, JobPriority::Normal, 3).await.is_ok());
    }

    #[tokio::test]
    async fn claim_counts_attempts_and_respects_max() {
        let store = store().await;
        let job = store.create(RepositoryId(1), JobPriority::Normal, 1).await.unwrap();
        let claimed = store.claim(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());

        assert!(store.claim(job.id).await.unwrap().is_none());

        store.retry(job.id, "boom", Duration::ZERO).await.unwrap();
        assert!(store.claim(job.id).await.unwrap().is_none());
        assert!(store.pending_due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_gates_on_next_attempt() {
        let store = store().await;
        let job = store.create(RepositoryId(1), JobPriority::Normal, 3).await.unwrap();
        store.claim(job.id).await.unwrap().unwrap();
        store
            .retry(job.id, "provider down", Duration::from_secs(60))
            .await
            .unwrap();

        let reloaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Pending);
        assert_eq!(reloaded.last_error.as_deref(), Some("provider down"));
        assert!(store.pending_due(Utc::now(), 10).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(61);
        let due = store.pending_due(later, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
    }

    #[tokio::test]
    async fn pending_due_orders_by_priority() {
        let store = store().await;
        let low = store.create(RepositoryId(1), JobPriority::Low, 3).await.unwrap();
        let normal = store.create(RepositoryId(2), JobPriority::Normal, 3).await.unwrap();
        let high = store.create(RepositoryId(3), JobPriority::High, 3).await.unwrap();

        let due = store.pending_due(Utc::now(), 10).await.unwrap();
        let ids: Vec<JobId> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, normal.id, low.id]);

        let due = store.pending_due(Utc::now(), 1).await.unwrap();
        assert_eq!(due[0].id, high.id);
    }

    #[tokio::test]
    async fn progress_and_completion() {
        let store = store().await;
        let job = store.create(RepositoryId(5), JobPriority::Normal, 3).await.unwrap();
        store.claim(job.id).await.unwrap();
        store.begin_attempt(job.id, 100).await.unwrap();
        store
            .update_progress(job.id, 50, 0, 50.0, None)
            .await
            .unwrap();
        store
            .update_progress(job.id, 50, 50, 50.0, Some("batch 2 failed"))
            .await
            .unwrap();
        store.update_progress(job.id, 50, 50, 50.0, None).await.unwrap();
        store.complete(job.id).await.unwrap();

        let latest = store
            .latest_for_repository(RepositoryId(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, JobStatus::Completed);
        assert_eq!(latest.total_chunks, 100);
        assert_eq!(latest.processed_chunks, 50);
        assert_eq!(latest.failed_chunks, 50);
        assert!((latest.progress - 50.0).abs() < f64::EPSILON);
        assert_eq!(latest.last_error.as_deref(), Some("batch 2 failed"));
        assert!(latest.completed_at.is_some());
    }

    #[tokio::test]
    async fn empty_job_completes_at_full_progress() {
        let store = store().await;
        let job = store.create(RepositoryId(5), JobPriority::Normal, 3).await.unwrap();
        store.claim(job.id).await.unwrap();
        store.begin_attempt(job.id, 0).await.unwrap();
        store.complete(job.id).await.unwrap();
        let job = store.get(job.id).await.unwrap().unwrap();
        assert!((job.progress - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stale_processing_jobs_recovered() {
        let store = store().await;
        let a = store.create(RepositoryId(1), JobPriority::Normal, 3).await.unwrap();
        let b = store.create(RepositoryId(2), JobPriority::Normal, 1).await.unwrap();
        store.claim(a.id).await.unwrap();
        store.claim(b.id).await.unwrap();

        assert_eq!(store.reset_stale_processing().await.unwrap(), 2);
        let a = store.get(a.id).await.unwrap().unwrap();
        let b = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Pending);
        assert_eq!(a.attempts, 1);
        assert_eq!(b.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn requeue_refunds_attempt() {
        let store = store().await;
        let job = store.create(RepositoryId(1), JobPriority::Normal, 1).await.unwrap();
        store.claim(job.id).await.unwrap().unwrap();
        store.requeue(job.id).await.unwrap();
        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(store.claim(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_and_history() {
        let store = store().await;
        let a = store.create(RepositoryId(1), JobPriority::Normal, 3).await.unwrap();
        store.claim(a.id).await.unwrap();
        store.fail(a.id, "fatal").await.unwrap();
        store.create(RepositoryId(1), JobPriority::Normal, 3).await.unwrap();
        store.create(RepositoryId(2), JobPriority::Normal, 3).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);

        let history = store.jobs_for_repository(RepositoryId(1)).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status, JobStatus::Failed);
        assert!(store.get(JobId(999)).await.unwrap().is_none());
    }
}
