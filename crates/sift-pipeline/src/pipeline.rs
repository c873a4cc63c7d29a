//! Scheduler and worker pool that turn unembedded chunks into vector points.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sift_index::{Chunk, ChunkStore};
use sift_llm::EmbeddingProvider;
use sift_llm::LlmError;
use sift_llm::retry::RetryPolicy;
use sift_memory::{ChunkPayload, RepositoryId, VectorPoint, VectorStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::{EmbeddingJob, JobId, JobPriority, JobStatus};
use crate::store::JobStore;

/// Pipeline tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub queue_capacity: usize,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub retry_base_delay: Duration,
    #[serde(with = "millis")]
    pub retry_max_delay: Duration,
    /// A batch storing fewer than this fraction of its vectors is reported as an error.
    pub min_batch_store_ratio: f32,
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
    pub collection: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 50,
            queue_capacity: 100,
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(600),
            min_batch_store_ratio: 0.5,
            shutdown_timeout: Duration::from_secs(10),
            collection: "sift_chunks".into(),
        }
    }
}

impl PipelineConfig {
    /// Delay before the next attempt of a job that has used `attempts` attempts.
    #[must_use]
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        RetryPolicy {
            max_retries: self.max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
        .backoff(attempts.saturating_sub(1))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// How one attempt of a job ended.
#[derive(Debug)]
enum Attempt {
    Completed { processed: u64, failed: u64 },
    NothingStored(String),
    Interrupted,
}

/// Counters of one attempt.
#[derive(Debug, Default)]
struct Tally {
    processed: u64,
    failed: u64,
    last_error: Option<String>,
}

impl Tally {
    fn progress(&self, total: u64) -> f64 {
        if total == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = self.processed as f64 / total as f64 * 100.0;
        pct
    }
}

struct Inner {
    jobs: JobStore,
    chunks: ChunkStore,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    config: PipelineConfig,
    in_flight: Mutex<HashSet<JobId>>,
    collection_ready: AtomicBool,
}

/// Durable embedding queue drained by a fixed pool of workers.
///
/// Started once and stopped once; repeated calls to [`start`](Self::start) and
/// [`shutdown`](Self::shutdown) are no-ops.
pub struct EmbeddingPipeline {
    inner: Arc<Inner>,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for EmbeddingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingPipeline")
            .field("config", &self.inner.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EmbeddingPipeline {
    #[must_use]
    pub fn new(
        jobs: JobStore,
        chunks: ChunkStore,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs,
                chunks,
                embedder,
                vectors,
                config,
                in_flight: Mutex::new(HashSet::new()),
                collection_ready: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn jobs(&self) -> &JobStore {
        &self.inner.jobs
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Queue a repository for embedding.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyQueued`](crate::PipelineError::AlreadyQueued) if
    /// the repository already has a live job.
    pub async fn enqueue(
        &self,
        repository_id: RepositoryId,
        priority: JobPriority,
    ) -> Result<EmbeddingJob> {
        let job = self
            .inner
            .jobs
            .create(repository_id, priority, self.inner.config.max_attempts)
            .await?;
        tracing::info!(job_id = %job.id, repository_id = %repository_id, %priority, "embedding job queued");
        Ok(job)
    }

    /// Recover stale jobs and spawn the scheduler and workers.
    ///
    /// # Errors
    ///
    /// Returns an error if stale job recovery fails.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let recovered = self.inner.jobs.reset_stale_processing().await?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered jobs left processing by a previous run");
        }

        let config = &self.inner.config;
        let (tx, rx) = mpsc::channel::<JobId>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(config.workers + 1);
        handles.push(tokio::spawn(scheduler_loop(
            Arc::clone(&self.inner),
            tx,
            self.cancel.clone(),
        )));
        for worker in 0..config.workers.max(1) {
            handles.push(tokio::spawn(worker_loop(
                worker,
                Arc::clone(&self.inner),
                Arc::clone(&rx),
                self.cancel.clone(),
            )));
        }
        if let Ok(mut guard) = self.handles.lock() {
            guard.extend(handles);
        }

        tracing::info!(
            workers = config.workers.max(1),
            batch_size = config.batch_size,
            "embedding pipeline started"
        );
        Ok(())
    }

    /// Signal cancellation and wait (bounded) for workers to finish their current job.
    pub async fn shutdown(&self) {
        if !self.started.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .map(|mut guard| guard.drain(..).collect())
            .unwrap_or_default();
        let wait = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!("pipeline task ended abnormally: {e}");
                }
            }
        };
        if tokio::time::timeout(self.inner.config.shutdown_timeout, wait)
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_ms = u64::try_from(self.inner.config.shutdown_timeout.as_millis())
                    .unwrap_or(u64::MAX),
                "timed out waiting for embedding workers"
            );
        } else {
            tracing::info!("embedding pipeline stopped");
        }
    }

    /// Remove every vector of a repository and clear the chunks' vector references.
    ///
    /// Returns the number of vectors removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the vector index fails.
    pub async fn delete_repository_vectors(&self, repository_id: RepositoryId) -> Result<usize> {
        let inner = &self.inner;
        let refs = inner.chunks.vector_refs_for_repository(repository_id).await?;
        if refs.is_empty() {
            return Ok(0);
        }
        let count = refs.len();
        if inner
            .vectors
            .collection_exists(&inner.config.collection)
            .await?
        {
            inner
                .vectors
                .delete_by_ids(&inner.config.collection, refs)
                .await?;
        }
        inner.chunks.clear_vector_refs(repository_id).await?;
        tracing::info!(repository_id = %repository_id, count, "deleted repository vectors");
        Ok(count)
    }
}

impl Drop for EmbeddingPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn scheduler_loop(inner: Arc<Inner>, tx: mpsc::Sender<JobId>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => inner.schedule_due(&tx).await,
        }
    }
    tracing::debug!("embedding scheduler stopped");
}

async fn worker_loop(
    worker: usize,
    inner: Arc<Inner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<JobId>>>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                () = cancel.cancelled() => None,
                id = rx.recv() => id,
            }
        };
        let Some(id) = next else {
            break;
        };
        inner.run_job(id, &cancel).await;
        if let Ok(mut in_flight) = inner.in_flight.lock() {
            in_flight.remove(&id);
        }
    }
    tracing::debug!(worker, "embedding worker stopped");
}

impl Inner {
    /// Hand due jobs to the worker queue without blocking. A full queue leaves the rest
    /// for the next tick.
    async fn schedule_due(&self, tx: &mpsc::Sender<JobId>) {
        let limit = u32::try_from(self.config.queue_capacity).unwrap_or(u32::MAX);
        let due = match self.jobs.pending_due(Utc::now(), limit).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!("failed to poll embedding jobs: {e:#}");
                return;
            }
        };

        for job in due {
            let Ok(mut in_flight) = self.in_flight.lock() else {
                return;
            };
            if in_flight.contains(&job.id) {
                continue;
            }
            match tx.try_send(job.id) {
                Ok(()) => {
                    in_flight.insert(job.id);
                    tracing::debug!(job_id = %job.id, "job handed to workers");
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("worker queue full, retrying next tick");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }

    async fn run_job(&self, id: JobId, cancel: &CancellationToken) {
        let job = match self.jobs.claim(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %id, "job no longer claimable");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %id, "failed to claim job: {e:#}");
                return;
            }
        };
        tracing::info!(
            job_id = %id,
            repository_id = %job.repository_id,
            attempt = job.attempts,
            "embedding job started"
        );

        let outcome = match self.process(&job, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => Attempt::NothingStored(format!("{e:#}")),
        };

        let recorded = match outcome {
            Attempt::Completed { processed, failed } => {
                tracing::info!(job_id = %id, processed, failed, "embedding job completed");
                self.jobs.complete(id).await
            }
            Attempt::Interrupted => {
                tracing::info!(job_id = %id, "embedding job interrupted, returned to queue");
                self.jobs.requeue(id).await
            }
            Attempt::NothingStored(error) if job.attempts >= job.max_attempts => {
                tracing::error!(job_id = %id, attempts = job.attempts, "embedding job failed: {error}");
                self.jobs.fail(id, &error).await
            }
            Attempt::NothingStored(error) => {
                let delay = self.config.retry_delay(job.attempts);
                tracing::warn!(
                    job_id = %id,
                    attempts = job.attempts,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "embedding job attempt failed: {error}"
                );
                self.jobs.retry(id, &error, delay).await
            }
        };
        if let Err(e) = recorded {
            tracing::error!(job_id = %id, "failed to record job outcome: {e:#}");
        }
    }

    async fn process(&self, job: &EmbeddingJob, cancel: &CancellationToken) -> Result<Attempt> {
        let chunks = self
            .chunks
            .chunks_needing_embedding(job.repository_id)
            .await?;
        let total = chunks.len() as u64;
        self.jobs.begin_attempt(job.id, total).await?;
        if chunks.is_empty() {
            tracing::debug!(job_id = %job.id, "nothing to embed");
            return Ok(Attempt::Completed {
                processed: 0,
                failed: 0,
            });
        }

        self.embed_chunks(job, &chunks, cancel).await
    }

    /// Embed `chunks` batch by batch, recording progress on `job` after each batch.
    async fn embed_chunks(
        &self,
        job: &EmbeddingJob,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        let total = chunks.len() as u64;
        let mut tally = Tally::default();
        for (batch_no, batch) in chunks.chunks(self.config.batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                return Ok(Attempt::Interrupted);
            }
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let embedded = tokio::select! {
                () = cancel.cancelled() => return Ok(Attempt::Interrupted),
                r = self.embedder.embed_batch(&texts) => r,
            };

            let stored = match embedded {
                Ok(vectors) => self.store_batch(batch, vectors).await,
                Err(e) => Err(e.to_string()),
            };
            let batch_len = batch.len() as u64;
            match stored {
                Ok(stored) => {
                    let stored = stored as u64;
                    tally.processed += stored;
                    tally.failed += batch_len - stored;
                    #[allow(clippy::cast_precision_loss)]
                    let ratio = stored as f32 / batch_len as f32;
                    if ratio < self.config.min_batch_store_ratio {
                        let msg = format!("batch {batch_no}: stored {stored} of {batch_len} vectors");
                        tracing::error!(job_id = %job.id, batch = batch_no, "{msg}");
                        tally.last_error = Some(msg);
                    } else {
                        tracing::debug!(job_id = %job.id, batch = batch_no, stored, "batch embedded");
                    }
                }
                Err(error) => {
                    tracing::error!(job_id = %job.id, batch = batch_no, "embedding batch failed: {error}");
                    tally.failed += batch_len;
                    tally.last_error = Some(format!("batch {batch_no}: {error}"));
                }
            }

            self.jobs
                .update_progress(
                    job.id,
                    tally.processed,
                    tally.failed,
                    tally.progress(total),
                    tally.last_error.as_deref(),
                )
                .await?;
        }

        if tally.processed == 0 {
            return Ok(Attempt::NothingStored(
                tally
                    .last_error
                    .unwrap_or_else(|| "no chunks were embedded".into()),
            ));
        }
        Ok(Attempt::Completed {
            processed: tally.processed,
            failed: tally.failed,
        })
    }

    /// Upsert one point per chunk and record the vector references. Returns how many
    /// references were stored.
    async fn store_batch(
        &self,
        batch: &[Chunk],
        vectors: Vec<Vec<f32>>,
    ) -> std::result::Result<usize, String> {
        if vectors.len() != batch.len() {
            return Err(LlmError::CountMismatch {
                expected: batch.len(),
                actual: vectors.len(),
            }
            .to_string());
        }
        if let Some(first) = vectors.first() {
            self.ensure_collection(first.len()).await?;
        }

        let points: Vec<VectorPoint> = batch
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorPoint {
                id: chunk.id.clone(),
                vector,
                payload: point_payload(chunk),
            })
            .collect();
        self.vectors
            .upsert(&self.config.collection, points)
            .await
            .map_err(|e| e.to_string())?;

        let refs: Vec<(String, String)> = batch
            .iter()
            .map(|c| (c.id.clone(), c.id.clone()))
            .collect();
        Ok(self.chunks.set_vector_refs(&refs).await)
    }

    async fn ensure_collection(&self, dim: usize) -> std::result::Result<(), String> {
        if self.collection_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.vectors
            .ensure_collection(&self.config.collection, dim as u64)
            .await
            .map_err(|e| e.to_string())?;
        self.collection_ready.store(true, Ordering::Release);
        Ok(())
    }
}

fn point_payload(chunk: &Chunk) -> ChunkPayload {
    ChunkPayload {
        repository_id: Some(chunk.repository_id),
        file_path: chunk.file_path.clone(),
        language: chunk.language.clone(),
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        function_names: chunk.metadata.functions.clone(),
        class_names: chunk.metadata.classes.clone(),
        content_hash: chunk.content_hash.clone(),
    }
}

/// Whether a job will not change state again.
#[must_use]
pub fn is_settled(job: &EmbeddingJob) -> bool {
    job.status.is_terminal() || (job.status == JobStatus::Pending && job.attempts_left() == 0)
}
