//! Persistent ingestion queue (spec.md §4.5).
//!
//! Jobs live in the `ingestion_jobs` table (owned by `common`). Scheduling is
//! pull-based: `process_jobs()` is called on a tick by the long-running worker
//! binary, claims eligible jobs by compare-and-swap on `status`, and spawns a
//! bounded number of worker tasks. Lifecycle events are fire-and-forget,
//! matching the teacher's claim-loop style in `ingestion-pipeline::run_worker_loop`.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    storage::types::ingestion_job::{IngestionJob, JobStatus, NewJobOptions},
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, instrument, warn};

/// What a job processor decided after a successful run (spec.md §4.5 rule 3).
#[derive(Debug, Clone)]
pub enum ProcessorOutcome {
    /// Terminal success; no downstream work.
    Completed,
    /// Hand off to the Chunking Pipeline.
    HandOffToChunking { related_object_id: String },
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &IngestionJob) -> Result<ProcessorOutcome, AppError>;
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobCreated { job_id: String },
    JobStarted { job_id: String },
    JobRetry { job_id: String, next_attempt_at: DateTime<Utc> },
    WorkerCompleted { job_id: String },
    WorkerFailed { job_id: String, error: String },
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub by_status: HashMap<String, usize>,
}

pub struct IngestionQueue {
    db: Arc<SurrealDbClient>,
    concurrency: usize,
    processors: RwLock<HashMap<String, Arc<dyn JobProcessor>>>,
    active: Mutex<HashSet<String>>,
    events: broadcast::Sender<QueueEvent>,
}

impl IngestionQueue {
    pub fn new(db: Arc<SurrealDbClient>, concurrency: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            concurrency: concurrency.max(1),
            processors: RwLock::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // Fire-and-forget: no receivers is not an error (spec.md §4.5 rule 5).
        let _ = self.events.send(event);
    }

    /// Exactly one processor per job type; re-registration replaces it
    /// (spec.md §4.5).
    pub async fn register_processor(&self, job_type: impl Into<String>, processor: Arc<dyn JobProcessor>) {
        self.processors.write().await.insert(job_type.into(), processor);
    }

    #[instrument(skip(self, opts), fields(job_type = %job_type, source_identifier = %source_identifier))]
    pub async fn add_job(
        &self,
        job_type: impl Into<String> + std::fmt::Display,
        source_identifier: impl Into<String> + std::fmt::Display,
        opts: NewJobOptions,
    ) -> Result<IngestionJob, AppError> {
        let job_type_s = job_type.to_string();
        let source_identifier_s = source_identifier.to_string();
        let job = IngestionJob::new(job_type_s, source_identifier_s, opts);
        let job_id = job.id.clone();
        let stored = self
            .db
            .store_item(job)
            .await?
            .ok_or_else(|| AppError::InternalError("store_item returned no row".into()))?;
        info!(job_id = %job_id, "queued ingestion job");
        self.emit(QueueEvent::JobCreated { job_id });
        Ok(stored)
    }

    pub async fn cancel(&self, id: &str) -> Result<bool, AppError> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('ingestion_jobs', $id) \
                 SET status = 'cancelled' \
                 WHERE status IN ['queued', 'retry_pending'] \
                 RETURN AFTER;",
            )
            .bind(("id", id.to_string()))
            .await?;
        let updated: Vec<IngestionJob> = response.take(0)?;
        Ok(!updated.is_empty())
    }

    pub async fn retry(&self, id: &str) -> Result<bool, AppError> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('ingestion_jobs', $id) \
                 SET status = 'queued', attempts = 0, error_info = NONE, next_attempt_at = NONE \
                 WHERE status = 'failed' \
                 RETURN AFTER;",
            )
            .bind(("id", id.to_string()))
            .await?;
        let updated: Vec<IngestionJob> = response.take(0)?;
        Ok(!updated.is_empty())
    }

    pub async fn stats(&self) -> Result<QueueStats, AppError> {
        let jobs: Vec<IngestionJob> = self.db.get_all_stored_items().await?;
        let mut by_status = HashMap::new();
        for job in jobs {
            *by_status.entry(format!("{:?}", job.status)).or_insert(0) += 1;
        }
        Ok(QueueStats { by_status })
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// The scheduling tick (spec.md §4.5 rules 1-4). Claims up to
    /// `concurrency - active` jobs and spawns a worker task per claim;
    /// returns the number of jobs dispatched this tick.
    #[instrument(skip(self))]
    pub async fn process_jobs(self: &Arc<Self>) -> Result<usize, AppError> {
        let slots = {
            let active = self.active.lock().await;
            self.concurrency.saturating_sub(active.len())
        };
        if slots == 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let mut candidates = self
            .db
            .query(
                "SELECT * FROM ingestion_jobs \
                 WHERE status IN ['queued', 'retry_pending'] \
                 AND (next_attempt_at IS NONE OR next_attempt_at <= $now) \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT $limit;",
            )
            .bind(("now", now))
            .bind(("limit", slots))
            .await?;
        let candidates: Vec<IngestionJob> = candidates.take(0)?;

        let mut dispatched = 0usize;
        for candidate in candidates {
            if let Some(job) = self.claim(&candidate.id).await? {
                self.emit(QueueEvent::JobStarted { job_id: job.id.clone() });
                self.active.lock().await.insert(job.id.clone());
                let queue = Arc::clone(self);
                tokio::spawn(async move {
                    queue.run_job(job).await;
                });
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Compare-and-swap claim: `queued|retry_pending -> processing`. Returns
    /// `None` if a concurrent claimer won the race (spec.md §4.5 rule 2).
    async fn claim(&self, id: &str) -> Result<Option<IngestionJob>, AppError> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('ingestion_jobs', $id) \
                 SET status = 'processing' \
                 WHERE status IN ['queued', 'retry_pending'] \
                 RETURN AFTER;",
            )
            .bind(("id", id.to_string()))
            .await?;
        let claimed: Vec<IngestionJob> = response.take(0)?;
        Ok(claimed.into_iter().next())
    }

    async fn run_job(self: Arc<Self>, job: IngestionJob) {
        let job_id = job.id.clone();
        let processor = self.processors.read().await.get(&job.job_type).cloned();

        let Some(processor) = processor else {
            error!(%job_id, job_type = %job.job_type, "no processor registered for job type");
            let err = AppError::Validation(format!("no processor registered for job type '{}'", job.job_type));
            let _ = self.fail_job(&job, &err).await;
            self.active.lock().await.remove(&job_id);
            return;
        };

        match processor.process(&job).await {
            Ok(outcome) => {
                if let Err(e) = self.complete_job(&job, outcome).await {
                    error!(%job_id, error = %e, "failed to persist job completion");
                }
                self.emit(QueueEvent::WorkerCompleted { job_id: job_id.clone() });
            }
            Err(err) => {
                warn!(%job_id, error = %err, "ingestion job processor failed");
                if let Err(e) = self.fail_job(&job, &err).await {
                    error!(%job_id, error = %e, "failed to persist job failure");
                }
                self.emit(QueueEvent::WorkerFailed {
                    job_id: job_id.clone(),
                    error: err.to_string(),
                });
            }
        }

        self.active.lock().await.remove(&job_id);
    }

    async fn complete_job(&self, job: &IngestionJob, outcome: ProcessorOutcome) -> Result<(), AppError> {
        match outcome {
            ProcessorOutcome::Completed => {
                self.db
                    .query(
                        "UPDATE type::thing('ingestion_jobs', $id) SET status = 'completed';",
                    )
                    .bind(("id", job.id.clone()))
                    .await?;
            }
            ProcessorOutcome::HandOffToChunking { related_object_id } => {
                self.db
                    .query(
                        "UPDATE type::thing('ingestion_jobs', $id) \
                         SET status = 'vectorizing', chunking_status = 'pending', related_object_id = $object_id;",
                    )
                    .bind(("id", job.id.clone()))
                    .bind(("object_id", related_object_id))
                    .await?;
            }
        }
        Ok(())
    }

    /// Exponential backoff on failure (spec.md §4.5 rule 4, §4.6 step 1):
    /// `retry_pending` with a future `next_attempt_at` while
    /// `attempts < max_retries` AND the error is retryable; a permanent
    /// error (4xx fetch, fatal AI validation, etc.) goes straight to the
    /// terminal `failed` state regardless of remaining attempts.
    async fn fail_job(&self, job: &IngestionJob, err: &AppError) -> Result<(), AppError> {
        let attempts = job.attempts + 1;
        let message = err.to_string();
        if err.is_retryable() && attempts < job.max_retries {
            let backoff_secs = 2i64.saturating_pow(attempts.clamp(0, 20) as u32).min(3600);
            let next_attempt_at = Utc::now() + chrono::Duration::seconds(backoff_secs);
            self.db
                .query(
                    "UPDATE type::thing('ingestion_jobs', $id) \
                     SET status = 'retry_pending', attempts = $attempts, \
                         error_info = $error_info, next_attempt_at = $next_attempt_at;",
                )
                .bind(("id", job.id.clone()))
                .bind(("attempts", attempts))
                .bind(("error_info", job_attempt_error_json(&message, attempts)))
                .bind(("next_attempt_at", next_attempt_at))
                .await?;
            self.emit(QueueEvent::JobRetry {
                job_id: job.id.clone(),
                next_attempt_at,
            });
        } else {
            self.db
                .query(
                    "UPDATE type::thing('ingestion_jobs', $id) \
                     SET status = 'failed', attempts = $attempts, error_info = $error_info;",
                )
                .bind(("id", job.id.clone()))
                .bind(("attempts", attempts))
                .bind(("error_info", job_attempt_error_json(&message, attempts)))
                .await?;
        }
        Ok(())
    }
}

fn job_attempt_error_json(message: &str, attempt: i64) -> String {
    serde_json::json!({ "message": message, "attempt": attempt }).to_string()
}
