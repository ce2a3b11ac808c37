use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stored_object;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Vectorizing,
    Completed,
    Failed,
    Cancelled,
    RetryPending,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

stored_object!(IngestionJob, "ingestion_jobs", {
    job_type: String,
    source_identifier: String,
    priority: i64,
    status: JobStatus,
    attempts: i64,
    max_retries: i64,
    chunking_status: Option<ChunkingStatus>,
    chunking_error_info: Option<String>,
    related_object_id: Option<String>,
    job_specific_data: Option<serde_json::Value>,
    error_info: Option<String>,
    next_attempt_at: Option<chrono::DateTime<chrono::Utc>>
});

/// Default retry budget for a newly created job (spec.md §3: `attempts <=
/// max_retries + 1`).
pub const DEFAULT_MAX_RETRIES: i64 = 3;

#[derive(Debug, Clone, Default)]
pub struct NewJobOptions {
    pub priority: i64,
    pub related_object_id: Option<String>,
    pub job_specific_data: Option<serde_json::Value>,
}

impl IngestionJob {
    pub fn new(job_type: impl Into<String>, source_identifier: impl Into<String>, opts: NewJobOptions) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            job_type: job_type.into(),
            source_identifier: source_identifier.into(),
            priority: opts.priority,
            status: JobStatus::Queued,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            chunking_status: None,
            chunking_error_info: None,
            related_object_id: opts.related_object_id,
            job_specific_data: opts.job_specific_data,
            error_info: None,
            next_attempt_at: None,
        }
    }
}

/// Structured error payload stored as JSON on a failed/retry-pending job
/// attempt (spec.md §4.5 rule 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub attempt: i64,
}
