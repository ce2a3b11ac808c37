use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Error taxonomy shared by every component in the ingestion/retrieval core.
///
/// Call sites classify failures into these buckets so that the queue and the
/// chunking pipeline can decide retry vs. fail without inspecting string
/// messages (spec.md §7).
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing object / chunk / job / embedding link.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique constraint (`source_uri`, `vector_id`) was violated; the
    /// caller is expected to fall back to read-existing.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Any other relational-store failure. Always propagated; the store
    /// guarantees transactional rollback on these.
    #[error("storage error: {0}")]
    Storage(#[from] surrealdb::Error),

    /// Vector store failure. Downgraded to a warning + orphan-tracking
    /// during deletion; fatal during ingestion of the affected object.
    #[error("vector store error: {0}")]
    VectorStore(String),

    /// Fetch / HTML-parse / PDF-extract failure, tagged by retryability so
    /// the queue can apply backoff (transient) or fail immediately
    /// (permanent).
    #[error("extraction error ({kind:?}): {message}")]
    Extraction {
        kind: ExtractionErrorKind,
        message: String,
    },

    /// LLM output failed schema validation after the one-retry JSON-repair
    /// attempt.
    #[error("AI validation error [{correlation_id}]: {0}", correlation_id = .1)]
    AIValidation(String, String),

    /// LLM/embedding provider transport error, after the one retry.
    #[error("AI transport error [{correlation_id}]: {0}", correlation_id = .1)]
    AITransport(String, String),

    /// A compare-and-swap status transition lost the race to another
    /// claimer. Non-fatal; callers abort the current attempt.
    #[error("race lost on {0}")]
    RaceLost(String),

    /// An object has been stuck in `parsed` with no owning job for three
    /// consecutive chunking-pipeline ticks.
    #[error("orphaned object: {0}")]
    Orphan(String),

    /// Caller-supplied data failed a validation rule (not a schema
    /// violation from an LLM).
    #[error("validation error: {0}")]
    Validation(String),

    /// A worker or pipeline stage failed to complete for reasons specific
    /// to processing this item, independent of the storage layer.
    #[error("processing error: {0}")]
    Processing(String),

    #[error("openai error: {0}")]
    OpenAI(#[from] OpenAIError),

    #[error("task join error: {0}")]
    Join(#[from] JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Whether an extraction failure should drive a queue retry or an
/// immediate `failed` transition (spec.md §4.6 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionErrorKind {
    Transient,
    Permanent,
}

impl AppError {
    pub fn extraction_transient(message: impl Into<String>) -> Self {
        Self::Extraction {
            kind: ExtractionErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn extraction_permanent(message: impl Into<String>) -> Self {
        Self::Extraction {
            kind: ExtractionErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Whether the queue should retry the job that produced this error
    /// (spec.md §4.6 step 1, §7).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Extraction { kind, .. } => *kind == ExtractionErrorKind::Transient,
            Self::Validation(_) | Self::AIValidation(..) | Self::NotFound(_) | Self::Serde(_) => false,
            Self::Storage(_) | Self::VectorStore(_) | Self::AITransport(..) => true,
            _ => true,
        }
    }
}
