//! Chunking Pipeline (spec.md §4.9): claims `parsed` objects from the
//! Relational Store, turns them into embedded chunks, and hands the
//! terminal status back to both the object and its originating job.
//!
//! Driven by a scheduler tick like the Ingestion Queue (see `crate::queue`),
//! sharing the same rate limiter instance but with its own bounded
//! concurrency and a per-operation circuit breaker guarding embed calls.

mod saga;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        repositories::{
            chunk_repository::ChunkRepository,
            embedding_link_repository::EmbeddingLinkRepository,
            object_repository::ObjectRepository,
        },
        types::{
            chunk::Chunk,
            embedding_link::EmbeddingLink,
            object::{Object, ObjectStatus, ObjectType, Proposition, PropositionType},
        },
        vector_store::{ProcessingDepth, RecordType, VectorRecord, VectorStore},
    },
};
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, instrument, warn};

use crate::{
    ai_gateway::AiGateway,
    circuit_breaker::{Admission, CircuitBreaker},
    rate_limiter::SlidingWindowRateLimiter,
};

use saga::ChunkingSaga;

const EMBED_OPERATION: &str = "chunking_pipeline.embed";

/// Per-object ingestion job row, just the slice this pipeline needs
/// (mirrors `IngestionJob` without pulling the full type's CRUD surface in).
#[derive(Debug, Clone, Deserialize)]
struct AwaitingJob {
    id: String,
}

/// Lifecycle events, fire-and-forget like `crate::queue::QueueEvent` (no
/// receivers is not an error).
#[derive(Debug, Clone)]
pub enum ChunkingEvent {
    ObjectEmbedded { object_id: String },
    ObjectFailed { object_id: String, error: String },
}

pub struct ChunkingPipelineConfig {
    pub max_concurrent: usize,
    pub rpm_budget: u32,
    pub avg_requests_per_object: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_window_secs: u64,
    pub circuit_breaker_half_open_probes: u32,
    pub orphan_attempt_limit: u32,
    pub shutdown_timeout: Duration,
    pub embedding_model: String,
}

pub struct ChunkingPipeline {
    db: Arc<SurrealDbClient>,
    vector_store: Arc<VectorStore>,
    ai_gateway: Arc<AiGateway>,
    rate_limiter: Arc<SlidingWindowRateLimiter>,
    circuit_breaker: CircuitBreaker,
    max_concurrent: usize,
    orphan_attempt_limit: u32,
    shutdown_timeout: Duration,
    embedding_model: String,
    active: Mutex<HashSet<String>>,
    orphan_attempts: Mutex<HashMap<String, u32>>,
    events: broadcast::Sender<ChunkingEvent>,
}

impl ChunkingPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        vector_store: Arc<VectorStore>,
        ai_gateway: Arc<AiGateway>,
        rate_limiter: Arc<SlidingWindowRateLimiter>,
        config: ChunkingPipelineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            vector_store,
            ai_gateway,
            rate_limiter,
            circuit_breaker: CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_window_secs,
                config.circuit_breaker_half_open_probes,
            ),
            max_concurrent: config.max_concurrent.max(1),
            orphan_attempt_limit: config.orphan_attempt_limit,
            shutdown_timeout: config.shutdown_timeout,
            embedding_model: config.embedding_model,
            active: Mutex::new(HashSet::new()),
            orphan_attempts: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChunkingEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChunkingEvent) {
        let _ = self.events.send(event);
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Waits up to `shutdown_timeout` for active object processings to
    /// drain; logs anything still running past that (spec.md §5).
    pub async fn shutdown(self: &Arc<Self>) {
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        loop {
            let remaining = self.active.lock().await.clone();
            if remaining.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(ids = ?remaining, "chunking pipeline shutdown timed out with active objects");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// The scheduler tick (spec.md §4.9 steps 1-4). Returns the number of
    /// objects dispatched this tick.
    #[instrument(skip(self))]
    pub async fn tick(self: &Arc<Self>) -> Result<usize, AppError> {
        let slots = {
            let active = self.active.lock().await;
            self.max_concurrent.saturating_sub(active.len())
        };
        if slots == 0 {
            return Ok(0);
        }

        let max_new = self.rate_limiter.headroom_objects() as usize;
        let limit = slots.min(max_new);
        if limit == 0 {
            return Ok(0);
        }

        let object_repo = ObjectRepository::new(&self.db);
        let objects = object_repo.get_processable(limit).await?;

        let mut dispatched = 0usize;
        for object in objects {
            self.active.lock().await.insert(object.id.clone());
            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                let object_id = object.id.clone();
                if let Err(err) = pipeline.process_object(object).await {
                    error!(object_id = %object_id, error = %err, "chunking pipeline failed to process object");
                }
                pipeline.active.lock().await.remove(&object_id);
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    #[instrument(skip_all, fields(object_id = %object.id))]
    async fn process_object(&self, object: Object) -> Result<(), AppError> {
        // Step a: locate the job awaiting chunking.
        let Some(job) = self.find_job_awaiting_chunking(&object.id).await? else {
            let attempts = {
                let mut attempts = self.orphan_attempts.lock().await;
                let entry = attempts.entry(object.id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if attempts >= self.orphan_attempt_limit {
                warn!(object_id = %object.id, attempts, "no ingestion job found across retry budget; marking orphaned");
                let object_repo = ObjectRepository::new(&self.db);
                object_repo
                    .update_status(&object.id, ObjectStatus::Error, None, Some("orphaned".to_string()))
                    .await?;
                self.orphan_attempts.lock().await.remove(&object.id);
            }
            return Ok(());
        };
        self.orphan_attempts.lock().await.remove(&object.id);

        // Step b: CAS claim parsed -> embedding.
        let Some(claimed) = self.claim_object(&object.id).await? else {
            warn!(object_id = %object.id, "lost race claiming object for embedding");
            self.set_job_failed(&job.id, "lost claim race on object status").await?;
            return Ok(());
        };

        // Step c.
        self.set_job_chunking_status(&job.id, "in_progress").await?;

        let result = if claimed.object_type == ObjectType::Pdf {
            self.run_pdf_branch(&claimed).await
        } else {
            self.run_non_pdf_branch(&claimed).await
        };

        let object_repo = ObjectRepository::new(&self.db);
        match result {
            Ok(()) => {
                object_repo
                    .update_status(&claimed.id, ObjectStatus::Embedded, None, None)
                    .await?;
                self.set_job_completed(&job.id).await?;
                info!(object_id = %claimed.id, "chunking pipeline completed object");
                self.emit(ChunkingEvent::ObjectEmbedded { object_id: claimed.id.clone() });
            }
            Err(err) => {
                object_repo
                    .update_status(&claimed.id, ObjectStatus::EmbeddingFailed, None, Some(err.to_string()))
                    .await?;
                self.set_job_failed(&job.id, &err.to_string()).await?;
                warn!(object_id = %claimed.id, error = %err, "chunking pipeline failed object");
                self.emit(ChunkingEvent::ObjectFailed { object_id: claimed.id.clone(), error: err.to_string() });
            }
        }
        Ok(())
    }

    /// Step d: PDF objects already carry exactly one chunk (written by the
    /// PDF worker, spec.md §4.7); embed it and link it.
    async fn run_pdf_branch(&self, object: &Object) -> Result<(), AppError> {
        let chunk_repo = ChunkRepository::new(&self.db);
        let chunks = chunk_repo.list_by_object(&object.id).await?;
        let saga = ChunkingSaga::new(&self.db, &self.vector_store);
        self.embed_and_link(object, chunks, &saga).await
    }

    /// Step e: `chunk_text` -> bulk insert -> re-read -> embed -> link, as
    /// a three-step saga that compensates on partial failure.
    async fn run_non_pdf_branch(&self, object: &Object) -> Result<(), AppError> {
        let cleaned_text = object.cleaned_text.clone().unwrap_or_default();
        let raw_chunks = self.ai_gateway.chunk_text(&cleaned_text, &object.id).await?;

        let chunks: Vec<Chunk> = raw_chunks
            .into_iter()
            .map(|raw| {
                let propositions: Vec<Proposition> = raw
                    .propositions
                    .into_iter()
                    .map(|content| Proposition {
                        kind: PropositionType::Fact,
                        content,
                    })
                    .collect();
                let token_count = crate::ai_gateway::count_tokens(&raw.content).unwrap_or(0);
                Chunk::new(
                    object.id.clone(),
                    raw.chunk_idx,
                    raw.content,
                    Some(raw.summary),
                    raw.tags,
                    propositions,
                    token_count,
                )
            })
            .collect();

        let chunk_repo = ChunkRepository::new(&self.db);
        let saga = ChunkingSaga::new(&self.db, &self.vector_store);
        let inserted = chunk_repo.add_bulk(chunks).await?;
        saga.track_inserted_chunks(&inserted);

        // Re-read stored chunks per spec.md §4.9 step e.
        let reread = chunk_repo.list_by_object(&object.id).await?;
        self.embed_and_link(object, reread, &saga).await
    }

    async fn embed_and_link(
        &self,
        object: &Object,
        chunks: Vec<Chunk>,
        saga: &ChunkingSaga<'_>,
    ) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }

        if self.circuit_breaker.admit(EMBED_OPERATION) == Admission::Rejected {
            return Err(AppError::VectorStore(
                "embed circuit breaker open; refusing new embed calls".to_string(),
            ));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embed_result = self.ai_gateway.embed(&texts).await;
        self.rate_limiter.record(texts.len() as u32);

        let vectors = match embed_result {
            Ok(vectors) => {
                self.circuit_breaker.record_success(EMBED_OPERATION);
                vectors
            }
            Err(err) => {
                self.circuit_breaker.record_failure(EMBED_OPERATION);
                saga.compensate().await;
                return Err(err);
            }
        };

        let media_type = media_type_for(object.object_type);
        let mut records = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(vectors.into_iter()) {
            let mut record = VectorRecord::new(
                RecordType::Chunk,
                media_type,
                object.layer,
                ProcessingDepth::Chunk,
                vector,
                chunk.content.clone(),
                object.title.clone(),
                chunk.summary.clone().unwrap_or_default(),
                chunk.tags_json.clone(),
                chunk.propositions_json.iter().map(|p| p.content.clone()).collect(),
            );
            record.object_id = object.id.clone();
            record.sql_chunk_id = chunk.id.clone();
            record.chunk_idx = chunk.chunk_idx;
            if let Some(source_uri) = &object.source_uri {
                record.source_uri = source_uri.clone();
            }
            records.push(record);
        }

        let vector_ids = match self.vector_store.add_documents(records).await {
            Ok(ids) => ids,
            Err(err) => {
                saga.compensate().await;
                return Err(err);
            }
        };
        saga.track_inserted_vectors(&vector_ids);

        let link_repo = EmbeddingLinkRepository::new(&self.db);
        let links: Vec<EmbeddingLink> = chunks
            .iter()
            .zip(vector_ids.iter())
            .map(|(chunk, vector_id)| {
                EmbeddingLink::new(chunk.id.clone(), self.embedding_model.clone(), vector_id.to_string())
            })
            .collect();
        if let Err(err) = link_repo.add_bulk(links).await {
            saga.compensate().await;
            return Err(err);
        }

        Ok(())
    }

    async fn find_job_awaiting_chunking(&self, object_id: &str) -> Result<Option<AwaitingJob>, AppError> {
        let mut response = self
            .db
            .query(
                "SELECT id FROM ingestion_jobs \
                 WHERE related_object_id = $object_id \
                 AND chunking_status IN ['pending', 'in_progress'] \
                 LIMIT 1;",
            )
            .bind(("object_id", object_id.to_string()))
            .await?;
        let rows: Vec<AwaitingJob> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// CAS claim `parsed -> embedding` (spec.md §4.9 step b, §5).
    async fn claim_object(&self, object_id: &str) -> Result<Option<Object>, AppError> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('objects', $id) \
                 SET status = 'embedding' \
                 WHERE status = 'parsed' \
                 RETURN AFTER;",
            )
            .bind(("id", object_id.to_string()))
            .await?;
        let claimed: Vec<Object> = response.take(0)?;
        Ok(claimed.into_iter().next())
    }

    async fn set_job_chunking_status(&self, job_id: &str, status: &str) -> Result<(), AppError> {
        self.db
            .query("UPDATE type::thing('ingestion_jobs', $id) SET chunking_status = $status;")
            .bind(("id", job_id.to_string()))
            .bind(("status", status.to_string()))
            .await?;
        Ok(())
    }

    async fn set_job_completed(&self, job_id: &str) -> Result<(), AppError> {
        self.db
            .query(
                "UPDATE type::thing('ingestion_jobs', $id) \
                 SET status = 'completed', chunking_status = 'completed';",
            )
            .bind(("id", job_id.to_string()))
            .await?;
        Ok(())
    }

    async fn set_job_failed(&self, job_id: &str, message: &str) -> Result<(), AppError> {
        self.db
            .query(
                "UPDATE type::thing('ingestion_jobs', $id) \
                 SET status = 'failed', chunking_status = 'failed', chunking_error_info = $error;",
            )
            .bind(("id", job_id.to_string()))
            .bind(("error", common::storage::types::object::truncate_error_info(message)))
            .await?;
        Ok(())
    }
}

fn media_type_for(object_type: ObjectType) -> &'static str {
    match object_type {
        ObjectType::Webpage => "webpage",
        ObjectType::Pdf => "pdf",
        ObjectType::Note => "note",
        ObjectType::TabGroup => "tab_group",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatCompletionOpts, ChatMessage, Embedder, LlmClient};
    use async_trait::async_trait;
    use common::storage::types::ingestion_job::{IngestionJob, NewJobOptions};
    use uuid::Uuid;

    struct ScriptedLlm {
        response: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _messages: &[ChatMessage], _opts: ChatCompletionOpts) -> Result<String, AppError> {
            Ok(self.response.clone())
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.0_f32; 3]).collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Err(AppError::AITransport("embed down".into(), "embed".into()))
        }
    }

    async fn test_db() -> Arc<SurrealDbClient> {
        let db = SurrealDbClient::memory("chunking_pipeline_tests", &Uuid::new_v4().to_string())
            .await
            .unwrap();
        db.ensure_initialized().await.unwrap();
        Arc::new(db)
    }

    fn config() -> ChunkingPipelineConfig {
        ChunkingPipelineConfig {
            max_concurrent: 10,
            rpm_budget: 4900,
            avg_requests_per_object: 1.5,
            circuit_breaker_threshold: 5,
            circuit_breaker_window_secs: 60,
            circuit_breaker_half_open_probes: 2,
            orphan_attempt_limit: 3,
            shutdown_timeout: Duration::from_secs(30),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }

    async fn make_object_with_job(db: &Arc<SurrealDbClient>, cleaned_text: &str) -> (Object, IngestionJob) {
        let object_repo = ObjectRepository::new(db);
        let mut object = Object::new(ObjectType::Webpage, "t");
        object.cleaned_text = Some(cleaned_text.to_string());
        object.status = ObjectStatus::Parsed;
        let object = object_repo.create(object).await.unwrap();

        let mut job = IngestionJob::new(
            "url",
            "https://example.com",
            NewJobOptions {
                related_object_id: Some(object.id.clone()),
                ..Default::default()
            },
        );
        job.chunking_status = Some(common::storage::types::ingestion_job::ChunkingStatus::Pending);
        let stored: IngestionJob = db.store_item(job).await.unwrap().unwrap();
        (object, stored)
    }

    #[tokio::test]
    async fn non_pdf_branch_embeds_and_links_all_chunks() {
        let db = test_db().await;
        let vector_store = Arc::new(VectorStore::new((*db).clone(), "test"));
        vector_store.ensure_schema().await.unwrap();

        let chunks_json = serde_json::json!({
            "chunks": [
                {"chunk_idx": 0, "content": "a".repeat(25), "summary": "s1", "tags": ["t1"], "propositions": ["p1"]},
                {"chunk_idx": 1, "content": "b".repeat(25), "summary": "s2", "tags": ["t2"], "propositions": ["p2"]}
            ]
        })
        .to_string();
        let ai_gateway = Arc::new(AiGateway::new(Arc::new(ScriptedLlm { response: chunks_json }), Arc::new(StubEmbedder)));
        let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(4900, 1.5));

        let pipeline = Arc::new(ChunkingPipeline::new(db.clone(), vector_store, ai_gateway, rate_limiter, config()));

        let (object, _job) = make_object_with_job(&db, "some cleaned text body").await;

        pipeline.tick().await.unwrap();
        for _ in 0..50 {
            if pipeline.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let object_repo = ObjectRepository::new(&db);
        let stored = object_repo.get_by_id(&object.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ObjectStatus::Embedded);

        let chunk_repo = ChunkRepository::new(&db);
        let chunks = chunk_repo.list_by_object(&object.id).await.unwrap();
        assert_eq!(chunks.len(), 2);

        let link_repo = EmbeddingLinkRepository::new(&db);
        for chunk in &chunks {
            let ids = link_repo.get_vector_ids_by_chunk_ids(&[chunk.id.clone()]).await.unwrap();
            assert_eq!(ids.len(), 1);
        }
    }

    #[tokio::test]
    async fn embed_failure_compensates_and_marks_object_failed() {
        let db = test_db().await;
        let vector_store = Arc::new(VectorStore::new((*db).clone(), "test"));
        vector_store.ensure_schema().await.unwrap();

        let chunks_json = serde_json::json!({
            "chunks": [
                {"chunk_idx": 0, "content": "a".repeat(25), "summary": "s1", "tags": ["t1"], "propositions": ["p1"]}
            ]
        })
        .to_string();
        let ai_gateway = Arc::new(AiGateway::new(Arc::new(ScriptedLlm { response: chunks_json }), Arc::new(FailingEmbedder)));
        let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(4900, 1.5));

        let pipeline = Arc::new(ChunkingPipeline::new(db.clone(), vector_store, ai_gateway, rate_limiter, config()));

        let (object, _job) = make_object_with_job(&db, "some cleaned text body").await;

        pipeline.tick().await.unwrap();
        for _ in 0..50 {
            if pipeline.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let object_repo = ObjectRepository::new(&db);
        let stored = object_repo.get_by_id(&object.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ObjectStatus::EmbeddingFailed);

        // Saga compensation should have removed the speculatively inserted chunks.
        let chunk_repo = ChunkRepository::new(&db);
        let chunks = chunk_repo.list_by_object(&object.id).await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn orphaned_object_is_marked_error_after_attempt_limit() {
        let db = test_db().await;
        let vector_store = Arc::new(VectorStore::new((*db).clone(), "test"));
        vector_store.ensure_schema().await.unwrap();
        let ai_gateway = Arc::new(AiGateway::new(Arc::new(ScriptedLlm { response: String::new() }), Arc::new(StubEmbedder)));
        let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(4900, 1.5));
        let pipeline = Arc::new(ChunkingPipeline::new(db.clone(), vector_store, ai_gateway, rate_limiter, config()));

        let object_repo = ObjectRepository::new(&db);
        let mut object = Object::new(ObjectType::Webpage, "orphan");
        object.status = ObjectStatus::Parsed;
        let object = object_repo.create(object).await.unwrap();

        for _ in 0..3 {
            pipeline.process_object(object.clone()).await.unwrap();
        }

        let stored = object_repo.get_by_id(&object.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ObjectStatus::Error);
        assert_eq!(stored.error_info.as_deref(), Some("orphaned"));
    }
}
