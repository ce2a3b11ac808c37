//! `job_type = "pdf"` processor (spec.md §4.7).
//!
//! Unlike the URL worker, an AI summary failure here is fatal (no fallback),
//! and exactly one chunk is created up-front whose content is the AI
//! summary, not the raw extracted text.

use std::sync::Arc;

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        repositories::{chunk_repository::ChunkRepository, object_repository::ObjectRepository},
        types::{
            chunk::Chunk,
            ingestion_job::IngestionJob,
            object::{Object, ObjectStatus, ObjectType, Proposition, PropositionType},
        },
    },
    utils::hash::sha256_hex,
};
use tracing::instrument;

use crate::{
    ai_gateway::AiGateway,
    providers::PdfExtractor,
    queue::{JobProcessor, ProcessorOutcome},
};

/// `job_specific_data` fields expected on a PDF job (set by whatever layer
/// accepts the upload — outside this crate's scope).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PdfJobData {
    pub internal_file_path: String,
    pub original_file_name: String,
    pub file_size_bytes: i64,
    pub file_mime_type: String,
    pub file_bytes_for_hash: Vec<u8>,
}

pub struct PdfWorker {
    db: Arc<SurrealDbClient>,
    extractor: Arc<dyn PdfExtractor>,
    ai_gateway: Arc<AiGateway>,
}

impl PdfWorker {
    pub fn new(db: Arc<SurrealDbClient>, extractor: Arc<dyn PdfExtractor>, ai_gateway: Arc<AiGateway>) -> Self {
        Self {
            db,
            extractor,
            ai_gateway,
        }
    }
}

#[async_trait::async_trait]
impl JobProcessor for PdfWorker {
    #[instrument(skip_all, fields(job_id = %job.id, path = %job.source_identifier))]
    async fn process(&self, job: &IngestionJob) -> Result<ProcessorOutcome, AppError> {
        let path = job.source_identifier.clone();
        let job_data: PdfJobData = job
            .job_specific_data
            .clone()
            .ok_or_else(|| AppError::Validation("pdf job missing job_specific_data".into()))
            .and_then(|v| serde_json::from_value(v).map_err(AppError::from))?;

        // Step 1: extract.
        let extracted = self.extractor.extract(&path).await?;

        // Step 2: empty text is a permanent failure.
        if extracted.text.trim().is_empty() {
            return Err(AppError::extraction_permanent(
                "TEXT_EXTRACTION_FAILED: extracted PDF text is empty",
            ));
        }

        // Step 3: AI summary — no fallback on failure.
        let correlation_id = job.id.clone();
        let title = extracted
            .info
            .title
            .clone()
            .unwrap_or_else(|| job_data.original_file_name.clone());
        let tstp = self
            .ai_gateway
            .generate_object_summary(&extracted.text, &title, &correlation_id)
            .await
            .map_err(|e| {
                AppError::AIValidation(
                    format!("AI_PROCESSING_FAILED: {e}"),
                    correlation_id.clone(),
                )
            })?;

        let propositions: Vec<Proposition> = tstp
            .propositions
            .into_iter()
            .map(|p| Proposition {
                kind: map_proposition_type(p.kind),
                content: p.content,
            })
            .collect();

        // Step 4: create the object and its single chunk.
        let file_hash = sha256_hex(&job_data.file_bytes_for_hash);
        let now = Utc::now();

        let mut object = Object::new(ObjectType::Pdf, tstp.title);
        object.summary = Some(tstp.summary.clone());
        object.tags_json = tstp.tags;
        object.propositions_json = propositions;
        object.file_hash = Some(file_hash);
        object.original_file_name = Some(job_data.original_file_name);
        object.file_size_bytes = Some(job_data.file_size_bytes);
        object.file_mime_type = Some(job_data.file_mime_type);
        object.internal_file_path = Some(job_data.internal_file_path);
        object.status = ObjectStatus::Parsed;
        object.parsed_at = Some(now);

        let object_repo = ObjectRepository::new(&self.db);
        let created = object_repo.create(object).await?;

        let token_count = crate::ai_gateway::count_tokens(&tstp.summary)?;
        let chunk = Chunk::new(
            created.id.clone(),
            0,
            tstp.summary,
            None,
            Vec::new(),
            Vec::new(),
            token_count,
        );
        let chunk_repo = ChunkRepository::new(&self.db);
        chunk_repo.add_bulk(vec![chunk]).await?;

        Ok(ProcessorOutcome::HandOffToChunking {
            related_object_id: created.id,
        })
    }
}

fn map_proposition_type(kind: crate::ai_gateway::PropositionType) -> PropositionType {
    match kind {
        crate::ai_gateway::PropositionType::Main => PropositionType::Main,
        crate::ai_gateway::PropositionType::Supporting => PropositionType::Supporting,
        crate::ai_gateway::PropositionType::Fact => PropositionType::Fact,
        crate::ai_gateway::PropositionType::Action => PropositionType::Action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatCompletionOpts, ChatMessage, Embedder, ExtractedPdf, LlmClient, PdfInfo};
    use async_trait::async_trait;

    struct FakeExtractor {
        text: String,
    }

    #[async_trait]
    impl PdfExtractor for FakeExtractor {
        async fn extract(&self, _path: &str) -> Result<ExtractedPdf, AppError> {
            Ok(ExtractedPdf {
                text: self.text.clone(),
                num_pages: 3,
                info: PdfInfo {
                    title: Some("Doc".into()),
                    author: None,
                },
            })
        }
    }

    struct ScriptedLlm {
        response: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _opts: ChatCompletionOpts,
        ) -> Result<String, AppError> {
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

    fn job_with_data() -> IngestionJob {
        IngestionJob::new(
            "pdf",
            "/tmp/doc.pdf",
            common::storage::types::ingestion_job::NewJobOptions {
                job_specific_data: Some(serde_json::json!({
                    "internal_file_path": "/tmp/doc.pdf",
                    "original_file_name": "doc.pdf",
                    "file_size_bytes": 1234,
                    "file_mime_type": "application/pdf",
                    "file_bytes_for_hash": [1, 2, 3]
                })),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn empty_extracted_text_fails_permanently() {
        let db = Arc::new(
            SurrealDbClient::memory("pdf_worker_tests", &uuid::Uuid::new_v4().to_string())
                .await
                .unwrap(),
        );
        let ai_gateway = Arc::new(AiGateway::new(
            Arc::new(ScriptedLlm { response: String::new() }),
            Arc::new(StubEmbedder),
        ));
        let worker = PdfWorker::new(db, Arc::new(FakeExtractor { text: String::new() }), ai_gateway);

        let err = worker.process(&job_with_data()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn successful_extraction_creates_one_summary_chunk() {
        let db = Arc::new(
            SurrealDbClient::memory("pdf_worker_tests", &uuid::Uuid::new_v4().to_string())
                .await
                .unwrap(),
        );
        db.ensure_initialized().await.unwrap();

        let valid = serde_json::json!({
            "title": "Doc",
            "summary": "a pdf summary",
            "tags": ["t"],
            "propositions": [
                {"type": "main", "content": "a"},
                {"type": "fact", "content": "b"}
            ]
        })
        .to_string();

        let ai_gateway = Arc::new(AiGateway::new(
            Arc::new(ScriptedLlm { response: valid }),
            Arc::new(StubEmbedder),
        ));
        let worker = PdfWorker::new(
            db.clone(),
            Arc::new(FakeExtractor {
                text: "extracted pdf body text".into(),
            }),
            ai_gateway,
        );

        let outcome = worker.process(&job_with_data()).await.unwrap();
        let object_id = match outcome {
            ProcessorOutcome::HandOffToChunking { related_object_id } => related_object_id,
            ProcessorOutcome::Completed => panic!("expected hand-off to chunking"),
        };

        let chunk_repo = ChunkRepository::new(&db);
        let chunks = chunk_repo.list_by_object(&object_id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "a pdf summary");
    }
}
