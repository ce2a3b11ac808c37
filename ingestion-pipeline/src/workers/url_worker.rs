//! `job_type = "url"` processor (spec.md §4.6).

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        repositories::object_repository::{ObjectPatch, ObjectRepository},
        types::{
            ingestion_job::IngestionJob,
            object::{Object, ObjectStatus, ObjectType, Proposition, PropositionType},
        },
    },
};
use tracing::{instrument, warn};

use crate::{
    ai_gateway::AiGateway,
    providers::{HtmlFetcher, HtmlParser},
    queue::{JobProcessor, ProcessorOutcome},
};

pub struct UrlWorker {
    db: Arc<SurrealDbClient>,
    fetcher: Arc<dyn HtmlFetcher>,
    parser: Arc<dyn HtmlParser>,
    ai_gateway: Arc<AiGateway>,
    html_parse_timeout: Duration,
}

impl UrlWorker {
    pub fn new(
        db: Arc<SurrealDbClient>,
        fetcher: Arc<dyn HtmlFetcher>,
        parser: Arc<dyn HtmlParser>,
        ai_gateway: Arc<AiGateway>,
        html_parse_timeout: Duration,
    ) -> Self {
        Self {
            db,
            fetcher,
            parser,
            ai_gateway,
            html_parse_timeout,
        }
    }
}

#[async_trait::async_trait]
impl JobProcessor for UrlWorker {
    #[instrument(skip_all, fields(job_id = %job.id, url = %job.source_identifier))]
    async fn process(&self, job: &IngestionJob) -> Result<ProcessorOutcome, AppError> {
        let url = job.source_identifier.clone();

        // Step 1: fetch. Transient (network/5xx) vs permanent (4xx) per spec.md §4.6.
        let fetched = self.fetcher.fetch(&url).await?;
        if fetched.http_status >= 500 {
            return Err(AppError::extraction_transient(format!(
                "fetch returned {} for {url}",
                fetched.http_status
            )));
        }
        if fetched.http_status >= 400 {
            return Err(AppError::extraction_permanent(format!(
                "fetch returned {} for {url}",
                fetched.http_status
            )));
        }

        // Step 2: parse, in an isolated task with a hard timeout.
        let parser = self.parser.clone();
        let html = fetched.html.clone();
        let final_url = fetched.final_url.clone();
        let parse_result = tokio::time::timeout(self.html_parse_timeout, async move {
            parser.parse(&html, &final_url).await
        })
        .await;

        let parsed = match parse_result {
            Ok(Ok(Some(shape))) => shape,
            Ok(Ok(None)) => {
                return Err(AppError::extraction_permanent(format!(
                    "parser returned no article content for {url}"
                )))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(AppError::extraction_permanent(format!(
                    "HTML parse timed out after {:?} for {url}",
                    self.html_parse_timeout
                )))
            }
        };

        // Step 3: AI summary, with deterministic fallback on failure.
        let correlation_id = job.id.clone();
        let (title, summary, tags, propositions) = match self
            .ai_gateway
            .generate_object_summary(&parsed.text_content, &parsed.title, &correlation_id)
            .await
        {
            Ok(tstp) => (
                tstp.title,
                tstp.summary,
                tstp.tags,
                tstp.propositions
                    .into_iter()
                    .map(|p| Proposition {
                        kind: map_proposition_type(p.kind),
                        content: p.content,
                    })
                    .collect(),
            ),
            Err(err) => {
                warn!(%correlation_id, error = %err, "AI summary failed; falling back to deterministic TSTP");
                (
                    parsed.title.clone(),
                    format!("Summary of: {}", parsed.title),
                    Vec::new(),
                    Vec::new(),
                )
            }
        };

        let repo = ObjectRepository::new(&self.db);
        let now = Utc::now();

        let object_id = if let Some(related_object_id) = &job.related_object_id {
            repo.update(
                related_object_id,
                ObjectPatch {
                    title: Some(title),
                    cleaned_text: Some(parsed.text_content.clone()),
                    parsed_content_json: Some(serde_json::to_value(&parsed).unwrap_or_default()),
                    summary: Some(summary),
                    tags_json: Some(tags),
                    propositions_json: Some(propositions),
                    ..Default::default()
                },
            )
            .await?;
            repo.update_status(related_object_id, ObjectStatus::Parsed, Some(now), None)
                .await?;
            related_object_id.clone()
        } else {
            let mut object = Object::new(ObjectType::Webpage, title);
            object.source_uri = Some(fetched.final_url.clone());
            object.cleaned_text = Some(parsed.text_content.clone());
            object.parsed_content_json = Some(serde_json::to_value(&parsed).unwrap_or_default());
            object.summary = Some(summary);
            object.tags_json = tags;
            object.propositions_json = propositions;
            object.status = ObjectStatus::Parsed;
            object.parsed_at = Some(now);

            let created = repo.create(object).await?;
            created.id
        };

        Ok(ProcessorOutcome::HandOffToChunking {
            related_object_id: object_id,
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
    use crate::providers::{ChatCompletionOpts, ChatMessage, Embedder, FetchedHtml, LlmClient, ReadabilityShape};
    use async_trait::async_trait;

    struct FakeFetcher {
        html: String,
        final_url: String,
        status: u16,
    }

    #[async_trait]
    impl HtmlFetcher for FakeFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedHtml, AppError> {
            Ok(FetchedHtml {
                html: self.html.clone(),
                final_url: self.final_url.clone(),
                http_status: self.status,
            })
        }
    }

    struct FakeParser;

    #[async_trait]
    impl HtmlParser for FakeParser {
        async fn parse(&self, _html: &str, _url: &str) -> Result<Option<ReadabilityShape>, AppError> {
            Ok(Some(ReadabilityShape {
                title: "A".into(),
                text_content: "A\n\nx".into(),
                content: "<h1>A</h1><p>x</p>".into(),
                byline: None,
                excerpt: Some("x".into()),
            }))
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _opts: ChatCompletionOpts,
        ) -> Result<String, AppError> {
            Err(AppError::AITransport("test".into(), "down".into()))
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.0_f32; 3]).collect())
        }
    }

    #[tokio::test]
    async fn ai_summary_failure_falls_back_to_deterministic_tstp() {
        let db = Arc::new(
            SurrealDbClient::memory("url_worker_tests", &uuid::Uuid::new_v4().to_string())
                .await
                .unwrap(),
        );
        db.ensure_initialized().await.unwrap();

        let ai_gateway = Arc::new(AiGateway::new(Arc::new(FailingLlm), Arc::new(StubEmbedder)));
        let worker = UrlWorker::new(
            db.clone(),
            Arc::new(FakeFetcher {
                html: "<h1>A</h1><p>x</p>".into(),
                final_url: "https://example.com/a".into(),
                status: 200,
            }),
            Arc::new(FakeParser),
            ai_gateway,
            Duration::from_secs(30),
        );

        let job = IngestionJob::new(
            "url",
            "https://example.com/a",
            common::storage::types::ingestion_job::NewJobOptions::default(),
        );

        let outcome = worker.process(&job).await.unwrap();
        let object_id = match outcome {
            ProcessorOutcome::HandOffToChunking { related_object_id } => related_object_id,
            ProcessorOutcome::Completed => panic!("expected hand-off to chunking"),
        };

        let repo = ObjectRepository::new(&db);
        let stored = repo.get_by_id(&object_id).await.unwrap().unwrap();
        assert_eq!(stored.title, "A");
        assert_eq!(stored.summary.as_deref(), Some("Summary of: A"));
        assert!(stored.tags_json.is_empty());
        assert_eq!(stored.status, ObjectStatus::Parsed);
    }

    #[tokio::test]
    async fn server_error_status_is_retryable() {
        let db = Arc::new(
            SurrealDbClient::memory("url_worker_tests", &uuid::Uuid::new_v4().to_string())
                .await
                .unwrap(),
        );
        let ai_gateway = Arc::new(AiGateway::new(Arc::new(FailingLlm), Arc::new(StubEmbedder)));
        let worker = UrlWorker::new(
            db,
            Arc::new(FakeFetcher {
                html: String::new(),
                final_url: "https://example.com/a".into(),
                status: 503,
            }),
            Arc::new(FakeParser),
            ai_gateway,
            Duration::from_secs(30),
        );

        let job = IngestionJob::new(
            "url",
            "https://example.com/a",
            common::storage::types::ingestion_job::NewJobOptions::default(),
        );

        let err = worker.process(&job).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
