//! LLM/embedding boundary (spec.md §4.8).
//!
//! Two structured-output operations (`chunk_text`, `generate_object_summary`) and one
//! batched embedding call. Both structured calls use the same retry shape: one attempt,
//! and on parse/schema failure a single re-invocation with a system prompt telling the
//! model its previous response was invalid JSON. Every call carries a correlation id so
//! failures can be traced back to the object/job that triggered them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{instrument, warn};

use common::error::AppError;

use crate::providers::{ChatCompletionOpts, ChatMessage, ChatRole, Embedder, LlmClient};

const CHUNK_TEXT_SYSTEM_PROMPT: &str = r#"You split the given document into coherent chunks.
Respond with a JSON object: {"chunks": [{"chunk_idx": <int>, "content": <string, at least 20 characters>, "summary": <string, at most 25 words>, "tags": [<3 to 7 kebab-case strings>], "propositions": [<1 to 4 atomic statements>]}]}.
Return JSON only, no commentary."#;

const SUMMARY_SYSTEM_PROMPT: &str = r#"You produce a structured summary of the given document.
Respond with a JSON object: {"title": <non-empty string>, "summary": <non-empty string>, "tags": [<at least 1 string>], "propositions": [{"type": "main"|"supporting"|"fact"|"action", "content": <string>}] with at least 2 entries}.
Return JSON only, no commentary."#;

const COMPOSITE_SUMMARY_SYSTEM_PROMPT: &str = r#"You produce a structured roll-up summary for a group of related documents, given each child's id, title, and current summary/tags/propositions.
Respond with a JSON object of the same shape as a single-document summary: {"title": <non-empty string>, "summary": <non-empty string>, "tags": [<at least 1 string>], "propositions": [{"type": "main"|"supporting"|"fact"|"action", "content": <string>}] with at least 2 entries}.
Some children may have empty or missing fields; tolerate that.
Return JSON only, no commentary."#;

const JSON_REPAIR_SYSTEM_PROMPT: &str =
    "Your previous response was not valid JSON matching the requested schema. Respond again with only the corrected JSON object, no commentary.";

const MAX_SUMMARY_INPUT_CHARS: usize = 50_000;
const MAX_CHUNK_TOKENS: usize = 8_000;

#[derive(Debug, Clone, Deserialize)]
pub struct RawChunk {
    pub chunk_idx: i64,
    pub content: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub propositions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkTextResponse {
    chunks: Vec<RawChunk>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PropositionType {
    Main,
    Supporting,
    Fact,
    Action,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryProposition {
    #[serde(rename = "type")]
    pub kind: PropositionType,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectSummary {
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub propositions: Vec<SummaryProposition>,
}

/// A child object's current TSTP as fed into the composite-summary prompt
/// (spec.md §4.10 step 2). Missing fields become empty arrays / nulls.
#[derive(Debug, Clone, Serialize)]
pub struct ChildBrief {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub propositions: Vec<String>,
}

pub struct AiGateway {
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn Embedder>,
}

impl AiGateway {
    pub fn new(llm: Arc<dyn LlmClient>, embedder: Arc<dyn Embedder>) -> Self {
        Self { llm, embedder }
    }

    #[instrument(skip_all, fields(%correlation_id, text_len = text.len()))]
    pub async fn chunk_text(
        &self,
        text: &str,
        correlation_id: &str,
    ) -> Result<Vec<RawChunk>, AppError> {
        let user_message = format!("Document:\n{text}");
        let parsed = self
            .complete_with_repair(CHUNK_TEXT_SYSTEM_PROMPT, &user_message, correlation_id, |raw| {
                let response: ChunkTextResponse = serde_json::from_str(raw).map_err(|e| {
                    extraction_error(
                        correlation_id,
                        format!("chunk_text response failed schema validation: {e}"),
                    )
                })?;
                for chunk in &response.chunks {
                    validate_chunk_shape(chunk, correlation_id)?;
                }
                Ok(response.chunks)
            })
            .await?;

        filter_and_reindex_oversize(parsed)
    }

    #[instrument(skip_all, fields(%correlation_id, %title))]
    pub async fn generate_object_summary(
        &self,
        text: &str,
        title: &str,
        correlation_id: &str,
    ) -> Result<ObjectSummary, AppError> {
        let truncated = truncate_chars(text, MAX_SUMMARY_INPUT_CHARS);
        let user_message = format!("Title:\n{title}\nDocument:\n{truncated}");

        self.complete_with_repair(SUMMARY_SYSTEM_PROMPT, &user_message, correlation_id, |raw| {
            parse_and_validate_summary(raw, correlation_id, "generate_object_summary")
        })
        .await
    }

    /// Composite TSTP for a `tab_group` parent (spec.md §4.10 step 3): same
    /// schema and retry policy as [`Self::generate_object_summary`], but the
    /// prompt is built from the children's current TSTP rather than raw text.
    #[instrument(skip_all, fields(%correlation_id, %parent_title, children = children.len()))]
    pub async fn generate_composite_summary(
        &self,
        children: &[ChildBrief],
        parent_title: &str,
        correlation_id: &str,
    ) -> Result<ObjectSummary, AppError> {
        let children_json = serde_json::to_string(children).unwrap_or_default();
        let user_message = format!("Parent title:\n{parent_title}\nChildren:\n{children_json}");

        self.complete_with_repair(COMPOSITE_SUMMARY_SYSTEM_PROMPT, &user_message, correlation_id, |raw| {
            parse_and_validate_summary(raw, correlation_id, "generate_composite_summary")
        })
        .await
    }

    #[instrument(skip_all, fields(count = texts.len()))]
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        self.embedder.embed(texts).await
    }

    /// One attempt, then (on parse failure OR schema/shape validation
    /// failure) one re-invocation with a JSON-repair system prompt — the
    /// retry covers both failure modes spec.md §4.8/§7 classify as
    /// `AIValidation`, not just malformed JSON.
    async fn complete_with_repair<T>(
        &self,
        system_prompt: &str,
        user_message: &str,
        correlation_id: &str,
        parse_and_validate: impl Fn(&str) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let messages = vec![
            ChatMessage {
                role: ChatRole::System,
                content: system_prompt.to_string(),
            },
            ChatMessage {
                role: ChatRole::User,
                content: user_message.to_string(),
            },
        ];

        let first_attempt: Result<T, AppError> = async {
            let raw = self.llm.complete(&messages, ChatCompletionOpts::default()).await?;
            parse_and_validate(&raw)
        }
        .await;

        match first_attempt {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(
                    %correlation_id,
                    error = %err,
                    "AI Gateway response failed validation; retrying with repair prompt"
                );
                let repair_messages = vec![
                    ChatMessage {
                        role: ChatRole::System,
                        content: system_prompt.to_string(),
                    },
                    ChatMessage {
                        role: ChatRole::User,
                        content: user_message.to_string(),
                    },
                    ChatMessage {
                        role: ChatRole::System,
                        content: JSON_REPAIR_SYSTEM_PROMPT.to_string(),
                    },
                ];
                let raw = self
                    .llm
                    .complete(&repair_messages, ChatCompletionOpts::default())
                    .await?;
                parse_and_validate(&raw)
            }
        }
    }
}

fn parse_and_validate_summary(raw: &str, correlation_id: &str, op_name: &str) -> Result<ObjectSummary, AppError> {
    let summary: ObjectSummary = serde_json::from_str(raw)
        .map_err(|e| extraction_error(correlation_id, format!("{op_name} response failed schema validation: {e}")))?;
    validate_summary_shape(&summary, correlation_id)?;
    Ok(summary)
}

fn extraction_error(correlation_id: &str, message: String) -> AppError {
    AppError::AIValidation(message, correlation_id.to_string())
}

fn validate_chunk_shape(chunk: &RawChunk, correlation_id: &str) -> Result<(), AppError> {
    if chunk.content.chars().count() < 20 {
        return Err(extraction_error(
            correlation_id,
            format!("chunk {} content shorter than 20 characters", chunk.chunk_idx),
        ));
    }
    if chunk.summary.split_whitespace().count() > 25 {
        return Err(extraction_error(
            correlation_id,
            format!("chunk {} summary exceeds 25 words", chunk.chunk_idx),
        ));
    }
    if !(3..=7).contains(&chunk.tags.len()) {
        return Err(extraction_error(
            correlation_id,
            format!("chunk {} must have 3-7 tags", chunk.chunk_idx),
        ));
    }
    if !(1..=4).contains(&chunk.propositions.len()) {
        return Err(extraction_error(
            correlation_id,
            format!("chunk {} must have 1-4 propositions", chunk.chunk_idx),
        ));
    }
    Ok(())
}

fn validate_summary_shape(summary: &ObjectSummary, correlation_id: &str) -> Result<(), AppError> {
    if summary.title.trim().is_empty() {
        return Err(extraction_error(correlation_id, "title must be non-empty".into()));
    }
    if summary.summary.trim().is_empty() {
        return Err(extraction_error(
            correlation_id,
            "summary must be non-empty".into(),
        ));
    }
    if summary.tags.is_empty() {
        return Err(extraction_error(
            correlation_id,
            "tags must contain at least 1 entry".into(),
        ));
    }
    if summary.propositions.len() < 2 {
        return Err(extraction_error(
            correlation_id,
            "propositions must contain at least 2 entries".into(),
        ));
    }
    Ok(())
}

/// Drops chunks whose token count exceeds `MAX_CHUNK_TOKENS`, then densely
/// re-indexes the survivors' `chunk_idx` starting at 0 (spec.md §4.8, §8 scenario D).
fn filter_and_reindex_oversize(chunks: Vec<RawChunk>) -> Result<Vec<RawChunk>, AppError> {
    let tokenizer = chunk_tokenizer()?;

    let mut kept: Vec<RawChunk> = Vec::with_capacity(chunks.len());
    for mut chunk in chunks {
        let token_count = tokenizer
            .encode(chunk.content.as_str(), false)
            .map(|enc| enc.len())
            .unwrap_or(0);
        if token_count > MAX_CHUNK_TOKENS {
            continue;
        }
        chunk.chunk_idx = kept.len() as i64;
        kept.push(chunk);
    }
    Ok(kept)
}

/// Token count for arbitrary text using the same tokenizer the oversize
/// chunk filter uses (spec.md §4.7 step 4, §4.8).
pub fn count_tokens(text: &str) -> Result<i64, AppError> {
    let tokenizer = chunk_tokenizer()?;
    Ok(tokenizer.encode(text, false).map(|enc| enc.len()).unwrap_or(0) as i64)
}

fn chunk_tokenizer() -> Result<&'static Tokenizer, AppError> {
    use std::sync::OnceLock;
    static TOKENIZER: OnceLock<Result<Tokenizer, String>> = OnceLock::new();

    match TOKENIZER.get_or_init(|| {
        Tokenizer::from_pretrained("bert-base-cased", None)
            .map_err(|e| format!("failed to initialize tokenizer: {e}"))
    }) {
        Ok(tokenizer) => Ok(tokenizer),
        Err(err) => Err(AppError::InternalError(err.clone())),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _opts: ChatCompletionOpts,
        ) -> Result<String, AppError> {
            let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
            if responses.is_empty() {
                return Err(AppError::AITransport("test".into(), "exhausted".into()));
            }
            Ok(responses.remove(0))
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
    async fn chunk_text_retries_once_on_invalid_json_then_succeeds() {
        let valid = serde_json::json!({
            "chunks": [{
                "chunk_idx": 0,
                "content": "this is a long enough chunk of content",
                "summary": "short summary",
                "tags": ["a", "b", "c"],
                "propositions": ["p1"]
            }]
        })
        .to_string();

        let llm = ScriptedLlm {
            responses: Mutex::new(vec!["not json at all".to_string(), valid]),
        };
        let gateway = AiGateway::new(Arc::new(llm), Arc::new(StubEmbedder));

        let chunks = gateway.chunk_text("some text", "corr-1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_idx, 0);
    }

    #[tokio::test]
    async fn chunk_text_retries_once_on_schema_violation_then_succeeds() {
        let too_few_tags = serde_json::json!({
            "chunks": [{
                "chunk_idx": 0,
                "content": "this is a long enough chunk of content",
                "summary": "short summary",
                "tags": ["only-one"],
                "propositions": ["p1"]
            }]
        })
        .to_string();
        let valid = serde_json::json!({
            "chunks": [{
                "chunk_idx": 0,
                "content": "this is a long enough chunk of content",
                "summary": "short summary",
                "tags": ["a", "b", "c"],
                "propositions": ["p1"]
            }]
        })
        .to_string();

        let llm = ScriptedLlm {
            responses: Mutex::new(vec![too_few_tags, valid]),
        };
        let gateway = AiGateway::new(Arc::new(llm), Arc::new(StubEmbedder));

        let chunks = gateway.chunk_text("some text", "corr-3").await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn generate_object_summary_rejects_empty_title() {
        let invalid = serde_json::json!({
            "title": "",
            "summary": "s",
            "tags": ["t"],
            "propositions": [
                {"type": "main", "content": "a"},
                {"type": "fact", "content": "b"}
            ]
        })
        .to_string();

        let llm = ScriptedLlm {
            responses: Mutex::new(vec![invalid.clone(), invalid]),
        };
        let gateway = AiGateway::new(Arc::new(llm), Arc::new(StubEmbedder));

        let result = gateway
            .generate_object_summary("text", "title", "corr-2")
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn filter_and_reindex_drops_oversize_and_reindexes_densely() {
        let small = "word ".repeat(50);
        let huge = "word ".repeat(9_000);
        let chunks = vec![
            RawChunk {
                chunk_idx: 0,
                content: small.clone(),
                summary: "s".into(),
                tags: vec!["a".into(), "b".into(), "c".into()],
                propositions: vec!["p".into()],
            },
            RawChunk {
                chunk_idx: 1,
                content: huge,
                summary: "s".into(),
                tags: vec!["a".into(), "b".into(), "c".into()],
                propositions: vec!["p".into()],
            },
            RawChunk {
                chunk_idx: 2,
                content: small,
                summary: "s".into(),
                tags: vec!["a".into(), "b".into(), "c".into()],
                propositions: vec!["p".into()],
            },
        ];

        let kept = filter_and_reindex_oversize(chunks).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].chunk_idx, 0);
        assert_eq!(kept[1].chunk_idx, 1);
    }
}
