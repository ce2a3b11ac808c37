//! Opaque provider interfaces the ingestion core consumes but does not implement.
//!
//! HTML fetching, readability extraction, PDF text extraction and the LLM/embedding
//! transport are all outside this crate's scope (see `SPEC_FULL.md` §G); workers and
//! the AI Gateway are generic over these traits so a caller can plug in real network
//! clients (or, in tests, deterministic fakes).

use async_trait::async_trait;
use common::error::AppError;
use serde::{Deserialize, Serialize};

/// Result of fetching a URL's raw HTML.
#[derive(Debug, Clone)]
pub struct FetchedHtml {
    pub html: String,
    pub final_url: String,
    pub http_status: u16,
}

#[async_trait]
pub trait HtmlFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedHtml, AppError>;
}

/// Readability-shaped extraction result from an HTML parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadabilityShape {
    pub title: String,
    pub text_content: String,
    pub content: String,
    pub byline: Option<String>,
    pub excerpt: Option<String>,
}

#[async_trait]
pub trait HtmlParser: Send + Sync {
    /// Returns `None` when the document has no meaningful article content.
    async fn parse(&self, html: &str, url: &str) -> Result<Option<ReadabilityShape>, AppError>;
}

#[derive(Debug, Clone, Default)]
pub struct PdfInfo {
    pub title: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractedPdf {
    pub text: String,
    pub num_pages: u32,
    pub info: PdfInfo,
}

#[async_trait]
pub trait PdfExtractor: Send + Sync {
    async fn extract(&self, path: &str) -> Result<ExtractedPdf, AppError>;
}

/// A single chat message handed to the LLM provider. Kept provider-agnostic
/// (no `async_openai` types) so test fakes don't need that dependency.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
}

#[derive(Debug, Clone)]
pub struct ChatCompletionOpts {
    pub temperature: f32,
    pub json_response: bool,
    pub max_tokens: Option<u32>,
}

impl Default for ChatCompletionOpts {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            json_response: true,
            max_tokens: None,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: ChatCompletionOpts,
    ) -> Result<String, AppError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
}

/// `LlmClient`/`Embedder` backed by a real `async_openai` client, used outside tests.
pub struct OpenAiProvider {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    chat_model: String,
    embedding_model: String,
    embedding_dimensions: u32,
}

impl OpenAiProvider {
    pub fn new(
        client: async_openai::Client<async_openai::config::OpenAIConfig>,
        chat_model: impl Into<String>,
        embedding_model: impl Into<String>,
        embedding_dimensions: u32,
    ) -> Self {
        Self {
            client,
            chat_model: chat_model.into(),
            embedding_model: embedding_model.into(),
            embedding_dimensions,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: ChatCompletionOpts,
    ) -> Result<String, AppError> {
        use async_openai::types::{
            ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
            CreateChatCompletionRequestArgs, ResponseFormat,
        };

        let mut request_messages = Vec::with_capacity(messages.len());
        for message in messages {
            request_messages.push(match message.role {
                ChatRole::System => {
                    ChatCompletionRequestSystemMessage::from(message.content.as_str()).into()
                }
                ChatRole::User => {
                    ChatCompletionRequestUserMessage::from(message.content.as_str()).into()
                }
            });
        }

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.chat_model).messages(request_messages);
        builder.temperature(opts.temperature);
        if opts.json_response {
            builder.response_format(ResponseFormat::JsonObject);
        }
        if let Some(max_tokens) = opts.max_tokens {
            builder.max_tokens(max_tokens);
        }
        let request = builder
            .build()
            .map_err(|e| AppError::AITransport("openai".into(), e.to_string()))?;

        let response = self.client.chat().create(request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                AppError::AITransport("openai".into(), "empty chat completion response".into())
            })
    }
}

#[async_trait]
impl Embedder for OpenAiProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        common::utils::embedding::generate_embeddings(
            &self.client,
            texts,
            &self.embedding_model,
            self.embedding_dimensions,
        )
        .await
    }
}

/// `HtmlFetcher` backed by a plain `reqwest` GET (spec.md §6: the core
/// consumes `fetch(url, opts) -> {html, final_url, http_status}`, nothing
/// about JS rendering).
pub struct ReqwestHtmlFetcher {
    client: reqwest::Client,
}

impl ReqwestHtmlFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHtmlFetcher {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl HtmlFetcher for ReqwestHtmlFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedHtml, AppError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::extraction_transient(format!("fetching {url}: {e}")))?;
        let final_url = response.url().to_string();
        let http_status = response.status().as_u16();
        let html = response
            .text()
            .await
            .map_err(|e| AppError::extraction_transient(format!("reading body of {url}: {e}")))?;
        Ok(FetchedHtml {
            html,
            final_url,
            http_status,
        })
    }
}

/// `HtmlParser` backed by `dom_smoothie`'s Readability port.
pub struct DomSmoothieHtmlParser;

#[async_trait]
impl HtmlParser for DomSmoothieHtmlParser {
    /// Runs on `spawn_blocking` (same reasoning as `LopdfPdfExtractor::
    /// extract`): `Readability::parse` is synchronous DOM-walking work with
    /// no `.await` point of its own, so running it inline would stall the
    /// executor thread and defeat the `tokio::time::timeout` the URL Worker
    /// wraps around this call (spec.md §4.6 step 2, §5: "via an isolated
    /// worker task").
    async fn parse(&self, html: &str, url: &str) -> Result<Option<ReadabilityShape>, AppError> {
        let html = html.to_string();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || parse_blocking(&html, &url))
            .await
            .map_err(|e| AppError::extraction_permanent(format!("HTML parse task panicked: {e}")))?
    }
}

fn parse_blocking(html: &str, url: &str) -> Result<Option<ReadabilityShape>, AppError> {
    let base_url = url::Url::parse(url).ok();
    let mut readability = dom_smoothie::Readability::new(html, base_url.as_ref(), None)
        .map_err(|e| AppError::extraction_permanent(format!("readability init for {url}: {e}")))?;
    let article = readability
        .parse()
        .map_err(|e| AppError::extraction_permanent(format!("readability parse for {url}: {e}")))?;

    if article.text_content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(ReadabilityShape {
        title: article.title,
        text_content: article.text_content.to_string(),
        content: article.content,
        byline: article.byline,
        excerpt: article.excerpt,
    }))
}

/// `PdfExtractor` backed by `pdf-extract` for text and `lopdf` for
/// document info, matching the teacher's own PDF stack.
pub struct LopdfPdfExtractor;

#[async_trait]
impl PdfExtractor for LopdfPdfExtractor {
    async fn extract(&self, path: &str) -> Result<ExtractedPdf, AppError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || extract_pdf_blocking(&path))
            .await
            .map_err(|e| AppError::extraction_permanent(format!("pdf extraction task panicked: {e}")))?
    }
}

fn extract_pdf_blocking(path: &str) -> Result<ExtractedPdf, AppError> {
    let text = pdf_extract::extract_text(path)
        .map_err(|e| AppError::extraction_permanent(format!("extracting text from {path}: {e}")))?;

    let document = lopdf::Document::load(path)
        .map_err(|e| AppError::extraction_permanent(format!("loading {path} for metadata: {e}")))?;
    let num_pages = document.get_pages().len() as u32;
    let info = document
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| obj.as_reference().ok())
        .and_then(|r| document.get_object(r).ok())
        .and_then(|obj| obj.as_dict().ok())
        .map(|dict| PdfInfo {
            title: dict
                .get(b"Title")
                .ok()
                .and_then(|v| v.as_str().ok())
                .map(|s| String::from_utf8_lossy(s).into_owned()),
            author: dict
                .get(b"Author")
                .ok()
                .and_then(|v| v.as_str().ok())
                .map(|s| String::from_utf8_lossy(s).into_owned()),
        })
        .unwrap_or_default();

    Ok(ExtractedPdf {
        text,
        num_pages,
        info,
    })
}
