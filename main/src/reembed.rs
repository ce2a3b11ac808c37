//! Backfill utility (spec.md §6): embeds every chunk with no
//! `embedding_links` row, for example after an embedding model change or a
//! partial outage left chunks stranded without a vector. Exits 0 on
//! success, 1 on any error, in the same style as the teacher's one-shot
//! maintenance binaries.

use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        repositories::{
            chunk_repository::ChunkRepository, embedding_link_repository::EmbeddingLinkRepository,
            object_repository::ObjectRepository,
        },
        types::{chunk::Chunk, embedding_link::EmbeddingLink, object::ObjectType},
        vector_store::{ProcessingDepth, RecordType, VectorRecord, VectorStore},
    },
    utils::config::get_config,
};
use ingestion_pipeline::{ai_gateway::AiGateway, providers::OpenAiProvider};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Chunks are embedded in batches of this size per request to the embedding
/// model, mirroring the Chunking Pipeline's one-call-per-object batching.
const BATCH_SIZE: usize = 50;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "reembed failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let vector_store = Arc::new(VectorStore::new((*db).clone(), "ingest"));
    vector_store.ensure_schema().await?;

    let openai_client = async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    );
    let openai_provider = Arc::new(OpenAiProvider::new(
        openai_client,
        "gpt-4o-mini",
        &config.embedding_model,
        config.embedding_dimensions,
    ));
    let ai_gateway = AiGateway::new(openai_provider.clone(), openai_provider);

    let embedded = embed_all_unembedded_chunks(&db, &vector_store, &ai_gateway, &config.embedding_model).await?;
    tracing::info!(embedded, "reembed complete");
    Ok(())
}

/// Lists every chunk with no `embedding_links` row, embeds it, and writes
/// the Vector Store record plus the link back (spec.md §4.4, §6). Returns
/// the number of chunks embedded.
async fn embed_all_unembedded_chunks(
    db: &Arc<SurrealDbClient>,
    vector_store: &Arc<VectorStore>,
    ai_gateway: &AiGateway,
    embedding_model: &str,
) -> Result<usize, AppError> {
    let chunk_repo = ChunkRepository::new(db);
    let object_repo = ObjectRepository::new(db);
    let link_repo = EmbeddingLinkRepository::new(db);

    let mut total = 0usize;
    loop {
        let chunks = chunk_repo.list_unembedded(BATCH_SIZE).await?;
        if chunks.is_empty() {
            return Ok(total);
        }

        let batch_len = chunks.len();
        embed_batch(&object_repo, &link_repo, vector_store, ai_gateway, embedding_model, chunks).await?;
        total += batch_len;
    }
}

async fn embed_batch(
    object_repo: &ObjectRepository<'_>,
    link_repo: &EmbeddingLinkRepository<'_>,
    vector_store: &Arc<VectorStore>,
    ai_gateway: &AiGateway,
    embedding_model: &str,
    chunks: Vec<Chunk>,
) -> Result<(), AppError> {
    let mut resolved = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match object_repo.get_by_id(&chunk.object_id).await? {
            Some(object) => resolved.push((chunk, object)),
            None => {
                tracing::warn!(chunk_id = %chunk.id, object_id = %chunk.object_id, "skipping chunk with missing parent object");
            }
        }
    }
    if resolved.is_empty() {
        return Ok(());
    }

    let texts: Vec<String> = resolved.iter().map(|(chunk, _)| chunk.content.clone()).collect();
    let vectors = ai_gateway.embed(&texts).await?;

    let mut records = Vec::with_capacity(resolved.len());
    for ((chunk, object), vector) in resolved.iter().zip(vectors.into_iter()) {
        let mut record = VectorRecord::new(
            RecordType::Chunk,
            media_type_for(object.object_type),
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

    let vector_ids = vector_store.add_documents(records).await?;
    let links: Vec<EmbeddingLink> = resolved
        .iter()
        .zip(vector_ids.iter())
        .map(|((chunk, _), vector_id)| {
            EmbeddingLink::new(chunk.id.clone(), embedding_model.to_string(), vector_id.to_string())
        })
        .collect();
    link_repo.add_bulk(links).await?;
    Ok(())
}

fn media_type_for(object_type: ObjectType) -> &'static str {
    match object_type {
        ObjectType::Webpage => "webpage",
        ObjectType::Pdf => "pdf",
        ObjectType::Note => "note",
        ObjectType::TabGroup => "tab_group",
    }
}
