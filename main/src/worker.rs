use std::{sync::Arc, time::Duration};

use common::{
    storage::{db::SurrealDbClient, repositories::object_repository::ObjectRepository, vector_store::VectorStore},
    utils::config::get_config,
};
use ingestion_pipeline::{
    ai_gateway::AiGateway,
    chunking_pipeline::{ChunkingEvent, ChunkingPipeline, ChunkingPipelineConfig},
    providers::{DomSmoothieHtmlParser, LopdfPdfExtractor, OpenAiProvider, ReqwestHtmlFetcher},
    queue::IngestionQueue,
    rate_limiter::SlidingWindowRateLimiter,
    workers::{PdfWorker, UrlWorker},
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

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
    let ai_gateway = Arc::new(AiGateway::new(openai_provider.clone(), openai_provider));

    let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(
        config.tuning.rpm_budget,
        config.tuning.avg_requests_per_object,
    ));

    let queue = Arc::new(IngestionQueue::new(db.clone(), config.tuning.queue_concurrency));
    queue
        .register_processor(
            "url",
            Arc::new(UrlWorker::new(
                db.clone(),
                Arc::new(ReqwestHtmlFetcher::default()),
                Arc::new(DomSmoothieHtmlParser),
                ai_gateway.clone(),
                Duration::from_secs(config.tuning.html_parse_timeout_secs),
            )),
        )
        .await;
    queue
        .register_processor(
            "pdf",
            Arc::new(PdfWorker::new(db.clone(), Arc::new(LopdfPdfExtractor), ai_gateway.clone())),
        )
        .await;

    let chunking_pipeline = Arc::new(ChunkingPipeline::new(
        db.clone(),
        vector_store.clone(),
        ai_gateway.clone(),
        rate_limiter,
        ChunkingPipelineConfig {
            max_concurrent: config.tuning.chunking_max_concurrent,
            rpm_budget: config.tuning.rpm_budget,
            avg_requests_per_object: config.tuning.avg_requests_per_object,
            circuit_breaker_threshold: config.tuning.circuit_breaker_threshold,
            circuit_breaker_window_secs: config.tuning.circuit_breaker_window_secs,
            circuit_breaker_half_open_probes: config.tuning.circuit_breaker_half_open_probes,
            orphan_attempt_limit: config.tuning.orphan_attempt_limit,
            shutdown_timeout: Duration::from_secs(config.tuning.chunking_shutdown_timeout_secs),
            embedding_model: config.embedding_model.clone(),
        },
    ));

    let composite_enrichment = composite_enrichment::CompositeEnrichment::new(
        db.clone(),
        vector_store,
        ai_gateway,
        Duration::from_secs(config.tuning.composite_enrichment_debounce_secs),
    );

    spawn_composite_enrichment_trigger(db, chunking_pipeline.subscribe(), composite_enrichment);

    run_worker_loop(queue, chunking_pipeline).await
}

/// Listens for objects the Chunking Pipeline finishes embedding and
/// schedules Composite Enrichment for every `tab_group` that has the
/// object as a child (spec.md §4.10: re-enrichment is driven off a
/// child's completion, not its own job).
fn spawn_composite_enrichment_trigger(
    db: Arc<SurrealDbClient>,
    mut events: tokio::sync::broadcast::Receiver<ChunkingEvent>,
    composite_enrichment: Arc<composite_enrichment::CompositeEnrichment>,
) {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            };
            let ChunkingEvent::ObjectEmbedded { object_id } = event else {
                continue;
            };
            let object_repo = ObjectRepository::new(&db);
            match object_repo.find_tab_groups_containing(&object_id).await {
                Ok(parents) => {
                    for parent_id in parents {
                        composite_enrichment.schedule(parent_id).await;
                    }
                }
                Err(err) => {
                    tracing::error!(object_id = %object_id, error = %err, "failed to look up parent tab groups");
                }
            }
        }
    });
}

/// Drives the Ingestion Queue and Chunking Pipeline on a shared tick.
/// Composite Enrichment runs on its own debounce timers, triggered out of
/// band by `spawn_composite_enrichment_trigger` (spec.md §5: each pipeline
/// is its own suspension point, no shared event loop ordering requirement
/// beyond the single rate limiter/circuit breaker each already owns).
async fn run_worker_loop(
    queue: Arc<IngestionQueue>,
    chunking_pipeline: Arc<ChunkingPipeline>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut shutdown = std::pin::pin!(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(err) = queue.process_jobs().await {
                    tracing::error!(error = %err, "ingestion queue tick failed");
                }
                if let Err(err) = chunking_pipeline.tick().await {
                    tracing::error!(error = %err, "chunking pipeline tick failed");
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, draining chunking pipeline");
                chunking_pipeline.shutdown().await;
                return Ok(());
            }
        }
    }
}
