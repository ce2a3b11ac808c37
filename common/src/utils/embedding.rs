use async_openai::types::CreateEmbeddingRequestArgs;
use tracing::debug;

use crate::error::AppError;

/// Generates embedding vectors for a batch of inputs in one request — the
/// underlying call behind `AI Gateway.embed()` (spec.md §4.8). Preserves
/// input order.
pub async fn generate_embeddings(
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    inputs: &[String],
    model: &str,
    dimensions: u32,
) -> Result<Vec<Vec<f32>>, AppError> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .input(inputs.to_vec())
        .dimensions(dimensions)
        .build()?;

    let response = client.embeddings().create(request).await?;

    let mut ordered: Vec<(u32, Vec<f32>)> = response
        .data
        .into_iter()
        .map(|d| (d.index, d.embedding))
        .collect();
    ordered.sort_by_key(|(idx, _)| *idx);

    let embeddings: Vec<Vec<f32>> = ordered.into_iter().map(|(_, v)| v).collect();

    if embeddings.len() != inputs.len() {
        return Err(AppError::AITransport(
            "embedding response count mismatch".to_string(),
            "embed".to_string(),
        ));
    }

    debug!(count = embeddings.len(), dimensions, "generated embeddings");

    Ok(embeddings)
}
