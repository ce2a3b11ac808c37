//! Retrieval side of the core's public API (spec.md §6): `similar_by_text`,
//! `similar_by_vector`, and `get_retriever` — a thin, stateless wrapper
//! around the Vector Store's own query methods so surrounding layers don't
//! need to hold a `VectorStore` directly.

#![allow(clippy::missing_docs_in_private_items)]

use std::sync::Arc;

use common::{
    error::AppError,
    storage::vector_store::{QueryOpts, TextEmbedder, VectorSearchResult, VectorStore, VsFilter},
};
use tracing::instrument;

pub struct RetrievalPipeline {
    vector_store: Arc<VectorStore>,
    embedder: Arc<dyn TextEmbedder>,
}

impl RetrievalPipeline {
    pub fn new(vector_store: Arc<VectorStore>, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self { vector_store, embedder }
    }

    #[instrument(skip_all, fields(k = k, query_len = query.len()))]
    pub async fn similar_by_text(
        &self,
        query: &str,
        k: usize,
        filter: VsFilter,
    ) -> Result<Vec<VectorSearchResult>, AppError> {
        let opts = QueryOpts { k, filter };
        self.vector_store
            .query_similar_by_text(query, &opts, self.embedder.as_ref())
            .await
    }

    #[instrument(skip_all, fields(k = k, dim = vector.len()))]
    pub async fn similar_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        filter: VsFilter,
    ) -> Result<Vec<VectorSearchResult>, AppError> {
        let opts = QueryOpts { k, filter };
        self.vector_store.query_similar_by_vector(vector, &opts).await
    }

    /// A query-bound handle that closes over `k`/`filter` so a caller can
    /// repeatedly retrieve without re-specifying them (spec.md §6).
    pub fn get_retriever(&self, k: usize, filter: VsFilter) -> Retriever<'_> {
        Retriever {
            pipeline: self,
            k,
            filter,
        }
    }
}

pub struct Retriever<'a> {
    pipeline: &'a RetrievalPipeline,
    k: usize,
    filter: VsFilter,
}

impl Retriever<'_> {
    pub async fn retrieve(&self, query: &str) -> Result<Vec<VectorSearchResult>, AppError> {
        self.pipeline
            .similar_by_text(query, self.k, self.filter.clone())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::db::SurrealDbClient;
    use common::storage::vector_store::{Layer, ProcessingDepth, RecordType, VectorRecord, VECTOR_DIMENSION};
    use uuid::Uuid;

    struct StubEmbedder;

    #[async_trait]
    impl TextEmbedder for StubEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.1_f32; VECTOR_DIMENSION]).collect())
        }
    }

    async fn test_pipeline() -> RetrievalPipeline {
        let db = SurrealDbClient::memory("retrieval_tests", &Uuid::new_v4().to_string())
            .await
            .unwrap();
        let store = VectorStore::new(db, "test");
        store.ensure_schema().await.unwrap();
        RetrievalPipeline::new(Arc::new(store), Arc::new(StubEmbedder))
    }

    #[tokio::test]
    async fn similar_by_text_finds_seeded_record() {
        let pipeline = test_pipeline().await;
        let record = VectorRecord::new(
            RecordType::Chunk,
            "webpage",
            Layer::Wom,
            ProcessingDepth::Chunk,
            vec![0.1; VECTOR_DIMENSION],
            "some chunk content",
            "title",
            "summary",
            vec![],
            vec![],
        );
        pipeline.vector_store.add_documents(vec![record]).await.unwrap();

        let results = pipeline.similar_by_text("query", 5, VsFilter::default()).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn get_retriever_closes_over_k_and_filter() {
        let pipeline = test_pipeline().await;
        let record = VectorRecord::new(
            RecordType::Chunk,
            "webpage",
            Layer::Wom,
            ProcessingDepth::Chunk,
            vec![0.1; VECTOR_DIMENSION],
            "content",
            "title",
            "summary",
            vec![],
            vec![],
        );
        pipeline.vector_store.add_documents(vec![record]).await.unwrap();

        let retriever = pipeline.get_retriever(3, VsFilter::default());
        let results = retriever.retrieve("query").await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
