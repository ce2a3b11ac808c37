//! Compensation for the chunking saga's three sub-steps — SQL chunk
//! insert, external embed, SQL link insert (spec.md §4.9: "If a later
//! sub-step fails ... compensate by deleting the inserted chunks, embedding
//! links, and any vectors that were already accepted by the VS
//! (best-effort; failures logged)").

use std::sync::Mutex;

use common::storage::{
    db::SurrealDbClient, repositories::chunk_repository::ChunkRepository,
    repositories::embedding_link_repository::EmbeddingLinkRepository, types::chunk::Chunk,
    vector_store::VectorStore,
};
use tracing::warn;
use uuid::Uuid;

pub struct ChunkingSaga<'a> {
    db: &'a SurrealDbClient,
    vector_store: &'a VectorStore,
    inserted_chunk_ids: Mutex<Vec<String>>,
    inserted_vector_ids: Mutex<Vec<Uuid>>,
}

impl<'a> ChunkingSaga<'a> {
    pub fn new(db: &'a SurrealDbClient, vector_store: &'a VectorStore) -> Self {
        Self {
            db,
            vector_store,
            inserted_chunk_ids: Mutex::new(Vec::new()),
            inserted_vector_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn track_inserted_chunks(&self, chunks: &[Chunk]) {
        let mut ids = self.inserted_chunk_ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.extend(chunks.iter().map(|c| c.id.clone()));
    }

    pub fn track_inserted_vectors(&self, vector_ids: &[Uuid]) {
        let mut ids = self.inserted_vector_ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.extend(vector_ids.iter().copied());
    }

    /// Best-effort rollback of whatever sub-steps already committed.
    /// Failures are logged, never propagated — the caller's original error
    /// is what gets surfaced (spec.md §4.9).
    pub async fn compensate(&self) {
        let vector_ids: Vec<Uuid> = self.inserted_vector_ids.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if !vector_ids.is_empty() {
            if let Err(err) = self.vector_store.delete_by_ids(&vector_ids).await {
                warn!(error = %err, "saga compensation: failed to delete vectors");
            }
        }

        let chunk_ids: Vec<String> = self.inserted_chunk_ids.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if chunk_ids.is_empty() {
            return;
        }

        let link_repo = EmbeddingLinkRepository::new(self.db);
        if let Err(err) = link_repo.delete_by_chunk_ids(&chunk_ids).await {
            warn!(error = %err, "saga compensation: failed to delete embedding links");
        }

        let chunk_repo = ChunkRepository::new(self.db);
        if let Err(err) = chunk_repo.delete_by_ids(&chunk_ids).await {
            warn!(error = %err, "saga compensation: failed to delete chunks");
        }
    }
}
