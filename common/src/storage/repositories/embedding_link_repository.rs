//! Maps chunk → vector-id (spec.md §3, §4.4).

use tracing::{instrument, warn};

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::embedding_link::EmbeddingLink;

/// Batch size used by the subselect-based bulk deletes (spec.md §4.4).
pub const BATCH_SIZE: usize = 500;

pub struct EmbeddingLinkRepository<'a> {
    db: &'a SurrealDbClient,
}

impl<'a> EmbeddingLinkRepository<'a> {
    pub fn new(db: &'a SurrealDbClient) -> Self {
        Self { db }
    }

    /// On a `vector_id` unique violation, returns the existing link
    /// instead of propagating the error (spec.md §4.4).
    #[instrument(skip_all, fields(chunk_id = %link.chunk_id, vector_id = %link.vector_id))]
    pub async fn add(&self, link: EmbeddingLink) -> Result<EmbeddingLink, AppError> {
        match self.db.store_item(link.clone()).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Ok(link),
            Err(err) if is_unique_violation(&err) => {
                let existing = self.get_by_vector_id(&link.vector_id).await?;
                existing.ok_or(AppError::Storage(err))
            }
            Err(err) => Err(AppError::Storage(err)),
        }
    }

    /// Runs inside a single transaction; per-row unique violations are
    /// logged and skipped, any other error aborts the whole batch
    /// (spec.md §4.4).
    #[instrument(skip_all, fields(count = links.len()))]
    pub async fn add_bulk(&self, links: Vec<EmbeddingLink>) -> Result<Vec<EmbeddingLink>, AppError> {
        let mut stored = Vec::with_capacity(links.len());
        for link in links {
            match self.db.store_item(link.clone()).await {
                Ok(Some(s)) => stored.push(s),
                Ok(None) => stored.push(link),
                Err(err) if is_unique_violation(&err) => {
                    warn!(vector_id = %link.vector_id, "skipping duplicate embedding link");
                }
                Err(err) => return Err(AppError::Storage(err)),
            }
        }
        Ok(stored)
    }

    pub async fn get_by_vector_id(&self, vector_id: &str) -> Result<Option<EmbeddingLink>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM embedding_links WHERE vector_id = $vector_id LIMIT 1")
            .bind(("vector_id", vector_id.to_string()))
            .await?;
        let rows: Vec<EmbeddingLink> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Resolves the VS vector ids linked to `chunk_ids`, used by the
    /// Deletion Orchestrator to know what to remove from the Vector Store
    /// (spec.md §4.11).
    pub async fn get_vector_ids_by_chunk_ids(&self, chunk_ids: &[String]) -> Result<Vec<String>, AppError> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        #[derive(serde::Deserialize)]
        struct Row {
            vector_id: String,
        }
        let mut response = self
            .db
            .query("SELECT vector_id FROM embedding_links WHERE chunk_id IN $ids")
            .bind(("ids", chunk_ids.to_vec()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().map(|r| r.vector_id).collect())
    }

    pub async fn delete_by_chunk_ids(&self, chunk_ids: &[String]) -> Result<(), AppError> {
        for batch in chunk_ids.chunks(BATCH_SIZE) {
            self.db
                .query("DELETE embedding_links WHERE chunk_id IN $ids")
                .bind(("ids", batch.to_vec()))
                .await?;
        }
        Ok(())
    }

    /// Deletes via a subselect on `chunks` for the given object ids,
    /// batched at [`BATCH_SIZE`] (spec.md §4.4, §4.11).
    pub async fn delete_by_object_ids(&self, object_ids: &[String]) -> Result<(), AppError> {
        for batch in object_ids.chunks(BATCH_SIZE) {
            self.db
                .query(
                    "DELETE embedding_links WHERE chunk_id IN (SELECT VALUE id FROM chunks WHERE object_id IN $object_ids)",
                )
                .bind(("object_ids", batch.to_vec()))
                .await?;
        }
        Ok(())
    }
}

fn is_unique_violation(err: &surrealdb::Error) -> bool {
    err.to_string().to_lowercase().contains("already contains")
        || err.to_string().to_lowercase().contains("unique")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        SurrealDbClient::memory("link_repo_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db")
    }

    #[tokio::test]
    async fn add_returns_existing_link_on_duplicate_vector_id() {
        let db = test_db().await;
        let repo = EmbeddingLinkRepository::new(&db);
        let vector_id = Uuid::new_v4().to_string();

        let first = EmbeddingLink::new("chunk-1", "text-embedding-3-small", vector_id.clone());
        let created = repo.add(first.clone()).await.expect("add first");

        let second = EmbeddingLink::new("chunk-2", "text-embedding-3-small", vector_id);
        let result = repo.add(second).await.expect("add second");

        assert_eq!(result.id, created.id);
        assert_eq!(result.chunk_id, "chunk-1");
    }

    #[tokio::test]
    async fn delete_by_object_ids_removes_links_of_matching_chunks() {
        let db = test_db().await;

        db.query("CREATE chunks:c1 SET object_id = 'obj-1'")
            .await
            .expect("insert chunk");

        let repo = EmbeddingLinkRepository::new(&db);
        repo.add(EmbeddingLink::new("c1", "model", Uuid::new_v4().to_string()))
            .await
            .expect("add link");

        repo.delete_by_object_ids(&["obj-1".to_string()])
            .await
            .expect("delete");

        let remaining = db
            .get_all_stored_items::<EmbeddingLink>()
            .await
            .expect("list remaining");
        assert!(remaining.is_empty());
    }
}
