//! CRUD, bulk insert, and listing for `chunks` (spec.md §4.4).

use std::collections::HashMap;

use serde::Deserialize;
use tracing::instrument;

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::chunk::Chunk;

pub struct ChunkRepository<'a> {
    db: &'a SurrealDbClient,
}

impl<'a> ChunkRepository<'a> {
    pub fn new(db: &'a SurrealDbClient) -> Self {
        Self { db }
    }

    /// Inserts all of `chunks` in a single transaction (spec.md §4.4,
    /// §4.9 step e).
    #[instrument(skip_all, fields(count = chunks.len()))]
    pub async fn add_bulk(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, AppError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = String::from("BEGIN TRANSACTION;\n");
        for (idx, chunk) in chunks.iter().enumerate() {
            query.push_str(&format!(
                "CREATE type::thing('chunks', $id{idx}) CONTENT $chunk{idx};\n"
            ));
        }
        query.push_str("COMMIT TRANSACTION;");

        let mut builder = self.db.query(query);
        for (idx, chunk) in chunks.iter().enumerate() {
            builder = builder
                .bind((format!("id{idx}"), chunk.id.clone()))
                .bind((format!("chunk{idx}"), chunk.clone()));
        }
        builder.await?;

        Ok(chunks)
    }

    /// Ordered by `chunk_idx` (spec.md §3, §4.4).
    pub async fn list_by_object(&self, object_id: &str) -> Result<Vec<Chunk>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM chunks WHERE object_id = $object_id ORDER BY chunk_idx ASC")
            .bind(("object_id", object_id.to_string()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Chunks with no row in `embedding_links` (`LEFT JOIN ... IS NULL`),
    /// used by the `reembed` utility (spec.md §4.4, §6).
    pub async fn list_unembedded(&self, limit: usize) -> Result<Vec<Chunk>, AppError> {
        let sql = "
            SELECT * FROM chunks
            WHERE id NOT IN (SELECT VALUE chunk_id FROM embedding_links)
            LIMIT $limit;
        ";
        let mut response = self.db.query(sql).bind(("limit", limit)).await?;
        Ok(response.take(0)?)
    }

    pub async fn get_chunk_ids_by_object_ids(
        &self,
        object_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            object_id: String,
            id: String,
        }

        let mut response = self
            .db
            .query("SELECT id, object_id FROM chunks WHERE object_id IN $ids")
            .bind(("ids", object_ids.to_vec()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;

        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            map.entry(row.object_id).or_default().push(row.id);
        }
        Ok(map)
    }

    pub async fn delete_by_ids(&self, ids: &[String]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db
            .query("DELETE chunks WHERE id IN $ids")
            .bind(("ids", ids.to_vec()))
            .await?;
        Ok(())
    }

    pub async fn delete_by_object_id(&self, object_id: &str) -> Result<(), AppError> {
        self.db
            .query("DELETE chunks WHERE object_id = $object_id")
            .bind(("object_id", object_id.to_string()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::object::Proposition;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        SurrealDbClient::memory("chunk_repo_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db")
    }

    fn sample_chunk(object_id: &str, idx: i64) -> Chunk {
        Chunk::new(
            object_id,
            idx,
            "a".repeat(25),
            Some("summary".to_string()),
            vec!["t1".to_string()],
            vec![],
            100,
        )
    }

    #[tokio::test]
    async fn add_bulk_then_list_by_object_preserves_order() {
        let db = test_db().await;
        let repo = ChunkRepository::new(&db);
        let chunks = vec![
            sample_chunk("obj-1", 0),
            sample_chunk("obj-1", 1),
            sample_chunk("obj-1", 2),
        ];
        repo.add_bulk(chunks).await.expect("add_bulk");

        let listed = repo.list_by_object("obj-1").await.expect("list");
        assert_eq!(listed.len(), 3);
        assert_eq!(
            listed.iter().map(|c| c.chunk_idx).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn round_trip_preserves_content_byte_identically() {
        let db = test_db().await;
        let repo = ChunkRepository::new(&db);
        let chunk = sample_chunk("obj-2", 0);
        let original_content = chunk.content.clone();
        repo.add_bulk(vec![chunk]).await.expect("add_bulk");

        let listed = repo.list_by_object("obj-2").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content, original_content);
    }

    #[tokio::test]
    async fn list_unembedded_returns_chunks_with_no_link() {
        let db = test_db().await;
        let repo = ChunkRepository::new(&db);
        repo.add_bulk(vec![sample_chunk("obj-3", 0)])
            .await
            .expect("add_bulk");

        let unembedded = repo.list_unembedded(10).await.expect("list_unembedded");
        assert_eq!(unembedded.len(), 1);
    }
}
