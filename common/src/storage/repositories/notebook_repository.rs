//! Notebook↔object association table (spec.md §3): `(notebook_id,
//! object_id, added_at)`, unique pair, cascading on either side's deletion.

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::notebook_object::NotebookObject;

pub struct NotebookRepository<'a> {
    db: &'a SurrealDbClient,
}

impl<'a> NotebookRepository<'a> {
    pub fn new(db: &'a SurrealDbClient) -> Self {
        Self { db }
    }

    pub async fn add(&self, notebook_id: &str, object_id: &str) -> Result<NotebookObject, AppError> {
        if let Some(existing) = self.get(notebook_id, object_id).await? {
            return Ok(existing);
        }
        let assoc = NotebookObject::new(notebook_id, object_id);
        Ok(self
            .db
            .store_item(assoc.clone())
            .await?
            .unwrap_or(assoc))
    }

    pub async fn get(&self, notebook_id: &str, object_id: &str) -> Result<Option<NotebookObject>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM notebook_objects WHERE notebook_id = $nb AND object_id = $obj LIMIT 1")
            .bind(("nb", notebook_id.to_string()))
            .bind(("obj", object_id.to_string()))
            .await?;
        let rows: Vec<NotebookObject> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    pub async fn list_objects_for_notebook(&self, notebook_id: &str) -> Result<Vec<NotebookObject>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM notebook_objects WHERE notebook_id = $nb")
            .bind(("nb", notebook_id.to_string()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Cascades when either side of the pair is deleted (spec.md §3).
    pub async fn remove_by_object_id(&self, object_id: &str) -> Result<(), AppError> {
        self.db
            .query("DELETE notebook_objects WHERE object_id = $obj")
            .bind(("obj", object_id.to_string()))
            .await?;
        Ok(())
    }

    pub async fn remove_by_notebook_id(&self, notebook_id: &str) -> Result<(), AppError> {
        self.db
            .query("DELETE notebook_objects WHERE notebook_id = $nb")
            .bind(("nb", notebook_id.to_string()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        SurrealDbClient::memory("notebook_repo_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db")
    }

    #[tokio::test]
    async fn add_is_idempotent_for_same_pair() {
        let db = test_db().await;
        let repo = NotebookRepository::new(&db);
        let first = repo.add("nb-1", "obj-1").await.expect("add first");
        let second = repo.add("nb-1", "obj-1").await.expect("add second");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn remove_by_object_id_cascades() {
        let db = test_db().await;
        let repo = NotebookRepository::new(&db);
        repo.add("nb-1", "obj-1").await.expect("add");
        repo.remove_by_object_id("obj-1").await.expect("remove");
        assert!(repo.get("nb-1", "obj-1").await.expect("get").is_none());
    }
}
