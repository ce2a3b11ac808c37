//! CRUD and lifecycle operations over `objects` (spec.md §4.3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::cognitive::{ObjectBio, ObjectRelationships};
use crate::storage::types::object::{truncate_error_info, Object, ObjectStatus, ObjectType};

/// Batch size used by every "many ids" operation in this repository
/// (`delete_by_ids`), matching the Deletion Orchestrator's own batching
/// (spec.md §4.3, §4.11).
pub const BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct ObjectPatch {
    pub title: Option<String>,
    pub cleaned_text: Option<String>,
    pub parsed_content_json: Option<serde_json::Value>,
    pub raw_content_ref: Option<String>,
    pub summary: Option<String>,
    pub tags_json: Option<Vec<String>>,
    pub propositions_json: Option<Vec<crate::storage::types::object::Proposition>>,
    pub child_object_ids: Option<Vec<String>>,
    /// Explicitly ignored by `update` — `source_uri` is immutable once set
    /// (spec.md §4.3). Present only so a caller mistake is caught and
    /// logged rather than silently applied.
    pub source_uri: Option<String>,
}

pub struct ObjectRepository<'a> {
    db: &'a SurrealDbClient,
}

/// Input to [`ObjectRepository::create_with_cognitive`]: the object's core
/// fields plus its initial `object_bio`/`object_relationships` state
/// (spec.md §6 `create_with_cognitive(data)`).
#[derive(Debug, Clone)]
pub struct NewObjectData {
    pub object_type: ObjectType,
    pub title: String,
    pub source_uri: Option<String>,
    pub bio: Option<ObjectBio>,
    pub relationships: Option<ObjectRelationships>,
    /// Memory layer to create the object at (spec.md §3). Defaults to
    /// `wom`; callers performing an explicit save/bookmark set `lom`.
    pub layer: crate::storage::vector_store::Layer,
}

impl NewObjectData {
    pub fn new(object_type: ObjectType, title: impl Into<String>) -> Self {
        Self {
            object_type,
            title: title.into(),
            source_uri: None,
            bio: None,
            relationships: None,
            layer: crate::storage::vector_store::Layer::Wom,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDetails {
    pub title: String,
    pub source_uri: Option<String>,
    pub object_type: crate::storage::types::object::ObjectType,
}

impl<'a> ObjectRepository<'a> {
    pub fn new(db: &'a SurrealDbClient) -> Self {
        Self { db }
    }

    /// Creates `object`. On a `source_uri` unique-constraint violation,
    /// re-reads and returns the existing row instead of propagating the
    /// error (idempotent create-or-fetch, spec.md §4.3).
    #[instrument(skip_all, fields(object_id = %object.id))]
    pub async fn create(&self, object: Object) -> Result<Object, AppError> {
        if let Some(source_uri) = &object.source_uri {
            url::Url::parse(source_uri)
                .map_err(|e| AppError::Validation(format!("invalid source_uri {source_uri}: {e}")))?;
        }

        match self.db.store_item(object.clone()).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Ok(object),
            Err(err) => {
                if let Some(source_uri) = &object.source_uri {
                    if is_unique_violation(&err) {
                        if let Some(existing) = self.get_by_source_uri(source_uri).await? {
                            return Ok(existing);
                        }
                    }
                }
                Err(AppError::Storage(err))
            }
        }
    }

    /// As `create`, but seeds `object_bio`/`object_relationships` from
    /// `data` up front instead of leaving them `None` (spec.md §6
    /// `create_with_cognitive(data)` — used by callers that already know
    /// an object's initial cognitive state at creation time, e.g. a note
    /// authored with an explicit relationship to another object).
    #[instrument(skip_all, fields(title = %data.title))]
    pub async fn create_with_cognitive(&self, data: NewObjectData) -> Result<Object, AppError> {
        let mut object = Object::new(data.object_type, data.title);
        object.source_uri = data.source_uri;
        object.layer = data.layer;
        if let Some(bio) = &data.bio {
            object.object_bio = Some(serde_json::to_value(bio)?);
        }
        if let Some(relationships) = &data.relationships {
            object.object_relationships = Some(serde_json::to_value(relationships)?);
        }
        self.create(object).await
    }

    /// Builds the SurrealQL `CREATE ... CONTENT $obj` fragment for
    /// splicing into a larger multi-statement transaction, without
    /// awaiting it itself (spec.md §4.3: "non-suspending for composition
    /// into larger transactions" — e.g. the PDF worker's object+chunk
    /// insert, spec.md §4.7).
    pub fn create_sync(object: &Object) -> String {
        format!(
            "CREATE type::thing('objects', '{id}') CONTENT {content};",
            id = object.id,
            content = serde_json::to_string(object).unwrap_or_else(|_| "{}".to_string())
        )
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Object>, AppError> {
        Ok(self.db.get_item::<Object>(id).await?)
    }

    pub async fn get_by_source_uri(&self, source_uri: &str) -> Result<Option<Object>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM objects WHERE source_uri = $uri LIMIT 1")
            .bind(("uri", source_uri.to_string()))
            .await?;
        let rows: Vec<Object> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Existence check used by ingestion before enqueuing a duplicate URL,
    /// scoped to `layer = 'lom'` so a page only ever seen as transient
    /// working-memory history is not mistaken for an already-bookmarked
    /// duplicate (spec.md §4.3).
    pub async fn exists_by_source_uri(&self, source_uri: &str) -> Result<bool, AppError> {
        let Some(object) = self.get_by_source_uri(source_uri).await? else {
            return Ok(false);
        };
        Ok(object.layer == crate::storage::vector_store::Layer::Lom)
    }

    pub async fn find_by_file_hash(&self, file_hash: &str) -> Result<Option<Object>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM objects WHERE file_hash = $hash LIMIT 1")
            .bind(("hash", file_hash.to_string()))
            .await?;
        let rows: Vec<Object> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Applies `patch`. `source_uri` is always ignored (immutability) with
    /// a warning if the caller attempted to set it (spec.md §4.3).
    #[instrument(skip_all, fields(object_id = %id))]
    pub async fn update(&self, id: &str, patch: ObjectPatch) -> Result<Option<Object>, AppError> {
        if patch.source_uri.is_some() {
            warn!(object_id = %id, "ignoring attempt to mutate immutable source_uri");
        }

        let Some(mut object) = self.get_by_id(id).await? else {
            return Ok(None);
        };

        if let Some(title) = patch.title {
            object.title = title;
        }
        if let Some(cleaned_text) = patch.cleaned_text {
            object.cleaned_text = Some(cleaned_text);
        }
        if let Some(parsed_content_json) = patch.parsed_content_json {
            object.parsed_content_json = Some(parsed_content_json);
        }
        if let Some(raw_content_ref) = patch.raw_content_ref {
            object.raw_content_ref = Some(raw_content_ref);
        }
        if let Some(summary) = patch.summary {
            object.summary = Some(summary);
        }
        if let Some(tags_json) = patch.tags_json {
            object.tags_json = tags_json;
        }
        if let Some(propositions_json) = patch.propositions_json {
            object.propositions_json = propositions_json;
        }
        if let Some(child_object_ids) = patch.child_object_ids {
            object.child_object_ids = child_object_ids;
        }
        object.updated_at = chrono::Utc::now();

        let updated: Option<Object> = self
            .db
            .client
            .update(("objects", id))
            .content(object)
            .await?;
        Ok(updated)
    }

    /// Transitions `status`. Clears `error_info` unless the new status is
    /// a failure state; only sets `parsed_at` when explicitly provided
    /// (spec.md §4.3).
    #[instrument(skip_all, fields(object_id = %id, status = ?status))]
    pub async fn update_status(
        &self,
        id: &str,
        status: ObjectStatus,
        parsed_at: Option<chrono::DateTime<chrono::Utc>>,
        error_info: Option<String>,
    ) -> Result<Option<Object>, AppError> {
        let Some(mut object) = self.get_by_id(id).await? else {
            return Ok(None);
        };

        object.status = status;
        object.error_info = if status.is_failure() {
            error_info.map(|e| truncate_error_info(&e))
        } else {
            None
        };
        if let Some(parsed_at) = parsed_at {
            object.parsed_at = Some(parsed_at);
        }
        object.updated_at = chrono::Utc::now();

        let updated: Option<Object> = self
            .db
            .client
            .update(("objects", id))
            .content(object)
            .await?;
        Ok(updated)
    }

    pub async fn find_by_status(&self, statuses: &[ObjectStatus]) -> Result<Vec<Object>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM objects WHERE status IN $statuses")
            .bind(("statuses", statuses.to_vec()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Objects ready for the Chunking Pipeline: `status = parsed`, oldest
    /// first (spec.md §4.3, §4.9 step 3).
    pub async fn get_processable(&self, limit: usize) -> Result<Vec<Object>, AppError> {
        let mut response = self
            .db
            .query("SELECT * FROM objects WHERE status = 'parsed' ORDER BY created_at ASC LIMIT $limit")
            .bind(("limit", limit))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn count_by_status(&self, status: ObjectStatus) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct Row {
            count: usize,
        }
        let mut response = self
            .db
            .query("SELECT count() AS count FROM objects WHERE status = $status GROUP ALL")
            .bind(("status", status))
            .await?;
        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().next().map(|r| r.count).unwrap_or(0))
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<Option<Object>, AppError> {
        Ok(self.db.delete_item::<Object>(id).await?)
    }

    /// Deletes in batches of [`BATCH_SIZE`] (spec.md §4.3, §4.11).
    pub async fn delete_by_ids(&self, ids: &[String]) -> Result<usize, AppError> {
        let mut deleted = 0usize;
        for batch in ids.chunks(BATCH_SIZE) {
            self.db
                .query("DELETE objects WHERE id IN $ids")
                .bind(("ids", batch.to_vec()))
                .await?;
            deleted += batch.len();
        }
        Ok(deleted)
    }

    pub async fn update_last_accessed(&self, id: &str) -> Result<(), AppError> {
        self.db
            .query("UPDATE objects SET last_accessed_at = time::now() WHERE id = $id")
            .bind(("id", id.to_string()))
            .await?;
        Ok(())
    }

    /// `tab_group` objects whose `child_object_ids` includes `child_id`,
    /// used to locate the parent(s) to re-enrich after a child finishes
    /// embedding (spec.md §4.9, §4.10).
    pub async fn find_tab_groups_containing(&self, child_id: &str) -> Result<Vec<String>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            id: String,
        }
        let mut response = self
            .db
            .query(
                "SELECT id FROM objects \
                 WHERE object_type = 'tab_group' AND child_object_ids CONTAINS $child_id",
            )
            .bind(("child_id", child_id.to_string()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    pub async fn get_child_ids(&self, id: &str) -> Result<Vec<String>, AppError> {
        Ok(self
            .get_by_id(id)
            .await?
            .map(|o| o.child_object_ids)
            .unwrap_or_default())
    }

    pub async fn update_child_ids(&self, id: &str, child_object_ids: Vec<String>) -> Result<(), AppError> {
        self.db
            .query("UPDATE objects SET child_object_ids = $ids WHERE id = $id")
            .bind(("ids", child_object_ids))
            .bind(("id", id.to_string()))
            .await?;
        Ok(())
    }

    pub async fn get_source_details_by_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, SourceDetails>, AppError> {
        let mut response = self
            .db
            .query("SELECT id, title, source_uri, object_type FROM objects WHERE id IN $ids")
            .bind(("ids", ids.to_vec()))
            .await?;

        #[derive(Deserialize)]
        struct Row {
            id: String,
            title: String,
            source_uri: Option<String>,
            object_type: crate::storage::types::object::ObjectType,
        }
        let rows: Vec<Row> = response.take(0)?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.id,
                    SourceDetails {
                        title: r.title,
                        source_uri: r.source_uri,
                        object_type: r.object_type,
                    },
                )
            })
            .collect())
    }

    /// Create-or-update keyed on `source_uri`: updates the existing row if
    /// one exists, otherwise creates a new object (spec.md §4.3).
    pub async fn create_or_update(&self, object: Object) -> Result<Object, AppError> {
        let Some(source_uri) = object.source_uri.clone() else {
            return self.create(object).await;
        };

        if let Some(existing) = self.get_by_source_uri(&source_uri).await? {
            let patch = ObjectPatch {
                title: Some(object.title),
                cleaned_text: object.cleaned_text,
                parsed_content_json: object.parsed_content_json,
                summary: object.summary,
                tags_json: Some(object.tags_json),
                propositions_json: Some(object.propositions_json),
                ..Default::default()
            };
            return Ok(self
                .update(&existing.id, patch)
                .await?
                .unwrap_or(existing));
        }

        self.create(object).await
    }
}

fn is_unique_violation(err: &surrealdb::Error) -> bool {
    err.to_string().to_lowercase().contains("already contains")
        || err.to_string().to_lowercase().contains("unique")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::object::ObjectType;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("obj_repo_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.ensure_initialized().await.expect("init schema");
        db
    }

    #[tokio::test]
    async fn create_then_get_by_id_round_trips() {
        let db = test_db().await;
        let repo = ObjectRepository::new(&db);
        let object = Object::new(ObjectType::Webpage, "title");
        let created = repo.create(object.clone()).await.expect("create");
        assert_eq!(created.id, object.id);

        let fetched = repo.get_by_id(&object.id).await.expect("get").expect("present");
        assert_eq!(fetched.title, "title");
    }

    #[tokio::test]
    async fn create_with_duplicate_source_uri_returns_existing() {
        let db = test_db().await;
        let repo = ObjectRepository::new(&db);
        let mut first = Object::new(ObjectType::Webpage, "first");
        first.source_uri = Some("https://example.com/a".to_string());
        let created_first = repo.create(first.clone()).await.expect("create first");

        let mut second = Object::new(ObjectType::Webpage, "second");
        second.source_uri = Some("https://example.com/a".to_string());
        let created_second = repo.create(second).await.expect("create second");

        assert_eq!(created_first.id, created_second.id);
    }

    #[tokio::test]
    async fn create_with_cognitive_seeds_bio_and_relationships() {
        use crate::storage::types::cognitive::{ObjectBio, ObjectRelationships, Relationship};

        let db = test_db().await;
        let repo = ObjectRepository::new(&db);
        let data = NewObjectData {
            bio: Some(ObjectBio {
                created_at: chrono::Utc::now(),
                events: Vec::new(),
            }),
            relationships: Some(ObjectRelationships {
                related: vec![Relationship {
                    to: "objects:other".to_string(),
                    nature: "cites".to_string(),
                    strength: 0.9,
                    topic_affinity: None,
                    formed: chrono::Utc::now(),
                }],
            }),
            ..NewObjectData::new(ObjectType::Note, "seeded note")
        };

        let created = repo.create_with_cognitive(data).await.expect("create_with_cognitive");
        assert!(created.object_bio.is_some());
        let relationships = ObjectRelationships::parse(created.object_relationships.as_ref().expect("blob"))
            .expect("parse");
        assert_eq!(relationships.related.len(), 1);
    }

    #[tokio::test]
    async fn exists_by_source_uri_ignores_wom_only_history() {
        let db = test_db().await;
        let repo = ObjectRepository::new(&db);
        let mut object = Object::new(ObjectType::Webpage, "visited in passing");
        object.source_uri = Some("https://example.com/history".to_string());
        repo.create(object).await.expect("create");

        assert!(!repo
            .exists_by_source_uri("https://example.com/history")
            .await
            .expect("exists check"));
    }

    #[tokio::test]
    async fn exists_by_source_uri_finds_lom_bookmark() {
        use crate::storage::vector_store::Layer;

        let db = test_db().await;
        let repo = ObjectRepository::new(&db);
        let data = NewObjectData {
            source_uri: Some("https://example.com/bookmarked".to_string()),
            layer: Layer::Lom,
            ..NewObjectData::new(ObjectType::Webpage, "bookmarked")
        };
        repo.create_with_cognitive(data).await.expect("create_with_cognitive");

        assert!(repo
            .exists_by_source_uri("https://example.com/bookmarked")
            .await
            .expect("exists check"));
    }

    #[tokio::test]
    async fn update_status_clears_error_info_on_non_failure() {
        let db = test_db().await;
        let repo = ObjectRepository::new(&db);
        let object = Object::new(ObjectType::Webpage, "t");
        repo.create(object.clone()).await.expect("create");

        repo.update_status(
            &object.id,
            ObjectStatus::Error,
            None,
            Some("boom".to_string()),
        )
        .await
        .expect("mark error");

        let updated = repo
            .update_status(&object.id, ObjectStatus::Parsed, None, None)
            .await
            .expect("recover")
            .expect("present");
        assert!(updated.error_info.is_none());
        assert_eq!(updated.status, ObjectStatus::Parsed);
    }

    #[tokio::test]
    async fn get_processable_returns_only_parsed_objects() {
        let db = test_db().await;
        let repo = ObjectRepository::new(&db);

        let mut parsed = Object::new(ObjectType::Webpage, "parsed");
        parsed.status = ObjectStatus::Parsed;
        repo.create(parsed.clone()).await.expect("create parsed");

        let new_obj = Object::new(ObjectType::Webpage, "new");
        repo.create(new_obj).await.expect("create new");

        let processable = repo.get_processable(10).await.expect("get processable");
        assert_eq!(processable.len(), 1);
        assert_eq!(processable[0].id, parsed.id);
    }

    #[tokio::test]
    async fn delete_by_ids_removes_all_given_rows() {
        let db = test_db().await;
        let repo = ObjectRepository::new(&db);
        let a = Object::new(ObjectType::Note, "a");
        let b = Object::new(ObjectType::Note, "b");
        repo.create(a.clone()).await.expect("create a");
        repo.create(b.clone()).await.expect("create b");

        repo.delete_by_ids(&[a.id.clone(), b.id.clone()])
            .await
            .expect("delete");

        assert!(repo.get_by_id(&a.id).await.expect("get a").is_none());
        assert!(repo.get_by_id(&b.id).await.expect("get b").is_none());
    }
}
