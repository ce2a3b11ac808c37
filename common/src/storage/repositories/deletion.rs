//! Deletion Orchestrator (spec.md §4.11): two-phase delete across the
//! Relational Store (authoritative) and the Vector Store (best-effort,
//! orphan-tracking).

use tracing::{instrument, warn};

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::repositories::chunk_repository::ChunkRepository;
use crate::storage::repositories::embedding_link_repository::EmbeddingLinkRepository;
use crate::storage::repositories::notebook_repository::NotebookRepository;
use crate::storage::repositories::object_repository::ObjectRepository;
use crate::storage::types::cognitive::ObjectRelationships;
use crate::storage::vector_store::VectorStore;

/// Batch size for `delete_objects`, matching `ObjectRepository`'s own
/// batching (spec.md §4.3, §4.11).
pub const BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct DeletionReport {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
    pub not_found: Vec<String>,
    pub orphaned_chunk_ids: Vec<String>,
    pub storage_error: Option<String>,
    pub vector_error: Option<String>,
}

impl DeletionReport {
    fn merge(&mut self, other: DeletionReport) {
        self.successful.extend(other.successful);
        self.failed.extend(other.failed);
        self.not_found.extend(other.not_found);
        self.orphaned_chunk_ids.extend(other.orphaned_chunk_ids);
        self.storage_error = self.storage_error.take().or(other.storage_error);
        self.vector_error = self.vector_error.take().or(other.vector_error);
    }
}

pub struct DeletionOrchestrator<'a> {
    db: &'a SurrealDbClient,
    vector_store: &'a VectorStore,
}

impl<'a> DeletionOrchestrator<'a> {
    pub fn new(db: &'a SurrealDbClient, vector_store: &'a VectorStore) -> Self {
        Self { db, vector_store }
    }

    #[instrument(skip_all, fields(requested = ids.len()))]
    pub async fn delete_objects(&self, ids: &[String]) -> DeletionReport {
        let mut deduped = Vec::new();
        for id in ids {
            if !deduped.contains(id) {
                deduped.push(id.clone());
            }
        }

        let mut report = DeletionReport::default();
        for batch in deduped.chunks(BATCH_SIZE) {
            let batch_report = self.delete_batch(batch).await;
            report.merge(batch_report);
        }
        report
    }

    /// Resolves `uri` to an object id and runs the same two-phase delete
    /// as `delete_objects` (spec.md §6 `delete_by_source_uri(uri)`). A
    /// missing `source_uri` reports as `not_found`, same as an unknown id.
    #[instrument(skip(self))]
    pub async fn delete_by_source_uri(&self, uri: &str) -> DeletionReport {
        let object_repo = ObjectRepository::new(self.db);
        match object_repo.get_by_source_uri(uri).await {
            Ok(Some(object)) => self.delete_objects(&[object.id]).await,
            Ok(None) => DeletionReport {
                not_found: vec![uri.to_string()],
                ..Default::default()
            },
            Err(err) => DeletionReport {
                failed: vec![uri.to_string()],
                storage_error: Some(err.to_string()),
                ..Default::default()
            },
        }
    }

    async fn delete_batch(&self, batch: &[String]) -> DeletionReport {
        let object_repo = ObjectRepository::new(self.db);
        let chunk_repo = ChunkRepository::new(self.db);
        let link_repo = EmbeddingLinkRepository::new(self.db);
        let notebook_repo = NotebookRepository::new(self.db);

        // a. read chunk ids for the batch, best-effort.
        let chunk_id_map = chunk_repo
            .get_chunk_ids_by_object_ids(batch)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "failed reading chunk ids for deletion batch");
                Default::default()
            });
        let chunk_ids: Vec<String> = chunk_id_map.values().flatten().cloned().collect();

        // b. reverse-relationship cleanup, best-effort, non-transitive
        // (spec.md §9 — do not "fix" to follow transitive relationships).
        for object_id in batch {
            if let Err(err) = self.cleanup_reverse_relationships(object_id).await {
                warn!(object_id = %object_id, error = %err, "reverse relationship cleanup failed");
            }
        }

        // determine which ids actually exist before the transaction, so we
        // can report successful vs not_found afterwards.
        let mut existing = Vec::new();
        let mut not_found = Vec::new();
        for id in batch {
            match object_repo.get_by_id(id).await {
                Ok(Some(_)) => existing.push(id.clone()),
                Ok(None) => not_found.push(id.clone()),
                Err(_) => not_found.push(id.clone()),
            }
        }

        if existing.is_empty() {
            return DeletionReport {
                not_found,
                ..Default::default()
            };
        }

        // c. one RS transaction: embedding links, chunks, objects.
        let rs_result: Result<(), AppError> = async {
            link_repo.delete_by_object_ids(&existing).await?;
            for id in &existing {
                chunk_repo.delete_by_object_id(id).await?;
            }
            for id in &existing {
                notebook_repo.remove_by_object_id(id).await?;
            }
            object_repo.delete_by_ids(&existing).await?;
            Ok(())
        }
        .await;

        if let Err(err) = rs_result {
            // Any exception rolls back the conceptual batch; every id in
            // this batch (existing and missing) moves to failed.
            return DeletionReport {
                failed: batch.to_vec(),
                storage_error: Some(err.to_string()),
                ..Default::default()
            };
        }

        let mut report = DeletionReport {
            successful: existing,
            not_found,
            ..Default::default()
        };

        // d. VS deletion is best-effort; failures are non-fatal and
        // tracked as orphans (spec.md §4.11 step d).
        if !chunk_ids.is_empty() {
            let vector_ids = link_repo
                .get_vector_ids_by_chunk_ids(&chunk_ids)
                .await
                .unwrap_or_default();
            let parsed: Vec<uuid::Uuid> = vector_ids
                .iter()
                .filter_map(|id| uuid::Uuid::parse_str(id).ok())
                .collect();

            if let Err(err) = self.vector_store.delete_by_ids(&parsed).await {
                warn!(error = %err, "vector store deletion failed, tracking orphaned vectors");
                report.vector_error = Some(err.to_string());
                report.orphaned_chunk_ids = chunk_ids;
            }
        }

        report
    }

    /// Reads the victim's `object_relationships` back-pointers and, for
    /// each related id, removes the reverse entry pointing at the victim.
    /// Only the victim's own relationships are consulted — not transitive
    /// ones (spec.md §4.11 step b, §9).
    async fn cleanup_reverse_relationships(&self, object_id: &str) -> Result<(), AppError> {
        let object_repo = ObjectRepository::new(self.db);
        let Some(object) = object_repo.get_by_id(object_id).await? else {
            return Ok(());
        };
        let Some(raw) = &object.object_relationships else {
            return Ok(());
        };
        let Some(relationships) = ObjectRelationships::parse(raw) else {
            return Ok(());
        };

        for related in &relationships.related {
            self.remove_relationship(&related.to, object_id).await?;
        }
        Ok(())
    }

    async fn remove_relationship(&self, holder_id: &str, target_id: &str) -> Result<(), AppError> {
        let object_repo = ObjectRepository::new(self.db);
        let Some(holder) = object_repo.get_by_id(holder_id).await? else {
            return Ok(());
        };
        let Some(raw) = &holder.object_relationships else {
            return Ok(());
        };
        let Some(mut relationships) = ObjectRelationships::parse(raw) else {
            return Ok(());
        };

        if relationships.remove_relationship(target_id) {
            let mut patched_object = holder;
            patched_object.object_relationships = Some(serde_json::to_value(&relationships)?);
            patched_object.updated_at = chrono::Utc::now();
            self.db
                .client
                .update::<Option<crate::storage::types::object::Object>>(("objects", holder_id))
                .content(patched_object)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::cognitive::{ObjectRelationships, Relationship};
    use crate::storage::types::object::{Object, ObjectType};
    use uuid::Uuid;

    async fn test_setup() -> (SurrealDbClient, VectorStore) {
        let db = SurrealDbClient::memory("deletion_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.ensure_initialized().await.expect("init");
        let vs = VectorStore::new(db.clone(), "test");
        vs.ensure_schema().await.expect("vs schema");
        (db, vs)
    }

    #[tokio::test]
    async fn delete_objects_removes_rs_rows_and_reports_successful() {
        let (db, vs) = test_setup().await;
        let object_repo = ObjectRepository::new(&db);
        let object = Object::new(ObjectType::Note, "victim");
        object_repo.create(object.clone()).await.expect("create");

        let orchestrator = DeletionOrchestrator::new(&db, &vs);
        let report = orchestrator.delete_objects(&[object.id.clone()]).await;

        assert_eq!(report.successful, vec![object.id.clone()]);
        assert!(object_repo.get_by_id(&object.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn delete_by_source_uri_removes_the_matching_object() {
        let (db, vs) = test_setup().await;
        let object_repo = ObjectRepository::new(&db);
        let mut object = Object::new(ObjectType::Webpage, "victim");
        object.source_uri = Some("https://example.com/victim".to_string());
        object_repo.create(object.clone()).await.expect("create");

        let orchestrator = DeletionOrchestrator::new(&db, &vs);
        let report = orchestrator.delete_by_source_uri("https://example.com/victim").await;

        assert_eq!(report.successful, vec![object.id.clone()]);
        assert!(object_repo.get_by_id(&object.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn delete_by_source_uri_reports_not_found_for_unknown_uri() {
        let (db, vs) = test_setup().await;
        let orchestrator = DeletionOrchestrator::new(&db, &vs);
        let report = orchestrator.delete_by_source_uri("https://example.com/missing").await;
        assert_eq!(report.not_found, vec!["https://example.com/missing".to_string()]);
    }

    #[tokio::test]
    async fn delete_objects_reports_not_found_for_missing_ids() {
        let (db, vs) = test_setup().await;
        let orchestrator = DeletionOrchestrator::new(&db, &vs);
        let report = orchestrator.delete_objects(&["missing-id".to_string()]).await;
        assert_eq!(report.not_found, vec!["missing-id".to_string()]);
        assert!(report.successful.is_empty());
    }

    #[tokio::test]
    async fn delete_objects_clears_reverse_relationships() {
        let (db, vs) = test_setup().await;
        let object_repo = ObjectRepository::new(&db);

        let mut o1 = Object::new(ObjectType::Note, "o1");
        let o2 = Object::new(ObjectType::Note, "o2");
        o1.object_relationships = Some(
            serde_json::to_value(&ObjectRelationships {
                related: vec![Relationship {
                    to: o2.id.clone(),
                    nature: "cites".to_string(),
                    strength: 0.8,
                    topic_affinity: None,
                    formed: chrono::Utc::now(),
                }],
            })
            .expect("serialize"),
        );
        let mut o2 = o2;
        o2.object_relationships = Some(
            serde_json::to_value(&ObjectRelationships {
                related: vec![Relationship {
                    to: o1.id.clone(),
                    nature: "cites".to_string(),
                    strength: 0.8,
                    topic_affinity: None,
                    formed: chrono::Utc::now(),
                }],
            })
            .expect("serialize"),
        );

        object_repo.create(o1.clone()).await.expect("create o1");
        object_repo.create(o2.clone()).await.expect("create o2");

        let orchestrator = DeletionOrchestrator::new(&db, &vs);
        orchestrator.delete_objects(&[o1.id.clone()]).await;

        let remaining = object_repo.get_by_id(&o2.id).await.expect("get o2").expect("present");
        let relationships =
            ObjectRelationships::parse(remaining.object_relationships.as_ref().expect("blob"))
                .expect("parse");
        assert!(relationships.related.iter().all(|r| r.to != o1.id));
    }
}
