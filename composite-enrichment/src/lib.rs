//! Composite Enrichment (spec.md §4.10): debounced roll-up of a `tab_group`
//! parent's TSTP from its children, with a companion summary vector.
//!
//! `schedule(object_id)` collapses repeat calls within a 5s window into a
//! single execution by replacing any pending timer for that id, mirroring
//! how the Ingestion Queue and Chunking Pipeline are both driven by a tick
//! rather than an internal loop — here the "tick" is just delayed by a
//! per-id debounce instead of a shared scheduler.

#![allow(clippy::missing_docs_in_private_items)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        repositories::object_repository::{ObjectPatch, ObjectRepository},
        types::object::{Object, ObjectType},
        vector_store::{Layer, ProcessingDepth, RecordType, VectorRecord, VectorStore, VsFilter},
    },
};
use ingestion_pipeline::ai_gateway::{AiGateway, ChildBrief};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
};
use tracing::{info, instrument, warn};

/// Minimum number of children a `tab_group` must have before enrichment
/// runs at all (spec.md §4.10 step 1).
const MIN_CHILDREN: usize = 3;

pub struct CompositeEnrichment {
    db: Arc<SurrealDbClient>,
    vector_store: Arc<VectorStore>,
    ai_gateway: Arc<AiGateway>,
    debounce: Duration,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CompositeEnrichment {
    pub fn new(
        db: Arc<SurrealDbClient>,
        vector_store: Arc<VectorStore>,
        ai_gateway: Arc<AiGateway>,
        debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            vector_store,
            ai_gateway,
            debounce,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces any pending timer for `object_id` with a fresh one (spec.md
    /// §4.10, §5: "cancelled by replacing its pending timer on rescheduling").
    pub async fn schedule(self: &Arc<Self>, object_id: impl Into<String>) {
        let object_id = object_id.into();
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.remove(&object_id) {
            handle.abort();
        }

        let enrichment = Arc::clone(self);
        let debounce = self.debounce;
        let scheduled_id = object_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            enrichment.pending.lock().await.remove(&scheduled_id);
            if let Err(err) = enrichment.run(&scheduled_id).await {
                warn!(object_id = %scheduled_id, error = %err, "composite enrichment run failed");
            }
        });
        pending.insert(object_id, handle);
    }

    #[instrument(skip(self), fields(object_id = %object_id))]
    async fn run(&self, object_id: &str) -> Result<(), AppError> {
        let object_repo = ObjectRepository::new(&self.db);
        let Some(parent) = object_repo.get_by_id(object_id).await? else {
            return Ok(());
        };

        // Step 1.
        if parent.object_type != ObjectType::TabGroup || parent.child_object_ids.len() < MIN_CHILDREN {
            return Ok(());
        }

        // Step 2.
        let mut children = Vec::with_capacity(parent.child_object_ids.len());
        for child_id in &parent.child_object_ids {
            if let Some(child) = object_repo.get_by_id(child_id).await? {
                children.push(to_child_brief(&child));
            }
        }

        // Step 3.
        let summary = match self
            .ai_gateway
            .generate_composite_summary(&children, &parent.title, &parent.id)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                info!(object_id = %parent.id, error = %err, "composite summary failed validation; parent TSTP unchanged");
                return Ok(());
            }
        };

        // Step 4: persist parent TSTP.
        let tags = summary.tags.clone();
        let propositions = summary
            .propositions
            .iter()
            .map(|p| common::storage::types::object::Proposition {
                kind: match p.kind {
                    ingestion_pipeline::ai_gateway::PropositionType::Main => {
                        common::storage::types::object::PropositionType::Main
                    }
                    ingestion_pipeline::ai_gateway::PropositionType::Supporting => {
                        common::storage::types::object::PropositionType::Supporting
                    }
                    ingestion_pipeline::ai_gateway::PropositionType::Fact => {
                        common::storage::types::object::PropositionType::Fact
                    }
                    ingestion_pipeline::ai_gateway::PropositionType::Action => {
                        common::storage::types::object::PropositionType::Action
                    }
                },
                content: p.content.clone(),
            })
            .collect::<Vec<_>>();

        object_repo
            .update(
                &parent.id,
                ObjectPatch {
                    title: Some(summary.title.clone()),
                    summary: Some(summary.summary.clone()),
                    tags_json: Some(tags.clone()),
                    propositions_json: Some(propositions.clone()),
                    ..Default::default()
                },
            )
            .await?;

        // Step 4: upsert the parent summary vector.
        self.upsert_parent_vector(&parent, &summary.summary, &tags, &propositions).await?;

        info!(object_id = %parent.id, "composite enrichment updated parent TSTP");
        Ok(())
    }

    async fn upsert_parent_vector(
        &self,
        parent: &Object,
        summary: &str,
        tags: &[String],
        propositions: &[common::storage::types::object::Proposition],
    ) -> Result<(), AppError> {
        let existing = self
            .vector_store
            .filter(&VsFilter {
                object_id: vec![parent.id.clone()],
                processing_depth: vec![ProcessingDepth::Summary],
                ..Default::default()
            })
            .await?;
        if !existing.is_empty() {
            let ids: Vec<_> = existing.iter().map(|r| r.id).collect();
            self.vector_store.delete_by_ids(&ids).await?;
        }

        let vector = self
            .ai_gateway
            .embed(std::slice::from_ref(&summary.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::VectorStore("composite summary embedding returned no vector".to_string()))?;

        let mut record = VectorRecord::new(
            RecordType::Object,
            "tab_group",
            Layer::Wom,
            ProcessingDepth::Summary,
            vector,
            summary,
            parent.title.clone(),
            summary,
            tags.to_vec(),
            propositions.iter().map(|p| p.content.clone()).collect(),
        );
        record.object_id = parent.id.clone();
        self.vector_store.add_documents(vec![record]).await?;
        Ok(())
    }
}

fn to_child_brief(child: &Object) -> ChildBrief {
    ChildBrief {
        id: child.id.clone(),
        title: child.title.clone(),
        summary: child.summary.clone(),
        tags: child.tags_json.clone(),
        propositions: child.propositions_json.iter().map(|p| p.content.clone()).collect(),
    }
}
