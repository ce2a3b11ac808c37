//! The Vector Store (spec.md §4.2): an append-mostly columnar store keyed by
//! UUID, holding 1536-dim vectors plus rich metadata, with vector search and
//! predicate filtering.
//!
//! Backed by the same `SurrealDbClient`/SurrealDB engine as the Relational
//! Store (see `DESIGN.md` for why this repo does not pull in a separate
//! vector-database crate), in its own table so the two stores stay logically
//! distinct even though they share a connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;

pub const VECTOR_DIMENSION: usize = 1536;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Chunk,
    Object,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Wom,
    Lom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingDepth {
    Chunk,
    Summary,
    Object,
}

/// One row of the `<prefix>_embeddings` table. Nullable foreign keys use
/// sentinel empty-string/zero values rather than `NULL` to keep the
/// column's inferred type stable across inserts (spec.md §3, §9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: Uuid,
    pub record_type: RecordType,
    pub media_type: String,
    pub layer: Layer,
    pub processing_depth: ProcessingDepth,
    pub vector: Vec<f32>,
    pub content: String,
    #[serde(default)]
    pub object_id: String,
    #[serde(default)]
    pub sql_chunk_id: String,
    #[serde(default)]
    pub chunk_idx: i64,
    #[serde(default)]
    pub notebook_id: String,
    #[serde(default)]
    pub tab_group_id: String,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub source_uri: String,
    pub tags: Vec<String>,
    pub propositions: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed_at: chrono::DateTime<chrono::Utc>,
}

/// Non-empty-array sentinel used when a `VectorRecord`'s `tags` or
/// `propositions` would otherwise be empty, per spec.md §3.
pub const SENTINEL_ARRAY_ELEMENT: &str = "";

fn non_empty(values: Vec<String>) -> Vec<String> {
    if values.is_empty() {
        vec![SENTINEL_ARRAY_ELEMENT.to_string()]
    } else {
        values
    }
}

impl VectorRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record_type: RecordType,
        media_type: impl Into<String>,
        layer: Layer,
        processing_depth: ProcessingDepth,
        vector: Vec<f32>,
        content: impl Into<String>,
        title: impl Into<String>,
        summary: impl Into<String>,
        tags: Vec<String>,
        propositions: Vec<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            record_type,
            media_type: media_type.into(),
            layer,
            processing_depth,
            vector,
            content: content.into(),
            object_id: String::new(),
            sql_chunk_id: String::new(),
            chunk_idx: 0,
            notebook_id: String::new(),
            tab_group_id: String::new(),
            title: title.into(),
            summary: summary.into(),
            source_uri: String::new(),
            tags: non_empty(tags),
            propositions: non_empty(propositions),
            created_at: now,
            last_accessed_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchResult {
    pub record: VectorRecord,
    pub distance: f32,
    pub score: f32,
}

/// Closed filter language for `VectorStore::filter` (spec.md §4.2).
#[derive(Debug, Clone, Default)]
pub struct VsFilter {
    pub layer: Vec<Layer>,
    pub processing_depth: Vec<ProcessingDepth>,
    pub media_type: Vec<String>,
    pub object_id: Vec<String>,
    pub notebook_id: Option<String>,
    pub tab_group_id: Option<String>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
    pub title_contains: Option<String>,
    pub content_contains: Option<String>,
    pub custom_where: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub k: usize,
    pub filter: VsFilter,
}

/// Caller-supplied embedding hook so the Vector Store can offer
/// `*_with_text` convenience methods without the `common` crate depending
/// on the AI Gateway crate (which itself depends on `common`).
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
}

/// Escapes a string literal for inline SurrealQL by doubling single quotes
/// (spec.md §4.2).
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn quoted_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", escape_literal(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds the WHERE clause fragment (without the leading `WHERE`) for a
/// [`VsFilter`]. Identifiers are fixed, known-safe column names; all values
/// are escaped or parameterized.
fn build_where_clause(filter: &VsFilter) -> Option<String> {
    let mut clauses = Vec::new();

    if !filter.layer.is_empty() {
        let values: Vec<String> = filter
            .layer
            .iter()
            .map(|l| match l {
                Layer::Wom => "wom".to_string(),
                Layer::Lom => "lom".to_string(),
            })
            .collect();
        clauses.push(format!("`layer` IN [{}]", quoted_list(&values)));
    }
    if !filter.processing_depth.is_empty() {
        let values: Vec<String> = filter
            .processing_depth
            .iter()
            .map(|d| match d {
                ProcessingDepth::Chunk => "chunk".to_string(),
                ProcessingDepth::Summary => "summary".to_string(),
                ProcessingDepth::Object => "object".to_string(),
            })
            .collect();
        clauses.push(format!("`processing_depth` IN [{}]", quoted_list(&values)));
    }
    if !filter.media_type.is_empty() {
        clauses.push(format!("`media_type` IN [{}]", quoted_list(&filter.media_type)));
    }
    if !filter.object_id.is_empty() {
        clauses.push(format!("`object_id` IN [{}]", quoted_list(&filter.object_id)));
    }
    if let Some(notebook_id) = &filter.notebook_id {
        clauses.push(format!("`notebook_id` = '{}'", escape_literal(notebook_id)));
    }
    if let Some(tab_group_id) = &filter.tab_group_id {
        clauses.push(format!("`tab_group_id` = '{}'", escape_literal(tab_group_id)));
    }
    if let Some(after) = filter.created_after {
        clauses.push(format!("`created_at` > '{}'", after.to_rfc3339()));
    }
    if let Some(before) = filter.created_before {
        clauses.push(format!("`created_at` < '{}'", before.to_rfc3339()));
    }
    if let Some(needle) = &filter.title_contains {
        clauses.push(format!("string::contains(`title`, '{}')", escape_literal(needle)));
    }
    if let Some(needle) = &filter.content_contains {
        clauses.push(format!("string::contains(`content`, '{}')", escape_literal(needle)));
    }
    if let Some(custom) = &filter.custom_where {
        clauses.push(format!("({custom})"));
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

pub struct VectorStore {
    db: SurrealDbClient,
    table: String,
}

impl VectorStore {
    pub fn new(db: SurrealDbClient, prefix: &str) -> Self {
        Self {
            db,
            table: format!("{prefix}_embeddings"),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Defines the HNSW vector index. Implementations that pre-declare
    /// schemas (as this one does, via `DEFINE INDEX`) can skip the
    /// insert-then-delete sentinel-row trick spec.md §9 describes as a
    /// workaround for columnar stores with pure type inference.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        let query = format!(
            "DEFINE INDEX IF NOT EXISTS idx_{table}_vector ON TABLE {table} FIELDS vector HNSW DIMENSION {dim} DIST COSINE TYPE F32;
             DEFINE INDEX IF NOT EXISTS idx_{table}_object ON TABLE {table} FIELDS object_id;
             DEFINE INDEX IF NOT EXISTS idx_{table}_notebook ON TABLE {table} FIELDS notebook_id;
             DEFINE INDEX IF NOT EXISTS idx_{table}_tab_group ON TABLE {table} FIELDS tab_group_id;",
            table = self.table,
            dim = VECTOR_DIMENSION,
        );
        self.db.query(query).await?;
        info!(table = %self.table, "vector store schema ready");
        Ok(())
    }

    /// Appends records and returns their ids in input order (spec.md
    /// §4.2).
    pub async fn add_documents(&self, records: Vec<VectorRecord>) -> Result<Vec<Uuid>, AppError> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(record.id);
            let thing_id = record.id.to_string();
            self.db
                .client
                .create::<Option<VectorRecord>>((self.table.as_str(), thing_id.as_str()))
                .content(record)
                .await
                .map_err(AppError::Storage)?;
        }
        Ok(ids)
    }

    /// As `add_documents`, but embeds `texts` via the caller-supplied
    /// embedder first. Fails if `texts.len() != metas.len()`.
    pub async fn add_documents_with_text(
        &self,
        texts: Vec<String>,
        mut metas: Vec<VectorRecord>,
        embedder: &dyn TextEmbedder,
    ) -> Result<Vec<Uuid>, AppError> {
        if texts.len() != metas.len() {
            return Err(AppError::Validation(
                "add_documents_with_text: texts/metas length mismatch".to_string(),
            ));
        }
        let vectors = embedder.embed_batch(&texts).await?;
        for (meta, vector) in metas.iter_mut().zip(vectors.into_iter()) {
            meta.vector = vector;
        }
        self.add_documents(metas).await
    }

    /// Returns up to `k` results sorted by ascending distance, with a
    /// deterministic lexicographic tie-break on id (spec.md §4.2).
    pub async fn query_similar_by_vector(
        &self,
        v: &[f32],
        opts: &QueryOpts,
    ) -> Result<Vec<VectorSearchResult>, AppError> {
        let where_clause = build_where_clause(&opts.filter)
            .map(|w| format!("AND {w}"))
            .unwrap_or_default();

        let overfetch = opts.k.max(1) * 4;
        let sql = format!(
            "SELECT *, vector::distance::knn() AS distance FROM {table}
             WHERE vector <|{overfetch},100|> $query_vector {where_clause}
             ORDER BY distance ASC, id ASC
             LIMIT {k};",
            table = self.table,
            k = opts.k,
        );

        let mut response = self
            .db
            .query(sql)
            .bind(("query_vector", v.to_vec()))
            .await
            .map_err(AppError::Storage)?;

        #[derive(Deserialize)]
        struct Row {
            #[serde(flatten)]
            record: VectorRecord,
            distance: f32,
        }

        let rows: Vec<Row> = response.take(0).map_err(AppError::Storage)?;
        Ok(rows
            .into_iter()
            .map(|r| VectorSearchResult {
                score: 1.0 - r.distance,
                distance: r.distance,
                record: r.record,
            })
            .collect())
    }

    pub async fn query_similar_by_text(
        &self,
        query: &str,
        opts: &QueryOpts,
        embedder: &dyn TextEmbedder,
    ) -> Result<Vec<VectorSearchResult>, AppError> {
        let vector = embedder
            .embed_batch(std::slice::from_ref(&query.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::AITransport("empty embedding response".to_string(), "query_similar_by_text".to_string()))?;
        self.query_similar_by_vector(&vector, opts).await
    }

    /// Removes vectors whose id is in `ids`. Idempotent — missing ids are
    /// silently ignored (spec.md §4.2).
    pub async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<(), AppError> {
        for id in ids {
            let _: Option<VectorRecord> = self
                .db
                .client
                .delete((self.table.as_str(), id.to_string().as_str()))
                .await
                .map_err(AppError::Storage)?;
        }
        Ok(())
    }

    /// Read-all-with-`object_id`, delete, re-insert with patched fields.
    /// The caller is responsible for serializing concurrent calls for the
    /// same `object_id` (spec.md §4.2, §5).
    pub async fn update_metadata(
        &self,
        object_id: &str,
        patch: impl Fn(&mut VectorRecord) + Send,
    ) -> Result<usize, AppError> {
        let existing = self
            .filter(&VsFilter {
                object_id: vec![object_id.to_string()],
                ..Default::default()
            })
            .await?;

        if existing.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = existing.iter().map(|r| r.id).collect();
        self.delete_by_ids(&ids).await?;

        let mut patched = existing;
        for record in &mut patched {
            patch(record);
        }
        let count = patched.len();
        self.add_documents(patched).await?;
        Ok(count)
    }

    /// Scans with a structured WHERE built from the closed filter
    /// language (spec.md §4.2).
    pub async fn filter(&self, filter: &VsFilter) -> Result<Vec<VectorRecord>, AppError> {
        let where_clause = build_where_clause(filter)
            .map(|w| format!("WHERE {w}"))
            .unwrap_or_default();
        let sql = format!("SELECT * FROM {table} {where_clause};", table = self.table);
        let mut response = self.db.query(sql).await.map_err(AppError::Storage)?;
        response.take(0).map_err(AppError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::SurrealDbClient;

    struct StubEmbedder;

    #[async_trait]
    impl TextEmbedder for StubEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.1_f32; VECTOR_DIMENSION]).collect())
        }
    }

    async fn test_store() -> VectorStore {
        let db = SurrealDbClient::memory("vs_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        let store = VectorStore::new(db, "test");
        store.ensure_schema().await.expect("schema");
        store
    }

    #[test]
    fn escape_literal_doubles_single_quotes() {
        assert_eq!(escape_literal("O'Brien"), "O''Brien");
    }

    #[test]
    fn build_where_clause_combines_predicates() {
        let filter = VsFilter {
            layer: vec![Layer::Wom],
            object_id: vec!["obj-1".to_string(), "obj-2".to_string()],
            ..Default::default()
        };
        let clause = build_where_clause(&filter).expect("clause");
        assert!(clause.contains("`layer` IN ['wom']"));
        assert!(clause.contains("`object_id` IN ['obj-1', 'obj-2']"));
        assert!(clause.contains(" AND "));
    }

    #[test]
    fn build_where_clause_empty_filter_is_none() {
        assert!(build_where_clause(&VsFilter::default()).is_none());
    }

    #[tokio::test]
    async fn add_documents_preserves_input_order_of_ids() {
        let store = test_store().await;
        let a = VectorRecord::new(
            RecordType::Chunk,
            "text",
            Layer::Wom,
            ProcessingDepth::Chunk,
            vec![0.0; VECTOR_DIMENSION],
            "content a",
            "title a",
            "summary a",
            vec![],
            vec![],
        );
        let b = VectorRecord::new(
            RecordType::Chunk,
            "text",
            Layer::Wom,
            ProcessingDepth::Chunk,
            vec![0.0; VECTOR_DIMENSION],
            "content b",
            "title b",
            "summary b",
            vec![],
            vec![],
        );
        let ids = store
            .add_documents(vec![a.clone(), b.clone()])
            .await
            .expect("add");
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn delete_by_ids_is_idempotent_for_missing_ids() {
        let store = test_store().await;
        let missing = Uuid::new_v4();
        store.delete_by_ids(&[missing]).await.expect("delete missing");
    }

    #[tokio::test]
    async fn filter_by_object_id_round_trips() {
        let store = test_store().await;
        let mut record = VectorRecord::new(
            RecordType::Chunk,
            "text",
            Layer::Wom,
            ProcessingDepth::Chunk,
            vec![0.2; VECTOR_DIMENSION],
            "content",
            "title",
            "summary",
            vec!["t1".to_string()],
            vec!["p1".to_string()],
        );
        record.object_id = "obj-42".to_string();
        store.add_documents(vec![record.clone()]).await.expect("add");

        let found = store
            .filter(&VsFilter {
                object_id: vec!["obj-42".to_string()],
                ..Default::default()
            })
            .await
            .expect("filter");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, record.id);
    }
}
