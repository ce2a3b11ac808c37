use uuid::Uuid;

use crate::stored_object;
use crate::storage::types::object::Proposition;

stored_object!(Chunk, "chunks", {
    object_id: String,
    chunk_idx: i64,
    content: String,
    summary: Option<String>,
    tags_json: Vec<String>,
    propositions_json: Vec<Proposition>,
    token_count: i64
});

/// Minimum length a chunk's `content` must meet to be persisted (spec.md
/// §3, §4.8).
pub const MIN_CHUNK_CONTENT_LEN: usize = 20;

impl Chunk {
    pub fn new(
        object_id: impl Into<String>,
        chunk_idx: i64,
        content: impl Into<String>,
        summary: Option<String>,
        tags_json: Vec<String>,
        propositions_json: Vec<Proposition>,
        token_count: i64,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            object_id: object_id.into(),
            chunk_idx,
            content: content.into(),
            summary,
            tags_json,
            propositions_json,
            token_count,
        }
    }
}
