use uuid::Uuid;

use crate::stored_object;

stored_object!(EmbeddingLink, "embedding_links", {
    chunk_id: String,
    model: String,
    vector_id: String
});

impl EmbeddingLink {
    pub fn new(chunk_id: impl Into<String>, model: impl Into<String>, vector_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            chunk_id: chunk_id.into(),
            model: model.into(),
            vector_id: vector_id.into(),
        }
    }
}
