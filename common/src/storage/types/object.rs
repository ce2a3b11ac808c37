use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::vector_store::Layer;
use crate::stored_object;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Webpage,
    Pdf,
    Note,
    TabGroup,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    New,
    Fetched,
    Parsed,
    Embedding,
    Embedded,
    EmbeddingFailed,
    Error,
}

impl ObjectStatus {
    /// True for any status from which an abort transition (`* ->
    /// embedding_failed` or `* -> error`) is still allowed (spec.md §3).
    pub fn is_non_terminal(self) -> bool {
        !matches!(self, Self::EmbeddingFailed | Self::Error)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::EmbeddingFailed | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PropositionType {
    Main,
    Supporting,
    Fact,
    Action,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposition {
    #[serde(rename = "type")]
    pub kind: PropositionType,
    pub content: String,
}

stored_object!(Object, "objects", {
    object_type: ObjectType,
    source_uri: Option<String>,
    title: String,
    status: ObjectStatus,
    cleaned_text: Option<String>,
    parsed_content_json: Option<serde_json::Value>,
    raw_content_ref: Option<String>,
    error_info: Option<String>,
    parsed_at: Option<chrono::DateTime<chrono::Utc>>,
    summary_generated_at: Option<chrono::DateTime<chrono::Utc>>,
    last_accessed_at: Option<chrono::DateTime<chrono::Utc>>,

    summary: Option<String>,
    tags_json: Vec<String>,
    propositions_json: Vec<Proposition>,

    file_hash: Option<String>,
    original_file_name: Option<String>,
    file_size_bytes: Option<i64>,
    file_mime_type: Option<String>,
    internal_file_path: Option<String>,

    object_bio: Option<serde_json::Value>,
    object_relationships: Option<serde_json::Value>,

    child_object_ids: Vec<String>,

    /// The memory layer this object's vector records are written at
    /// (spec.md §3, §4.3). Defaults to `wom` (transient history); an
    /// explicit save/bookmark promotes an object to `lom` at creation
    /// time, which `exists_by_source_uri` uses to distinguish a
    /// bookmarked duplicate from a page only ever seen in passing.
    layer: Layer
});

/// Maximum length retained for any object's `error_info` field (spec.md §9).
pub const MAX_ERROR_INFO_LEN: usize = 1000;

pub fn truncate_error_info(message: &str) -> String {
    if message.len() <= MAX_ERROR_INFO_LEN {
        message.to_string()
    } else {
        let mut truncated: String = message.chars().take(MAX_ERROR_INFO_LEN).collect();
        truncated.push('…');
        truncated
    }
}

impl Object {
    pub fn new(object_type: ObjectType, title: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            object_type,
            source_uri: None,
            title: title.into(),
            status: ObjectStatus::New,
            cleaned_text: None,
            parsed_content_json: None,
            raw_content_ref: None,
            error_info: None,
            parsed_at: None,
            summary_generated_at: None,
            last_accessed_at: None,
            summary: None,
            tags_json: Vec::new(),
            propositions_json: Vec::new(),
            file_hash: None,
            original_file_name: None,
            file_size_bytes: None,
            file_mime_type: None,
            internal_file_path: None,
            object_bio: None,
            object_relationships: None,
            child_object_ids: Vec::new(),
            layer: Layer::Wom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_error_info_caps_length() {
        let long = "x".repeat(MAX_ERROR_INFO_LEN + 50);
        let truncated = truncate_error_info(&long);
        assert!(truncated.chars().count() <= MAX_ERROR_INFO_LEN + 1);
    }

    #[test]
    fn new_object_starts_in_new_status() {
        let obj = Object::new(ObjectType::Webpage, "title");
        assert_eq!(obj.status, ObjectStatus::New);
        assert!(obj.source_uri.is_none());
    }
}
