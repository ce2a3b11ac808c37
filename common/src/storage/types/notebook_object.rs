use uuid::Uuid;

use crate::stored_object;

stored_object!(NotebookObject, "notebook_objects", {
    notebook_id: String,
    object_id: String,
    added_at: chrono::DateTime<chrono::Utc>
});

impl NotebookObject {
    pub fn new(notebook_id: impl Into<String>, object_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            notebook_id: notebook_id.into(),
            object_id: object_id.into(),
            added_at: now,
        }
    }
}
