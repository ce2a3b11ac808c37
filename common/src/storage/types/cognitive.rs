//! Tagged-sum-type views over the opaque `object_bio` / `object_relationships`
//! JSON blobs carried on [`super::object::Object`]. Parse failures downgrade
//! to `None` with a logged warning rather than propagating, per spec.md §9.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObjectBio {
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub events: Vec<BioEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BioEvent {
    pub what: String,
    #[serde(rename = "withWhom")]
    pub with_whom: Vec<String>,
    pub resulted: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObjectRelationships {
    pub related: Vec<Relationship>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub to: String,
    pub nature: String,
    pub strength: f32,
    #[serde(rename = "topicAffinity", skip_serializing_if = "Option::is_none")]
    pub topic_affinity: Option<String>,
    pub formed: DateTime<Utc>,
}

impl ObjectBio {
    /// Parses a raw `object_bio` JSON blob, downgrading any schema
    /// violation to `None` with a warning instead of surfacing an error.
    pub fn parse(raw: &serde_json::Value) -> Option<Self> {
        match serde_json::from_value(raw.clone()) {
            Ok(bio) => Some(bio),
            Err(err) => {
                warn!(error = %err, "discarding malformed object_bio blob");
                None
            }
        }
    }
}

impl ObjectRelationships {
    pub fn parse(raw: &serde_json::Value) -> Option<Self> {
        match serde_json::from_value(raw.clone()) {
            Ok(rel) => Some(rel),
            Err(err) => {
                warn!(error = %err, "discarding malformed object_relationships blob");
                None
            }
        }
    }

    /// Removes every relationship entry pointing at `target`, used by the
    /// Deletion Orchestrator's reverse-relationship cleanup (spec.md §4.11
    /// step 2b). Only inspects this object's own relationships, not
    /// transitive ones — matches source behavior per spec.md §9.
    pub fn remove_relationship(&mut self, target: &str) -> bool {
        let before = self.related.len();
        self.related.retain(|r| r.to != target);
        self.related.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_bio_parses_to_none() {
        let raw = serde_json::json!({"not": "a bio"});
        assert!(ObjectBio::parse(&raw).is_none());
    }

    #[test]
    fn remove_relationship_drops_matching_entries_only() {
        let mut rel = ObjectRelationships {
            related: vec![
                Relationship {
                    to: "obj:1".into(),
                    nature: "cites".into(),
                    strength: 0.5,
                    topic_affinity: None,
                    formed: Utc::now(),
                },
                Relationship {
                    to: "obj:2".into(),
                    nature: "cites".into(),
                    strength: 0.2,
                    topic_affinity: None,
                    formed: Utc::now(),
                },
            ],
        };

        let changed = rel.remove_relationship("obj:1");
        assert!(changed);
        assert_eq!(rel.related.len(), 1);
        assert_eq!(rel.related[0].to, "obj:2");
    }
}
