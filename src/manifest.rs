use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

/// One opaque unit of work. The payload itself never enters the scheduler;
/// `payload_ref` is a content-addressable handle resolved by the executing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub payload_ref: String,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload_ref: payload_ref.into(),
        }
    }
}

/// Retention policy attached to a manifest at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Discard as soon as the result is delivered.
    Ephemeral,
    Standard,
    Extended,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Standard
    }
}

/// The privacy/boundary envelope around a work item. Created once at
/// submission and immutable thereafter; the scheduler only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub item_id: String,
    pub payload_ref: String,
    /// xxh3 hash over the item identity and payload handle.
    pub content_hash: u128,
    pub access_tags: Vec<String>,
    pub retention: RetentionPolicy,
    pub anonymized: bool,
    pub created_at: DateTime<Utc>,
}

impl JobManifest {
    /// Wrap a work item into its dispatch envelope.
    pub fn wrap(item: &WorkItem) -> Self {
        Self::wrap_with(item, Vec::new(), RetentionPolicy::default(), false)
    }

    pub fn wrap_with(
        item: &WorkItem,
        access_tags: Vec<String>,
        retention: RetentionPolicy,
        anonymized: bool,
    ) -> Self {
        let mut buf = Vec::with_capacity(item.id.len() + item.payload_ref.len() + 1);
        buf.extend_from_slice(item.id.as_bytes());
        buf.push(0);
        buf.extend_from_slice(item.payload_ref.as_bytes());

        Self {
            item_id: item.id.clone(),
            payload_ref: item.payload_ref.clone(),
            content_hash: xxh3_128(&buf),
            access_tags,
            retention,
            anonymized,
            created_at: Utc::now(),
        }
    }
}
