use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::{ItemId, TenantId, ThreadId};

/// A work item ingested from an external tool (issue, design, message, page...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub tenant_id: TenantId,

    /// Integration the item came from, e.g. "design", "code", "chat"
    #[serde(default)]
    pub source_type: String,

    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Item {
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }
}

/// Access to upstream-owned items. Implementations must return embeddings
/// alongside items whenever they are stored.
pub trait ItemRepository: Send + Sync {
    /// Items created at or after `window_start`, newest first, capped at `limit`.
    /// `None` for `tenant_id` spans every tenant.
    fn fetch_recent_items(
        &self,
        tenant_id: Option<&TenantId>,
        window_start: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Item>>;

    /// Point `item_ids` at `thread_id`, or clear their assignment with `None`.
    fn set_thread_assignment(
        &self,
        item_ids: &[ItemId],
        thread_id: Option<&ThreadId>,
    ) -> anyhow::Result<()>;

    /// Persist freshly computed embeddings.
    fn store_embeddings(&self, embeddings: &[(ItemId, Vec<f32>)]) -> anyhow::Result<()>;
}
