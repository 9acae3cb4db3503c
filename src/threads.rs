use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::{ItemId, TenantId, ThreadId};
use crate::items::ItemRepository;

/// Marker stored on threads created by the clustering engine.
pub const CREATED_BY_CLUSTERING: &str = "semantic-clustering";

/// A persistent grouping of related items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub tenant_id: TenantId,
    pub title: String,
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    #[serde(default)]
    pub member_ids: Vec<ItemId>,

    pub created_at: DateTime<Utc>,
    pub created_by: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// Audit note explaining why a thread was created automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Average pairwise cosine similarity of the originating cluster
    pub similarity: f32,
    pub member_count: usize,
    pub source_types: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Epsilon the cluster was found with
    pub epsilon: f32,
}

/// Everything needed to create a thread.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub tenant_id: TenantId,
    pub title: String,
    pub description: String,
    pub centroid: Option<Vec<f32>>,
    pub provenance: Option<Provenance>,
}

pub trait ThreadRepository: Send + Sync {
    fn create_thread(
        &self,
        tenant_id: &TenantId,
        title: &str,
        description: &str,
        centroid: Option<&[f32]>,
    ) -> anyhow::Result<ThreadId>;

    /// Current assignment of each requested item. Unknown items map to `None`.
    fn find_thread_assignments_for(
        &self,
        item_ids: &[ItemId],
    ) -> anyhow::Result<HashMap<ItemId, Option<ThreadId>>>;

    fn list_threads(&self, tenant_id: &TenantId) -> anyhow::Result<Vec<Thread>>;
}

/// Store that can write a thread and its member links as one unit.
pub trait RelationshipStore: ItemRepository + ThreadRepository {
    /// Create the thread and link every member, or change nothing at all.
    fn materialize_thread(
        &self,
        thread: NewThread,
        member_ids: &[ItemId],
    ) -> anyhow::Result<ThreadId>;
}
