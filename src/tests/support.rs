//! Shared fixtures and test doubles.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::clustering::Cluster;
use crate::config::EmbeddingConfig;
use crate::eid::{Eid, ItemId, TenantId, ThreadId};
use crate::items::{Item, ItemRepository};
use crate::semantic::similarity::centroid;
use crate::semantic::{
    EmbeddingError, EmbeddingProvider, EntityKind, EntityRef, SearchCorpus, SearchDocument,
};
use crate::store::CsvStore;
use crate::threads::{NewThread, RelationshipStore, Thread, ThreadRepository};

/// Topic words mapped to one axis each; the last axis is a constant bias.
pub const TOPICS: [&str; 3] = ["checkout", "login", "invoice"];
pub const DIMS: usize = TOPICS.len() + 1;

/// Deterministic "embedding": how often each topic word occurs.
pub fn topic_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v: Vec<f32> = TOPICS
        .iter()
        .map(|topic| lower.matches(topic).count() as f32)
        .collect();
    v.push(0.05);
    v
}

pub struct TopicProvider;

impl EmbeddingProvider for TopicProvider {
    fn name(&self) -> &str {
        "topics"
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| topic_vector(t)).collect())
    }
}

/// Panics on any text mentioning "boom".
pub struct PanickingProvider;

impl EmbeddingProvider for PanickingProvider {
    fn name(&self) -> &str {
        "panicking"
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.contains("boom")) {
            panic!("provider blew up");
        }
        Ok(texts.iter().map(|t| topic_vector(t)).collect())
    }
}

pub fn topic_embedder() -> Arc<crate::semantic::Embedder> {
    Arc::new(crate::semantic::Embedder::new(
        Some(Arc::new(TopicProvider)),
        DIMS,
        &EmbeddingConfig::default(),
    ))
}

pub fn disabled_embedder() -> Arc<crate::semantic::Embedder> {
    Arc::new(crate::semantic::Embedder::disabled(&EmbeddingConfig::default()))
}

pub fn item(tenant: &str, title: &str, source_type: &str, embedding: Option<Vec<f32>>) -> Item {
    Item {
        id: Eid::new(),
        tenant_id: Eid::from(tenant),
        source_type: source_type.to_string(),
        title: title.to_string(),
        description: String::new(),
        embedding,
        thread_id: None,
        created_at: Utc::now(),
    }
}

/// Item embedded with [`topic_vector`] of its title.
pub fn topic_item(tenant: &str, title: &str, source_type: &str) -> Item {
    item(tenant, title, source_type, Some(topic_vector(title)))
}

pub fn aged(mut item: Item, created_at: DateTime<Utc>) -> Item {
    item.created_at = created_at;
    item
}

pub fn fresh_store() -> (Arc<CsvStore>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let store = CsvStore::load(tmp.path()).unwrap();
    (Arc::new(store), tmp)
}

pub fn seeded_store(items: &[Item]) -> (Arc<CsvStore>, tempfile::TempDir) {
    let (store, tmp) = fresh_store();
    store.import_items(items.to_vec()).unwrap();
    (store, tmp)
}

/// Cluster over `members` as the clustering step would hand it out.
pub fn cluster_of(title: &str, members: Vec<Item>) -> Cluster {
    let centroid = centroid(members.iter().filter_map(|m| m.embedding.as_deref()))
        .unwrap()
        .unwrap_or_default();
    Cluster {
        id: 0,
        members,
        centroid,
        average_similarity: 0.97,
        title: title.to_string(),
        keywords: vec![title.to_lowercase()],
    }
}

pub fn ids(items: &[Item]) -> Vec<ItemId> {
    items.iter().map(|i| i.id.clone()).collect()
}

/// Corpus whose vector path is down while its text path works.
pub struct VectorOutageCorpus {
    pub documents: Vec<SearchDocument>,
}

impl SearchCorpus for VectorOutageCorpus {
    fn embedded_documents(&self, _: &TenantId, _: &[EntityKind]) -> anyhow::Result<Vec<SearchDocument>> {
        Err(anyhow!("vector index unavailable"))
    }

    fn text_documents(&self, _: &TenantId, _: &[EntityKind]) -> anyhow::Result<Vec<SearchDocument>> {
        Ok(self.documents.clone())
    }
}

pub fn text_document(title: &str, description: &str) -> SearchDocument {
    SearchDocument {
        entity: EntityRef::Item(Eid::new()),
        title: title.to_string(),
        description: description.to_string(),
        embedding: None,
    }
}

/// Store that refuses to materialize threads with a given title.
pub struct FlakyStore {
    pub inner: Arc<CsvStore>,
    pub fail_title: String,
}

impl ItemRepository for FlakyStore {
    fn fetch_recent_items(
        &self,
        tenant_id: Option<&TenantId>,
        window_start: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Item>> {
        self.inner.fetch_recent_items(tenant_id, window_start, limit)
    }

    fn set_thread_assignment(&self, item_ids: &[ItemId], thread_id: Option<&ThreadId>) -> anyhow::Result<()> {
        self.inner.set_thread_assignment(item_ids, thread_id)
    }

    fn store_embeddings(&self, embeddings: &[(ItemId, Vec<f32>)]) -> anyhow::Result<()> {
        self.inner.store_embeddings(embeddings)
    }
}

impl ThreadRepository for FlakyStore {
    fn create_thread(
        &self,
        tenant_id: &TenantId,
        title: &str,
        description: &str,
        centroid: Option<&[f32]>,
    ) -> anyhow::Result<ThreadId> {
        self.inner.create_thread(tenant_id, title, description, centroid)
    }

    fn find_thread_assignments_for(
        &self,
        item_ids: &[ItemId],
    ) -> anyhow::Result<HashMap<ItemId, Option<ThreadId>>> {
        self.inner.find_thread_assignments_for(item_ids)
    }

    fn list_threads(&self, tenant_id: &TenantId) -> anyhow::Result<Vec<Thread>> {
        self.inner.list_threads(tenant_id)
    }
}

impl RelationshipStore for FlakyStore {
    fn materialize_thread(&self, thread: NewThread, member_ids: &[ItemId]) -> anyhow::Result<ThreadId> {
        if thread.title == self.fail_title {
            return Err(anyhow!("database connection reset"));
        }
        self.inner.materialize_thread(thread, member_ids)
    }
}
