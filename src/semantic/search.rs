//! Semantic search with transparent keyword fallback.
//!
//! The query is embedded and compared against stored embeddings. When the
//! embedding cannot be produced, or the nearest-neighbour step fails, the same
//! request is answered by keyword matching instead. Callers never see an
//! error; `SearchMetadata::search_type` tells them which path answered.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::eid::{ItemId, TenantId, ThreadId};
use crate::semantic::embedder::Embedder;
use crate::semantic::lexical::score_keywords;
use crate::semantic::similarity::cosine_distance;

/// Reference to a searchable entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Item(ItemId),
    Thread(ThreadId),
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Item(_) => EntityKind::Item,
            EntityRef::Thread(_) => EntityKind::Thread,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Item,
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Semantic,
    Keyword,
}

/// A searchable record as handed out by the store.
#[derive(Debug, Clone)]
pub struct SearchDocument {
    pub entity: EntityRef,
    pub title: String,
    pub description: String,
    pub embedding: Option<Vec<f32>>,
}

/// Where search candidates come from.
pub trait SearchCorpus: Send + Sync {
    /// Documents that carry an embedding, for nearest-neighbour filtering.
    fn embedded_documents(
        &self,
        tenant_id: &TenantId,
        kinds: &[EntityKind],
    ) -> anyhow::Result<Vec<SearchDocument>>;

    /// All documents, for keyword matching.
    fn text_documents(
        &self,
        tenant_id: &TenantId,
        kinds: &[EntityKind],
    ) -> anyhow::Result<Vec<SearchDocument>>;
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub tenant_id: TenantId,
    /// Falls back to `search.default_limit`
    pub limit: Option<usize>,
    /// Cosine distance cutoff, falls back to `search.similarity_threshold`
    pub threshold: Option<f32>,
    /// Empty means every kind
    pub kinds: Vec<EntityKind>,
}

impl SearchOptions {
    pub fn for_tenant(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            limit: None,
            threshold: None,
            kinds: vec![],
        }
    }

    pub fn wants(&self, kind: EntityKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub entity: EntityRef,
    pub title: String,
    /// Cosine similarity for semantic hits, 0 for keyword hits
    pub score: f32,
    pub search_type: SearchType,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchMetadata {
    pub query: String,
    pub result_count: usize,
    pub execution_time_ms: f64,
    pub search_type: SearchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub metadata: SearchMetadata,
}

pub struct SemanticSearchService {
    embedder: Arc<Embedder>,
    corpus: Arc<dyn SearchCorpus>,
    config: SearchConfig,
}

impl SemanticSearchService {
    pub fn new(embedder: Arc<Embedder>, corpus: Arc<dyn SearchCorpus>, config: SearchConfig) -> Self {
        Self {
            embedder,
            corpus,
            config,
        }
    }

    pub fn search(&self, query: &str, options: &SearchOptions) -> SearchResponse {
        let started = Instant::now();
        let limit = options.limit.unwrap_or(self.config.default_limit);

        let (results, search_type, fallback_reason) = match self.embedder.embed(query) {
            None => {
                log::debug!("query embedding unavailable, using keyword search");
                let results = self.keyword_search(query, options, limit);
                (results, SearchType::Keyword, Some("query embedding unavailable".to_string()))
            }
            Some(query_embedding) => match self.nearest_neighbors(&query_embedding, options, limit) {
                Ok(results) => (results, SearchType::Semantic, None),
                Err(e) => {
                    log::warn!(
                        "semantic search failed for tenant {}, falling back to keyword search: {e:#}",
                        options.tenant_id
                    );
                    let results = self.keyword_search(query, options, limit);
                    (results, SearchType::Keyword, Some(e.to_string()))
                }
            },
        };

        let metadata = SearchMetadata {
            query: query.to_string(),
            result_count: results.len(),
            execution_time_ms: started.elapsed().as_micros() as f64 / 1000.0,
            search_type,
            fallback_reason,
        };

        log::debug!(
            "search {:?} -> {} results ({:?}, {}ms)",
            metadata.query,
            metadata.result_count,
            metadata.search_type,
            metadata.execution_time_ms
        );

        SearchResponse { results, metadata }
    }

    /// Keep candidates strictly closer than the threshold, nearest first.
    fn nearest_neighbors(
        &self,
        query: &[f32],
        options: &SearchOptions,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let threshold = options.threshold.unwrap_or(self.config.similarity_threshold);
        let documents = self
            .corpus
            .embedded_documents(&options.tenant_id, &options.kinds)?;

        let mut scored: Vec<(f32, SearchDocument)> = Vec::with_capacity(documents.len());
        for doc in documents.into_iter().filter(|d| options.wants(d.entity.kind())) {
            let Some(embedding) = doc.embedding.as_deref() else {
                continue;
            };
            let distance = cosine_distance(query, embedding)?;
            if distance < threshold {
                scored.push((distance, doc));
            }
        }

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(distance, doc)| SearchResult {
                entity: doc.entity,
                title: doc.title,
                score: 1.0 - distance,
                search_type: SearchType::Semantic,
            })
            .collect())
    }

    fn keyword_search(&self, query: &str, options: &SearchOptions, limit: usize) -> Vec<SearchResult> {
        let found = self.corpus.text_documents(&options.tenant_id, &options.kinds);
        let documents: Vec<SearchDocument> = match found {
            Ok(docs) => docs
                .into_iter()
                .filter(|d| options.wants(d.entity.kind()))
                .collect(),
            Err(e) => {
                log::error!("keyword search failed for tenant {}: {e:#}", options.tenant_id);
                return vec![];
            }
        };

        let keyed: Vec<(usize, &str, &str)> = documents
            .iter()
            .enumerate()
            .map(|(idx, doc)| (idx, doc.title.as_str(), doc.description.as_str()))
            .collect();

        score_keywords(query, &keyed)
            .into_iter()
            .take(limit)
            .map(|m| {
                let doc = &documents[m.key];
                SearchResult {
                    entity: doc.entity.clone(),
                    title: doc.title.clone(),
                    score: 0.0,
                    search_type: SearchType::Keyword,
                }
            })
            .collect()
    }
}
