//! Embedding and similarity infrastructure for work items.
//!
//! # Architecture
//!
//! - `embeddings`: provider clients (OpenAI-compatible HTTP, local fastembed)
//! - `embedder`: adapter turning provider failures into absent embeddings
//! - `preprocess`: text preparation for embedding input
//! - `similarity`: cosine similarity / distance and vector validation
//! - `lexical`: keyword matching for the degraded search path
//! - `search`: semantic search service with keyword fallback

mod embedder;
pub mod embeddings;
pub mod lexical;
pub mod preprocess;
mod search;
pub mod similarity;

pub use embedder::Embedder;
pub use embeddings::{EmbeddingError, EmbeddingProvider};
pub use preprocess::item_text;
pub use search::{
    EntityKind, EntityRef, SearchCorpus, SearchDocument, SearchMetadata, SearchOptions,
    SearchResponse, SearchResult, SearchType, SemanticSearchService,
};
pub use similarity::{cosine_distance, cosine_similarity, SimilarityError};
