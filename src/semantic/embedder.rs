//! Embedding adapter with "absent, not error" semantics.
//!
//! - Blank input yields `None` without touching the provider
//! - Input is cut to the configured character budget
//! - Batches keep input order; a failing input only blanks its own slot
//! - A provider-wide outage, or no provider at all, blanks every slot
//! - The missing-provider condition is logged once per process, not per call

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::semantic::embeddings::{EmbeddingError, EmbeddingProvider, OpenAiProvider};
use crate::semantic::preprocess::truncate_chars;
use crate::semantic::similarity::validate_vector;

pub struct Embedder {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    dimensions: usize,
    max_input_chars: usize,
    batch_size: usize,
    unavailable_logged: AtomicBool,
}

impl Embedder {
    pub fn new(
        provider: Option<Arc<dyn EmbeddingProvider>>,
        dimensions: usize,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            provider,
            dimensions,
            max_input_chars: config.max_input_chars,
            batch_size: config.batch_size.max(1),
            unavailable_logged: AtomicBool::new(false),
        }
    }

    /// An embedder that behaves as if every call failed.
    pub fn disabled(config: &EmbeddingConfig) -> Self {
        Self::new(None, config.dimensions, config)
    }

    /// Build the configured provider. Never fails: a missing credential or a
    /// model that cannot be loaded leaves the embedder without a provider.
    pub fn from_config(config: &EmbeddingConfig, base_path: &Path) -> Self {
        match config.provider {
            ProviderKind::None => Self::disabled(config),
            ProviderKind::Openai => {
                let Some(api_key) = config.credential() else {
                    log::info!(
                        "no embedding credential in config or ${}, semantic features degrade to keyword mode",
                        config.api_key_env
                    );
                    return Self::disabled(config);
                };
                match OpenAiProvider::new(config, api_key) {
                    Ok(provider) => Self::new(Some(Arc::new(provider)), config.dimensions, config),
                    Err(e) => {
                        log::error!("failed to build embedding client: {e}");
                        Self::disabled(config)
                    }
                }
            }
            ProviderKind::Local => Self::local(config, base_path),
        }
    }

    #[cfg(feature = "local-embeddings")]
    fn local(config: &EmbeddingConfig, base_path: &Path) -> Self {
        use crate::semantic::embeddings::LocalProvider;

        log::info!("Initializing local embedding model '{}'", config.model);
        match LocalProvider::new(&config.model, base_path) {
            Ok(provider) => {
                let dimensions = provider.dimensions();
                if dimensions != config.dimensions {
                    log::warn!(
                        "model '{}' produces {dimensions}-dim vectors, overriding embedding.dimensions={}",
                        config.model,
                        config.dimensions
                    );
                }
                Self::new(Some(Arc::new(provider)), dimensions, config)
            }
            Err(e) => {
                log::error!("failed to load local embedding model: {e}");
                Self::disabled(config)
            }
        }
    }

    #[cfg(not(feature = "local-embeddings"))]
    fn local(config: &EmbeddingConfig, _base_path: &Path) -> Self {
        log::error!("built without the local-embeddings feature, local provider unavailable");
        Self::disabled(config)
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    pub fn embed(&self, text: &str) -> Option<Vec<f32>> {
        self.embed_batch(&[text.to_string()]).pop().flatten()
    }

    pub fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        let pending: Vec<(usize, String)> = texts
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.trim().is_empty())
            .map(|(idx, t)| (idx, truncate_chars(t.trim(), self.max_input_chars)))
            .collect();

        if pending.is_empty() {
            return results;
        }

        let Some(provider) = &self.provider else {
            if !self.unavailable_logged.swap(true, Ordering::Relaxed) {
                log::warn!("no embedding provider configured, embeddings will be absent");
            }
            return results;
        };

        for chunk in pending.chunks(self.batch_size) {
            let chunk_texts: Vec<String> = chunk.iter().map(|(_, t)| t.clone()).collect();

            match provider.embed_batch(&chunk_texts) {
                Ok(vectors) if vectors.len() == chunk.len() => {
                    for ((idx, _), vector) in chunk.iter().zip(vectors) {
                        results[*idx] = self.accept(vector);
                    }
                }
                Ok(vectors) => {
                    let err = EmbeddingError::CountMismatch {
                        expected: chunk.len(),
                        got: vectors.len(),
                    };
                    log::warn!("{} batch failed: {err}, retrying one by one", provider.name());
                    if !self.embed_individually(provider.as_ref(), chunk, &mut results) {
                        break;
                    }
                }
                Err(err) if err.is_provider_wide() => {
                    log::warn!(
                        "{} unavailable, {} texts left without embedding: {err}",
                        provider.name(),
                        count_unfilled(&pending, &results)
                    );
                    break;
                }
                Err(err) => {
                    log::warn!("{} batch failed: {err}, retrying one by one", provider.name());
                    if !self.embed_individually(provider.as_ref(), chunk, &mut results) {
                        break;
                    }
                }
            }
        }

        results
    }

    /// Embed each text on its own. Returns false once the provider went down.
    fn embed_individually(
        &self,
        provider: &dyn EmbeddingProvider,
        chunk: &[(usize, String)],
        results: &mut [Option<Vec<f32>>],
    ) -> bool {
        for (idx, text) in chunk {
            match provider.embed_batch(std::slice::from_ref(text)) {
                Ok(mut vectors) if vectors.len() == 1 => {
                    results[*idx] = vectors.pop().and_then(|v| self.accept(v));
                }
                Ok(vectors) => {
                    log::warn!("expected 1 embedding, got {}", vectors.len());
                }
                Err(err) if err.is_provider_wide() => {
                    log::warn!("{} unavailable: {err}", provider.name());
                    return false;
                }
                Err(err) => {
                    log::debug!("text #{idx} left without embedding: {err}");
                }
            }
        }
        true
    }

    fn accept(&self, vector: Vec<f32>) -> Option<Vec<f32>> {
        match validate_vector(&vector, self.dimensions) {
            Ok(()) => Some(vector),
            Err(e) => {
                log::warn!("discarding embedding from provider: {e}");
                None
            }
        }
    }
}

/// Pending texts whose slot is still empty.
fn count_unfilled(pending: &[(usize, String)], results: &[Option<Vec<f32>>]) -> usize {
    pending.iter().filter(|(idx, _)| results[*idx].is_none()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(batch_size: usize, max_input_chars: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimensions: 3,
            batch_size,
            max_input_chars,
            ..Default::default()
        }
    }

    /// Embeds by text length; refuses any text containing "bad".
    #[derive(Default)]
    struct PickyProvider {
        calls: AtomicUsize,
        seen: std::sync::Mutex<Vec<String>>,
    }

    impl EmbeddingProvider for PickyProvider {
        fn name(&self) -> &str {
            "picky"
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().extend(texts.iter().cloned());
            if texts.iter().any(|t| t.contains("bad")) {
                return Err(EmbeddingError::Rejected("bad input".into()));
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 0.0])
                .collect())
        }
    }

    struct DownProvider {
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for DownProvider {
        fn name(&self) -> &str {
            "down"
        }

        fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EmbeddingError::Unavailable("503 Service Unavailable".into()))
        }
    }

    /// Serves the first batch, then goes down.
    struct FadingProvider {
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for FadingProvider {
        fn name(&self) -> &str {
            "fading"
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(EmbeddingError::Unavailable("connection reset".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    struct WrongDimProvider;

    impl EmbeddingProvider for WrongDimProvider {
        fn name(&self) -> &str {
            "wrong-dim"
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[test]
    fn test_blank_text_skips_provider() {
        let provider = Arc::new(PickyProvider::default());
        let embedder = Embedder::new(Some(provider.clone()), 3, &config(8, 100));

        assert_eq!(embedder.embed("   \n"), None);
        assert_eq!(embedder.embed(""), None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_batch_preserves_order_and_isolates_failures() {
        let provider = Arc::new(PickyProvider::default());
        let embedder = Embedder::new(Some(provider.clone()), 3, &config(8, 100));

        let texts = vec![
            "one".to_string(),
            "  ".to_string(),
            "bad apple".to_string(),
            "three33".to_string(),
        ];
        let results = embedder.embed_batch(&texts);

        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Some(vec![3.0, 1.0, 0.0]));
        assert_eq!(results[1], None);
        assert_eq!(results[2], None);
        assert_eq!(results[3], Some(vec![7.0, 1.0, 0.0]));
    }

    #[test]
    fn test_outage_blanks_every_slot_without_per_item_retries() {
        let provider = Arc::new(DownProvider {
            calls: AtomicUsize::new(0),
        });
        let embedder = Embedder::new(Some(provider.clone()), 3, &config(2, 100));

        let texts: Vec<String> = (0..6).map(|i| format!("text {i}")).collect();
        let results = embedder.embed_batch(&texts);

        assert!(results.iter().all(|r| r.is_none()));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_outage_after_first_batch_keeps_earlier_results() {
        let provider = Arc::new(FadingProvider {
            calls: AtomicUsize::new(0),
        });
        let embedder = Embedder::new(Some(provider.clone()), 3, &config(2, 100));

        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let results = embedder.embed_batch(&texts);

        assert!(results[..2].iter().all(|r| r.is_some()));
        assert!(results[2..].iter().all(|r| r.is_none()));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let pending: Vec<(usize, String)> = texts.iter().cloned().enumerate().collect();
        assert_eq!(count_unfilled(&pending, &results), 3);
    }

    #[test]
    fn test_missing_provider_returns_absent() {
        let embedder = Embedder::disabled(&config(8, 100));
        assert!(!embedder.is_available());

        let texts: Vec<String> = (0..300).map(|i| format!("item {i}")).collect();
        let results = embedder.embed_batch(&texts);
        assert_eq!(results.len(), 300);
        assert!(results.iter().all(|r| r.is_none()));
        assert!(embedder.unavailable_logged.load(Ordering::Relaxed));
        assert_eq!(embedder.embed("anything"), None);
    }

    #[test]
    fn test_long_text_is_truncated_before_submission() {
        let provider = Arc::new(PickyProvider::default());
        let embedder = Embedder::new(Some(provider.clone()), 3, &config(8, 10));

        let result = embedder.embed(&"x".repeat(50));
        assert_eq!(result, Some(vec![10.0, 1.0, 0.0]));

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].chars().count(), 10);
    }

    #[test]
    fn test_wrong_dimension_vectors_are_dropped() {
        let embedder = Embedder::new(Some(Arc::new(WrongDimProvider)), 3, &config(8, 100));
        assert_eq!(embedder.embed("hello"), None);
    }

    #[test]
    fn test_openai_without_credential_is_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            provider: ProviderKind::Openai,
            api_key: None,
            api_key_env: "WEAVE_TEST_MISSING_CREDENTIAL".to_string(),
            ..Default::default()
        };
        let embedder = Embedder::from_config(&config, tmp.path());
        assert!(!embedder.is_available());
    }
}
