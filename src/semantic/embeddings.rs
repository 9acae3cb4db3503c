//! Embedding providers.
//!
//! - `OpenAiProvider`: OpenAI-compatible `/embeddings` endpoint, needs a credential
//! - `LocalProvider`: fastembed ONNX model, downloaded into the base directory on first use
//!
//! Providers only turn text into vectors. Absent-instead-of-error semantics,
//! truncation and batching live in [`crate::semantic::Embedder`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// The provider cannot serve any request right now (auth, outage, network).
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),

    /// The provider refused this particular input.
    #[error("Embedding rejected: {0}")]
    Rejected(String),

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Provider returned {got} embeddings for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

impl EmbeddingError {
    /// True when retrying other inputs against the same provider is pointless.
    pub fn is_provider_wide(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Unavailable(_)
                | EmbeddingError::InitFailed(_)
                | EmbeddingError::InvalidModel(_)
        )
    }
}

pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Returns one vector per input, in input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible embeddings API.
pub struct OpenAiProvider {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self, EmbeddingError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let endpoint = config
            .endpoint
            .strip_suffix('/')
            .unwrap_or(&config.endpoint)
            .to_string();

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            api_key,
        })
    }
}

impl EmbeddingProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.model
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/embeddings", self.endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let msg = format!("{url} returned {status}: {body}");
            return Err(match status.as_u16() {
                400 | 413 | 422 => EmbeddingError::Rejected(msg),
                _ => EmbeddingError::Unavailable(msg),
            });
        }

        let mut parsed: EmbeddingsResponse = response
            .json()
            .map_err(|e| EmbeddingError::Unavailable(format!("malformed response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: parsed.data.len(),
            });
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(feature = "local-embeddings")]
pub use local::LocalProvider;

#[cfg(feature = "local-embeddings")]
mod local {
    use std::path::Path;
    use std::sync::Mutex;

    use fastembed::{InitOptions, TextEmbedding};

    use super::{EmbeddingError, EmbeddingProvider};

    /// Wrapper around fastembed's TextEmbedding model.
    /// Uses a Mutex because fastembed's embed() requires &mut self.
    pub struct LocalProvider {
        model: Mutex<TextEmbedding>,
        model_name: String,
        dimensions: usize,
    }

    impl LocalProvider {
        /// Load `model_name`, downloading it into `<cache_dir>/models` if needed.
        pub fn new(model_name: &str, cache_dir: &Path) -> Result<Self, EmbeddingError> {
            let model_enum = parse_model_name(model_name)?;

            let models_dir = cache_dir.join("models");
            std::fs::create_dir_all(&models_dir).map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
            })?;

            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let mut model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

            let dimensions = probe_dimensions(&mut model)?;

            Ok(Self {
                model: Mutex::new(model),
                model_name: model_name.to_string(),
                dimensions,
            })
        }

        pub fn dimensions(&self) -> usize {
            self.dimensions
        }
    }

    impl EmbeddingProvider for LocalProvider {
        fn name(&self) -> &str {
            &self.model_name
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if texts.is_empty() {
                return Ok(vec![]);
            }

            let mut model = self.model.lock().map_err(|e| {
                EmbeddingError::Unavailable(format!("Failed to acquire model lock: {}", e))
            })?;

            model
                .embed(texts.to_vec(), None)
                .map_err(|e| EmbeddingError::Rejected(e.to_string()))
        }
    }

    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5",
                name
            ))),
        }
    }

    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_invalid_model_name() {
            let temp_dir = tempfile::tempdir().unwrap();
            let result = LocalProvider::new("nonexistent-model", temp_dir.path());
            assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
        }

        #[test]
        #[ignore = "requires model download"]
        fn test_embedding_generation() {
            let temp_dir = tempfile::tempdir().unwrap();
            let model = LocalProvider::new("all-MiniLM-L6-v2", temp_dir.path()).unwrap();
            assert_eq!(model.dimensions(), 384);

            let embeddings = model
                .embed_batch(&["Hello, world!".to_string(), "Checkout bug".to_string()])
                .unwrap();
            assert_eq!(embeddings.len(), 2);
            assert_eq!(embeddings[0].len(), 384);
        }
    }
}
