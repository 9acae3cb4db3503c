use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

/// Default DBSCAN neighbourhood radius (cosine distance)
const DEFAULT_EPSILON: f32 = 0.15;
const DEFAULT_MIN_POINTS: usize = 2;
const DEFAULT_MAX_CLUSTERS: usize = 15;

const DEFAULT_TUNING_MIN_EPSILON: f32 = 0.05;
const DEFAULT_TUNING_MAX_EPSILON: f32 = 0.5;
const DEFAULT_TUNING_STEP: f32 = 0.05;

/// Default cosine distance cutoff for semantic search
const DEFAULT_SEARCH_THRESHOLD: f32 = 0.5;
const DEFAULT_SEARCH_LIMIT: usize = 20;

const DEFAULT_INTERVAL_SECS: u64 = 600;
const DEFAULT_WINDOW_HOURS: u32 = 24;
const DEFAULT_ITEM_LIMIT_PER_RUN: usize = 500;
const DEFAULT_TENANT_PARALLELISM: usize = 4;

const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_DIMENSIONS: usize = 1536;
/// Rough stand-in for the provider's token limit (~4 chars per token)
const DEFAULT_MAX_INPUT_CHARS: usize = 8000;
const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 64;
const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Maximum cosine distance between neighbours, in (0, 2]
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,

    /// Minimum neighbourhood size (including the point itself) for a core point
    #[serde(default = "default_min_points")]
    pub min_points: usize,

    /// Upper bound on clusters emitted (and materialized) per tenant per run
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            min_points: DEFAULT_MIN_POINTS,
            max_clusters: DEFAULT_MAX_CLUSTERS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Tune epsilon per tenant before every batch run
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_tuning_min_epsilon")]
    pub min_epsilon: f32,

    #[serde(default = "default_tuning_max_epsilon")]
    pub max_epsilon: f32,

    #[serde(default = "default_tuning_step")]
    pub step: f32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_epsilon: DEFAULT_TUNING_MIN_EPSILON,
            max_epsilon: DEFAULT_TUNING_MAX_EPSILON,
            step: DEFAULT_TUNING_STEP,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Candidates must be strictly closer than this cosine distance
    #[serde(default = "default_search_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SEARCH_THRESHOLD,
            default_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Only items created within this many hours are considered
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,

    /// Caps the O(N²) work done per run
    #[serde(default = "default_item_limit_per_run")]
    pub item_limit_per_run: usize,

    /// Number of tenants processed concurrently
    #[serde(default = "default_tenant_parallelism")]
    pub tenant_parallelism: usize,

    /// Embed items that arrive without an embedding before clustering
    #[serde(default = "default_true")]
    pub backfill_embeddings: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            window_hours: DEFAULT_WINDOW_HOURS,
            item_limit_per_run: DEFAULT_ITEM_LIMIT_PER_RUN,
            tenant_parallelism: DEFAULT_TENANT_PARALLELISM,
            backfill_embeddings: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// No provider configured; every embedding comes back absent
    #[default]
    None,
    /// Local ONNX model through fastembed
    Local,
    /// OpenAI-compatible `/embeddings` HTTP endpoint
    Openai,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Inline credential. Prefer `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable consulted when `api_key` is not set
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_openai_endpoint")]
    pub endpoint: String,

    /// Dimension every stored embedding must share
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Text is cut to this many characters before submission
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::None,
            model: DEFAULT_OPENAI_MODEL.to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            endpoint: DEFAULT_OPENAI_ENDPOINT.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            timeout_secs: DEFAULT_EMBEDDING_TIMEOUT_SECS,
        }
    }
}

impl EmbeddingConfig {
    /// Resolve the provider credential: inline value first, then the environment.
    pub fn credential(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

fn default_epsilon() -> f32 {
    DEFAULT_EPSILON
}

fn default_min_points() -> usize {
    DEFAULT_MIN_POINTS
}

fn default_max_clusters() -> usize {
    DEFAULT_MAX_CLUSTERS
}

fn default_tuning_min_epsilon() -> f32 {
    DEFAULT_TUNING_MIN_EPSILON
}

fn default_tuning_max_epsilon() -> f32 {
    DEFAULT_TUNING_MAX_EPSILON
}

fn default_tuning_step() -> f32 {
    DEFAULT_TUNING_STEP
}

fn default_search_threshold() -> f32 {
    DEFAULT_SEARCH_THRESHOLD
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_window_hours() -> u32 {
    DEFAULT_WINDOW_HOURS
}

fn default_item_limit_per_run() -> usize {
    DEFAULT_ITEM_LIMIT_PER_RUN
}

fn default_tenant_parallelism() -> usize {
    DEFAULT_TENANT_PARALLELISM
}

fn default_true() -> bool {
    true
}

fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_openai_endpoint() -> String {
    DEFAULT_OPENAI_ENDPOINT.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_max_input_chars() -> usize {
    DEFAULT_MAX_INPUT_CHARS
}

fn default_embedding_batch_size() -> usize {
    DEFAULT_EMBEDDING_BATCH_SIZE
}

fn default_embedding_timeout_secs() -> u64 {
    DEFAULT_EMBEDDING_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let cl = &self.clustering;
        if !(cl.epsilon > 0.0 && cl.epsilon <= 2.0) {
            bail!("clustering.epsilon must be in (0, 2], got {}", cl.epsilon);
        }
        if cl.min_points == 0 {
            bail!("clustering.min_points must be at least 1");
        }
        if cl.max_clusters == 0 {
            bail!("clustering.max_clusters must be at least 1");
        }

        let tu = &self.tuning;
        if tu.step <= 0.0 {
            bail!("tuning.step must be positive, got {}", tu.step);
        }
        if !(tu.min_epsilon > 0.0 && tu.min_epsilon <= tu.max_epsilon && tu.max_epsilon <= 2.0) {
            bail!(
                "tuning range must satisfy 0 < min_epsilon <= max_epsilon <= 2, got [{}, {}]",
                tu.min_epsilon,
                tu.max_epsilon
            );
        }

        let th = self.search.similarity_threshold;
        if !(th > 0.0 && th <= 2.0) {
            bail!("search.similarity_threshold must be in (0, 2], got {th}");
        }
        if self.search.default_limit == 0 {
            bail!("search.default_limit must be at least 1");
        }

        let b = &self.batch;
        if b.interval_secs == 0 {
            bail!("batch.interval_secs must be greater than 0");
        }
        if b.item_limit_per_run == 0 {
            bail!("batch.item_limit_per_run must be greater than 0");
        }
        if b.tenant_parallelism == 0 {
            bail!("batch.tenant_parallelism must be greater than 0");
        }

        let e = &self.embedding;
        if e.dimensions == 0 {
            bail!("embedding.dimensions must be greater than 0");
        }
        if e.batch_size == 0 {
            bail!("embedding.batch_size must be greater than 0");
        }
        if e.max_input_chars == 0 {
            bail!("embedding.max_input_chars must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults when it is missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let path = base_path.join(CONFIG_FILE);

        if !path.exists() {
            std::fs::create_dir_all(base_path)
                .with_context(|| format!("failed to create {}", base_path.display()))?;
            std::fs::write(&path, serde_yml::to_string(&Self::default())?)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE), config_str)
            .context("failed to save config")?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!((config.clustering.epsilon - 0.15).abs() < f32::EPSILON);
        assert_eq!(config.clustering.min_points, 2);
        assert_eq!(config.batch.window_hours, 24);
        assert_eq!(config.batch.item_limit_per_run, 500);
        assert_eq!(config.embedding.provider, ProviderKind::None);
    }

    #[test]
    fn test_rejects_epsilon_out_of_range() {
        let mut config = Config::default();
        config.clustering.epsilon = 0.0;
        assert!(config.validate().is_err());

        config.clustering.epsilon = 2.5;
        assert!(config.validate().is_err());

        config.clustering.epsilon = 2.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_tuning_range() {
        let mut config = Config::default();
        config.tuning.min_epsilon = 0.4;
        config.tuning.max_epsilon = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.clustering.max_clusters, DEFAULT_MAX_CLUSTERS);
        assert_eq!(config.base_path(), tmp.path());
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "clustering:\n  epsilon: 0.2\nembedding:\n  provider: openai\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert!((config.clustering.epsilon - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.clustering.min_points, DEFAULT_MIN_POINTS);
        assert_eq!(config.embedding.provider, ProviderKind::Openai);
        assert_eq!(config.embedding.dimensions, DEFAULT_DIMENSIONS);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "clustering: [").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());
    }

    #[test]
    fn test_inline_credential_wins() {
        let mut config = EmbeddingConfig::default();
        config.api_key = Some("  sk-inline ".to_string());
        config.api_key_env = "WEAVE_TEST_UNSET_KEY_VAR".to_string();
        assert_eq!(config.credential().as_deref(), Some("sk-inline"));

        config.api_key = Some("   ".to_string());
        assert_eq!(config.credential(), None);
    }
}
