use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::pipeline::processing::classifier::AggregationStrategy;

pub const DEFAULT_CONFIG_PATH: &str = "nsi.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub matching: MatchingConfig,
    pub classifier: ClassifierConfig,
    pub taxonomy: TaxonomyConfig,
    pub duplicates: DuplicateConfig,
    pub quality: QualityConfig,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Benchmark lookup policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum similarity for a fuzzy benchmark match to be accepted
    pub fuzzy_threshold: f64,
    /// Lower bound for near-miss matches surfaced as quality suggestions
    pub suggestion_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            suggestion_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub strategy: AggregationStrategy,
    pub provider_timeout_ms: u64,
    pub overall_timeout_ms: u64,
    pub breaker: BreakerConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            strategy: AggregationStrategy::FirstSuccess,
            provider_timeout_ms: 10_000,
            overall_timeout_ms: 30_000,
            breaker: BreakerConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl ClassifierConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

/// Soft circuit breaker settings, applied per provider
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures inside the window that open the breaker
    pub failure_threshold: usize,
    /// Failures older than this no longer count
    pub failure_window_secs: u64,
    /// How long an open breaker deprioritizes its provider before a trial call
    pub cooldown_secs: u64,
    /// Successful trial calls required to close a half-open breaker
    pub half_open_successes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cooldown_secs: 30,
            half_open_successes: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// JSON-over-HTTP normalization endpoint
    Http,
    /// Local rule-based formatter
    RuleBased,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl ProviderConfig {
    /// API key from config, or `NSI_PROVIDER_<ID>_API_KEY` from the environment
    pub fn resolved_api_key(&self) -> Option<String> {
        let var = format!(
            "NSI_PROVIDER_{}_API_KEY",
            self.id.to_uppercase().replace('-', "_")
        );
        std::env::var(var).ok().or_else(|| self.api_key.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    /// JSON file with the classification tree nodes
    pub tree_path: Option<PathBuf>,
    /// Minimum child score required to descend one level
    pub descent_threshold: f64,
    pub max_depth: usize,
    /// Per-level picks remembered across lookups; 0 disables the cache
    pub cache_capacity: usize,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            tree_path: None,
            descent_threshold: 0.7,
            max_depth: 6,
            cache_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DuplicateConfig {
    /// Pairwise similarity at or above which two items are linked
    pub threshold: f64,
    /// Maximum number of items compared in one detection pass
    pub candidate_window: usize,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            candidate_window: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub high_tier: f64,
    pub medium_tier: f64,
    pub min_name_length: usize,
    pub check_category: bool,
    pub check_tax_ids: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            high_tier: 0.8,
            medium_tier: 0.5,
            min_name_length: 3,
            check_category: true,
            check_tax_ids: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub grace_period_secs: u64,
    /// Forced termination of a whole run, if set
    pub hard_deadline_secs: Option<u64>,
    /// Spawn duplicate detection and quality analysis after a run
    pub follow_on_passes: bool,
    /// Most recent per-record errors kept on the process row
    pub max_recorded_errors: usize,
    /// How often a run checks storage for a stop issued by another instance
    pub stop_poll_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            grace_period_secs: 30,
            hard_deadline_secs: None,
            follow_on_passes: true,
            max_recorded_errors: 1_000,
            stop_poll_ms: 500,
        }
    }
}

impl OrchestratorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn hard_deadline(&self) -> Option<Duration> {
        self.hard_deadline_secs.map(Duration::from_secs)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: PathBuf::from("data/nsi.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write a daily-rotated JSON log next to the console output
    pub to_file: bool,
    pub directory: PathBuf,
    pub file_name: String,
    /// Used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            to_file: true,
            directory: PathBuf::from("logs"),
            file_name: "nsi-pipeline.log".to_string(),
            default_filter: "nsi_pipeline=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9898,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load from `NSI_CONFIG` or the default path; a missing default file yields defaults.
    pub fn load() -> Result<Self> {
        match std::env::var("NSI_CONFIG") {
            Ok(path) => Self::load_from(path),
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load_from(DEFAULT_CONFIG_PATH),
            Err(_) => Ok(Self::default().with_env_overrides()),
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::ValidationFailed(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml(&content)?;
        Ok(config.with_env_overrides())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("NSI_DATABASE_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f64| -> Result<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(PipelineError::ValidationFailed(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )))
            }
        };
        unit("matching.fuzzy_threshold", self.matching.fuzzy_threshold)?;
        unit("matching.suggestion_threshold", self.matching.suggestion_threshold)?;
        unit("taxonomy.descent_threshold", self.taxonomy.descent_threshold)?;
        unit("duplicates.threshold", self.duplicates.threshold)?;
        unit("quality.high_tier", self.quality.high_tier)?;
        unit("quality.medium_tier", self.quality.medium_tier)?;

        if self.matching.suggestion_threshold > self.matching.fuzzy_threshold {
            return Err(PipelineError::ValidationFailed(
                "matching.suggestion_threshold must not exceed matching.fuzzy_threshold".into(),
            ));
        }
        if self.quality.medium_tier > self.quality.high_tier {
            return Err(PipelineError::ValidationFailed(
                "quality.medium_tier must not exceed quality.high_tier".into(),
            ));
        }
        if self.orchestrator.workers == 0 || self.orchestrator.batch_size == 0 {
            return Err(PipelineError::ValidationFailed(
                "orchestrator.workers and orchestrator.batch_size must be positive".into(),
            ));
        }
        for provider in &self.classifier.providers {
            if provider.kind == ProviderKind::Http && provider.endpoint.is_none() {
                return Err(PipelineError::ValidationFailed(format!(
                    "provider '{}' of kind http requires an endpoint",
                    provider.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.orchestrator.workers, 4);
        assert_eq!(config.duplicates.threshold, 0.9);
        assert_eq!(config.classifier.strategy, AggregationStrategy::FirstSuccess);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn parses_providers_and_strategy() {
        let config = Config::from_toml(
            r#"
            [classifier]
            strategy = "majority-vote"
            provider_timeout_ms = 500

            [[classifier.providers]]
            id = "arliai"
            kind = "http"
            endpoint = "https://api.example.com/v1/normalize"
            priority = 1

            [[classifier.providers]]
            id = "local"
            kind = "rule_based"
            priority = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.classifier.strategy, AggregationStrategy::MajorityVote);
        assert_eq!(config.classifier.providers.len(), 2);
        assert_eq!(config.classifier.provider_timeout(), Duration::from_millis(500));
        assert!(config.classifier.providers[1].enabled);
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let err = Config::from_toml("[duplicates]\nthreshold = 1.5\n").unwrap_err();
        assert_eq!(err.kind(), "validation_failed");
    }

    #[test]
    fn http_provider_requires_endpoint() {
        let err = Config::from_toml(
            "[[classifier.providers]]\nid = \"x\"\nkind = \"http\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires an endpoint"));
    }
}
