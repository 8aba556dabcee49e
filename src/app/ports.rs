use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{EntityType, RawRecord};
use crate::error::Result;

/// Answer from a single classification provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAnswer {
    pub normalized_name: String,
    #[serde(default)]
    pub category: Option<String>,
    /// In [0, 1]
    pub confidence: f64,
}

/// External normalization / AI / search provider, treated as a black box.
#[async_trait]
pub trait ClassificationProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Lower values are tried first
    fn priority(&self) -> i32 {
        0
    }

    async fn normalize(&self, name: &str, entity_type: EntityType) -> Result<ProviderAnswer>;
}

/// Supplier of raw records for one normalization run
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Number of records this source will yield in total
    async fn total(&self) -> Result<u64>;

    /// Up to `limit` records; an empty batch means the source is exhausted
    async fn next_batch(&self, limit: usize) -> Result<Vec<RawRecord>>;
}
