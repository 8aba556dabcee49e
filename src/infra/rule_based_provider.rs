use async_trait::async_trait;

use crate::app::ports::{ClassificationProvider, ProviderAnswer};
use crate::domain::EntityType;
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::normalize::BasicNormalizer;

/// Confidence reported for purely formatting-based answers
pub const RULE_BASED_CONFIDENCE: f64 = 0.5;

/// Local deterministic provider: legal-form canonicalisation and casing only
pub struct RuleBasedProvider {
    id: String,
    priority: i32,
    normalizer: BasicNormalizer,
}

impl RuleBasedProvider {
    pub fn new(id: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            priority,
            normalizer: BasicNormalizer::new(),
        }
    }
}

#[async_trait]
impl ClassificationProvider for RuleBasedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn normalize(&self, name: &str, entity_type: EntityType) -> Result<ProviderAnswer> {
        let normalized_name = self.normalizer.normalize(name, entity_type);
        if normalized_name.is_empty() {
            return Err(PipelineError::ValidationFailed("name is empty".into()));
        }
        Ok(ProviderAnswer {
            normalized_name,
            category: None,
            confidence: RULE_BASED_CONFIDENCE,
        })
    }
}
