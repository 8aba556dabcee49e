use std::sync::Arc;
use tracing::info;

use crate::app::ports::ClassificationProvider;
use crate::config::{ClassifierConfig, ProviderKind};
use crate::error::Result;

pub mod http_provider;
pub mod record_source;
pub mod rule_based_provider;

pub use http_provider::HttpJsonProvider;
pub use record_source::{MemoryRecordSource, NdjsonRecordSource};
pub use rule_based_provider::RuleBasedProvider;

/// Instantiates the enabled providers from configuration
pub fn build_providers(config: &ClassifierConfig) -> Result<Vec<Arc<dyn ClassificationProvider>>> {
    let mut providers: Vec<Arc<dyn ClassificationProvider>> = Vec::new();
    for provider in config.providers.iter().filter(|p| p.enabled) {
        let built: Arc<dyn ClassificationProvider> = match provider.kind {
            ProviderKind::Http => Arc::new(HttpJsonProvider::from_config(provider)?),
            ProviderKind::RuleBased => Arc::new(RuleBasedProvider::new(provider.id.clone(), provider.priority)),
        };
        info!(provider = %provider.id, kind = ?provider.kind, priority = provider.priority, "Registered provider");
        providers.push(built);
    }
    Ok(providers)
}
