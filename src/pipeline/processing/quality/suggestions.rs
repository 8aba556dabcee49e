use std::collections::HashMap;

use crate::domain::{NormalizedItem, ProcessingLevel, SuggestionAction};
use crate::error::Result;
use crate::pipeline::processing::benchmark::BenchmarkMatcher;
use crate::pipeline::processing::normalize::BasicNormalizer;
use crate::pipeline::processing::similarity::normalize_key;

/// Confidence of a pure formatting fix
const FORMATTING_CONFIDENCE: f64 = 0.9;
/// Confidence of a category borrowed from a same-name neighbour
const NEIGHBOUR_CATEGORY_CONFIDENCE: f64 = 0.8;

/// A suggested improvement before it is persisted as a quality issue
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub rule: &'static str,
    pub description: String,
    pub confidence: f64,
    pub auto_applyable: bool,
    pub action: SuggestionAction,
}

/// Categories known for each normalized name key within a scope
pub type NeighbourCategories = HashMap<String, String>;

pub fn neighbour_categories(items: &[NormalizedItem]) -> NeighbourCategories {
    let mut map = NeighbourCategories::new();
    for item in items {
        if let Some(category) = item.category.as_deref().filter(|c| !c.trim().is_empty()) {
            map.entry(normalize_key(&item.normalized_name))
                .or_insert_with(|| category.to_string());
        }
    }
    map
}

pub struct SuggestionEngine<'a> {
    normalizer: BasicNormalizer,
    matcher: &'a BenchmarkMatcher,
    floor: f64,
}

impl<'a> SuggestionEngine<'a> {
    pub fn new(matcher: &'a BenchmarkMatcher, floor: f64) -> Self {
        Self {
            normalizer: BasicNormalizer::new(),
            matcher,
            floor,
        }
    }

    pub async fn propose(&self, item: &NormalizedItem, neighbours: &NeighbourCategories) -> Result<Vec<Proposal>> {
        let mut out = Vec::new();
        if let Some(p) = self.formatting(item) {
            out.push(p);
        }
        if let Some(p) = self.benchmark(item).await? {
            out.push(p);
        }
        if let Some(p) = fill_category(item, neighbours) {
            out.push(p);
        }
        Ok(out)
    }

    fn formatting(&self, item: &NormalizedItem) -> Option<Proposal> {
        let cleaned = self.normalizer.normalize(&item.normalized_name, item.entity_type);
        if cleaned.is_empty() || cleaned == item.normalized_name {
            return None;
        }
        Some(Proposal {
            rule: "normalize_formatting",
            description: format!("reformat '{}' as '{}'", item.normalized_name, cleaned),
            confidence: FORMATTING_CONFIDENCE,
            auto_applyable: true,
            action: SuggestionAction::SetName { name: cleaned },
        })
    }

    async fn benchmark(&self, item: &NormalizedItem) -> Result<Option<Proposal>> {
        if item.processing_level == ProcessingLevel::BenchmarkMatched || item.benchmark_id.is_some() {
            return Ok(None);
        }
        let candidate = self
            .matcher
            .best_candidate(item.project_id, &item.normalized_name, item.entity_type, self.floor)
            .await?;
        Ok(candidate.map(|m| Proposal {
            rule: "benchmark_match",
            description: format!(
                "link to benchmark '{}' (similarity {:.2})",
                m.benchmark.name, m.confidence
            ),
            confidence: m.confidence,
            auto_applyable: true,
            action: SuggestionAction::UseBenchmark {
                benchmark_id: m.benchmark.id,
            },
        }))
    }
}

fn fill_category(item: &NormalizedItem, neighbours: &NeighbourCategories) -> Option<Proposal> {
    if item.category.as_deref().map_or(false, |c| !c.trim().is_empty()) {
        return None;
    }
    let category = neighbours.get(&normalize_key(&item.normalized_name))?;
    Some(Proposal {
        rule: "fill_category",
        description: format!("use category '{}' from an item with the same name", category),
        confidence: NEIGHBOUR_CATEGORY_CONFIDENCE,
        auto_applyable: true,
        action: SuggestionAction::SetCategory {
            category: category.clone(),
        },
    })
}
