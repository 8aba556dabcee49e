use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, instrument};

use crate::domain::{Benchmark, BenchmarkId, EntityType, ProjectId};
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::processing::normalize::strip_legal_form;
use crate::pipeline::processing::similarity::{key_similarity, normalize_key};
use crate::storage::Storage;

/// Outcome of a benchmark lookup
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkMatch {
    pub benchmark: Benchmark,
    /// 1.0 for exact name or variation hits, the similarity score otherwise
    pub confidence: f64,
    pub exact: bool,
}

/// Lookup structure over the active benchmarks of one project and entity type
struct BenchmarkIndex {
    benchmarks: Vec<Benchmark>,
    /// Normalized name and variation keys per benchmark
    keys: Vec<Vec<String>>,
    exact: HashMap<String, Vec<usize>>,
}

impl BenchmarkIndex {
    fn build(benchmarks: Vec<Benchmark>) -> Self {
        let benchmarks: Vec<Benchmark> = benchmarks.into_iter().filter(|b| b.active).collect();
        let mut keys = Vec::with_capacity(benchmarks.len());
        let mut exact: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, benchmark) in benchmarks.iter().enumerate() {
            let mut own: Vec<String> = std::iter::once(&benchmark.name)
                .chain(benchmark.variations.iter())
                .map(|s| normalize_key(s))
                .filter(|k| !k.is_empty())
                .collect();
            own.dedup();
            for key in &own {
                let slot = exact.entry(key.clone()).or_default();
                if !slot.contains(&idx) {
                    slot.push(idx);
                }
            }
            keys.push(own);
        }
        Self {
            benchmarks,
            keys,
            exact,
        }
    }

    fn exact(&self, key: &str) -> Option<&Benchmark> {
        self.exact
            .get(key)?
            .iter()
            .map(|&idx| &self.benchmarks[idx])
            .max_by(|a, b| newer_first(a, b))
    }

    /// Highest scoring benchmark at or above `floor`
    fn fuzzy(&self, key: &str, entity_type: EntityType, floor: f64) -> Option<(&Benchmark, f64)> {
        let stripped = match entity_type {
            EntityType::Counterparty => Some(normalize_key(&strip_legal_form(key))),
            EntityType::Nomenclature => None,
        };
        let mut best: Option<(&Benchmark, f64)> = None;
        for (benchmark, keys) in self.benchmarks.iter().zip(&self.keys) {
            let score = keys
                .iter()
                .map(|k| {
                    let direct = key_similarity(key, k);
                    match &stripped {
                        Some(s) if !s.is_empty() => {
                            direct.max(key_similarity(s, &normalize_key(&strip_legal_form(k))))
                        }
                        _ => direct,
                    }
                })
                .fold(0.0, f64::max);
            if score < floor {
                continue;
            }
            best = match best {
                None => Some((benchmark, score)),
                Some((current, current_score)) => {
                    let better = match score.partial_cmp(&current_score).unwrap_or(Ordering::Equal) {
                        Ordering::Greater => true,
                        Ordering::Less => false,
                        Ordering::Equal => newer_first(benchmark, current) == Ordering::Greater,
                    };
                    if better {
                        Some((benchmark, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }
        best
    }
}

/// Ordering where the more recently updated benchmark is greater; lower id wins a full tie
fn newer_first(a: &Benchmark, b: &Benchmark) -> Ordering {
    a.updated_at.cmp(&b.updated_at).then_with(|| b.id.cmp(&a.id))
}

/// Exact-then-fuzzy lookup against a project's canonical reference set.
///
/// Reads are served from a per-(project, entity type) index that is rebuilt
/// lazily after any write made through this matcher.
pub struct BenchmarkMatcher {
    storage: Arc<dyn Storage>,
    fuzzy_threshold: f64,
    cache: RwLock<HashMap<(ProjectId, EntityType), Arc<BenchmarkIndex>>>,
}

impl BenchmarkMatcher {
    pub fn new(storage: Arc<dyn Storage>, fuzzy_threshold: f64) -> Self {
        Self {
            storage,
            fuzzy_threshold,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn fuzzy_threshold(&self) -> f64 {
        self.fuzzy_threshold
    }

    async fn index(&self, project_id: ProjectId, entity_type: EntityType) -> Result<Arc<BenchmarkIndex>> {
        let cached = self.cache.read()?.get(&(project_id, entity_type)).cloned();
        if let Some(index) = cached {
            return Ok(index);
        }
        let benchmarks = self.storage.list_benchmarks(project_id, Some(entity_type)).await?;
        let index = Arc::new(BenchmarkIndex::build(benchmarks));
        debug!(
            project_id,
            entity_type = entity_type.as_str(),
            size = index.benchmarks.len(),
            "Built benchmark index"
        );
        self.cache
            .write()?
            .insert((project_id, entity_type), index.clone());
        Ok(index)
    }

    fn invalidate(&self, project_id: ProjectId) -> Result<()> {
        self.cache.write()?.retain(|(p, _), _| *p != project_id);
        Ok(())
    }

    /// Best benchmark for `name`, or `None`. Never calls out to classifiers.
    #[instrument(skip(self), level = "debug")]
    pub async fn find(
        &self,
        project_id: ProjectId,
        name: &str,
        entity_type: EntityType,
    ) -> Result<Option<BenchmarkMatch>> {
        let key = normalize_key(name);
        if key.is_empty() {
            return Err(PipelineError::ValidationFailed("name is empty".into()));
        }
        let index = self.index(project_id, entity_type).await?;

        if let Some(benchmark) = index.exact(&key) {
            metrics::benchmark::lookup(true);
            return Ok(Some(BenchmarkMatch {
                benchmark: benchmark.clone(),
                confidence: 1.0,
                exact: true,
            }));
        }

        let found = index
            .fuzzy(&key, entity_type, self.fuzzy_threshold)
            .map(|(benchmark, score)| BenchmarkMatch {
                benchmark: benchmark.clone(),
                confidence: score,
                exact: false,
            });
        metrics::benchmark::lookup(found.is_some());
        Ok(found)
    }

    /// Closest benchmark scoring at least `floor`, exact hits included.
    /// Used for near-miss suggestions below the acceptance threshold.
    pub async fn best_candidate(
        &self,
        project_id: ProjectId,
        name: &str,
        entity_type: EntityType,
        floor: f64,
    ) -> Result<Option<BenchmarkMatch>> {
        let key = normalize_key(name);
        if key.is_empty() {
            return Ok(None);
        }
        let index = self.index(project_id, entity_type).await?;
        if let Some(benchmark) = index.exact(&key) {
            return Ok(Some(BenchmarkMatch {
                benchmark: benchmark.clone(),
                confidence: 1.0,
                exact: true,
            }));
        }
        Ok(index
            .fuzzy(&key, entity_type, floor)
            .map(|(benchmark, score)| BenchmarkMatch {
                benchmark: benchmark.clone(),
                confidence: score,
                exact: false,
            }))
    }

    pub async fn create(&self, benchmark: &mut Benchmark) -> Result<()> {
        if normalize_key(&benchmark.name).is_empty() {
            return Err(PipelineError::ValidationFailed("benchmark name is empty".into()));
        }
        self.storage.create_benchmark(benchmark).await?;
        self.invalidate(benchmark.project_id)
    }

    pub async fn update(&self, benchmark: &mut Benchmark) -> Result<()> {
        self.storage.update_benchmark(benchmark).await?;
        self.invalidate(benchmark.project_id)
    }

    pub async fn add_variations(&self, benchmark_id: BenchmarkId, variations: &[String]) -> Result<Benchmark> {
        let benchmark = self.storage.add_variations(benchmark_id, variations).await?;
        self.invalidate(benchmark.project_id)?;
        Ok(benchmark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn matcher() -> BenchmarkMatcher {
        BenchmarkMatcher::new(Arc::new(InMemoryStorage::new()), 0.85)
    }

    #[tokio::test]
    async fn variation_matches_exactly() {
        let matcher = matcher();
        let mut benchmark = Benchmark::new(1, EntityType::Counterparty, "Ромашка, ООО")
            .with_variations(["ООО Ромашка"]);
        matcher.create(&mut benchmark).await.unwrap();

        let found = matcher
            .find(1, "ооо ромашка", EntityType::Counterparty)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.benchmark.id, benchmark.id);
        assert_eq!(found.confidence, 1.0);
        assert!(found.exact);
    }

    #[tokio::test]
    async fn fuzzy_match_respects_threshold() {
        let matcher = matcher();
        let mut benchmark = Benchmark::new(1, EntityType::Nomenclature, "Болт М6 оцинкованный");
        matcher.create(&mut benchmark).await.unwrap();

        let found = matcher
            .find(1, "Болт м6 оцинк.", EntityType::Nomenclature)
            .await
            .unwrap()
            .unwrap();
        assert!(!found.exact);
        assert!(found.confidence >= 0.85 && found.confidence < 1.0);

        assert!(matcher
            .find(1, "Гайка М8", EntityType::Nomenclature)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ties_prefer_most_recently_updated() {
        let matcher = matcher();
        let mut older = Benchmark::new(1, EntityType::Nomenclature, "Кабель ВВГ 3х2.5");
        matcher.create(&mut older).await.unwrap();
        let mut newer = Benchmark::new(1, EntityType::Nomenclature, "Кабель ВВГ 3х2.5");
        matcher.create(&mut newer).await.unwrap();
        matcher.update(&mut newer).await.unwrap();

        let found = matcher
            .find(1, "кабель ввг 3х2.5", EntityType::Nomenclature)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.benchmark.id, newer.id);

        matcher.update(&mut older).await.unwrap();
        let found = matcher
            .find(1, "кабель ввг 3х2.5", EntityType::Nomenclature)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.benchmark.id, older.id);
    }

    #[tokio::test]
    async fn inactive_and_foreign_benchmarks_never_match() {
        let matcher = matcher();
        let mut inactive = Benchmark::new(1, EntityType::Nomenclature, "Шуруп 4х40");
        inactive.active = false;
        matcher.create(&mut inactive).await.unwrap();
        let mut other_project = Benchmark::new(2, EntityType::Nomenclature, "Шуруп 4х40");
        matcher.create(&mut other_project).await.unwrap();

        assert!(matcher
            .find(1, "Шуруп 4х40", EntityType::Nomenclature)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn added_variations_invalidate_the_index() {
        let matcher = matcher();
        let mut benchmark = Benchmark::new(1, EntityType::Counterparty, "ПАО Сбербанк");
        matcher.create(&mut benchmark).await.unwrap();
        assert!(matcher
            .find(1, "Сбер", EntityType::Counterparty)
            .await
            .unwrap()
            .is_none());

        matcher
            .add_variations(benchmark.id, &["Сбер".to_string()])
            .await
            .unwrap();
        let found = matcher.find(1, "сбер", EntityType::Counterparty).await.unwrap().unwrap();
        assert_eq!(found.confidence, 1.0);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let err = matcher()
            .find(1, "   ", EntityType::Nomenclature)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_failed");
    }
}
