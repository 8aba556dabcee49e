use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::app::ports::{ClassificationProvider, RecordSource};
use crate::config::{Config, StorageBackend};
use crate::domain::{
    Benchmark, BenchmarkId, ClassificationResult, DuplicateGroup, EntityType, GroupId, IssueId, ItemId, ItemLink,
    LinkKind, NormalizationProcess, NormalizedItem, ProcessId, ProcessStatus, ProjectId, QualityIssue,
};
use crate::error::{PipelineError, Result};
use crate::infra::build_providers;
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::orchestrator::{FollowOn, Orchestrator, ProcessEvent};
use crate::pipeline::processing::benchmark::{BenchmarkMatch, BenchmarkMatcher};
use crate::pipeline::processing::classifier::{Classification, MultiProviderClassifier, ProviderHealthSnapshot};
use crate::pipeline::processing::duplicates::{DuplicateDetector, DuplicateMerger};
use crate::pipeline::processing::quality::{QualityAnalyzer, QualityReport, QualityScope};
use crate::pipeline::processing::taxonomy::{AccuracyReport, TaxonomyMatcher, TaxonomyResolution, TaxonomyTree};
use crate::pipeline::worker::RecordPipeline;
use crate::storage::{InMemoryStorage, ItemPatch, SqliteStorage, Storage};

/// The operations the pipeline exposes to its callers
pub struct NsiService {
    storage: Arc<dyn Storage>,
    matcher: Arc<BenchmarkMatcher>,
    classifier: Arc<MultiProviderClassifier>,
    taxonomy: Option<Arc<TaxonomyMatcher>>,
    detector: Arc<DuplicateDetector>,
    merger: DuplicateMerger,
    analyzer: Arc<QualityAnalyzer>,
    orchestrator: Orchestrator,
}

impl NsiService {
    /// Wires every component over the given storage and providers
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        providers: Vec<Arc<dyn ClassificationProvider>>,
        taxonomy: Option<TaxonomyTree>,
    ) -> Self {
        let matcher = Arc::new(BenchmarkMatcher::new(storage.clone(), config.matching.fuzzy_threshold));
        let classifier = Arc::new(MultiProviderClassifier::new(providers, &config.classifier));
        let taxonomy = taxonomy.map(|tree| {
            Arc::new(TaxonomyMatcher::new(
                Arc::new(tree),
                storage.clone(),
                config.taxonomy.descent_threshold,
                config.taxonomy.max_depth,
            )
            .with_cache_capacity(config.taxonomy.cache_capacity))
        });
        let detector = Arc::new(DuplicateDetector::new(
            storage.clone(),
            config.duplicates.threshold,
            config.duplicates.candidate_window,
        ));
        let analyzer = Arc::new(QualityAnalyzer::new(
            storage.clone(),
            matcher.clone(),
            config.quality.clone(),
            config.matching.suggestion_threshold,
        ));
        let pipeline = Arc::new(RecordPipeline::new(
            storage.clone(),
            matcher.clone(),
            classifier.clone(),
            taxonomy.clone(),
            analyzer.clone(),
        ));
        let orchestrator = Orchestrator::new(storage.clone(), pipeline, config.orchestrator.clone()).with_follow_on(
            FollowOn {
                detector: detector.clone(),
                analyzer: analyzer.clone(),
            },
        );

        Self {
            merger: DuplicateMerger::new(storage.clone()),
            storage,
            matcher,
            classifier,
            taxonomy,
            detector,
            analyzer,
            orchestrator,
        }
    }

    /// Opens storage, loads the taxonomy and builds providers from `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let storage: Arc<dyn Storage> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryStorage::new()),
            StorageBackend::Sqlite => Arc::new(SqliteStorage::open(&config.storage.path)?),
        };
        let taxonomy = config
            .taxonomy
            .tree_path
            .as_ref()
            .map(TaxonomyTree::load_json)
            .transpose()?;
        let providers = build_providers(&config.classifier)?;
        info!(
            providers = providers.len(),
            taxonomy = taxonomy.is_some(),
            strategy = config.classifier.strategy.as_str(),
            "NSI service ready"
        );
        Ok(Self::new(config, storage, providers, taxonomy))
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    // Process lifecycle

    pub async fn start(&self, project_id: ProjectId, source: Arc<dyn RecordSource>) -> Result<ProcessId> {
        self.orchestrator.start(project_id, source).await
    }

    pub async fn status(&self, process_id: ProcessId) -> Result<NormalizationProcess> {
        self.orchestrator.status(process_id).await
    }

    pub async fn stop(&self, process_id: ProcessId) -> Result<ProcessStatus> {
        self.orchestrator.stop(process_id).await
    }

    pub fn subscribe(&self, process_id: ProcessId) -> Result<broadcast::Receiver<ProcessEvent>> {
        self.orchestrator.subscribe(process_id)
    }

    pub async fn wait(&self, process_id: ProcessId) -> Result<ProcessStatus> {
        self.orchestrator.wait(process_id).await
    }

    pub async fn recover_stale(&self, project_id: Option<ProjectId>) -> Result<Vec<ProcessId>> {
        self.orchestrator.recover_stale(project_id).await
    }

    // Benchmarks

    pub async fn match_benchmark(
        &self,
        project_id: ProjectId,
        name: &str,
        entity_type: EntityType,
    ) -> Result<Option<BenchmarkMatch>> {
        self.matcher.find(project_id, name, entity_type).await
    }

    pub async fn register_benchmark(&self, benchmark: &mut Benchmark) -> Result<()> {
        self.matcher.create(benchmark).await
    }

    pub async fn update_benchmark(&self, benchmark: &mut Benchmark) -> Result<()> {
        self.matcher.update(benchmark).await
    }

    pub async fn add_variations(&self, benchmark_id: BenchmarkId, variations: &[String]) -> Result<Benchmark> {
        self.matcher.add_variations(benchmark_id, variations).await
    }

    // Classification

    pub async fn classify(&self, name: &str, entity_type: EntityType) -> Result<Classification> {
        self.classifier.classify(name, entity_type, &CancelSignal::never()).await
    }

    pub fn provider_health(&self) -> Vec<ProviderHealthSnapshot> {
        self.classifier.health().snapshot()
    }

    // Taxonomy

    fn taxonomy(&self) -> Result<&TaxonomyMatcher> {
        self.taxonomy
            .as_deref()
            .ok_or_else(|| PipelineError::ValidationFailed("no taxonomy tree is configured".into()))
    }

    /// Resolves a stored item, records the attempt and updates its code
    pub async fn resolve_taxonomy(&self, item_id: ItemId) -> Result<TaxonomyResolution> {
        let taxonomy = self.taxonomy()?;
        let item = self.item(item_id).await?;
        let resolution = taxonomy.resolve(&item).await?;
        let code = resolution.code().map(str::to_string);
        if let Some(reference) = code.filter(|c| item.taxonomy_code.as_ref() != Some(c)) {
            let patch = ItemPatch {
                taxonomy_code: Some(reference.clone()),
                ..Default::default()
            };
            self.storage.patch_item(item_id, &patch, Utc::now()).await?;
            self.storage
                .add_item_link(&ItemLink {
                    item_id,
                    kind: LinkKind::Taxonomy,
                    reference,
                })
                .await?;
        }
        Ok(resolution)
    }

    pub async fn taxonomy_history(&self, item_id: ItemId) -> Result<Vec<ClassificationResult>> {
        self.taxonomy()?.history(item_id).await
    }

    pub async fn taxonomy_accuracy(&self, project_id: ProjectId) -> Result<AccuracyReport> {
        self.taxonomy()?.accuracy_report(project_id).await
    }

    // Duplicates

    pub async fn detect_duplicates(&self, project_id: ProjectId, entity_type: EntityType) -> Result<Vec<DuplicateGroup>> {
        self.detector.detect(project_id, entity_type).await
    }

    pub async fn merge_duplicates(
        &self,
        group_id: GroupId,
        master_id: ItemId,
        member_ids: &[ItemId],
    ) -> Result<NormalizedItem> {
        self.merger.merge(group_id, master_id, member_ids).await
    }

    // Quality

    pub async fn analyze_quality(&self, scope: QualityScope) -> Result<QualityReport> {
        self.analyzer.analyze(scope).await
    }

    pub async fn apply_suggestion(&self, suggestion_id: IssueId) -> Result<NormalizedItem> {
        self.analyzer.apply_suggestion(suggestion_id).await
    }

    pub async fn resolve_violation(&self, violation_id: IssueId) -> Result<QualityIssue> {
        self.analyzer.resolve_violation(violation_id).await
    }

    async fn item(&self, item_id: ItemId) -> Result<NormalizedItem> {
        self.storage
            .get_item(item_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("item {}", item_id)))
    }
}
