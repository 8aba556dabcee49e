use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::*;
use crate::error::Result;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

/// Everything a merge writes, applied as one unit by [`Storage::merge_group`]
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub group_id: GroupId,
    pub master_id: ItemId,
    pub folded_ids: Vec<ItemId>,
    /// Master attributes after backfill from the folded items
    pub attributes: Attributes,
    pub category: Option<String>,
    pub merged_at: DateTime<Utc>,
}

/// Field-level item change. Unset fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub normalized_name: Option<String>,
    pub category: Option<String>,
    pub benchmark_id: Option<BenchmarkId>,
    pub processing_level: Option<ProcessingLevel>,
    pub taxonomy_code: Option<String>,
    pub quality_score: Option<f64>,
}

impl ItemPatch {
    pub fn quality_score(score: f64) -> Self {
        Self {
            quality_score: Some(score),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, item: &mut NormalizedItem) {
        if let Some(name) = &self.normalized_name {
            item.normalized_name = name.clone();
        }
        if let Some(category) = &self.category {
            item.category = Some(category.clone());
        }
        if let Some(benchmark_id) = self.benchmark_id {
            item.benchmark_id = Some(benchmark_id);
        }
        if let Some(level) = self.processing_level {
            item.processing_level = level;
        }
        if let Some(code) = &self.taxonomy_code {
            item.taxonomy_code = Some(code.clone());
        }
        if let Some(score) = self.quality_score {
            item.quality_score = score;
        }
    }
}

/// Persistence for the pipeline. Implementations must make
/// `create_item_with_history`, `patch_item`, `merge_group`, `apply_suggestion`,
/// `try_start_process` and `transition_process` atomic.
#[async_trait]
pub trait Storage: Send + Sync {
    // Benchmarks
    async fn create_benchmark(&self, benchmark: &mut Benchmark) -> Result<()>;
    /// Rewrites name, category, attributes and active flag; bumps `updated_at`
    async fn update_benchmark(&self, benchmark: &mut Benchmark) -> Result<()>;
    async fn add_variations(&self, benchmark_id: BenchmarkId, variations: &[String]) -> Result<Benchmark>;
    async fn get_benchmark(&self, id: BenchmarkId) -> Result<Option<Benchmark>>;
    async fn list_benchmarks(&self, project_id: ProjectId, entity_type: Option<EntityType>) -> Result<Vec<Benchmark>>;

    // Normalized items
    /// Assigns the id and records source, benchmark and taxonomy links
    async fn create_item(&self, item: &mut NormalizedItem) -> Result<()> {
        self.create_item_with_history(item, None).await
    }
    /// `create_item` plus the item's first taxonomy history entry, all or nothing
    async fn create_item_with_history(
        &self,
        item: &mut NormalizedItem,
        history: Option<&mut ClassificationResult>,
    ) -> Result<()>;
    async fn get_item(&self, id: ItemId) -> Result<Option<NormalizedItem>>;
    /// Writes only the fields the patch sets. `Conflict` if the item was
    /// folded into another one.
    async fn patch_item(&self, id: ItemId, patch: &ItemPatch, at: DateTime<Utc>) -> Result<NormalizedItem>;
    async fn list_items(
        &self,
        project_id: ProjectId,
        entity_type: Option<EntityType>,
        include_superseded: bool,
    ) -> Result<Vec<NormalizedItem>>;
    async fn add_item_link(&self, link: &ItemLink) -> Result<()>;
    async fn item_links(&self, item_id: ItemId) -> Result<Vec<ItemLink>>;

    // Duplicate groups
    /// Fails with `Conflict` if any member already belongs to an unmerged group
    async fn create_group(&self, group: &mut DuplicateGroup) -> Result<()>;
    async fn get_group(&self, id: GroupId) -> Result<Option<DuplicateGroup>>;
    async fn list_groups(
        &self,
        project_id: ProjectId,
        entity_type: Option<EntityType>,
        include_merged: bool,
    ) -> Result<Vec<DuplicateGroup>>;
    /// Folds items into the master and marks the group merged, all or nothing.
    /// `Conflict` if the group is already merged.
    async fn merge_group(&self, plan: &MergePlan) -> Result<NormalizedItem>;

    // Quality issues
    /// Inserts unless an unresolved issue with the same fingerprint exists
    async fn create_issue_if_absent(&self, issue: &mut QualityIssue) -> Result<bool>;
    async fn get_issue(&self, id: IssueId) -> Result<Option<QualityIssue>>;
    async fn list_issues(
        &self,
        project_id: ProjectId,
        kind: Option<IssueKind>,
        include_resolved: bool,
    ) -> Result<Vec<QualityIssue>>;
    /// `Conflict` if already resolved
    async fn resolve_issue(&self, id: IssueId, at: DateTime<Utc>) -> Result<QualityIssue>;
    /// Patches the item and marks the suggestion applied in one step.
    /// `Conflict` if the suggestion was already applied or the item is superseded.
    async fn apply_suggestion(
        &self,
        issue_id: IssueId,
        item_id: ItemId,
        patch: &ItemPatch,
        at: DateTime<Utc>,
    ) -> Result<NormalizedItem>;

    // Processes
    /// Inserts the process as `running`; `Conflict` if the project already has an active one
    async fn try_start_process(&self, process: &NormalizationProcess) -> Result<()>;
    async fn get_process(&self, id: ProcessId) -> Result<Option<NormalizationProcess>>;
    /// Progress and error list only; never changes status
    async fn update_progress(&self, id: ProcessId, progress: &ProcessProgress, errors: &[RecordError]) -> Result<()>;
    /// Compare-and-set on status. `NotFound` for unknown ids, `Conflict` when the
    /// current status is not one of `from`.
    async fn transition_process(
        &self,
        id: ProcessId,
        from: &[ProcessStatus],
        to: ProcessStatus,
        cause: Option<String>,
    ) -> Result<NormalizationProcess>;
    async fn list_processes(&self, project_id: Option<ProjectId>) -> Result<Vec<NormalizationProcess>>;

    // Classification history
    async fn append_classification(&self, result: &mut ClassificationResult) -> Result<()>;
    async fn classification_history(&self, item_id: ItemId) -> Result<Vec<ClassificationResult>>;
}

/// Master-wins attribute backfill. Address-like keys keep the longer value.
pub fn backfill_attributes(master: &mut Attributes, donor: &Attributes) {
    for (key, value) in donor {
        if value.trim().is_empty() {
            continue;
        }
        match master.get(key) {
            Some(existing) if !existing.trim().is_empty() => {
                if is_address_key(key) && value.chars().count() > existing.chars().count() {
                    master.insert(key.clone(), value.clone());
                }
            }
            _ => {
                master.insert(key.clone(), value.clone());
            }
        }
    }
}

fn is_address_key(key: &str) -> bool {
    key.contains("address")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_touches_only_set_fields() {
        let mut item = NormalizedItem::new(1, EntityType::Nomenclature, "x", "гайка м8", ProcessingLevel::Basic);
        item.category = Some("Крепеж".into());
        let patch = ItemPatch {
            normalized_name: Some("Гайка М8".into()),
            quality_score: Some(0.7),
            ..Default::default()
        };
        patch.apply_to(&mut item);
        assert_eq!(item.normalized_name, "Гайка М8");
        assert_eq!(item.category.as_deref(), Some("Крепеж"));
        assert_eq!(item.processing_level, ProcessingLevel::Basic);
        assert_eq!(item.quality_score, 0.7);
    }

    #[test]
    fn backfill_keeps_master_values_and_longer_addresses() {
        let mut master = Attributes::new();
        master.insert("inn".into(), "7707083893".into());
        master.insert("legal_address".into(), "Москва".into());
        master.insert("phone".into(), "".into());

        let mut donor = Attributes::new();
        donor.insert("inn".into(), "0000000000".into());
        donor.insert("legal_address".into(), "г. Москва, ул. Ленина, 1".into());
        donor.insert("phone".into(), "+7 495 000-00-00".into());
        donor.insert("kpp".into(), "773601001".into());

        backfill_attributes(&mut master, &donor);
        assert_eq!(master["inn"], "7707083893");
        assert_eq!(master["legal_address"], "г. Москва, ул. Ленина, 1");
        assert_eq!(master["phone"], "+7 495 000-00-00");
        assert_eq!(master["kpp"], "773601001");
    }
}
