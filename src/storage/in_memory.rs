use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::{ItemPatch, MergePlan, Storage};
use crate::domain::*;
use crate::error::{PipelineError, Result};

#[derive(Default)]
struct State {
    next_id: i64,
    benchmarks: HashMap<BenchmarkId, Benchmark>,
    items: HashMap<ItemId, NormalizedItem>,
    links: Vec<ItemLink>,
    groups: HashMap<GroupId, DuplicateGroup>,
    issues: HashMap<IssueId, QualityIssue>,
    processes: HashMap<ProcessId, NormalizationProcess>,
    history: Vec<ClassificationResult>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn link(&mut self, item_id: ItemId, kind: LinkKind, reference: String) {
        self.links.push(ItemLink {
            item_id,
            kind,
            reference,
        });
    }

    fn patch_item(&mut self, id: ItemId, patch: &ItemPatch, at: DateTime<Utc>) -> Result<NormalizedItem> {
        let item = self
            .items
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("item {}", id)))?;
        if let Some(master) = item.superseded_by {
            return Err(PipelineError::Conflict(format!("item {} was merged into {}", id, master)));
        }
        patch.apply_to(item);
        item.updated_at = at;
        Ok(item.clone())
    }
}

/// In-memory storage for development and tests. A single lock guards all maps,
/// so every trait method is atomic.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted<T, K: Ord>(mut values: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    values.sort_by_key(|v| key(v));
    values
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_benchmark(&self, benchmark: &mut Benchmark) -> Result<()> {
        let mut state = self.state.lock()?;
        benchmark.id = state.next_id();
        state.benchmarks.insert(benchmark.id, benchmark.clone());
        debug!("Created benchmark: {} with id {}", benchmark.name, benchmark.id);
        Ok(())
    }

    async fn update_benchmark(&self, benchmark: &mut Benchmark) -> Result<()> {
        let mut state = self.state.lock()?;
        let stored = state
            .benchmarks
            .get_mut(&benchmark.id)
            .ok_or_else(|| PipelineError::NotFound(format!("benchmark {}", benchmark.id)))?;
        benchmark.updated_at = Utc::now();
        stored.name = benchmark.name.clone();
        stored.category = benchmark.category.clone();
        stored.attributes = benchmark.attributes.clone();
        stored.active = benchmark.active;
        stored.updated_at = benchmark.updated_at;
        benchmark.variations = stored.variations.clone();
        Ok(())
    }

    async fn add_variations(&self, benchmark_id: BenchmarkId, variations: &[String]) -> Result<Benchmark> {
        let mut state = self.state.lock()?;
        let stored = state
            .benchmarks
            .get_mut(&benchmark_id)
            .ok_or_else(|| PipelineError::NotFound(format!("benchmark {}", benchmark_id)))?;
        for variation in variations {
            if !stored.variations.contains(variation) {
                stored.variations.push(variation.clone());
            }
        }
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn get_benchmark(&self, id: BenchmarkId) -> Result<Option<Benchmark>> {
        Ok(self.state.lock()?.benchmarks.get(&id).cloned())
    }

    async fn list_benchmarks(&self, project_id: ProjectId, entity_type: Option<EntityType>) -> Result<Vec<Benchmark>> {
        let state = self.state.lock()?;
        let found = state
            .benchmarks
            .values()
            .filter(|b| b.project_id == project_id && entity_type.map_or(true, |t| b.entity_type == t))
            .cloned()
            .collect();
        Ok(sorted(found, |b: &Benchmark| b.id))
    }

    async fn create_item_with_history(
        &self,
        item: &mut NormalizedItem,
        history: Option<&mut ClassificationResult>,
    ) -> Result<()> {
        let mut state = self.state.lock()?;
        item.id = state.next_id();
        if !item.source_ref.is_empty() {
            state.link(item.id, LinkKind::Source, item.source_ref.clone());
        }
        if let Some(benchmark_id) = item.benchmark_id {
            state.link(item.id, LinkKind::Benchmark, benchmark_id.to_string());
        }
        if let Some(code) = &item.taxonomy_code {
            state.link(item.id, LinkKind::Taxonomy, code.clone());
        }
        if let Some(entry) = history {
            entry.id = state.next_id();
            entry.item_id = item.id;
            state.history.push(entry.clone());
        }
        state.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<NormalizedItem>> {
        Ok(self.state.lock()?.items.get(&id).cloned())
    }

    async fn patch_item(&self, id: ItemId, patch: &ItemPatch, at: DateTime<Utc>) -> Result<NormalizedItem> {
        self.state.lock()?.patch_item(id, patch, at)
    }

    async fn list_items(
        &self,
        project_id: ProjectId,
        entity_type: Option<EntityType>,
        include_superseded: bool,
    ) -> Result<Vec<NormalizedItem>> {
        let state = self.state.lock()?;
        let found = state
            .items
            .values()
            .filter(|i| i.project_id == project_id)
            .filter(|i| entity_type.map_or(true, |t| i.entity_type == t))
            .filter(|i| include_superseded || !i.is_superseded())
            .cloned()
            .collect();
        Ok(sorted(found, |i: &NormalizedItem| i.id))
    }

    async fn add_item_link(&self, link: &ItemLink) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.items.contains_key(&link.item_id) {
            return Err(PipelineError::NotFound(format!("item {}", link.item_id)));
        }
        state.links.push(link.clone());
        Ok(())
    }

    async fn item_links(&self, item_id: ItemId) -> Result<Vec<ItemLink>> {
        let state = self.state.lock()?;
        Ok(state.links.iter().filter(|l| l.item_id == item_id).cloned().collect())
    }

    async fn create_group(&self, group: &mut DuplicateGroup) -> Result<()> {
        let mut state = self.state.lock()?;
        for item_id in &group.item_ids {
            if !state.items.contains_key(item_id) {
                return Err(PipelineError::NotFound(format!("item {}", item_id)));
            }
            let taken = state
                .groups
                .values()
                .any(|g| !g.merged && g.contains(*item_id));
            if taken {
                return Err(PipelineError::Conflict(format!(
                    "item {} already belongs to an open duplicate group",
                    item_id
                )));
            }
        }
        group.id = state.next_id();
        state.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn get_group(&self, id: GroupId) -> Result<Option<DuplicateGroup>> {
        Ok(self.state.lock()?.groups.get(&id).cloned())
    }

    async fn list_groups(
        &self,
        project_id: ProjectId,
        entity_type: Option<EntityType>,
        include_merged: bool,
    ) -> Result<Vec<DuplicateGroup>> {
        let state = self.state.lock()?;
        let found = state
            .groups
            .values()
            .filter(|g| g.project_id == project_id)
            .filter(|g| entity_type.map_or(true, |t| g.entity_type == t))
            .filter(|g| include_merged || !g.merged)
            .cloned()
            .collect();
        Ok(sorted(found, |g: &DuplicateGroup| g.id))
    }

    async fn merge_group(&self, plan: &MergePlan) -> Result<NormalizedItem> {
        let mut state = self.state.lock()?;

        // Validate everything before the first write.
        let group = state
            .groups
            .get(&plan.group_id)
            .ok_or_else(|| PipelineError::NotFound(format!("duplicate group {}", plan.group_id)))?;
        if group.merged {
            return Err(PipelineError::Conflict(format!(
                "duplicate group {} is already merged",
                plan.group_id
            )));
        }
        let mut folded_total = 0u32;
        for id in &plan.folded_ids {
            let item = state
                .items
                .get(id)
                .ok_or_else(|| PipelineError::NotFound(format!("item {}", id)))?;
            if item.is_superseded() {
                return Err(PipelineError::Conflict(format!("item {} is already superseded", id)));
            }
            folded_total += 1 + item.merged_count;
        }
        if !state.items.contains_key(&plan.master_id) {
            return Err(PipelineError::NotFound(format!("item {}", plan.master_id)));
        }

        for id in &plan.folded_ids {
            if let Some(item) = state.items.get_mut(id) {
                item.superseded_by = Some(plan.master_id);
                item.updated_at = plan.merged_at;
            }
        }
        for link in state.links.iter_mut() {
            if plan.folded_ids.contains(&link.item_id) {
                link.item_id = plan.master_id;
            }
        }
        for entry in state.history.iter_mut() {
            if plan.folded_ids.contains(&entry.item_id) {
                entry.item_id = plan.master_id;
            }
        }
        if let Some(group) = state.groups.get_mut(&plan.group_id) {
            group.merged = true;
            group.merged_at = Some(plan.merged_at);
            group.merged_master_id = Some(plan.master_id);
        }
        let master = state
            .items
            .get_mut(&plan.master_id)
            .ok_or_else(|| PipelineError::NotFound(format!("item {}", plan.master_id)))?;
        master.merged_count += folded_total;
        master.attributes = plan.attributes.clone();
        master.category = plan.category.clone();
        master.updated_at = plan.merged_at;
        Ok(master.clone())
    }

    async fn create_issue_if_absent(&self, issue: &mut QualityIssue) -> Result<bool> {
        let mut state = self.state.lock()?;
        let exists = state
            .issues
            .values()
            .any(|i| !i.resolved && i.fingerprint == issue.fingerprint);
        if exists {
            return Ok(false);
        }
        issue.id = state.next_id();
        state.issues.insert(issue.id, issue.clone());
        Ok(true)
    }

    async fn get_issue(&self, id: IssueId) -> Result<Option<QualityIssue>> {
        Ok(self.state.lock()?.issues.get(&id).cloned())
    }

    async fn list_issues(
        &self,
        project_id: ProjectId,
        kind: Option<IssueKind>,
        include_resolved: bool,
    ) -> Result<Vec<QualityIssue>> {
        let state = self.state.lock()?;
        let found = state
            .issues
            .values()
            .filter(|i| i.project_id == project_id)
            .filter(|i| kind.map_or(true, |k| i.kind == k))
            .filter(|i| include_resolved || !i.resolved)
            .cloned()
            .collect();
        Ok(sorted(found, |i: &QualityIssue| i.id))
    }

    async fn resolve_issue(&self, id: IssueId, at: DateTime<Utc>) -> Result<QualityIssue> {
        let mut state = self.state.lock()?;
        let issue = state
            .issues
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("quality issue {}", id)))?;
        if issue.resolved {
            return Err(PipelineError::Conflict(format!("quality issue {} is already resolved", id)));
        }
        issue.resolved = true;
        issue.resolved_at = Some(at);
        Ok(issue.clone())
    }

    async fn apply_suggestion(
        &self,
        issue_id: IssueId,
        item_id: ItemId,
        patch: &ItemPatch,
        at: DateTime<Utc>,
    ) -> Result<NormalizedItem> {
        let mut state = self.state.lock()?;
        let issue = state
            .issues
            .get(&issue_id)
            .ok_or_else(|| PipelineError::NotFound(format!("quality issue {}", issue_id)))?;
        if issue.resolved {
            return Err(PipelineError::Conflict(format!("suggestion {} is already applied", issue_id)));
        }
        let item = state.patch_item(item_id, patch, at)?;
        if let Some(issue) = state.issues.get_mut(&issue_id) {
            issue.resolved = true;
            issue.resolved_at = Some(at);
        }
        Ok(item)
    }

    async fn try_start_process(&self, process: &NormalizationProcess) -> Result<()> {
        let mut state = self.state.lock()?;
        let active = state
            .processes
            .values()
            .find(|p| p.project_id == process.project_id && p.status.is_active());
        if let Some(active) = active {
            return Err(PipelineError::Conflict(format!(
                "project {} already has an active process {}",
                process.project_id, active.id
            )));
        }
        let mut stored = process.clone();
        stored.status = ProcessStatus::Running;
        state.processes.insert(stored.id, stored);
        Ok(())
    }

    async fn get_process(&self, id: ProcessId) -> Result<Option<NormalizationProcess>> {
        Ok(self.state.lock()?.processes.get(&id).cloned())
    }

    async fn update_progress(&self, id: ProcessId, progress: &ProcessProgress, errors: &[RecordError]) -> Result<()> {
        let mut state = self.state.lock()?;
        let process = state
            .processes
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("process {}", id)))?;
        process.progress = progress.clone();
        process.errors = errors.to_vec();
        process.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_process(
        &self,
        id: ProcessId,
        from: &[ProcessStatus],
        to: ProcessStatus,
        cause: Option<String>,
    ) -> Result<NormalizationProcess> {
        let mut state = self.state.lock()?;
        let process = state
            .processes
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("process {}", id)))?;
        if !from.contains(&process.status) {
            return Err(PipelineError::Conflict(format!(
                "process {} is {}, cannot move to {}",
                id, process.status, to
            )));
        }
        let now = Utc::now();
        process.status = to;
        if cause.is_some() {
            process.cause = cause;
        }
        if to.is_terminal() {
            process.finished_at = Some(now);
        }
        process.updated_at = now;
        Ok(process.clone())
    }

    async fn list_processes(&self, project_id: Option<ProjectId>) -> Result<Vec<NormalizationProcess>> {
        let state = self.state.lock()?;
        let found = state
            .processes
            .values()
            .filter(|p| project_id.map_or(true, |id| p.project_id == id))
            .cloned()
            .collect();
        Ok(sorted(found, |p: &NormalizationProcess| p.started_at))
    }

    async fn append_classification(&self, result: &mut ClassificationResult) -> Result<()> {
        let mut state = self.state.lock()?;
        result.id = state.next_id();
        state.history.push(result.clone());
        Ok(())
    }

    async fn classification_history(&self, item_id: ItemId) -> Result<Vec<ClassificationResult>> {
        let state = self.state.lock()?;
        Ok(state.history.iter().filter(|h| h.item_id == item_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn item(name: &str) -> NormalizedItem {
        NormalizedItem::new(1, EntityType::Nomenclature, name, name, ProcessingLevel::Basic)
    }

    #[tokio::test]
    async fn second_active_process_per_project_conflicts() {
        let storage = InMemoryStorage::new();
        let first = NormalizationProcess::new(7);
        storage.try_start_process(&first).await.unwrap();

        let err = storage
            .try_start_process(&NormalizationProcess::new(7))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        storage.try_start_process(&NormalizationProcess::new(8)).await.unwrap();

        storage
            .transition_process(first.id, &[ProcessStatus::Running], ProcessStatus::Completed, None)
            .await
            .unwrap();
        storage.try_start_process(&NormalizationProcess::new(7)).await.unwrap();
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let storage = InMemoryStorage::new();
        let process = NormalizationProcess::new(1);
        storage.try_start_process(&process).await.unwrap();

        let err = storage
            .transition_process(process.id, &[ProcessStatus::Stopping], ProcessStatus::Stopped, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let err = storage
            .transition_process(Uuid::new_v4(), &[ProcessStatus::Running], ProcessStatus::Stopping, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn item_cannot_join_two_open_groups() {
        let storage = InMemoryStorage::new();
        let mut a = item("a");
        let mut b = item("b");
        let mut c = item("c");
        for i in [&mut a, &mut b, &mut c] {
            storage.create_item(i).await.unwrap();
        }
        let mut group = DuplicateGroup {
            id: 0,
            project_id: 1,
            entity_type: EntityType::Nomenclature,
            similarity: 0.95,
            method: DetectionMethod::FuzzyName,
            suggested_master_id: a.id,
            item_ids: vec![a.id, b.id],
            merged: false,
            merged_at: None,
            merged_master_id: None,
            created_at: Utc::now(),
        };
        storage.create_group(&mut group).await.unwrap();

        let mut overlapping = group.clone();
        overlapping.item_ids = vec![b.id, c.id];
        overlapping.suggested_master_id = c.id;
        let err = storage.create_group(&mut overlapping).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn superseded_items_reject_patches() {
        let storage = InMemoryStorage::new();
        let mut master = item("Гайка М8");
        let mut donor = item("гайка м8");
        storage.create_item(&mut master).await.unwrap();
        storage.create_item(&mut donor).await.unwrap();

        let patched = storage
            .patch_item(donor.id, &ItemPatch::quality_score(0.4), Utc::now())
            .await
            .unwrap();
        assert_eq!(patched.quality_score, 0.4);
        assert_eq!(patched.normalized_name, "гайка м8");

        let mut group = DuplicateGroup {
            id: 0,
            project_id: 1,
            entity_type: EntityType::Nomenclature,
            similarity: 1.0,
            method: DetectionMethod::ExactName,
            suggested_master_id: master.id,
            item_ids: vec![master.id, donor.id],
            merged: false,
            merged_at: None,
            merged_master_id: None,
            created_at: Utc::now(),
        };
        storage.create_group(&mut group).await.unwrap();
        storage
            .merge_group(&MergePlan {
                group_id: group.id,
                master_id: master.id,
                folded_ids: vec![donor.id],
                attributes: Attributes::new(),
                category: None,
                merged_at: Utc::now(),
            })
            .await
            .unwrap();

        let err = storage
            .patch_item(donor.id, &ItemPatch::quality_score(0.9), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(storage.get_item(donor.id).await.unwrap().unwrap().quality_score, 0.4);
    }

    #[tokio::test]
    async fn item_and_history_land_together() {
        let storage = InMemoryStorage::new();
        let mut target = item("Болт М6");
        target.source_ref = "row-1".into();
        target.taxonomy_code = Some("25.94.11".into());
        let mut entry = ClassificationResult {
            id: 0,
            item_id: 0,
            path: Vec::new(),
            confidence: 0.8,
            level_reached: 3,
            complete: true,
            created_at: Utc::now(),
        };
        storage.create_item_with_history(&mut target, Some(&mut entry)).await.unwrap();

        assert_eq!(entry.item_id, target.id);
        assert_eq!(storage.classification_history(target.id).await.unwrap().len(), 1);
        let kinds: Vec<LinkKind> = storage
            .item_links(target.id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.kind)
            .collect();
        assert_eq!(kinds, vec![LinkKind::Source, LinkKind::Taxonomy]);
    }

    #[tokio::test]
    async fn open_issue_fingerprints_are_unique() {
        let storage = InMemoryStorage::new();
        let mut target = item("a");
        storage.create_item(&mut target).await.unwrap();
        let mut issue = QualityIssue {
            id: 0,
            project_id: 1,
            item_id: target.id,
            kind: IssueKind::Violation,
            rule: "required_category".into(),
            severity: Severity::Warning,
            category: "completeness".into(),
            description: "category is missing".into(),
            fingerprint: "fp".into(),
            confidence: 1.0,
            auto_applyable: false,
            action: None,
            resolved: false,
            resolved_at: None,
            created_at: Utc::now(),
        };
        assert!(storage.create_issue_if_absent(&mut issue.clone()).await.unwrap());
        assert!(!storage.create_issue_if_absent(&mut issue).await.unwrap());

        let open = storage.list_issues(1, None, false).await.unwrap();
        storage.resolve_issue(open[0].id, Utc::now()).await.unwrap();
        assert!(storage.create_issue_if_absent(&mut issue).await.unwrap());
    }
}
