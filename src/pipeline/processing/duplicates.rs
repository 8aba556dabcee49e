use chrono::Utc;
use petgraph::unionfind::UnionFind;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

use crate::domain::{DetectionMethod, DuplicateGroup, EntityType, GroupId, ItemId, NormalizedItem, ProjectId};
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::processing::similarity::{key_similarity, normalize_key};
use crate::storage::{backfill_attributes, MergePlan, Storage};

/// Highest quality score, then most complete, then lowest id
pub fn pick_master(items: &[&NormalizedItem]) -> Option<ItemId> {
    items
        .iter()
        .max_by(|a, b| {
            a.quality_score
                .partial_cmp(&b.quality_score)
                .unwrap_or(Ordering::Equal)
                .then(a.completeness().cmp(&b.completeness()))
                .then(b.id.cmp(&a.id))
        })
        .map(|item| item.id)
}

pub struct DuplicateDetector {
    storage: Arc<dyn Storage>,
    threshold: f64,
    candidate_window: usize,
}

impl DuplicateDetector {
    pub fn new(storage: Arc<dyn Storage>, threshold: f64, candidate_window: usize) -> Self {
        Self {
            storage,
            threshold,
            candidate_window,
        }
    }

    /// Groups similar live items and persists new groups. Returns the groups
    /// already open for the scope followed by the ones created now.
    #[instrument(skip(self))]
    pub async fn detect(&self, project_id: ProjectId, entity_type: EntityType) -> Result<Vec<DuplicateGroup>> {
        let mut groups = self.storage.list_groups(project_id, Some(entity_type), false).await?;
        let grouped: HashSet<ItemId> = groups.iter().flat_map(|g| g.item_ids.iter().copied()).collect();

        let mut items: Vec<NormalizedItem> = self
            .storage
            .list_items(project_id, Some(entity_type), false)
            .await?
            .into_iter()
            .filter(|item| !grouped.contains(&item.id))
            .collect();
        // Newest items win the window.
        items.sort_by(|a, b| b.id.cmp(&a.id));
        items.truncate(self.candidate_window);
        items.sort_by_key(|item| item.id);

        let mut created = 0;
        for mut group in self.cluster(project_id, entity_type, &items) {
            match self.storage.create_group(&mut group).await {
                Ok(()) => {
                    created += 1;
                    groups.push(group);
                }
                Err(PipelineError::Conflict(msg)) => {
                    warn!(project_id, "Skipping duplicate group claimed concurrently: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }
        metrics::duplicates::groups_detected(created);
        info!(
            project_id,
            entity_type = entity_type.as_str(),
            candidates = items.len(),
            created,
            open = groups.len(),
            "Duplicate detection finished"
        );
        Ok(groups)
    }

    /// Union-find over every pair scoring at or above the threshold
    pub fn cluster(
        &self,
        project_id: ProjectId,
        entity_type: EntityType,
        items: &[NormalizedItem],
    ) -> Vec<DuplicateGroup> {
        let keys: Vec<String> = items.iter().map(|i| normalize_key(&i.normalized_name)).collect();
        let mut uf = UnionFind::<usize>::new(items.len());
        let mut edges = Vec::new();
        for i in 0..items.len() {
            for j in (i + 1)..items.len() {
                let score = key_similarity(&keys[i], &keys[j]);
                if score >= self.threshold {
                    uf.union(i, j);
                    edges.push((i, score));
                }
            }
        }

        let mut weakest: HashMap<usize, f64> = HashMap::new();
        for (i, score) in edges {
            let root = uf.find_mut(i);
            let entry = weakest.entry(root).or_insert(score);
            *entry = entry.min(score);
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..items.len() {
            let root = uf.find_mut(i);
            components.entry(root).or_default().push(i);
        }

        let now = Utc::now();
        let mut out: Vec<DuplicateGroup> = components
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .filter_map(|(root, members)| {
                let refs: Vec<&NormalizedItem> = members.iter().map(|&i| &items[i]).collect();
                let master = pick_master(&refs)?;
                let first_key = &keys[members[0]];
                let method = if members.iter().all(|&i| &keys[i] == first_key) {
                    DetectionMethod::ExactName
                } else {
                    DetectionMethod::FuzzyName
                };
                Some(DuplicateGroup {
                    id: 0,
                    project_id,
                    entity_type,
                    similarity: weakest.get(&root).copied().unwrap_or(1.0),
                    method,
                    suggested_master_id: master,
                    item_ids: refs.iter().map(|item| item.id).collect(),
                    merged: false,
                    merged_at: None,
                    merged_master_id: None,
                    created_at: now,
                })
            })
            .collect();
        out.sort_by_key(|g| g.item_ids[0]);
        out
    }
}

/// Keyed async locks so only merges of the same group serialize
#[derive(Default)]
struct GroupLocks {
    inner: Mutex<HashMap<GroupId, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupLocks {
    fn acquire(&self, group_id: GroupId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut map = self.inner.lock()?;
        Ok(map.entry(group_id).or_default().clone())
    }

    fn release(&self, group_id: GroupId, lock: Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut map) = self.inner.lock() {
            // Map plus the caller's handle means no one else is waiting.
            if Arc::strong_count(&lock) <= 2 {
                map.remove(&group_id);
            }
        }
    }
}

pub struct DuplicateMerger {
    storage: Arc<dyn Storage>,
    locks: GroupLocks,
}

impl DuplicateMerger {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            locks: GroupLocks::default(),
        }
    }

    /// Folds `member_ids` into `master_id`. All or nothing; a merged group
    /// cannot be merged again.
    #[instrument(skip(self))]
    pub async fn merge(&self, group_id: GroupId, master_id: ItemId, member_ids: &[ItemId]) -> Result<NormalizedItem> {
        let members: BTreeSet<ItemId> = member_ids.iter().copied().collect();
        if members.is_empty() {
            return Err(PipelineError::ValidationFailed("no members to merge".into()));
        }

        let lock = self.locks.acquire(group_id)?;
        let result = {
            let _guard = lock.lock().await;
            self.merge_locked(group_id, master_id, &members).await
        };
        self.locks.release(group_id, lock);
        result
    }

    async fn merge_locked(
        &self,
        group_id: GroupId,
        master_id: ItemId,
        members: &BTreeSet<ItemId>,
    ) -> Result<NormalizedItem> {
        let group = self
            .storage
            .get_group(group_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("duplicate group {}", group_id)))?;
        if group.merged {
            return Err(PipelineError::Conflict(format!("group {} is already merged", group_id)));
        }
        if !group.contains(master_id) {
            return Err(PipelineError::ValidationFailed(format!(
                "master {} is not a member of group {}",
                master_id, group_id
            )));
        }
        if members.contains(&master_id) {
            return Err(PipelineError::ValidationFailed("master cannot be folded into itself".into()));
        }
        if let Some(stranger) = members.iter().find(|id| !group.contains(**id)) {
            return Err(PipelineError::ValidationFailed(format!(
                "item {} is not a member of group {}",
                stranger, group_id
            )));
        }

        let master = self
            .storage
            .get_item(master_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("item {}", master_id)))?;
        let mut attributes = master.attributes.clone();
        let mut category = master.category.clone();
        for id in members {
            let donor = self
                .storage
                .get_item(*id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("item {}", id)))?;
            backfill_attributes(&mut attributes, &donor.attributes);
            if category.as_deref().map_or(true, |c| c.trim().is_empty()) {
                category = donor.category.clone();
            }
        }

        let plan = MergePlan {
            group_id,
            master_id,
            folded_ids: members.iter().copied().collect(),
            attributes,
            category,
            merged_at: Utc::now(),
        };
        let merged = self.storage.merge_group(&plan).await?;
        metrics::duplicates::merged(plan.folded_ids.len());
        info!(
            group_id,
            master_id,
            folded = plan.folded_ids.len(),
            merged_count = merged.merged_count,
            "Duplicate group merged"
        );
        Ok(merged)
    }
}
