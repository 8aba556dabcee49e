use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::domain::{ClassificationResult, ItemId, NormalizedItem, ProjectId, TaxonomyNode, TaxonomyStep};
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::processing::similarity::{key_similarity, normalize_key};
use crate::storage::Storage;

/// Fixed classification tree rebuilt from flat `(code, name, parent_code)` nodes
#[derive(Debug, Default)]
pub struct TaxonomyTree {
    nodes: HashMap<String, TaxonomyNode>,
    /// Node name keys, precomputed for scoring
    keys: HashMap<String, String>,
    children: HashMap<Option<String>, Vec<String>>,
}

impl TaxonomyTree {
    pub fn from_nodes(nodes: Vec<TaxonomyNode>) -> Result<Self> {
        let mut tree = TaxonomyTree::default();
        for node in nodes {
            if node.code.trim().is_empty() {
                return Err(PipelineError::ValidationFailed("taxonomy node with empty code".into()));
            }
            if tree.nodes.contains_key(&node.code) {
                return Err(PipelineError::ValidationFailed(format!(
                    "duplicate taxonomy code '{}'",
                    node.code
                )));
            }
            tree.keys.insert(node.code.clone(), normalize_key(&node.name));
            tree.nodes.insert(node.code.clone(), node);
        }

        for node in tree.nodes.values() {
            if let Some(parent) = &node.parent_code {
                if !tree.nodes.contains_key(parent) {
                    return Err(PipelineError::ValidationFailed(format!(
                        "taxonomy node '{}' references unknown parent '{}'",
                        node.code, parent
                    )));
                }
            }
            tree.children
                .entry(node.parent_code.clone())
                .or_default()
                .push(node.code.clone());
        }
        for codes in tree.children.values_mut() {
            codes.sort();
        }

        // Every node must be reachable from the root, otherwise there is a cycle.
        let mut seen = HashSet::new();
        let mut stack: Vec<&String> = tree.children.get(&None).map(|c| c.iter().collect()).unwrap_or_default();
        while let Some(code) = stack.pop() {
            if seen.insert(code.clone()) {
                if let Some(kids) = tree.children.get(&Some(code.clone())) {
                    stack.extend(kids.iter());
                }
            }
        }
        if seen.len() != tree.nodes.len() {
            return Err(PipelineError::ValidationFailed(
                "taxonomy contains a cycle or unreachable nodes".into(),
            ));
        }
        Ok(tree)
    }

    /// Loads a JSON array of nodes
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let nodes: Vec<TaxonomyNode> = serde_json::from_str(&content)?;
        let tree = Self::from_nodes(nodes)?;
        info!(path = %path.as_ref().display(), nodes = tree.len(), "Loaded taxonomy");
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&TaxonomyNode> {
        self.nodes.get(code)
    }

    /// Children of `parent`, or the top level for `None`
    pub fn children(&self, parent: Option<&str>) -> Vec<&TaxonomyNode> {
        self.children
            .get(&parent.map(str::to_string))
            .map(|codes| codes.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    pub fn is_leaf(&self, code: &str) -> bool {
        self.children
            .get(&Some(code.to_string()))
            .map_or(true, |c| c.is_empty())
    }
}

/// Result of walking the tree for one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaxonomyResolution {
    pub path: Vec<TaxonomyStep>,
    /// Lowest score along the path, 0 when nothing was accepted
    pub confidence: f64,
    pub level_reached: usize,
    /// The walk ended on a leaf
    pub complete: bool,
}

impl TaxonomyResolution {
    pub fn code(&self) -> Option<&str> {
        self.path.last().map(|s| s.code.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccuracyReport {
    pub resolutions: usize,
    pub complete: usize,
    pub partial: usize,
    pub unresolved: usize,
    pub average_confidence: f64,
    pub by_level: BTreeMap<usize, usize>,
}

const DEFAULT_CACHE_CAPACITY: usize = 10_000;

type Slot = (String, Option<String>);
type Pick = Option<(String, f64)>;

/// Per-level picks keyed by (lookup key, parent code). Least recently used
/// entries are dropped in batches once the capacity is reached.
#[derive(Debug)]
struct LevelCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<Slot, (Pick, u64)>,
}

impl LevelCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, slot: &Slot) -> Option<Pick> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(slot).map(|(pick, used)| {
            *used = tick;
            pick.clone()
        })
    }

    fn insert(&mut self, slot: Slot, pick: Pick) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&slot) {
            self.evict();
        }
        self.tick += 1;
        self.entries.insert(slot, (pick, self.tick));
    }

    /// Drops the least recently used tenth (at least one entry)
    fn evict(&mut self) {
        let count = (self.capacity / 10).max(1);
        let mut ticks: Vec<u64> = self.entries.values().map(|(_, used)| *used).collect();
        ticks.sort_unstable();
        if let Some(cutoff) = ticks.get(count.min(ticks.len()).saturating_sub(1)).copied() {
            self.entries.retain(|_, (_, used)| *used > cutoff);
            metrics::taxonomy::cache_evicted(count);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Level-by-level descent that never goes below the acceptance threshold
pub struct TaxonomyMatcher {
    tree: Arc<TaxonomyTree>,
    storage: Arc<dyn Storage>,
    threshold: f64,
    max_depth: usize,
    cache: Mutex<LevelCache>,
}

impl TaxonomyMatcher {
    pub fn new(tree: Arc<TaxonomyTree>, storage: Arc<dyn Storage>, threshold: f64, max_depth: usize) -> Self {
        Self {
            tree,
            storage,
            threshold,
            max_depth,
            cache: Mutex::new(LevelCache::new(DEFAULT_CACHE_CAPACITY)),
        }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = Mutex::new(LevelCache::new(capacity));
        self
    }

    pub fn tree(&self) -> &TaxonomyTree {
        &self.tree
    }

    /// Walks the tree for `name`, scoring children against the name and, when
    /// present, the category. Pure apart from the level cache.
    pub fn resolve_path(&self, name: &str, category: Option<&str>) -> TaxonomyResolution {
        let name_key = normalize_key(name);
        let category_key = category.map(normalize_key).filter(|k| !k.is_empty());
        let cache_key = match &category_key {
            Some(c) => format!("{}|{}", name_key, c),
            None => name_key.clone(),
        };

        let mut path: Vec<TaxonomyStep> = Vec::new();
        let mut parent: Option<String> = None;
        while path.len() < self.max_depth {
            let pick = self.best_child(&cache_key, parent.as_deref(), &name_key, category_key.as_deref());
            match pick {
                Some((code, score)) => {
                    let name = self.tree.get(&code).map(|n| n.name.clone()).unwrap_or_default();
                    path.push(TaxonomyStep {
                        code: code.clone(),
                        name,
                        score,
                    });
                    parent = Some(code);
                }
                None => break,
            }
        }

        let complete = parent.as_deref().map_or(false, |code| self.tree.is_leaf(code));
        let confidence = path.iter().map(|s| s.score).fold(None, |acc: Option<f64>, s| {
            Some(acc.map_or(s, |a| a.min(s)))
        });
        let resolution = TaxonomyResolution {
            level_reached: path.len(),
            confidence: confidence.unwrap_or(0.0),
            complete,
            path,
        };
        metrics::taxonomy::resolved(resolution.level_reached, resolution.complete);
        debug!(
            level_reached = resolution.level_reached,
            complete = resolution.complete,
            "Taxonomy resolved"
        );
        resolution
    }

    fn best_child(
        &self,
        cache_key: &str,
        parent: Option<&str>,
        name_key: &str,
        category_key: Option<&str>,
    ) -> Option<(String, f64)> {
        let slot = (cache_key.to_string(), parent.map(str::to_string));
        if let Some(hit) = self.cache.lock().ok().and_then(|mut c| c.get(&slot)) {
            return hit;
        }

        let mut best: Option<(String, f64)> = None;
        for child in self.tree.children(parent) {
            let node_key = match self.tree.keys.get(&child.code) {
                Some(k) => k.as_str(),
                None => continue,
            };
            let by_name = key_similarity(name_key, node_key);
            let by_category = category_key.map_or(0.0, |c| key_similarity(c, node_key));
            let score = by_name.max(by_category);
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((child.code.clone(), score));
            }
        }
        let accepted = best.filter(|(_, score)| *score >= self.threshold);

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(slot, accepted.clone());
        }
        accepted
    }

    /// Unsaved history entry for a resolution
    pub fn history_entry(&self, item_id: ItemId, resolution: &TaxonomyResolution) -> ClassificationResult {
        ClassificationResult {
            id: 0,
            item_id,
            path: resolution.path.clone(),
            confidence: resolution.confidence,
            level_reached: resolution.level_reached,
            complete: resolution.complete,
            created_at: Utc::now(),
        }
    }

    /// Appends a resolution to the item's audit history
    pub async fn record(&self, item_id: ItemId, resolution: &TaxonomyResolution) -> Result<ClassificationResult> {
        let mut entry = self.history_entry(item_id, resolution);
        self.storage.append_classification(&mut entry).await?;
        Ok(entry)
    }

    /// Resolves an existing item and records the outcome
    pub async fn resolve(&self, item: &NormalizedItem) -> Result<TaxonomyResolution> {
        let resolution = self.resolve_path(&item.normalized_name, item.category.as_deref());
        self.record(item.id, &resolution).await?;
        Ok(resolution)
    }

    pub async fn history(&self, item_id: ItemId) -> Result<Vec<ClassificationResult>> {
        self.storage.classification_history(item_id).await
    }

    /// Complete versus partial resolutions across a project's live items
    pub async fn accuracy_report(&self, project_id: ProjectId) -> Result<AccuracyReport> {
        let mut report = AccuracyReport::default();
        let mut confidence_sum = 0.0;
        for item in self.storage.list_items(project_id, None, false).await? {
            for entry in self.storage.classification_history(item.id).await? {
                report.resolutions += 1;
                confidence_sum += entry.confidence;
                *report.by_level.entry(entry.level_reached).or_default() += 1;
                if entry.complete {
                    report.complete += 1;
                } else if entry.level_reached == 0 {
                    report.unresolved += 1;
                } else {
                    report.partial += 1;
                }
            }
        }
        if report.resolutions > 0 {
            report.average_confidence = confidence_sum / report.resolutions as f64;
        }
        Ok(report)
    }
}
