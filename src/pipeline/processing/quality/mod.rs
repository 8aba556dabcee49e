use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::QualityConfig;
use crate::domain::{
    EntityType, IssueId, IssueKind, ItemId, NormalizedItem, ProcessingLevel, ProjectId, QualityIssue, Severity,
    SuggestionAction,
};
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::processing::benchmark::BenchmarkMatcher;
use crate::storage::{ItemPatch, Storage};

pub mod rules;
pub mod suggestions;

pub use rules::{base_score, default_rules, inn_is_valid, Finding, ValidationRule};
pub use suggestions::{Proposal, SuggestionEngine};

/// Records an analysis pass covers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityScope {
    pub project_id: ProjectId,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
}

impl QualityScope {
    pub fn project(project_id: ProjectId) -> Self {
        Self {
            project_id,
            entity_type: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityScores {
    pub items: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Mean item score as a percentage
    pub overall_percentage: f64,
    pub by_severity: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub scope: QualityScope,
    /// Open violations in scope
    pub violations: Vec<QualityIssue>,
    /// Open suggestions in scope
    pub suggestions: Vec<QualityIssue>,
    pub scores: QualityScores,
    pub new_violations: usize,
    pub new_suggestions: usize,
}

/// Stable identity of an open issue: one per item and rule
pub fn fingerprint(item_id: ItemId, rule: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(rule.as_bytes());
    hex::encode(hasher.finalize())
}

/// Production score minus severity deductions, clamped to `[0, 1]`
pub fn item_score(item: &NormalizedItem, severities: &[Severity]) -> f64 {
    let deduction: f64 = severities.iter().map(Severity::deduction).sum();
    (base_score(item) - deduction).clamp(0.0, 1.0)
}

pub struct QualityAnalyzer {
    storage: Arc<dyn Storage>,
    matcher: Arc<BenchmarkMatcher>,
    config: QualityConfig,
    suggestion_threshold: f64,
    rules: Vec<Box<dyn ValidationRule>>,
}

impl QualityAnalyzer {
    pub fn new(
        storage: Arc<dyn Storage>,
        matcher: Arc<BenchmarkMatcher>,
        config: QualityConfig,
        suggestion_threshold: f64,
    ) -> Self {
        Self {
            storage,
            matcher,
            config,
            suggestion_threshold,
            rules: default_rules(),
        }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    fn findings(&self, item: &NormalizedItem) -> Vec<Finding> {
        self.rules
            .iter()
            .filter_map(|rule| rule.check(item, &self.config))
            .collect()
    }

    /// Score an item would get from the current rules
    pub fn score(&self, item: &NormalizedItem) -> f64 {
        let severities: Vec<Severity> = self.findings(item).iter().map(|f| f.severity).collect();
        item_score(item, &severities)
    }

    fn issue(&self, item: &NormalizedItem, kind: IssueKind, rule: &str) -> QualityIssue {
        QualityIssue {
            id: 0,
            project_id: item.project_id,
            item_id: item.id,
            kind,
            rule: rule.to_string(),
            severity: Severity::Info,
            category: String::new(),
            description: String::new(),
            fingerprint: fingerprint(item.id, rule),
            confidence: 1.0,
            auto_applyable: false,
            action: None,
            resolved: false,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    /// Violation detection and suggestion generation over the scope, then
    /// aggregate scoring. Re-running never duplicates open issues.
    #[instrument(skip(self), fields(project_id = scope.project_id))]
    pub async fn analyze(&self, scope: QualityScope) -> Result<QualityReport> {
        let items = self
            .storage
            .list_items(scope.project_id, scope.entity_type, false)
            .await?;
        let neighbours = suggestions::neighbour_categories(&items);
        let engine = SuggestionEngine::new(&self.matcher, self.suggestion_threshold);

        let mut new_violations = 0;
        let mut new_suggestions = 0;
        let mut scores = QualityScores {
            items: items.len(),
            ..Default::default()
        };
        let mut score_sum = 0.0;

        for item in &items {
            let findings = self.findings(item);
            for finding in &findings {
                let mut issue = self.issue(item, IssueKind::Violation, finding.rule);
                issue.severity = finding.severity;
                issue.category = finding.category.to_string();
                issue.description = finding.description.clone();
                if self.storage.create_issue_if_absent(&mut issue).await? {
                    new_violations += 1;
                    metrics::quality::issue_created(IssueKind::Violation.as_str(), finding.rule);
                }
            }

            for proposal in engine.propose(item, &neighbours).await? {
                let mut issue = self.issue(item, IssueKind::Suggestion, proposal.rule);
                issue.category = "improvement".to_string();
                issue.description = proposal.description;
                issue.confidence = proposal.confidence;
                issue.auto_applyable = proposal.auto_applyable;
                issue.action = Some(proposal.action);
                if self.storage.create_issue_if_absent(&mut issue).await? {
                    new_suggestions += 1;
                    metrics::quality::issue_created(IssueKind::Suggestion.as_str(), proposal.rule);
                }
            }

            let severities: Vec<Severity> = findings.iter().map(|f| f.severity).collect();
            let score = item_score(item, &severities);
            if (score - item.quality_score).abs() > f64::EPSILON {
                match self
                    .storage
                    .patch_item(item.id, &ItemPatch::quality_score(score), Utc::now())
                    .await
                {
                    Ok(_) => {}
                    // Folded into another item since the listing.
                    Err(PipelineError::Conflict(msg)) => debug!(item_id = item.id, "Skipping rescore: {}", msg),
                    Err(e) => return Err(e),
                }
            }
            score_sum += score;
            if score >= self.config.high_tier {
                scores.high += 1;
            } else if score >= self.config.medium_tier {
                scores.medium += 1;
            } else {
                scores.low += 1;
            }
        }
        if !items.is_empty() {
            scores.overall_percentage = score_sum / items.len() as f64 * 100.0;
        }

        let in_scope: HashSet<ItemId> = items.iter().map(|i| i.id).collect();
        let (mut violations, mut suggestions) = (Vec::new(), Vec::new());
        for issue in self.storage.list_issues(scope.project_id, None, false).await? {
            if !in_scope.contains(&issue.item_id) {
                continue;
            }
            match issue.kind {
                IssueKind::Violation => {
                    *scores.by_severity.entry(issue.severity.as_str().to_string()).or_default() += 1;
                    *scores.by_category.entry(issue.category.clone()).or_default() += 1;
                    violations.push(issue);
                }
                IssueKind::Suggestion => suggestions.push(issue),
            }
        }

        metrics::quality::overall_score(scores.overall_percentage);
        info!(
            items = scores.items,
            new_violations,
            new_suggestions,
            overall_percentage = scores.overall_percentage,
            "Quality analysis finished"
        );
        Ok(QualityReport {
            scope,
            violations,
            suggestions,
            scores,
            new_violations,
            new_suggestions,
        })
    }

    /// Performs the suggestion's mutation. Applying an already applied
    /// suggestion returns the item as it is now.
    #[instrument(skip(self))]
    pub async fn apply_suggestion(&self, issue_id: IssueId) -> Result<NormalizedItem> {
        let issue = self
            .storage
            .get_issue(issue_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("quality issue {}", issue_id)))?;
        if issue.kind != IssueKind::Suggestion {
            return Err(PipelineError::ValidationFailed(format!(
                "issue {} is a violation, not a suggestion",
                issue_id
            )));
        }
        let item = self.load_item(issue.item_id).await?;
        if issue.resolved {
            debug!(issue_id, "Suggestion already applied");
            return Ok(item);
        }
        if let Some(master) = item.superseded_by {
            return Err(PipelineError::Conflict(format!(
                "item {} was merged into {}; suggestion {} no longer applies",
                item.id, master, issue_id
            )));
        }
        if !issue.auto_applyable {
            return Err(PipelineError::ValidationFailed(format!(
                "suggestion {} needs manual review",
                issue_id
            )));
        }
        let action = issue
            .action
            .as_ref()
            .ok_or_else(|| PipelineError::ValidationFailed(format!("suggestion {} has no action", issue_id)))?;

        let mut patch = ItemPatch::default();
        match action {
            SuggestionAction::SetName { name } => patch.normalized_name = Some(name.clone()),
            SuggestionAction::SetCategory { category } => patch.category = Some(category.clone()),
            SuggestionAction::UseBenchmark { benchmark_id } => {
                let benchmark = self
                    .storage
                    .get_benchmark(*benchmark_id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound(format!("benchmark {}", benchmark_id)))?;
                patch.normalized_name = Some(benchmark.name.clone());
                patch.category = benchmark.category.clone();
                patch.benchmark_id = Some(benchmark.id);
                patch.processing_level = Some(ProcessingLevel::BenchmarkMatched);
            }
        }
        let mut preview = item.clone();
        patch.apply_to(&mut preview);
        patch.quality_score = Some(self.score(&preview));

        match self
            .storage
            .apply_suggestion(issue_id, item.id, &patch, Utc::now())
            .await
        {
            Ok(applied) => {
                metrics::quality::suggestion_applied();
                info!(issue_id, item_id = applied.id, rule = %issue.rule, "Suggestion applied");
                Ok(applied)
            }
            Err(PipelineError::Conflict(msg)) => {
                // Another apply of the same suggestion won; anything else stands.
                let applied_elsewhere = self
                    .storage
                    .get_issue(issue_id)
                    .await?
                    .map_or(false, |current| current.resolved);
                if applied_elsewhere {
                    self.load_item(issue.item_id).await
                } else {
                    Err(PipelineError::Conflict(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Marks a violation resolved; resolving twice is a `Conflict`
    pub async fn resolve_violation(&self, issue_id: IssueId) -> Result<QualityIssue> {
        let issue = self
            .storage
            .get_issue(issue_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("quality issue {}", issue_id)))?;
        if issue.kind != IssueKind::Violation {
            return Err(PipelineError::ValidationFailed(format!(
                "issue {} is a suggestion; apply it instead",
                issue_id
            )));
        }
        self.storage.resolve_issue(issue_id, Utc::now()).await
    }

    async fn load_item(&self, item_id: ItemId) -> Result<NormalizedItem> {
        self.storage
            .get_item(item_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("item {}", item_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn analyzer(storage: Arc<dyn Storage>) -> QualityAnalyzer {
        let matcher = Arc::new(BenchmarkMatcher::new(storage.clone(), 0.85));
        QualityAnalyzer::new(storage, matcher, QualityConfig::default(), 0.7)
    }

    #[test]
    fn fingerprints_are_stable_per_item_and_rule() {
        assert_eq!(fingerprint(1, "inn_checksum"), fingerprint(1, "inn_checksum"));
        assert_ne!(fingerprint(1, "inn_checksum"), fingerprint(2, "inn_checksum"));
        assert_eq!(fingerprint(1, "x").len(), 64);
    }

    #[test]
    fn item_score_deducts_and_clamps() {
        let item = NormalizedItem::new(1, EntityType::Nomenclature, "a", "a", ProcessingLevel::Basic);
        assert!((item_score(&item, &[Severity::Warning]) - 0.45).abs() < 1e-9);
        assert_eq!(item_score(&item, &[Severity::Critical, Severity::Critical]), 0.0);
    }

    #[tokio::test]
    async fn rerunning_analysis_does_not_duplicate_issues() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mut item = NormalizedItem::new(1, EntityType::Counterparty, "x", "ООО Ромашка", ProcessingLevel::Basic);
        item.attributes.insert("inn".into(), "7707083894".into());
        storage.create_item(&mut item).await.unwrap();
        let analyzer = analyzer(storage.clone());

        let first = analyzer.analyze(QualityScope::project(1)).await.unwrap();
        assert!(first.new_violations >= 2);
        assert!(first.violations.iter().any(|v| v.rule == "inn_checksum"));
        let second = analyzer.analyze(QualityScope::project(1)).await.unwrap();
        assert_eq!(second.new_violations, 0);
        assert_eq!(second.violations.len(), first.violations.len());
        assert_eq!(second.scores.items, 1);
        assert_eq!(second.scores.low, 1);
    }

    #[tokio::test]
    async fn applying_twice_is_a_noop() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mut item = NormalizedItem::new(1, EntityType::Nomenclature, "x", "ГАЙКА М8", ProcessingLevel::Basic);
        item.category = Some("Крепеж".into());
        storage.create_item(&mut item).await.unwrap();
        let analyzer = analyzer(storage.clone());

        let report = analyzer.analyze(QualityScope::project(1)).await.unwrap();
        let suggestion = report
            .suggestions
            .iter()
            .find(|s| s.rule == "normalize_formatting")
            .unwrap();
        let first = analyzer.apply_suggestion(suggestion.id).await.unwrap();
        assert_eq!(first.normalized_name, "Гайка м8");
        let second = analyzer.apply_suggestion(suggestion.id).await.unwrap();
        assert_eq!(second.normalized_name, first.normalized_name);
        assert_eq!(second.quality_score, first.quality_score);

        let violation = report.violations.iter().find(|v| v.rule == "name_format").unwrap();
        assert_eq!(
            analyzer.apply_suggestion(violation.id).await.unwrap_err().kind(),
            "validation_failed"
        );
        analyzer.resolve_violation(violation.id).await.unwrap();
        assert_eq!(
            analyzer.resolve_violation(violation.id).await.unwrap_err().kind(),
            "conflict"
        );
    }

    #[tokio::test]
    async fn suggestions_for_merged_items_conflict() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mut master = NormalizedItem::new(1, EntityType::Nomenclature, "a", "Гайка м8", ProcessingLevel::Basic);
        master.category = Some("Крепеж".into());
        storage.create_item(&mut master).await.unwrap();
        let mut donor = NormalizedItem::new(1, EntityType::Nomenclature, "b", "ГАЙКА М8", ProcessingLevel::Basic);
        donor.category = Some("Крепеж".into());
        storage.create_item(&mut donor).await.unwrap();
        let analyzer = analyzer(storage.clone());

        let report = analyzer.analyze(QualityScope::project(1)).await.unwrap();
        let suggestion = report
            .suggestions
            .iter()
            .find(|s| s.item_id == donor.id && s.rule == "normalize_formatting")
            .unwrap();

        let merger = crate::pipeline::processing::duplicates::DuplicateMerger::new(storage.clone());
        let group = crate::pipeline::processing::duplicates::DuplicateDetector::new(storage.clone(), 0.9, 100)
            .detect(1, EntityType::Nomenclature)
            .await
            .unwrap()
            .remove(0);
        merger.merge(group.id, master.id, &[donor.id]).await.unwrap();

        let err = analyzer.apply_suggestion(suggestion.id).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let stored = storage.get_item(donor.id).await.unwrap().unwrap();
        assert_eq!(stored.normalized_name, "ГАЙКА М8");
        assert!(!storage.get_issue(suggestion.id).await.unwrap().unwrap().resolved);
    }
}
