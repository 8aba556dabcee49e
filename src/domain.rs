use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PipelineError;

pub type ProjectId = i64;
pub type ItemId = i64;
pub type BenchmarkId = i64;
pub type GroupId = i64;
pub type IssueId = i64;
pub type ProcessId = Uuid;

/// Structured attributes carried by benchmarks and items (INN, KPP, address, unit, ...)
pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Counterparty,
    Nomenclature,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Counterparty => "counterparty",
            EntityType::Nomenclature => "nomenclature",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counterparty" => Ok(EntityType::Counterparty),
            "nomenclature" => Ok(EntityType::Nomenclature),
            other => Err(PipelineError::ValidationFailed(format!(
                "unknown entity type '{}'",
                other
            ))),
        }
    }
}

/// One raw record pulled from an upload batch. Consumed once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Stable reference into the source batch (row number, external key)
    pub source_ref: String,
    pub name: String,
    pub batch_id: String,
    pub project_id: ProjectId,
    #[serde(default)]
    pub client_id: Option<i64>,
    pub entity_type: EntityType,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Canonical reference entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: BenchmarkId,
    pub project_id: ProjectId,
    pub entity_type: EntityType,
    pub name: String,
    pub category: Option<String>,
    pub attributes: Attributes,
    pub active: bool,
    /// Alternate spellings, lookup only
    pub variations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Benchmark {
    pub fn new(project_id: ProjectId, entity_type: EntityType, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            project_id,
            entity_type,
            name: name.into(),
            category: None,
            attributes: Attributes::new(),
            active: true,
            variations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_variations<I, S>(mut self, variations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variations.extend(variations.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingLevel {
    #[serde(rename = "benchmark-matched")]
    BenchmarkMatched,
    #[serde(rename = "ai-normalized")]
    AiNormalized,
    #[serde(rename = "basic")]
    Basic,
}

impl ProcessingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingLevel::BenchmarkMatched => "benchmark-matched",
            ProcessingLevel::AiNormalized => "ai-normalized",
            ProcessingLevel::Basic => "basic",
        }
    }
}

impl FromStr for ProcessingLevel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "benchmark-matched" => Ok(ProcessingLevel::BenchmarkMatched),
            "ai-normalized" => Ok(ProcessingLevel::AiNormalized),
            "basic" => Ok(ProcessingLevel::Basic),
            other => Err(PipelineError::internal(format!(
                "unknown processing level '{}'",
                other
            ))),
        }
    }
}

/// Canonical result of processing one raw record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub id: ItemId,
    pub project_id: ProjectId,
    pub entity_type: EntityType,
    pub source_ref: String,
    pub source_name: String,
    pub normalized_name: String,
    pub category: Option<String>,
    pub quality_score: f64,
    pub processing_level: ProcessingLevel,
    pub benchmark_id: Option<BenchmarkId>,
    pub taxonomy_code: Option<String>,
    pub ai_confidence: Option<f64>,
    pub provider: Option<String>,
    pub attributes: Attributes,
    /// Number of items folded into this one by merges
    pub merged_count: u32,
    /// Set when this item was folded into another
    pub superseded_by: Option<ItemId>,
    pub process_id: Option<ProcessId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NormalizedItem {
    pub fn new(
        project_id: ProjectId,
        entity_type: EntityType,
        source_name: impl Into<String>,
        normalized_name: impl Into<String>,
        processing_level: ProcessingLevel,
    ) -> Self {
        let now = Utc::now();
        let source_name = source_name.into();
        Self {
            id: 0,
            project_id,
            entity_type,
            source_ref: String::new(),
            source_name,
            normalized_name: normalized_name.into(),
            category: None,
            quality_score: 0.0,
            processing_level,
            benchmark_id: None,
            taxonomy_code: None,
            ai_confidence: None,
            provider: None,
            attributes: Attributes::new(),
            merged_count: 0,
            superseded_by: None,
            process_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    /// Number of populated structured fields, used as a master tie-breaker
    pub fn completeness(&self) -> usize {
        let attrs = self
            .attributes
            .values()
            .filter(|v| !v.trim().is_empty())
            .count();
        attrs
            + usize::from(self.category.is_some())
            + usize::from(self.taxonomy_code.is_some())
            + usize::from(self.benchmark_id.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Raw source row that produced or was folded into the item
    Source,
    Benchmark,
    Taxonomy,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Source => "source",
            LinkKind::Benchmark => "benchmark",
            LinkKind::Taxonomy => "taxonomy",
        }
    }
}

impl FromStr for LinkKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(LinkKind::Source),
            "benchmark" => Ok(LinkKind::Benchmark),
            "taxonomy" => Ok(LinkKind::Taxonomy),
            other => Err(PipelineError::internal(format!("unknown link kind '{}'", other))),
        }
    }
}

/// Reference held by another table onto a normalized item. Repointed on merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemLink {
    pub item_id: ItemId,
    pub kind: LinkKind,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ExactName,
    FuzzyName,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::ExactName => "exact_name",
            DetectionMethod::FuzzyName => "fuzzy_name",
        }
    }
}

impl FromStr for DetectionMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact_name" => Ok(DetectionMethod::ExactName),
            "fuzzy_name" => Ok(DetectionMethod::FuzzyName),
            other => Err(PipelineError::internal(format!(
                "unknown detection method '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: GroupId,
    pub project_id: ProjectId,
    pub entity_type: EntityType,
    /// Weakest pairwise similarity that joined the group
    pub similarity: f64,
    pub method: DetectionMethod,
    pub suggested_master_id: ItemId,
    pub item_ids: Vec<ItemId>,
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_master_id: Option<ItemId>,
    pub created_at: DateTime<Utc>,
}

impl DuplicateGroup {
    pub fn contains(&self, item_id: ItemId) -> bool {
        self.item_ids.contains(&item_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Violation,
    Suggestion,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Violation => "violation",
            IssueKind::Suggestion => "suggestion",
        }
    }
}

impl FromStr for IssueKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "violation" => Ok(IssueKind::Violation),
            "suggestion" => Ok(IssueKind::Suggestion),
            other => Err(PipelineError::internal(format!("unknown issue kind '{}'", other))),
        }
    }
}

/// Severity levels for quality issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// Score deduction applied per open violation of this severity
    pub fn deduction(&self) -> f64 {
        match self {
            Severity::Info => 0.01,
            Severity::Warning => 0.05,
            Severity::Error => 0.15,
            Severity::Critical => 0.30,
        }
    }
}

impl FromStr for Severity {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(PipelineError::internal(format!("unknown severity '{}'", other))),
        }
    }
}

/// Mutation performed when a suggestion is applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuggestionAction {
    SetName { name: String },
    UseBenchmark { benchmark_id: BenchmarkId },
    SetCategory { category: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIssue {
    pub id: IssueId,
    pub project_id: ProjectId,
    pub item_id: ItemId,
    pub kind: IssueKind,
    /// Stable rule or heuristic identifier
    pub rule: String,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    pub fingerprint: String,
    pub confidence: f64,
    pub auto_applyable: bool,
    pub action: Option<SuggestionAction>,
    /// Resolved for violations, applied for suggestions
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Idle,
    Running,
    Stopping,
    Completed,
    Stopped,
    Error,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Idle => "idle",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Error => "error",
        }
    }

    /// Running or stopping; at most one per project
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessStatus::Running | ProcessStatus::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Stopped | ProcessStatus::Error
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(ProcessStatus::Idle),
            "running" => Ok(ProcessStatus::Running),
            "stopping" => Ok(ProcessStatus::Stopping),
            "completed" => Ok(ProcessStatus::Completed),
            "stopped" => Ok(ProcessStatus::Stopped),
            "error" => Ok(ProcessStatus::Error),
            other => Err(PipelineError::internal(format!(
                "unknown process status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessProgress {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub benchmark_matched: u64,
    pub ai_normalized: u64,
    pub basic: u64,
}

impl ProcessProgress {
    pub fn record_level(&mut self, level: ProcessingLevel) {
        self.processed += 1;
        match level {
            ProcessingLevel::BenchmarkMatched => self.benchmark_matched += 1,
            ProcessingLevel::AiNormalized => self.ai_normalized += 1,
            ProcessingLevel::Basic => self.basic += 1,
        }
    }

    /// A record that produced no item
    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    pub fn is_done(&self) -> bool {
        self.processed >= self.total
    }
}

/// Error recorded against one raw record; the run continues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub record_ref: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationProcess {
    pub id: ProcessId,
    pub project_id: ProjectId,
    pub status: ProcessStatus,
    pub progress: ProcessProgress,
    /// Most recent per-record errors, bounded
    pub errors: Vec<RecordError>,
    /// Why the run ended in `error`
    pub cause: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NormalizationProcess {
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            status: ProcessStatus::Idle,
            progress: ProcessProgress::default(),
            errors: Vec::new(),
            cause: None,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Flat taxonomy node; the tree is rebuilt from parent codes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub parent_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyStep {
    pub code: String,
    pub name: String,
    pub score: f64,
}

/// Append-only record of one taxonomy resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub id: i64,
    pub item_id: ItemId,
    pub path: Vec<TaxonomyStep>,
    pub confidence: f64,
    pub level_reached: usize,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
}
