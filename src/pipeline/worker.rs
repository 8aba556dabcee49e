use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{
    NormalizedItem, ProcessId, ProcessProgress, ProcessingLevel, RawRecord, RecordError,
};
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::cancel::{CancelHandle, CancelSignal};
use crate::pipeline::orchestrator::ProcessEvent;
use crate::pipeline::processing::benchmark::BenchmarkMatcher;
use crate::pipeline::processing::classifier::MultiProviderClassifier;
use crate::pipeline::processing::normalize::BasicNormalizer;
use crate::pipeline::processing::quality::QualityAnalyzer;
use crate::pipeline::processing::taxonomy::TaxonomyMatcher;
use crate::storage::Storage;

/// Processed records between progress writes
const FLUSH_EVERY: u64 = 25;

/// What happened to one record
#[derive(Debug)]
pub struct RecordOutcome {
    pub item: NormalizedItem,
    /// Classifier failure that forced the basic fallback
    pub degraded: Option<PipelineError>,
}

/// The per-record stages: benchmark, classifier, taxonomy, persist.
/// Steps within one record run strictly in that order.
pub struct RecordPipeline {
    storage: Arc<dyn Storage>,
    matcher: Arc<BenchmarkMatcher>,
    classifier: Arc<MultiProviderClassifier>,
    taxonomy: Option<Arc<TaxonomyMatcher>>,
    analyzer: Arc<QualityAnalyzer>,
    normalizer: BasicNormalizer,
}

impl RecordPipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        matcher: Arc<BenchmarkMatcher>,
        classifier: Arc<MultiProviderClassifier>,
        taxonomy: Option<Arc<TaxonomyMatcher>>,
        analyzer: Arc<QualityAnalyzer>,
    ) -> Self {
        Self {
            storage,
            matcher,
            classifier,
            taxonomy,
            analyzer,
            normalizer: BasicNormalizer::new(),
        }
    }

    pub async fn process(
        &self,
        process_id: Option<ProcessId>,
        record: &RawRecord,
        abort: &CancelSignal,
    ) -> Result<RecordOutcome> {
        if record.name.trim().is_empty() {
            return Err(PipelineError::ValidationFailed("record name is empty".into()));
        }

        let mut degraded = None;
        let mut item = match self
            .matcher
            .find(record.project_id, &record.name, record.entity_type)
            .await?
        {
            Some(m) => {
                let mut item = NormalizedItem::new(
                    record.project_id,
                    record.entity_type,
                    &record.name,
                    &m.benchmark.name,
                    ProcessingLevel::BenchmarkMatched,
                );
                item.benchmark_id = Some(m.benchmark.id);
                item.category = m.benchmark.category.clone();
                item
            }
            None => match self.classifier.classify(&record.name, record.entity_type, abort).await {
                Ok(c) => {
                    let mut item = NormalizedItem::new(
                        record.project_id,
                        record.entity_type,
                        &record.name,
                        &c.normalized_name,
                        ProcessingLevel::AiNormalized,
                    );
                    item.ai_confidence = Some(c.confidence);
                    item.provider = Some(c.provider_used);
                    item.category = c.category;
                    item
                }
                Err(e @ (PipelineError::ProviderUnavailable(_) | PipelineError::NoMatch(_))) => {
                    if abort.is_cancelled() {
                        return Err(PipelineError::Timeout("record aborted".into()));
                    }
                    degraded = Some(e);
                    NormalizedItem::new(
                        record.project_id,
                        record.entity_type,
                        &record.name,
                        &self.normalizer.normalize(&record.name, record.entity_type),
                        ProcessingLevel::Basic,
                    )
                }
                Err(e) => return Err(e),
            },
        };

        item.source_ref = record.source_ref.clone();
        item.attributes = record.attributes.clone();
        item.process_id = process_id;

        let resolution = self
            .taxonomy
            .as_ref()
            .map(|t| t.resolve_path(&item.normalized_name, item.category.as_deref()));
        item.taxonomy_code = resolution.as_ref().and_then(|r| r.code().map(str::to_string));
        item.quality_score = self.analyzer.score(&item);

        // Item, links and taxonomy history land in one write.
        let mut history = match (&self.taxonomy, &resolution) {
            (Some(taxonomy), Some(resolution)) => Some(taxonomy.history_entry(0, resolution)),
            _ => None,
        };
        abort
            .guard(
                "persist",
                self.storage.create_item_with_history(&mut item, history.as_mut()),
            )
            .await?;
        Ok(RecordOutcome { item, degraded })
    }
}

/// Live progress of a run, shared by its workers
#[derive(Debug)]
pub struct Tracker {
    progress: ProcessProgress,
    errors: VecDeque<RecordError>,
    max_errors: usize,
    unflushed: u64,
}

impl Tracker {
    pub fn new(total: u64, max_errors: usize) -> Self {
        Self {
            progress: ProcessProgress {
                total,
                ..Default::default()
            },
            errors: VecDeque::new(),
            max_errors,
            unflushed: 0,
        }
    }

    pub fn progress(&self) -> ProcessProgress {
        self.progress.clone()
    }

    pub fn errors(&self) -> Vec<RecordError> {
        self.errors.iter().cloned().collect()
    }

    fn push_error(&mut self, error: RecordError) {
        if self.max_errors == 0 {
            return;
        }
        if self.errors.len() == self.max_errors {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
    }

    /// Returns true when progress is due for a write
    fn tick(&mut self) -> bool {
        self.unflushed += 1;
        if self.unflushed >= FLUSH_EVERY || self.progress.is_done() {
            self.unflushed = 0;
            true
        } else {
            false
        }
    }
}

fn record_error(record: &RawRecord, error: &PipelineError) -> RecordError {
    RecordError {
        record_ref: record.source_ref.clone(),
        kind: error.kind().to_string(),
        message: error.to_string(),
    }
}

/// Everything one worker needs
#[derive(Clone)]
pub struct WorkerContext {
    pub process_id: ProcessId,
    pub pipeline: Arc<RecordPipeline>,
    pub storage: Arc<dyn Storage>,
    pub tracker: Arc<Mutex<Tracker>>,
    pub events: broadcast::Sender<ProcessEvent>,
    pub abort: CancelSignal,
    /// Fired by a worker that hit a run-level failure
    pub halt: Arc<CancelHandle>,
}

impl WorkerContext {
    pub async fn flush(&self) -> Result<()> {
        let (progress, errors) = {
            let tracker = self.tracker.lock()?;
            (tracker.progress(), tracker.errors())
        };
        self.storage.update_progress(self.process_id, &progress, &errors).await
    }

    fn note_error(&self, record: &RawRecord, error: &PipelineError) -> Result<()> {
        let entry = record_error(record, error);
        self.tracker.lock()?.push_error(entry.clone());
        let _ = self.events.send(ProcessEvent::RecordFailed {
            process_id: self.process_id,
            error: entry,
        });
        Ok(())
    }
}

/// Pulls records off the shared queue until it closes or the run aborts.
/// Record-scoped failures are recorded; anything else ends the worker.
pub async fn run_worker(ctx: WorkerContext, queue: Arc<tokio::sync::Mutex<mpsc::Receiver<RawRecord>>>) -> Result<()> {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                record = rx.recv() => record,
                _ = ctx.abort.cancelled() => None,
            }
        };
        let Some(record) = next else {
            return Ok(());
        };

        let started = Instant::now();
        let result = ctx.pipeline.process(Some(ctx.process_id), &record, &ctx.abort).await;
        let flush_due = match result {
            Ok(outcome) => {
                let level = outcome.item.processing_level;
                metrics::orchestrator::record_processed(level.as_str(), started.elapsed().as_secs_f64());
                if let Some(error) = &outcome.degraded {
                    debug!(record = %record.source_ref, "Fell back to basic normalization: {}", error);
                    ctx.note_error(&record, error)?;
                }
                let mut tracker = ctx.tracker.lock()?;
                tracker.progress.record_level(level);
                tracker.tick()
            }
            Err(_) if ctx.abort.is_cancelled() => return Ok(()),
            Err(error) if error.is_record_scoped() => {
                metrics::orchestrator::record_failed(error.kind());
                warn!(record = %record.source_ref, "Record failed: {}", error);
                ctx.note_error(&record, &error)?;
                let mut tracker = ctx.tracker.lock()?;
                tracker.progress.record_failure();
                tracker.tick()
            }
            Err(error) => {
                ctx.halt.cancel();
                return Err(error);
            }
        };

        if flush_due {
            ctx.flush().await?;
            let progress = ctx.tracker.lock()?.progress();
            let _ = ctx.events.send(ProcessEvent::Progress {
                process_id: ctx.process_id,
                progress,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(n: usize) -> RecordError {
        RecordError {
            record_ref: format!("r{}", n),
            kind: "no_match".into(),
            message: "x".into(),
        }
    }

    #[test]
    fn tracker_keeps_latest_errors_only() {
        let mut tracker = Tracker::new(10, 2);
        for n in 0..5 {
            tracker.push_error(error(n));
        }
        let kept: Vec<_> = tracker.errors().into_iter().map(|e| e.record_ref).collect();
        assert_eq!(kept, vec!["r3", "r4"]);
    }

    #[test]
    fn tracker_flushes_on_interval_and_at_the_end() {
        let mut tracker = Tracker::new(3, 10);
        tracker.progress.record_level(ProcessingLevel::Basic);
        assert!(!tracker.tick());
        tracker.progress.record_failure();
        assert!(!tracker.tick());
        tracker.progress.record_level(ProcessingLevel::Basic);
        assert!(tracker.tick());
        assert_eq!(tracker.progress().failed, 1);
        assert_eq!(tracker.progress().processed, 3);
    }
}
