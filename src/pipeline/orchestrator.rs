use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::app::ports::RecordSource;
use crate::config::OrchestratorConfig;
use crate::domain::{
    EntityType, NormalizationProcess, ProcessId, ProcessProgress, ProcessStatus, ProjectId, RawRecord, RecordError,
};
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::pipeline::processing::duplicates::DuplicateDetector;
use crate::pipeline::processing::quality::{QualityAnalyzer, QualityScope};
use crate::pipeline::worker::{run_worker, RecordPipeline, Tracker, WorkerContext};
use crate::storage::Storage;

const EVENT_BUFFER: usize = 256;

/// Pushed to observers of a running process
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessEvent {
    Started { process_id: ProcessId, total: u64 },
    Progress { process_id: ProcessId, progress: ProcessProgress },
    RecordFailed { process_id: ProcessId, error: RecordError },
    Completed { process_id: ProcessId, progress: ProcessProgress },
    Stopped { process_id: ProcessId, progress: ProcessProgress },
    Failed { process_id: ProcessId, cause: String },
}

/// Passes spawned after a run completes
pub struct FollowOn {
    pub detector: Arc<DuplicateDetector>,
    pub analyzer: Arc<QualityAnalyzer>,
}

impl FollowOn {
    async fn run(&self, project_id: ProjectId) {
        for entity_type in [EntityType::Counterparty, EntityType::Nomenclature] {
            if let Err(e) = self.detector.detect(project_id, entity_type).await {
                warn!(project_id, "Follow-on duplicate detection failed: {}", e);
            }
        }
        if let Err(e) = self.analyzer.analyze(QualityScope::project(project_id)).await {
            warn!(project_id, "Follow-on quality analysis failed: {}", e);
        }
    }
}

/// Handles this instance holds for a live run
struct RunHandle {
    stop: Arc<CancelHandle>,
    events: broadcast::Sender<ProcessEvent>,
    done: watch::Receiver<Option<ProcessStatus>>,
    tracker: Arc<Mutex<Tracker>>,
}

type Runs = Arc<Mutex<HashMap<ProcessId, RunHandle>>>;

pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    pipeline: Arc<RecordPipeline>,
    config: OrchestratorConfig,
    follow_on: Option<Arc<FollowOn>>,
    runs: Runs,
}

impl Orchestrator {
    pub fn new(storage: Arc<dyn Storage>, pipeline: Arc<RecordPipeline>, config: OrchestratorConfig) -> Self {
        Self {
            storage,
            pipeline,
            config,
            follow_on: None,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_follow_on(mut self, follow_on: FollowOn) -> Self {
        self.follow_on = Some(Arc::new(follow_on));
        self
    }

    /// Claims the project and spawns the run. `Conflict` if the project
    /// already has a running or stopping process.
    pub async fn start(&self, project_id: ProjectId, source: Arc<dyn RecordSource>) -> Result<ProcessId> {
        let total = source.total().await?;
        let mut process = NormalizationProcess::new(project_id);
        process.progress.total = total;
        process.started_at = Some(Utc::now());
        self.storage.try_start_process(&process).await?;
        metrics::orchestrator::process_started();
        info!(project_id, process_id = %process.id, total, "Normalization process started");

        let (stop, stop_signal) = cancel_pair();
        let stop = Arc::new(stop);
        let (abort, _) = cancel_pair();
        let (halt, _) = cancel_pair();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (done_tx, done_rx) = watch::channel(None);
        let tracker = Arc::new(Mutex::new(Tracker::new(total, self.config.max_recorded_errors)));

        self.runs.lock()?.insert(
            process.id,
            RunHandle {
                stop: stop.clone(),
                events: events.clone(),
                done: done_rx,
                tracker: tracker.clone(),
            },
        );

        let run = Run {
            process_id: process.id,
            project_id,
            storage: self.storage.clone(),
            pipeline: self.pipeline.clone(),
            config: self.config.clone(),
            stop: stop_signal,
            stop_handle: stop,
            abort: Arc::new(abort),
            halt: Arc::new(halt),
            events,
            tracker,
        };
        let follow_on = if self.config.follow_on_passes {
            self.follow_on.clone()
        } else {
            None
        };
        tokio::spawn(supervise(run, source, self.runs.clone(), done_tx, follow_on));
        Ok(process.id)
    }

    /// Stored process row with live progress when this instance runs it
    pub async fn status(&self, process_id: ProcessId) -> Result<NormalizationProcess> {
        let mut process = self
            .storage
            .get_process(process_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("process {}", process_id)))?;
        if process.status.is_active() {
            let tracker = self.runs.lock()?.get(&process_id).map(|h| h.tracker.clone());
            if let Some(tracker) = tracker {
                let tracker = tracker.lock()?;
                process.progress = tracker.progress();
                process.errors = tracker.errors();
            }
        }
        Ok(process)
    }

    /// Requests a cooperative stop and returns at once. The process reaches
    /// `stopped` once in-flight work drains.
    pub async fn stop(&self, process_id: ProcessId) -> Result<ProcessStatus> {
        let process = self
            .storage
            .get_process(process_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("process {}", process_id)))?;
        match process.status {
            ProcessStatus::Stopping => return Ok(ProcessStatus::Stopping),
            ProcessStatus::Running => {}
            other => {
                return Err(PipelineError::Conflict(format!(
                    "process {} is {}",
                    process_id, other
                )))
            }
        }

        match self
            .storage
            .transition_process(process_id, &[ProcessStatus::Running], ProcessStatus::Stopping, None)
            .await
        {
            Ok(_) => {}
            Err(PipelineError::Conflict(msg)) => {
                // Raced with another stop or with completion.
                let current = self.storage.get_process(process_id).await?.map(|p| p.status);
                if current != Some(ProcessStatus::Stopping) {
                    return Err(PipelineError::Conflict(msg));
                }
            }
            Err(e) => return Err(e),
        }
        if let Some(handle) = self.runs.lock()?.get(&process_id) {
            handle.stop.cancel();
        }
        info!(process_id = %process_id, "Stop requested");
        Ok(ProcessStatus::Stopping)
    }

    pub fn subscribe(&self, process_id: ProcessId) -> Result<broadcast::Receiver<ProcessEvent>> {
        self.runs
            .lock()?
            .get(&process_id)
            .map(|h| h.events.subscribe())
            .ok_or_else(|| PipelineError::NotFound(format!("no live run for process {}", process_id)))
    }

    /// Waits for the run to end and returns its final status
    pub async fn wait(&self, process_id: ProcessId) -> Result<ProcessStatus> {
        let done = self.runs.lock()?.get(&process_id).map(|h| h.done.clone());
        if let Some(mut done) = done {
            loop {
                let current = *done.borrow_and_update();
                if let Some(status) = current {
                    return Ok(status);
                }
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(self.status(process_id).await?.status)
    }

    /// Marks active processes without a live driver here as `error`
    pub async fn recover_stale(&self, project_id: Option<ProjectId>) -> Result<Vec<ProcessId>> {
        let mut recovered = Vec::new();
        for process in self.storage.list_processes(project_id).await? {
            let live = self.runs.lock()?.contains_key(&process.id);
            if !process.status.is_active() || live {
                continue;
            }
            match self
                .storage
                .transition_process(
                    process.id,
                    &[ProcessStatus::Running, ProcessStatus::Stopping],
                    ProcessStatus::Error,
                    Some("driver lost; recovered at startup".into()),
                )
                .await
            {
                Ok(_) => {
                    warn!(process_id = %process.id, project_id = process.project_id, "Recovered stale process");
                    recovered.push(process.id);
                }
                Err(PipelineError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }
}

/// One run's driver state
struct Run {
    process_id: ProcessId,
    project_id: ProjectId,
    storage: Arc<dyn Storage>,
    pipeline: Arc<RecordPipeline>,
    config: OrchestratorConfig,
    stop: CancelSignal,
    stop_handle: Arc<CancelHandle>,
    abort: Arc<CancelHandle>,
    halt: Arc<CancelHandle>,
    events: broadcast::Sender<ProcessEvent>,
    tracker: Arc<Mutex<Tracker>>,
}

/// Fires the local stop once the stored row says `stopping`, so a stop
/// issued by another instance gets the same grace bound as a local one.
async fn watch_external_stop(
    storage: Arc<dyn Storage>,
    process_id: ProcessId,
    stop: Arc<CancelHandle>,
    every: std::time::Duration,
) {
    let signal = stop.signal();
    loop {
        tokio::select! {
            _ = signal.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        match storage.get_process(process_id).await {
            Ok(Some(process)) if process.status == ProcessStatus::Stopping => {
                info!(process_id = %process_id, "Stop observed in storage");
                stop.cancel();
                return;
            }
            Ok(Some(process)) if !process.status.is_active() => return,
            Ok(_) => {}
            Err(e) => warn!(process_id = %process_id, "Stop poll failed: {}", e),
        }
    }
}

/// Writes the tracker's last snapshot so an aborted run keeps its counts
async fn flush_progress(storage: &Arc<dyn Storage>, process_id: ProcessId, tracker: &Mutex<Tracker>) {
    let snapshot = tracker.lock().ok().map(|t| (t.progress(), t.errors()));
    let Some((progress, errors)) = snapshot else {
        return;
    };
    if let Err(e) = storage.update_progress(process_id, &progress, &errors).await {
        error!(process_id = %process_id, "Could not save final progress: {}", e);
    }
}

/// Drives the run and guarantees a terminal status however the driver ends
async fn supervise(
    run: Run,
    source: Arc<dyn RecordSource>,
    runs: Runs,
    done: watch::Sender<Option<ProcessStatus>>,
    follow_on: Option<Arc<FollowOn>>,
) {
    let process_id = run.process_id;
    let project_id = run.project_id;
    let storage = run.storage.clone();
    let events = run.events.clone();
    let abort = run.abort.clone();
    let tracker = run.tracker.clone();
    let watcher = tokio::spawn(watch_external_stop(
        storage.clone(),
        process_id,
        run.stop_handle.clone(),
        run.config.stop_poll_interval(),
    ));

    let outcome = match tokio::spawn(run.drive(source)).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(e)) => Err(e.to_string()),
        Err(join) => Err(format!("driver task failed: {}", join)),
    };
    abort.cancel();
    watcher.abort();

    let status = match outcome {
        Ok(status) => status,
        Err(cause) => {
            error!(process_id = %process_id, "Normalization process failed: {}", cause);
            flush_progress(&storage, process_id, &tracker).await;
            if let Err(e) = storage
                .transition_process(
                    process_id,
                    &[ProcessStatus::Running, ProcessStatus::Stopping],
                    ProcessStatus::Error,
                    Some(cause.clone()),
                )
                .await
            {
                error!(process_id = %process_id, "Could not mark process as error: {}", e);
            }
            let _ = events.send(ProcessEvent::Failed { process_id, cause });
            ProcessStatus::Error
        }
    };
    metrics::orchestrator::process_finished(status.as_str());

    if let Ok(mut runs) = runs.lock() {
        runs.remove(&process_id);
    }
    let _ = done.send(Some(status));

    if status == ProcessStatus::Completed {
        if let Some(follow_on) = follow_on {
            tokio::spawn(async move { follow_on.run(project_id).await });
        }
    }
}

impl Run {
    async fn drive(self, source: Arc<dyn RecordSource>) -> Result<ProcessStatus> {
        let total = self.tracker.lock()?.progress().total;
        let _ = self.events.send(ProcessEvent::Started {
            process_id: self.process_id,
            total,
        });
        match self.config.hard_deadline() {
            Some(deadline) => match tokio::time::timeout(deadline, self.execute(source)).await {
                Ok(result) => result,
                Err(_) => {
                    self.abort.cancel();
                    Err(PipelineError::Timeout(format!(
                        "hard deadline of {}s exceeded",
                        deadline.as_secs()
                    )))
                }
            },
            None => self.execute(source).await,
        }
    }

    fn halted(&self) -> bool {
        self.stop.is_cancelled() || self.halt.signal().is_cancelled()
    }

    async fn stop_requested_elsewhere(&self) -> Result<bool> {
        let status = self.storage.get_process(self.process_id).await?.map(|p| p.status);
        Ok(status == Some(ProcessStatus::Stopping))
    }

    async fn execute(&self, source: Arc<dyn RecordSource>) -> Result<ProcessStatus> {
        let batch_size = self.config.batch_size.max(1);
        let (tx, rx) = mpsc::channel::<RawRecord>(batch_size);
        let queue = Arc::new(tokio::sync::Mutex::new(rx));
        let ctx = WorkerContext {
            process_id: self.process_id,
            pipeline: self.pipeline.clone(),
            storage: self.storage.clone(),
            tracker: self.tracker.clone(),
            events: self.events.clone(),
            abort: self.abort.signal(),
            halt: self.halt.clone(),
        };
        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            workers.spawn(run_worker(ctx.clone(), queue.clone()));
        }
        drop(queue);

        // Feed whole batches; a stop only prevents the next pull.
        let mut feed_error = None;
        loop {
            if self.halted() {
                break;
            }
            match self.stop_requested_elsewhere().await {
                Ok(true) => {
                    self.stop_handle.cancel();
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    feed_error = Some(e);
                    break;
                }
            }
            let batch = match source.next_batch(batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    feed_error = Some(e);
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            metrics::orchestrator::batch_pulled(batch.len());
            // Records still waiting for a free worker when a stop lands are
            // not in flight and are dropped.
            let mut closed = false;
            for record in batch {
                let sent = tokio::select! {
                    sent = tx.send(record) => sent.is_ok(),
                    _ = self.stop.cancelled() => false,
                };
                if !sent {
                    closed = true;
                    break;
                }
            }
            if closed {
                break;
            }
        }
        drop(tx);

        let mut failures = Vec::new();
        let drained = {
            let drain = async {
                while let Some(joined) = workers.join_next().await {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => failures.push(e),
                        Err(join) => failures.push(PipelineError::internal(format!("worker failed: {}", join))),
                    }
                }
            };
            tokio::pin!(drain);
            tokio::select! {
                _ = &mut drain => true,
                _ = self.stop.cancelled() => {
                    tokio::time::timeout(self.config.grace_period(), &mut drain).await.is_ok()
                }
            }
        };
        if !drained {
            self.abort.cancel();
            workers.abort_all();
            return Err(PipelineError::Timeout(format!(
                "in-flight work did not drain within the {}s grace period",
                self.config.grace_period_secs
            )));
        }

        let (progress, errors) = {
            let tracker = self.tracker.lock()?;
            (tracker.progress(), tracker.errors())
        };
        self.storage.update_progress(self.process_id, &progress, &errors).await?;

        if let Some(e) = feed_error.or_else(|| failures.into_iter().next()) {
            return Err(e);
        }
        self.finish(progress).await
    }

    /// Completed from running, stopped from stopping
    async fn finish(&self, progress: ProcessProgress) -> Result<ProcessStatus> {
        let completed = self
            .storage
            .transition_process(self.process_id, &[ProcessStatus::Running], ProcessStatus::Completed, None)
            .await;
        match completed {
            Ok(_) => {
                info!(
                    process_id = %self.process_id,
                    processed = progress.processed,
                    failed = progress.failed,
                    "Normalization process completed"
                );
                let _ = self.events.send(ProcessEvent::Completed {
                    process_id: self.process_id,
                    progress,
                });
                Ok(ProcessStatus::Completed)
            }
            Err(PipelineError::Conflict(_)) => {
                self.storage
                    .transition_process(self.process_id, &[ProcessStatus::Stopping], ProcessStatus::Stopped, None)
                    .await?;
                info!(process_id = %self.process_id, processed = progress.processed, "Normalization process stopped");
                let _ = self.events.send(ProcessEvent::Stopped {
                    process_id: self.process_id,
                    progress,
                });
                Ok(ProcessStatus::Stopped)
            }
            Err(e) => Err(e),
        }
    }
}
