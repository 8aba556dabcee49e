mod common;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use common::{memory_service, records, test_config, Behaviour, ScriptedProvider};
use nsi_pipeline::domain::{NormalizationProcess, ProcessStatus};
use nsi_pipeline::error::PipelineError;
use nsi_pipeline::infra::MemoryRecordSource;
use nsi_pipeline::storage::{InMemoryStorage, Storage};
use nsi_pipeline::NsiService;

fn source(project_id: i64, count: usize) -> Arc<MemoryRecordSource> {
    let names: Vec<String> = (1..=count).map(|n| format!("Винт М{}", n)).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    Arc::new(MemoryRecordSource::new(records(project_id, &names)))
}

#[tokio::test]
async fn one_active_process_per_project() -> Result<()> {
    let config = test_config();
    let (service, _) = memory_service(
        &config,
        vec![ScriptedProvider::new("ai", Behaviour::Slow(Duration::from_millis(50)))],
    );

    let first = service.start(7, source(7, 4)).await?;
    let second = service.start(7, source(7, 4)).await;
    assert!(matches!(second, Err(PipelineError::Conflict(_))));

    let other = service.start(8, source(8, 2)).await?;
    assert_eq!(service.wait(first).await?, ProcessStatus::Completed);
    assert_eq!(service.wait(other).await?, ProcessStatus::Completed);

    // The project is free again once its process is terminal.
    let third = service.start(7, source(7, 1)).await?;
    assert_eq!(service.wait(third).await?, ProcessStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn stop_drains_in_flight_records_and_ends_stopped() -> Result<()> {
    let config = test_config();
    let (service, _) = memory_service(
        &config,
        vec![ScriptedProvider::new("ai", Behaviour::Slow(Duration::from_millis(200)))],
    );

    let process_id = service.start(1, source(1, 6)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(service.stop(process_id).await?, ProcessStatus::Stopping);
    // Repeated stops are harmless while draining.
    assert_eq!(service.stop(process_id).await?, ProcessStatus::Stopping);

    assert_eq!(service.wait(process_id).await?, ProcessStatus::Stopped);
    let process = service.status(process_id).await?;
    assert_eq!(process.status, ProcessStatus::Stopped);
    assert!(process.progress.processed >= 2);
    assert!(process.progress.processed < process.progress.total);
    assert!(process.finished_at.is_some());

    assert!(matches!(service.stop(process_id).await, Err(PipelineError::Conflict(_))));
    Ok(())
}

#[tokio::test]
async fn stop_of_unknown_process_is_not_found() -> Result<()> {
    let config = test_config();
    let (service, _) = memory_service(&config, vec![]);
    assert!(matches!(service.stop(Uuid::new_v4()).await, Err(PipelineError::NotFound(_))));
    assert!(matches!(service.status(Uuid::new_v4()).await, Err(PipelineError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn exceeding_the_grace_period_ends_in_error() -> Result<()> {
    let mut config = test_config();
    config.classifier.provider_timeout_ms = 60_000;
    config.classifier.overall_timeout_ms = 60_000;
    let (service, _) = memory_service(&config, vec![ScriptedProvider::new("ai", Behaviour::Hang)]);

    let process_id = service.start(1, source(1, 2)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.stop(process_id).await?;

    let status = tokio::time::timeout(Duration::from_secs(10), service.wait(process_id)).await??;
    assert_eq!(status, ProcessStatus::Error);
    let process = service.status(process_id).await?;
    let cause = process.cause.unwrap_or_default();
    assert!(cause.contains("grace"), "unexpected cause: {}", cause);

    // An errored process frees its project.
    service.start(1, source(1, 0)).await?;
    Ok(())
}

#[tokio::test]
async fn progress_survives_a_grace_timeout() -> Result<()> {
    let mut config = test_config();
    config.classifier.provider_timeout_ms = 60_000;
    config.classifier.overall_timeout_ms = 60_000;
    let (service, storage) = memory_service(&config, vec![ScriptedProvider::new("ai", Behaviour::HangOn("Зависший"))]);

    let names = ["Винт М1", "Винт М2", "Винт М3", "Винт М4", "Зависший 1", "Зависший 2"];
    let process_id = service
        .start(1, Arc::new(MemoryRecordSource::new(records(1, &names))))
        .await?;

    // Wait until the quick records are done and only the hanging ones remain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.status(process_id).await?.progress.processed < 4 {
        assert!(tokio::time::Instant::now() < deadline, "quick records never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    service.stop(process_id).await?;

    let status = tokio::time::timeout(Duration::from_secs(10), service.wait(process_id)).await??;
    assert_eq!(status, ProcessStatus::Error);
    let stored = storage.get_process(process_id).await?.expect("process row");
    assert_eq!(stored.status, ProcessStatus::Error);
    assert_eq!(stored.progress.processed, 4);
    assert_eq!(stored.progress.total, 6);
    Ok(())
}

#[tokio::test]
async fn stop_from_another_instance_is_bounded_by_the_grace_period() -> Result<()> {
    let mut config = test_config();
    config.classifier.provider_timeout_ms = 60_000;
    config.classifier.overall_timeout_ms = 60_000;
    config.orchestrator.stop_poll_ms = 50;
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let owner = NsiService::new(&config, storage.clone(), vec![ScriptedProvider::new("ai", Behaviour::Hang)], None);
    let other = NsiService::new(&config, storage.clone(), vec![], None);

    // Both records are picked up at once, so the feed is over before the stop.
    let process_id = owner.start(1, source(1, 2)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(other.stop(process_id).await?, ProcessStatus::Stopping);

    let status = tokio::time::timeout(Duration::from_secs(10), owner.wait(process_id)).await??;
    assert_eq!(status, ProcessStatus::Error);
    let cause = storage
        .get_process(process_id)
        .await?
        .and_then(|p| p.cause)
        .unwrap_or_default();
    assert!(cause.contains("grace"), "unexpected cause: {}", cause);
    Ok(())
}

#[tokio::test]
async fn stop_from_another_instance_drains_to_stopped() -> Result<()> {
    let mut config = test_config();
    config.orchestrator.stop_poll_ms = 20;
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let owner = NsiService::new(
        &config,
        storage.clone(),
        vec![ScriptedProvider::new("ai", Behaviour::Slow(Duration::from_millis(200)))],
        None,
    );
    let other = NsiService::new(&config, storage.clone(), vec![], None);

    let process_id = owner.start(1, source(1, 8)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    other.stop(process_id).await?;

    let status = tokio::time::timeout(Duration::from_secs(10), owner.wait(process_id)).await??;
    assert_eq!(status, ProcessStatus::Stopped);
    let stored = storage.get_process(process_id).await?.expect("process row");
    assert!(stored.progress.processed >= 2);
    assert!(stored.progress.processed < stored.progress.total);
    Ok(())
}

#[tokio::test]
async fn a_panicking_provider_fails_the_process() -> Result<()> {
    let config = test_config();
    let (service, _) = memory_service(&config, vec![ScriptedProvider::new("ai", Behaviour::Panic)]);

    let process_id = service.start(1, source(1, 3)).await?;
    let status = tokio::time::timeout(Duration::from_secs(10), service.wait(process_id)).await??;
    assert_eq!(status, ProcessStatus::Error);
    let process = service.status(process_id).await?;
    assert!(process.cause.is_some());
    Ok(())
}

#[tokio::test]
async fn recovery_fails_processes_with_no_live_driver() -> Result<()> {
    let config = test_config();
    let (service, storage) = memory_service(
        &config,
        vec![ScriptedProvider::new("ai", Behaviour::Slow(Duration::from_millis(100)))],
    );

    // Left behind by an instance that died mid-run.
    let orphan = NormalizationProcess::new(3);
    storage.try_start_process(&orphan).await?;
    assert!(matches!(service.start(3, source(3, 1)).await, Err(PipelineError::Conflict(_))));

    let live = service.start(4, source(4, 2)).await?;
    let recovered = service.recover_stale(None).await?;
    assert_eq!(recovered, vec![orphan.id]);

    let orphan = service.status(orphan.id).await?;
    assert_eq!(orphan.status, ProcessStatus::Error);
    assert!(orphan.cause.is_some());

    assert_eq!(service.wait(live).await?, ProcessStatus::Completed);
    let restarted = service.start(3, source(3, 1)).await?;
    assert_eq!(service.wait(restarted).await?, ProcessStatus::Completed);
    Ok(())
}
