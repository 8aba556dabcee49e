mod common;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use common::{memory_service, record, records, test_config, Behaviour, ScriptedProvider};
use nsi_pipeline::domain::{
    Benchmark, EntityType, LinkKind, ProcessStatus, ProcessingLevel, TaxonomyNode,
};
use nsi_pipeline::infra::MemoryRecordSource;
use nsi_pipeline::pipeline::orchestrator::ProcessEvent;
use nsi_pipeline::pipeline::processing::taxonomy::TaxonomyTree;
use nsi_pipeline::storage::{InMemoryStorage, Storage};
use nsi_pipeline::NsiService;

#[tokio::test]
async fn variation_matches_never_reach_the_classifier() -> Result<()> {
    let config = test_config();
    let provider = ScriptedProvider::new("ai", Behaviour::Echo(0.9));
    let (service, storage) = memory_service(&config, vec![provider.clone()]);

    let mut benchmark = Benchmark::new(1, EntityType::Nomenclature, "Болт М6 оцинкованный")
        .with_category("Крепеж")
        .with_variations(["болт оцинк м6", "BOLT M6 ZN"]);
    service.register_benchmark(&mut benchmark).await?;

    let found = service
        .match_benchmark(1, "bolt m6 zn", EntityType::Nomenclature)
        .await?
        .expect("variation should match");
    assert_eq!(found.benchmark.id, benchmark.id);
    assert_eq!(found.confidence, 1.0);

    let source = MemoryRecordSource::new(records(1, &["болт оцинк м6", "BOLT M6 ZN", "Гайка М8"]));
    let process_id = service.start(1, Arc::new(source)).await?;
    assert_eq!(service.wait(process_id).await?, ProcessStatus::Completed);

    let process = service.status(process_id).await?;
    assert_eq!(process.progress.processed, 3);
    assert_eq!(process.progress.benchmark_matched, 2);
    assert_eq!(process.progress.ai_normalized, 1);
    assert_eq!(provider.calls(), 1);

    let items = storage.list_items(1, None, false).await?;
    let matched: Vec<_> = items
        .iter()
        .filter(|i| i.processing_level == ProcessingLevel::BenchmarkMatched)
        .collect();
    assert_eq!(matched.len(), 2);
    for item in matched {
        assert_eq!(item.benchmark_id, Some(benchmark.id));
        assert_eq!(item.normalized_name, "Болт М6 оцинкованный");
        assert_eq!(item.category.as_deref(), Some("Крепеж"));
        assert_eq!(item.process_id, Some(process_id));
    }
    Ok(())
}

#[tokio::test]
async fn legal_form_variants_match_counterparty_benchmarks() -> Result<()> {
    let config = test_config();
    let (service, _) = memory_service(&config, vec![]);
    let mut benchmark = Benchmark::new(1, EntityType::Counterparty, "ООО Ромашка");
    service.register_benchmark(&mut benchmark).await?;

    let found = service
        .match_benchmark(1, "ооо ромашка", EntityType::Counterparty)
        .await?
        .expect("exact match");
    assert_eq!(found.benchmark.id, benchmark.id);
    assert_eq!(found.confidence, 1.0);

    // Benchmarks are scoped to their project.
    assert!(service
        .match_benchmark(2, "ооо ромашка", EntityType::Counterparty)
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn provider_timeouts_fall_back_to_basic_and_the_run_continues() -> Result<()> {
    let config = test_config();
    let providers: Vec<Arc<dyn nsi_pipeline::app::ports::ClassificationProvider>> = vec![
        ScriptedProvider::new("primary", Behaviour::HangOn("зависание")),
        ScriptedProvider::new("secondary", Behaviour::HangOn("зависание")),
    ];
    let (service, storage) = memory_service(&config, providers);

    let source = MemoryRecordSource::new(records(1, &["Шуруп 3x16", "изделие зависание", "Дюбель 6x40"]));
    let process_id = service.start(1, Arc::new(source)).await?;
    assert_eq!(service.wait(process_id).await?, ProcessStatus::Completed);

    let process = service.status(process_id).await?;
    assert_eq!(process.progress.processed, 3);
    assert_eq!(process.progress.ai_normalized, 2);
    assert_eq!(process.progress.basic, 1);
    assert_eq!(process.progress.failed, 0);
    assert_eq!(process.errors.len(), 1);
    assert_eq!(process.errors[0].record_ref, "row-2");
    assert_eq!(process.errors[0].kind, "provider_unavailable");

    let basic = storage
        .list_items(1, None, false)
        .await?
        .into_iter()
        .find(|i| i.processing_level == ProcessingLevel::Basic)
        .expect("fallback item persisted");
    assert_eq!(basic.normalized_name, "Изделие зависание");
    assert_eq!(basic.source_ref, "row-2");
    Ok(())
}

#[tokio::test]
async fn bad_records_are_counted_without_failing_the_run() -> Result<()> {
    let config = test_config();
    let (service, _) = memory_service(&config, vec![ScriptedProvider::new("ai", Behaviour::Echo(0.8))]);

    let source = MemoryRecordSource::new(vec![
        record(1, "Гайка М8", EntityType::Nomenclature, "a"),
        record(1, "   ", EntityType::Nomenclature, "b"),
    ]);
    let process_id = service.start(1, Arc::new(source)).await?;
    assert_eq!(service.wait(process_id).await?, ProcessStatus::Completed);

    let process = service.status(process_id).await?;
    assert_eq!(process.progress.processed, 2);
    assert_eq!(process.progress.failed, 1);
    assert_eq!(process.errors[0].kind, "validation_failed");
    Ok(())
}

#[tokio::test]
async fn observers_receive_the_terminal_event() -> Result<()> {
    let config = test_config();
    let (service, _) = memory_service(
        &config,
        vec![ScriptedProvider::new("ai", Behaviour::Slow(Duration::from_millis(30)))],
    );

    let source = MemoryRecordSource::new(records(3, &["Шайба 8", "Шайба 10", "Шайба 12", "Шайба 14"]));
    let process_id = service.start(3, Arc::new(source)).await?;
    let mut events = service.subscribe(process_id)?;

    let mut completed = None;
    while let Ok(event) = events.recv().await {
        if let ProcessEvent::Completed { progress, .. } = event {
            completed = Some(progress);
            break;
        }
    }
    let progress = completed.expect("completed event");
    assert_eq!(progress.processed, 4);
    assert_eq!(progress.total, 4);
    Ok(())
}

#[tokio::test]
async fn taxonomy_is_resolved_and_recorded_for_each_item() -> Result<()> {
    let config = test_config();
    let tree = TaxonomyTree::from_nodes(vec![
        TaxonomyNode {
            code: "25.94".into(),
            name: "Крепеж".into(),
            parent_code: None,
        },
        TaxonomyNode {
            code: "25.94.12".into(),
            name: "Гайки шестигранные".into(),
            parent_code: Some("25.94".into()),
        },
    ])?;
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let service = NsiService::new(
        &config,
        storage.clone(),
        vec![ScriptedProvider::new("ai", Behaviour::Echo(0.9))],
        Some(tree),
    );

    let source = MemoryRecordSource::new(records(1, &["Гайки шестигранные"]));
    let process_id = service.start(1, Arc::new(source)).await?;
    assert_eq!(service.wait(process_id).await?, ProcessStatus::Completed);

    let item = storage.list_items(1, None, false).await?.remove(0);
    assert_eq!(item.taxonomy_code.as_deref(), Some("25.94.12"));
    let links = storage.item_links(item.id).await?;
    assert!(links
        .iter()
        .any(|l| l.kind == LinkKind::Taxonomy && l.reference == "25.94.12"));

    let resolution = service.resolve_taxonomy(item.id).await?;
    assert!(resolution.complete);
    assert_eq!(resolution.level_reached, 2);

    let history = service.taxonomy_history(item.id).await?;
    assert_eq!(history.len(), 2);
    let report = service.taxonomy_accuracy(1).await?;
    assert_eq!(report.complete, 2);
    Ok(())
}
