mod common;

use anyhow::Result;
use std::sync::Arc;
use tempfile::tempdir;

use common::{memory_service, test_config};
use nsi_pipeline::domain::{Benchmark, EntityType, NormalizedItem, ProcessingLevel, QualityIssue};
use nsi_pipeline::error::PipelineError;
use nsi_pipeline::pipeline::processing::quality::QualityScope;
use nsi_pipeline::storage::{SqliteStorage, Storage};
use nsi_pipeline::NsiService;

async fn seed(
    storage: &Arc<dyn Storage>,
    name: &str,
    category: Option<&str>,
    level: ProcessingLevel,
) -> Result<NormalizedItem> {
    let mut item = NormalizedItem::new(1, EntityType::Nomenclature, name, name, level);
    item.category = category.map(str::to_string);
    storage.create_item(&mut item).await?;
    Ok(item)
}

fn find<'a>(issues: &'a [QualityIssue], item_id: i64, rule: &str) -> Option<&'a QualityIssue> {
    issues.iter().find(|i| i.item_id == item_id && i.rule == rule)
}

#[tokio::test]
async fn rerunning_analysis_never_duplicates_open_issues() -> Result<()> {
    let dir = tempdir()?;
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("nsi.db"))?);
    let service = NsiService::new(&test_config(), storage.clone(), vec![], None);

    let messy = seed(&storage, "гайка  м8", None, ProcessingLevel::Basic).await?;
    seed(&storage, "Гайка м8", Some("Крепеж"), ProcessingLevel::AiNormalized).await?;

    let first = service.analyze_quality(QualityScope::project(1)).await?;
    assert!(first.new_violations > 0);
    assert!(first.new_suggestions > 0);
    assert!(find(&first.violations, messy.id, "name_format").is_some());
    assert!(find(&first.violations, messy.id, "required_category").is_some());
    let formatting = find(&first.suggestions, messy.id, "normalize_formatting").expect("formatting fix");
    assert!(formatting.auto_applyable);
    assert!(find(&first.suggestions, messy.id, "fill_category").is_some());
    assert_eq!(first.scores.items, 2);

    let second = service.analyze_quality(QualityScope::project(1)).await?;
    assert_eq!(second.new_violations, 0);
    assert_eq!(second.new_suggestions, 0);
    assert_eq!(second.violations.len(), first.violations.len());
    assert_eq!(second.suggestions.len(), first.suggestions.len());

    // The stored score reflects the deductions.
    let rescored = storage.get_item(messy.id).await?.expect("item");
    assert!(rescored.quality_score < 0.5);
    Ok(())
}

#[tokio::test]
async fn applying_a_suggestion_twice_leaves_the_same_state() -> Result<()> {
    let config = test_config();
    let (service, storage) = memory_service(&config, vec![]);
    let messy = seed(&storage, "гайка  м8", Some("Крепеж"), ProcessingLevel::Basic).await?;

    let report = service.analyze_quality(QualityScope::project(1)).await?;
    let suggestion = find(&report.suggestions, messy.id, "normalize_formatting").expect("formatting fix");

    let once = service.apply_suggestion(suggestion.id).await?;
    assert_eq!(once.normalized_name, "Гайка м8");
    let twice = service.apply_suggestion(suggestion.id).await?;
    assert_eq!(twice.normalized_name, once.normalized_name);
    assert_eq!(twice.quality_score, once.quality_score);
    assert_eq!(twice.updated_at, once.updated_at);

    let stored = storage.get_issue(suggestion.id).await?.expect("issue");
    assert!(stored.resolved);
    Ok(())
}

#[tokio::test]
async fn benchmark_suggestion_upgrades_the_item() -> Result<()> {
    let config = test_config();
    let (service, storage) = memory_service(&config, vec![]);
    let mut benchmark = Benchmark::new(1, EntityType::Nomenclature, "Болт М6 оцинкованный").with_category("Крепеж");
    service.register_benchmark(&mut benchmark).await?;
    let item = seed(&storage, "Болт М6 оцинк.", None, ProcessingLevel::Basic).await?;

    let report = service.analyze_quality(QualityScope::project(1)).await?;
    let suggestion = find(&report.suggestions, item.id, "benchmark_match").expect("benchmark suggestion");
    assert!(suggestion.confidence >= config.matching.suggestion_threshold);

    let upgraded = service.apply_suggestion(suggestion.id).await?;
    assert_eq!(upgraded.processing_level, ProcessingLevel::BenchmarkMatched);
    assert_eq!(upgraded.benchmark_id, Some(benchmark.id));
    assert_eq!(upgraded.normalized_name, "Болт М6 оцинкованный");
    assert_eq!(upgraded.category.as_deref(), Some("Крепеж"));
    assert!(upgraded.quality_score > item.quality_score);

    // Linked items get no further benchmark suggestions.
    let rerun = service.analyze_quality(QualityScope::project(1)).await?;
    assert_eq!(rerun.new_suggestions, 0);
    Ok(())
}

#[tokio::test]
async fn violations_resolve_once_and_cannot_be_applied() -> Result<()> {
    let config = test_config();
    let (service, storage) = memory_service(&config, vec![]);
    let item = seed(&storage, "Кабель ВВГ 3x2.5", None, ProcessingLevel::AiNormalized).await?;

    let report = service
        .analyze_quality(QualityScope {
            project_id: 1,
            entity_type: Some(EntityType::Nomenclature),
        })
        .await?;
    let violation = find(&report.violations, item.id, "required_category").expect("missing category");

    assert!(matches!(
        service.apply_suggestion(violation.id).await,
        Err(PipelineError::ValidationFailed(_))
    ));
    let resolved = service.resolve_violation(violation.id).await?;
    assert!(resolved.resolved);
    assert!(matches!(
        service.resolve_violation(violation.id).await,
        Err(PipelineError::Conflict(_))
    ));

    // The category is still missing, so the next pass raises it afresh.
    let report = service.analyze_quality(QualityScope::project(1)).await?;
    let reopened = find(&report.violations, item.id, "required_category").expect("re-detected");
    assert_ne!(reopened.id, violation.id);
    assert_eq!(report.new_violations, 1);
    Ok(())
}

#[tokio::test]
async fn suggestions_on_merged_items_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("nsi.db"))?);
    let service = NsiService::new(&test_config(), storage.clone(), vec![], None);

    let master = seed(&storage, "Шайба плоская 8", Some("Крепеж"), ProcessingLevel::AiNormalized).await?;
    let donor = seed(&storage, "шайба  плоская 8", Some("Крепеж"), ProcessingLevel::Basic).await?;

    let report = service.analyze_quality(QualityScope::project(1)).await?;
    let suggestion = find(&report.suggestions, donor.id, "normalize_formatting").expect("formatting fix");

    let group = service.detect_duplicates(1, EntityType::Nomenclature).await?.remove(0);
    service.merge_duplicates(group.id, master.id, &[donor.id]).await?;

    let applied = service.apply_suggestion(suggestion.id).await;
    assert!(matches!(applied, Err(PipelineError::Conflict(_))));
    let stored = storage.get_item(donor.id).await?.expect("donor kept for audit");
    assert_eq!(stored.normalized_name, "шайба  плоская 8");
    assert_eq!(stored.superseded_by, Some(master.id));
    assert!(!storage.get_issue(suggestion.id).await?.expect("issue").resolved);

    // Analysis after the merge leaves the folded item alone.
    let rerun = service.analyze_quality(QualityScope::project(1)).await?;
    assert_eq!(rerun.scores.items, 1);
    Ok(())
}
