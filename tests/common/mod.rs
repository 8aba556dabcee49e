#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nsi_pipeline::app::ports::{ClassificationProvider, ProviderAnswer};
use nsi_pipeline::config::{Config, StorageBackend};
use nsi_pipeline::domain::{Attributes, EntityType, ProjectId, RawRecord};
use nsi_pipeline::error::{PipelineError, Result};
use nsi_pipeline::storage::{InMemoryStorage, Storage};
use nsi_pipeline::NsiService;

#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Answers with the trimmed name and a fixed confidence
    Echo(f64),
    /// Never answers
    Hang,
    /// Hangs on names containing the marker, echoes otherwise
    HangOn(&'static str),
    /// Sleeps, then echoes
    Slow(Duration),
    Fail,
    Panic,
}

pub struct ScriptedProvider {
    id: String,
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(id: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn echo(name: &str, confidence: f64) -> Result<ProviderAnswer> {
    Ok(ProviderAnswer {
        normalized_name: name.trim().to_string(),
        category: Some("Крепеж".to_string()),
        confidence,
    })
}

#[async_trait]
impl ClassificationProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn normalize(&self, name: &str, _entity_type: EntityType) -> Result<ProviderAnswer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Echo(confidence) => echo(name, *confidence),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                echo(name, 0.9)
            }
            Behaviour::HangOn(marker) => {
                if name.contains(marker) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                echo(name, 0.9)
            }
            Behaviour::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                echo(name, 0.9)
            }
            Behaviour::Fail => Err(PipelineError::ProviderUnavailable(format!("{} is down", self.id))),
            Behaviour::Panic => panic!("provider {} blew up", self.id),
        }
    }
}

/// In-memory config with short timeouts and no follow-on passes
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.classifier.provider_timeout_ms = 100;
    config.classifier.overall_timeout_ms = 300;
    config.orchestrator.workers = 2;
    config.orchestrator.batch_size = 2;
    config.orchestrator.grace_period_secs = 1;
    config.orchestrator.follow_on_passes = false;
    config
}

pub fn memory_service(config: &Config, providers: Vec<Arc<dyn ClassificationProvider>>) -> (NsiService, Arc<dyn Storage>) {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    (NsiService::new(config, storage.clone(), providers, None), storage)
}

pub fn record(project_id: ProjectId, name: &str, entity_type: EntityType, source_ref: &str) -> RawRecord {
    RawRecord {
        source_ref: source_ref.to_string(),
        name: name.to_string(),
        batch_id: "test-batch".to_string(),
        project_id,
        client_id: None,
        entity_type,
        attributes: Attributes::new(),
    }
}

pub fn records(project_id: ProjectId, names: &[&str]) -> Vec<RawRecord> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| record(project_id, name, EntityType::Nomenclature, &format!("row-{}", i + 1)))
        .collect()
}
