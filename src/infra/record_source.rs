use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::app::ports::RecordSource;
use crate::domain::{Attributes, EntityType, ProjectId, RawRecord};
use crate::error::{PipelineError, Result};

/// Records held in memory, handed out in order
pub struct MemoryRecordSource {
    total: u64,
    queue: Mutex<VecDeque<RawRecord>>,
}

impl MemoryRecordSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            total: records.len() as u64,
            queue: Mutex::new(records.into()),
        }
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn total(&self) -> Result<u64> {
        Ok(self.total)
    }

    async fn next_batch(&self, limit: usize) -> Result<Vec<RawRecord>> {
        let mut queue = self.queue.lock()?;
        let take = limit.min(queue.len());
        Ok(queue.drain(..take).collect())
    }
}

#[derive(Debug, Deserialize)]
struct NdjsonLine {
    name: String,
    #[serde(default)]
    source_ref: Option<String>,
    #[serde(default)]
    entity_type: Option<EntityType>,
    #[serde(default)]
    client_id: Option<i64>,
    #[serde(default)]
    attributes: Attributes,
}

/// Newline-delimited JSON upload, one record per line:
/// `{"name": "...", "entity_type": "counterparty", "attributes": {"inn": "..."}}`
pub struct NdjsonRecordSource {
    inner: MemoryRecordSource,
}

impl NdjsonRecordSource {
    pub async fn open<P: AsRef<Path>>(
        path: P,
        project_id: ProjectId,
        batch_id: &str,
        default_entity_type: EntityType,
    ) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let records = Self::parse(&content, project_id, batch_id, default_entity_type)?;
        info!(path = %path.display(), records = records.len(), "Loaded NDJSON upload");
        Ok(Self {
            inner: MemoryRecordSource::new(records),
        })
    }

    pub fn parse(
        content: &str,
        project_id: ProjectId,
        batch_id: &str,
        default_entity_type: EntityType,
    ) -> Result<Vec<RawRecord>> {
        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: NdjsonLine = serde_json::from_str(line).map_err(|e| {
                PipelineError::ValidationFailed(format!("line {}: {}", idx + 1, e))
            })?;
            records.push(RawRecord {
                source_ref: parsed
                    .source_ref
                    .unwrap_or_else(|| format!("{}:{}", batch_id, idx + 1)),
                name: parsed.name,
                batch_id: batch_id.to_string(),
                project_id,
                client_id: parsed.client_id,
                entity_type: parsed.entity_type.unwrap_or(default_entity_type),
                attributes: parsed.attributes,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordSource for NdjsonRecordSource {
    async fn total(&self) -> Result<u64> {
        self.inner.total().await
    }

    async fn next_batch(&self, limit: usize) -> Result<Vec<RawRecord>> {
        self.inner.next_batch(limit).await
    }
}
