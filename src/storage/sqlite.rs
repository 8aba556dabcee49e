use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ItemPatch, MergePlan, Storage};
use crate::domain::*;
use crate::error::{PipelineError, Result};

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS benchmarks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id  INTEGER NOT NULL,
    entity_type TEXT NOT NULL,
    name        TEXT NOT NULL,
    category    TEXT,
    attributes  TEXT NOT NULL DEFAULT '{}',
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_benchmarks_scope ON benchmarks(project_id, entity_type);

CREATE TABLE IF NOT EXISTS benchmark_variations (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    benchmark_id INTEGER NOT NULL REFERENCES benchmarks(id) ON DELETE CASCADE,
    variation    TEXT NOT NULL,
    UNIQUE(benchmark_id, variation)
);

CREATE TABLE IF NOT EXISTS normalized_items (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id       INTEGER NOT NULL,
    entity_type      TEXT NOT NULL,
    source_ref       TEXT NOT NULL,
    source_name      TEXT NOT NULL,
    normalized_name  TEXT NOT NULL,
    category         TEXT,
    quality_score    REAL NOT NULL DEFAULT 0,
    processing_level TEXT NOT NULL,
    benchmark_id     INTEGER REFERENCES benchmarks(id),
    taxonomy_code    TEXT,
    ai_confidence    REAL,
    provider         TEXT,
    attributes       TEXT NOT NULL DEFAULT '{}',
    merged_count     INTEGER NOT NULL DEFAULT 0,
    superseded_by    INTEGER REFERENCES normalized_items(id),
    process_id       TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_items_scope ON normalized_items(project_id, entity_type);

CREATE TABLE IF NOT EXISTS item_links (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id   INTEGER NOT NULL REFERENCES normalized_items(id),
    kind      TEXT NOT NULL,
    reference TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_item_links_item ON item_links(item_id);

CREATE TABLE IF NOT EXISTS duplicate_groups (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id          INTEGER NOT NULL,
    entity_type         TEXT NOT NULL,
    similarity          REAL NOT NULL,
    method              TEXT NOT NULL,
    suggested_master_id INTEGER NOT NULL REFERENCES normalized_items(id),
    merged              INTEGER NOT NULL DEFAULT 0,
    merged_at           TEXT,
    merged_master_id    INTEGER REFERENCES normalized_items(id),
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS duplicate_group_members (
    group_id INTEGER NOT NULL REFERENCES duplicate_groups(id) ON DELETE CASCADE,
    item_id  INTEGER NOT NULL REFERENCES normalized_items(id),
    position INTEGER NOT NULL,
    PRIMARY KEY (group_id, item_id)
);

CREATE TABLE IF NOT EXISTS quality_issues (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id     INTEGER NOT NULL,
    item_id        INTEGER NOT NULL REFERENCES normalized_items(id),
    kind           TEXT NOT NULL,
    rule           TEXT NOT NULL,
    severity       TEXT NOT NULL,
    category       TEXT NOT NULL,
    description    TEXT NOT NULL,
    fingerprint    TEXT NOT NULL,
    confidence     REAL NOT NULL,
    auto_applyable INTEGER NOT NULL DEFAULT 0,
    action         TEXT,
    resolved       INTEGER NOT NULL DEFAULT 0,
    resolved_at    TEXT,
    created_at     TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_quality_issues_open
    ON quality_issues(fingerprint) WHERE resolved = 0;

CREATE TABLE IF NOT EXISTS normalization_processes (
    id          TEXT PRIMARY KEY,
    project_id  INTEGER NOT NULL,
    status      TEXT NOT NULL,
    progress    TEXT NOT NULL,
    errors      TEXT NOT NULL DEFAULT '[]',
    cause       TEXT,
    started_at  TEXT,
    finished_at TEXT,
    updated_at  TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_processes_one_active
    ON normalization_processes(project_id) WHERE status IN ('running', 'stopping');

CREATE TABLE IF NOT EXISTS classification_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id       INTEGER NOT NULL REFERENCES normalized_items(id),
    path          TEXT NOT NULL,
    confidence    REAL NOT NULL,
    level_reached INTEGER NOT NULL,
    complete      INTEGER NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_item ON classification_history(item_id);
"#;

const ITEM_COLUMNS: &str = "id, project_id, entity_type, source_ref, source_name, normalized_name, \
     category, quality_score, processing_level, benchmark_id, taxonomy_code, ai_confidence, \
     provider, attributes, merged_count, superseded_by, process_id, created_at, updated_at";

const ISSUE_COLUMNS: &str = "id, project_id, item_id, kind, rule, severity, category, description, \
     fingerprint, confidence, auto_applyable, action, resolved, resolved_at, created_at";

const PROCESS_COLUMNS: &str =
    "id, project_id, status, progress, errors, cause, started_at, finished_at, updated_at";

/// SQLite-backed storage. One connection behind a mutex, used only from the
/// blocking pool; multi-row writes run in a transaction.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened SQLite storage at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` on the blocking pool with the connection locked
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock()?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| PipelineError::internal(format!("sqlite task failed: {}", e)))?
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| PipelineError::internal(format!("bad timestamp '{}': {}", value, e)))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_json<T: DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(value)?)
}

fn parse_enum<T: FromStr<Err = PipelineError>>(value: &str) -> Result<T> {
    value.parse()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn item_from_row(row: &Row<'_>) -> Result<NormalizedItem> {
    let process_id: Option<String> = row.get(16)?;
    Ok(NormalizedItem {
        id: row.get(0)?,
        project_id: row.get(1)?,
        entity_type: parse_enum(&row.get::<_, String>(2)?)?,
        source_ref: row.get(3)?,
        source_name: row.get(4)?,
        normalized_name: row.get(5)?,
        category: row.get(6)?,
        quality_score: row.get(7)?,
        processing_level: parse_enum(&row.get::<_, String>(8)?)?,
        benchmark_id: row.get(9)?,
        taxonomy_code: row.get(10)?,
        ai_confidence: row.get(11)?,
        provider: row.get(12)?,
        attributes: parse_json(&row.get::<_, String>(13)?)?,
        merged_count: row.get::<_, i64>(14)? as u32,
        superseded_by: row.get(15)?,
        process_id: process_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| PipelineError::internal(format!("bad process id: {}", e)))?,
        created_at: parse_ts(&row.get::<_, String>(17)?)?,
        updated_at: parse_ts(&row.get::<_, String>(18)?)?,
    })
}

fn issue_from_row(row: &Row<'_>) -> Result<QualityIssue> {
    let action: Option<String> = row.get(11)?;
    Ok(QualityIssue {
        id: row.get(0)?,
        project_id: row.get(1)?,
        item_id: row.get(2)?,
        kind: parse_enum(&row.get::<_, String>(3)?)?,
        rule: row.get(4)?,
        severity: parse_enum(&row.get::<_, String>(5)?)?,
        category: row.get(6)?,
        description: row.get(7)?,
        fingerprint: row.get(8)?,
        confidence: row.get(9)?,
        auto_applyable: row.get(10)?,
        action: action.as_deref().map(parse_json).transpose()?,
        resolved: row.get(12)?,
        resolved_at: parse_opt_ts(row.get(13)?)?,
        created_at: parse_ts(&row.get::<_, String>(14)?)?,
    })
}

fn process_from_row(row: &Row<'_>) -> Result<NormalizationProcess> {
    let id: String = row.get(0)?;
    Ok(NormalizationProcess {
        id: Uuid::parse_str(&id)
            .map_err(|e| PipelineError::internal(format!("bad process id '{}': {}", id, e)))?,
        project_id: row.get(1)?,
        status: parse_enum(&row.get::<_, String>(2)?)?,
        progress: parse_json(&row.get::<_, String>(3)?)?,
        errors: parse_json(&row.get::<_, String>(4)?)?,
        cause: row.get(5)?,
        started_at: parse_opt_ts(row.get(6)?)?,
        finished_at: parse_opt_ts(row.get(7)?)?,
        updated_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

fn load_item(conn: &Connection, id: ItemId) -> Result<Option<NormalizedItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM normalized_items WHERE id = ?1",
        ITEM_COLUMNS
    ))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(item_from_row(row)?)),
        None => Ok(None),
    }
}

/// Field-level update that refuses superseded items
fn patch_item(conn: &Connection, id: ItemId, patch: &ItemPatch, at: &DateTime<Utc>) -> Result<NormalizedItem> {
    let changed = conn.execute(
        "UPDATE normalized_items SET
             normalized_name = COALESCE(?2, normalized_name),
             category = COALESCE(?3, category),
             benchmark_id = COALESCE(?4, benchmark_id),
             processing_level = COALESCE(?5, processing_level),
             taxonomy_code = COALESCE(?6, taxonomy_code),
             quality_score = COALESCE(?7, quality_score),
             updated_at = ?8
         WHERE id = ?1 AND superseded_by IS NULL",
        params![
            id,
            patch.normalized_name,
            patch.category,
            patch.benchmark_id,
            patch.processing_level.map(|l| l.as_str()),
            patch.taxonomy_code,
            patch.quality_score,
            ts(at),
        ],
    )?;
    let item = load_item(conn, id)?.ok_or_else(|| PipelineError::NotFound(format!("item {}", id)))?;
    if changed == 0 {
        return Err(PipelineError::Conflict(format!(
            "item {} was merged into {}",
            id,
            item.superseded_by.unwrap_or_default()
        )));
    }
    Ok(item)
}

fn insert_link(conn: &Connection, item_id: ItemId, kind: LinkKind, reference: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO item_links (item_id, kind, reference) VALUES (?1, ?2, ?3)",
        params![item_id, kind.as_str(), reference],
    )?;
    Ok(())
}

fn insert_history(conn: &Connection, entry: &ClassificationResult) -> Result<i64> {
    conn.execute(
        "INSERT INTO classification_history (item_id, path, confidence, level_reached, complete, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.item_id,
            serde_json::to_string(&entry.path)?,
            entry.confidence,
            entry.level_reached as i64,
            entry.complete,
            ts(&entry.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn load_variations(conn: &Connection, benchmark_id: BenchmarkId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT variation FROM benchmark_variations WHERE benchmark_id = ?1 ORDER BY id",
    )?;
    let mut rows = stmt.query(params![benchmark_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get(0)?);
    }
    Ok(out)
}

fn insert_variations(tx: &Transaction<'_>, benchmark_id: BenchmarkId, variations: &[String]) -> Result<()> {
    for variation in variations {
        tx.execute(
            "INSERT OR IGNORE INTO benchmark_variations (benchmark_id, variation) VALUES (?1, ?2)",
            params![benchmark_id, variation],
        )?;
    }
    Ok(())
}

fn load_benchmarks(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Benchmark>> {
    let mut found = Vec::new();
    {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        while let Some(row) = rows.next()? {
            found.push(Benchmark {
                id: row.get(0)?,
                project_id: row.get(1)?,
                entity_type: parse_enum(&row.get::<_, String>(2)?)?,
                name: row.get(3)?,
                category: row.get(4)?,
                attributes: parse_json(&row.get::<_, String>(5)?)?,
                active: row.get(6)?,
                variations: Vec::new(),
                created_at: parse_ts(&row.get::<_, String>(7)?)?,
                updated_at: parse_ts(&row.get::<_, String>(8)?)?,
            });
        }
    }
    for benchmark in found.iter_mut() {
        benchmark.variations = load_variations(conn, benchmark.id)?;
    }
    Ok(found)
}

const BENCHMARK_SELECT: &str = "SELECT id, project_id, entity_type, name, category, attributes, active, \
     created_at, updated_at FROM benchmarks";

fn load_group_members(conn: &Connection, group_id: GroupId) -> Result<Vec<ItemId>> {
    let mut stmt = conn.prepare(
        "SELECT item_id FROM duplicate_group_members WHERE group_id = ?1 ORDER BY position",
    )?;
    let mut rows = stmt.query(params![group_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get(0)?);
    }
    Ok(out)
}

fn load_groups(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<DuplicateGroup>> {
    let mut found = Vec::new();
    {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        while let Some(row) = rows.next()? {
            found.push(DuplicateGroup {
                id: row.get(0)?,
                project_id: row.get(1)?,
                entity_type: parse_enum(&row.get::<_, String>(2)?)?,
                similarity: row.get(3)?,
                method: parse_enum(&row.get::<_, String>(4)?)?,
                suggested_master_id: row.get(5)?,
                item_ids: Vec::new(),
                merged: row.get(6)?,
                merged_at: parse_opt_ts(row.get(7)?)?,
                merged_master_id: row.get(8)?,
                created_at: parse_ts(&row.get::<_, String>(9)?)?,
            });
        }
    }
    for group in found.iter_mut() {
        group.item_ids = load_group_members(conn, group.id)?;
    }
    Ok(found)
}

const GROUP_SELECT: &str = "SELECT id, project_id, entity_type, similarity, method, suggested_master_id, \
     merged, merged_at, merged_master_id, created_at FROM duplicate_groups";

fn load_issue(conn: &Connection, id: IssueId) -> Result<Option<QualityIssue>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM quality_issues WHERE id = ?1", ISSUE_COLUMNS))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(issue_from_row(row)?)),
        None => Ok(None),
    }
}

fn load_process(conn: &Connection, id: ProcessId) -> Result<Option<NormalizationProcess>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM normalization_processes WHERE id = ?1",
        PROCESS_COLUMNS
    ))?;
    let mut rows = stmt.query(params![id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(process_from_row(row)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_benchmark(&self, benchmark: &mut Benchmark) -> Result<()> {
        let row = benchmark.clone();
        benchmark.id = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO benchmarks (project_id, entity_type, name, category, attributes, active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.project_id,
                        row.entity_type.as_str(),
                        row.name,
                        row.category,
                        serde_json::to_string(&row.attributes)?,
                        row.active,
                        ts(&row.created_at),
                        ts(&row.updated_at),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                insert_variations(&tx, id, &row.variations)?;
                tx.commit()?;
                Ok(id)
            })
            .await?;
        debug!("Created benchmark: {} with id {}", benchmark.name, benchmark.id);
        Ok(())
    }

    async fn update_benchmark(&self, benchmark: &mut Benchmark) -> Result<()> {
        benchmark.updated_at = Utc::now();
        let row = benchmark.clone();
        benchmark.variations = self
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE benchmarks SET name = ?2, category = ?3, attributes = ?4, active = ?5, updated_at = ?6
                     WHERE id = ?1",
                    params![
                        row.id,
                        row.name,
                        row.category,
                        serde_json::to_string(&row.attributes)?,
                        row.active,
                        ts(&row.updated_at),
                    ],
                )?;
                if changed == 0 {
                    return Err(PipelineError::NotFound(format!("benchmark {}", row.id)));
                }
                load_variations(conn, row.id)
            })
            .await?;
        Ok(())
    }

    async fn add_variations(&self, benchmark_id: BenchmarkId, variations: &[String]) -> Result<Benchmark> {
        let variations = variations.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE benchmarks SET updated_at = ?2 WHERE id = ?1",
                params![benchmark_id, ts(&Utc::now())],
            )?;
            if changed == 0 {
                return Err(PipelineError::NotFound(format!("benchmark {}", benchmark_id)));
            }
            insert_variations(&tx, benchmark_id, &variations)?;
            tx.commit()?;
            load_benchmarks(conn, &format!("{} WHERE id = ?1", BENCHMARK_SELECT), &[&benchmark_id])?
                .into_iter()
                .next()
                .ok_or_else(|| PipelineError::NotFound(format!("benchmark {}", benchmark_id)))
        })
        .await
    }

    async fn get_benchmark(&self, id: BenchmarkId) -> Result<Option<Benchmark>> {
        self.with_conn(move |conn| {
            Ok(load_benchmarks(conn, &format!("{} WHERE id = ?1", BENCHMARK_SELECT), &[&id])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn list_benchmarks(&self, project_id: ProjectId, entity_type: Option<EntityType>) -> Result<Vec<Benchmark>> {
        self.with_conn(move |conn| match entity_type {
            Some(t) => load_benchmarks(
                conn,
                &format!("{} WHERE project_id = ?1 AND entity_type = ?2 ORDER BY id", BENCHMARK_SELECT),
                &[&project_id, &t.as_str()],
            ),
            None => load_benchmarks(
                conn,
                &format!("{} WHERE project_id = ?1 ORDER BY id", BENCHMARK_SELECT),
                &[&project_id],
            ),
        })
        .await
    }

    async fn create_item_with_history(
        &self,
        item: &mut NormalizedItem,
        history: Option<&mut ClassificationResult>,
    ) -> Result<()> {
        let row = item.clone();
        let entry = history.as_deref().cloned();
        let (item_id, history_id) = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    &format!(
                        "INSERT INTO normalized_items ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                        ITEM_COLUMNS
                    ),
                    params![
                        row.project_id,
                        row.entity_type.as_str(),
                        row.source_ref,
                        row.source_name,
                        row.normalized_name,
                        row.category,
                        row.quality_score,
                        row.processing_level.as_str(),
                        row.benchmark_id,
                        row.taxonomy_code,
                        row.ai_confidence,
                        row.provider,
                        serde_json::to_string(&row.attributes)?,
                        row.merged_count as i64,
                        row.superseded_by,
                        row.process_id.map(|id| id.to_string()),
                        ts(&row.created_at),
                        ts(&row.updated_at),
                    ],
                )?;
                let item_id = tx.last_insert_rowid();
                if !row.source_ref.is_empty() {
                    insert_link(&tx, item_id, LinkKind::Source, &row.source_ref)?;
                }
                if let Some(benchmark_id) = row.benchmark_id {
                    insert_link(&tx, item_id, LinkKind::Benchmark, &benchmark_id.to_string())?;
                }
                if let Some(code) = &row.taxonomy_code {
                    insert_link(&tx, item_id, LinkKind::Taxonomy, code)?;
                }
                let history_id = match entry {
                    Some(mut entry) => {
                        entry.item_id = item_id;
                        Some(insert_history(&tx, &entry)?)
                    }
                    None => None,
                };
                tx.commit()?;
                Ok((item_id, history_id))
            })
            .await?;
        item.id = item_id;
        if let (Some(entry), Some(id)) = (history, history_id) {
            entry.id = id;
            entry.item_id = item_id;
        }
        Ok(())
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<NormalizedItem>> {
        self.with_conn(move |conn| load_item(conn, id)).await
    }

    async fn patch_item(&self, id: ItemId, patch: &ItemPatch, at: DateTime<Utc>) -> Result<NormalizedItem> {
        let patch = patch.clone();
        self.with_conn(move |conn| patch_item(conn, id, &patch, &at)).await
    }

    async fn list_items(
        &self,
        project_id: ProjectId,
        entity_type: Option<EntityType>,
        include_superseded: bool,
    ) -> Result<Vec<NormalizedItem>> {
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {} FROM normalized_items WHERE project_id = ?1", ITEM_COLUMNS);
            if !include_superseded {
                sql.push_str(" AND superseded_by IS NULL");
            }
            let type_filter = entity_type.map(|t| t.as_str());
            if type_filter.is_some() {
                sql.push_str(" AND entity_type = ?2");
            }
            sql.push_str(" ORDER BY id");

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match type_filter {
                Some(t) => stmt.query(params![project_id, t])?,
                None => stmt.query(params![project_id])?,
            };
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(item_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn add_item_link(&self, link: &ItemLink) -> Result<()> {
        let link = link.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO item_links (item_id, kind, reference) VALUES (?1, ?2, ?3)",
                params![link.item_id, link.kind.as_str(), link.reference],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    PipelineError::NotFound(format!("item {}", link.item_id))
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn item_links(&self, item_id: ItemId) -> Result<Vec<ItemLink>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT item_id, kind, reference FROM item_links WHERE item_id = ?1 ORDER BY id")?;
            let mut rows = stmt.query(params![item_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(ItemLink {
                    item_id: row.get(0)?,
                    kind: parse_enum(&row.get::<_, String>(1)?)?,
                    reference: row.get(2)?,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn create_group(&self, group: &mut DuplicateGroup) -> Result<()> {
        let row = group.clone();
        group.id = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                for item_id in &row.item_ids {
                    let exists: Option<i64> = tx
                        .query_row("SELECT id FROM normalized_items WHERE id = ?1", params![item_id], |r| r.get(0))
                        .optional()?;
                    if exists.is_none() {
                        return Err(PipelineError::NotFound(format!("item {}", item_id)));
                    }
                    let taken: Option<i64> = tx
                        .query_row(
                            "SELECT g.id FROM duplicate_groups g
                             JOIN duplicate_group_members m ON m.group_id = g.id
                             WHERE m.item_id = ?1 AND g.merged = 0 LIMIT 1",
                            params![item_id],
                            |r| r.get(0),
                        )
                        .optional()?;
                    if taken.is_some() {
                        return Err(PipelineError::Conflict(format!(
                            "item {} already belongs to an open duplicate group",
                            item_id
                        )));
                    }
                }
                tx.execute(
                    "INSERT INTO duplicate_groups (project_id, entity_type, similarity, method, suggested_master_id, merged, merged_at, merged_master_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        row.project_id,
                        row.entity_type.as_str(),
                        row.similarity,
                        row.method.as_str(),
                        row.suggested_master_id,
                        row.merged,
                        row.merged_at.as_ref().map(ts),
                        row.merged_master_id,
                        ts(&row.created_at),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                for (position, item_id) in row.item_ids.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO duplicate_group_members (group_id, item_id, position) VALUES (?1, ?2, ?3)",
                        params![id, item_id, position as i64],
                    )?;
                }
                tx.commit()?;
                Ok(id)
            })
            .await?;
        Ok(())
    }

    async fn get_group(&self, id: GroupId) -> Result<Option<DuplicateGroup>> {
        self.with_conn(move |conn| {
            Ok(load_groups(conn, &format!("{} WHERE id = ?1", GROUP_SELECT), &[&id])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn list_groups(
        &self,
        project_id: ProjectId,
        entity_type: Option<EntityType>,
        include_merged: bool,
    ) -> Result<Vec<DuplicateGroup>> {
        self.with_conn(move |conn| {
            let mut sql = format!("{} WHERE project_id = ?1", GROUP_SELECT);
            if !include_merged {
                sql.push_str(" AND merged = 0");
            }
            match entity_type {
                Some(t) => {
                    sql.push_str(" AND entity_type = ?2 ORDER BY id");
                    load_groups(conn, &sql, &[&project_id, &t.as_str()])
                }
                None => {
                    sql.push_str(" ORDER BY id");
                    load_groups(conn, &sql, &[&project_id])
                }
            }
        })
        .await
    }

    async fn merge_group(&self, plan: &MergePlan) -> Result<NormalizedItem> {
        let plan = plan.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let merged: Option<bool> = tx
                .query_row(
                    "SELECT merged FROM duplicate_groups WHERE id = ?1",
                    params![plan.group_id],
                    |r| r.get(0),
                )
                .optional()?;
            match merged {
                None => return Err(PipelineError::NotFound(format!("duplicate group {}", plan.group_id))),
                Some(true) => {
                    return Err(PipelineError::Conflict(format!(
                        "duplicate group {} is already merged",
                        plan.group_id
                    )))
                }
                Some(false) => {}
            }

            if load_item(&tx, plan.master_id)?.is_none() {
                return Err(PipelineError::NotFound(format!("item {}", plan.master_id)));
            }
            let mut folded_total = 0i64;
            for id in &plan.folded_ids {
                let item = load_item(&tx, *id)?.ok_or_else(|| PipelineError::NotFound(format!("item {}", id)))?;
                if item.is_superseded() {
                    return Err(PipelineError::Conflict(format!("item {} is already superseded", id)));
                }
                folded_total += 1 + i64::from(item.merged_count);
            }

            let at = ts(&plan.merged_at);
            for id in &plan.folded_ids {
                tx.execute(
                    "UPDATE normalized_items SET superseded_by = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, plan.master_id, at],
                )?;
                tx.execute(
                    "UPDATE item_links SET item_id = ?2 WHERE item_id = ?1",
                    params![id, plan.master_id],
                )?;
                tx.execute(
                    "UPDATE classification_history SET item_id = ?2 WHERE item_id = ?1",
                    params![id, plan.master_id],
                )?;
            }
            tx.execute(
                "UPDATE normalized_items SET merged_count = merged_count + ?2, attributes = ?3, category = ?4,
                     updated_at = ?5
                 WHERE id = ?1",
                params![
                    plan.master_id,
                    folded_total,
                    serde_json::to_string(&plan.attributes)?,
                    plan.category,
                    at,
                ],
            )?;
            tx.execute(
                "UPDATE duplicate_groups SET merged = 1, merged_at = ?2, merged_master_id = ?3 WHERE id = ?1 AND merged = 0",
                params![plan.group_id, at, plan.master_id],
            )?;
            let master = load_item(&tx, plan.master_id)?
                .ok_or_else(|| PipelineError::NotFound(format!("item {}", plan.master_id)))?;
            tx.commit()?;
            Ok(master)
        })
        .await
    }

    async fn create_issue_if_absent(&self, issue: &mut QualityIssue) -> Result<bool> {
        let row = issue.clone();
        let inserted = self
            .with_conn(move |conn| {
                let action = row.action.as_ref().map(serde_json::to_string).transpose()?;
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO quality_issues (project_id, item_id, kind, rule, severity, category, description,
                         fingerprint, confidence, auto_applyable, action, resolved, resolved_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, NULL, ?12)",
                    params![
                        row.project_id,
                        row.item_id,
                        row.kind.as_str(),
                        row.rule,
                        row.severity.as_str(),
                        row.category,
                        row.description,
                        row.fingerprint,
                        row.confidence,
                        row.auto_applyable,
                        action,
                        ts(&row.created_at),
                    ],
                )?;
                Ok((inserted > 0).then(|| conn.last_insert_rowid()))
            })
            .await?;
        match inserted {
            Some(id) => {
                issue.id = id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_issue(&self, id: IssueId) -> Result<Option<QualityIssue>> {
        self.with_conn(move |conn| load_issue(conn, id)).await
    }

    async fn list_issues(
        &self,
        project_id: ProjectId,
        kind: Option<IssueKind>,
        include_resolved: bool,
    ) -> Result<Vec<QualityIssue>> {
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {} FROM quality_issues WHERE project_id = ?1", ISSUE_COLUMNS);
            if !include_resolved {
                sql.push_str(" AND resolved = 0");
            }
            let kind_filter = kind.map(|k| k.as_str());
            if kind_filter.is_some() {
                sql.push_str(" AND kind = ?2");
            }
            sql.push_str(" ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match kind_filter {
                Some(k) => stmt.query(params![project_id, k])?,
                None => stmt.query(params![project_id])?,
            };
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(issue_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn resolve_issue(&self, id: IssueId, at: DateTime<Utc>) -> Result<QualityIssue> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE quality_issues SET resolved = 1, resolved_at = ?2 WHERE id = ?1 AND resolved = 0",
                params![id, ts(&at)],
            )?;
            let issue =
                load_issue(conn, id)?.ok_or_else(|| PipelineError::NotFound(format!("quality issue {}", id)))?;
            if changed == 0 {
                return Err(PipelineError::Conflict(format!("quality issue {} is already resolved", id)));
            }
            Ok(issue)
        })
        .await
    }

    async fn apply_suggestion(
        &self,
        issue_id: IssueId,
        item_id: ItemId,
        patch: &ItemPatch,
        at: DateTime<Utc>,
    ) -> Result<NormalizedItem> {
        let patch = patch.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE quality_issues SET resolved = 1, resolved_at = ?2 WHERE id = ?1 AND resolved = 0",
                params![issue_id, ts(&at)],
            )?;
            if changed == 0 {
                return match load_issue(&tx, issue_id)? {
                    None => Err(PipelineError::NotFound(format!("quality issue {}", issue_id))),
                    Some(_) => Err(PipelineError::Conflict(format!("suggestion {} is already applied", issue_id))),
                };
            }
            // Dropping the transaction on error rolls the issue back to open.
            let item = patch_item(&tx, item_id, &patch, &at)?;
            tx.commit()?;
            Ok(item)
        })
        .await
    }

    async fn try_start_process(&self, process: &NormalizationProcess) -> Result<()> {
        let row = process.clone();
        self.with_conn(move |conn| {
            let result = conn.execute(
                &format!(
                    "INSERT INTO normalization_processes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    PROCESS_COLUMNS
                ),
                params![
                    row.id.to_string(),
                    row.project_id,
                    ProcessStatus::Running.as_str(),
                    serde_json::to_string(&row.progress)?,
                    serde_json::to_string(&row.errors)?,
                    row.cause,
                    row.started_at.as_ref().map(ts),
                    row.finished_at.as_ref().map(ts),
                    ts(&row.updated_at),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(PipelineError::Conflict(format!(
                    "project {} already has an active process",
                    row.project_id
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_process(&self, id: ProcessId) -> Result<Option<NormalizationProcess>> {
        self.with_conn(move |conn| load_process(conn, id)).await
    }

    async fn update_progress(&self, id: ProcessId, progress: &ProcessProgress, errors: &[RecordError]) -> Result<()> {
        let progress = serde_json::to_string(progress)?;
        let errors = serde_json::to_string(errors)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE normalization_processes SET progress = ?2, errors = ?3, updated_at = ?4 WHERE id = ?1",
                params![id.to_string(), progress, errors, ts(&Utc::now())],
            )?;
            if changed == 0 {
                return Err(PipelineError::NotFound(format!("process {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn transition_process(
        &self,
        id: ProcessId,
        from: &[ProcessStatus],
        to: ProcessStatus,
        cause: Option<String>,
    ) -> Result<NormalizationProcess> {
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        self.with_conn(move |conn| {
            let now = Utc::now();
            let finished_at = if to.is_terminal() { Some(ts(&now)) } else { None };
            let changed = conn.execute(
                &format!(
                    "UPDATE normalization_processes
                     SET status = ?2, cause = COALESCE(?3, cause), finished_at = COALESCE(?4, finished_at), updated_at = ?5
                     WHERE id = ?1 AND status IN ({})",
                    allowed
                ),
                params![id.to_string(), to.as_str(), cause, finished_at, ts(&now)],
            );
            let changed = match changed {
                Ok(n) => n,
                Err(e) if is_constraint_violation(&e) => 0,
                Err(e) => return Err(e.into()),
            };
            let process =
                load_process(conn, id)?.ok_or_else(|| PipelineError::NotFound(format!("process {}", id)))?;
            if changed == 0 {
                return Err(PipelineError::Conflict(format!(
                    "process {} is {}, cannot move to {}",
                    id, process.status, to
                )));
            }
            Ok(process)
        })
        .await
    }

    async fn list_processes(&self, project_id: Option<ProjectId>) -> Result<Vec<NormalizationProcess>> {
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {} FROM normalization_processes", PROCESS_COLUMNS);
            if project_id.is_some() {
                sql.push_str(" WHERE project_id = ?1");
            }
            sql.push_str(" ORDER BY started_at");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match project_id {
                Some(p) => stmt.query(params![p])?,
                None => stmt.query([])?,
            };
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(process_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn append_classification(&self, result: &mut ClassificationResult) -> Result<()> {
        let entry = result.clone();
        result.id = self.with_conn(move |conn| insert_history(conn, &entry)).await?;
        Ok(())
    }

    async fn classification_history(&self, item_id: ItemId) -> Result<Vec<ClassificationResult>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, item_id, path, confidence, level_reached, complete, created_at
                 FROM classification_history WHERE item_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query(params![item_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(ClassificationResult {
                    id: row.get(0)?,
                    item_id: row.get(1)?,
                    path: parse_json(&row.get::<_, String>(2)?)?,
                    confidence: row.get(3)?,
                    level_reached: row.get::<_, i64>(4)? as usize,
                    complete: row.get(5)?,
                    created_at: parse_ts(&row.get::<_, String>(6)?)?,
                });
            }
            Ok(out)
        })
        .await
    }
}
