use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

use nsi_pipeline::config::Config;
use nsi_pipeline::domain::{EntityType, ProcessStatus};
use nsi_pipeline::infra::NdjsonRecordSource;
use nsi_pipeline::logging;
use nsi_pipeline::observability::metrics;
use nsi_pipeline::pipeline::orchestrator::ProcessEvent;
use nsi_pipeline::pipeline::processing::quality::QualityScope;
use nsi_pipeline::NsiService;

#[derive(Parser)]
#[command(name = "nsi-pipeline")]
#[command(about = "Normalization and data-quality pipeline for reference data")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file (defaults to NSI_CONFIG or nsi.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize an NDJSON upload into a project and wait for the run to finish
    Run {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        file: PathBuf,
        /// Entity type for lines that do not carry one
        #[arg(long, default_value = "nomenclature")]
        entity_type: EntityType,
        #[arg(long)]
        batch_id: Option<String>,
    },
    /// Look a name up in the project's benchmarks
    Match {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "nomenclature")]
        entity_type: EntityType,
    },
    /// Ask the configured providers to normalize a name and show their health
    Classify {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "nomenclature")]
        entity_type: EntityType,
    },
    /// Detect duplicate groups
    Duplicates {
        #[arg(long)]
        project: i64,
        #[arg(long, default_value = "nomenclature")]
        entity_type: EntityType,
    },
    /// Merge members of a duplicate group into a master item
    Merge {
        #[arg(long)]
        group: i64,
        #[arg(long)]
        master: i64,
        /// Comma-separated item ids to fold into the master
        #[arg(long, value_delimiter = ',')]
        members: Vec<i64>,
    },
    /// Run quality analysis and print the report
    Quality {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        entity_type: Option<EntityType>,
    },
    /// Apply an auto-applyable quality suggestion
    ApplySuggestion {
        #[arg(long)]
        id: i64,
    },
    /// Mark processes left active by a dead instance as failed
    Recover {
        #[arg(long)]
        project: Option<i64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_upload(
    service: &NsiService,
    project: i64,
    file: PathBuf,
    entity_type: EntityType,
    batch_id: Option<String>,
) -> anyhow::Result<()> {
    let batch_id = batch_id.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string())
    });
    let source = NdjsonRecordSource::open(&file, project, &batch_id, entity_type)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let process_id = service.start(project, Arc::new(source)).await?;
    println!("🚀 Started process {} for project {}", process_id, project);

    // The run may already be over, in which case there is nothing to observe.
    let mut events = service.subscribe(process_id).ok();
    while let Some(rx) = events.as_mut() {
        match rx.recv().await {
            Ok(ProcessEvent::Progress { progress, .. }) => {
                println!(
                    "   {}/{} processed ({} benchmark, {} ai, {} basic, {} failed)",
                    progress.processed,
                    progress.total,
                    progress.benchmark_matched,
                    progress.ai_normalized,
                    progress.basic,
                    progress.failed
                );
            }
            Ok(ProcessEvent::RecordFailed { error, .. }) => {
                println!("   ⚠️  {} [{}]: {}", error.record_ref, error.kind, error.message);
            }
            Ok(ProcessEvent::Completed { .. } | ProcessEvent::Stopped { .. } | ProcessEvent::Failed { .. }) => break,
            Ok(ProcessEvent::Started { .. }) => {}
            Err(RecvError::Lagged(skipped)) => info!(skipped, "Progress observer lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    let status = service.wait(process_id).await?;
    let process = service.status(process_id).await?;
    match status {
        ProcessStatus::Completed => println!("✅ Process completed"),
        ProcessStatus::Stopped => println!("⏹️  Process stopped"),
        other => println!(
            "❌ Process ended as {}: {}",
            other,
            process.cause.as_deref().unwrap_or("unknown cause")
        ),
    }
    print_json(&process.progress)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let _log_guard = logging::init_logging(&config.logging);
    if config.metrics.enabled {
        metrics::init(config.metrics.port);
    }

    let service = NsiService::from_config(&config)?;

    let result = match cli.command {
        Commands::Run {
            project,
            file,
            entity_type,
            batch_id,
        } => run_upload(&service, project, file, entity_type, batch_id).await,
        Commands::Match {
            project,
            name,
            entity_type,
        } => match service.match_benchmark(project, &name, entity_type).await? {
            Some(found) => print_json(&found),
            None => {
                println!("No benchmark matches '{}'", name);
                Ok(())
            }
        },
        Commands::Classify { name, entity_type } => {
            let outcome = service.classify(&name, entity_type).await;
            print_json(&service.provider_health())?;
            print_json(&outcome?)
        }
        Commands::Duplicates { project, entity_type } => {
            print_json(&service.detect_duplicates(project, entity_type).await?)
        }
        Commands::Merge { group, master, members } => {
            print_json(&service.merge_duplicates(group, master, &members).await?)
        }
        Commands::Quality { project, entity_type } => {
            let report = service
                .analyze_quality(QualityScope {
                    project_id: project,
                    entity_type,
                })
                .await?;
            print_json(&report)
        }
        Commands::ApplySuggestion { id } => print_json(&service.apply_suggestion(id).await?),
        Commands::Recover { project } => print_json(&service.recover_stale(project).await?),
    };

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}
