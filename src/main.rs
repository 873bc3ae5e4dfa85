// src/main.rs
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use resolution_lib::models::core::{Record, RecordId};
use resolution_lib::models::matching::ReviewStatus;
use resolution_lib::models::rules::ResolutionConfig;
use resolution_lib::store::{InMemoryResolutionStore, PostgresResolutionStore, ResolutionStore};
use resolution_lib::utils::db_connect::{connect, get_pool_status};
use resolution_lib::utils::engine_config::EngineConfig;
use resolution_lib::utils::env::load_env;
use resolution_lib::utils::get_memory_usage;
use resolution_lib::utils::progress_bars::progress_config::ProgressConfig;
use resolution_lib::utils::source_filter::SourceFilterConfig;
use resolution_lib::{CancelFlag, JobMode, JobReport, ResolutionEngine};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct ResolveArgs {
    /// JSON document with match rules and merge strategies per entity type
    #[arg(long)]
    config: String,

    /// Resolve records from a JSON file in memory instead of PostgreSQL
    #[arg(long)]
    records: Option<String>,

    /// Only resolve this entity type
    #[arg(long)]
    entity_type: Option<String>,

    /// Resume (or re-run) an existing job; requires --entity-type
    #[arg(long)]
    job_id: Option<Uuid>,

    /// Run incrementally, scoring only pairs that touch these record ids
    #[arg(long, value_delimiter = ',')]
    changed: Option<Vec<String>>,

    /// List pending reviews after the run
    #[arg(long)]
    list_pending: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Starting entity resolution");
    load_env();
    let args = ResolveArgs::parse();
    let start_time = Instant::now();

    let source_filter = SourceFilterConfig::from_env();
    source_filter.log_config();
    let progress_config = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress_config.enabled, progress_config.detailed
    );
    let engine_config = EngineConfig::from_env();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Failed to read rule configuration {}", args.config))?;
    let mut config = ResolutionConfig::from_json(&raw).context("Invalid rule configuration")?;
    if let Some(entity_type) = &args.entity_type {
        config.entities.retain(|e| &e.entity_type == entity_type);
        if config.entities.is_empty() {
            return Err(anyhow!("No configuration for entity type '{}'", entity_type));
        }
    }

    let store: Arc<dyn ResolutionStore> = match &args.records {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read records {}", path))?;
            let records: Vec<Record> = serde_json::from_str(&raw).context("Invalid records file")?;
            info!("Loaded {} records from {}", records.len(), path);
            Arc::new(InMemoryResolutionStore::with_records(records).await?)
        }
        None => {
            let pool = connect().await.context("Failed to connect to database")?;
            let (connections, idle) = get_pool_status(&pool);
            info!("Connected to the database ({} connections, {} idle)", connections, idle);
            let store = PostgresResolutionStore::new(pool, source_filter.clone());
            store.ensure_schema().await.context("Failed to prepare schema")?;
            Arc::new(store)
        }
    };

    let plugins = ResolutionEngine::plugin_registry(&engine_config);
    let engine = ResolutionEngine::new(store.clone(), plugins, engine_config)
        .with_progress(progress_config.clone())
        .with_source_filter(source_filter);

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping after in-flight work is checkpointed");
                cancel.cancel();
            }
        });
    }

    let mode = match &args.changed {
        Some(ids) => JobMode::Incremental {
            changed: ids.iter().map(|id| RecordId::from(id.as_str())).collect::<BTreeSet<_>>(),
        },
        None => JobMode::Full,
    };

    let mut reports = Vec::new();
    let mut failed = 0;
    if args.job_id.is_some() || matches!(mode, JobMode::Incremental { .. }) {
        let entity = match (&args.entity_type, config.entities.as_slice()) {
            (Some(_), [entity]) => entity,
            _ => return Err(anyhow!("--job-id and --changed require --entity-type")),
        };
        let job_id = args.job_id.unwrap_or_else(Uuid::new_v4);
        match engine.run_job(entity, job_id, mode, &cancel).await {
            Ok(report) => reports.push(report),
            Err(e) => {
                warn!("Job {} for '{}' did not complete: {}", job_id, entity.entity_type, e);
                failed += 1;
            }
        }
    } else {
        let summary = engine.run_all(&config, &cancel).await;
        failed = summary.failures.len();
        reports = summary.reports;
    }

    info!("=== Resolution Summary ===");
    for report in &reports {
        print_report(report);
    }

    if args.list_pending {
        for entity in &config.entities {
            let reviews = store
                .list_pending_reviews(&entity.entity_type, Some(ReviewStatus::Pending))
                .await?;
            info!("{} pending reviews for '{}'", reviews.len(), entity.entity_type);
            for review in reviews {
                info!(
                    "  review {}: {} <-> {} score {:.3}",
                    review.id, review.candidate.record_a, review.candidate.record_b, review.candidate.score
                );
            }
        }
    }

    if progress_config.should_show_memory() {
        info!("Final memory usage: {} MB", get_memory_usage().await);
    }
    info!("Total execution time: {:.2?}", start_time.elapsed());

    if failed > 0 {
        return Err(anyhow!("{} resolution job(s) failed", failed));
    }
    info!("Resolution completed successfully!");
    Ok(())
}

fn print_report(report: &JobReport) {
    let stats = &report.stats;
    info!(
        "[{}] job {} ({}{}) -> {}",
        report.entity_type,
        report.job_id,
        report.mode,
        if report.resumed { ", resumed" } else { "" },
        report.state
    );
    info!(
        "  records={} pairs_scored={} auto_merge={} pending_reviews={} comparison_failures={}",
        stats.records_processed, stats.pairs_scored, stats.auto_merge_pairs, stats.pending_reviews, stats.comparison_failures
    );
    info!(
        "  clusters formed={} updated={} unchanged={} partial={}",
        stats.clusters_formed, stats.clusters_updated, stats.clusters_unchanged, stats.clusters_partially_merged
    );
    if let Some((hits, misses)) = report.cache_stats {
        info!("  external score cache: {} hits, {} misses", hits, misses);
    }
}
