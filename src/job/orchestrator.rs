// src/job/orchestrator.rs
//! Drives one resolution job per entity type through
//! PENDING → BLOCKING → SCORING → DECIDING → MERGING → COMPLETED,
//! checkpointing after every unit of work so a restarted job resumes.

use anyhow::Context;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::clustering::cluster_builder::{build_plans, seed_existing, ClusterPlan};
use crate::clustering::union_find::ShardedUnionFind;
use crate::error::{ResolutionError, Result};
use crate::job::checkpoint::{JobCheckpoint, JobMode, JobState};
use crate::job::signature::population_signature;
use crate::job::CancelFlag;
use crate::matching::blocking::BlockingIndex;
use crate::matching::manager::{run_scoring, RulePass, ScoringContext};
use crate::merging::{CommitOutcome, MergeService};
use crate::models::core::{Record, RecordId};
use crate::models::matching::ReviewStatus;
use crate::models::rules::{EntityResolutionConfig, ResolutionConfig};
use crate::models::stats_models::{JobStats, ResolutionMetrics};
use crate::plugins::PluginRegistry;
use crate::store::ResolutionStore;
use crate::utils::engine_config::EngineConfig;
use crate::utils::get_memory_usage;
use crate::utils::progress_bars::logging::{log_run_completion, log_run_start, ResolutionLogger};
use crate::utils::progress_bars::progress_config::ProgressConfig;
use crate::utils::source_filter::SourceFilterConfig;

/// Job status and metrics handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub entity_type: String,
    pub mode: &'static str,
    pub state: JobState,
    /// True when earlier progress of the same job was reused.
    pub resumed: bool,
    pub stats: JobStats,
    /// External score cache (hits, misses).
    pub cache_stats: Option<(usize, usize)>,
}

/// Outcome of resolving every configured entity type.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<JobReport>,
    pub failures: Vec<(String, ResolutionError)>,
}

/// Per-job working state shared by the phases.
struct JobRun<'a> {
    config: Arc<EntityResolutionConfig>,
    checkpoint: JobCheckpoint,
    records: Arc<Vec<Record>>,
    metrics: Arc<ResolutionMetrics>,
    logger: ResolutionLogger,
    cancel: &'a CancelFlag,
    resumed: bool,
}

pub struct ResolutionEngine {
    store: Arc<dyn ResolutionStore>,
    plugins: Arc<PluginRegistry>,
    merger: Arc<MergeService>,
    engine_config: EngineConfig,
    progress: ProgressConfig,
    source_filter: SourceFilterConfig,
}

impl ResolutionEngine {
    pub fn new(store: Arc<dyn ResolutionStore>, plugins: PluginRegistry, engine_config: EngineConfig) -> Self {
        let plugins = Arc::new(plugins);
        let merger = Arc::new(MergeService::new(store.clone(), plugins.clone()));
        Self {
            store,
            plugins,
            merger,
            engine_config,
            progress: ProgressConfig::disabled(),
            source_filter: SourceFilterConfig::default(),
        }
    }

    /// Plugin registry sized by the engine configuration; register scorers and
    /// custom functions on it before building the engine.
    pub fn plugin_registry(engine_config: &EngineConfig) -> PluginRegistry {
        PluginRegistry::new(engine_config.external_timeout()).with_score_cache(engine_config.score_cache_size)
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_source_filter(mut self, source_filter: SourceFilterConfig) -> Self {
        self.source_filter = source_filter;
        self
    }

    pub fn store(&self) -> &Arc<dyn ResolutionStore> {
        &self.store
    }

    /// Review, manual resolution and unmerge operations.
    pub fn merger(&self) -> &Arc<MergeService> {
        &self.merger
    }

    /// Runs a full job for every configured entity type. A failing entity type
    /// is reported and the others still run.
    pub async fn run_all(&self, config: &ResolutionConfig, cancel: &CancelFlag) -> RunSummary {
        let started = Instant::now();
        let entity_types: Vec<String> = config.entities.iter().map(|e| e.entity_type.clone()).collect();
        log_run_start(&entity_types, self.engine_config.max_concurrent_buckets);

        let mut summary = RunSummary::default();
        let mut seen = HashSet::new();
        for entity in &config.entities {
            if !seen.insert(entity.entity_type.as_str()) {
                let err = ResolutionError::config(&entity.entity_type, "entity type configured more than once");
                warn!("Skipping '{}': {}", entity.entity_type, err);
                summary.failures.push((entity.entity_type.clone(), err));
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }
            match self.run_job(entity, Uuid::new_v4(), JobMode::Full, cancel).await {
                Ok(report) => summary.reports.push(report),
                Err(err) => {
                    warn!("Resolution of '{}' did not complete: {}", entity.entity_type, err);
                    summary.failures.push((entity.entity_type.clone(), err));
                }
            }
        }

        log_run_completion(started.elapsed(), summary.reports.len(), summary.failures.len());
        summary
    }

    /// Runs (or resumes) one job. Configuration errors come back unchanged;
    /// every other failure marks the job FAILED.
    pub async fn run_job(
        &self,
        config: &EntityResolutionConfig,
        job_id: Uuid,
        mode: JobMode,
        cancel: &CancelFlag,
    ) -> Result<JobReport> {
        let logger = ResolutionLogger::new(&config.entity_type, job_id);

        let mut run = match self.prepare(config, job_id, mode, cancel, logger.clone()).await {
            Ok(Prepared::Run(run)) => run,
            Ok(Prepared::AlreadyCompleted(report)) => return Ok(report),
            Err(err) => {
                if err.is_configuration() {
                    self.mark_failed(config, job_id, &err).await;
                }
                return Err(err);
            }
        };

        match self.execute(&mut run).await {
            Ok(()) => Ok(self.report(&run).await),
            Err(err @ ResolutionError::Cancelled { .. }) => {
                self.save(&mut run.checkpoint, &run.metrics).await?;
                logger.log_warning(&err.to_string());
                Err(err)
            }
            Err(err) => {
                let state = run.checkpoint.state;
                let reason = err.to_string();
                logger.log_error(&format!("Job failed during {}: {}", state, reason));
                run.checkpoint.failure_reason = Some(reason.clone());
                if state.can_transition_to(JobState::Failed) {
                    run.checkpoint.state = JobState::Failed;
                }
                if let Err(save_err) = self.save(&mut run.checkpoint, &run.metrics).await {
                    warn!("Could not persist FAILED checkpoint for job {}: {}", job_id, save_err);
                }
                if err.is_configuration() {
                    Err(err)
                } else {
                    Err(ResolutionError::JobFailed { job_id, state, reason })
                }
            }
        }
    }

    async fn prepare<'a>(
        &self,
        config: &EntityResolutionConfig,
        job_id: Uuid,
        mode: JobMode,
        cancel: &'a CancelFlag,
        logger: ResolutionLogger,
    ) -> Result<Prepared<'a>> {
        config.validate(&self.plugins)?;

        let mut records = self
            .store
            .load_records(&config.entity_type)
            .await
            .with_context(|| format!("Failed to load '{}' records", config.entity_type))?;
        self.source_filter.retain(&mut records);
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records.dedup_by(|a, b| a.id == b.id);
        logger.log_data_loaded(records.len());

        let signature = population_signature(config, &mode, &records)?;
        let mut resumed = false;
        let checkpoint = match self.store.load_checkpoint(job_id).await? {
            None => JobCheckpoint::new(job_id, &config.entity_type, mode.clone(), signature),
            Some(existing) if existing.state == JobState::Failed => {
                return Err(ResolutionError::JobFailed {
                    job_id,
                    state: JobState::Failed,
                    reason: existing
                        .failure_reason
                        .unwrap_or_else(|| "job previously failed".to_string()),
                });
            }
            Some(existing) if existing.population_signature == signature => {
                if existing.state == JobState::Completed {
                    info!("Job {} already completed for this population; nothing to do", job_id);
                    return Ok(Prepared::AlreadyCompleted(JobReport {
                        job_id,
                        entity_type: config.entity_type.clone(),
                        mode: existing.mode.label(),
                        state: existing.state,
                        resumed: true,
                        stats: existing.stats,
                        cache_stats: None,
                    }));
                }
                resumed = existing.state != JobState::Pending;
                if resumed {
                    logger.log_resume(existing.state, existing.completed_blocks.len(), existing.next_cluster_index());
                }
                existing
            }
            Some(mut existing) => {
                logger.log_population_changed();
                self.store.clear_job_progress(job_id).await?;
                existing.reset(signature);
                existing.mode = mode;
                existing
            }
        };

        let metrics = Arc::new(ResolutionMetrics::default());
        ResolutionMetrics::add(&metrics.records_processed, records.len());
        logger.log_start(checkpoint.mode.label(), config.active_rules().count());

        Ok(Prepared::Run(JobRun {
            config: Arc::new(config.clone()),
            checkpoint,
            records: Arc::new(records),
            metrics,
            logger,
            cancel,
            resumed,
        }))
    }

    async fn execute(&self, run: &mut JobRun<'_>) -> Result<()> {
        // BLOCKING
        let blocking_started = Instant::now();
        self.advance_to(run, JobState::Blocking).await?;
        let passes = self.build_passes(run);
        run.checkpoint.stats.blocking_time = blocking_started.elapsed().as_secs_f64();

        // SCORING
        let union_find = Arc::new(ShardedUnionFind::default());
        let scoring_started = Instant::now();
        if run.checkpoint.state <= JobState::Scoring {
            self.advance_to(run, JobState::Scoring).await?;
            self.score(run, &passes, union_find.clone()).await?;
        }
        run.checkpoint.stats.scoring_time = scoring_started.elapsed().as_secs_f64();
        run.logger.log_scoring_complete(&run.metrics.snapshot());

        // DECIDING
        self.check_cancel(run)?;
        if run.checkpoint.state <= JobState::Deciding {
            self.advance_to(run, JobState::Deciding).await?;
        }
        let plans = self.decide(run, &union_find).await?;

        // MERGING
        let merging_started = Instant::now();
        self.advance_to(run, JobState::Merging).await?;
        self.merge(run, &plans).await?;
        run.checkpoint.stats.merging_time = merging_started.elapsed().as_secs_f64();

        self.advance_to(run, JobState::Completed).await?;
        let stats = self.snapshot(run);
        run.logger.log_completion(&stats);
        Ok(())
    }

    fn build_passes(&self, run: &JobRun<'_>) -> Vec<Arc<RulePass>> {
        let mut passes = Vec::new();
        let mut unit_offset = 0;
        for rule in run.config.active_rules() {
            let index = BlockingIndex::build(&run.records, rule, self.engine_config.default_max_bucket_size);
            run.logger.log_blocking(
                &rule.rule_name,
                index.buckets.len(),
                index.total_pairs(),
                index.skipped_buckets,
                index.truncated_pairs,
            );
            ResolutionMetrics::add(&run.metrics.blocks_total, index.buckets.len());
            ResolutionMetrics::add(&run.metrics.pairs_truncated, index.truncated_pairs);
            let buckets = index.buckets.len();
            passes.push(Arc::new(RulePass {
                rule: Arc::new(rule.clone()),
                index: Arc::new(index),
                unit_offset,
            }));
            unit_offset += buckets;
        }
        run.logger.log_phase(
            JobState::Blocking,
            Some(&format!("{} rule passes, {} scoring units", passes.len(), unit_offset)),
        );
        passes
    }

    async fn score(&self, run: &mut JobRun<'_>, passes: &[Arc<RulePass>], union_find: Arc<ShardedUnionFind>) -> Result<()> {
        let changed = match &run.checkpoint.mode {
            JobMode::Full => None,
            JobMode::Incremental { changed } => Some(Arc::new(changed.clone())),
        };
        let ctx = Arc::new(ScoringContext {
            job_id: run.checkpoint.job_id,
            config: run.config.clone(),
            records: run.records.clone(),
            store: self.store.clone(),
            merger: self.merger.clone(),
            union_find,
            metrics: run.metrics.clone(),
            changed,
            cancel: run.cancel.clone(),
            semaphore: Arc::new(Semaphore::new(self.engine_config.max_concurrent_buckets.max(1))),
        });

        let multi_progress = self.progress.create_multi_progress();
        let summary = run_scoring(
            ctx,
            passes,
            &run.checkpoint.completed_blocks,
            &self.progress,
            multi_progress.as_ref(),
        )
        .await?;
        debug!(
            "Scoring for job {}: {} units run, {} reused",
            run.checkpoint.job_id, summary.units_run, summary.units_skipped
        );

        if let Some(checkpoint) = self.store.load_checkpoint(run.checkpoint.job_id).await? {
            run.checkpoint.completed_blocks = checkpoint.completed_blocks;
        }
        if self.progress.should_show_memory() {
            run.logger.log_memory(get_memory_usage().await);
        }
        if summary.cancelled {
            return Err(ResolutionError::Cancelled {
                job_id: run.checkpoint.job_id,
                state: run.checkpoint.state,
            });
        }
        self.save(&mut run.checkpoint, &run.metrics).await
    }

    /// Rebuilds the AUTO_MERGE graph from every persisted edge plus the
    /// clusters already committed, retires review requests the graph already
    /// settles and returns the ordered cluster plans.
    async fn decide(&self, run: &mut JobRun<'_>, union_find: &ShardedUnionFind) -> Result<Vec<ClusterPlan>> {
        let job_id = run.checkpoint.job_id;
        let entity_type = run.config.entity_type.clone();

        for edge in self.store.load_match_edges(job_id).await? {
            union_find.union(&edge.record_a, &edge.record_b);
        }
        let existing = self.store.list_clusters(&entity_type).await?;
        seed_existing(union_find, &existing);

        let mut plans = build_plans(&entity_type, union_find, &existing);
        if let JobMode::Incremental { changed } = &run.checkpoint.mode {
            plans.retain(|plan| plan.members.iter().any(|m| changed.contains(m)));
        }

        let mut superseded = 0;
        for review in self
            .store
            .list_pending_reviews(&entity_type, Some(ReviewStatus::Pending))
            .await?
        {
            if union_find.connected(&review.candidate.record_a, &review.candidate.record_b) {
                self.store.update_review_status(review.id, ReviewStatus::Superseded).await?;
                superseded += 1;
            }
        }

        run.logger.log_phase(
            JobState::Deciding,
            Some(&format!("{} cluster plans, {} reviews superseded", plans.len(), superseded)),
        );
        Ok(plans)
    }

    async fn merge(&self, run: &mut JobRun<'_>, plans: &[ClusterPlan]) -> Result<()> {
        let start_index = run.checkpoint.next_cluster_index();
        run.logger.log_cluster_plans(plans.len(), start_index.min(plans.len()));

        for (idx, plan) in plans.iter().enumerate().skip(start_index) {
            self.check_cancel(run)?;
            let outcome = self.merger.commit_plan(&run.config, plan, run.checkpoint.job_id).await?;
            let metrics = &run.metrics;
            match &outcome {
                CommitOutcome::Created(_) => ResolutionMetrics::add(&metrics.clusters_formed, 1),
                CommitOutcome::Updated(_) => ResolutionMetrics::add(&metrics.clusters_updated, 1),
                CommitOutcome::Unchanged(_) => ResolutionMetrics::add(&metrics.clusters_unchanged, 1),
            }
            if outcome.is_partial() {
                ResolutionMetrics::add(&metrics.clusters_partially_merged, 1);
            }
            run.checkpoint.last_processed_cluster = Some(idx);
            self.save(&mut run.checkpoint, &run.metrics).await?;
        }
        Ok(())
    }

    fn check_cancel(&self, run: &JobRun<'_>) -> Result<()> {
        if run.cancel.is_cancelled() {
            Err(ResolutionError::Cancelled {
                job_id: run.checkpoint.job_id,
                state: run.checkpoint.state,
            })
        } else {
            Ok(())
        }
    }

    /// Moves the job forward and persists the checkpoint. Already being in
    /// (or past) `next` is a no-op, which is what lets a resumed job replay
    /// the earlier phases.
    async fn advance_to(&self, run: &mut JobRun<'_>, next: JobState) -> Result<()> {
        let current = run.checkpoint.state;
        if current >= next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(ResolutionError::JobFailed {
                job_id: run.checkpoint.job_id,
                state: current,
                reason: format!("illegal transition {} -> {}", current, next),
            });
        }
        run.checkpoint.state = next;
        run.logger.log_phase(next, None);
        self.save(&mut run.checkpoint, &run.metrics).await
    }

    fn snapshot(&self, run: &JobRun<'_>) -> JobStats {
        let timings = &run.checkpoint.stats;
        JobStats {
            blocking_time: timings.blocking_time,
            scoring_time: timings.scoring_time,
            merging_time: timings.merging_time,
            ..run.metrics.snapshot()
        }
    }

    async fn save(&self, checkpoint: &mut JobCheckpoint, metrics: &ResolutionMetrics) -> Result<()> {
        let timings = checkpoint.stats.clone();
        checkpoint.stats = JobStats {
            blocking_time: timings.blocking_time,
            scoring_time: timings.scoring_time,
            merging_time: timings.merging_time,
            ..metrics.snapshot()
        };
        checkpoint.updated_at = Utc::now();
        self.store
            .save_checkpoint(checkpoint)
            .await
            .with_context(|| format!("Failed to save checkpoint for job {}", checkpoint.job_id))?;
        Ok(())
    }

    async fn mark_failed(&self, config: &EntityResolutionConfig, job_id: Uuid, err: &ResolutionError) {
        let mut checkpoint = match self.store.load_checkpoint(job_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            _ => JobCheckpoint::new(job_id, &config.entity_type, JobMode::Full, String::new()),
        };
        if !checkpoint.state.can_transition_to(JobState::Failed) {
            return;
        }
        checkpoint.state = JobState::Failed;
        checkpoint.failure_reason = Some(err.to_string());
        checkpoint.updated_at = Utc::now();
        if let Err(save_err) = self.store.save_checkpoint(&checkpoint).await {
            warn!("Could not persist FAILED checkpoint for job {}: {}", job_id, save_err);
        }
    }

    async fn report(&self, run: &JobRun<'_>) -> JobReport {
        let cache_stats = self.plugins.cache_stats().await;
        if self.progress.should_show_cache_stats() {
            if let Some((hits, misses)) = cache_stats {
                run.logger.log_cache_stats(hits, misses);
            }
        }
        JobReport {
            job_id: run.checkpoint.job_id,
            entity_type: run.config.entity_type.clone(),
            mode: run.checkpoint.mode.label(),
            state: run.checkpoint.state,
            resumed: run.resumed,
            stats: self.snapshot(run),
            cache_stats,
        }
    }

    /// Records of `entity_type` that have not been merged into any cluster.
    pub async fn unmerged_records(&self, entity_type: &str) -> Result<Vec<RecordId>> {
        let records = self.store.load_records(entity_type).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.merged_into.is_none())
            .map(|r| r.id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }
}

enum Prepared<'a> {
    Run(JobRun<'a>),
    AlreadyCompleted(JobReport),
}
