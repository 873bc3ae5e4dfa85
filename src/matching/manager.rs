// src/matching/manager.rs - Concurrent bucket scoring for one resolution job
use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, error, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clustering::union_find::ShardedUnionFind;
use crate::job::CancelFlag;
use crate::matching::blocking::BlockingIndex;
use crate::matching::decision::classify;
use crate::matching::scorer::{score_pair, PairScore};
use crate::merging::MergeService;
use crate::models::core::{Record, RecordId};
use crate::models::matching::{Decision, FieldOutcome, MatchCandidate, MatchEdge, PendingReview};
use crate::models::rules::{EntityResolutionConfig, MatchRule};
use crate::models::stats_models::ResolutionMetrics;
use crate::store::ResolutionStore;
use crate::utils::progress_bars::progress_config::ProgressConfig;

/// Pairs scored between two cancellation checks inside a bucket.
const CANCEL_CHECK_INTERVAL: usize = 256;

/// Shared state every bucket task of a job reads from.
pub struct ScoringContext {
    pub job_id: Uuid,
    pub config: Arc<EntityResolutionConfig>,
    /// Population, ordered by record id. Bucket members index into it.
    pub records: Arc<Vec<Record>>,
    pub store: Arc<dyn ResolutionStore>,
    pub merger: Arc<MergeService>,
    pub union_find: Arc<ShardedUnionFind>,
    pub metrics: Arc<ResolutionMetrics>,
    /// Incremental jobs only score pairs touching one of these records.
    pub changed: Option<Arc<BTreeSet<RecordId>>>,
    pub cancel: CancelFlag,
    pub semaphore: Arc<Semaphore>,
}

/// One active rule with its blocking index. Units of this pass are numbered
/// `unit_offset + bucket index`.
pub struct RulePass {
    pub rule: Arc<MatchRule>,
    pub index: Arc<BlockingIndex>,
    pub unit_offset: usize,
}

impl RulePass {
    pub fn unit_id(&self, bucket_idx: usize) -> usize {
        self.unit_offset + bucket_idx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoringSummary {
    pub units_run: usize,
    pub units_skipped: usize,
    pub cancelled: bool,
}

/// Scores every bucket of every pass not yet in `completed`, at most
/// `semaphore` buckets at a time.
pub async fn run_scoring(
    ctx: Arc<ScoringContext>,
    passes: &[Arc<RulePass>],
    completed: &BTreeSet<usize>,
    progress: &ProgressConfig,
    multi_progress: Option<&MultiProgress>,
) -> Result<ScoringSummary> {
    let mut summary = ScoringSummary::default();
    let mut tasks: Vec<JoinHandle<Result<BucketStatus>>> = Vec::new();
    let mut bars = Vec::new();

    for pass in passes {
        let bar = progress.bucket_bar(multi_progress, &pass.rule.rule_name, pass.index.buckets.len());
        for bucket_idx in 0..pass.index.buckets.len() {
            if completed.contains(&pass.unit_id(bucket_idx)) {
                summary.units_skipped += 1;
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
                continue;
            }
            tasks.push(spawn_bucket_task(ctx.clone(), pass.clone(), bucket_idx, bar.clone()));
        }
        bars.extend(bar);
    }

    debug!(
        "Launched {} bucket tasks for job {} ({} already completed)",
        tasks.len(),
        ctx.job_id,
        summary.units_skipped
    );

    let mut first_error = None;
    for joined in join_all(tasks).await {
        let outcome = joined.map_err(|e| anyhow!("Bucket task panicked or was aborted: {}", e)).and_then(|r| r);
        match outcome {
            Ok(BucketStatus::Completed) => summary.units_run += 1,
            Ok(BucketStatus::Cancelled) => summary.cancelled = true,
            Err(e) => {
                error!("Bucket task failed for job {}: {:?}", ctx.job_id, e);
                first_error.get_or_insert(e);
            }
        }
    }
    for bar in bars {
        bar.finish_and_clear();
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

fn spawn_bucket_task(
    ctx: Arc<ScoringContext>,
    pass: Arc<RulePass>,
    bucket_idx: usize,
    bar: Option<ProgressBar>,
) -> JoinHandle<Result<BucketStatus>> {
    tokio::spawn(async move {
        if ctx.cancel.is_cancelled() {
            return Ok(BucketStatus::Cancelled);
        }
        let _permit = ctx
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Failed to acquire bucket semaphore permit")?;
        if ctx.cancel.is_cancelled() {
            return Ok(BucketStatus::Cancelled);
        }

        let status = score_bucket(&ctx, &pass, bucket_idx).await?;
        if status == BucketStatus::Completed {
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        Ok(status)
    })
}

async fn score_bucket(ctx: &ScoringContext, pass: &RulePass, bucket_idx: usize) -> Result<BucketStatus> {
    let rule = pass.rule.as_ref();
    let bucket = &pass.index.buckets[bucket_idx];
    let members = &bucket.members;
    let budget = rule.bucket_time_budget_ms.map(Duration::from_millis);
    let started = Instant::now();

    let mut edges: Vec<MatchEdge> = Vec::new();
    let mut reviews: Vec<PendingReview> = Vec::new();
    let mut visited = 0usize;
    let mut truncated = 0usize;

    'pairs: for (pos, &i) in members.iter().enumerate() {
        for &j in &members[pos + 1..] {
            if let Some(budget) = budget {
                if started.elapsed() > budget {
                    truncated = bucket.pair_count() - visited;
                    warn!(
                        "Rule '{}': bucket {} exceeded its {}ms budget; {} pairs truncated",
                        rule.rule_name,
                        bucket.key,
                        budget.as_millis(),
                        truncated
                    );
                    break 'pairs;
                }
            }
            visited += 1;
            if visited % CANCEL_CHECK_INTERVAL == 0 && ctx.cancel.is_cancelled() {
                debug!("Bucket {} of rule '{}' interrupted by cancellation", bucket.key, rule.rule_name);
                return Ok(BucketStatus::Cancelled);
            }
            if !pass.index.owns_pair(bucket_idx, i, j) {
                continue;
            }

            let (a, b) = (&ctx.records[i], &ctx.records[j]);
            if a.id == b.id || a.entity_type != b.entity_type {
                continue;
            }
            if let Some(changed) = &ctx.changed {
                if !changed.contains(&a.id) && !changed.contains(&b.id) {
                    continue;
                }
            }

            match score_pair(rule, a, b, ctx.merger.plugins()).await {
                PairScore::Discarded { .. } => ResolutionMetrics::add(&ctx.metrics.pairs_discarded, 1),
                PairScore::Scored(candidate) => {
                    ResolutionMetrics::add(&ctx.metrics.pairs_scored, 1);
                    let failures = candidate
                        .breakdown
                        .iter()
                        .filter(|f| f.outcome == FieldOutcome::ComparisonFailed)
                        .count();
                    ResolutionMetrics::add(&ctx.metrics.comparison_failures, failures);
                    decide(ctx, rule, candidate, &mut edges, &mut reviews).await;
                }
            }
        }
    }

    ctx.store
        .record_bucket_outcome(ctx.job_id, pass.unit_id(bucket_idx), &edges, &reviews)
        .await
        .with_context(|| format!("Failed to persist outcome of bucket {} ({})", pass.unit_id(bucket_idx), bucket.key))?;

    ResolutionMetrics::add(&ctx.metrics.blocks_processed, 1);
    ResolutionMetrics::add(&ctx.metrics.pairs_truncated, truncated);
    ResolutionMetrics::add(&ctx.metrics.auto_merge_pairs, edges.len());
    ResolutionMetrics::add(&ctx.metrics.pending_reviews, reviews.len());
    Ok(BucketStatus::Completed)
}

async fn decide(
    ctx: &ScoringContext,
    rule: &MatchRule,
    candidate: MatchCandidate,
    edges: &mut Vec<MatchEdge>,
    reviews: &mut Vec<PendingReview>,
) {
    match classify(candidate.score, rule) {
        Decision::AutoMerge => {
            ctx.union_find.union(&candidate.record_a, &candidate.record_b);
            edges.push(MatchEdge {
                record_a: candidate.record_a,
                record_b: candidate.record_b,
                rule_id: candidate.rule_id,
                score: candidate.score,
            });
        }
        Decision::PendingReview => {
            let pair: BTreeSet<RecordId> = [candidate.record_a.clone(), candidate.record_b.clone()]
                .into_iter()
                .collect();
            let preview = match ctx.merger.preview(&ctx.config, &pair).await {
                Ok(golden) => Some(golden),
                Err(e) => {
                    warn!(
                        "Could not build golden preview for ({}, {}): {}",
                        candidate.record_a, candidate.record_b, e
                    );
                    None
                }
            };
            reviews.push(PendingReview::new(ctx.job_id, &ctx.config.entity_type, candidate, preview));
        }
        Decision::NotAMatch => {}
    }
}
