// src/utils/progress_bars/logging.rs - Logging helpers for resolution jobs
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::job::checkpoint::JobState;
use crate::models::stats_models::JobStats;

fn phase_emoji(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "🕓",
        JobState::Blocking => "🧱",
        JobState::Scoring => "🎯",
        JobState::Deciding => "⚖️",
        JobState::Merging => "🔗",
        JobState::Completed => "✅",
        JobState::Failed => "❌",
    }
}

/// Job-scoped logger; every line carries the entity type tag and elapsed time.
#[derive(Clone)]
pub struct ResolutionLogger {
    tag: String,
    job_id: Uuid,
    start_time: Instant,
}

impl ResolutionLogger {
    pub fn new(entity_type: &str, job_id: Uuid) -> Self {
        Self {
            tag: entity_type.to_uppercase(),
            job_id,
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, mode: &str, active_rules: usize) {
        info!(
            "[{}] 🚀 Starting {} resolution job {} with {} active rule(s)",
            self.tag, mode, self.job_id, active_rules
        );
    }

    pub fn log_resume(&self, state: JobState, completed_units: usize, next_cluster: usize) {
        info!(
            "[{}] ♻️  Resuming job {} from {} ({} scoring units done, next cluster #{})",
            self.tag, self.job_id, state, completed_units, next_cluster
        );
    }

    pub fn log_population_changed(&self) {
        warn!(
            "[{}] 🔁 Population changed since last checkpoint of job {}; restarting from BLOCKING",
            self.tag, self.job_id
        );
    }

    pub fn log_phase(&self, state: JobState, details: Option<&str>) {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        match details {
            Some(details) => info!(
                "[{}] {} Phase: {} - {} [+{:.1}s]",
                self.tag,
                phase_emoji(state),
                state,
                details,
                elapsed
            ),
            None => info!("[{}] {} Phase: {} [+{:.1}s]", self.tag, phase_emoji(state), state, elapsed),
        }
    }

    pub fn log_data_loaded(&self, count: usize) {
        info!("[{}] 📊 Loaded {} records", self.tag, count);
    }

    pub fn log_blocking(&self, rule_name: &str, buckets: usize, pairs: usize, skipped: usize, truncated: usize) {
        info!(
            "[{}] 🧱 Rule '{}': {} buckets, {} candidate pairs",
            self.tag, rule_name, buckets, pairs
        );
        if skipped > 0 || truncated > 0 {
            warn!(
                "[{}] ✂️  Rule '{}': {} oversized buckets skipped, {} pairs truncated",
                self.tag, rule_name, skipped, truncated
            );
        }
    }

    pub fn log_scoring_complete(&self, stats: &JobStats) {
        info!(
            "[{}] 🎯 Scoring complete: {} pairs scored, {} auto-merge, {} pending review, {} discarded, {} comparison failures",
            self.tag,
            stats.pairs_scored,
            stats.auto_merge_pairs,
            stats.pending_reviews,
            stats.pairs_discarded,
            stats.comparison_failures
        );
    }

    pub fn log_cache_stats(&self, hits: usize, misses: usize) {
        let total = hits + misses;
        if total > 0 {
            info!(
                "[{}] 💾 External score cache: {} hits, {} misses ({:.1}% hit rate)",
                self.tag,
                hits,
                misses,
                hits as f64 / total as f64 * 100.0
            );
        }
    }

    pub fn log_memory(&self, used_mb: u64) {
        debug!("[{}] 🧠 Memory in use: {} MB", self.tag, used_mb);
    }

    pub fn log_cluster_plans(&self, plans: usize, resume_from: usize) {
        if resume_from > 0 {
            info!(
                "[{}] 🔗 {} cluster plans, skipping {} already committed",
                self.tag, plans, resume_from
            );
        } else {
            info!("[{}] 🔗 {} cluster plans to commit", self.tag, plans);
        }
    }

    pub fn log_completion(&self, stats: &JobStats) {
        info!(
            "[{}] ✅ Job {} completed in {:.2?}: {} records, {} clusters formed, {} updated, {} unchanged, {} partially merged",
            self.tag,
            self.job_id,
            self.start_time.elapsed(),
            stats.records_processed,
            stats.clusters_formed,
            stats.clusters_updated,
            stats.clusters_unchanged,
            stats.clusters_partially_merged
        );
        if stats.pairs_truncated > 0 {
            warn!("[{}] ✂️  {} candidate pairs truncated by bucket limits", self.tag, stats.pairs_truncated);
        }
    }

    pub fn log_warning(&self, message: &str) {
        warn!("[{}] ⚠️  {}", self.tag, message);
    }

    pub fn log_error(&self, message: &str) {
        error!("[{}] ❌ {}", self.tag, message);
    }

    pub fn get_elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

// Run-level logging functions
pub fn log_run_start(entity_types: &[String], max_concurrent_buckets: usize) {
    info!("🚀 ===== ENTITY RESOLUTION RUN STARTING =====");
    info!("⚙️  Configuration:");
    info!("   • {} entity type(s): {}", entity_types.len(), entity_types.join(", "));
    info!("   • Bucket concurrency limit: {}", max_concurrent_buckets);
    info!("============================================");
}

pub fn log_run_completion(duration: Duration, completed: usize, failed: usize) {
    info!("🎉 ===== ENTITY RESOLUTION RUN FINISHED =====");
    info!("⏱️  Total Duration: {:.2?}", duration);
    info!("📈 Entity types completed: {}, failed: {}", completed, failed);
    info!("============================================");
}
