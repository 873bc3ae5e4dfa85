// src/models/stats_models.rs

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Live counters shared by bucket tasks. Snapshot into [`JobStats`] for reporting.
#[derive(Debug, Default)]
pub struct ResolutionMetrics {
    pub records_processed: AtomicUsize,
    pub blocks_total: AtomicUsize,
    pub blocks_processed: AtomicUsize,
    pub pairs_scored: AtomicUsize,
    pub pairs_discarded: AtomicUsize,
    pub pairs_truncated: AtomicUsize,
    pub comparison_failures: AtomicUsize,
    pub auto_merge_pairs: AtomicUsize,
    pub pending_reviews: AtomicUsize,
    pub clusters_formed: AtomicUsize,
    pub clusters_updated: AtomicUsize,
    pub clusters_unchanged: AtomicUsize,
    pub clusters_partially_merged: AtomicUsize,
}

impl ResolutionMetrics {
    pub fn add(counter: &AtomicUsize, n: usize) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> JobStats {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        JobStats {
            records_processed: get(&self.records_processed),
            blocks_total: get(&self.blocks_total),
            blocks_processed: get(&self.blocks_processed),
            pairs_scored: get(&self.pairs_scored),
            pairs_discarded: get(&self.pairs_discarded),
            pairs_truncated: get(&self.pairs_truncated),
            comparison_failures: get(&self.comparison_failures),
            auto_merge_pairs: get(&self.auto_merge_pairs),
            pending_reviews: get(&self.pending_reviews),
            clusters_formed: get(&self.clusters_formed),
            clusters_updated: get(&self.clusters_updated),
            clusters_unchanged: get(&self.clusters_unchanged),
            clusters_partially_merged: get(&self.clusters_partially_merged),
            ..JobStats::default()
        }
    }
}

/// Operational metrics for one resolution job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub records_processed: usize,
    pub blocks_total: usize,
    pub blocks_processed: usize,
    pub pairs_scored: usize,
    pub pairs_discarded: usize,
    pub pairs_truncated: usize,
    pub comparison_failures: usize,
    pub auto_merge_pairs: usize,
    pub pending_reviews: usize,
    pub clusters_formed: usize,
    pub clusters_updated: usize,
    pub clusters_unchanged: usize,
    pub clusters_partially_merged: usize,
    pub blocking_time: f64,
    pub scoring_time: f64,
    pub merging_time: f64,
}
