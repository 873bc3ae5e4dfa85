// src/job/checkpoint.rs
//! Job state machine and the resumable progress snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::models::core::RecordId;
use crate::models::stats_models::JobStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Blocking,
    Scoring,
    Deciding,
    Merging,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Blocking => "BLOCKING",
            JobState::Scoring => "SCORING",
            JobState::Deciding => "DECIDING",
            JobState::Merging => "MERGING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Legal forward transitions. FAILED is reachable from every non-terminal state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Pending, Blocking) | (Blocking, Scoring) | (Scoring, Deciding) | (Deciding, Merging) | (Merging, Completed) => {
                true
            }
            // A population change sends a resumed job back to blocking.
            (Scoring | Deciding | Merging, Blocking) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum JobMode {
    Full,
    /// Only pairs involving at least one of the changed records are scored.
    Incremental { changed: BTreeSet<RecordId> },
}

impl JobMode {
    pub fn label(&self) -> &'static str {
        match self {
            JobMode::Full => "full",
            JobMode::Incremental { .. } => "incremental",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    pub job_id: Uuid,
    pub entity_type: String,
    pub mode: JobMode,
    pub state: JobState,
    /// SHA-256 over the population and configuration the progress belongs to.
    pub population_signature: String,
    /// Scoring units (rule offset + bucket index) already persisted.
    #[serde(default)]
    pub completed_blocks: BTreeSet<usize>,
    /// Index of the last cluster plan committed during MERGING.
    #[serde(default)]
    pub last_processed_cluster: Option<usize>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub stats: JobStats,
    pub updated_at: DateTime<Utc>,
}

impl JobCheckpoint {
    pub fn new(job_id: Uuid, entity_type: &str, mode: JobMode, population_signature: String) -> Self {
        Self {
            job_id,
            entity_type: entity_type.to_string(),
            mode,
            state: JobState::Pending,
            population_signature,
            completed_blocks: BTreeSet::new(),
            last_processed_cluster: None,
            failure_reason: None,
            stats: JobStats::default(),
            updated_at: Utc::now(),
        }
    }

    /// Drops all progress, keeping the job identity.
    pub fn reset(&mut self, population_signature: String) {
        self.state = JobState::Pending;
        self.population_signature = population_signature;
        self.completed_blocks.clear();
        self.last_processed_cluster = None;
        self.failure_reason = None;
        self.stats = JobStats::default();
        self.updated_at = Utc::now();
    }

    pub fn next_cluster_index(&self) -> usize {
        self.last_processed_cluster.map(|i| i + 1).unwrap_or(0)
    }
}
