// src/error.rs
//! Error taxonomy for entity resolution.
//!
//! Configuration problems are fatal to one entity type's resolution only.
//! Comparison failures and bucket overflow never surface here: they are
//! recovered locally and reported through warnings and job metrics.

use thiserror::Error;
use uuid::Uuid;

use crate::job::checkpoint::JobState;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Configuration error for entity '{entity_type}': {reason}")]
    Configuration { entity_type: String, reason: String },

    #[error("External comparison '{capability}' failed: {reason}")]
    ComparisonFailure { capability: String, reason: String },

    #[error("Cluster {cluster_id} has unresolved attributes: {attributes:?}")]
    MergeConflict {
        cluster_id: Uuid,
        attributes: Vec<String>,
    },

    #[error("Persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Review {review_id} is already {status}")]
    ReviewClosed { review_id: Uuid, status: &'static str },

    #[error("Cluster {cluster_id} changed concurrently; gave up after {attempts} attempts")]
    ClusterContention { cluster_id: Uuid, attempts: usize },

    #[error("Job {job_id} failed during {state}: {reason}")]
    JobFailed {
        job_id: Uuid,
        state: JobState,
        reason: String,
    },

    #[error("Job {job_id} was cancelled during {state}")]
    Cancelled { job_id: Uuid, state: JobState },
}

impl ResolutionError {
    pub fn config(entity_type: impl Into<String>, reason: impl Into<String>) -> Self {
        ResolutionError::Configuration {
            entity_type: entity_type.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ResolutionError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ResolutionError::Configuration { .. })
    }
}

impl From<anyhow::Error> for ResolutionError {
    fn from(err: anyhow::Error) -> Self {
        ResolutionError::Persistence(err)
    }
}

pub type Result<T, E = ResolutionError> = std::result::Result<T, E>;
