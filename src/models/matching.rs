// src/models/matching.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::clusters::GoldenRecord;
use crate::models::core::RecordId;
use crate::models::rules::ComparisonType;

/// How a single match field contributed to the aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldOutcome {
    Compared,
    NullMatch,
    NullNoMatch,
    Ignored,
    ComparisonFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldScore {
    pub attribute: String,
    pub comparison_type: ComparisonType,
    pub weight: f64,
    /// `None` when the field was excluded from the aggregate.
    pub score: Option<f64>,
    pub outcome: FieldOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl FieldScore {
    pub fn weight_applied(&self) -> f64 {
        if self.score.is_some() {
            self.weight
        } else {
            0.0
        }
    }
}

/// A scored record pair. Record ids are stored in ascending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub record_a: RecordId,
    pub record_b: RecordId,
    pub rule_id: Uuid,
    pub score: f64,
    pub weight_applied: f64,
    pub breakdown: Vec<FieldScore>,
}

impl MatchCandidate {
    pub fn has_warnings(&self) -> bool {
        self.breakdown.iter().any(|f| f.warning.is_some())
    }

    /// Stable id so that re-running a job never duplicates a review request.
    pub fn candidate_id(&self) -> Uuid {
        let key = format!("{}|{}|{}", self.rule_id, self.record_a, self.record_b);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    AutoMerge,
    PendingReview,
    NotAMatch,
}

/// An AUTO_MERGE edge, persisted so a resumed job can rebuild its clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEdge {
    pub record_a: RecordId,
    pub record_b: RecordId,
    pub rule_id: Uuid,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    /// Both records ended up in the same cluster through other matches.
    Superseded,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "PENDING",
            ReviewStatus::Approved => "APPROVED",
            ReviewStatus::Rejected => "REJECTED",
            ReviewStatus::Superseded => "SUPERSEDED",
        }
    }
}

/// A PENDING_REVIEW candidate handed to the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub id: Uuid,
    pub job_id: Uuid,
    pub entity_type: String,
    pub candidate: MatchCandidate,
    /// Golden record the pair would produce if approved.
    pub preview: Option<GoldenRecord>,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

impl PendingReview {
    pub fn new(job_id: Uuid, entity_type: &str, candidate: MatchCandidate, preview: Option<GoldenRecord>) -> Self {
        Self {
            id: candidate.candidate_id(),
            job_id,
            entity_type: entity_type.to_string(),
            candidate,
            preview,
            status: ReviewStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Canonical (ascending) ordering of a record pair.
pub fn ordered_pair<'a>(a: &'a RecordId, b: &'a RecordId) -> (&'a RecordId, &'a RecordId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
