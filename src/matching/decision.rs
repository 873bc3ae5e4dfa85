// src/matching/decision.rs
use crate::models::matching::Decision;
use crate::models::rules::MatchRule;

/// Classifies a pair score against a rule's thresholds.
pub fn classify(score: f64, rule: &MatchRule) -> Decision {
    if score >= rule.auto_merge_threshold {
        Decision::AutoMerge
    } else if score >= rule.match_threshold {
        Decision::PendingReview
    } else {
        Decision::NotAMatch
    }
}
