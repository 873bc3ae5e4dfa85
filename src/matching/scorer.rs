// src/matching/scorer.rs
//! Applies a match rule's fields to a record pair and produces one
//! weight-normalized aggregate score with its per-field breakdown.

use log::warn;

use crate::matching::comparators::compare;
use crate::matching::transforms::transform_value;
use crate::models::core::Record;
use crate::models::matching::{FieldOutcome, FieldScore, MatchCandidate};
use crate::models::rules::{ComparisonType, MatchAlgorithm, MatchField, MatchRule, NullHandling};
use crate::plugins::PluginRegistry;

/// Result of scoring one pair.
#[derive(Debug, Clone)]
pub enum PairScore {
    Scored(MatchCandidate),
    /// No field contributed any weight; the breakdown is kept for diagnostics.
    Discarded { breakdown: Vec<FieldScore> },
}

/// Σ(score × weight) / Σ(weight applied), or `None` when nothing was applied.
pub fn aggregate(breakdown: &[FieldScore]) -> Option<(f64, f64)> {
    let (numerator, denominator) = breakdown.iter().fold((0.0, 0.0), |(num, den), field| match field.score {
        Some(score) => (num + score * field.weight, den + field.weight),
        None => (num, den),
    });
    if denominator <= 0.0 {
        None
    } else {
        Some(((numerator / denominator).clamp(0.0, 1.0), denominator))
    }
}

fn excluded(field: &MatchField, outcome: FieldOutcome, warning: Option<String>) -> FieldScore {
    FieldScore {
        attribute: field.attribute.clone(),
        comparison_type: field.comparison_type,
        weight: field.weight,
        score: None,
        outcome,
        warning,
    }
}

fn scored(field: &MatchField, score: f64, outcome: FieldOutcome, warning: Option<String>) -> FieldScore {
    FieldScore {
        attribute: field.attribute.clone(),
        comparison_type: field.comparison_type,
        weight: field.weight,
        score: Some(score),
        outcome,
        warning,
    }
}

/// Scores one field. Absent values are settled by null handling before any
/// comparator runs; ML failures score zero with a warning.
pub async fn score_field(
    field: &MatchField,
    rule: &MatchRule,
    a: &Record,
    b: &Record,
    plugins: &PluginRegistry,
) -> FieldScore {
    let value_a = a
        .value(&field.attribute)
        .map(|v| transform_value(v, &field.transform_before))
        .filter(|v| !v.is_null());
    let value_b = b
        .value(&field.attribute)
        .map(|v| transform_value(v, &field.transform_before))
        .filter(|v| !v.is_null());

    let (Some(value_a), Some(value_b)) = (value_a, value_b) else {
        return match field.null_handling {
            NullHandling::Match => scored(field, 1.0, FieldOutcome::NullMatch, None),
            NullHandling::NoMatch => scored(field, 0.0, FieldOutcome::NullNoMatch, None),
            NullHandling::Ignore => excluded(field, FieldOutcome::Ignored, None),
        };
    };

    if rule.algorithm == MatchAlgorithm::Ml && field.comparison_type == ComparisonType::Fuzzy {
        let scorer = rule.ml_scorer.as_deref().unwrap_or_default();
        return match plugins.score_external(scorer, &field.attribute, &value_a, &value_b).await {
            Ok(result) => scored(field, result.score, FieldOutcome::Compared, result.warning),
            Err(e) => {
                warn!(
                    "Rule '{}': comparison of '{}' for ({}, {}) failed, scoring 0: {}",
                    rule.rule_name, field.attribute, a.id, b.id, e
                );
                scored(field, 0.0, FieldOutcome::ComparisonFailed, Some(e.to_string()))
            }
        };
    }

    let score = compare(field.comparison_type, rule.algorithm, &value_a, &value_b, field.tolerance);
    scored(field, score, FieldOutcome::Compared, None)
}

/// Scores a record pair under `rule`. The candidate always lists the smaller
/// record id first.
pub async fn score_pair(rule: &MatchRule, a: &Record, b: &Record, plugins: &PluginRegistry) -> PairScore {
    let (a, b) = if a.id <= b.id { (a, b) } else { (b, a) };

    let mut breakdown = Vec::with_capacity(rule.match_fields.len());
    for field in &rule.match_fields {
        breakdown.push(score_field(field, rule, a, b, plugins).await);
    }

    match aggregate(&breakdown) {
        Some((score, weight_applied)) => PairScore::Scored(MatchCandidate {
            record_a: a.id.clone(),
            record_b: b.id.clone(),
            rule_id: rule.id,
            score,
            weight_applied,
            breakdown,
        }),
        None => {
            warn!(
                "Rule '{}': pair ({}, {}) has no comparable fields; discarded",
                rule.rule_name, a.id, b.id
            );
            PairScore::Discarded { breakdown }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::AttributeValue;
    use crate::plugins::testing::{FailingScorer, FixedScorer};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(id: &str, attrs: &[(&str, &str)]) -> Record {
        attrs.iter().fold(Record::new(id, "customer", "crm", Utc::now()), |r, (k, v)| {
            r.with_attribute(*k, AttributeValue::text(*v))
        })
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::new(Duration::from_millis(200))
    }

    fn field_score(weight: f64, score: Option<f64>) -> FieldScore {
        FieldScore {
            attribute: "x".to_string(),
            comparison_type: ComparisonType::Exact,
            weight,
            score,
            outcome: if score.is_some() { FieldOutcome::Compared } else { FieldOutcome::Ignored },
            warning: None,
        }
    }

    #[test]
    fn test_weighted_example_lands_in_review_band() {
        // 0.6 × 1.0 (tax id) + 0.4 × 0.8 (name) = 0.92
        let breakdown = vec![field_score(0.6, Some(1.0)), field_score(0.4, Some(0.8))];
        let (score, applied) = aggregate(&breakdown).unwrap();
        assert!((score - 0.92).abs() < 1e-9);
        assert!((applied - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_normalizes_unbalanced_weights() {
        let breakdown = vec![field_score(2.0, Some(1.0)), field_score(2.0, Some(0.0))];
        assert_eq!(aggregate(&breakdown), Some((0.5, 4.0)));
        assert_eq!(aggregate(&[field_score(1.0, None)]), None);
    }

    #[tokio::test]
    async fn test_ignore_excludes_weight() {
        let rule = MatchRule::new("customer", "r")
            .with_blocking_fields(&["zip"])
            .with_field(MatchField::new("tax_id", ComparisonType::Exact, 0.6))
            .with_field(MatchField::new("phone", ComparisonType::Exact, 0.3))
            .with_field(MatchField::new("fax", ComparisonType::Exact, 0.2).with_null_handling(NullHandling::NoMatch))
            .with_field(MatchField::new("email", ComparisonType::Exact, 0.1).with_null_handling(NullHandling::Match));
        let a = record("a", &[("tax_id", "1"), ("phone", "555")]);
        let b = record("b", &[("tax_id", "1")]);

        let PairScore::Scored(candidate) = score_pair(&rule, &a, &b, &registry()).await else {
            panic!("expected a scored pair");
        };
        // tax_id (0.6) + fax NO_MATCH (0.2) + email MATCH (0.1); phone ignored
        assert!((candidate.weight_applied - 0.9).abs() < 1e-9);
        assert!((candidate.score - 0.7 / 0.9).abs() < 1e-9);
        let phone = candidate.breakdown.iter().find(|f| f.attribute == "phone").unwrap();
        assert_eq!(phone.outcome, FieldOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_pair_with_no_comparable_fields_discarded() {
        let rule = MatchRule::new("customer", "r")
            .with_blocking_fields(&["zip"])
            .with_field(MatchField::new("tax_id", ComparisonType::Exact, 1.0));
        let a = record("a", &[]);
        let b = record("b", &[("tax_id", "1")]);
        assert!(matches!(score_pair(&rule, &a, &b, &registry()).await, PairScore::Discarded { .. }));
    }

    #[tokio::test]
    async fn test_transforms_applied_before_compare() {
        let rule = MatchRule::new("customer", "r").with_blocking_fields(&["zip"]).with_field(
            MatchField::new("phone", ComparisonType::Exact, 1.0)
                .with_transforms(vec![crate::models::rules::Transform::DigitsOnly]),
        );
        let a = record("a", &[("phone", "(555) 123-4567")]);
        let b = record("b", &[("phone", "555.123.4567")]);
        let PairScore::Scored(candidate) = score_pair(&rule, &a, &b, &registry()).await else {
            panic!("expected a scored pair");
        };
        assert_eq!(candidate.score, 1.0);
    }

    #[tokio::test]
    async fn test_candidate_ids_ordered() {
        let rule = MatchRule::new("customer", "r")
            .with_blocking_fields(&["zip"])
            .with_field(MatchField::new("name", ComparisonType::Fuzzy, 1.0));
        let a = record("z", &[("name", "Acme")]);
        let b = record("a", &[("name", "Acme")]);
        let PairScore::Scored(candidate) = score_pair(&rule, &a, &b, &registry()).await else {
            panic!("expected a scored pair");
        };
        assert_eq!(candidate.record_a.as_str(), "a");
        assert_eq!(candidate.record_b.as_str(), "z");
    }

    #[tokio::test]
    async fn test_ml_failure_scores_zero_with_warning() {
        let mut rule = MatchRule::new("customer", "ml")
            .with_algorithm(MatchAlgorithm::Ml)
            .with_blocking_fields(&["zip"])
            .with_field(MatchField::new("name", ComparisonType::Fuzzy, 0.5))
            .with_field(MatchField::new("tax_id", ComparisonType::Exact, 0.5));
        rule.ml_scorer = Some("broken".to_string());
        let mut plugins = registry();
        plugins.register_scorer("broken", Arc::new(FailingScorer));

        let a = record("a", &[("name", "Acme"), ("tax_id", "1")]);
        let b = record("b", &[("name", "Acme"), ("tax_id", "1")]);
        let PairScore::Scored(candidate) = score_pair(&rule, &a, &b, &plugins).await else {
            panic!("expected a scored pair");
        };
        assert!((candidate.score - 0.5).abs() < 1e-9);
        assert!(candidate.has_warnings());
        assert_eq!(candidate.breakdown[0].outcome, FieldOutcome::ComparisonFailed);
    }

    #[tokio::test]
    async fn test_ml_scorer_used_for_fuzzy_fields() {
        let mut rule = MatchRule::new("customer", "ml")
            .with_algorithm(MatchAlgorithm::Ml)
            .with_blocking_fields(&["zip"])
            .with_field(MatchField::new("name", ComparisonType::Fuzzy, 1.0));
        rule.ml_scorer = Some("model".to_string());
        let mut plugins = registry();
        plugins.register_scorer("model", Arc::new(FixedScorer::new(0.83)));

        let a = record("a", &[("name", "Acme")]);
        let b = record("b", &[("name", "Acme Inc")]);
        let PairScore::Scored(candidate) = score_pair(&rule, &a, &b, &plugins).await else {
            panic!("expected a scored pair");
        };
        assert!((candidate.score - 0.83).abs() < 1e-9);
    }
}
