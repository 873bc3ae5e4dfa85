// src/matching/comparators.rs
//! Pure comparators: a pair of canonical values in, a similarity in [0, 1] out.

use strsim::{jaro_winkler, normalized_levenshtein};

use crate::matching::phonetic::{metaphone, soundex};
use crate::models::core::AttributeValue;
use crate::models::rules::{ComparisonType, MatchAlgorithm};

/// 1.0 when the values are equal, numerically if both parse as numbers,
/// otherwise by their textual rendering.
pub fn exact(a: &AttributeValue, b: &AttributeValue) -> f64 {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return if x == y { 1.0 } else { 0.0 };
    }
    if a.as_text().trim() == b.as_text().trim() {
        1.0
    } else {
        0.0
    }
}

/// String similarity. LEVENSHTEIN selects normalized edit distance, every other
/// algorithm family uses Jaro-Winkler.
pub fn fuzzy(a: &str, b: &str, algorithm: MatchAlgorithm) -> f64 {
    match algorithm {
        MatchAlgorithm::Levenshtein => normalized_levenshtein(a, b),
        _ => jaro_winkler(a, b),
    }
}

/// 1.0 when both values share a phonetic code. Inputs without letters
/// (codes, numbers) fall back to case-insensitive equality.
pub fn phonetic(a: &str, b: &str, algorithm: MatchAlgorithm) -> f64 {
    let encode = match algorithm {
        MatchAlgorithm::Metaphone => metaphone,
        _ => soundex,
    };
    let (code_a, code_b) = (encode(a), encode(b));
    let same = if code_a.is_empty() || code_b.is_empty() {
        a.trim().to_lowercase() == b.trim().to_lowercase()
    } else {
        code_a == code_b
    };
    if same {
        1.0
    } else {
        0.0
    }
}

/// Full score within `tolerance`, linear decay to zero at twice the tolerance.
pub fn tolerance_decay(diff: f64, tolerance: f64) -> f64 {
    let diff = diff.abs();
    if diff <= tolerance {
        1.0
    } else if tolerance <= 0.0 {
        0.0
    } else {
        (1.0 - (diff - tolerance) / tolerance).max(0.0)
    }
}

pub fn numeric(a: &AttributeValue, b: &AttributeValue, tolerance: f64) -> f64 {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => tolerance_decay(x - y, tolerance),
        _ => 0.0,
    }
}

/// Day-granularity variant of [`numeric`].
pub fn date(a: &AttributeValue, b: &AttributeValue, tolerance_days: f64) -> f64 {
    match (a.as_date(), b.as_date()) {
        (Some(x), Some(y)) => tolerance_decay((x - y).num_days() as f64, tolerance_days),
        _ => 0.0,
    }
}

/// Dispatches to the comparator for a field's comparison type. Always returns
/// a finite value in [0, 1].
pub fn compare(
    comparison_type: ComparisonType,
    algorithm: MatchAlgorithm,
    a: &AttributeValue,
    b: &AttributeValue,
    tolerance: Option<f64>,
) -> f64 {
    let tolerance = tolerance.unwrap_or(0.0);
    let score = match comparison_type {
        ComparisonType::Exact => exact(a, b),
        ComparisonType::Fuzzy => fuzzy(&a.as_text(), &b.as_text(), algorithm),
        ComparisonType::Phonetic => phonetic(&a.as_text(), &b.as_text(), algorithm),
        ComparisonType::Numeric => numeric(a, b, tolerance),
        ComparisonType::Date => date(a, b, tolerance),
    };
    clamp_score(score)
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
