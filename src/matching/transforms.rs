// src/matching/transforms.rs
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::core::AttributeValue;
use crate::models::rules::Transform;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static NON_DIGIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9]").unwrap());
static NON_ALNUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}]").unwrap());
static PUNCTUATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{P}\p{S}]").unwrap());

pub fn apply_transform(transform: Transform, input: &str) -> String {
    match transform {
        Transform::Trim => input.trim().to_string(),
        Transform::Lowercase => input.to_lowercase(),
        Transform::Uppercase => input.to_uppercase(),
        Transform::CollapseWhitespace => WHITESPACE_RE.replace_all(input.trim(), " ").into_owned(),
        Transform::DigitsOnly => NON_DIGIT_RE.replace_all(input, "").into_owned(),
        Transform::Alphanumeric => NON_ALNUM_RE.replace_all(input, "").into_owned(),
        Transform::StripPunctuation => PUNCTUATION_RE.replace_all(input, "").into_owned(),
    }
}

/// Applies a field's transform chain in order. Only text values are rewritten;
/// a value that becomes blank is treated as absent by the scorer.
pub fn transform_value(value: &AttributeValue, transforms: &[Transform]) -> AttributeValue {
    if transforms.is_empty() {
        return value.clone();
    }
    match value {
        AttributeValue::Text(s) => {
            let out = transforms
                .iter()
                .fold(s.clone(), |acc, t| apply_transform(*t, &acc));
            AttributeValue::Text(out)
        }
        other => other.clone(),
    }
}

/// Normalization used for blocking keys: lowercase with collapsed whitespace.
pub fn normalize_key(input: &str) -> String {
    WHITESPACE_RE
        .replace_all(input.trim(), " ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_chain_runs_in_order() {
        let value = AttributeValue::text("  ACME   Corp., Inc. ");
        let out = transform_value(
            &value,
            &[Transform::StripPunctuation, Transform::CollapseWhitespace, Transform::Lowercase],
        );
        assert_eq!(out, AttributeValue::text("acme corp inc"));
    }

    #[test]
    fn test_digits_only() {
        assert_eq!(apply_transform(Transform::DigitsOnly, "(555) 123-4567"), "5551234567");
    }

    #[test]
    fn test_non_text_values_untouched() {
        let value = AttributeValue::Number(12.5);
        assert_eq!(transform_value(&value, &[Transform::DigitsOnly]), value);
    }

    #[test]
    fn test_normalize_key_ignores_case_and_spacing() {
        assert_eq!(normalize_key("  New   York "), normalize_key("new york"));
    }
}
