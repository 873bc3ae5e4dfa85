// src/models/rules.rs
//! Administrator-configured match rules and merge strategies.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ResolutionError, Result};
use crate::merging::aggregate::AggregateFunction;
use crate::plugins::PluginRegistry;

const DEFAULT_MATCH_THRESHOLD: f64 = 0.80;
const DEFAULT_AUTO_MERGE_THRESHOLD: f64 = 0.95;
const DEFAULT_WEIGHT_TOTAL: f64 = 1.0;
const DEFAULT_FIELD_WEIGHT: f64 = 0.50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchAlgorithm {
    Exact,
    #[default]
    Fuzzy,
    Soundex,
    Metaphone,
    Levenshtein,
    JaroWinkler,
    Ml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonType {
    Exact,
    #[default]
    Fuzzy,
    Phonetic,
    Numeric,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NullHandling {
    Match,
    NoMatch,
    #[default]
    Ignore,
}

/// Built-in pre-comparison transforms. Unknown names fail deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
    CollapseWhitespace,
    DigitsOnly,
    Alphanumeric,
    StripPunctuation,
}

/// How multiple blocking fields combine into candidate buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMode {
    /// One bucket per field value; pairs sharing any key are candidates.
    #[default]
    Any,
    /// One composite key over all blocking fields.
    All,
}

/// What to do with buckets larger than the configured cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep a deterministic sample of `max_bucket_size` members.
    #[default]
    Sample,
    /// Drop the bucket entirely.
    Skip,
}

fn default_field_weight() -> f64 {
    DEFAULT_FIELD_WEIGHT
}

fn default_match_threshold() -> f64 {
    DEFAULT_MATCH_THRESHOLD
}

fn default_auto_merge_threshold() -> f64 {
    DEFAULT_AUTO_MERGE_THRESHOLD
}

fn default_weight_total() -> f64 {
    DEFAULT_WEIGHT_TOTAL
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchField {
    pub attribute: String,
    #[serde(default)]
    pub comparison_type: ComparisonType,
    #[serde(default = "default_field_weight")]
    pub weight: f64,
    #[serde(default)]
    pub null_handling: NullHandling,
    #[serde(default)]
    pub transform_before: Vec<Transform>,
    /// Units for NUMERIC, days for DATE.
    #[serde(default)]
    pub tolerance: Option<f64>,
}

impl MatchField {
    pub fn new(attribute: impl Into<String>, comparison_type: ComparisonType, weight: f64) -> Self {
        Self {
            attribute: attribute.into(),
            comparison_type,
            weight,
            null_handling: NullHandling::default(),
            transform_before: Vec::new(),
            tolerance: None,
        }
    }

    pub fn with_null_handling(mut self, null_handling: NullHandling) -> Self {
        self.null_handling = null_handling;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<Transform>) -> Self {
        self.transform_before = transforms;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRule {
    pub id: Uuid,
    pub entity_type: String,
    pub rule_name: String,
    #[serde(default)]
    pub algorithm: MatchAlgorithm,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
    #[serde(default = "default_auto_merge_threshold")]
    pub auto_merge_threshold: f64,
    pub blocking_fields: Vec<String>,
    /// Advisory only: the scorer normalizes by the weights actually applied.
    #[serde(default = "default_weight_total")]
    pub weight_total: f64,
    pub match_fields: Vec<MatchField>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Registry name of the external scorer used when `algorithm` is ML.
    #[serde(default)]
    pub ml_scorer: Option<String>,
    #[serde(default)]
    pub blocking_mode: BlockingMode,
    #[serde(default)]
    pub max_bucket_size: Option<usize>,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default)]
    pub bucket_time_budget_ms: Option<u64>,
}

impl MatchRule {
    pub fn new(entity_type: impl Into<String>, rule_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            rule_name: rule_name.into(),
            algorithm: MatchAlgorithm::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            auto_merge_threshold: DEFAULT_AUTO_MERGE_THRESHOLD,
            blocking_fields: Vec::new(),
            weight_total: DEFAULT_WEIGHT_TOTAL,
            match_fields: Vec::new(),
            is_active: true,
            ml_scorer: None,
            blocking_mode: BlockingMode::default(),
            max_bucket_size: None,
            overflow_policy: OverflowPolicy::default(),
            bucket_time_budget_ms: None,
        }
    }

    pub fn with_algorithm(mut self, algorithm: MatchAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_thresholds(mut self, match_threshold: f64, auto_merge_threshold: f64) -> Self {
        self.match_threshold = match_threshold;
        self.auto_merge_threshold = auto_merge_threshold;
        self
    }

    pub fn with_blocking_fields(mut self, fields: &[&str]) -> Self {
        self.blocking_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_field(mut self, field: MatchField) -> Self {
        self.match_fields.push(field);
        self
    }

    /// Rejects configurations that violate the rule invariants.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(ResolutionError::config(
                self.entity_type.clone(),
                format!("rule '{}': {}", self.rule_name, reason),
            ))
        };

        if !(self.match_threshold > 0.0 && self.match_threshold <= 1.0) {
            return fail(format!("match_threshold {} must be in (0, 1]", self.match_threshold));
        }
        if !(self.auto_merge_threshold >= self.match_threshold && self.auto_merge_threshold <= 1.0) {
            return fail(format!(
                "auto_merge_threshold {} must be in [match_threshold {}, 1]",
                self.auto_merge_threshold, self.match_threshold
            ));
        }
        if self.blocking_fields.is_empty() {
            return fail("at least one blocking field is required".to_string());
        }
        if self.match_fields.is_empty() {
            return fail("at least one match field is required".to_string());
        }
        for field in &self.match_fields {
            if !(field.weight.is_finite() && field.weight > 0.0) {
                return fail(format!("field '{}' has non-positive weight {}", field.attribute, field.weight));
            }
            if let Some(tolerance) = field.tolerance {
                if !(tolerance.is_finite() && tolerance >= 0.0) {
                    return fail(format!("field '{}' has invalid tolerance {}", field.attribute, tolerance));
                }
            }
        }
        if self.algorithm == MatchAlgorithm::Ml && self.ml_scorer.is_none() {
            return fail("algorithm ML requires an ml_scorer".to_string());
        }
        if let Some(max) = self.max_bucket_size {
            if max < 2 {
                return fail(format!("max_bucket_size {} must be at least 2", max));
            }
        }

        let declared_sum: f64 = self.match_fields.iter().map(|f| f.weight).sum();
        if (declared_sum - self.weight_total).abs() > 1e-6 {
            warn!(
                "Rule '{}' declares weight_total {:.2} but field weights sum to {:.2}; scores are normalized at run time",
                self.rule_name, self.weight_total, declared_sum
            );
        }
        Ok(())
    }
}

/// Survivorship strategy, one per attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    MostRecent,
    MostTrusted { trust_source_order: Vec<String> },
    MostComplete,
    Aggregate { aggregate_function: String },
    Manual,
    Custom { custom_function: String },
}

impl StrategyKind {
    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::MostRecent => "MOST_RECENT",
            StrategyKind::MostTrusted { .. } => "MOST_TRUSTED",
            StrategyKind::MostComplete => "MOST_COMPLETE",
            StrategyKind::Aggregate { .. } => "AGGREGATE",
            StrategyKind::Manual => "MANUAL",
            StrategyKind::Custom { .. } => "CUSTOM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeStrategy {
    pub attribute: String,
    #[serde(flatten)]
    pub kind: StrategyKind,
}

impl MergeStrategy {
    pub fn new(attribute: impl Into<String>, kind: StrategyKind) -> Self {
        Self {
            attribute: attribute.into(),
            kind,
        }
    }
}

static DEFAULT_STRATEGY: StrategyKind = StrategyKind::MostRecent;

/// Everything needed to resolve one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResolutionConfig {
    pub entity_type: String,
    #[serde(default)]
    pub match_rules: Vec<MatchRule>,
    #[serde(default)]
    pub merge_strategies: Vec<MergeStrategy>,
}

impl EntityResolutionConfig {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            match_rules: Vec::new(),
            merge_strategies: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: MatchRule) -> Self {
        self.match_rules.push(rule);
        self
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategies.push(strategy);
        self
    }

    pub fn active_rules(&self) -> impl Iterator<Item = &MatchRule> {
        self.match_rules.iter().filter(|r| r.is_active)
    }

    /// Strategy for an attribute, defaulting to MOST_RECENT.
    pub fn strategy_for(&self, attribute: &str) -> &StrategyKind {
        self.merge_strategies
            .iter()
            .find(|s| s.attribute == attribute)
            .map(|s| &s.kind)
            .unwrap_or(&DEFAULT_STRATEGY)
    }

    pub fn strategy_map(&self) -> BTreeMap<String, StrategyKind> {
        self.merge_strategies
            .iter()
            .map(|s| (s.attribute.clone(), s.kind.clone()))
            .collect()
    }

    /// Validates rules and strategies, including every named reference into
    /// the aggregate and plugin registries.
    pub fn validate(&self, plugins: &PluginRegistry) -> Result<()> {
        let fail = |reason: String| Err(ResolutionError::config(self.entity_type.clone(), reason));

        if self.active_rules().next().is_none() {
            return fail("no active match rule configured".to_string());
        }
        for rule in &self.match_rules {
            if rule.entity_type != self.entity_type {
                return fail(format!(
                    "rule '{}' belongs to entity '{}'",
                    rule.rule_name, rule.entity_type
                ));
            }
            rule.validate()?;
            if let Some(scorer) = &rule.ml_scorer {
                if rule.is_active && !plugins.has_scorer(scorer) {
                    return fail(format!("rule '{}' references unknown ML scorer '{}'", rule.rule_name, scorer));
                }
            }
        }

        let mut seen = HashSet::new();
        for strategy in &self.merge_strategies {
            if !seen.insert(strategy.attribute.as_str()) {
                return fail(format!("attribute '{}' has more than one merge strategy", strategy.attribute));
            }
            match &strategy.kind {
                StrategyKind::MostTrusted { trust_source_order } if trust_source_order.is_empty() => {
                    return fail(format!("attribute '{}' uses MOST_TRUSTED with an empty trust order", strategy.attribute));
                }
                StrategyKind::Aggregate { aggregate_function } => {
                    AggregateFunction::from_str(aggregate_function)
                        .map_err(|reason| ResolutionError::config(self.entity_type.clone(), reason))?;
                }
                StrategyKind::Custom { custom_function } if !plugins.has_custom_function(custom_function) => {
                    return fail(format!(
                        "attribute '{}' references unknown custom function '{}'",
                        strategy.attribute, custom_function
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Top-level rule document loaded by the binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionConfig {
    #[serde(default)]
    pub entities: Vec<EntityResolutionConfig>,
}

impl ResolutionConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
