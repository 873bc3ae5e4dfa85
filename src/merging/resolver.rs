// src/merging/resolver.rs
//! Survivorship: computes a cluster's golden attribute values from its members.

use log::{debug, warn};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use crate::error::{ResolutionError, Result};
use crate::merging::aggregate::AggregateFunction;
use crate::models::clusters::AttributeProvenance;
use crate::models::core::{AttributeValue, Record, RecordId};
use crate::models::rules::{EntityResolutionConfig, StrategyKind};
use crate::plugins::PluginRegistry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub attributes: BTreeMap<String, AttributeValue>,
    pub provenance: Vec<AttributeProvenance>,
    pub unresolved: Vec<String>,
    pub warnings: Vec<String>,
}

/// Outcome for a single attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeResolution {
    Resolved {
        value: AttributeValue,
        sources: Vec<RecordId>,
        note: Option<String>,
    },
    Unresolved {
        warning: Option<String>,
    },
}

fn holders<'a>(attribute: &str, members: &'a [Record]) -> Vec<(&'a Record, &'a AttributeValue)> {
    members
        .iter()
        .filter_map(|m| m.value(attribute).map(|v| (m, v)))
        .collect()
}

/// Latest `updated_at`; ties go to the smallest record id.
fn most_recent<'a>(candidates: &[(&'a Record, &'a AttributeValue)]) -> Option<(&'a Record, &'a AttributeValue)> {
    candidates
        .iter()
        .copied()
        .max_by_key(|(m, _)| (m.updated_at, Reverse(m.id.clone())))
}

fn resolved(pick: (&Record, &AttributeValue), note: Option<String>) -> AttributeResolution {
    AttributeResolution::Resolved {
        value: pick.1.clone(),
        sources: vec![pick.0.id.clone()],
        note,
    }
}

/// Resolves one attribute with one strategy. Returns `Ok(None)` when no member
/// holds a value and there is nothing to resolve.
pub async fn resolve_attribute(
    entity_type: &str,
    attribute: &str,
    strategy: &StrategyKind,
    members: &[Record],
    manual_value: Option<&AttributeValue>,
    plugins: &PluginRegistry,
) -> Result<Option<AttributeResolution>> {
    let candidates = holders(attribute, members);

    if let StrategyKind::Manual = strategy {
        if let Some(value) = manual_value.filter(|v| !v.is_null()) {
            return Ok(Some(AttributeResolution::Resolved {
                value: value.clone(),
                sources: Vec::new(),
                note: Some("operator supplied".to_string()),
            }));
        }
    }
    if candidates.is_empty() {
        return Ok(None);
    }

    let resolution = match strategy {
        StrategyKind::MostRecent => most_recent(&candidates).map(|pick| resolved(pick, None)),
        StrategyKind::MostTrusted { trust_source_order } => {
            let trusted = trust_source_order.iter().find_map(|source| {
                let from_source: Vec<_> = candidates.iter().copied().filter(|(m, _)| &m.source == source).collect();
                most_recent(&from_source)
            });
            match trusted {
                Some(pick) => Some(resolved(pick, None)),
                None => most_recent(&candidates).map(|pick| {
                    resolved(
                        pick,
                        Some("no trusted source held a value; fell back to MOST_RECENT".to_string()),
                    )
                }),
            }
        }
        StrategyKind::MostComplete => candidates
            .iter()
            .copied()
            .max_by_key(|(m, v)| (v.completeness(), m.updated_at, Reverse(m.id.clone())))
            .map(|pick| resolved(pick, None)),
        StrategyKind::Aggregate { aggregate_function } => {
            let function = AggregateFunction::from_str(aggregate_function)
                .map_err(|reason| ResolutionError::config(entity_type, reason))?;
            let values: Vec<&AttributeValue> = candidates.iter().map(|(_, v)| *v).collect();
            let aggregated = function.apply(&values);
            let note = (aggregated.skipped > 0)
                .then(|| format!("{} value(s) not usable by {}", aggregated.skipped, function));
            Some(match aggregated.value {
                Some(value) => AttributeResolution::Resolved {
                    value,
                    sources: candidates.iter().map(|(m, _)| m.id.clone()).collect(),
                    note,
                },
                None if aggregated.overflowed => AttributeResolution::Unresolved {
                    warning: Some(format!("'{}': aggregate {} overflowed; value discarded", attribute, function)),
                },
                None => AttributeResolution::Unresolved {
                    warning: Some(format!("'{}': no value usable by aggregate {}", attribute, function)),
                },
            })
        }
        StrategyKind::Manual => Some(AttributeResolution::Unresolved { warning: None }),
        StrategyKind::Custom { custom_function } => {
            if !plugins.has_custom_function(custom_function) {
                return Err(ResolutionError::config(
                    entity_type,
                    format!("unknown custom function '{}'", custom_function),
                ));
            }
            Some(match plugins.run_custom(custom_function, attribute, members).await {
                Ok(Some(value)) => {
                    let mut sources: Vec<RecordId> = candidates
                        .iter()
                        .filter(|(_, v)| **v == value)
                        .map(|(m, _)| m.id.clone())
                        .collect();
                    if sources.is_empty() {
                        sources = candidates.iter().map(|(m, _)| m.id.clone()).collect();
                    }
                    AttributeResolution::Resolved {
                        value,
                        sources,
                        note: None,
                    }
                }
                Ok(None) => AttributeResolution::Unresolved {
                    warning: Some(format!("'{}': custom function '{}' returned no value", attribute, custom_function)),
                },
                Err(e) => {
                    warn!("CUSTOM merge of '{}' left unresolved: {}", attribute, e);
                    AttributeResolution::Unresolved {
                        warning: Some(format!("'{}': {}", attribute, e)),
                    }
                }
            })
        }
    };
    Ok(resolution)
}

/// Computes golden attributes for a cluster. Every attribute present on any
/// member (or given a manual value) is resolved with its configured strategy,
/// MOST_RECENT when none is configured.
pub async fn resolve_cluster(
    config: &EntityResolutionConfig,
    members: &[Record],
    manual_values: &BTreeMap<String, AttributeValue>,
    plugins: &PluginRegistry,
) -> Result<MergeOutcome> {
    let attributes: BTreeSet<&str> = members
        .iter()
        .flat_map(|m| m.attributes.keys().map(String::as_str))
        .chain(manual_values.keys().map(String::as_str))
        .collect();

    let mut outcome = MergeOutcome::default();
    for attribute in attributes {
        let strategy = config.strategy_for(attribute);
        let manual = manual_values.get(attribute);
        let Some(resolution) =
            resolve_attribute(&config.entity_type, attribute, strategy, members, manual, plugins).await?
        else {
            continue;
        };

        match resolution {
            AttributeResolution::Resolved { value, sources, note } => {
                outcome.attributes.insert(attribute.to_string(), value);
                outcome.provenance.push(AttributeProvenance {
                    attribute: attribute.to_string(),
                    strategy: strategy.label().to_string(),
                    chosen_sources: sources,
                    note,
                });
            }
            AttributeResolution::Unresolved { warning } => {
                outcome.unresolved.push(attribute.to_string());
                if let Some(w) = warning {
                    outcome.warnings.push(w);
                }
            }
        }
    }

    debug!(
        "Resolved {} attributes for {} members of '{}' ({} unresolved)",
        outcome.attributes.len(),
        members.len(),
        config.entity_type,
        outcome.unresolved.len()
    );
    Ok(outcome)
}
