// src/merging/aggregate.rs
//! Closed registry of AGGREGATE survivorship functions.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::models::core::AttributeValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Sum,
    Average,
    Min,
    Max,
    Count,
    Concatenate,
    Union,
}

impl FromStr for AggregateFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(AggregateFunction::Sum),
            "average" | "avg" | "mean" => Ok(AggregateFunction::Average),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "count" => Ok(AggregateFunction::Count),
            "concatenate" | "concat" => Ok(AggregateFunction::Concatenate),
            "union" => Ok(AggregateFunction::Union),
            other => Err(format!("unknown aggregate function '{}'", other)),
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Average => "average",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Count => "count",
            AggregateFunction::Concatenate => "concatenate",
            AggregateFunction::Union => "union",
        };
        f.write_str(name)
    }
}

/// Output of one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated {
    /// `None` when nothing usable was supplied.
    pub value: Option<AttributeValue>,
    /// Number of inputs that could not take part (e.g. text under `sum`).
    pub skipped: usize,
    /// The numeric result left the finite range and was discarded.
    pub overflowed: bool,
}

impl AggregateFunction {
    fn is_numeric(&self) -> bool {
        matches!(
            self,
            AggregateFunction::Sum | AggregateFunction::Average | AggregateFunction::Min | AggregateFunction::Max
        )
    }

    /// Aggregates non-null member values, in the order given.
    pub fn apply(&self, values: &[&AttributeValue]) -> Aggregated {
        let values: Vec<&AttributeValue> = values.iter().copied().filter(|v| !v.is_null()).collect();

        if self.is_numeric() {
            let numbers: Vec<f64> = values
                .iter()
                .filter_map(|v| v.as_number())
                .filter(|x| x.is_finite())
                .collect();
            let skipped = values.len() - numbers.len();
            if numbers.is_empty() {
                return Aggregated {
                    value: None,
                    skipped,
                    overflowed: false,
                };
            }
            let result = match self {
                AggregateFunction::Sum => numbers.iter().sum(),
                AggregateFunction::Average => numbers.iter().sum::<f64>() / numbers.len() as f64,
                AggregateFunction::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
                _ => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            };
            if !result.is_finite() {
                return Aggregated {
                    value: None,
                    skipped,
                    overflowed: true,
                };
            }
            return Aggregated {
                value: Some(AttributeValue::Number(result)),
                skipped,
                overflowed: false,
            };
        }

        let value = match self {
            AggregateFunction::Count => Some(AttributeValue::Number(values.len() as f64)),
            AggregateFunction::Concatenate => {
                let mut seen = HashSet::new();
                let parts: Vec<String> = values
                    .iter()
                    .map(|v| v.as_text().trim().to_string())
                    .filter(|s| seen.insert(s.clone()))
                    .collect();
                (!parts.is_empty()).then(|| AttributeValue::Text(parts.join("; ")))
            }
            _ => {
                let mut seen = HashSet::new();
                let mut items = Vec::new();
                for value in values {
                    let members: Vec<AttributeValue> = match value {
                        AttributeValue::List(list) => list.clone(),
                        other => vec![other.clone()],
                    };
                    for item in members.into_iter().filter(|i| !i.is_null()) {
                        if seen.insert(item.dedup_key()) {
                            items.push(item);
                        }
                    }
                }
                (!items.is_empty()).then_some(AttributeValue::List(items))
            }
        };
        Aggregated {
            value,
            skipped: 0,
            overflowed: false,
        }
    }
}
