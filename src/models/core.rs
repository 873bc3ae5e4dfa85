// src/models/core.rs

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a source record. Kept as the source system's string id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        RecordId(value)
    }
}

/// A canonicalized attribute value as delivered by the validation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        AttributeValue::Text(value.into())
    }

    /// Null and blank text both count as "no value".
    pub fn is_null(&self) -> bool {
        match self {
            AttributeValue::Null => true,
            AttributeValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Textual rendering used by string comparators, blocking keys and concatenation.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            AttributeValue::Null => Cow::Borrowed(""),
            AttributeValue::Text(s) => Cow::Borrowed(s.as_str()),
            AttributeValue::Number(n) => Cow::Owned(format_number(*n)),
            AttributeValue::Bool(b) => Cow::Owned(b.to_string()),
            AttributeValue::Date(d) => Cow::Owned(d.format("%Y-%m-%d").to_string()),
            AttributeValue::List(items) => Cow::Owned(
                items
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| v.as_text().into_owned())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            AttributeValue::Map(entries) => Cow::Owned(
                entries
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| format!("{}={}", k, v.as_text()))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) if n.is_finite() => Some(*n),
            AttributeValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            AttributeValue::Date(d) => Some(*d),
            AttributeValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
            _ => None,
        }
    }

    /// How populated a value is. Used by MOST_COMPLETE survivorship; composite
    /// values are measured structurally.
    pub fn completeness(&self) -> usize {
        match self {
            AttributeValue::Null => 0,
            AttributeValue::Text(s) => s.trim().chars().count(),
            AttributeValue::Number(_) | AttributeValue::Bool(_) | AttributeValue::Date(_) => 1,
            AttributeValue::List(items) => items.iter().map(AttributeValue::completeness).sum(),
            AttributeValue::Map(entries) => entries.values().map(AttributeValue::completeness).sum(),
        }
    }

    /// Key used to de-duplicate values in set-like aggregations.
    pub fn dedup_key(&self) -> String {
        match self {
            AttributeValue::Text(s) => format!("t:{}", s),
            other => serde_json::to_string(other).unwrap_or_else(|_| other.as_text().into_owned()),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// A master-data record from one source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub entity_type: String,
    pub source: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Golden record this record was merged into. Members are flagged, never deleted.
    #[serde(default)]
    pub merged_into: Option<Uuid>,
}

impl Record {
    pub fn new(
        id: impl Into<RecordId>,
        entity_type: impl Into<String>,
        source: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            source: source.into(),
            updated_at,
            attributes: BTreeMap::new(),
            merged_into: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Present, non-null value of an attribute.
    pub fn value(&self, attribute: &str) -> Option<&AttributeValue> {
        self.attributes.get(attribute).filter(|v| !v.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_text_is_null() {
        assert!(AttributeValue::text("   ").is_null());
        assert!(AttributeValue::Null.is_null());
        assert!(!AttributeValue::Number(0.0).is_null());
    }

    #[test]
    fn test_text_rendering() {
        assert_eq!(AttributeValue::Number(42.0).as_text(), "42");
        assert_eq!(AttributeValue::Number(4.5).as_text(), "4.5");
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(AttributeValue::Date(date).as_text(), "2024-03-09");
        let list = AttributeValue::List(vec![AttributeValue::text("a"), AttributeValue::Null, AttributeValue::text("b")]);
        assert_eq!(list.as_text(), "a, b");
    }

    #[test]
    fn test_completeness_is_structural() {
        let mut address = BTreeMap::new();
        address.insert("street".to_string(), AttributeValue::text("Main St"));
        address.insert("city".to_string(), AttributeValue::Null);
        let short = AttributeValue::Map(address.clone());
        address.insert("city".to_string(), AttributeValue::text("Springfield"));
        let long = AttributeValue::Map(address);
        assert!(long.completeness() > short.completeness());
    }

    #[test]
    fn test_value_skips_nulls() {
        let record = Record::new("r1", "customer", "crm", Utc::now())
            .with_attribute("name", AttributeValue::text(""))
            .with_attribute("tax_id", AttributeValue::text("123"));
        assert!(record.value("name").is_none());
        assert!(record.value("missing").is_none());
        assert_eq!(record.value("tax_id"), Some(&AttributeValue::text("123")));
    }

    #[test]
    fn test_attribute_value_json_shape() {
        let json = serde_json::to_value(AttributeValue::text("x")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "value": "x"}));
        let back: AttributeValue = serde_json::from_value(serde_json::json!({"type": "null"})).unwrap();
        assert_eq!(back, AttributeValue::Null);
    }
}
