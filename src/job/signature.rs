// src/job/signature.rs
//! Population signatures: a resumed job only reuses progress when the records
//! and configuration it was computed from are unchanged.

use anyhow::{Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::job::checkpoint::JobMode;
use crate::models::core::Record;
use crate::models::rules::EntityResolutionConfig;

/// SHA-256 over the entity configuration, job mode and every record's source
/// data. `merged_into` is engine-written and deliberately left out.
pub fn population_signature(config: &EntityResolutionConfig, mode: &JobMode, records: &[Record]) -> Result<String> {
    let mut hasher = Sha256::new();

    let config_json = serde_json::to_vec(config).context("Failed to serialize configuration for signature")?;
    hasher.update(&config_json);
    let mode_json = serde_json::to_vec(mode).context("Failed to serialize job mode for signature")?;
    hasher.update(&mode_json);

    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    for record in sorted {
        let snapshot = json!({
            "id": record.id,
            "source": record.source,
            "updated_at": record.updated_at.to_rfc3339(),
            "attributes": record.attributes,
        });
        let bytes = serde_json::to_vec(&snapshot)
            .with_context(|| format!("Failed to serialize record {} for signature", record.id))?;
        hasher.update(&bytes);
        hasher.update([0u8]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::AttributeValue;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn records() -> Vec<Record> {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        vec![
            Record::new("b", "customer", "crm", at).with_attribute("name", AttributeValue::text("Acme")),
            Record::new("a", "customer", "erp", at).with_attribute("name", AttributeValue::text("ACME")),
        ]
    }

    #[test]
    fn test_signature_ignores_order_and_merge_markers() {
        let config = EntityResolutionConfig::new("customer");
        let mut reordered = records();
        reordered.reverse();
        reordered[0].merged_into = Some(Uuid::new_v4());
        assert_eq!(
            population_signature(&config, &JobMode::Full, &records()).unwrap(),
            population_signature(&config, &JobMode::Full, &reordered).unwrap()
        );
    }

    #[test]
    fn test_signature_changes_with_data() {
        let config = EntityResolutionConfig::new("customer");
        let mut changed = records();
        changed[0].attributes.insert("name".to_string(), AttributeValue::text("Acme Corp"));
        assert_ne!(
            population_signature(&config, &JobMode::Full, &records()).unwrap(),
            population_signature(&config, &JobMode::Full, &changed).unwrap()
        );
    }
}
