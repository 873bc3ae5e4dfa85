// src/models/clusters.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::models::core::{AttributeValue, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Finalized,
    /// At least one MANUAL (or failed CUSTOM) attribute is still unresolved.
    PartiallyMerged,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Finalized => "FINALIZED",
            ClusterStatus::PartiallyMerged => "PARTIALLY_MERGED",
        }
    }
}

/// A set of records judged to denote one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCluster {
    pub id: Uuid,
    pub entity_type: String,
    pub members: BTreeSet<RecordId>,
    pub golden_record_id: Uuid,
    pub status: ClusterStatus,
    #[serde(default)]
    pub unresolved_attributes: Vec<String>,
    /// Operator-supplied values for MANUAL attributes.
    #[serde(default)]
    pub manual_values: BTreeMap<String, AttributeValue>,
    /// Set when this cluster was folded into another one by transitive matching.
    #[serde(default)]
    pub absorbed_into: Option<Uuid>,
    /// Set when unmerging left fewer than two members.
    #[serde(default)]
    pub dissolved: bool,
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeCluster {
    pub fn is_active(&self) -> bool {
        self.absorbed_into.is_none() && !self.dissolved
    }

    pub fn golden_id_for(cluster_id: Uuid) -> Uuid {
        Uuid::new_v5(&cluster_id, b"golden-record")
    }
}

/// Which member(s) supplied an attribute's surviving value, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeProvenance {
    pub attribute: String,
    pub strategy: String,
    pub chosen_sources: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The authoritative record produced by merging a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenRecord {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub entity_type: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub provenance: Vec<AttributeProvenance>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Merge,
    ReviewApproved,
    ManualResolution,
    Unmerge,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Merge => "MERGE",
            AuditAction::ReviewApproved => "REVIEW_APPROVED",
            AuditAction::ManualResolution => "MANUAL_RESOLUTION",
            AuditAction::Unmerge => "UNMERGE",
        }
    }
}

/// Structured audit entry emitted for every committed cluster change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub cluster_id: Uuid,
    pub member_ids: Vec<RecordId>,
    pub golden_record_id: Uuid,
    pub job_id: Option<Uuid>,
    pub attributes: Vec<AttributeProvenance>,
    #[serde(default)]
    pub old_values: Option<BTreeMap<String, AttributeValue>>,
    pub new_values: BTreeMap<String, AttributeValue>,
    pub changed_attributes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        cluster: &MergeCluster,
        golden: &GoldenRecord,
        previous: Option<&GoldenRecord>,
        job_id: Option<Uuid>,
    ) -> Self {
        let old_values = previous.map(|p| p.attributes.clone());
        let changed_attributes = changed_attributes(old_values.as_ref(), &golden.attributes);
        Self {
            id: Uuid::new_v4(),
            action,
            cluster_id: cluster.id,
            member_ids: cluster.members.iter().cloned().collect(),
            golden_record_id: golden.id,
            job_id,
            attributes: golden.provenance.clone(),
            old_values,
            new_values: golden.attributes.clone(),
            changed_attributes,
            timestamp: Utc::now(),
        }
    }
}

/// Everything written atomically for one cluster change.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCommit {
    pub cluster: MergeCluster,
    pub golden: GoldenRecord,
    /// Clusters folded into `cluster` by this change.
    pub absorbed: Vec<Uuid>,
    /// Records whose `merged_into` is cleared by this change.
    pub released: Vec<RecordId>,
    pub audit: AuditEntry,
}

fn changed_attributes(
    old: Option<&BTreeMap<String, AttributeValue>>,
    new: &BTreeMap<String, AttributeValue>,
) -> Vec<String> {
    let Some(old) = old else {
        return new.keys().cloned().collect();
    };
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|k| old.get(*k) != new.get(*k))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_attributes_diff() {
        let mut old = BTreeMap::new();
        old.insert("name".to_string(), AttributeValue::text("Acme"));
        old.insert("city".to_string(), AttributeValue::text("Austin"));
        let mut new = old.clone();
        new.insert("city".to_string(), AttributeValue::text("Dallas"));
        new.insert("phone".to_string(), AttributeValue::text("555"));
        assert_eq!(changed_attributes(Some(&old), &new), vec!["city", "phone"]);
        assert_eq!(changed_attributes(None, &new).len(), 3);
    }

    #[test]
    fn test_golden_id_is_stable_per_cluster() {
        let cluster_id = Uuid::new_v4();
        assert_eq!(MergeCluster::golden_id_for(cluster_id), MergeCluster::golden_id_for(cluster_id));
        assert_ne!(MergeCluster::golden_id_for(cluster_id), cluster_id);
    }
}
