// src/store/mod.rs
//! Persistence seam for records, clusters, golden records, reviews, audit
//! entries and job progress.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::job::checkpoint::JobCheckpoint;
use crate::models::clusters::{AuditEntry, GoldenRecord, MergeCluster, MergeCommit};
use crate::models::core::{Record, RecordId};
use crate::models::matching::{MatchEdge, PendingReview, ReviewStatus};

pub use self::memory::InMemoryResolutionStore;
pub use self::postgres::PostgresResolutionStore;

/// A commit tried to claim a record owned by another active cluster that it
/// does not absorb. Callers re-read the membership and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {record_id} belongs to active cluster {owner}, which cluster {cluster_id} does not absorb")]
pub struct MembershipConflict {
    pub record_id: RecordId,
    pub owner: Uuid,
    pub cluster_id: Uuid,
}

/// First member of `commit` whose current active owner is neither the
/// committed cluster nor one of the clusters it absorbs. `owner_of` returns
/// the active cluster a record belongs to.
pub fn membership_conflict(
    commit: &MergeCommit,
    owner_of: impl Fn(&RecordId) -> Option<Uuid>,
) -> Option<MembershipConflict> {
    let cluster = &commit.cluster;
    if !cluster.is_active() {
        return None;
    }
    cluster.members.iter().find_map(|member| match owner_of(member) {
        Some(owner) if owner != cluster.id && !commit.absorbed.contains(&owner) => Some(MembershipConflict {
            record_id: member.clone(),
            owner,
            cluster_id: cluster.id,
        }),
        _ => None,
    })
}

#[async_trait]
pub trait ResolutionStore: Send + Sync {
    /// All records of one entity type, ordered by id.
    async fn load_records(&self, entity_type: &str) -> Result<Vec<Record>>;

    async fn get_record(&self, id: &RecordId) -> Result<Option<Record>>;

    async fn upsert_records(&self, records: &[Record]) -> Result<()>;

    /// The active cluster a record belongs to, if any.
    async fn cluster_for_record(&self, id: &RecordId) -> Result<Option<MergeCluster>>;

    async fn get_cluster(&self, id: Uuid) -> Result<Option<MergeCluster>>;

    /// Active clusters of one entity type.
    async fn list_clusters(&self, entity_type: &str) -> Result<Vec<MergeCluster>>;

    async fn get_golden_record(&self, id: Uuid) -> Result<Option<GoldenRecord>>;

    /// Applies one cluster change atomically: cluster row, golden record,
    /// absorbed clusters, member markers and the audit entry.
    async fn commit_merge(&self, commit: &MergeCommit) -> Result<()>;

    /// Persists one scoring unit's AUTO_MERGE edges and review candidates and
    /// marks the unit complete for the job. Reviews already decided are left
    /// untouched.
    async fn record_bucket_outcome(
        &self,
        job_id: Uuid,
        unit: usize,
        edges: &[MatchEdge],
        reviews: &[PendingReview],
    ) -> Result<()>;

    async fn load_match_edges(&self, job_id: Uuid) -> Result<Vec<MatchEdge>>;

    async fn get_pending_review(&self, id: Uuid) -> Result<Option<PendingReview>>;

    async fn list_pending_reviews(&self, entity_type: &str, status: Option<ReviewStatus>) -> Result<Vec<PendingReview>>;

    async fn update_review_status(&self, id: Uuid, status: ReviewStatus) -> Result<()>;

    /// Audit entries, oldest first, optionally for one cluster.
    async fn audit_entries(&self, cluster_id: Option<Uuid>) -> Result<Vec<AuditEntry>>;

    /// Checkpoint with its completed units filled in.
    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<JobCheckpoint>>;

    async fn save_checkpoint(&self, checkpoint: &JobCheckpoint) -> Result<()>;

    /// Forgets a job's persisted edges and completed units.
    async fn clear_job_progress(&self, job_id: Uuid) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::clusters::{AuditAction, ClusterStatus};
    use chrono::Utc;
    use std::collections::{BTreeMap, HashMap};

    fn commit(cluster_id: Uuid, members: &[&str], absorbed: Vec<Uuid>) -> MergeCommit {
        let now = Utc::now();
        let cluster = MergeCluster {
            id: cluster_id,
            entity_type: "customer".to_string(),
            members: members.iter().map(|m| RecordId::from(*m)).collect(),
            golden_record_id: MergeCluster::golden_id_for(cluster_id),
            status: ClusterStatus::Finalized,
            unresolved_attributes: Vec::new(),
            manual_values: BTreeMap::new(),
            absorbed_into: None,
            dissolved: false,
            job_id: None,
            created_at: now,
            updated_at: now,
        };
        let golden = GoldenRecord {
            id: cluster.golden_record_id,
            cluster_id,
            entity_type: "customer".to_string(),
            attributes: BTreeMap::new(),
            provenance: Vec::new(),
            updated_at: now,
        };
        let audit = AuditEntry::new(AuditAction::Merge, &cluster, &golden, None, None);
        MergeCommit {
            cluster,
            golden,
            absorbed,
            released: Vec::new(),
            audit,
        }
    }

    #[test]
    fn test_foreign_owner_is_a_conflict() {
        let (target, other) = (Uuid::new_v4(), Uuid::new_v4());
        let owners: HashMap<RecordId, Uuid> = [(RecordId::from("b"), other)].into_iter().collect();
        let conflict = membership_conflict(&commit(target, &["a", "b"], Vec::new()), |id| owners.get(id).copied());
        assert_eq!(
            conflict,
            Some(MembershipConflict {
                record_id: RecordId::from("b"),
                owner: other,
                cluster_id: target,
            })
        );
    }

    #[test]
    fn test_own_and_absorbed_owners_are_allowed() {
        let (target, absorbed) = (Uuid::new_v4(), Uuid::new_v4());
        let owners: HashMap<RecordId, Uuid> = [(RecordId::from("a"), target), (RecordId::from("b"), absorbed)]
            .into_iter()
            .collect();
        let commit = commit(target, &["a", "b", "c"], vec![absorbed]);
        assert_eq!(membership_conflict(&commit, |id| owners.get(id).copied()), None);
    }

    #[test]
    fn test_inactive_commit_never_conflicts() {
        let (target, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut dissolved = commit(target, &["a"], Vec::new());
        dissolved.cluster.dissolved = true;
        assert_eq!(membership_conflict(&dissolved, |_| Some(other)), None);
    }
}
