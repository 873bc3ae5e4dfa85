// src/store/memory.rs
//! In-memory store. Every mutation runs inside one write-lock critical
//! section, which is what makes `commit_merge` atomic here.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::job::checkpoint::JobCheckpoint;
use crate::models::clusters::{AuditEntry, GoldenRecord, MergeCluster, MergeCommit};
use crate::models::core::{Record, RecordId};
use crate::models::matching::{MatchEdge, PendingReview, ReviewStatus};
use crate::store::{membership_conflict, ResolutionStore};

#[derive(Default)]
struct State {
    records: BTreeMap<RecordId, Record>,
    clusters: HashMap<Uuid, MergeCluster>,
    /// Active membership only.
    membership: HashMap<RecordId, Uuid>,
    golden_records: HashMap<Uuid, GoldenRecord>,
    reviews: BTreeMap<Uuid, PendingReview>,
    audit: Vec<AuditEntry>,
    checkpoints: HashMap<Uuid, JobCheckpoint>,
    completed_units: HashMap<Uuid, BTreeSet<usize>>,
    edges: HashMap<Uuid, Vec<MatchEdge>>,
}

#[derive(Default)]
pub struct InMemoryResolutionStore {
    state: RwLock<State>,
}

impl InMemoryResolutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_records(records: Vec<Record>) -> Result<Self> {
        let store = Self::new();
        store.upsert_records(&records).await?;
        Ok(store)
    }

    pub async fn audit_count(&self) -> usize {
        self.state.read().await.audit.len()
    }
}

#[async_trait]
impl ResolutionStore for InMemoryResolutionStore {
    async fn load_records(&self, entity_type: &str) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<Record>> {
        Ok(self.state.read().await.records.get(id).cloned())
    }

    async fn upsert_records(&self, records: &[Record]) -> Result<()> {
        let mut state = self.state.write().await;
        for record in records {
            let mut record = record.clone();
            // Merge markers are owned by the engine.
            if let Some(existing) = state.records.get(&record.id) {
                record.merged_into = existing.merged_into;
            }
            state.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn cluster_for_record(&self, id: &RecordId) -> Result<Option<MergeCluster>> {
        let state = self.state.read().await;
        Ok(state
            .membership
            .get(id)
            .and_then(|cluster_id| state.clusters.get(cluster_id))
            .filter(|cluster| cluster.is_active())
            .cloned())
    }

    async fn get_cluster(&self, id: Uuid) -> Result<Option<MergeCluster>> {
        Ok(self.state.read().await.clusters.get(&id).cloned())
    }

    async fn list_clusters(&self, entity_type: &str) -> Result<Vec<MergeCluster>> {
        let state = self.state.read().await;
        let mut clusters: Vec<MergeCluster> = state
            .clusters
            .values()
            .filter(|c| c.entity_type == entity_type && c.is_active())
            .cloned()
            .collect();
        clusters.sort_by_key(|c| c.id);
        Ok(clusters)
    }

    async fn get_golden_record(&self, id: Uuid) -> Result<Option<GoldenRecord>> {
        Ok(self.state.read().await.golden_records.get(&id).cloned())
    }

    async fn commit_merge(&self, commit: &MergeCommit) -> Result<()> {
        let mut state = self.state.write().await;
        let cluster = &commit.cluster;

        // Validate before touching anything so a rejected commit leaves no trace.
        for member in &cluster.members {
            match state.records.get(member) {
                Some(record) if record.entity_type == cluster.entity_type => {}
                Some(record) => bail!(
                    "record {} is '{}', cannot join '{}' cluster {}",
                    member,
                    record.entity_type,
                    cluster.entity_type,
                    cluster.id
                ),
                None => bail!("record {} not found for cluster {}", member, cluster.id),
            }
        }
        let owner_of = |id: &RecordId| {
            state
                .membership
                .get(id)
                .filter(|owner| state.clusters.get(*owner).is_some_and(MergeCluster::is_active))
                .copied()
        };
        if let Some(conflict) = membership_conflict(commit, owner_of) {
            return Err(conflict.into());
        }

        for absorbed_id in &commit.absorbed {
            if let Some(absorbed) = state.clusters.get_mut(absorbed_id) {
                absorbed.absorbed_into = Some(cluster.id);
                absorbed.updated_at = cluster.updated_at;
            }
        }
        for released in &commit.released {
            if let Some(record) = state.records.get_mut(released) {
                record.merged_into = None;
            }
            if state.membership.get(released) == Some(&cluster.id) {
                state.membership.remove(released);
            }
        }
        if cluster.is_active() {
            for member in &cluster.members {
                state.membership.insert(member.clone(), cluster.id);
                if let Some(record) = state.records.get_mut(member) {
                    record.merged_into = Some(commit.golden.id);
                }
            }
        }
        state.clusters.insert(cluster.id, cluster.clone());
        state.golden_records.insert(commit.golden.id, commit.golden.clone());
        state.audit.push(commit.audit.clone());
        Ok(())
    }

    async fn record_bucket_outcome(
        &self,
        job_id: Uuid,
        unit: usize,
        edges: &[MatchEdge],
        reviews: &[PendingReview],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.edges.entry(job_id).or_default().extend(edges.iter().cloned());
        for review in reviews {
            match state.reviews.get(&review.id) {
                Some(existing) if existing.status != ReviewStatus::Pending => {}
                _ => {
                    state.reviews.insert(review.id, review.clone());
                }
            }
        }
        state.completed_units.entry(job_id).or_default().insert(unit);
        Ok(())
    }

    async fn load_match_edges(&self, job_id: Uuid) -> Result<Vec<MatchEdge>> {
        Ok(self.state.read().await.edges.get(&job_id).cloned().unwrap_or_default())
    }

    async fn get_pending_review(&self, id: Uuid) -> Result<Option<PendingReview>> {
        Ok(self.state.read().await.reviews.get(&id).cloned())
    }

    async fn list_pending_reviews(&self, entity_type: &str, status: Option<ReviewStatus>) -> Result<Vec<PendingReview>> {
        let state = self.state.read().await;
        Ok(state
            .reviews
            .values()
            .filter(|r| r.entity_type == entity_type && status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn update_review_status(&self, id: Uuid, status: ReviewStatus) -> Result<()> {
        let mut state = self.state.write().await;
        match state.reviews.get_mut(&id) {
            Some(review) => {
                review.status = status;
                Ok(())
            }
            None => bail!("pending review {} not found", id),
        }
    }

    async fn audit_entries(&self, cluster_id: Option<Uuid>) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| cluster_id.map_or(true, |id| e.cluster_id == id))
            .cloned()
            .collect())
    }

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<JobCheckpoint>> {
        let state = self.state.read().await;
        Ok(state.checkpoints.get(&job_id).cloned().map(|mut checkpoint| {
            checkpoint.completed_blocks = state.completed_units.get(&job_id).cloned().unwrap_or_default();
            checkpoint
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &JobCheckpoint) -> Result<()> {
        let mut state = self.state.write().await;
        state.checkpoints.insert(checkpoint.job_id, checkpoint.clone());
        Ok(())
    }

    async fn clear_job_progress(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        state.edges.remove(&job_id);
        state.completed_units.remove(&job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::checkpoint::JobMode;
    use crate::models::clusters::{AuditAction, ClusterStatus};
    use crate::models::matching::MatchCandidate;
    use crate::store::MembershipConflict;
    use chrono::Utc;

    fn record(id: &str, entity_type: &str) -> Record {
        Record::new(id, entity_type, "crm", Utc::now())
    }

    fn commit_for(members: &[&str], entity_type: &str) -> MergeCommit {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let cluster = MergeCluster {
            id,
            entity_type: entity_type.to_string(),
            members: members.iter().map(|m| RecordId::from(*m)).collect(),
            golden_record_id: MergeCluster::golden_id_for(id),
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
            cluster_id: id,
            entity_type: entity_type.to_string(),
            attributes: BTreeMap::new(),
            provenance: Vec::new(),
            updated_at: now,
        };
        let audit = AuditEntry::new(AuditAction::Merge, &cluster, &golden, None, None);
        MergeCommit {
            cluster,
            golden,
            absorbed: Vec::new(),
            released: Vec::new(),
            audit,
        }
    }

    #[tokio::test]
    async fn test_commit_marks_members() {
        let store = InMemoryResolutionStore::with_records(vec![record("a", "customer"), record("b", "customer")])
            .await
            .unwrap();
        let commit = commit_for(&["a", "b"], "customer");
        store.commit_merge(&commit).await.unwrap();

        let a = store.get_record(&RecordId::from("a")).await.unwrap().unwrap();
        assert_eq!(a.merged_into, Some(commit.golden.id));
        let cluster = store.cluster_for_record(&RecordId::from("b")).await.unwrap().unwrap();
        assert_eq!(cluster.id, commit.cluster.id);
        assert_eq!(store.audit_count().await, 1);
    }

    #[tokio::test]
    async fn test_cross_entity_commit_rejected_without_side_effects() {
        let store = InMemoryResolutionStore::with_records(vec![record("a", "customer"), record("p", "product")])
            .await
            .unwrap();
        let commit = commit_for(&["a", "p"], "customer");
        assert!(store.commit_merge(&commit).await.is_err());
        let a = store.get_record(&RecordId::from("a")).await.unwrap().unwrap();
        assert!(a.merged_into.is_none());
        assert_eq!(store.audit_count().await, 0);
    }

    #[tokio::test]
    async fn test_commit_claiming_foreign_member_rejected() {
        let store = InMemoryResolutionStore::with_records(vec![
            record("a", "customer"),
            record("b", "customer"),
            record("c", "customer"),
        ])
        .await
        .unwrap();
        let first = commit_for(&["a", "b"], "customer");
        store.commit_merge(&first).await.unwrap();

        let second = commit_for(&["b", "c"], "customer");
        let err = store.commit_merge(&second).await.unwrap_err();
        let conflict = err.downcast_ref::<MembershipConflict>().unwrap();
        assert_eq!(conflict.record_id, RecordId::from("b"));
        assert_eq!(conflict.owner, first.cluster.id);

        let b = store.cluster_for_record(&RecordId::from("b")).await.unwrap().unwrap();
        assert_eq!(b.id, first.cluster.id);
        assert!(store.cluster_for_record(&RecordId::from("c")).await.unwrap().is_none());
        assert_eq!(store.audit_count().await, 1);

        let mut absorbing = commit_for(&["a", "b", "c"], "customer");
        absorbing.absorbed = vec![first.cluster.id];
        store.commit_merge(&absorbing).await.unwrap();
        assert_eq!(store.list_clusters("customer").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decided_review_not_overwritten() {
        let store = InMemoryResolutionStore::new();
        let candidate = MatchCandidate {
            record_a: RecordId::from("a"),
            record_b: RecordId::from("b"),
            rule_id: Uuid::new_v4(),
            score: 0.9,
            weight_applied: 1.0,
            breakdown: Vec::new(),
        };
        let job_id = Uuid::new_v4();
        let review = PendingReview::new(job_id, "customer", candidate, None);
        store.record_bucket_outcome(job_id, 0, &[], &[review.clone()]).await.unwrap();
        store.update_review_status(review.id, ReviewStatus::Rejected).await.unwrap();
        store.record_bucket_outcome(job_id, 1, &[], &[review.clone()]).await.unwrap();

        let stored = store.get_pending_review(review.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::Rejected);
    }

    #[tokio::test]
    async fn test_checkpoint_carries_completed_units() {
        let store = InMemoryResolutionStore::new();
        let job_id = Uuid::new_v4();
        store
            .save_checkpoint(&JobCheckpoint::new(job_id, "customer", JobMode::Full, "sig".into()))
            .await
            .unwrap();
        store.record_bucket_outcome(job_id, 4, &[], &[]).await.unwrap();
        let loaded = store.load_checkpoint(job_id).await.unwrap().unwrap();
        assert!(loaded.completed_blocks.contains(&4));

        store.clear_job_progress(job_id).await.unwrap();
        let loaded = store.load_checkpoint(job_id).await.unwrap().unwrap();
        assert!(loaded.completed_blocks.is_empty());
    }
}
