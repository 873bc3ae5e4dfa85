// src/merging/review.rs
//! Operator actions on reviews and committed clusters.

use log::info;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{ResolutionError, Result};
use crate::merging::{CommitOutcome, MergeService};
use crate::models::clusters::{AuditAction, MergeCluster};
use crate::models::core::{AttributeValue, RecordId};
use crate::models::matching::ReviewStatus;
use crate::models::rules::{EntityResolutionConfig, StrategyKind};

const MAX_UNMERGE_ATTEMPTS: usize = 8;

impl MergeService {
    /// Approves a PENDING_REVIEW pair: both records join one cluster together
    /// with whatever clusters they already belong to.
    pub async fn approve_review(&self, config: &EntityResolutionConfig, review_id: Uuid) -> Result<CommitOutcome> {
        let review = self
            .store()
            .get_pending_review(review_id)
            .await?
            .ok_or_else(|| ResolutionError::not_found("pending review", review_id))?;
        if review.entity_type != config.entity_type {
            return Err(ResolutionError::config(
                &config.entity_type,
                format!("review {} belongs to entity '{}'", review_id, review.entity_type),
            ));
        }
        match review.status {
            ReviewStatus::Pending | ReviewStatus::Approved => {}
            other => {
                return Err(ResolutionError::ReviewClosed {
                    review_id,
                    status: other.as_str(),
                })
            }
        }

        let members: BTreeSet<RecordId> = [review.candidate.record_a.clone(), review.candidate.record_b.clone()]
            .into_iter()
            .collect();
        let outcome = self
            .commit_members(config, members, AuditAction::ReviewApproved, Some(review.job_id))
            .await?;
        self.store().update_review_status(review_id, ReviewStatus::Approved).await?;
        info!("Review {} approved into cluster {}", review_id, outcome.cluster().id);
        Ok(outcome)
    }

    pub async fn reject_review(&self, review_id: Uuid) -> Result<()> {
        let review = self
            .store()
            .get_pending_review(review_id)
            .await?
            .ok_or_else(|| ResolutionError::not_found("pending review", review_id))?;
        match review.status {
            ReviewStatus::Pending => {
                self.store().update_review_status(review_id, ReviewStatus::Rejected).await?;
                info!("Review {} rejected", review_id);
                Ok(())
            }
            ReviewStatus::Rejected => Ok(()),
            other => Err(ResolutionError::ReviewClosed {
                review_id,
                status: other.as_str(),
            }),
        }
    }

    /// Supplies the value of a MANUAL attribute and re-resolves the cluster.
    pub async fn resolve_manual_attribute(
        &self,
        config: &EntityResolutionConfig,
        cluster_id: Uuid,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<MergeCluster> {
        if !matches!(config.strategy_for(attribute), StrategyKind::Manual) {
            return Err(ResolutionError::config(
                &config.entity_type,
                format!("attribute '{}' is not configured for MANUAL resolution", attribute),
            ));
        }

        let _guards = self.locks.acquire(&BTreeSet::from([cluster_id]), std::iter::empty()).await;
        let mut cluster = self
            .store()
            .get_cluster(cluster_id)
            .await?
            .filter(MergeCluster::is_active)
            .ok_or_else(|| ResolutionError::not_found("active cluster", cluster_id))?;
        cluster.manual_values.insert(attribute.to_string(), value);
        self.rebuild(config, cluster, Vec::new(), AuditAction::ManualResolution).await
    }

    /// Revokes one record's membership. A cluster left with fewer than two
    /// members is dissolved and its remaining member released as well.
    /// Superseded reviews of released records become pending again.
    pub async fn unmerge_record(&self, config: &EntityResolutionConfig, record_id: &RecordId) -> Result<MergeCluster> {
        for _ in 0..MAX_UNMERGE_ATTEMPTS {
            let planned = self
                .store()
                .cluster_for_record(record_id)
                .await?
                .ok_or_else(|| ResolutionError::not_found("cluster membership", record_id))?;
            let _guards = self.locks.acquire(&BTreeSet::from([planned.id]), &planned.members).await;

            let Some(mut cluster) = self.store().cluster_for_record(record_id).await? else {
                return Err(ResolutionError::not_found("cluster membership", record_id));
            };
            if cluster.id != planned.id {
                continue;
            }
            if cluster.entity_type != config.entity_type {
                return Err(ResolutionError::config(
                    &config.entity_type,
                    format!("cluster {} belongs to entity '{}'", cluster.id, cluster.entity_type),
                ));
            }

            cluster.members.remove(record_id);
            let released: Vec<RecordId> = if cluster.members.len() < 2 {
                cluster.dissolved = true;
                std::iter::once(record_id.clone())
                    .chain(cluster.members.iter().cloned())
                    .collect()
            } else {
                vec![record_id.clone()]
            };
            info!(
                "Unmerging {} from cluster {}{}",
                record_id,
                cluster.id,
                if cluster.dissolved { " (cluster dissolved)" } else { "" }
            );
            let cluster = self.rebuild(config, cluster, released.clone(), AuditAction::Unmerge).await?;
            self.reopen_superseded(&config.entity_type, &released).await?;
            return Ok(cluster);
        }
        Err(ResolutionError::not_found("stable cluster membership", record_id))
    }

    async fn reopen_superseded(&self, entity_type: &str, released: &[RecordId]) -> Result<usize> {
        let reviews = self
            .store()
            .list_pending_reviews(entity_type, Some(ReviewStatus::Superseded))
            .await?;
        let mut reopened = 0;
        for review in reviews {
            let (a, b) = (&review.candidate.record_a, &review.candidate.record_b);
            if !released.contains(a) && !released.contains(b) {
                continue;
            }
            let cluster_a = self.store().cluster_for_record(a).await?.map(|c| c.id);
            let cluster_b = self.store().cluster_for_record(b).await?.map(|c| c.id);
            if cluster_a.is_some() && cluster_a == cluster_b {
                continue;
            }
            self.store().update_review_status(review.id, ReviewStatus::Pending).await?;
            reopened += 1;
        }
        if reopened > 0 {
            info!("Re-opened {} superseded reviews for '{}'", reopened, entity_type);
        }
        Ok(reopened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::Record;
    use crate::models::matching::{MatchCandidate, PendingReview};
    use crate::models::rules::MergeStrategy;
    use crate::plugins::testing::SlowLongestText;
    use crate::plugins::PluginRegistry;
    use crate::store::{InMemoryResolutionStore, ResolutionStore};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(id: &str) -> Record {
        Record::new(id, "customer", "crm", Utc::now()).with_attribute("name", AttributeValue::text(id))
    }

    async fn setup(ids: &[&str]) -> (MergeService, Arc<InMemoryResolutionStore>) {
        let store = Arc::new(
            InMemoryResolutionStore::with_records(ids.iter().map(|id| record(id)).collect())
                .await
                .unwrap(),
        );
        let service = MergeService::new(store.clone(), Arc::new(PluginRegistry::new(Duration::from_millis(200))));
        (service, store)
    }

    fn members(ids: &[&str]) -> BTreeSet<RecordId> {
        ids.iter().map(|id| RecordId::from(*id)).collect()
    }

    async fn pending(store: &InMemoryResolutionStore, a: &str, b: &str) -> PendingReview {
        let candidate = MatchCandidate {
            record_a: RecordId::from(a),
            record_b: RecordId::from(b),
            rule_id: Uuid::new_v4(),
            score: 0.9,
            weight_applied: 1.0,
            breakdown: Vec::new(),
        };
        let job_id = Uuid::new_v4();
        let review = PendingReview::new(job_id, "customer", candidate, None);
        store.record_bucket_outcome(job_id, 0, &[], &[review.clone()]).await.unwrap();
        review
    }

    #[tokio::test]
    async fn test_approve_review_merges_pair() {
        let (service, store) = setup(&["a", "b"]).await;
        let config = EntityResolutionConfig::new("customer");
        let review = pending(&store, "a", "b").await;

        let outcome = service.approve_review(&config, review.id).await.unwrap();
        assert_eq!(outcome.cluster().members, members(&["a", "b"]));
        let stored = store.get_pending_review(review.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::Approved);
        let audit = store.audit_entries(Some(outcome.cluster().id)).await.unwrap();
        assert_eq!(audit[0].action, AuditAction::ReviewApproved);
    }

    #[tokio::test]
    async fn test_rejected_review_cannot_be_approved() {
        let (service, store) = setup(&["a", "b"]).await;
        let config = EntityResolutionConfig::new("customer");
        let review = pending(&store, "a", "b").await;

        service.reject_review(review.id).await.unwrap();
        let err = service.approve_review(&config, review.id).await.unwrap_err();
        assert!(matches!(err, ResolutionError::ReviewClosed { .. }));
        assert!(store.cluster_for_record(&RecordId::from("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_resolution_finalizes_cluster() {
        let (service, _store) = setup(&["a", "b"]).await;
        let config = EntityResolutionConfig::new("customer").with_strategy(MergeStrategy::new("name", StrategyKind::Manual));
        let outcome = service
            .commit_members(&config, members(&["a", "b"]), AuditAction::Merge, None)
            .await
            .unwrap();
        assert!(outcome.is_partial());

        let cluster = service
            .resolve_manual_attribute(&config, outcome.cluster().id, "name", AttributeValue::text("Acme Holdings"))
            .await
            .unwrap();
        assert!(cluster.unresolved_attributes.is_empty());
        let golden = service
            .store()
            .get_golden_record(cluster.golden_record_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(golden.attributes["name"], AttributeValue::text("Acme Holdings"));
    }

    #[tokio::test]
    async fn test_manual_value_rejected_for_other_strategies() {
        let (service, _store) = setup(&["a", "b"]).await;
        let config = EntityResolutionConfig::new("customer");
        let err = service
            .resolve_manual_attribute(&config, Uuid::new_v4(), "name", AttributeValue::text("x"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_unmerge_keeps_cluster_with_two_left() {
        let (service, store) = setup(&["a", "b", "c"]).await;
        let config = EntityResolutionConfig::new("customer");
        service
            .commit_members(&config, members(&["a", "b", "c"]), AuditAction::Merge, None)
            .await
            .unwrap();

        let cluster = service.unmerge_record(&config, &RecordId::from("c")).await.unwrap();
        assert!(cluster.is_active());
        assert_eq!(cluster.members, members(&["a", "b"]));
        let c = store.get_record(&RecordId::from("c")).await.unwrap().unwrap();
        assert!(c.merged_into.is_none());
        let a = store.get_record(&RecordId::from("a")).await.unwrap().unwrap();
        assert_eq!(a.merged_into, Some(cluster.golden_record_id));
    }

    #[tokio::test]
    async fn test_unmerge_dissolves_pair() {
        let (service, store) = setup(&["a", "b"]).await;
        let config = EntityResolutionConfig::new("customer");
        service
            .commit_members(&config, members(&["a", "b"]), AuditAction::Merge, None)
            .await
            .unwrap();

        let cluster = service.unmerge_record(&config, &RecordId::from("a")).await.unwrap();
        assert!(cluster.dissolved);
        for id in ["a", "b"] {
            let record = store.get_record(&RecordId::from(id)).await.unwrap().unwrap();
            assert!(record.merged_into.is_none());
            assert!(store.cluster_for_record(&RecordId::from(id)).await.unwrap().is_none());
        }
        assert!(store.list_clusters("customer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unmerge_reopens_superseded_reviews() {
        let (service, store) = setup(&["a", "b", "c"]).await;
        let config = EntityResolutionConfig::new("customer");
        let kept = pending(&store, "a", "b").await;
        let released = pending(&store, "a", "c").await;
        for review in [&kept, &released] {
            store.update_review_status(review.id, ReviewStatus::Superseded).await.unwrap();
        }
        service
            .commit_members(&config, members(&["a", "b", "c"]), AuditAction::Merge, None)
            .await
            .unwrap();

        service.unmerge_record(&config, &RecordId::from("c")).await.unwrap();
        let kept = store.get_pending_review(kept.id).await.unwrap().unwrap();
        assert_eq!(kept.status, ReviewStatus::Superseded);
        let released = store.get_pending_review(released.id).await.unwrap().unwrap();
        assert_eq!(released.status, ReviewStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_sharing_a_record_form_one_cluster() {
        let store = Arc::new(
            InMemoryResolutionStore::with_records(["a", "b", "c"].iter().map(|id| record(id)).collect())
                .await
                .unwrap(),
        );
        let mut plugins = PluginRegistry::new(Duration::from_secs(2));
        plugins.register_custom_function("slow_longest", Arc::new(SlowLongestText(Duration::from_millis(100))));
        let service = MergeService::new(store.clone(), Arc::new(plugins));
        let config = EntityResolutionConfig::new("customer").with_strategy(MergeStrategy::new(
            "name",
            StrategyKind::Custom {
                custom_function: "slow_longest".to_string(),
            },
        ));
        let first = pending(&store, "a", "b").await;
        let second = pending(&store, "b", "c").await;

        let (left, right) = tokio::join!(
            service.approve_review(&config, first.id),
            service.approve_review(&config, second.id)
        );
        left.unwrap();
        right.unwrap();

        let clusters = store.list_clusters("customer").await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, members(&["a", "b", "c"]));
        for id in ["a", "b", "c"] {
            let owner = store.cluster_for_record(&RecordId::from(id)).await.unwrap().map(|c| c.id);
            assert_eq!(owner, Some(clusters[0].id));
        }
    }
}
