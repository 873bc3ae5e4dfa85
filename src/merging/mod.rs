// src/merging/mod.rs
//! Cluster commits: survivorship over the current members, golden record
//! construction and the atomic write through the store.

pub mod aggregate;
pub mod resolver;
pub mod review;

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::clustering::cluster_builder::{new_cluster_id, ClusterPlan};
use crate::error::{ResolutionError, Result};
use crate::merging::resolver::{resolve_cluster, MergeOutcome};
use crate::models::clusters::{AuditAction, AuditEntry, ClusterStatus, GoldenRecord, MergeCluster, MergeCommit};
use crate::models::core::{AttributeValue, Record, RecordId};
use crate::models::rules::EntityResolutionConfig;
use crate::plugins::PluginRegistry;
use crate::store::{MembershipConflict, ResolutionStore};

const MAX_LOCK_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Created(MergeCluster),
    Updated(MergeCluster),
    /// Members and golden values already matched; nothing was written.
    Unchanged(MergeCluster),
}

impl CommitOutcome {
    pub fn cluster(&self) -> &MergeCluster {
        match self {
            CommitOutcome::Created(c) | CommitOutcome::Updated(c) | CommitOutcome::Unchanged(c) => c,
        }
    }

    pub fn is_partial(&self) -> bool {
        !matches!(self, CommitOutcome::Unchanged(_)) && self.cluster().status == ClusterStatus::PartiallyMerged
    }
}

const LOCK_STRIPES: usize = 256;

/// Fixed table of async locks shared by cluster ids and record ids.
/// Keys hash onto stripes; callers get every stripe they need in ascending order.
pub struct CommitLocks {
    stripes: Vec<Arc<AsyncMutex<()>>>,
}

impl Default for CommitLocks {
    fn default() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Arc::new(AsyncMutex::new(()))).collect(),
        }
    }
}

impl CommitLocks {
    fn stripe_of<K: Hash>(&self, key: K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    fn stripes_for<'a>(
        &self,
        clusters: &BTreeSet<Uuid>,
        records: impl IntoIterator<Item = &'a RecordId>,
    ) -> BTreeSet<usize> {
        clusters
            .iter()
            .map(|id| self.stripe_of((0u8, id)))
            .chain(records.into_iter().map(|id| self.stripe_of((1u8, id))))
            .collect()
    }

    pub async fn acquire<'a>(
        &self,
        clusters: &BTreeSet<Uuid>,
        records: impl IntoIterator<Item = &'a RecordId>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let stripes = self.stripes_for(clusters, records);
        let mut guards = Vec::with_capacity(stripes.len());
        for stripe in stripes {
            guards.push(self.stripes[stripe].clone().lock_owned().await);
        }
        guards
    }
}

/// Clusters a member set currently touches, and the id the merged cluster keeps.
struct Footprint {
    target: Uuid,
    /// Active clusters owning any of the members, ascending by id.
    touched: Vec<MergeCluster>,
    /// Stored row for `target`, including an inactive one being revived.
    target_row: Option<MergeCluster>,
}

impl Footprint {
    fn lock_ids(&self) -> BTreeSet<Uuid> {
        self.touched.iter().map(|c| c.id).chain(std::iter::once(self.target)).collect()
    }

    fn members(&self, seed: &BTreeSet<RecordId>) -> BTreeSet<RecordId> {
        let mut members = seed.clone();
        for cluster in &self.touched {
            members.extend(cluster.members.iter().cloned());
        }
        members
    }

    /// Manual values of every touched cluster; the surviving cluster's win.
    fn manual_values(&self) -> BTreeMap<String, AttributeValue> {
        let mut values = BTreeMap::new();
        for cluster in &self.touched {
            for (attribute, value) in &cluster.manual_values {
                values.entry(attribute.clone()).or_insert_with(|| value.clone());
            }
        }
        values
    }
}

pub struct MergeService {
    store: Arc<dyn ResolutionStore>,
    plugins: Arc<PluginRegistry>,
    locks: CommitLocks,
}

impl MergeService {
    pub fn new(store: Arc<dyn ResolutionStore>, plugins: Arc<PluginRegistry>) -> Self {
        Self {
            store,
            plugins,
            locks: CommitLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResolutionStore> {
        &self.store
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Commits one plan produced by the MERGING phase.
    pub async fn commit_plan(&self, config: &EntityResolutionConfig, plan: &ClusterPlan, job_id: Uuid) -> Result<CommitOutcome> {
        let outcome = self
            .commit_members(config, plan.members.clone(), AuditAction::Merge, Some(job_id))
            .await?;
        if outcome.cluster().id != plan.cluster_id {
            debug!(
                "Plan for cluster {} committed as {} after concurrent changes",
                plan.cluster_id,
                outcome.cluster().id
            );
        }
        Ok(outcome)
    }

    /// Merges `members` together with every cluster they already belong to.
    pub async fn commit_members(
        &self,
        config: &EntityResolutionConfig,
        members: BTreeSet<RecordId>,
        action: AuditAction,
        job_id: Option<Uuid>,
    ) -> Result<CommitOutcome> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let planned = self.footprint(&config.entity_type, &members).await?;
            let lock_ids = planned.lock_ids();
            let _guards = self.locks.acquire(&lock_ids, &members).await;

            // Membership may have moved between the read and the lock.
            let current = self.footprint(&config.entity_type, &members).await?;
            let target = current.target;
            if target == planned.target && current.lock_ids().is_subset(&lock_ids) {
                match self.apply(config, &members, current, action, job_id).await {
                    Err(ResolutionError::Persistence(e)) if e.is::<MembershipConflict>() => {
                        debug!("Commit for cluster {} lost a member race: {}", target, e);
                    }
                    result => return result,
                }
            } else {
                debug!("Cluster footprint for {} members changed while locking; retrying", members.len());
            }
            if attempts >= MAX_LOCK_ATTEMPTS {
                return Err(ResolutionError::ClusterContention {
                    cluster_id: target,
                    attempts,
                });
            }
        }
    }

    /// Golden record the member set would produce if merged now. Nothing is persisted.
    pub async fn preview(&self, config: &EntityResolutionConfig, members: &BTreeSet<RecordId>) -> Result<GoldenRecord> {
        let footprint = self.footprint(&config.entity_type, members).await?;
        let all_members = footprint.members(members);
        let records = self.load_members(&config.entity_type, &all_members).await?;
        let outcome = resolve_cluster(config, &records, &footprint.manual_values(), &self.plugins).await?;
        Ok(GoldenRecord {
            id: MergeCluster::golden_id_for(footprint.target),
            cluster_id: footprint.target,
            entity_type: config.entity_type.clone(),
            attributes: outcome.attributes,
            provenance: outcome.provenance,
            updated_at: Utc::now(),
        })
    }

    async fn footprint(&self, entity_type: &str, members: &BTreeSet<RecordId>) -> Result<Footprint> {
        let mut touched: BTreeMap<Uuid, MergeCluster> = BTreeMap::new();
        for member in members {
            if let Some(cluster) = self.store.cluster_for_record(member).await? {
                touched.entry(cluster.id).or_insert(cluster);
            }
        }
        let target = match touched.keys().next() {
            Some(id) => *id,
            None => new_cluster_id(entity_type, members),
        };
        let target_row = match touched.get(&target) {
            Some(cluster) => Some(cluster.clone()),
            None => self.store.get_cluster(target).await?,
        };
        Ok(Footprint {
            target,
            touched: touched.into_values().collect(),
            target_row,
        })
    }

    pub(crate) async fn load_members(&self, entity_type: &str, members: &BTreeSet<RecordId>) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(members.len());
        for id in members {
            let record = self
                .store
                .get_record(id)
                .await?
                .ok_or_else(|| ResolutionError::not_found("record", id))?;
            if record.entity_type != entity_type {
                return Err(ResolutionError::config(
                    entity_type,
                    format!("record {} belongs to entity '{}' and cannot be merged", id, record.entity_type),
                ));
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn apply(
        &self,
        config: &EntityResolutionConfig,
        seed: &BTreeSet<RecordId>,
        footprint: Footprint,
        action: AuditAction,
        job_id: Option<Uuid>,
    ) -> Result<CommitOutcome> {
        let members = footprint.members(seed);
        let records = self.load_members(&config.entity_type, &members).await?;
        let manual_values = footprint.manual_values();
        let outcome = resolve_cluster(config, &records, &manual_values, &self.plugins).await?;

        let absorbed: Vec<Uuid> = footprint
            .touched
            .iter()
            .map(|c| c.id)
            .filter(|id| *id != footprint.target)
            .collect();
        let active_target = footprint.touched.iter().find(|c| c.id == footprint.target);
        let previous = match &footprint.target_row {
            Some(row) => self.store.get_golden_record(row.golden_record_id).await?,
            None => None,
        };

        if let (Some(existing), Some(golden)) = (active_target, previous.as_ref()) {
            if absorbed.is_empty() && existing.members == members && is_unchanged(existing, golden, &outcome) {
                debug!("Cluster {} unchanged; skipping commit", existing.id);
                return Ok(CommitOutcome::Unchanged(existing.clone()));
            }
        }

        let now = Utc::now();
        let cluster = MergeCluster {
            id: footprint.target,
            entity_type: config.entity_type.clone(),
            members,
            golden_record_id: MergeCluster::golden_id_for(footprint.target),
            status: ClusterStatus::Finalized,
            unresolved_attributes: Vec::new(),
            manual_values,
            absorbed_into: None,
            dissolved: false,
            job_id,
            created_at: footprint.target_row.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };
        let existed = active_target.is_some();
        let committed = self
            .write(cluster, outcome, previous, absorbed, Vec::new(), action, job_id)
            .await?;
        Ok(if existed {
            CommitOutcome::Updated(committed)
        } else {
            CommitOutcome::Created(committed)
        })
    }

    /// Re-resolves an existing cluster after an operator change and commits it.
    pub(crate) async fn rebuild(
        &self,
        config: &EntityResolutionConfig,
        mut cluster: MergeCluster,
        released: Vec<RecordId>,
        action: AuditAction,
    ) -> Result<MergeCluster> {
        let records = self.load_members(&config.entity_type, &cluster.members).await?;
        let outcome = resolve_cluster(config, &records, &cluster.manual_values, &self.plugins).await?;
        let previous = self.store.get_golden_record(cluster.golden_record_id).await?;
        cluster.updated_at = Utc::now();
        self.write(cluster, outcome, previous, Vec::new(), released, action, None).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        mut cluster: MergeCluster,
        outcome: MergeOutcome,
        previous: Option<GoldenRecord>,
        absorbed: Vec<Uuid>,
        released: Vec<RecordId>,
        action: AuditAction,
        audit_job_id: Option<Uuid>,
    ) -> Result<MergeCluster> {
        cluster.status = if outcome.unresolved.is_empty() {
            ClusterStatus::Finalized
        } else {
            ClusterStatus::PartiallyMerged
        };
        cluster.unresolved_attributes = outcome.unresolved.clone();

        for warning in &outcome.warnings {
            warn!("Cluster {}: {}", cluster.id, warning);
        }
        if cluster.is_active() && !outcome.unresolved.is_empty() {
            let conflict = ResolutionError::MergeConflict {
                cluster_id: cluster.id,
                attributes: outcome.unresolved.clone(),
            };
            warn!("{}; cluster left PARTIALLY_MERGED", conflict);
        }

        let golden = GoldenRecord {
            id: cluster.golden_record_id,
            cluster_id: cluster.id,
            entity_type: cluster.entity_type.clone(),
            attributes: outcome.attributes,
            provenance: outcome.provenance,
            updated_at: cluster.updated_at,
        };
        let audit = AuditEntry::new(action, &cluster, &golden, previous.as_ref(), audit_job_id);
        let commit = MergeCommit {
            cluster,
            golden,
            absorbed,
            released,
            audit,
        };
        self.store.commit_merge(&commit).await?;

        info!(
            "{} cluster {} ({} members, {} attributes, {} absorbed)",
            commit.audit.action.as_str(),
            commit.cluster.id,
            commit.cluster.members.len(),
            commit.golden.attributes.len(),
            commit.absorbed.len()
        );
        Ok(commit.cluster)
    }
}

fn is_unchanged(cluster: &MergeCluster, golden: &GoldenRecord, outcome: &MergeOutcome) -> bool {
    golden.attributes == outcome.attributes
        && golden.provenance == outcome.provenance
        && cluster.unresolved_attributes == outcome.unresolved
}
