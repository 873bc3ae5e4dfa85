// src/clustering/cluster_builder.rs
//! Turns union-find groups into cluster plans, folding in clusters committed
//! by earlier jobs so that matching stays transitive across runs.

use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::clustering::union_find::ShardedUnionFind;
use crate::models::clusters::MergeCluster;
use crate::models::core::RecordId;

/// One cluster the MERGING phase should commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterPlan {
    pub cluster_id: Uuid,
    pub members: BTreeSet<RecordId>,
    /// Existing clusters folded into `cluster_id`.
    pub absorbed: Vec<Uuid>,
    /// Whether `cluster_id` names a cluster committed earlier.
    pub existing: bool,
}

impl ClusterPlan {
    pub fn smallest_member(&self) -> Option<&RecordId> {
        self.members.iter().next()
    }
}

/// Deterministic id for a cluster that does not extend an existing one.
pub fn new_cluster_id<'a>(entity_type: &str, members: impl IntoIterator<Item = &'a RecordId>) -> Uuid {
    let ids: BTreeSet<&RecordId> = members.into_iter().collect();
    let joined = ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(",");
    let key = format!("cluster|{}|{}", entity_type, joined);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

/// Links the members of every active cluster so previously committed merges
/// take part in this job's connected components.
pub fn seed_existing(union_find: &ShardedUnionFind, clusters: &[MergeCluster]) {
    for cluster in clusters.iter().filter(|c| c.is_active()) {
        let mut members = cluster.members.iter();
        if let Some(first) = members.next() {
            for other in members {
                union_find.union(first, other);
            }
        }
    }
}

/// Builds one plan per connected group. A group touching existing clusters
/// keeps the smallest existing cluster id and absorbs the rest; plans come
/// back ordered by smallest member so a resumed job walks them identically.
pub fn build_plans(entity_type: &str, union_find: &ShardedUnionFind, existing: &[MergeCluster]) -> Vec<ClusterPlan> {
    let mut owner: BTreeMap<&RecordId, Uuid> = BTreeMap::new();
    for cluster in existing.iter().filter(|c| c.is_active()) {
        for member in &cluster.members {
            owner.insert(member, cluster.id);
        }
    }

    let mut plans: Vec<ClusterPlan> = union_find
        .groups()
        .into_iter()
        .map(|members| {
            let touched: BTreeSet<Uuid> = members.iter().filter_map(|m| owner.get(m).copied()).collect();
            let smallest = touched.iter().next().copied();
            match smallest {
                Some(target) => ClusterPlan {
                    cluster_id: target,
                    absorbed: touched.into_iter().filter(|id| *id != target).collect(),
                    existing: true,
                    members,
                },
                None => ClusterPlan {
                    cluster_id: new_cluster_id(entity_type, &members),
                    absorbed: Vec::new(),
                    existing: false,
                    members,
                },
            }
        })
        .collect();

    plans.sort_by(|a, b| a.smallest_member().cmp(&b.smallest_member()));
    debug!(
        "Built {} cluster plans for '{}' ({} extend existing clusters)",
        plans.len(),
        entity_type,
        plans.iter().filter(|p| p.existing).count()
    );
    plans
}
