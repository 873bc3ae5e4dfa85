// src/clustering/union_find.rs
//! Concurrent union-find keyed by record id.
//!
//! The parent map is split across shards selected by a hash of the record id,
//! so bucket tasks only contend when they touch the same shard. A root is
//! always linked under the smaller of the two root ids; parent pointers
//! therefore only ever decrease and no cycle can form under concurrent unions.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::core::RecordId;

const DEFAULT_SHARDS: usize = 64;

pub struct ShardedUnionFind {
    shards: Vec<Mutex<HashMap<RecordId, RecordId>>>,
}

impl Default for ShardedUnionFind {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl ShardedUnionFind {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: &RecordId) -> MutexGuard<'_, HashMap<RecordId, RecordId>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parent(&self, id: &RecordId) -> RecordId {
        self.shard(id).get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn ensure(&self, id: &RecordId) {
        self.shard(id).entry(id.clone()).or_insert_with(|| id.clone());
    }

    /// Root of `id`'s set. Unknown ids are their own root.
    pub fn find(&self, id: &RecordId) -> RecordId {
        let mut current = id.clone();
        loop {
            let parent = self.parent(&current);
            if parent == current {
                return current;
            }
            let grandparent = self.parent(&parent);
            if grandparent != parent {
                // Path halving: skip one level if nobody relinked `current` meanwhile.
                let mut shard = self.shard(&current);
                if shard.get(&current) == Some(&parent) {
                    shard.insert(current.clone(), grandparent.clone());
                }
            }
            current = grandparent;
        }
    }

    /// Joins the sets of `a` and `b`. Returns false when they were already joined.
    pub fn union(&self, a: &RecordId, b: &RecordId) -> bool {
        self.ensure(a);
        self.ensure(b);
        loop {
            let root_a = self.find(a);
            let root_b = self.find(b);
            if root_a == root_b {
                return false;
            }
            let (small, large) = if root_a < root_b { (root_a, root_b) } else { (root_b, root_a) };

            let mut shard = self.shard(&large);
            // Another task may have relinked `large` since we found it.
            if shard.get(&large) != Some(&large) {
                continue;
            }
            shard.insert(large, small);
            return true;
        }
    }

    pub fn connected(&self, a: &RecordId, b: &RecordId) -> bool {
        a == b || self.find(a) == self.find(b)
    }

    /// All sets with at least two members, each sorted, ordered by smallest member.
    pub fn groups(&self) -> Vec<BTreeSet<RecordId>> {
        let ids: Vec<RecordId> = self
            .shards
            .iter()
            .flat_map(|s| {
                s.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut by_root: BTreeMap<RecordId, BTreeSet<RecordId>> = BTreeMap::new();
        for id in ids {
            let root = self.find(&id);
            by_root.entry(root).or_default().insert(id);
        }
        by_root.into_values().filter(|g| g.len() > 1).collect()
    }
}
