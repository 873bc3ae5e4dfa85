pub mod cluster_builder;
pub mod union_find;

pub use self::cluster_builder::{build_plans, new_cluster_id, seed_existing, ClusterPlan};
pub use self::union_find::ShardedUnionFind;
