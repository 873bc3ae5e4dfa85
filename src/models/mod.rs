pub mod clusters;
pub mod core;
pub mod matching;
pub mod rules;
pub mod stats_models;

pub use self::clusters::{
    AttributeProvenance, AuditAction, AuditEntry, ClusterStatus, GoldenRecord, MergeCluster,
    MergeCommit,
};
pub use self::core::{AttributeValue, Record, RecordId};
pub use self::matching::{
    Decision, FieldOutcome, FieldScore, MatchCandidate, MatchEdge, PendingReview, ReviewStatus,
};
pub use self::rules::{
    BlockingMode, ComparisonType, EntityResolutionConfig, MatchAlgorithm, MatchField, MatchRule,
    MergeStrategy, NullHandling, OverflowPolicy, ResolutionConfig, StrategyKind, Transform,
};
pub use self::stats_models::{JobStats, ResolutionMetrics};
