// tests/resolution_job.rs
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use resolution_lib::models::core::{AttributeValue, Record, RecordId};
use resolution_lib::models::matching::ReviewStatus;
use resolution_lib::models::rules::{
    ComparisonType, EntityResolutionConfig, MatchAlgorithm, MatchField, MatchRule, MergeStrategy, ResolutionConfig,
    StrategyKind,
};
use resolution_lib::utils::engine_config::EngineConfig;
use resolution_lib::{
    CancelFlag, CustomMergeFunction, ExternalScorer, InMemoryResolutionStore, JobMode, JobState, ResolutionEngine, ResolutionError,
    ResolutionStore,
};
use uuid::Uuid;

/// Scores name pairs from a fixed table; unknown pairs score zero.
struct TableScorer {
    scores: HashMap<(String, String), f64>,
}

impl TableScorer {
    fn new(entries: &[(&str, &str, f64)]) -> Self {
        let scores = entries
            .iter()
            .map(|(a, b, s)| (Self::key(a, b), *s))
            .collect();
        Self { scores }
    }

    fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }
}

#[async_trait]
impl ExternalScorer for TableScorer {
    async fn score(&self, _attribute: &str, a: &AttributeValue, b: &AttributeValue) -> anyhow::Result<f64> {
        let key = Self::key(&a.as_text(), &b.as_text());
        Ok(self.scores.get(&key).copied().unwrap_or(0.0))
    }
}

fn record(id: &str, entity_type: &str, name: &str, tax_id: &str, day: u32) -> Record {
    Record::new(id, entity_type, "crm", Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())
        .with_attribute("region", AttributeValue::text("north"))
        .with_attribute("name", AttributeValue::text(name))
        .with_attribute("tax_id", AttributeValue::text(tax_id))
}

fn name_rule(entity_type: &str) -> MatchRule {
    let mut rule = MatchRule::new(entity_type, "name-model")
        .with_algorithm(MatchAlgorithm::Ml)
        .with_thresholds(0.80, 0.95)
        .with_blocking_fields(&["region"])
        .with_field(MatchField::new("name", ComparisonType::Fuzzy, 1.0));
    rule.ml_scorer = Some("table".to_string());
    rule
}

fn tax_rule(entity_type: &str) -> MatchRule {
    let mut rule = MatchRule::new(entity_type, "tax-and-name")
        .with_algorithm(MatchAlgorithm::Ml)
        .with_thresholds(0.80, 0.95)
        .with_blocking_fields(&["region"])
        .with_field(MatchField::new("tax_id", ComparisonType::Exact, 0.6))
        .with_field(MatchField::new("name", ComparisonType::Fuzzy, 0.4));
    rule.ml_scorer = Some("table".to_string());
    rule
}

async fn engine(records: Vec<Record>, scorer: TableScorer) -> (ResolutionEngine, Arc<InMemoryResolutionStore>) {
    let store = Arc::new(InMemoryResolutionStore::with_records(records).await.unwrap());
    let engine_config = EngineConfig {
        max_concurrent_buckets: 2,
        ..EngineConfig::default()
    };
    let mut plugins = ResolutionEngine::plugin_registry(&engine_config);
    plugins.register_scorer("table", Arc::new(scorer));
    (ResolutionEngine::new(store.clone(), plugins, engine_config), store)
}

fn ids(ids: &[&str]) -> BTreeSet<RecordId> {
    ids.iter().map(|id| RecordId::from(*id)).collect()
}

fn chain_scorer() -> TableScorer {
    TableScorer::new(&[("Acme", "Acme Inc", 0.97), ("Acme Inc", "Acme Inc.", 0.96), ("Acme", "Acme Inc.", 0.40)])
}

fn chain_records() -> Vec<Record> {
    vec![
        record("a", "customer", "Acme", "111", 1),
        record("b", "customer", "Acme Inc", "222", 2),
        record("c", "customer", "Acme Inc.", "333", 3),
        record("d", "customer", "Globex", "444", 4),
    ]
}

#[tokio::test]
async fn test_auto_merge_is_transitive() {
    let (engine, store) = engine(chain_records(), chain_scorer()).await;
    let config = EntityResolutionConfig::new("customer").with_rule(name_rule("customer"));

    let report = engine
        .run_job(&config, Uuid::new_v4(), JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.stats.auto_merge_pairs, 2);
    assert_eq!(report.stats.clusters_formed, 1);

    let clusters = store.list_clusters("customer").await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].members, ids(&["a", "b", "c"]));

    let golden = store.get_golden_record(clusters[0].golden_record_id).await.unwrap().unwrap();
    assert_eq!(golden.attributes["name"], AttributeValue::text("Acme Inc."));
    assert!(store.cluster_for_record(&RecordId::from("d")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rerun_on_same_population_changes_nothing() {
    let (engine, store) = engine(chain_records(), chain_scorer()).await;
    let config = EntityResolutionConfig::new("customer").with_rule(name_rule("customer"));

    engine
        .run_job(&config, Uuid::new_v4(), JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();
    let first = store.list_clusters("customer").await.unwrap();
    let audit_before = store.audit_count().await;

    let second = engine
        .run_job(&config, Uuid::new_v4(), JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(second.stats.clusters_formed, 0);
    assert_eq!(second.stats.clusters_unchanged, 1);

    let after = store.list_clusters("customer").await.unwrap();
    assert_eq!(first.len(), after.len());
    assert_eq!(first[0].id, after[0].id);
    assert_eq!(first[0].golden_record_id, after[0].golden_record_id);
    assert_eq!(store.audit_count().await, audit_before);
}

#[tokio::test]
async fn test_completed_job_id_returns_stored_report() {
    let (engine, _store) = engine(chain_records(), chain_scorer()).await;
    let config = EntityResolutionConfig::new("customer").with_rule(name_rule("customer"));
    let job_id = Uuid::new_v4();

    let first = engine.run_job(&config, job_id, JobMode::Full, &CancelFlag::new()).await.unwrap();
    let again = engine.run_job(&config, job_id, JobMode::Full, &CancelFlag::new()).await.unwrap();
    assert!(again.resumed);
    assert_eq!(again.state, JobState::Completed);
    assert_eq!(again.stats.clusters_formed, first.stats.clusters_formed);
}

#[tokio::test]
async fn test_merge_is_reversible() {
    let (engine, store) = engine(chain_records(), chain_scorer()).await;
    let config = EntityResolutionConfig::new("customer").with_rule(name_rule("customer"));
    engine
        .run_job(&config, Uuid::new_v4(), JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();

    let cluster = store.cluster_for_record(&RecordId::from("c")).await.unwrap().unwrap();
    let c = store.get_record(&RecordId::from("c")).await.unwrap().unwrap();
    assert_eq!(c.merged_into, Some(cluster.golden_record_id));

    let remaining = engine.merger().unmerge_record(&config, &RecordId::from("c")).await.unwrap();
    assert_eq!(remaining.members, ids(&["a", "b"]));
    let c = store.get_record(&RecordId::from("c")).await.unwrap().unwrap();
    assert!(c.merged_into.is_none());
    assert_eq!(c.attributes["name"], AttributeValue::text("Acme Inc."));

    let unmerged = engine.unmerged_records("customer").await.unwrap();
    assert_eq!(unmerged, vec![RecordId::from("c"), RecordId::from("d")]);
}

#[tokio::test]
async fn test_weighted_score_in_review_band_creates_pending_review() {
    let records = vec![
        record("a", "supplier", "Acme Corp", "12-345", 1),
        record("b", "supplier", "ACME Corporation", "12-345", 2),
    ];
    let scorer = TableScorer::new(&[("Acme Corp", "ACME Corporation", 0.8)]);
    let (engine, store) = engine(records, scorer).await;
    let config = EntityResolutionConfig::new("supplier").with_rule(tax_rule("supplier"));

    let report = engine
        .run_job(&config, Uuid::new_v4(), JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.stats.pending_reviews, 1);
    assert_eq!(report.stats.auto_merge_pairs, 0);
    assert!(store.list_clusters("supplier").await.unwrap().is_empty());

    let reviews = store
        .list_pending_reviews("supplier", Some(ReviewStatus::Pending))
        .await
        .unwrap();
    assert_eq!(reviews.len(), 1);
    assert!((reviews[0].candidate.score - 0.92).abs() < 1e-9);
    assert!(reviews[0].preview.is_some());

    let outcome = engine.merger().approve_review(&config, reviews[0].id).await.unwrap();
    assert_eq!(outcome.cluster().members, ids(&["a", "b"]));
    let review = store.get_pending_review(reviews[0].id).await.unwrap().unwrap();
    assert_eq!(review.status, ReviewStatus::Approved);
}

#[tokio::test]
async fn test_cancelled_job_resumes_to_completion() {
    let (engine, store) = engine(chain_records(), chain_scorer()).await;
    let config = EntityResolutionConfig::new("customer").with_rule(name_rule("customer"));
    let job_id = Uuid::new_v4();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = engine.run_job(&config, job_id, JobMode::Full, &cancel).await.unwrap_err();
    assert!(matches!(err, ResolutionError::Cancelled { .. }));
    let checkpoint = store.load_checkpoint(job_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.state, JobState::Scoring);
    assert!(store.list_clusters("customer").await.unwrap().is_empty());

    let report = engine
        .run_job(&config, job_id, JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();
    assert!(report.resumed);
    assert_eq!(report.state, JobState::Completed);
    let clusters = store.list_clusters("customer").await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].members, ids(&["a", "b", "c"]));
}

/// Longest name; raises the cancel flag on every call.
struct CancellingLongestName {
    cancel: CancelFlag,
}

#[async_trait]
impl CustomMergeFunction for CancellingLongestName {
    async fn resolve(&self, attribute: &str, members: &[Record]) -> anyhow::Result<Option<AttributeValue>> {
        self.cancel.cancel();
        Ok(members
            .iter()
            .filter_map(|m| m.value(attribute))
            .max_by_key(|v| v.as_text().len())
            .cloned())
    }
}

async fn two_cluster_engine(cancel: CancelFlag) -> (ResolutionEngine, Arc<InMemoryResolutionStore>, EntityResolutionConfig) {
    let records = vec![
        record("a", "customer", "Acme", "111", 1),
        record("b", "customer", "Acme Inc", "222", 2),
        record("c", "customer", "Globex", "333", 3),
        record("d", "customer", "Globex Corp", "444", 4),
    ];
    let scorer = TableScorer::new(&[("Acme", "Acme Inc", 0.97), ("Globex", "Globex Corp", 0.97)]);
    let store = Arc::new(InMemoryResolutionStore::with_records(records).await.unwrap());
    let engine_config = EngineConfig::default();
    let mut plugins = ResolutionEngine::plugin_registry(&engine_config);
    plugins.register_scorer("table", Arc::new(scorer));
    plugins.register_custom_function("longest_name", Arc::new(CancellingLongestName { cancel }));
    let config = EntityResolutionConfig::new("customer")
        .with_rule(name_rule("customer"))
        .with_strategy(MergeStrategy::new(
            "name",
            StrategyKind::Custom {
                custom_function: "longest_name".to_string(),
            },
        ));
    (ResolutionEngine::new(store.clone(), plugins, engine_config), store, config)
}

#[tokio::test]
async fn test_job_cancelled_during_merging_resumes_after_last_committed_plan() {
    let (baseline, baseline_store, config) = two_cluster_engine(CancelFlag::new()).await;
    baseline
        .run_job(&config, Uuid::new_v4(), JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();
    let expected_audit = baseline_store.audit_count().await;
    assert_eq!(expected_audit, 2);

    // The first committed plan raises the flag, so the second is never reached.
    let cancel = CancelFlag::new();
    let (engine, store, config) = two_cluster_engine(cancel.clone()).await;
    let job_id = Uuid::new_v4();
    let err = engine.run_job(&config, job_id, JobMode::Full, &cancel).await.unwrap_err();
    assert!(matches!(err, ResolutionError::Cancelled { .. }));
    let checkpoint = store.load_checkpoint(job_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.state, JobState::Merging);
    assert_eq!(checkpoint.last_processed_cluster, Some(0));
    let clusters = store.list_clusters("customer").await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].members, ids(&["a", "b"]));
    assert_eq!(store.audit_count().await, 1);

    let report = engine
        .run_job(&config, job_id, JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();
    assert!(report.resumed);
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.stats.clusters_formed, 1);
    assert_eq!(report.stats.clusters_unchanged, 0);

    let clusters = store.list_clusters("customer").await.unwrap();
    assert_eq!(clusters.len(), 2);
    let members: Vec<BTreeSet<RecordId>> = clusters.iter().map(|c| c.members.clone()).collect();
    assert!(members.contains(&ids(&["a", "b"])));
    assert!(members.contains(&ids(&["c", "d"])));
    assert_eq!(store.audit_count().await, expected_audit);
}

#[tokio::test]
async fn test_incremental_job_attaches_new_record() {
    let (engine, store) = engine(chain_records(), chain_scorer()).await;
    let config = EntityResolutionConfig::new("customer").with_rule(name_rule("customer"));
    engine
        .run_job(&config, Uuid::new_v4(), JobMode::Full, &CancelFlag::new())
        .await
        .unwrap();

    store
        .upsert_records(&[record("e", "customer", "Acme Inc", "555", 5)])
        .await
        .unwrap();
    let report = engine
        .run_job(
            &config,
            Uuid::new_v4(),
            JobMode::Incremental { changed: ids(&["e"]) },
            &CancelFlag::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.mode, "incremental");
    assert_eq!(report.stats.clusters_updated, 1);

    let clusters = store.list_clusters("customer").await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].members, ids(&["a", "b", "c", "e"]));
}

#[tokio::test]
async fn test_invalid_entity_config_does_not_block_others() {
    let mut records = chain_records();
    records.push(record("s1", "supplier", "Initech", "9", 1));
    let (engine, store) = engine(records, chain_scorer()).await;

    let broken = EntityResolutionConfig::new("supplier")
        .with_rule(name_rule("supplier").with_thresholds(0.90, 0.85));
    let config = ResolutionConfig {
        entities: vec![
            broken,
            EntityResolutionConfig::new("customer").with_rule(name_rule("customer")),
        ],
    };

    let summary = engine.run_all(&config, &CancelFlag::new()).await;
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].0, "supplier");
    assert!(summary.failures[0].1.is_configuration());
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].entity_type, "customer");
    assert_eq!(store.list_clusters("customer").await.unwrap().len(), 1);
}
