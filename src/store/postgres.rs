// src/store/postgres.rs
//! PostgreSQL store on a bb8 pool. Cluster commits run in one transaction.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use postgres_types::ToSql;
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::job::checkpoint::JobCheckpoint;
use crate::models::clusters::{AuditEntry, GoldenRecord, MergeCluster, MergeCommit};
use crate::models::core::{AttributeValue, Record, RecordId};
use crate::models::matching::{MatchEdge, PendingReview, ReviewStatus};
use crate::store::{membership_conflict, ResolutionStore};
use crate::utils::db_connect::PgPool;
use crate::utils::source_filter::SourceFilterConfig;

const SCHEMA_SQL: &str = "
    CREATE SCHEMA IF NOT EXISTS entity_resolution;

    CREATE TABLE IF NOT EXISTS entity_resolution.record (
        id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        source TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        attributes JSONB NOT NULL DEFAULT '{}'::jsonb,
        merged_into UUID NULL
    );
    CREATE INDEX IF NOT EXISTS idx_record_entity_type ON entity_resolution.record (entity_type);

    CREATE TABLE IF NOT EXISTS entity_resolution.merge_cluster (
        id UUID PRIMARY KEY,
        entity_type TEXT NOT NULL,
        is_active BOOLEAN NOT NULL,
        data JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_merge_cluster_entity ON entity_resolution.merge_cluster (entity_type, is_active);

    CREATE TABLE IF NOT EXISTS entity_resolution.cluster_member (
        record_id TEXT PRIMARY KEY REFERENCES entity_resolution.record (id),
        cluster_id UUID NOT NULL REFERENCES entity_resolution.merge_cluster (id)
    );

    CREATE TABLE IF NOT EXISTS entity_resolution.golden_record (
        id UUID PRIMARY KEY,
        cluster_id UUID NOT NULL,
        entity_type TEXT NOT NULL,
        data JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    );

    CREATE TABLE IF NOT EXISTS entity_resolution.pending_review (
        id UUID PRIMARY KEY,
        job_id UUID NOT NULL,
        entity_type TEXT NOT NULL,
        status TEXT NOT NULL,
        score DOUBLE PRECISION NOT NULL,
        data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_review_entity ON entity_resolution.pending_review (entity_type, status);

    CREATE TABLE IF NOT EXISTS entity_resolution.audit_log (
        id UUID PRIMARY KEY,
        action TEXT NOT NULL,
        cluster_id UUID NOT NULL,
        golden_record_id UUID NOT NULL,
        job_id UUID NULL,
        entry JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audit_log_cluster ON entity_resolution.audit_log (cluster_id, created_at);

    CREATE TABLE IF NOT EXISTS entity_resolution.job_checkpoint (
        job_id UUID PRIMARY KEY,
        entity_type TEXT NOT NULL,
        state TEXT NOT NULL,
        checkpoint JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    );

    CREATE TABLE IF NOT EXISTS entity_resolution.job_unit (
        job_id UUID NOT NULL,
        unit BIGINT NOT NULL,
        PRIMARY KEY (job_id, unit)
    );

    CREATE TABLE IF NOT EXISTS entity_resolution.match_edge (
        job_id UUID NOT NULL,
        record_a TEXT NOT NULL,
        record_b TEXT NOT NULL,
        rule_id UUID NOT NULL,
        score DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (job_id, record_a, record_b, rule_id)
    );
";

pub struct PostgresResolutionStore {
    pool: PgPool,
    source_filter: SourceFilterConfig,
}

impl PostgresResolutionStore {
    pub fn new(pool: PgPool, source_filter: SourceFilterConfig) -> Self {
        Self { pool, source_filter }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the `entity_resolution` schema and tables when missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for schema setup")?;
        conn.batch_execute(SCHEMA_SQL)
            .await
            .context("Failed to create entity_resolution schema")?;
        info!("entity_resolution schema is ready");
        Ok(())
    }
}

fn row_to_record(row: &Row) -> Result<Record> {
    let Json(attributes): Json<BTreeMap<String, AttributeValue>> = row.try_get("attributes")?;
    let id: String = row.try_get("id")?;
    Ok(Record {
        id: RecordId(id),
        entity_type: row.try_get("entity_type")?,
        source: row.try_get("source")?,
        updated_at: row.try_get("updated_at")?,
        attributes,
        merged_into: row.try_get("merged_into")?,
    })
}

fn row_data<T: serde::de::DeserializeOwned>(row: &Row, column: &str) -> Result<T> {
    let Json(value): Json<serde_json::Value> = row.try_get(column)?;
    serde_json::from_value(value).with_context(|| format!("Failed to decode column '{}'", column))
}

#[async_trait]
impl ResolutionStore for PostgresResolutionStore {
    async fn load_records(&self, entity_type: &str) -> Result<Vec<Record>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_records")?;

        let mut sql = String::from(
            "SELECT id, entity_type, source, updated_at, attributes, merged_into
             FROM entity_resolution.record WHERE entity_type = $1",
        );
        let mut sources: Vec<String> = Vec::new();
        if let Some((clause, allowed)) = self.source_filter.build_sql_filter_with_offset(1) {
            sql.push_str(" AND ");
            sql.push_str(&clause);
            sources = allowed;
        }
        sql.push_str(" ORDER BY id");

        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&entity_type];
        for source in &sources {
            params.push(source);
        }
        let rows = conn
            .query(sql.as_str(), &params)
            .await
            .context("Failed to load records")?;
        let records = rows.iter().map(row_to_record).collect::<Result<Vec<_>>>()?;
        debug!("Loaded {} '{}' records", records.len(), entity_type);
        Ok(records)
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<Record>> {
        let conn = self.pool.get().await.context("Failed to get DB connection for get_record")?;
        let row = conn
            .query_opt(
                "SELECT id, entity_type, source, updated_at, attributes, merged_into
                 FROM entity_resolution.record WHERE id = $1",
                &[&id.as_str()],
            )
            .await
            .context("Failed to query record")?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn upsert_records(&self, records: &[Record]) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for upsert_records")?;
        let tx = conn.transaction().await.context("Failed to start upsert transaction")?;
        let stmt = tx
            .prepare(
                "INSERT INTO entity_resolution.record (id, entity_type, source, updated_at, attributes)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO UPDATE SET
                    entity_type = EXCLUDED.entity_type,
                    source = EXCLUDED.source,
                    updated_at = EXCLUDED.updated_at,
                    attributes = EXCLUDED.attributes",
            )
            .await
            .context("Failed to prepare record upsert")?;
        for record in records {
            tx.execute(
                &stmt,
                &[
                    &record.id.as_str(),
                    &record.entity_type,
                    &record.source,
                    &record.updated_at,
                    &Json(&record.attributes),
                ],
            )
            .await
            .with_context(|| format!("Failed to upsert record {}", record.id))?;
        }
        tx.commit().await.context("Failed to commit record upsert")?;
        Ok(())
    }

    async fn cluster_for_record(&self, id: &RecordId) -> Result<Option<MergeCluster>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for cluster_for_record")?;
        let row = conn
            .query_opt(
                "SELECT c.data FROM entity_resolution.cluster_member m
                 JOIN entity_resolution.merge_cluster c ON c.id = m.cluster_id
                 WHERE m.record_id = $1 AND c.is_active",
                &[&id.as_str()],
            )
            .await
            .context("Failed to query cluster membership")?;
        row.as_ref().map(|r| row_data(r, "data")).transpose()
    }

    async fn get_cluster(&self, id: Uuid) -> Result<Option<MergeCluster>> {
        let conn = self.pool.get().await.context("Failed to get DB connection for get_cluster")?;
        let row = conn
            .query_opt("SELECT data FROM entity_resolution.merge_cluster WHERE id = $1", &[&id])
            .await
            .context("Failed to query cluster")?;
        row.as_ref().map(|r| row_data(r, "data")).transpose()
    }

    async fn list_clusters(&self, entity_type: &str) -> Result<Vec<MergeCluster>> {
        let conn = self.pool.get().await.context("Failed to get DB connection for list_clusters")?;
        let rows = conn
            .query(
                "SELECT data FROM entity_resolution.merge_cluster
                 WHERE entity_type = $1 AND is_active ORDER BY id",
                &[&entity_type],
            )
            .await
            .context("Failed to list clusters")?;
        rows.iter().map(|r| row_data(r, "data")).collect()
    }

    async fn get_golden_record(&self, id: Uuid) -> Result<Option<GoldenRecord>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for get_golden_record")?;
        let row = conn
            .query_opt("SELECT data FROM entity_resolution.golden_record WHERE id = $1", &[&id])
            .await
            .context("Failed to query golden record")?;
        row.as_ref().map(|r| row_data(r, "data")).transpose()
    }

    async fn commit_merge(&self, commit: &MergeCommit) -> Result<()> {
        let cluster = &commit.cluster;
        let mut conn = self.pool.get().await.context("Failed to get DB connection for commit_merge")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start transaction for commit_merge")?;

        let member_ids: Vec<&str> = cluster.members.iter().map(RecordId::as_str).collect();
        let rows = tx
            .query(
                "SELECT id, entity_type FROM entity_resolution.record WHERE id = ANY($1) FOR UPDATE",
                &[&member_ids],
            )
            .await
            .context("Failed to lock member records")?;
        let mut found = BTreeSet::new();
        for row in &rows {
            let id: String = row.get("id");
            let entity_type: String = row.get("entity_type");
            if entity_type != cluster.entity_type {
                bail!(
                    "record {} is '{}', cannot join '{}' cluster {}",
                    id,
                    entity_type,
                    cluster.entity_type,
                    cluster.id
                );
            }
            found.insert(id);
        }
        if let Some(missing) = member_ids.iter().find(|id| !found.contains(**id)) {
            bail!("record {} not found for cluster {}", missing, cluster.id);
        }

        // Member rows are locked above, so ownership cannot move until commit.
        if cluster.is_active() {
            let owner_rows = tx
                .query(
                    "SELECT cm.record_id, cm.cluster_id
                     FROM entity_resolution.cluster_member cm
                     JOIN entity_resolution.merge_cluster mc ON mc.id = cm.cluster_id
                     WHERE cm.record_id = ANY($1) AND mc.is_active
                     FOR UPDATE OF cm",
                    &[&member_ids],
                )
                .await
                .context("Failed to lock cluster membership")?;
            let owners: HashMap<RecordId, Uuid> = owner_rows
                .iter()
                .map(|row| (RecordId::from(row.get::<_, String>("record_id")), row.get("cluster_id")))
                .collect();
            if let Some(conflict) = membership_conflict(commit, |id| owners.get(id).copied()) {
                return Err(conflict.into());
            }
        }

        let now: DateTime<Utc> = cluster.updated_at;
        for absorbed_id in &commit.absorbed {
            tx.execute(
                "UPDATE entity_resolution.merge_cluster
                 SET is_active = FALSE, updated_at = $2,
                     data = jsonb_set(data, '{absorbed_into}', to_jsonb($3::text))
                 WHERE id = $1",
                &[absorbed_id, &now, &cluster.id.to_string()],
            )
            .await
            .with_context(|| format!("Failed to mark cluster {} absorbed", absorbed_id))?;
        }

        tx.execute(
            "INSERT INTO entity_resolution.merge_cluster (id, entity_type, is_active, data, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                is_active = EXCLUDED.is_active, data = EXCLUDED.data, updated_at = EXCLUDED.updated_at",
            &[&cluster.id, &cluster.entity_type, &cluster.is_active(), &Json(cluster), &now],
        )
        .await
        .context("Failed to upsert merge_cluster")?;

        let golden = &commit.golden;
        tx.execute(
            "INSERT INTO entity_resolution.golden_record (id, cluster_id, entity_type, data, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at",
            &[&golden.id, &golden.cluster_id, &golden.entity_type, &Json(golden), &golden.updated_at],
        )
        .await
        .context("Failed to upsert golden_record")?;

        let released: Vec<&str> = commit.released.iter().map(RecordId::as_str).collect();
        if !released.is_empty() {
            tx.execute(
                "UPDATE entity_resolution.record SET merged_into = NULL WHERE id = ANY($1)",
                &[&released],
            )
            .await
            .context("Failed to release records")?;
            tx.execute(
                "DELETE FROM entity_resolution.cluster_member WHERE record_id = ANY($1) AND cluster_id = $2",
                &[&released, &cluster.id],
            )
            .await
            .context("Failed to remove cluster membership")?;
        }

        if cluster.is_active() {
            tx.execute(
                "UPDATE entity_resolution.record SET merged_into = $2 WHERE id = ANY($1)",
                &[&member_ids, &golden.id],
            )
            .await
            .context("Failed to mark merged records")?;
            let stmt = tx
                .prepare(
                    "INSERT INTO entity_resolution.cluster_member (record_id, cluster_id) VALUES ($1, $2)
                     ON CONFLICT (record_id) DO UPDATE SET cluster_id = EXCLUDED.cluster_id",
                )
                .await
                .context("Failed to prepare membership upsert")?;
            for member in &member_ids {
                tx.execute(&stmt, &[member, &cluster.id])
                    .await
                    .with_context(|| format!("Failed to record membership of {}", member))?;
            }
        }

        let audit = &commit.audit;
        tx.execute(
            "INSERT INTO entity_resolution.audit_log
             (id, action, cluster_id, golden_record_id, job_id, entry, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &audit.id,
                &audit.action.as_str(),
                &audit.cluster_id,
                &audit.golden_record_id,
                &audit.job_id,
                &Json(audit),
                &audit.timestamp,
            ],
        )
        .await
        .context("Failed to insert audit_log entry")?;

        tx.commit().await.context("Failed to commit merge transaction")?;
        debug!("Committed cluster {} ({} members)", cluster.id, cluster.members.len());
        Ok(())
    }

    async fn record_bucket_outcome(
        &self,
        job_id: Uuid,
        unit: usize,
        edges: &[MatchEdge],
        reviews: &[PendingReview],
    ) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for record_bucket_outcome")?;
        let tx = conn.transaction().await.context("Failed to start bucket transaction")?;

        for edge in edges {
            tx.execute(
                "INSERT INTO entity_resolution.match_edge (job_id, record_a, record_b, rule_id, score)
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
                &[&job_id, &edge.record_a.as_str(), &edge.record_b.as_str(), &edge.rule_id, &edge.score],
            )
            .await
            .context("Failed to insert match_edge")?;
        }
        for review in reviews {
            tx.execute(
                "INSERT INTO entity_resolution.pending_review (id, job_id, entity_type, status, score, data, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                    job_id = EXCLUDED.job_id, score = EXCLUDED.score, data = EXCLUDED.data
                 WHERE entity_resolution.pending_review.status = 'PENDING'",
                &[
                    &review.id,
                    &review.job_id,
                    &review.entity_type,
                    &review.status.as_str(),
                    &review.candidate.score,
                    &Json(review),
                    &review.created_at,
                ],
            )
            .await
            .context("Failed to upsert pending_review")?;
        }
        tx.execute(
            "INSERT INTO entity_resolution.job_unit (job_id, unit) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            &[&job_id, &(unit as i64)],
        )
        .await
        .context("Failed to record completed unit")?;

        tx.commit().await.context("Failed to commit bucket outcome")?;
        Ok(())
    }

    async fn load_match_edges(&self, job_id: Uuid) -> Result<Vec<MatchEdge>> {
        let conn = self.pool.get().await.context("Failed to get DB connection for load_match_edges")?;
        let rows = conn
            .query(
                "SELECT record_a, record_b, rule_id, score FROM entity_resolution.match_edge
                 WHERE job_id = $1 ORDER BY record_a, record_b",
                &[&job_id],
            )
            .await
            .context("Failed to load match edges")?;
        Ok(rows
            .iter()
            .map(|row| MatchEdge {
                record_a: RecordId(row.get("record_a")),
                record_b: RecordId(row.get("record_b")),
                rule_id: row.get("rule_id"),
                score: row.get("score"),
            })
            .collect())
    }

    async fn get_pending_review(&self, id: Uuid) -> Result<Option<PendingReview>> {
        let conn = self.pool.get().await.context("Failed to get DB connection for get_pending_review")?;
        let row = conn
            .query_opt("SELECT data FROM entity_resolution.pending_review WHERE id = $1", &[&id])
            .await
            .context("Failed to query pending review")?;
        row.as_ref().map(|r| row_data(r, "data")).transpose()
    }

    async fn list_pending_reviews(&self, entity_type: &str, status: Option<ReviewStatus>) -> Result<Vec<PendingReview>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for list_pending_reviews")?;
        let rows = match status {
            Some(status) => {
                conn.query(
                    "SELECT data FROM entity_resolution.pending_review
                     WHERE entity_type = $1 AND status = $2 ORDER BY id",
                    &[&entity_type, &status.as_str()],
                )
                .await
            }
            None => {
                conn.query(
                    "SELECT data FROM entity_resolution.pending_review WHERE entity_type = $1 ORDER BY id",
                    &[&entity_type],
                )
                .await
            }
        }
        .context("Failed to list pending reviews")?;
        rows.iter().map(|r| row_data(r, "data")).collect()
    }

    async fn update_review_status(&self, id: Uuid, status: ReviewStatus) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for update_review_status")?;
        let updated = conn
            .execute(
                "UPDATE entity_resolution.pending_review
                 SET status = $2, data = jsonb_set(data, '{status}', to_jsonb($2::text))
                 WHERE id = $1",
                &[&id, &status.as_str()],
            )
            .await
            .context("Failed to update review status")?;
        if updated == 0 {
            bail!("pending review {} not found", id);
        }
        Ok(())
    }

    async fn audit_entries(&self, cluster_id: Option<Uuid>) -> Result<Vec<AuditEntry>> {
        let conn = self.pool.get().await.context("Failed to get DB connection for audit_entries")?;
        let rows = match cluster_id {
            Some(id) => {
                conn.query(
                    "SELECT entry FROM entity_resolution.audit_log WHERE cluster_id = $1 ORDER BY created_at",
                    &[&id],
                )
                .await
            }
            None => {
                conn.query("SELECT entry FROM entity_resolution.audit_log ORDER BY created_at", &[])
                    .await
            }
        }
        .context("Failed to query audit log")?;
        rows.iter().map(|r| row_data(r, "entry")).collect()
    }

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<JobCheckpoint>> {
        let conn = self.pool.get().await.context("Failed to get DB connection for load_checkpoint")?;
        let Some(row) = conn
            .query_opt(
                "SELECT checkpoint FROM entity_resolution.job_checkpoint WHERE job_id = $1",
                &[&job_id],
            )
            .await
            .context("Failed to query job checkpoint")?
        else {
            return Ok(None);
        };
        let mut checkpoint: JobCheckpoint = row_data(&row, "checkpoint")?;
        let units = conn
            .query("SELECT unit FROM entity_resolution.job_unit WHERE job_id = $1", &[&job_id])
            .await
            .context("Failed to query completed units")?;
        checkpoint.completed_blocks = units.iter().map(|r| r.get::<_, i64>("unit") as usize).collect();
        Ok(Some(checkpoint))
    }

    async fn save_checkpoint(&self, checkpoint: &JobCheckpoint) -> Result<()> {
        let conn = self.pool.get().await.context("Failed to get DB connection for save_checkpoint")?;
        conn.execute(
            "INSERT INTO entity_resolution.job_checkpoint (job_id, entity_type, state, checkpoint, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (job_id) DO UPDATE SET
                state = EXCLUDED.state, checkpoint = EXCLUDED.checkpoint, updated_at = EXCLUDED.updated_at",
            &[
                &checkpoint.job_id,
                &checkpoint.entity_type,
                &checkpoint.state.as_str(),
                &Json(checkpoint),
                &checkpoint.updated_at,
            ],
        )
        .await
        .context("Failed to save job checkpoint")?;
        Ok(())
    }

    async fn clear_job_progress(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for clear_job_progress")?;
        let tx = conn.transaction().await.context("Failed to start clear transaction")?;
        tx.execute("DELETE FROM entity_resolution.match_edge WHERE job_id = $1", &[&job_id])
            .await
            .context("Failed to clear match edges")?;
        tx.execute("DELETE FROM entity_resolution.job_unit WHERE job_id = $1", &[&job_id])
            .await
            .context("Failed to clear completed units")?;
        tx.commit().await.context("Failed to commit progress reset")?;
        Ok(())
    }
}
