//! Postgres-backed workflow store.
//!
//! Workflow records are stored whole as JSONB alongside the columns the
//! list filters need; events are append-only keyed by `(workflow_id, seq)`.

use crate::events::WorkflowEvent;
use crate::model::{StrategyKind, Workflow, WorkflowStatus};
use crate::repository::{WorkflowFilter, WorkflowStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powerd_core::{Error, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PostgresWorkflowStore {
    pool: PgPool,
}

fn status_label(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Created => "Created",
        WorkflowStatus::Queued => "Queued",
        WorkflowStatus::Running => "Running",
        WorkflowStatus::Paused => "Paused",
        WorkflowStatus::RollingBack => "RollingBack",
        WorkflowStatus::Completed => "Completed",
        WorkflowStatus::Failed => "Failed",
        WorkflowStatus::Cancelled => "Cancelled",
        WorkflowStatus::RolledBack => "RolledBack",
    }
}

fn strategy_label(strategy: StrategyKind) -> &'static str {
    match strategy {
        StrategyKind::Rolling => "Rolling",
        StrategyKind::BlueGreen => "BlueGreen",
        StrategyKind::Canary => "Canary",
    }
}

fn db_error(e: sqlx::Error) -> Error {
    Error::dependency_unavailable(format!("postgres: {e}"))
}

impl PostgresWorkflowStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await.map_err(db_error)?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id UUID PRIMARY KEY,
                record JSONB NOT NULL,
                revision BIGINT NOT NULL,
                status TEXT NOT NULL,
                service_name TEXT NOT NULL,
                strategy TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_events (
                workflow_id UUID NOT NULL,
                seq BIGINT NOT NULL,
                record JSONB NOT NULL,
                PRIMARY KEY (workflow_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    fn decode_workflow(row: &sqlx::postgres::PgRow) -> Result<Workflow> {
        let record: serde_json::Value = row.try_get("record").map_err(db_error)?;
        serde_json::from_value(record)
            .map_err(|e| Error::internal(format!("corrupt workflow record: {e}")))
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn insert(&self, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows
                (id, record, revision, status, service_name, strategy, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(workflow.id)
        .bind(serde_json::to_value(workflow)?)
        .bind(workflow.revision as i64)
        .bind(status_label(workflow.status))
        .bind(&workflow.service_name)
        .bind(strategy_label(workflow.strategy))
        .bind(workflow.created_at)
        .bind(workflow.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update(&self, workflow: &Workflow) -> Result<()> {
        let outcome = sqlx::query(
            r#"
            UPDATE workflows
            SET record = $2, revision = $3, status = $4, completed_at = $5
            WHERE id = $1 AND revision < $3
            "#,
        )
        .bind(workflow.id)
        .bind(serde_json::to_value(workflow)?)
        .bind(workflow.revision as i64)
        .bind(status_label(workflow.status))
        .bind(workflow.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if outcome.rows_affected() == 0 {
            return Err(Error::internal(format!(
                "stale write for workflow {} at revision {}",
                workflow.id, workflow.revision
            )));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT record FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(Self::decode_workflow).transpose()
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        let rows = sqlx::query("SELECT record FROM workflows ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            workflows.push(Self::decode_workflow(row)?);
        }

        workflows.retain(|w| {
            filter.status.map_or(true, |s| w.status == s)
                && filter
                    .service_name
                    .as_ref()
                    .map_or(true, |s| &w.service_name == s)
                && filter.strategy.map_or(true, |s| w.strategy == s)
                && filter.created_after.map_or(true, |t| w.created_at >= t)
        });
        if let Some(limit) = filter.limit {
            workflows.truncate(limit);
        }
        Ok(workflows)
    }

    async fn append_event(&self, mut event: WorkflowEvent) -> Result<WorkflowEvent> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq) + 1, 0) AS seq FROM workflow_events WHERE workflow_id = $1",
        )
        .bind(event.workflow_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let seq: i64 = row.try_get("seq").map_err(db_error)?;
        event.seq = seq as u64;

        sqlx::query("INSERT INTO workflow_events (workflow_id, seq, record) VALUES ($1, $2, $3)")
            .bind(event.workflow_id)
            .bind(seq)
            .bind(serde_json::to_value(&event)?)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(event)
    }

    async fn events(&self, workflow_id: Uuid) -> Result<Vec<WorkflowEvent>> {
        let rows = sqlx::query(
            "SELECT record FROM workflow_events WHERE workflow_id = $1 ORDER BY seq",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let record: serde_json::Value = row.try_get("record").map_err(db_error)?;
            events.push(
                serde_json::from_value(record)
                    .map_err(|e| Error::internal(format!("corrupt event record: {e}")))?,
            );
        }
        Ok(events)
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM workflows
            WHERE status IN ('Completed', 'Failed', 'Cancelled', 'RolledBack')
              AND completed_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut removed = Vec::with_capacity(rows.len());
        for row in rows {
            removed.push(row.try_get::<Uuid, _>("id").map_err(db_error)?);
        }

        if !removed.is_empty() {
            sqlx::query("DELETE FROM workflow_events WHERE workflow_id = ANY($1)")
                .bind(&removed)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        Ok(removed)
    }
}
