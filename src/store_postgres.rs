//! PostgreSQL implementation of `ProcessStore` (feature `postgres`).
//!
//! Instance ids are stored in their canonical 36-character form. Every
//! operation that touches more than one row runs inside a single
//! transaction; `migrate()` applies the schema idempotently at startup.

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::state::{
    ErrorRecord, ExecutionState, FormDef, InstanceStatus, TaskStatus, UserTaskRecord,
};
use crate::store::ProcessStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS process_definitions (
        id VARCHAR(255) NOT NULL,
        bpmn_xml TEXT NOT NULL,
        version INTEGER NOT NULL,
        deployed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS process_instances (
        id VARCHAR(36) PRIMARY KEY,
        process_id VARCHAR(255) NOT NULL,
        current_element VARCHAR(255) NOT NULL,
        status VARCHAR(32) NOT NULL DEFAULT 'RUNNING',
        pending_joins TEXT NOT NULL DEFAULT '{}',
        branch_arrivals TEXT NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS process_variables (
        id BIGSERIAL PRIMARY KEY,
        instance_id VARCHAR(36) NOT NULL REFERENCES process_instances(id) ON DELETE CASCADE,
        var_key VARCHAR(255) NOT NULL,
        var_value TEXT,
        UNIQUE(instance_id, var_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_tasks (
        id BIGSERIAL PRIMARY KEY,
        instance_id VARCHAR(36) NOT NULL REFERENCES process_instances(id),
        task_id VARCHAR(255) NOT NULL,
        form_key VARCHAR(255) NOT NULL,
        status VARCHAR(20) NOT NULL DEFAULT 'PENDING',
        variables_snapshot TEXT NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS user_tasks_pending_uniq
        ON user_tasks (instance_id, task_id) WHERE status = 'PENDING'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS process_errors (
        id BIGSERIAL PRIMARY KEY,
        instance_id VARCHAR(36) NOT NULL REFERENCES process_instances(id),
        error_message TEXT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS process_forms (
        id VARCHAR(255) PRIMARY KEY,
        "processId" VARCHAR(255) NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        schema TEXT NOT NULL DEFAULT '{}',
        uischema TEXT NOT NULL DEFAULT '{}'
    )
    "#,
];

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool from the config and apply the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.connection_url())
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Idempotent schema creation.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert the instance row and replace its variables inside the
    /// given transaction.
    async fn write_instance(
        tx: &mut Transaction<'_, Postgres>,
        state: &ExecutionState,
    ) -> Result<(), StoreError> {
        let instance_id = state.instance_id.to_string();
        let pending_joins = serde_json::to_string(&state.pending_joins)
            .map_err(|e| StoreError::Corrupt(format!("pending_joins encoding: {e}")))?;
        let branch_arrivals = serde_json::to_string(&state.branch_arrivals)
            .map_err(|e| StoreError::Corrupt(format!("branch_arrivals encoding: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO process_instances
                (id, process_id, current_element, status, pending_joins, branch_arrivals,
                 created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                current_element = EXCLUDED.current_element,
                status = EXCLUDED.status,
                pending_joins = EXCLUDED.pending_joins,
                branch_arrivals = EXCLUDED.branch_arrivals,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&instance_id)
        .bind(&state.process_id)
        .bind(&state.current_element)
        .bind(state.status.as_str())
        .bind(&pending_joins)
        .bind(&branch_arrivals)
        .bind(state.created_at)
        .bind(state.completed_at)
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM process_variables WHERE instance_id = $1")
            .bind(&instance_id)
            .execute(&mut **tx)
            .await?;
        for (key, value) in &state.variables {
            sqlx::query(
                "INSERT INTO process_variables (instance_id, var_key, var_value) VALUES ($1, $2, $3)",
            )
            .bind(&instance_id)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    process_id: String,
    current_element: String,
    status: String,
    pending_joins: String,
    branch_arrivals: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    instance_id: String,
    task_id: String,
    form_key: String,
    status: String,
    variables_snapshot: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct FormRow {
    id: String,
    process_id: String,
    description: String,
    schema: String,
    uischema: String,
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("invalid uuid {raw}: {e}")))
}

impl TaskRow {
    fn into_record(self) -> Result<UserTaskRecord, StoreError> {
        Ok(UserTaskRecord {
            instance_id: parse_uuid(&self.instance_id)?,
            task_id: self.task_id,
            form_key: self.form_key,
            status: TaskStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown task status: {}", self.status)))?,
            variables_snapshot: serde_json::from_str(&self.variables_snapshot)
                .map_err(|e| StoreError::Corrupt(format!("variables_snapshot decoding: {e}")))?,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

#[async_trait]
impl ProcessStore for PostgresStore {
    // ── Definitions ──

    async fn save_definition(&self, process_id: &str, bpmn_xml: &str) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await?;
        let version: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM process_definitions WHERE id = $1",
        )
        .bind(process_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO process_definitions (id, bpmn_xml, version) VALUES ($1, $2, $3)")
            .bind(process_id)
            .bind(bpmn_xml)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn load_definition(&self, process_id: &str) -> Result<Option<String>, StoreError> {
        let xml: Option<String> = sqlx::query_scalar(
            "SELECT bpmn_xml FROM process_definitions WHERE id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(xml)
    }

    // ── Instances ──

    async fn save_instance(&self, state: &ExecutionState) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::write_instance(&mut tx, state).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<ExecutionState>, StoreError> {
        let id = instance_id.to_string();
        let Some(row) = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, process_id, current_element, status, pending_joins, branch_arrivals,
                   created_at, completed_at
            FROM process_instances WHERE id = $1
            "#,
        )
        .bind(&id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let variable_rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT var_key, var_value FROM process_variables WHERE instance_id = $1",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;
        let variables: BTreeMap<String, String> = variable_rows
            .into_iter()
            .map(|(key, value)| (key, value.unwrap_or_default()))
            .collect();

        Ok(Some(ExecutionState {
            instance_id: parse_uuid(&row.id)?,
            process_id: row.process_id,
            current_element: row.current_element,
            variables,
            status: InstanceStatus::parse(&row.status).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown instance status: {}", row.status))
            })?,
            pending_joins: serde_json::from_str(&row.pending_joins)
                .map_err(|e| StoreError::Corrupt(format!("pending_joins decoding: {e}")))?,
            branch_arrivals: serde_json::from_str(&row.branch_arrivals)
                .map_err(|e| StoreError::Corrupt(format!("branch_arrivals decoding: {e}")))?,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }))
    }

    async fn active_instances(&self) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM process_instances
            WHERE status IN ('RUNNING', 'SUSPENDED_AT_USER_TASK', 'SUSPENDED_ADMIN')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    // ── User tasks ──

    async fn save_user_task(
        &self,
        instance_id: Uuid,
        task_id: &str,
        form_key: &str,
        variables_snapshot: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let id = instance_id.to_string();
        let snapshot = serde_json::to_string(variables_snapshot)
            .map_err(|e| StoreError::Corrupt(format!("variables_snapshot encoding: {e}")))?;

        let mut tx = self.pool.begin().await?;
        let pending_exists: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM user_tasks WHERE instance_id = $1 AND task_id = $2 AND status = 'PENDING'",
        )
        .bind(&id)
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;
        if pending_exists.is_none() {
            sqlx::query(
                r#"
                INSERT INTO user_tasks (instance_id, task_id, form_key, variables_snapshot)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&id)
            .bind(task_id)
            .bind(form_key)
            .bind(&snapshot)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn complete_user_task(
        &self,
        instance_id: Uuid,
        task_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE user_tasks SET status = 'COMPLETED', completed_at = now()
            WHERE instance_id = $1 AND task_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(instance_id.to_string())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_task_transition(
        &self,
        state: &ExecutionState,
        task_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE user_tasks SET status = 'COMPLETED', completed_at = now()
            WHERE instance_id = $1 AND task_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(state.instance_id.to_string())
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        Self::write_instance(&mut tx, state).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn pending_tasks(&self, instance_id: Uuid) -> Result<Vec<UserTaskRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT instance_id, task_id, form_key, status, variables_snapshot, created_at, completed_at
            FROM user_tasks
            WHERE instance_id = $1 AND status = 'PENDING'
            ORDER BY created_at
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn find_task(
        &self,
        instance_id: Uuid,
        task_id: &str,
    ) -> Result<Option<UserTaskRecord>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT instance_id, task_id, form_key, status, variables_snapshot, created_at, completed_at
            FROM user_tasks
            WHERE instance_id = $1 AND task_id = $2
            ORDER BY CASE WHEN status = 'PENDING' THEN 0 ELSE 1 END, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(instance_id.to_string())
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_record).transpose()
    }

    // ── Error log ──

    async fn append_error(&self, instance_id: Uuid, message: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO process_errors (instance_id, error_message) VALUES ($1, $2)")
            .bind(instance_id.to_string())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_errors(&self, instance_id: Uuid) -> Result<Vec<ErrorRecord>, StoreError> {
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT instance_id, error_message, occurred_at
            FROM process_errors WHERE instance_id = $1 ORDER BY occurred_at
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(raw_id, message, occurred_at)| {
                Ok(ErrorRecord {
                    instance_id: parse_uuid(&raw_id)?,
                    message,
                    occurred_at,
                })
            })
            .collect()
    }

    // ── Forms ──

    async fn form_by_id(&self, form_id: &str) -> Result<Option<FormDef>, StoreError> {
        let row = sqlx::query_as::<_, FormRow>(
            r#"
            SELECT id, "processId" AS process_id, description, schema, uischema
            FROM process_forms WHERE id = $1
            "#,
        )
        .bind(form_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| FormDef {
            id: r.id,
            process_id: r.process_id,
            description: r.description,
            schema: r.schema,
            uischema: r.uischema,
        }))
    }
}
