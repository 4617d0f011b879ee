//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `attest-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs; runs, step
//! executions, step logs, and variable changes track execution state so a
//! finished run's timeline can be reconstructed from rows alone.

use attest_core::repository::workflow::WorkflowStore;
use attest_types::error::StoreError;
use attest_types::workflow::{
    ChangeKind, LogLevel, RunStatus, StepExecution, StepLogEntry, StepStatus, VariableChange,
    WorkflowDefinition, WorkflowRun,
};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Upsert a workflow definition (insert or replace by id).
    pub async fn save_definition(
        &self,
        workflow_id: &str,
        def: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(workflow_id)
        .bind(&def.name)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// List runs for a workflow, most recent first.
    pub async fn list_runs(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, workflow_id, tenant_id, project_id, status, started_at,
                      completed_at, duration_ms, context, error
               FROM workflow_runs
               WHERE workflow_id = ?
               ORDER BY started_at DESC
               LIMIT ?"#,
        )
        .bind(workflow_id)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(run_from_row).collect()
    }

    /// All step execution records for a run, in start order.
    pub async fn list_step_execs(&self, run_id: Uuid) -> Result<Vec<StepExecution>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, run_id, step_id, step_name, status, input, output, error,
                      started_at, completed_at, duration_ms
               FROM workflow_step_executions
               WHERE run_id = ?
               ORDER BY started_at ASC, id ASC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(step_exec_from_row).collect()
    }

    /// All step log lines for a run, oldest first, optionally by level.
    pub async fn list_logs(
        &self,
        run_id: Uuid,
        level: Option<LogLevel>,
    ) -> Result<Vec<StepLogEntry>, StoreError> {
        let mut sql = String::from(
            "SELECT id, run_id, step_id, level, message, timestamp
             FROM workflow_step_logs WHERE run_id = ?",
        );
        if level.is_some() {
            sql.push_str(" AND level = ?");
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let mut query = sqlx::query(&sql).bind(run_id.to_string());
        if let Some(level) = level {
            query = query.bind(enum_to_str(&level)?);
        }

        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(log_from_row).collect()
    }

    /// All variable changes for a run, oldest first.
    pub async fn list_variable_changes(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<VariableChange>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, run_id, step_id, variable_name, old_value, new_value,
                      change_kind, timestamp
               FROM workflow_variable_changes
               WHERE run_id = ?
               ORDER BY timestamp ASC, id ASC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(change_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRun, StoreError> {
    let id: String = get(row, "id")?;
    let status: String = get(row, "status")?;
    let context: String = get(row, "context")?;
    let started_at: String = get(row, "started_at")?;
    let completed_at: Option<String> = get(row, "completed_at")?;
    let duration_ms: Option<i64> = get(row, "duration_ms")?;

    Ok(WorkflowRun {
        id: parse_uuid(&id)?,
        workflow_id: get(row, "workflow_id")?,
        tenant_id: get(row, "tenant_id")?,
        project_id: get(row, "project_id")?,
        status: str_to_enum::<RunStatus>(&status)?,
        started_at: parse_datetime(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
        duration_ms: duration_ms.map(|d| d as u64),
        context: serde_json::from_str(&context)
            .map_err(|e| StoreError::Serialization(format!("invalid context JSON: {e}")))?,
        error: get(row, "error")?,
    })
}

fn step_exec_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StepExecution, StoreError> {
    let id: String = get(row, "id")?;
    let run_id: String = get(row, "run_id")?;
    let status: String = get(row, "status")?;
    let input: Option<String> = get(row, "input")?;
    let output: Option<String> = get(row, "output")?;
    let started_at: String = get(row, "started_at")?;
    let completed_at: Option<String> = get(row, "completed_at")?;
    let duration_ms: Option<i64> = get(row, "duration_ms")?;

    Ok(StepExecution {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        step_id: get(row, "step_id")?,
        step_name: get(row, "step_name")?,
        status: str_to_enum::<StepStatus>(&status)?,
        input: parse_optional_json(input.as_deref())?,
        output: parse_optional_json(output.as_deref())?,
        error: get(row, "error")?,
        started_at: parse_datetime(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
        duration_ms: duration_ms.map(|d| d as u64),
    })
}

fn log_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StepLogEntry, StoreError> {
    let id: String = get(row, "id")?;
    let run_id: String = get(row, "run_id")?;
    let level: String = get(row, "level")?;
    let timestamp: String = get(row, "timestamp")?;

    Ok(StepLogEntry {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        step_id: get(row, "step_id")?,
        level: str_to_enum::<LogLevel>(&level)?,
        message: get(row, "message")?,
        timestamp: parse_datetime(&timestamp)?,
    })
}

fn change_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<VariableChange, StoreError> {
    let id: String = get(row, "id")?;
    let run_id: String = get(row, "run_id")?;
    let change_kind: String = get(row, "change_kind")?;
    let old_value: Option<String> = get(row, "old_value")?;
    let new_value: Option<String> = get(row, "new_value")?;
    let timestamp: String = get(row, "timestamp")?;

    Ok(VariableChange {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        step_id: get(row, "step_id")?,
        variable_name: get(row, "variable_name")?,
        old_value: parse_optional_json(old_value.as_deref())?,
        new_value: parse_optional_json(new_value.as_deref())?,
        change_kind: str_to_enum::<ChangeKind>(&change_kind)?,
        timestamp: parse_datetime(&timestamp)?,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn get<'r, T>(row: &'r sqlx::sqlite::SqliteRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Query(format!("column '{column}': {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse::<Uuid>()
        .map_err(|e| StoreError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_optional_json(s: Option<&str>) -> Result<Option<serde_json::Value>, StoreError> {
    s.map(|text| {
        serde_json::from_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
    })
    .transpose()
}

/// Serialize a `rename_all = "lowercase"` enum to its wire string.
fn enum_to_str<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(StoreError::Serialization("non-string enum".to_string())),
    }
}

fn str_to_enum<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| StoreError::Query(format!("invalid enum value: {s}")))
}

fn optional_json_to_string(
    value: Option<&serde_json::Value>,
) -> Result<Option<String>, StoreError> {
    value
        .map(|v| serde_json::to_string(v).map_err(|e| StoreError::Serialization(e.to_string())))
        .transpose()
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn get_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let definition: String = get(&row, "definition")?;
                let def = serde_json::from_str(&definition).map_err(|e| {
                    StoreError::Serialization(format!("invalid workflow definition JSON: {e}"))
                })?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let context = serde_json::to_string(&run.context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, tenant_id, project_id, status, started_at,
                completed_at, duration_ms, context, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_id)
        .bind(&run.tenant_id)
        .bind(&run.project_id)
        .bind(enum_to_str(&run.status)?)
        .bind(format_datetime(&run.started_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(run.duration_ms.map(|d| d as i64))
        .bind(&context)
        .bind(&run.error)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let context = serde_json::to_string(&run.context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = ?, completed_at = ?, duration_ms = ?, context = ?, error = ?
               WHERE id = ?"#,
        )
        .bind(enum_to_str(&run.status)?)
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(run.duration_ms.map(|d| d as i64))
        .bind(&context)
        .bind(&run.error)
        .bind(run.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(run.id.to_string()));
        }
        Ok(())
    }

    async fn create_step_exec(&self, exec: &StepExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO workflow_step_executions
               (id, run_id, step_id, step_name, status, input, output, error,
                started_at, completed_at, duration_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(exec.id.to_string())
        .bind(exec.run_id.to_string())
        .bind(&exec.step_id)
        .bind(&exec.step_name)
        .bind(enum_to_str(&exec.status)?)
        .bind(optional_json_to_string(exec.input.as_ref())?)
        .bind(optional_json_to_string(exec.output.as_ref())?)
        .bind(&exec.error)
        .bind(format_datetime(&exec.started_at))
        .bind(exec.completed_at.as_ref().map(format_datetime))
        .bind(exec.duration_ms.map(|d| d as i64))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_step_exec(&self, exec: &StepExecution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE workflow_step_executions
               SET status = ?, output = ?, error = ?, completed_at = ?, duration_ms = ?
               WHERE id = ?"#,
        )
        .bind(enum_to_str(&exec.status)?)
        .bind(optional_json_to_string(exec.output.as_ref())?)
        .bind(&exec.error)
        .bind(exec.completed_at.as_ref().map(format_datetime))
        .bind(exec.duration_ms.map(|d| d as i64))
        .bind(exec.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(exec.id.to_string()));
        }
        Ok(())
    }

    async fn append_log(&self, entry: &StepLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO workflow_step_logs (id, run_id, step_id, level, message, timestamp)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.run_id.to_string())
        .bind(&entry.step_id)
        .bind(enum_to_str(&entry.level)?)
        .bind(&entry.message)
        .bind(format_datetime(&entry.timestamp))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn append_variable_change(&self, change: &VariableChange) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO workflow_variable_changes
               (id, run_id, step_id, variable_name, old_value, new_value, change_kind, timestamp)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(change.id.to_string())
        .bind(change.run_id.to_string())
        .bind(&change.step_id)
        .bind(&change.variable_name)
        .bind(optional_json_to_string(change.old_value.as_ref())?)
        .bind(optional_json_to_string(change.new_value.as_ref())?)
        .bind(enum_to_str(&change.change_kind)?)
        .bind(format_datetime(&change.timestamp))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
