//! SQLite environment store implementing the `VariableInjector` port.
//!
//! Each tenant/project pair can have several named environments; the active
//! one supplies the base variable layer for workflow runs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use attest_core::repository::environment::VariableInjector;
use attest_types::error::StoreError;
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed environment variable source.
pub struct SqliteVariableInjector {
    pool: DatabasePool,
}

impl SqliteVariableInjector {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Create or replace an environment; activating it deactivates the other
    /// environments of the same tenant/project.
    pub async fn save_environment(
        &self,
        tenant_id: &str,
        project_id: &str,
        name: &str,
        variables: &HashMap<String, Value>,
        active: bool,
    ) -> Result<(), StoreError> {
        let variables_json = serde_json::to_string(variables)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        if active {
            sqlx::query(
                "UPDATE environments SET is_active = 0 WHERE tenant_id = ? AND project_id = ?",
            )
            .bind(tenant_id)
            .bind(project_id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        sqlx::query(
            r#"INSERT INTO environments
               (id, tenant_id, project_id, name, is_active, variables, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(tenant_id)
        .bind(project_id)
        .bind(name)
        .bind(active as i64)
        .bind(&variables_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }
}

impl VariableInjector for SqliteVariableInjector {
    fn active_environment_variables(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Value>, StoreError>> + Send + '_>>
    {
        let tenant_id = tenant_id.to_string();
        let project_id = project_id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                r#"SELECT variables FROM environments
                   WHERE tenant_id = ? AND project_id = ? AND is_active = 1
                   ORDER BY updated_at DESC
                   LIMIT 1"#,
            )
            .bind(&tenant_id)
            .bind(&project_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

            let Some(row) = row else {
                return Ok(HashMap::new());
            };

            let variables: String = row
                .try_get("variables")
                .map_err(|e| StoreError::Query(e.to_string()))?;
            serde_json::from_str(&variables)
                .map_err(|e| StoreError::Serialization(e.to_string()))
        })
    }
}
