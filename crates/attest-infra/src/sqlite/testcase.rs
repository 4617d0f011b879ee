//! SQLite test-case library implementing the `TestCaseRepository` port.

use std::future::Future;
use std::pin::Pin;

use attest_core::repository::testcase::TestCaseRepository;
use attest_types::error::StoreError;
use attest_types::testcase::TestCase;
use chrono::Utc;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed test-case library.
pub struct SqliteTestCaseRepository {
    pool: DatabasePool,
}

impl SqliteTestCaseRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Upsert a test case by external id.
    pub async fn save_test_case(&self, case: &TestCase) -> Result<(), StoreError> {
        let kind = serde_json::to_value(case.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| StoreError::Serialization("invalid test case kind".to_string()))?;
        let config = serde_json::to_string(&case.config)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"INSERT INTO test_cases (id, name, type, config, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 type = excluded.type,
                 config = excluded.config,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&case.id)
        .bind(&case.name)
        .bind(&kind)
        .bind(&config)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }
}

impl TestCaseRepository for SqliteTestCaseRepository {
    fn get_test_case(
        &self,
        test_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TestCase>, StoreError>> + Send + '_>> {
        let test_id = test_id.to_string();
        Box::pin(async move {
            let row = sqlx::query("SELECT id, name, type, config FROM test_cases WHERE id = ?")
                .bind(&test_id)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

            let Some(row) = row else {
                return Ok(None);
            };

            let kind: String = row
                .try_get("type")
                .map_err(|e| StoreError::Query(e.to_string()))?;
            let config: String = row
                .try_get("config")
                .map_err(|e| StoreError::Query(e.to_string()))?;

            Ok(Some(TestCase {
                id: row
                    .try_get("id")
                    .map_err(|e| StoreError::Query(e.to_string()))?,
                name: row
                    .try_get("name")
                    .map_err(|e| StoreError::Query(e.to_string()))?,
                kind: serde_json::from_value(serde_json::Value::String(kind.clone()))
                    .map_err(|_| StoreError::Query(format!("invalid test case kind: {kind}")))?,
                config: serde_json::from_str(&config)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_types::testcase::TestCaseKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_fetch_test_case() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("tc.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let repo = SqliteTestCaseRepository::new(pool);

        let case: TestCase = serde_json::from_value(json!({
            "id": "TC-42",
            "name": "Health check",
            "type": "http",
            "config": { "method": "GET", "url": "https://api.test/health" }
        }))
        .unwrap();
        repo.save_test_case(&case).await.unwrap();

        let loaded = repo.get_test_case("TC-42").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Health check");
        assert_eq!(loaded.kind, TestCaseKind::Http);
        assert_eq!(loaded.config["url"], json!("https://api.test/health"));

        assert!(repo.get_test_case("TC-404").await.unwrap().is_none());
    }
}
