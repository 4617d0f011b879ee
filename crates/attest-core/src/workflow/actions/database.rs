//! The `database` action: run a query or statement against sqlite, mysql,
//! or postgres through sqlx's `Any` driver.
//!
//! Connections are action-scoped: open, ping, run, close. There is no pool
//! shared across steps. Queries return `{rows, rowCount}`; statements return
//! `{affected}`. Byte columns are decoded to strings.

use std::sync::Once;

use serde_json::{json, Map, Number, Value};
use sqlx::{AnyConnection, Column, Connection, Row};

use super::{ActionContext, ActionResult};

static INSTALL_DRIVERS: Once = Once::new();

pub(super) async fn execute(ctx: &ActionContext<'_>, config: &Map<String, Value>) -> ActionResult {
    let driver = match required_str(config, "driver") {
        Ok(v) => v,
        Err(e) => return ActionResult::failed(e),
    };
    let dsn = match required_str(config, "dsn") {
        Ok(v) => v,
        Err(e) => return ActionResult::failed(e),
    };
    let query = match required_str(config, "query") {
        Ok(v) => v,
        Err(e) => return ActionResult::failed(e),
    };
    let query_type = config
        .get("queryType")
        .and_then(Value::as_str)
        .unwrap_or("query")
        .to_lowercase();
    let args: Vec<Value> = config
        .get("args")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let url = match connection_url(driver, dsn, ctx).await {
        Ok(url) => url,
        Err(e) => return ActionResult::failed(e),
    };

    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

    let mut conn = match AnyConnection::connect(&url).await {
        Ok(conn) => conn,
        Err(e) => return ActionResult::failed(format!("failed to connect to database: {e}")),
    };
    if let Err(e) = conn.ping().await {
        return ActionResult::failed(format!("failed to ping database: {e}"));
    }

    let result = match query_type.as_str() {
        "select" | "query" => run_query(&mut conn, query, &args).await,
        "exec" | "insert" | "update" | "delete" => run_exec(&mut conn, query, &args).await,
        other => Err(format!("unsupported query type: {other}")),
    };

    let _ = conn.close().await;

    match result {
        Ok(mut output) => {
            output.insert("success".to_string(), json!(true));
            ActionResult::success(output)
        }
        Err(e) => ActionResult::failed(e),
    }
}

fn required_str<'a>(config: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    config
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("{key} is required"))
}

/// Build the sqlx `Any` connection URL. Relative sqlite paths are resolved
/// against the process working directory.
async fn connection_url(
    driver: &str,
    dsn: &str,
    ctx: &ActionContext<'_>,
) -> Result<String, String> {
    match driver {
        "sqlite" | "sqlite3" => {
            if dsn.starts_with("sqlite:") {
                return Ok(dsn.to_string());
            }
            let path = if dsn.starts_with('/') || dsn == ":memory:" {
                dsn.to_string()
            } else {
                let cwd = std::env::current_dir()
                    .map_err(|e| format!("cannot resolve working directory: {e}"))?;
                let resolved = cwd.join(dsn.trim_start_matches("./"));
                let resolved = resolved.to_string_lossy().to_string();
                ctx.logger
                    .info(
                        ctx.step_id,
                        &format!("Resolved SQLite DSN to absolute path: {resolved}"),
                    )
                    .await;
                resolved
            };
            Ok(format!("sqlite://{path}"))
        }
        "mysql" => Ok(prefix_url("mysql", dsn)),
        "postgres" | "postgresql" => Ok(prefix_url("postgres", dsn)),
        other => Err(format!(
            "unsupported driver: {other} (supported: sqlite, mysql, postgres)"
        )),
    }
}

fn prefix_url(scheme: &str, dsn: &str) -> String {
    if dsn.contains("://") {
        dsn.to_string()
    } else {
        format!("{scheme}://{dsn}")
    }
}

async fn run_query(
    conn: &mut AnyConnection,
    sql: &str,
    args: &[Value],
) -> Result<Map<String, Value>, String> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = bind_value(query, arg);
    }

    let rows = query
        .fetch_all(conn)
        .await
        .map_err(|e| format!("query failed: {e}"))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut map = Map::new();
        for (i, column) in row.columns().iter().enumerate() {
            map.insert(column.name().to_string(), decode_column(row, i));
        }
        decoded.push(Value::Object(map));
    }

    let mut output = Map::new();
    output.insert("rowCount".to_string(), json!(decoded.len()));
    output.insert("rows".to_string(), Value::Array(decoded));
    Ok(output)
}

async fn run_exec(
    conn: &mut AnyConnection,
    sql: &str,
    args: &[Value],
) -> Result<Map<String, Value>, String> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = bind_value(query, arg);
    }

    let result = query
        .execute(conn)
        .await
        .map_err(|e| format!("exec failed: {e}"))?;

    let mut output = Map::new();
    output.insert("affected".to_string(), json!(result.rows_affected()));
    Ok(output)
}

type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>;

/// Bind a JSON value with its natural SQL type; containers are bound as
/// compact JSON text.
fn bind_value<'q>(query: AnyQuery<'q>, value: &Value) -> AnyQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(serde_json::to_string(other).unwrap_or_default()),
    }
}

/// Decode one column by probing the `Any` driver's value kinds in order.
/// Byte columns come back as (lossy) strings.
fn decode_column(row: &sqlx::any::AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(|i| Value::Number(Number::from(i))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v
            .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    Value::Null
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tracking::test_support::NullLogger;
    use crate::workflow::tracking::StepLogger;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn test_ctx<'a>(logger: &'a Arc<dyn StepLogger>) -> ActionContext<'a> {
        ActionContext {
            step_id: "db-step",
            step_name: "DB Step",
            variables: HashMap::new(),
            step_outputs: HashMap::new(),
            dispatcher: None,
            test_cases: None,
            logger,
            allow_mock_dispatch: true,
        }
    }

    fn config(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_required_keys_fail() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(&ctx, &config(&[("driver", json!("sqlite"))])).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("dsn is required"));
    }

    #[tokio::test]
    async fn test_unsupported_driver_fails() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(
            &ctx,
            &config(&[
                ("driver", json!("oracle")),
                ("dsn", json!("x")),
                ("query", json!("SELECT 1")),
            ]),
        )
        .await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("unsupported driver"));
    }

    #[tokio::test]
    async fn test_sqlite_exec_and_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("action.db");
        let dsn = format!("sqlite://{}?mode=rwc", db_path.display());

        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let create = execute(
            &ctx,
            &config(&[
                ("driver", json!("sqlite")),
                ("dsn", json!(dsn.clone())),
                ("query", json!("CREATE TABLE items (id INTEGER, name TEXT)")),
                ("queryType", json!("exec")),
            ]),
        )
        .await;
        assert!(create.is_success(), "create failed: {:?}", create.error);

        let insert = execute(
            &ctx,
            &config(&[
                ("driver", json!("sqlite")),
                ("dsn", json!(dsn.clone())),
                ("query", json!("INSERT INTO items (id, name) VALUES (?, ?)")),
                ("queryType", json!("insert")),
                ("args", json!([7, "widget"])),
            ]),
        )
        .await;
        assert!(insert.is_success(), "insert failed: {:?}", insert.error);
        assert_eq!(insert.output["affected"], json!(1));

        let select = execute(
            &ctx,
            &config(&[
                ("driver", json!("sqlite")),
                ("dsn", json!(dsn.clone())),
                ("query", json!("SELECT id, name FROM items WHERE id = ?")),
                ("queryType", json!("select")),
                ("args", json!([7])),
            ]),
        )
        .await;
        assert!(select.is_success(), "select failed: {:?}", select.error);
        assert_eq!(select.output["rowCount"], json!(1));
        assert_eq!(select.output["rows"][0]["id"], json!(7));
        assert_eq!(select.output["rows"][0]["name"], json!("widget"));
    }

    #[tokio::test]
    async fn test_invalid_sql_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("bad.db").display());

        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(
            &ctx,
            &config(&[
                ("driver", json!("sqlite")),
                ("dsn", json!(dsn.clone())),
                ("query", json!("SELEKT nonsense")),
            ]),
        )
        .await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("query failed"));
    }
}
