//! C4 — Connection Pool / Executor.
//!
//! One `DatabaseExecutor` per registered database, wrapping a pooled
//! `sqlx::PgPool`. Ground: `nocodo-tools/src/postgres_reader/executor.rs`
//! (`PostgresExecutor::new`/`execute_query`/`extract_value`), generalized
//! from a single analysis connection to a sized pool serving concurrent
//! gateway requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use regex::Regex;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::{debug, warn};

use crate::access_control;
use crate::error::GatewayError;
use crate::model::{AccessPolicy, ColumnMeta, DatabaseIdentity, DatabaseInfo};
use crate::retry::retry_on_db_error;

pub struct DatabaseExecutor {
    pool: sqlx::PgPool,
    identity: DatabaseIdentity,
    policy: Option<AccessPolicy>,
    closed: AtomicBool,
}

impl DatabaseExecutor {
    /// Builds a pool sized from `min_connections`/`max_connections` with an
    /// acquire timeout, and sets `statement_timeout` on every new connection
    /// via an `after_connect` hook.
    pub async fn initialize(
        identity: DatabaseIdentity,
        policy: Option<AccessPolicy>,
    ) -> Result<Self, GatewayError> {
        let statement_timeout_ms = identity.statement_timeout_ms;
        let connection_string = identity.connection_string();

        let pool = PgPoolOptions::new()
            .min_connections(identity.min_connections)
            .max_connections(identity.max_connections)
            .acquire_timeout(Duration::from_secs(identity.connection_timeout_secs))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&connection_string)
            .await
            .map_err(|e| GatewayError::internal(format!("failed to connect to '{}': {e}", identity.name)))?;

        Ok(Self {
            pool,
            identity,
            policy,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn info(&self) -> DatabaseInfo {
        DatabaseInfo {
            name: self.identity.name.clone(),
            description: self.identity.description.clone(),
            host: self.identity.host.clone(),
            database: self.identity.database.clone(),
            has_policy: self.policy.is_some(),
            blocked_tables: self
                .policy
                .as_ref()
                .map(|p| {
                    let mut tables: Vec<String> = p.blocked_tables.iter().cloned().collect();
                    tables.sort();
                    tables
                })
                .unwrap_or_default(),
        }
    }

    /// Idempotent: closing an already-closed executor is a no-op (spec.md §8).
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close().await;
    }

    /// The six-step execution algorithm of spec.md §4.4: defense-in-depth
    /// access-control re-check, optional EXPLAIN-cost gate, a read-only
    /// transaction with a statement timeout, row fetch with truncation, and
    /// column-metadata derivation from the reflected Postgres type names.
    pub async fn execute(
        &self,
        sql: &str,
        max_rows: usize,
    ) -> Result<(Vec<IndexMap<String, serde_json::Value>>, Vec<ColumnMeta>, u64), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::internal(format!(
                "executor for '{}' is closed",
                self.identity.name
            )));
        }

        let sql = if let Some(policy) = &self.policy {
            let result = access_control::rewrite(sql, policy);
            if !result.ok {
                return Err(GatewayError::AccessDenied {
                    message: result
                        .denial_reason
                        .unwrap_or_else(|| "access denied".to_string()),
                    sql: Some(sql.to_string()),
                    validation_details: None,
                    suggestion: Some(
                        "This query touches a table or column outside the database's access policy"
                            .to_string(),
                    ),
                });
            }
            result.rewritten_sql.unwrap_or_else(|| sql.to_string())
        } else {
            sql.to_string()
        };

        if let Some(policy) = &self.policy {
            if policy.require_explain {
                self.check_explain_cost(&sql, policy).await?;
            }
        }

        let started = Instant::now();
        let rows = retry_on_db_error(
            |e: &sqlx::Error| matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut),
            || {
                let sql = sql.clone();
                async move { self.run_read_only(&sql).await }
            },
        )
        .await
        .map_err(|e| map_execution_error(&sql, e))?;

        let elapsed_ms = started.elapsed().as_millis() as u64;

        let truncated: Vec<&PgRow> = rows.iter().take(max_rows).collect();
        let columns = truncated
            .first()
            .map(|row| column_metadata(row))
            .unwrap_or_default();
        let json_rows = truncated.iter().map(|row| row_to_json(row)).collect();

        Ok((json_rows, columns, elapsed_ms))
    }

    async fn run_read_only(&self, sql: &str) -> Result<Vec<PgRow>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        let rows = sqlx::query(sql).fetch_all(&mut *tx).await?;
        tx.rollback().await?;
        Ok(rows)
    }

    /// Parses `cost=<start>..<total>` out of the first `EXPLAIN` line.
    /// Non-fatal on parse failure: the query still runs, only the cost gate
    /// is skipped, mirroring `pg_mcp_server`'s conservative handling of an
    /// unparseable `EXPLAIN` plan.
    async fn check_explain_cost(&self, sql: &str, policy: &AccessPolicy) -> Result<(), GatewayError> {
        let Some(max_cost) = policy.max_explain_cost else {
            return Ok(());
        };
        let explain_sql = format!("EXPLAIN {sql}");
        let rows = match sqlx::query(&explain_sql).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to EXPLAIN query, skipping cost gate");
                return Ok(());
            }
        };
        let Some(first) = rows.first() else {
            return Ok(());
        };
        let Ok(plan_line) = first.try_get::<String, _>(0) else {
            return Ok(());
        };

        let re = Regex::new(r"cost=[\d.]+\.\.(\d+\.?\d*)").expect("static regex is valid");
        let Some(captures) = re.captures(&plan_line) else {
            debug!(plan_line, "could not parse EXPLAIN cost, skipping gate");
            return Ok(());
        };
        let Ok(total_cost) = captures[1].parse::<f64>() else {
            return Ok(());
        };

        if total_cost > max_cost {
            return Err(GatewayError::AccessDenied {
                message: format!("estimated query cost {total_cost} exceeds limit {max_cost}"),
                sql: Some(sql.to_string()),
                validation_details: Some(plan_line),
                suggestion: Some(
                    "Narrow the query (add filters or limits) to reduce its estimated cost".to_string(),
                ),
            });
        }
        Ok(())
    }
}

fn map_execution_error(sql: &str, e: sqlx::Error) -> GatewayError {
    if matches!(e, sqlx::Error::PoolTimedOut) {
        return GatewayError::QueryTimeout {
            message: format!("query did not complete within the configured timeout: {e}"),
            suggestion: Some("Narrow the query or try again when the database is less busy".to_string()),
        };
    }
    if let Some(db_err) = e.as_database_error() {
        if db_err.code().as_deref() == Some("57014") {
            return GatewayError::QueryTimeout {
                message: "query canceled due to statement timeout".to_string(),
                suggestion: Some("Narrow the query or try again when the database is less busy".to_string()),
            };
        }
    }
    GatewayError::ExecutionFailed {
        message: e.to_string(),
        sql: sql.to_string(),
        suggestion: Some(
            "Please verify table and column names are correct, or try rephrasing your query".to_string(),
        ),
    }
}

/// Reflects the Postgres type name for each column directly off the row,
/// generalizing `nocodo-tools`'s single-connection `extract_value` switch
/// to a full row of heterogeneous columns.
fn column_metadata(row: &PgRow) -> Vec<ColumnMeta> {
    row.columns()
        .iter()
        .map(|c| ColumnMeta {
            name: c.name().to_string(),
            type_name: c.type_info().name().to_string(),
        })
        .collect()
}

fn row_to_json(row: &PgRow) -> IndexMap<String, serde_json::Value> {
    let mut map = IndexMap::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = extract_value(row, i, column.type_info().name());
        map.insert(column.name().to_string(), value);
    }
    map
}

/// Best-effort decode into a JSON value, falling back to the column's
/// textual rendering when a type is not one of the common scalars.
fn extract_value(row: &PgRow, idx: usize, type_name: &str) -> serde_json::Value {
    use serde_json::Value;

    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT2" | "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT4" | "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "TIMESTAMP" | "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(|t| Value::from(t.to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_extracts_total_cost() {
        let re = Regex::new(r"cost=[\d.]+\.\.(\d+\.?\d*)").unwrap();
        let line = "Seq Scan on orders  (cost=0.00..18.50 rows=850 width=36)";
        let captures = re.captures(line).unwrap();
        assert_eq!(captures[1].parse::<f64>().unwrap(), 18.50);
    }

    #[test]
    fn unparseable_plan_line_yields_no_match() {
        let re = Regex::new(r"cost=[\d.]+\.\.(\d+\.?\d*)").unwrap();
        assert!(re.captures("not a plan line").is_none());
    }
}
