//! C9 — Query Pipeline.
//!
//! The linear state machine of resolve-db → admit → schema-present → draft
//! → validate → pretty-print → execute → sanity → respond. Ground:
//! `pg_mcp_server/core/query_processor.py::QueryProcessor.process_query`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use pg_gateway_core::error::GatewayError;
use pg_gateway_core::metrics::{standard, MetricsCollector, MetricsTimer};
use pg_gateway_core::model::{QueryRequest, QueryResponse};
use pg_gateway_core::rate_limiter::RateLimiter;
use pg_gateway_core::registry::ExecutorRegistry;
use pg_gateway_core::schema_cache::SchemaCache;
use pg_gateway_core::validator;

use crate::oracles::{ResultSanityOracle, SqlDraftingOracle};

const DEFAULT_MAX_ROWS: usize = 1000;
const DEFAULT_SCHEMA_CONTEXT_TABLE_LIMIT: usize = 50;

/// A failed pipeline run. Identical shape to `GatewayError` but kept as its
/// own type so the HTTP layer doesn't need to reach into pipeline internals
/// to decide what to log versus what to return.
pub type QueryFault = GatewayError;

pub struct QueryPipeline {
    registry: Arc<ExecutorRegistry>,
    rate_limiter: Arc<RateLimiter>,
    schema_caches: HashMap<String, Arc<SchemaCache>>,
    drafting_oracle: Arc<SqlDraftingOracle>,
    sanity_oracle: Arc<ResultSanityOracle>,
    metrics: Arc<MetricsCollector>,
    max_rows: usize,
    schema_context_table_limit: usize,
}

impl QueryPipeline {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        rate_limiter: Arc<RateLimiter>,
        schema_caches: HashMap<String, Arc<SchemaCache>>,
        drafting_oracle: Arc<SqlDraftingOracle>,
        sanity_oracle: Arc<ResultSanityOracle>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            schema_caches,
            drafting_oracle,
            sanity_oracle,
            metrics,
            max_rows: DEFAULT_MAX_ROWS,
            schema_context_table_limit: DEFAULT_SCHEMA_CONTEXT_TABLE_LIMIT,
        }
    }

    /// Overrides the row cap and schema-context table cap from
    /// `QueryLimitsConfig`/`SchemaCacheConfig`; both default to the values
    /// above when left unset.
    pub fn with_limits(mut self, max_rows: usize, schema_context_table_limit: usize) -> Self {
        self.max_rows = max_rows;
        self.schema_context_table_limit = schema_context_table_limit;
        self
    }

    /// Runs the full pipeline for one request. `deadline` bounds every
    /// suspension point (schema fetch, oracle calls, execute); a breach at
    /// any of them maps to `GatewayError::QueryTimeout`.
    pub async fn process(
        &self,
        request: QueryRequest,
        deadline: Option<Instant>,
    ) -> Result<QueryResponse, QueryFault> {
        let pipeline_timer = MetricsTimer::start(&self.metrics, standard::QUERY_DURATION_MS, vec![]);
        self.metrics.increment(standard::QUERY_TOTAL, 1.0, &[]);

        match self.run(request, deadline).await {
            Ok(response) => {
                self.metrics.increment(standard::QUERY_SUCCESS, 1.0, &[]);
                drop(pipeline_timer);
                Ok(response)
            }
            Err(fault) => {
                self.metrics.increment(standard::QUERY_ERROR, 1.0, &[]);
                drop(pipeline_timer);
                Err(fault)
            }
        }
    }

    async fn run(
        &self,
        request: QueryRequest,
        deadline: Option<Instant>,
    ) -> Result<QueryResponse, QueryFault> {
        // resolve-db
        let database = self.registry.resolve_default(request.database.as_deref())?;
        let db_label: [(&str, &str); 1] = [("db", database.as_str())];

        // admit
        let decision = self.rate_limiter.probe(&database);
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                message: format!("rate limit exceeded for database '{database}'"),
                retry_after_secs: decision.retry_after_secs.unwrap_or(0),
                suggestion: Some(format!(
                    "Retry after {} seconds",
                    decision.retry_after_secs.unwrap_or(0)
                )),
            });
        }

        // schema-present
        let schema_cache = self.schema_caches.get(&database).ok_or_else(|| {
            GatewayError::SchemaNotLoaded {
                message: format!("no schema cache registered for '{database}'"),
                suggestion: Some("Please restart the server to load schema".to_string()),
            }
        })?;
        let snapshot = schema_cache.current().ok_or_else(|| GatewayError::SchemaNotLoaded {
            message: format!("schema for '{database}' has not been loaded yet"),
            suggestion: Some("Please restart the server to load schema".to_string()),
        })?;
        let schema_context = snapshot.to_context(self.schema_context_table_limit);

        // draft
        self.metrics.increment(standard::SQL_GENERATION_TOTAL, 1.0, &db_label);
        let draft_timer = MetricsTimer::start(&self.metrics, standard::SQL_GENERATION_DURATION, label_vec(&database));
        let drafted_sql = match with_deadline(deadline, self.drafting_oracle.draft(&request.question, &schema_context)).await {
            Ok(sql) => {
                drop(draft_timer);
                self.metrics.increment(standard::SQL_GENERATION_SUCCESS, 1.0, &db_label);
                sql
            }
            Err(fault) => {
                drop(draft_timer);
                self.metrics.increment(standard::SQL_GENERATION_ERROR, 1.0, &db_label);
                return Err(fault);
            }
        };

        // validate
        self.metrics.increment(standard::VALIDATION_TOTAL, 1.0, &db_label);
        let validate_timer = MetricsTimer::start(&self.metrics, standard::VALIDATION_DURATION, label_vec(&database));
        if let Err(e) = validator::validate(&drafted_sql) {
            drop(validate_timer);
            self.metrics.increment(standard::VALIDATION_FAILED, 1.0, &db_label);
            return Err(GatewayError::SqlValidationFailed {
                message: e.to_string(),
                sql: drafted_sql.clone(),
                suggestion: Some(
                    "This system only supports SELECT queries. Please rephrase your query.".to_string(),
                ),
            });
        }
        drop(validate_timer);
        self.metrics.increment(standard::VALIDATION_SUCCESS, 1.0, &db_label);

        // pretty-print
        let pretty_sql = validator::pretty_print(&drafted_sql).map_err(|e| GatewayError::SqlValidationFailed {
            message: e.to_string(),
            sql: drafted_sql.clone(),
            suggestion: Some(
                "This system only supports SELECT queries. Please rephrase your query.".to_string(),
            ),
        })?;

        // execute
        let executor = self.registry.get(&database).ok_or_else(|| {
            GatewayError::UnknownDatabase {
                message: format!("database '{database}' vanished from the registry mid-request"),
                suggestion: Some("Check the 'databases' list for a valid name".to_string()),
            }
        })?;
        self.metrics.increment(standard::SQL_EXECUTION_TOTAL, 1.0, &db_label);
        let execute_timer = MetricsTimer::start(&self.metrics, standard::SQL_EXECUTION_DURATION, label_vec(&database));
        let started = Instant::now();
        let (rows, columns, _elapsed_from_executor) =
            match with_deadline(deadline, executor.execute(&pretty_sql, self.max_rows)).await {
                Ok(result) => {
                    drop(execute_timer);
                    self.metrics.increment(standard::SQL_EXECUTION_SUCCESS, 1.0, &db_label);
                    result
                }
                Err(fault) => {
                    drop(execute_timer);
                    self.metrics.increment(standard::SQL_EXECUTION_ERROR, 1.0, &db_label);
                    return Err(fault);
                }
            };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        // sanity
        let (plausible, reason) = with_deadline(
            deadline,
            run_sanity_check(&self.sanity_oracle, &request.question, &pretty_sql, &rows),
        )
        .await?;
        if !plausible {
            return Err(GatewayError::ResultImplausible {
                message: "result sanity check failed".to_string(),
                sql: pretty_sql,
                reason,
                suggestion: Some(
                    "The generated SQL may have misunderstood. Please try describing your query in more \
                     detail, or provide table and field names."
                        .to_string(),
                ),
            });
        }

        // respond
        Ok(QueryResponse {
            sql: pretty_sql,
            row_count: rows.len(),
            rows,
            execution_time_ms,
            columns,
            database,
        })
    }
}

async fn run_sanity_check(
    oracle: &ResultSanityOracle,
    question: &str,
    sql: &str,
    rows: &[indexmap::IndexMap<String, serde_json::Value>],
) -> Result<(bool, Option<String>), GatewayError> {
    Ok(oracle.check(question, sql, rows).await)
}

/// Wraps a suspension point in the caller's deadline, if any. Any error
/// unrelated to the deadline passes through unchanged; a timeout collapses
/// to `GatewayError::QueryTimeout` per spec.md §5's cancellation policy.
async fn with_deadline<T>(
    deadline: Option<Instant>,
    fut: impl std::future::Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    match deadline {
        None => fut.await,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, fut).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::QueryTimeout {
                    message: "request exceeded its caller-supplied deadline".to_string(),
                    suggestion: Some(
                        "Narrow the query or try again when the database is less busy".to_string(),
                    ),
                }),
            }
        }
    }
}

/// Builds the `db`-labeled vec `MetricsTimer` wants, alongside the plain
/// slice form `MetricsCollector::increment` takes.
fn label_vec(database: &str) -> Vec<(&'static str, String)> {
    vec![("db", database.to_string())]
}
