//! The five HTTP routes wrapping the tool surface of the pipeline: `POST
//! /query`, `GET /databases`, `GET /health`, `GET /metrics`, `GET
//! /rate-limit`. Ground: `nocodo-api::handlers`'s one-function-per-route
//! shape, generalized from actix `#[get]`/`#[post]` macros tied to a
//! sqlite connection to plain `web::Data<AppState>` handlers.

use std::sync::Arc;

use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;

use pg_gateway_core::error::GatewayError;
use pg_gateway_core::metrics::MetricsCollector;
use pg_gateway_core::model::QueryRequest;
use pg_gateway_core::rate_limiter::RateLimiter;
use pg_gateway_core::registry::ExecutorRegistry;
use pg_gateway_core::schema_cache::SchemaCache;
use pg_gateway_pipeline::QueryPipeline;

pub struct AppState {
    pub pipeline: Arc<QueryPipeline>,
    pub registry: Arc<ExecutorRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub schema_caches: std::collections::HashMap<String, Arc<SchemaCache>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation_details: Option<String>,
}

fn error_response(err: GatewayError) -> HttpResponse {
    let status = err.http_status();
    let body = ErrorBody {
        error: err.kind().to_string(),
        message: err.message().to_string(),
        suggestion: err.suggestion().map(|s| s.to_string()),
        sql: err.sql().map(|s| s.to_string()),
        validation_details: err.validation_details().map(|s| s.to_string()),
    };
    HttpResponse::build(
        actix_web::http::StatusCode::from_u16(status).unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR),
    )
    .json(body)
}

#[post("/query")]
pub async fn query(state: web::Data<AppState>, request: web::Json<QueryRequest>) -> HttpResponse {
    match state.pipeline.process(request.into_inner(), None).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct DatabasesResponse {
    databases: Vec<String>,
    default: Option<String>,
}

#[get("/databases")]
pub async fn databases(state: web::Data<AppState>) -> HttpResponse {
    let list = state.registry.list();
    let default = state.registry.resolve_default(None).ok();
    HttpResponse::Ok().json(DatabasesResponse {
        databases: list,
        default,
    })
}

#[derive(Debug, Serialize)]
struct DatabaseHealth {
    name: String,
    reachable: bool,
    schema_loaded: bool,
    table_count: usize,
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let statuses: Vec<DatabaseHealth> = state
        .registry
        .list()
        .into_iter()
        .map(|name| {
            let reachable = state.registry.get(&name).is_some();
            let cache = state.schema_caches.get(&name);
            let snapshot = cache.and_then(|c| c.current());
            DatabaseHealth {
                name,
                reachable,
                schema_loaded: snapshot.is_some(),
                table_count: snapshot.map(|s| s.tables.len()).unwrap_or(0),
            }
        })
        .collect();
    HttpResponse::Ok().json(json!({ "databases": statuses }))
}

#[get("/metrics")]
pub async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.metrics.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct RateLimitQuery {
    database: Option<String>,
}

#[get("/rate-limit")]
pub async fn rate_limit(state: web::Data<AppState>, query: web::Query<RateLimitQuery>) -> HttpResponse {
    let database = match query.into_inner().database.or_else(|| state.registry.resolve_default(None).ok()) {
        Some(db) => db,
        None => {
            return HttpResponse::NotFound().json(json!({ "error": "no database specified and none registered" }));
        }
    };
    HttpResponse::Ok().json(state.rate_limiter.usage(&database))
}
