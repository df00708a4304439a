mod config;
mod handlers;
mod helpers;

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pg_gateway_core::metrics::{MetricsCollector, MetricsConfig as CoreMetricsConfig};
use pg_gateway_core::model::{AccessPolicy, DatabaseIdentity, Secret, TableRule};
use pg_gateway_core::rate_limiter::{RateLimitConfig as CoreRateLimitConfig, RateLimiter};
use pg_gateway_core::registry::ExecutorRegistry;
use pg_gateway_core::schema_cache::SchemaCache;
use pg_gateway_pipeline::{QueryPipeline, ResultSanityOracle, SqlDraftingOracle};

use crate::config::{AccessPolicyConfig, DatabaseConfig, GatewayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    log_file: Option<String>,
}

#[actix_web::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_tracing(args.log_file.as_deref());

    let config_path = args
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let gateway_config =
        GatewayConfig::load(&config_path).map_err(|e| anyhow::anyhow!("failed to load config from {}: {e}", config_path.display()))?;
    info!(path = %config_path.display(), "loaded gateway config");

    let registry = Arc::new(ExecutorRegistry::new());
    let mut schema_caches: HashMap<String, Arc<SchemaCache>> = HashMap::new();

    for db in &gateway_config.databases {
        let identity = build_identity(db, gateway_config.query_limits.statement_timeout_ms);
        let policy = db.access_policy.as_ref().map(build_access_policy);

        registry.add(identity.clone(), policy).await?;

        let cache = Arc::new(SchemaCache::new(identity.connection_string()));
        if gateway_config.schema_cache.eager_load {
            if let Err(e) = cache.load().await {
                warn!(database = %db.name, error = %e, "eager schema load failed, will retry lazily");
            }
        }
        schema_caches.insert(db.name.clone(), cache);
    }

    if let Some(default_db) = &gateway_config.server.default_database {
        registry.set_default_database(default_db.clone());
    }

    let rate_limiter = Arc::new(RateLimiter::new(CoreRateLimitConfig {
        max_requests: gateway_config.rate_limit.max_requests,
        window_seconds: gateway_config.rate_limit.window_seconds,
        enabled: gateway_config.rate_limit.enabled,
    }));

    let metrics = Arc::new(MetricsCollector::new(CoreMetricsConfig {
        enabled: gateway_config.metrics.enabled,
        collect_query: gateway_config.metrics.collect_query,
        collect_sql: gateway_config.metrics.collect_sql,
        collect_db: gateway_config.metrics.collect_db,
    }));

    let llm_client = helpers::llm::create_llm_client(&gateway_config.llm)?;
    let model = gateway_config
        .llm
        .model
        .clone()
        .unwrap_or_else(|| pg_gateway_llm::models::openai::GPT_4O_MINI_ID.to_string());
    let drafting_oracle = Arc::new(SqlDraftingOracle::new(llm_client.clone(), model.clone()));
    let sanity_oracle = Arc::new(ResultSanityOracle::new(llm_client, model));

    let pipeline = Arc::new(
        QueryPipeline::new(
            registry.clone(),
            rate_limiter.clone(),
            schema_caches.clone(),
            drafting_oracle,
            sanity_oracle,
            metrics.clone(),
        )
        .with_limits(
            gateway_config.query_limits.max_rows,
            gateway_config.schema_cache.max_tables_in_context,
        ),
    );

    let app_state = web::Data::new(handlers::AppState {
        pipeline,
        registry: registry.clone(),
        rate_limiter,
        metrics,
        schema_caches,
    });

    let bind_addr = (gateway_config.server.host.clone(), gateway_config.server.port);
    info!(host = %bind_addr.0, port = bind_addr.1, "starting pg-gateway-server");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .service(handlers::query)
            .service(handlers::databases)
            .service(handlers::health)
            .service(handlers::metrics)
            .service(handlers::rate_limit)
    })
    .bind(bind_addr)?
    .run();

    let result = server.await;
    registry.close_all().await;
    result.map_err(|e| anyhow::anyhow!("server error: {e}"))
}

fn build_identity(db: &DatabaseConfig, statement_timeout_ms: u64) -> DatabaseIdentity {
    DatabaseIdentity {
        name: db.name.clone(),
        description: db.description.clone(),
        host: db.host.clone(),
        port: db.port,
        database: db.database.clone(),
        user: db.user.clone(),
        password: Secret::new(db.password.clone()),
        min_connections: db.min_connections,
        max_connections: db.max_connections,
        connection_timeout_secs: db.connection_timeout_secs,
        statement_timeout_ms,
    }
}

fn build_access_policy(cfg: &AccessPolicyConfig) -> AccessPolicy {
    let table_rules = cfg
        .table_rules
        .iter()
        .filter_map(|rule| {
            let access_level = config::parse_access_level(&rule.access_level)?;
            Some(TableRule {
                schema: rule.schema.clone(),
                table: rule.table.clone(),
                access_level,
                allowed_columns: rule
                    .allowed_columns
                    .as_ref()
                    .map(|cols| cols.iter().cloned().collect()),
                denied_columns: rule
                    .denied_columns
                    .as_ref()
                    .map(|cols| cols.iter().cloned().collect()),
                row_filter: rule.row_filter.clone(),
                comment: rule.comment.clone(),
            })
        })
        .collect();

    AccessPolicy {
        default_access: cfg.default_access.as_deref().and_then(config::parse_access_level),
        table_rules,
        blocked_tables: cfg.blocked_tables.iter().cloned().collect(),
        require_explain: cfg.require_explain,
        max_explain_cost: cfg.max_explain_cost,
    }
}

/// Ground: `nocodo-api::main`'s dual-layer tracing setup (stdout + optional
/// non-blocking file layer).
fn init_tracing(log_file: Option<&str>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let file_appender = tracing_appender::rolling::never(
                path.parent().unwrap_or(std::path::Path::new(".")),
                path.file_name().unwrap_or(std::ffi::OsStr::new("pg-gateway.log")),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            std::mem::forget(guard);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(true).with_writer(std::io::stdout))
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
}
