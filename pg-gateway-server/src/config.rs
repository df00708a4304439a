//! `GatewayConfig` loading. Ground: `nocodo-api::config::ApiConfig::load`'s
//! shape (`config` crate, `File::from(path)`, tilde/home expansion) combined
//! with `multi_database_settings.py`'s `${VAR}` substitution and
//! single-to-multi database auto-conversion.

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub databases: Vec<DatabaseConfig>,
    pub llm: LlmConfig,
    #[serde(default)]
    pub query_limits: QueryLimitsConfig,
    #[serde(default)]
    pub schema_cache: SchemaCacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default)]
    pub access_policy: Option<AccessPolicyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccessPolicyConfig {
    #[serde(default)]
    pub default_access: Option<String>,
    #[serde(default)]
    pub table_rules: Vec<TableRuleConfig>,
    #[serde(default)]
    pub blocked_tables: Vec<String>,
    #[serde(default)]
    pub require_explain: bool,
    #[serde(default)]
    pub max_explain_cost: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableRuleConfig {
    pub schema: String,
    pub table: String,
    pub access_level: String,
    #[serde(default)]
    pub allowed_columns: Option<Vec<String>>,
    #[serde(default)]
    pub denied_columns: Option<Vec<String>>,
    #[serde(default)]
    pub row_filter: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub use_azure: bool,
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub azure_endpoint: Option<String>,
    #[serde(default)]
    pub azure_deployment: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_seconds: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryLimitsConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default)]
    pub max_explain_cost: Option<f64>,
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

impl Default for QueryLimitsConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_explain_cost: None,
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaCacheConfig {
    #[serde(default)]
    pub eager_load: bool,
    #[serde(default = "default_max_tables_in_context")]
    pub max_tables_in_context: usize,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            eager_load: false,
            max_tables_in_context: default_max_tables_in_context(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub collect_query: bool,
    #[serde(default = "default_true")]
    pub collect_sql: bool,
    #[serde(default = "default_true")]
    pub collect_db: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_query: true,
            collect_sql: true,
            collect_db: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub default_database: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            default_database: None,
        }
    }
}

fn default_port() -> u16 {
    5432
}
fn default_min_connections() -> u32 {
    1
}
fn default_max_connections() -> u32 {
    10
}
fn default_connection_timeout_secs() -> u64 {
    30
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.15
}
fn default_max_rows() -> usize {
    1000
}
fn default_statement_timeout_ms() -> u64 {
    30_000
}
fn default_max_tables_in_context() -> usize {
    50
}
fn default_max_requests() -> u32 {
    60
}
fn default_window_seconds() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    8080
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Message(format!("failed to read config file: {e}")))?;
        let substituted = substitute_env_vars(&raw);

        let mut value: serde_yaml::Value = serde_yaml::from_str(&substituted)
            .map_err(|e| ConfigError::Message(format!("invalid YAML: {e}")))?;
        convert_single_to_multi_database(&mut value);

        let rendered = serde_yaml::to_string(&value)
            .map_err(|e| ConfigError::Message(format!("failed to re-serialize config: {e}")))?;

        let builder = Config::builder()
            .add_source(File::from_str(&rendered, FileFormat::Yaml))
            .build()?;

        builder.try_deserialize()
    }
}

/// Replaces every `${NAME}` token with the value of the matching environment
/// variable, leaving the token untouched if the variable is unset. Ground:
/// `Template.safe_substitute` in `multi_database_settings.py`.
fn substitute_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after_brace = &rest[start + 2..];
        match after_brace.find('}') {
            Some(end) => {
                let name = &after_brace[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after_brace[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// `database:` (single map) -> `databases:` (one-element list), with
/// `server.default_database` set to that entry's name when absent. Ground:
/// `_convert_single_to_multi_database` in `multi_database_settings.py`.
fn convert_single_to_multi_database(value: &mut serde_yaml::Value) {
    let Some(mapping) = value.as_mapping_mut() else {
        return;
    };

    let single_key = serde_yaml::Value::String("database".to_string());
    let Some(single) = mapping.remove(single_key) else {
        return;
    };

    let name = single
        .as_mapping()
        .and_then(|m| m.get(serde_yaml::Value::String("name".to_string())))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    mapping.insert(
        serde_yaml::Value::String("databases".to_string()),
        serde_yaml::Value::Sequence(vec![single]),
    );

    if let Some(name) = name {
        let server_key = serde_yaml::Value::String("server".to_string());
        let server = mapping
            .entry(server_key)
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
        if let Some(server_map) = server.as_mapping_mut() {
            let default_db_key = serde_yaml::Value::String("default_database".to_string());
            if !server_map.contains_key(&default_db_key) {
                server_map.insert(default_db_key, serde_yaml::Value::String(name));
            }
        }
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("pg-gateway/config.yaml")
    } else {
        PathBuf::from("pg-gateway.yaml")
    }
}

/// Converts the `access_level` string field of config into the core enum,
/// keeping the config layer free of a direct `pg_gateway_core` parse
/// dependency beyond this single helper.
pub fn parse_access_level(raw: &str) -> Option<pg_gateway_core::model::AccessLevel> {
    match raw.to_lowercase().as_str() {
        "none" => Some(pg_gateway_core::model::AccessLevel::None),
        "read" => Some(pg_gateway_core::model::AccessLevel::Read),
        "admin" => Some(pg_gateway_core::model::AccessLevel::Admin),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn substitutes_known_env_var() {
        std::env::set_var("PG_GATEWAY_TEST_HOST", "db.internal");
        let out = substitute_env_vars("host: ${PG_GATEWAY_TEST_HOST}");
        assert_eq!(out, "host: db.internal");
        std::env::remove_var("PG_GATEWAY_TEST_HOST");
    }

    #[test]
    fn leaves_unset_var_untouched() {
        std::env::remove_var("PG_GATEWAY_TEST_UNSET");
        let out = substitute_env_vars("host: ${PG_GATEWAY_TEST_UNSET}");
        assert_eq!(out, "host: ${PG_GATEWAY_TEST_UNSET}");
    }

    #[test]
    fn converts_single_database_to_multi() {
        let mut value: serde_yaml::Value = serde_yaml::from_str(
            r#"
database:
  name: primary
  host: localhost
llm:
  api_key: x
"#,
        )
        .unwrap();
        convert_single_to_multi_database(&mut value);

        let mapping = value.as_mapping().unwrap();
        assert!(mapping.contains_key(serde_yaml::Value::String("databases".to_string())));
        assert!(!mapping.contains_key(serde_yaml::Value::String("database".to_string())));

        let server = mapping
            .get(serde_yaml::Value::String("server".to_string()))
            .unwrap();
        let default_db = server
            .as_mapping()
            .unwrap()
            .get(serde_yaml::Value::String("default_database".to_string()))
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(default_db, "primary");
    }

    #[test]
    fn loads_full_config_from_file() {
        std::env::set_var("PG_GATEWAY_TEST_PASSWORD", "hunter2");
        let file = write_config(
            r#"
databases:
  - name: primary
    host: localhost
    database: app
    user: app_user
    password: "${PG_GATEWAY_TEST_PASSWORD}"
llm:
  api_key: sk-test
server:
  port: 9090
"#,
        );

        let config = GatewayConfig::load(file.path()).expect("config should load");
        assert_eq!(config.databases.len(), 1);
        assert_eq!(config.databases[0].password, "hunter2");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.query_limits.max_rows, default_max_rows());

        std::env::remove_var("PG_GATEWAY_TEST_PASSWORD");
    }
}
