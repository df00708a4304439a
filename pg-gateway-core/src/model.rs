use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Wraps a credential so `Debug`/logging never prints it, mirroring how the
/// teacher crate keeps API keys out of its config `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseIdentity {
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Secret,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
    pub statement_timeout_ms: u64,
}

impl DatabaseIdentity {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user,
            self.password.expose(),
            self.host,
            self.port,
            self.database
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    Read,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRule {
    pub schema: String,
    pub table: String,
    pub access_level: AccessLevel,
    pub allowed_columns: Option<HashSet<String>>,
    pub denied_columns: Option<HashSet<String>>,
    pub row_filter: Option<String>,
    pub comment: Option<String>,
}

impl TableRule {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// allowed \ denied, per spec.md §3's TableRule invariant.
    pub fn effective_columns(&self, all_columns: &[String]) -> Option<HashSet<String>> {
        match (&self.allowed_columns, &self.denied_columns) {
            (None, None) => None,
            (Some(allowed), None) => Some(allowed.clone()),
            (None, Some(denied)) => {
                Some(all_columns.iter().filter(|c| !denied.contains(*c)).cloned().collect())
            }
            (Some(allowed), Some(denied)) => {
                Some(allowed.difference(denied).cloned().collect())
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub default_access: Option<AccessLevel>,
    pub table_rules: Vec<TableRule>,
    pub blocked_tables: HashSet<String>,
    pub require_explain: bool,
    pub max_explain_cost: Option<f64>,
}

impl AccessPolicy {
    fn key(schema: &str, table: &str) -> String {
        format!("{schema}.{table}")
    }

    pub fn table_rule(&self, schema: &str, table: &str) -> Option<&TableRule> {
        self.table_rules
            .iter()
            .find(|r| r.schema == schema && r.table == table)
    }

    pub fn is_table_blocked(&self, schema: &str, table: &str) -> bool {
        self.blocked_tables.contains(&Self::key(schema, table))
            || self.blocked_tables.contains(table)
    }

    pub fn row_filter(&self, schema: &str, table: &str) -> Option<&str> {
        self.table_rule(schema, table)
            .and_then(|r| r.row_filter.as_deref())
    }

    pub fn denied_columns(&self, schema: &str, table: &str) -> Option<&HashSet<String>> {
        self.table_rule(schema, table)
            .and_then(|r| r.denied_columns.as_ref())
    }

    pub fn allowed_columns(&self, schema: &str, table: &str) -> Option<&HashSet<String>> {
        self.table_rule(schema, table)
            .and_then(|r| r.allowed_columns.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Table,
    View,
    MaterializedView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub foreign_key_ref: Option<String>,
    pub default: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
    pub index_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    pub constraint_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    pub comment: Option<String>,
}

impl TableDescriptor {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: HashMap<String, TableDescriptor>,
    pub enums: HashMap<String, Vec<String>>,
}

impl SchemaSnapshot {
    pub fn get_table(&self, schema: &str, table: &str) -> Option<&TableDescriptor> {
        self.tables.get(&format!("{schema}.{table}"))
    }

    pub fn search_tables(&self, needle: &str) -> Vec<&TableDescriptor> {
        let needle = needle.to_lowercase();
        self.tables
            .values()
            .filter(|t| t.name.to_lowercase().contains(&needle))
            .collect()
    }

    /// Compact textual schema used as the drafting oracle's sole context,
    /// capped at `limit` tables with a truncation notice when clipped.
    pub fn to_context(&self, limit: usize) -> String {
        let mut tables: Vec<&TableDescriptor> = self.tables.values().collect();
        tables.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));

        let mut out = String::from("# Database schema\n\n");
        for table in tables.iter().take(limit) {
            out.push_str(&format!("## {} ({:?})\n", table.qualified_name(), table.kind));
            for col in &table.columns {
                let mut markers = Vec::new();
                if col.is_primary_key {
                    markers.push("PK");
                }
                if col.is_foreign_key {
                    markers.push("FK");
                }
                let marker_str = if markers.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", markers.join(","))
                };
                out.push_str(&format!("- {} {}{}\n", col.name, col.data_type, marker_str));
            }
            out.push('\n');
        }
        if tables.len() > limit {
            out.push_str(&format!(
                "... ({} additional tables truncated)\n",
                tables.len() - limit
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub sql: String,
    pub rows: Vec<IndexMap<String, serde_json::Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub columns: Vec<ColumnMeta>,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    pub database: String,
    pub has_policy: bool,
    pub blocked_tables: Vec<String>,
}

/// Reference instant used by the rate limiter and pipeline deadlines.
pub type Clock = Instant;
