//! C3 — Schema Introspection Cache.
//!
//! One-shot load of tables/columns/indexes/FKs/enums per database, served as
//! the drafting context. Ground: `pg_mcp_server/core/schema_cache.py`
//! (`SchemaCache.load_schema`) and `nocodo-tools/src/postgres_reader
//! /mod.rs::build_reflection_query`'s catalog-query shape, generalized to
//! load an entire database at once.

use std::sync::{Arc, RwLock};

use sqlx::{Connection, PgConnection, Row};
use tracing::info;

use crate::error::GatewayError;
use crate::model::{ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, SchemaSnapshot, TableDescriptor, TableKind};
use crate::retry::retry_on_db_error;

const TABLES_QUERY: &str = r#"
SELECT table_schema, table_name, table_type,
       obj_description(format('%s.%s', table_schema, table_name)::regclass, 'pg_class') AS comment
FROM information_schema.tables
WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
ORDER BY table_schema, table_name
"#;

const COLUMNS_QUERY: &str = r#"
SELECT c.column_name, c.data_type, c.is_nullable, c.column_default, c.ordinal_position,
       col_description(format('%s.%s', c.table_schema, c.table_name)::regclass, c.ordinal_position) AS comment
FROM information_schema.columns c
WHERE c.table_schema = $1 AND c.table_name = $2
ORDER BY c.ordinal_position
"#;

const PRIMARY_KEY_QUERY: &str = r#"
SELECT kcu.column_name
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
  ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1 AND tc.table_name = $2
"#;

const FOREIGN_KEYS_QUERY: &str = r#"
SELECT kcu.column_name, ccu.table_schema AS ref_schema, ccu.table_name AS ref_table,
       ccu.column_name AS ref_column, tc.constraint_name
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
  ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
JOIN information_schema.constraint_column_usage ccu
  ON tc.constraint_name = ccu.constraint_name AND tc.table_schema = ccu.table_schema
WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1 AND tc.table_name = $2
"#;

const INDEXES_QUERY: &str = r#"
SELECT i.relname AS index_name, a.attname AS column_name, ix.indisunique, ix.indisprimary, am.amname AS index_type
FROM pg_index ix
JOIN pg_class t ON t.oid = ix.indrelid
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
JOIN pg_am am ON am.oid = i.relam
JOIN unnest(ix.indkey) WITH ORDINALITY AS cols(attnum, ord) ON true
JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = cols.attnum
WHERE n.nspname = $1 AND t.relname = $2
ORDER BY i.relname, cols.ord
"#;

const ENUMS_QUERY: &str = r#"
SELECT t.typname, e.enumlabel, e.enumsortorder
FROM pg_type t
JOIN pg_enum e ON t.oid = e.enumtypid
ORDER BY t.typname, e.enumsortorder
"#;

pub struct SchemaCache {
    connection_string: String,
    snapshot: RwLock<Option<Arc<SchemaSnapshot>>>,
}

impl SchemaCache {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            snapshot: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<SchemaSnapshot>> {
        self.snapshot.read().expect("schema cache lock poisoned").clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// `load(identity) -> snapshot`. On failure the previous snapshot (if
    /// any) is retained; the new snapshot only ever replaces the old one as
    /// a single atomic pointer swap (spec.md §3, §8 invariant 5).
    pub async fn load(&self) -> Result<Arc<SchemaSnapshot>, GatewayError> {
        let conn_str = self.connection_string.clone();
        let snapshot = retry_on_db_error(
            |e: &sqlx::Error| matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut),
            || {
                let conn_str = conn_str.clone();
                async move { load_snapshot(&conn_str).await }
            },
        )
        .await
        .map_err(|e| GatewayError::SchemaNotLoaded {
            message: format!("failed to load schema: {e}"),
            suggestion: Some("Please restart the server to load schema".to_string()),
        })?;

        let snapshot = Arc::new(snapshot);
        *self.snapshot.write().expect("schema cache lock poisoned") = Some(snapshot.clone());
        info!(tables = snapshot.tables.len(), "schema snapshot loaded");
        Ok(snapshot)
    }
}

async fn load_snapshot(connection_string: &str) -> Result<SchemaSnapshot, sqlx::Error> {
    // Dedicated one-shot connection, decoupled from C4's pools.
    let mut conn = PgConnection::connect(connection_string).await?;

    let table_rows = sqlx::query(TABLES_QUERY).fetch_all(&mut conn).await?;
    let mut tables = std::collections::HashMap::new();

    for row in table_rows {
        let schema: String = row.try_get("table_schema")?;
        let name: String = row.try_get("table_name")?;
        let table_type: String = row.try_get("table_type")?;
        let comment: Option<String> = row.try_get("comment").unwrap_or(None);

        let kind = match table_type.as_str() {
            "VIEW" => TableKind::View,
            "MATERIALIZED VIEW" => TableKind::MaterializedView,
            _ => TableKind::Table,
        };

        let pk_columns: std::collections::HashSet<String> =
            sqlx::query(PRIMARY_KEY_QUERY)
                .bind(&schema)
                .bind(&name)
                .fetch_all(&mut conn)
                .await?
                .into_iter()
                .map(|r| r.try_get::<String, _>("column_name"))
                .collect::<Result<_, _>>()?;

        let fk_rows = sqlx::query(FOREIGN_KEYS_QUERY)
            .bind(&schema)
            .bind(&name)
            .fetch_all(&mut conn)
            .await?;
        let mut fk_by_column: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        let mut foreign_keys = Vec::new();
        for fk_row in &fk_rows {
            let column: String = fk_row.try_get("column_name")?;
            let ref_schema: String = fk_row.try_get("ref_schema")?;
            let ref_table: String = fk_row.try_get("ref_table")?;
            let ref_column: String = fk_row.try_get("ref_column")?;
            let constraint_name: String = fk_row.try_get("constraint_name")?;
            fk_by_column.insert(
                column.clone(),
                format!("{ref_schema}.{ref_table}.{ref_column}"),
            );
            foreign_keys.push(ForeignKeyDescriptor {
                column,
                referenced_table: format!("{ref_schema}.{ref_table}"),
                referenced_column: ref_column,
                constraint_name,
            });
        }

        let column_rows = sqlx::query(COLUMNS_QUERY)
            .bind(&schema)
            .bind(&name)
            .fetch_all(&mut conn)
            .await?;
        let mut columns = Vec::new();
        for col_row in column_rows {
            let column_name: String = col_row.try_get("column_name")?;
            let data_type: String = col_row.try_get("data_type")?;
            let is_nullable: String = col_row.try_get("is_nullable")?;
            let default: Option<String> = col_row.try_get("column_default").unwrap_or(None);
            let comment: Option<String> = col_row.try_get("comment").unwrap_or(None);

            columns.push(ColumnDescriptor {
                is_primary_key: pk_columns.contains(&column_name),
                is_foreign_key: fk_by_column.contains_key(&column_name),
                foreign_key_ref: fk_by_column.get(&column_name).cloned(),
                nullable: is_nullable == "YES",
                name: column_name,
                data_type,
                default,
                comment,
            });
        }

        let index_rows = sqlx::query(INDEXES_QUERY)
            .bind(&schema)
            .bind(&name)
            .fetch_all(&mut conn)
            .await?;
        let mut indexes_by_name: indexmap::IndexMap<String, IndexDescriptor> = indexmap::IndexMap::new();
        for idx_row in index_rows {
            let index_name: String = idx_row.try_get("index_name")?;
            let column_name: String = idx_row.try_get("column_name")?;
            let is_unique: bool = idx_row.try_get("indisunique")?;
            let is_primary: bool = idx_row.try_get("indisprimary")?;
            let index_type: String = idx_row.try_get("index_type")?;

            indexes_by_name
                .entry(index_name.clone())
                .or_insert_with(|| IndexDescriptor {
                    name: index_name,
                    columns: vec![],
                    is_unique,
                    is_primary,
                    index_type,
                })
                .columns
                .push(column_name);
        }

        let table = TableDescriptor {
            schema: schema.clone(),
            name: name.clone(),
            kind,
            columns,
            indexes: indexes_by_name.into_values().collect(),
            foreign_keys,
            comment,
        };
        tables.insert(table.qualified_name(), table);
    }

    let enum_rows = sqlx::query(ENUMS_QUERY).fetch_all(&mut conn).await?;
    let mut enums: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for row in enum_rows {
        let type_name: String = row.try_get("typname")?;
        let label: String = row.try_get("enumlabel")?;
        enums.entry(type_name).or_default().push(label);
    }

    let _ = conn.close().await;

    Ok(SchemaSnapshot { tables, enums })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unloaded() {
        let cache = SchemaCache::new("postgres://localhost/test");
        assert!(!cache.is_loaded());
        assert!(cache.current().is_none());
    }
}
