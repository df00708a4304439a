//! C1 — SQL Parser/Validator.
//!
//! Parses candidate SQL with the PostgreSQL dialect, enforces SELECT-only,
//! rejects the fixed dangerous-function set, and requires every subquery to
//! itself be a SELECT. Ground: `nocodo-tools/src/postgres_reader/executor.rs`
//! (AST-walk shape) generalized to the exact error taxonomy of
//! `pg_mcp_server/core/sql_validator.py`.

use sqlparser::ast::{Expr, Query, SetExpr, Statement, TableFactor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

/// Case-insensitive, exact bare-name match — the closed dangerous-function
/// set from spec.md §4.1.
const DANGEROUS_FUNCTIONS: &[&str] = &[
    "pg_read_file",
    "pg_write_file",
    "pg_execute",
    "copy",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "set_config",
    "current_setting",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_ls_dir",
    "pg_read_binary_file",
    "pg_stat_file",
];

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Parse(String),
    #[error("Only SELECT statements are allowed, found: {0}")]
    ForbiddenStatement(String),
    #[error("forbidden function call: {0}")]
    ForbiddenFunction(String),
    #[error("subquery must be a SELECT, found: {0}")]
    ForbiddenSubquery(String),
}

fn dialect() -> PostgreSqlDialect {
    PostgreSqlDialect {}
}

/// `validate(sql) -> Result<(), ValidationError>` per spec.md §4.1.
pub fn validate(sql: &str) -> Result<(), ValidationError> {
    let statements =
        Parser::parse_sql(&dialect(), sql).map_err(|e| ValidationError::Parse(e.to_string()))?;

    if statements.len() != 1 {
        return Err(ValidationError::ForbiddenStatement(format!(
            "expected exactly one statement, found {}",
            statements.len()
        )));
    }

    match &statements[0] {
        Statement::Query(query) => validate_query(query),
        other => Err(ValidationError::ForbiddenStatement(statement_kind(other))),
    }
}

fn statement_kind(stmt: &Statement) -> String {
    // sqlparser's Display gives the leading keyword a readable label.
    let text = stmt.to_string();
    text.split_whitespace().next().unwrap_or("unknown").to_string()
}

fn validate_query(query: &Query) -> Result<(), ValidationError> {
    validate_set_expr(&query.body)?;
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            validate_query(&cte.query)?;
        }
    }
    Ok(())
}

fn validate_set_expr(body: &SetExpr) -> Result<(), ValidationError> {
    match body {
        SetExpr::Select(select) => {
            for item in &select.projection {
                match item {
                    sqlparser::ast::SelectItem::UnnamedExpr(e)
                    | sqlparser::ast::SelectItem::ExprWithAlias { expr: e, .. } => {
                        validate_expr(e)?
                    }
                    _ => {}
                }
            }
            for table in &select.from {
                validate_table_factor(&table.relation)?;
                for join in &table.joins {
                    validate_table_factor(&join.relation)?;
                }
            }
            if let Some(selection) = &select.selection {
                validate_expr(selection)?;
            }
            Ok(())
        }
        SetExpr::Query(q) => validate_query(q),
        SetExpr::SetOperation { left, right, .. } => {
            validate_set_expr(left)?;
            validate_set_expr(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) | SetExpr::Insert(_) | SetExpr::Update(_) => Ok(()),
    }
}

fn validate_table_factor(factor: &TableFactor) -> Result<(), ValidationError> {
    match factor {
        TableFactor::Derived { subquery, .. } => validate_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            validate_table_factor(&table_with_joins.relation)?;
            for join in &table_with_joins.joins {
                validate_table_factor(&join.relation)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_expr(expr: &Expr) -> Result<(), ValidationError> {
    match expr {
        Expr::Function(func) => {
            let name = func
                .name
                .0
                .last()
                .map(|ident| ident.value.to_lowercase())
                .unwrap_or_default();
            if DANGEROUS_FUNCTIONS.contains(&name.as_str()) {
                return Err(ValidationError::ForbiddenFunction(name));
            }
            for arg in &func.args {
                if let sqlparser::ast::FunctionArg::Unnamed(
                    sqlparser::ast::FunctionArgExpr::Expr(e),
                ) = arg
                {
                    validate_expr(e)?;
                }
            }
            Ok(())
        }
        Expr::Subquery(q) | Expr::Exists { subquery: q, .. } | Expr::InSubquery { subquery: q, .. } => {
            match &*q.body {
                SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::SetOperation { .. } => {
                    validate_query(q)
                }
                _ => Err(ValidationError::ForbiddenSubquery(q.to_string())),
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            validate_expr(left)?;
            validate_expr(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            validate_expr(expr)
        }
        Expr::Case {
            conditions,
            results,
            else_result,
            ..
        } => {
            for c in conditions {
                validate_expr(c)?;
            }
            for r in results {
                validate_expr(r)?;
            }
            if let Some(e) = else_result {
                validate_expr(e)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// `pretty_print(sql) -> sql`. `sqlparser`'s AST `Display` round-trips to
/// canonical text, so re-parsing and re-printing is a fixed point — the
/// crate carries no separate formatter.
pub fn pretty_print(sql: &str) -> Result<String, ValidationError> {
    let statements =
        Parser::parse_sql(&dialect(), sql).map_err(|e| ValidationError::Parse(e.to_string()))?;
    Ok(statements
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_only_passes() {
        assert!(validate("SELECT id, email FROM users").is_ok());
    }

    #[test]
    fn delete_is_forbidden() {
        let err = validate("DELETE FROM users").unwrap_err();
        assert!(matches!(err, ValidationError::ForbiddenStatement(_)));
    }

    #[test]
    fn dangerous_function_is_rejected() {
        let err = validate("SELECT pg_read_file('/etc/passwd')").unwrap_err();
        match err {
            ValidationError::ForbiddenFunction(name) => assert_eq!(name, "pg_read_file"),
            other => panic!("expected ForbiddenFunction, got {other:?}"),
        }
    }

    #[test]
    fn dangerous_function_nested_in_argument_position_is_rejected() {
        let err = validate("SELECT COUNT(pg_read_file('/etc/passwd')) FROM users").unwrap_err();
        match err {
            ValidationError::ForbiddenFunction(name) => assert_eq!(name, "pg_read_file"),
            other => panic!("expected ForbiddenFunction, got {other:?}"),
        }
    }

    #[test]
    fn select_subquery_is_allowed() {
        assert!(validate("SELECT id FROM users WHERE id IN (SELECT user_id FROM orders)").is_ok());
    }

    #[test]
    fn pretty_print_is_idempotent() {
        let once = pretty_print("select id from users").unwrap();
        let twice = pretty_print(&once).unwrap();
        assert_eq!(once, twice);
    }
}
