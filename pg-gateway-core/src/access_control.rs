//! C2 — Access-Control Rewriter.
//!
//! Walks the parsed AST (never text-splices SQL), rejects blocked
//! tables/columns, and AND-merges per-table row filters into the enclosing
//! SELECT's WHERE clause. Ground: `pg_mcp_server/core/sql_access_control.py`
//! (`SQLAccessControlRewriter.rewrite_and_validate`).

use std::collections::{HashMap, HashSet};

use sqlparser::ast::{
    BinaryOperator, Expr, Ident, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::AccessPolicy;

#[derive(Debug, Clone)]
pub struct SecurityResult {
    pub ok: bool,
    pub rewritten_sql: Option<String>,
    pub denial_reason: Option<String>,
    pub blocked_tables: Vec<String>,
    pub blocked_columns: Vec<String>,
}

fn dialect() -> PostgreSqlDialect {
    PostgreSqlDialect {}
}

struct Ctx<'a> {
    policy: &'a AccessPolicy,
    cte_names: HashSet<String>,
    blocked_tables: Vec<String>,
    blocked_columns: Vec<String>,
}

/// `rewrite(sql, policy) -> SecurityResult` per spec.md §4.2.
pub fn rewrite(sql: &str, policy: &AccessPolicy) -> SecurityResult {
    let mut statements = match Parser::parse_sql(&dialect(), sql) {
        Ok(s) => s,
        Err(e) => {
            return SecurityResult {
                ok: false,
                rewritten_sql: None,
                denial_reason: Some(e.to_string()),
                blocked_tables: vec![],
                blocked_columns: vec![],
            }
        }
    };

    if statements.len() != 1 {
        return SecurityResult {
            ok: false,
            rewritten_sql: None,
            denial_reason: Some("exactly one statement is required".to_string()),
            blocked_tables: vec![],
            blocked_columns: vec![],
        };
    }

    let query = match &mut statements[0] {
        Statement::Query(q) => q.as_mut(),
        other => {
            return SecurityResult {
                ok: false,
                rewritten_sql: None,
                denial_reason: Some(format!("not a SELECT statement: {other}")),
                blocked_tables: vec![],
                blocked_columns: vec![],
            }
        }
    };

    let mut ctx = Ctx {
        policy,
        cte_names: HashSet::new(),
        blocked_tables: vec![],
        blocked_columns: vec![],
    };

    walk_query(&mut ctx, query);

    ctx.blocked_tables.sort();
    ctx.blocked_tables.dedup();
    ctx.blocked_columns.sort();
    ctx.blocked_columns.dedup();

    if !ctx.blocked_tables.is_empty() || !ctx.blocked_columns.is_empty() {
        let mut reason = String::from("access denied:");
        if !ctx.blocked_tables.is_empty() {
            reason.push_str(&format!(" blocked tables: {}", ctx.blocked_tables.join(", ")));
        }
        if !ctx.blocked_columns.is_empty() {
            reason.push_str(&format!(
                " blocked columns: {}",
                ctx.blocked_columns.join(", ")
            ));
        }
        return SecurityResult {
            ok: false,
            rewritten_sql: None,
            denial_reason: Some(reason),
            blocked_tables: ctx.blocked_tables,
            blocked_columns: ctx.blocked_columns,
        };
    }

    SecurityResult {
        ok: true,
        rewritten_sql: Some(statements[0].to_string()),
        denial_reason: None,
        blocked_tables: vec![],
        blocked_columns: vec![],
    }
}

fn qualify(name: &sqlparser::ast::ObjectName) -> (String, String) {
    let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
    match parts.as_slice() {
        [schema, table] => (schema.clone(), table.clone()),
        [table] => ("public".to_string(), table.clone()),
        _ => (
            "public".to_string(),
            parts.last().cloned().unwrap_or_default(),
        ),
    }
}

fn walk_query(ctx: &mut Ctx, query: &mut Query) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            ctx.cte_names.insert(cte.alias.name.value.clone());
        }
    }
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            walk_query(ctx, &mut cte.query);
        }
    }
    walk_set_expr(ctx, &mut query.body);
}

fn walk_set_expr(ctx: &mut Ctx, body: &mut SetExpr) {
    match body {
        SetExpr::Select(select) => walk_select(ctx, select),
        SetExpr::Query(q) => walk_query(ctx, q),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(ctx, left);
            walk_set_expr(ctx, right);
        }
        _ => {}
    }
}

/// alias/bare-name -> (schema, table), built while scanning this SELECT's
/// own FROM clause (not nested subqueries, which get their own scope).
fn walk_select(ctx: &mut Ctx, select: &mut Select) {
    let mut alias_map: HashMap<String, (String, String)> = HashMap::new();
    let mut ordered_tables: Vec<(String, String)> = Vec::new();
    let mut row_filter_candidates: Vec<(usize, String)> = Vec::new();

    for twj in &mut select.from {
        walk_table_with_joins(
            ctx,
            twj,
            &mut alias_map,
            &mut ordered_tables,
            &mut row_filter_candidates,
        );
    }

    // Row filters are AND-merged in policy order for determinism (spec.md §4.2).
    row_filter_candidates.sort_by_key(|(idx, _)| *idx);
    let mut merged: Option<Expr> = None;
    for (_, filter) in &row_filter_candidates {
        match parse_predicate(filter) {
            Ok(expr) => {
                merged = Some(match merged {
                    None => expr,
                    Some(existing) => and_exprs(existing, expr),
                });
            }
            Err(e) => {
                tracing::warn!(filter = %filter, error = %e, "row filter fragment failed to parse; dropping filter (fail-open, see DESIGN.md)");
            }
        }
    }
    if let Some(filter_expr) = merged {
        select.selection = Some(match select.selection.take() {
            None => filter_expr,
            Some(existing) => and_exprs(existing, filter_expr),
        });
    }

    // Column resolution: explicit qualifier, else the first table in this
    // SELECT's own FROM (the documented ambiguous-column heuristic).
    let default_table = ordered_tables.first().cloned();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                check_expr_columns(ctx, e, &alias_map, &default_table);
            }
            _ => {}
        }
    }
    if let Some(selection) = &select.selection {
        check_expr_columns(ctx, selection, &alias_map, &default_table);
    }

    // Recurse into derived-table subqueries for nested validation/rewrite.
    for twj in &mut select.from {
        recurse_subqueries(ctx, &mut twj.relation);
        for join in &mut twj.joins {
            recurse_subqueries(ctx, &mut join.relation);
        }
    }
}

fn walk_table_with_joins(
    ctx: &mut Ctx,
    twj: &mut TableWithJoins,
    alias_map: &mut HashMap<String, (String, String)>,
    ordered_tables: &mut Vec<(String, String)>,
    row_filter_candidates: &mut Vec<(usize, String)>,
) {
    register_table_factor(
        ctx,
        &twj.relation,
        alias_map,
        ordered_tables,
        row_filter_candidates,
    );
    for join in &twj.joins {
        register_table_factor(
            ctx,
            &join.relation,
            alias_map,
            ordered_tables,
            row_filter_candidates,
        );
    }
}

fn register_table_factor(
    ctx: &mut Ctx,
    factor: &TableFactor,
    alias_map: &mut HashMap<String, (String, String)>,
    ordered_tables: &mut Vec<(String, String)>,
    row_filter_candidates: &mut Vec<(usize, String)>,
) {
    if let TableFactor::Table { name, alias, .. } = factor {
        let bare = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
        if ctx.cte_names.contains(&bare) {
            // Bound by this statement's WITH clause: a derived reference,
            // not a catalog table, so policy checks do not apply to it.
            return;
        }

        let (schema, table) = qualify(name);
        if ctx.policy.is_table_blocked(&schema, &table) {
            ctx.blocked_tables.push(format!("{schema}.{table}"));
        }

        let key = alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| bare.clone());
        alias_map.insert(key, (schema.clone(), table.clone()));
        alias_map.insert(bare, (schema.clone(), table.clone()));
        ordered_tables.push((schema.clone(), table.clone()));

        if let Some(rule_idx) = ctx
            .policy
            .table_rules
            .iter()
            .position(|r| r.schema == schema && r.table == table)
        {
            if let Some(filter) = ctx.policy.table_rules[rule_idx].row_filter.as_ref() {
                row_filter_candidates.push((rule_idx, filter.clone()));
            }
        }
    }
}

fn recurse_subqueries(ctx: &mut Ctx, factor: &mut TableFactor) {
    match factor {
        TableFactor::Derived { subquery, .. } => walk_query(ctx, subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            let mut empty_alias = HashMap::new();
            let mut empty_order = Vec::new();
            let mut empty_filters = Vec::new();
            walk_table_with_joins(
                ctx,
                table_with_joins,
                &mut empty_alias,
                &mut empty_order,
                &mut empty_filters,
            );
            recurse_subqueries(ctx, &mut table_with_joins.relation);
        }
        _ => {}
    }
}

fn check_expr_columns(
    ctx: &mut Ctx,
    expr: &Expr,
    alias_map: &HashMap<String, (String, String)>,
    default_table: &Option<(String, String)>,
) {
    match expr {
        Expr::Identifier(ident) => {
            if let Some((schema, table)) = default_table {
                check_column(ctx, schema, table, &ident.value);
            }
        }
        Expr::CompoundIdentifier(parts) => {
            if let [qualifier, column] = &parts[..] {
                if let Some((schema, table)) = alias_map.get(&qualifier.value) {
                    check_column(ctx, schema, table, &column.value);
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            check_expr_columns(ctx, left, alias_map, default_table);
            check_expr_columns(ctx, right, alias_map, default_table);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            check_expr_columns(ctx, expr, alias_map, default_table)
        }
        Expr::Function(func) => {
            for arg in &func.args {
                if let sqlparser::ast::FunctionArg::Unnamed(
                    sqlparser::ast::FunctionArgExpr::Expr(e),
                ) = arg
                {
                    check_expr_columns(ctx, e, alias_map, default_table);
                }
            }
        }
        _ => {}
    }
}

fn check_column(ctx: &mut Ctx, schema: &str, table: &str, column: &str) {
    if ctx.cte_names.contains(table) {
        return;
    }
    if let Some(denied) = ctx.policy.denied_columns(schema, table) {
        if denied.contains(column) {
            ctx.blocked_columns
                .push(format!("{schema}.{table}.{column}"));
            return;
        }
    }
    if let Some(allowed) = ctx.policy.allowed_columns(schema, table) {
        if !allowed.contains(column) {
            ctx.blocked_columns
                .push(format!("{schema}.{table}.{column}"));
        }
    }
}

fn parse_predicate(filter: &str) -> Result<Expr, sqlparser::parser::ParserError> {
    let probe = format!("SELECT * FROM t WHERE {filter}");
    let statements = Parser::parse_sql(&dialect(), &probe)?;
    match statements.into_iter().next() {
        Some(Statement::Query(q)) => match *q.body {
            SetExpr::Select(select) => select.selection.ok_or_else(|| {
                sqlparser::parser::ParserError::ParserError(
                    "row filter did not parse to a predicate".to_string(),
                )
            }),
            _ => Err(sqlparser::parser::ParserError::ParserError(
                "row filter probe did not yield a SELECT".to_string(),
            )),
        },
        _ => Err(sqlparser::parser::ParserError::ParserError(
            "row filter probe did not yield a query".to_string(),
        )),
    }
}

fn and_exprs(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(Expr::Nested(Box::new(left))),
        op: BinaryOperator::And,
        right: Box::new(Expr::Nested(Box::new(right))),
    }
}

#[allow(dead_code)]
fn ident(value: &str) -> Ident {
    Ident::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableRule;
    use std::collections::HashSet as StdHashSet;

    fn policy_with_blocked(table: &str) -> AccessPolicy {
        let mut p = AccessPolicy::default();
        p.blocked_tables.insert(format!("public.{table}"));
        p
    }

    #[test]
    fn blocks_denied_table() {
        let policy = policy_with_blocked("secrets");
        let result = rewrite("SELECT id FROM secrets", &policy);
        assert!(!result.ok);
        assert_eq!(result.blocked_tables, vec!["public.secrets".to_string()]);
    }

    #[test]
    fn blocks_denied_column() {
        let mut policy = AccessPolicy::default();
        let mut denied = StdHashSet::new();
        denied.insert("password_hash".to_string());
        policy.table_rules.push(TableRule {
            schema: "public".to_string(),
            table: "users".to_string(),
            access_level: crate::model::AccessLevel::Read,
            allowed_columns: None,
            denied_columns: Some(denied),
            row_filter: None,
            comment: None,
        });

        let result = rewrite("SELECT password_hash FROM users", &policy);
        assert!(!result.ok);
        assert_eq!(
            result.blocked_columns,
            vec!["public.users.password_hash".to_string()]
        );
        assert!(result.rewritten_sql.is_none());
    }

    #[test]
    fn injects_row_filter() {
        let mut policy = AccessPolicy::default();
        policy.table_rules.push(TableRule {
            schema: "public".to_string(),
            table: "orders".to_string(),
            access_level: crate::model::AccessLevel::Read,
            allowed_columns: None,
            denied_columns: None,
            row_filter: Some("user_id = current_user_id()".to_string()),
            comment: None,
        });

        let result = rewrite("SELECT id FROM orders", &policy);
        assert!(result.ok);
        let sql = result.rewritten_sql.unwrap();
        assert!(sql.to_lowercase().contains("where"));
        assert!(sql.contains("current_user_id"));
    }

    #[test]
    fn unblocked_query_passes_through() {
        let policy = AccessPolicy::default();
        let result = rewrite("SELECT id FROM users", &policy);
        assert!(result.ok);
        assert!(result.blocked_tables.is_empty());
        assert!(result.blocked_columns.is_empty());
    }
}
