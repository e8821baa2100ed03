//! Statement Structure - Extracts the referenced schemas, tables and columns
//! from a SQL statement before any policy decision is made.
//!
//! The structural summary is the input to every later pipeline stage. Parsing
//! never fails outright: statements the parser cannot understand produce an
//! empty summary with a diagnostic, and downstream policy evaluation treats
//! "structure unknown" as deny by default.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, Ident, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use xxhash_rust::xxh3::xxh3_64;

/// Structural summary of a single SQL statement.
///
/// Table names are recorded unqualified and lower-cased; columns are
/// `(table, column)` pairs with aliases resolved back to their source table
/// where determinable. Columns implicitly selected through a wildcard are NOT
/// enumerated here - `wildcard_tables` names the tables whose full column
/// lists must be expanded against the schema catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlStructure {
    pub sql: String,
    pub schemas: HashSet<String>,
    pub tables: HashSet<String>,
    pub columns: HashSet<(String, String)>,
    pub has_wildcard_selection: bool,
    pub wildcard_tables: HashSet<String>,
    /// Non-empty when the statement could not be (fully) analyzed.
    pub diagnostics: Vec<String>,
}

/// Content hash used as the EXPLAIN cache key and the audit `sql_hash`.
pub fn fingerprint(sql: &str) -> u64 {
    xxh3_64(sql.as_bytes())
}

/// A table visible in the FROM scope of a SELECT.
#[derive(Debug, Clone)]
struct ScopeTable {
    /// Unqualified, lower-cased table name.
    table: String,
    alias: Option<String>,
    /// False for CTE references and derived-table aliases.
    is_real: bool,
}

impl SqlStructure {
    /// Parse a statement into its structural summary.
    ///
    /// `default_schema` is attributed to every table that is not explicitly
    /// schema-qualified.
    pub fn from_sql(sql: &str, default_schema: &str) -> Self {
        let mut structure = Self {
            sql: sql.to_string(),
            schemas: HashSet::new(),
            tables: HashSet::new(),
            columns: HashSet::new(),
            has_wildcard_selection: false,
            wildcard_tables: HashSet::new(),
            diagnostics: Vec::new(),
        };

        let dialect = GenericDialect {};
        let statements = match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                tracing::warn!("SQL parsing failed: {}", e);
                structure
                    .diagnostics
                    .push(format!("statement could not be parsed: {}", e));
                return structure;
            }
        };

        if statements.is_empty() {
            structure
                .diagnostics
                .push("statement is empty".to_string());
            return structure;
        }

        let mut walker = Walker {
            structure: &mut structure,
            default_schema: default_schema.to_lowercase(),
        };
        for statement in &statements {
            walker.walk_statement(statement);
        }

        structure
    }
}

struct Walker<'a> {
    structure: &'a mut SqlStructure,
    default_schema: String,
}

impl<'a> Walker<'a> {
    fn walk_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Query(query) => {
                let cte_names = HashSet::new();
                self.walk_query(query, &cte_names);
            }
            other => {
                // Statement-type safety is enforced upstream; anything that is
                // not a plain query still must not slip through unanalyzed.
                self.structure.diagnostics.push(format!(
                    "unsupported statement kind: {}",
                    statement_kind(other)
                ));
            }
        }
    }

    fn walk_query(&mut self, query: &Query, outer_ctes: &HashSet<String>) {
        let mut cte_names = outer_ctes.clone();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                cte_names.insert(cte.alias.name.value.to_lowercase());
            }
            for cte in &with.cte_tables {
                self.walk_query(&cte.query, &cte_names);
            }
        }

        let scope = self.walk_set_expr(&query.body, &cte_names);

        // ORDER BY on the query level sees the body's FROM scope.
        if let Some(scope) = &scope {
            for order in &query.order_by {
                self.walk_expr(&order.expr, scope, &cte_names);
            }
        }
    }

    fn walk_set_expr(
        &mut self,
        body: &SetExpr,
        cte_names: &HashSet<String>,
    ) -> Option<Vec<ScopeTable>> {
        match body {
            SetExpr::Select(select) => Some(self.walk_select(select, cte_names)),
            SetExpr::Query(query) => {
                self.walk_query(query, cte_names);
                None
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.walk_set_expr(left, cte_names);
                self.walk_set_expr(right, cte_names);
                None
            }
            _ => None,
        }
    }

    fn walk_select(&mut self, select: &Select, cte_names: &HashSet<String>) -> Vec<ScopeTable> {
        let mut scope = Vec::new();
        for table_with_joins in &select.from {
            self.collect_scope(table_with_joins, cte_names, &mut scope);
        }

        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => {
                    self.structure.has_wildcard_selection = true;
                    for entry in scope.iter().filter(|t| t.is_real) {
                        self.structure.wildcard_tables.insert(entry.table.clone());
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    self.structure.has_wildcard_selection = true;
                    if let Some(qualifier) = name.0.last() {
                        let qualifier = qualifier.value.to_lowercase();
                        match resolve_qualifier(&scope, &qualifier) {
                            Some(entry) if entry.is_real => {
                                self.structure.wildcard_tables.insert(entry.table.clone());
                            }
                            Some(_) => {}
                            None => {
                                // Unknown qualifier; keep the name so the
                                // policy check still sees something to deny.
                                self.structure.wildcard_tables.insert(qualifier);
                            }
                        }
                    }
                }
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    self.walk_expr(expr, &scope, cte_names);
                }
            }
        }

        if let Some(selection) = &select.selection {
            self.walk_expr(selection, &scope, cte_names);
        }
        match &select.group_by {
            sqlparser::ast::GroupByExpr::Expressions(exprs) => {
                for expr in exprs {
                    self.walk_expr(expr, &scope, cte_names);
                }
            }
            sqlparser::ast::GroupByExpr::All => {}
        }
        if let Some(having) = &select.having {
            self.walk_expr(having, &scope, cte_names);
        }

        scope
    }

    fn collect_scope(
        &mut self,
        table_with_joins: &TableWithJoins,
        cte_names: &HashSet<String>,
        scope: &mut Vec<ScopeTable>,
    ) {
        self.collect_factor(&table_with_joins.relation, cte_names, scope);
        for join in &table_with_joins.joins {
            self.collect_factor(&join.relation, cte_names, scope);
        }
    }

    fn collect_factor(
        &mut self,
        factor: &TableFactor,
        cte_names: &HashSet<String>,
        scope: &mut Vec<ScopeTable>,
    ) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let parts = &name.0;
                let table = match parts.last() {
                    Some(ident) => ident.value.to_lowercase(),
                    None => return,
                };
                let alias_name = alias.as_ref().map(|a| a.name.value.to_lowercase());

                // A name matching an in-scope CTE is a reference to derived
                // rows, not a physical table.
                if parts.len() == 1 && cte_names.contains(&table) {
                    scope.push(ScopeTable {
                        table,
                        alias: alias_name,
                        is_real: false,
                    });
                    return;
                }

                if parts.len() >= 2 {
                    let schema = parts[parts.len() - 2].value.to_lowercase();
                    self.structure.schemas.insert(schema);
                } else {
                    self.structure.schemas.insert(self.default_schema.clone());
                }
                self.structure.tables.insert(table.clone());
                scope.push(ScopeTable {
                    table,
                    alias: alias_name,
                    is_real: true,
                });
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                self.walk_query(subquery, cte_names);
                if let Some(alias) = alias {
                    scope.push(ScopeTable {
                        table: alias.name.value.to_lowercase(),
                        alias: None,
                        is_real: false,
                    });
                }
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.collect_scope(table_with_joins, cte_names, scope);
            }
            _ => {}
        }
    }

    fn record_column(&mut self, scope: &[ScopeTable], qualifier: Option<&str>, column: &str) {
        let column = column.to_lowercase();
        match qualifier {
            Some(qualifier) => {
                let qualifier = qualifier.to_lowercase();
                match resolve_qualifier(scope, &qualifier) {
                    Some(entry) if entry.is_real => {
                        self.structure.columns.insert((entry.table.clone(), column));
                    }
                    Some(_) => {}
                    // Outer-query or schema-level qualifier: keep it verbatim
                    // rather than dropping the reference on the floor.
                    None => {
                        self.structure.columns.insert((qualifier, column));
                    }
                }
            }
            None => {
                let real: Vec<&ScopeTable> = scope.iter().filter(|t| t.is_real).collect();
                // With several candidate tables the owner cannot be determined
                // without a catalog lookup; attribute to all of them so a
                // denied name anywhere in scope is still caught.
                for entry in real {
                    self.structure
                        .columns
                        .insert((entry.table.clone(), column.clone()));
                }
            }
        }
    }

    fn walk_expr(&mut self, expr: &Expr, scope: &[ScopeTable], cte_names: &HashSet<String>) {
        match expr {
            Expr::Identifier(ident) => {
                self.record_column(scope, None, &ident.value);
            }
            Expr::CompoundIdentifier(idents) => {
                if idents.len() >= 2 {
                    let qualifier = &idents[idents.len() - 2].value;
                    let column = &idents[idents.len() - 1].value;
                    self.record_column(scope, Some(qualifier), column);
                }
            }
            Expr::BinaryOp { left, right, .. }
            | Expr::IsDistinctFrom(left, right)
            | Expr::IsNotDistinctFrom(left, right)
            | Expr::JsonAccess { left, right, .. } => {
                self.walk_expr(left, scope, cte_names);
                self.walk_expr(right, scope, cte_names);
            }
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::IsTrue(expr)
            | Expr::IsNotTrue(expr)
            | Expr::IsFalse(expr)
            | Expr::IsNotFalse(expr)
            | Expr::IsUnknown(expr)
            | Expr::IsNotUnknown(expr)
            | Expr::Cast { expr, .. }
            | Expr::TryCast { expr, .. }
            | Expr::CompositeAccess { expr, .. } => {
                self.walk_expr(expr, scope, cte_names);
            }
            Expr::AtTimeZone { timestamp, .. } => {
                self.walk_expr(timestamp, scope, cte_names);
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.walk_expr(expr, scope, cte_names);
                self.walk_expr(pattern, scope, cte_names);
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.walk_expr(expr, scope, cte_names);
                self.walk_expr(low, scope, cte_names);
                self.walk_expr(high, scope, cte_names);
            }
            Expr::InList { expr, list, .. } => {
                self.walk_expr(expr, scope, cte_names);
                for item in list {
                    self.walk_expr(item, scope, cte_names);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.walk_expr(expr, scope, cte_names);
                self.walk_query(subquery, cte_names);
            }
            Expr::Subquery(query) => {
                self.walk_query(query, cte_names);
            }
            Expr::Exists { subquery, .. } => {
                self.walk_query(subquery, cte_names);
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.walk_expr(operand, scope, cte_names);
                }
                for (condition, result) in conditions.iter().zip(results.iter()) {
                    self.walk_expr(condition, scope, cte_names);
                    self.walk_expr(result, scope, cte_names);
                }
                if let Some(else_result) = else_result {
                    self.walk_expr(else_result, scope, cte_names);
                }
            }
            Expr::Function(function) => {
                for arg in &function.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))
                        | FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(expr),
                            ..
                        } => {
                            self.walk_expr(expr, scope, cte_names);
                        }
                        _ => {}
                    }
                }
            }
            Expr::Tuple(exprs) => {
                for expr in exprs {
                    self.walk_expr(expr, scope, cte_names);
                }
            }
            _ => {
                // Remaining expression kinds are literals or constructs that
                // carry no further column references.
            }
        }
    }
}

fn resolve_qualifier<'a>(scope: &'a [ScopeTable], qualifier: &str) -> Option<&'a ScopeTable> {
    scope
        .iter()
        .find(|entry| entry.alias.as_deref() == Some(qualifier))
        .or_else(|| scope.iter().find(|entry| entry.table == qualifier))
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::Drop { .. } => "DROP",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::Explain { .. } => "EXPLAIN",
        _ => "non-query",
    }
}

/// Replace wildcard projections with explicit safe column lists.
///
/// `replacements` maps lower-cased table names to the columns that may be
/// selected from them. Only a single top-level SELECT without CTEs is
/// rewritten; any other shape returns an error and the caller falls back to
/// rejecting the statement.
pub fn rewrite_wildcard_projection(
    sql: &str,
    replacements: &HashMap<String, Vec<String>>,
) -> Result<String> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)
        .map_err(|e| QueryError::Execution(format!("failed to re-parse statement: {}", e)))?;
    if statements.len() != 1 {
        return Err(QueryError::Execution(
            "wildcard expansion supports exactly one statement".to_string(),
        ));
    }

    let statement = statements.remove(0);
    let mut query = match statement {
        Statement::Query(query) => query,
        _ => {
            return Err(QueryError::Execution(
                "wildcard expansion supports plain queries only".to_string(),
            ))
        }
    };
    if query.with.is_some() {
        return Err(QueryError::Execution(
            "wildcard expansion does not support CTEs".to_string(),
        ));
    }

    let select = match query.body.as_mut() {
        SetExpr::Select(select) => select,
        _ => {
            return Err(QueryError::Execution(
                "wildcard expansion supports a single SELECT only".to_string(),
            ))
        }
    };

    // FROM-order scope of (qualifier, table) pairs for expansion.
    let mut scope: Vec<(String, String)> = Vec::new();
    for table_with_joins in &select.from {
        collect_rewrite_scope(&table_with_joins.relation, &mut scope)?;
        for join in &table_with_joins.joins {
            collect_rewrite_scope(&join.relation, &mut scope)?;
        }
    }
    let qualify = scope.len() > 1;

    let mut projection = Vec::with_capacity(select.projection.len());
    for item in select.projection.drain(..) {
        match item {
            SelectItem::Wildcard(_) => {
                for (qualifier, table) in &scope {
                    push_columns(&mut projection, qualifier, table, replacements, qualify)?;
                }
            }
            SelectItem::QualifiedWildcard(ref name, _) => {
                let wanted = name
                    .0
                    .last()
                    .map(|ident| ident.value.to_lowercase())
                    .unwrap_or_default();
                let entry = scope
                    .iter()
                    .find(|(qualifier, table)| *qualifier == wanted || *table == wanted)
                    .cloned()
                    .ok_or_else(|| {
                        QueryError::Execution(format!(
                            "wildcard qualifier '{}' does not match any table",
                            wanted
                        ))
                    })?;
                push_columns(&mut projection, &entry.0, &entry.1, replacements, true)?;
            }
            other => projection.push(other),
        }
    }
    select.projection = projection;

    Ok(Statement::Query(query).to_string())
}

fn collect_rewrite_scope(factor: &TableFactor, scope: &mut Vec<(String, String)>) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let table = name
                .0
                .last()
                .map(|ident| ident.value.to_lowercase())
                .unwrap_or_default();
            let qualifier = alias
                .as_ref()
                .map(|a| a.name.value.to_lowercase())
                .unwrap_or_else(|| table.clone());
            scope.push((qualifier, table));
            Ok(())
        }
        _ => Err(QueryError::Execution(
            "wildcard expansion supports plain table references only".to_string(),
        )),
    }
}

fn push_columns(
    projection: &mut Vec<SelectItem>,
    qualifier: &str,
    table: &str,
    replacements: &HashMap<String, Vec<String>>,
    qualify: bool,
) -> Result<()> {
    let columns = replacements.get(table).ok_or_else(|| {
        QueryError::Execution(format!("no safe column list for table '{}'", table))
    })?;
    for column in columns {
        let expr = if qualify {
            Expr::CompoundIdentifier(vec![Ident::new(qualifier), Ident::new(column)])
        } else {
            Expr::Identifier(Ident::new(column))
        };
        projection.push(SelectItem::UnnamedExpr(expr));
    }
    Ok(())
}
