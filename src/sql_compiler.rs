//! SQL Compiler - Deterministic PostgreSQL from a validated candidate
//!
//! Only the structure the candidate carries is ever written out. Table and
//! column names come from the catalog and are quoted; every literal becomes
//! a bind parameter. The model's own SQL text is never sent to the database.

use crate::candidate::{
    Aggregate, AggregateFunc, ColumnRef, CompareOp, Filter, JoinKind, Literal, Operand,
    OrderTarget, Predicate, Projection, QueryCandidate,
};
use crate::catalog::{ColumnSchema, ColumnType, RowId, SchemaCatalog, TableSchema};
use crate::error::{NlqError, Result};
use crate::validation::scope::{ScopeEntry, TableScope};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Name of the hidden leading column that carries the base table's primary key.
pub const ROW_ID_COLUMN: &str = "__row_id";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlParam {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    IntList(Vec<i64>),
}

/// How an output column is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Integer,
    Float,
    Text,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputColumn {
    pub name: String,
    pub kind: ValueKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
    /// Visible columns, in select-list order after the row id (if any)
    pub columns: Vec<OutputColumn>,
    /// Table whose primary key leads the select list as `__row_id`
    pub row_id_table: Option<String>,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_expr(qualifier: &str, column: &ColumnSchema) -> String {
    format!("{}.{}", quote_ident(qualifier), quote_ident(&column.name))
}

/// Cast that makes a column decodable, with the kind it decodes as.
fn output_cast(data_type: ColumnType) -> (&'static str, ValueKind) {
    match data_type {
        ColumnType::Integer => ("::int8", ValueKind::Integer),
        ColumnType::Decimal => ("::float8", ValueKind::Float),
        ColumnType::Text => ("::text", ValueKind::Text),
        ColumnType::Boolean => ("", ValueKind::Boolean),
        ColumnType::Date | ColumnType::Timestamp => ("::text", ValueKind::Text),
    }
}

fn param_cast(data_type: ColumnType) -> &'static str {
    match data_type {
        ColumnType::Date => "::date",
        ColumnType::Timestamp => "::timestamp",
        _ => "",
    }
}

/// Output names already handed out in one select list.
#[derive(Default)]
struct NameAllocator {
    used: HashSet<String>,
}

impl NameAllocator {
    fn allocate(&mut self, preferred: &str, table: &str) -> String {
        let mut name = preferred.to_string();
        if self.used.contains(&name.to_lowercase()) {
            name = format!("{}_{}", table, preferred);
        }
        let base = name.clone();
        let mut n = 2;
        while self.used.contains(&name.to_lowercase()) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        self.used.insert(name.to_lowercase());
        name
    }
}

struct SelectItem {
    expr: String,
    column: OutputColumn,
}

/// Select list under construction, with the lookups ORDER BY needs.
#[derive(Default)]
struct SelectBuilder {
    names: NameAllocator,
    items: Vec<SelectItem>,
    /// (qualifier, column) of plain projected columns -> output name
    projected: HashMap<(String, String), String>,
    /// lowercased alias -> output name
    alias_names: HashMap<String, String>,
}

impl SelectBuilder {
    fn push_column(&mut self, entry: &ScopeEntry<'_>, column: &ColumnSchema, alias: Option<&str>) {
        let (cast, kind) = output_cast(column.data_type);
        let name = self
            .names
            .allocate(alias.unwrap_or(&column.name), &entry.table.name);
        if let Some(alias) = alias {
            self.alias_names.insert(alias.to_lowercase(), name.clone());
        }
        self.projected
            .entry((entry.qualifier.to_lowercase(), column.name.clone()))
            .or_insert_with(|| name.clone());
        self.items.push(SelectItem {
            expr: format!(
                "{}{} AS {}",
                column_expr(&entry.qualifier, column),
                cast,
                quote_ident(&name)
            ),
            column: OutputColumn { name, kind },
        });
    }

    fn push_aggregate(
        &mut self,
        expr: String,
        kind: ValueKind,
        preferred: &str,
        alias: Option<&str>,
        table: &str,
    ) {
        let name = self.names.allocate(alias.unwrap_or(preferred), table);
        if let Some(alias) = alias {
            self.alias_names.insert(alias.to_lowercase(), name.clone());
        }
        let cast = match kind {
            ValueKind::Integer => "::int8",
            ValueKind::Float => "::float8",
            _ => "",
        };
        self.items.push(SelectItem {
            expr: format!("({}){} AS {}", expr, cast, quote_ident(&name)),
            column: OutputColumn { name, kind },
        });
    }
}

fn resolve<'s, 'a>(
    scope: &'s TableScope<'a>,
    col: &ColumnRef,
) -> Result<(&'s ScopeEntry<'a>, &'a ColumnSchema)> {
    scope
        .resolve(col)
        .map_err(|e| NlqError::Catalog(format!("unresolved column {}: {:?}", col, e)))
}

pub struct SqlCompiler<'a> {
    schema: &'a SchemaCatalog,
}

impl<'a> SqlCompiler<'a> {
    pub fn new(schema: &'a SchemaCatalog) -> Self {
        Self { schema }
    }

    /// Compile a candidate whose identifiers and types have been checked.
    pub fn compile(&self, candidate: &QueryCandidate, limit: u64) -> Result<CompiledQuery> {
        let scope = TableScope::build(candidate, self.schema)
            .map_err(|e| NlqError::Catalog(format!("unresolved table scope: {:?}", e)))?;
        let primary = scope.primary();

        let mut select = SelectBuilder::default();
        for projection in &candidate.projection {
            match projection {
                Projection::Wildcard => {
                    for entry in scope.entries() {
                        for column in &entry.table.columns {
                            select.push_column(entry, column, None);
                        }
                    }
                }
                Projection::QualifiedWildcard(q) => {
                    let entry = scope.entry(q).ok_or_else(|| {
                        NlqError::Catalog(format!("unresolved qualifier {}", q))
                    })?;
                    for column in &entry.table.columns {
                        select.push_column(entry, column, None);
                    }
                }
                Projection::Column { column, alias } => {
                    let (entry, schema_column) = resolve(&scope, column)?;
                    select.push_column(entry, schema_column, alias.as_deref());
                }
                Projection::Aggregate { aggregate, alias } => {
                    let (expr, kind) = aggregate_expr(aggregate, &scope)?;
                    select.push_aggregate(
                        expr,
                        kind,
                        &aggregate.default_name(),
                        alias.as_deref(),
                        &primary.table.name,
                    );
                }
            }
        }

        if select.items.is_empty() {
            return Err(NlqError::Catalog("empty select list".to_string()));
        }

        let with_row_id =
            !candidate.distinct && candidate.group_by.is_empty() && !candidate.has_aggregates();

        let mut select_list: Vec<String> = Vec::with_capacity(select.items.len() + 1);
        if with_row_id {
            let pk = primary.table.column(&primary.table.primary_key).ok_or_else(|| {
                NlqError::Catalog(format!("{} has no primary key column", primary.table.name))
            })?;
            select_list.push(format!(
                "{}::int8 AS {}",
                column_expr(&primary.qualifier, pk),
                quote_ident(ROW_ID_COLUMN)
            ));
        }
        select_list.extend(select.items.iter().map(|i| i.expr.clone()));

        let mut sql = String::from("SELECT ");
        if candidate.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&select_list.join(", "));
        sql.push_str(&format!(" FROM {}", table_clause(primary)));

        for (join, entry) in candidate.joins.iter().zip(scope.entries().iter().skip(1)) {
            let keyword = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let mut conditions = Vec::with_capacity(join.on.len());
            for (l, r) in &join.on {
                let (le, lc) = resolve(&scope, l)?;
                let (re, rc) = resolve(&scope, r)?;
                conditions.push(format!(
                    "{} = {}",
                    column_expr(&le.qualifier, lc),
                    column_expr(&re.qualifier, rc)
                ));
            }
            sql.push_str(&format!(
                " {} {} ON {}",
                keyword,
                table_clause(entry),
                conditions.join(" AND ")
            ));
        }

        let mut params = Vec::new();
        if let Some(filter) = &candidate.filter {
            let clause = render_filter(filter, &scope, &mut params)?;
            sql.push_str(&format!(" WHERE {}", clause));
        }

        if !candidate.group_by.is_empty() {
            let cols = candidate
                .group_by
                .iter()
                .map(|c| resolve(&scope, c).map(|(e, col)| column_expr(&e.qualifier, col)))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" GROUP BY {}", cols.join(", ")));
        }

        if !candidate.order_by.is_empty() {
            let mut keys = Vec::with_capacity(candidate.order_by.len());
            for key in &candidate.order_by {
                let rendered = match &key.target {
                    OrderTarget::Alias(alias) => match select.alias_names.get(&alias.to_lowercase()) {
                        Some(name) => quote_ident(name),
                        None => {
                            let (entry, col) = resolve(&scope, &ColumnRef::new(None, alias))?;
                            order_column(entry, col, &select.projected)
                        }
                    },
                    OrderTarget::Column(col) => {
                        let (entry, col) = resolve(&scope, col)?;
                        order_column(entry, col, &select.projected)
                    }
                    OrderTarget::Aggregate(aggregate) => aggregate_expr(aggregate, &scope)?.0,
                };
                keys.push(if key.descending {
                    format!("{} DESC", rendered)
                } else {
                    rendered
                });
            }
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }

        sql.push_str(&format!(" LIMIT {}", limit));
        if let Some(offset) = candidate.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        Ok(CompiledQuery {
            sql,
            params,
            columns: select.items.into_iter().map(|i| i.column).collect(),
            row_id_table: with_row_id.then(|| primary.table.name.clone()),
        })
    }

    /// Full rows of `table` for the given primary keys, in no particular order.
    pub fn fetch_by_ids(&self, table: &str, ids: &[RowId]) -> Result<CompiledQuery> {
        let table = self.table(table)?;
        let (mut select_list, columns) = full_row_select(table);
        let pk = quote_ident(&table.primary_key);
        select_list.insert(0, format!("{}::int8 AS {}", pk, quote_ident(ROW_ID_COLUMN)));
        Ok(CompiledQuery {
            sql: format!(
                "SELECT {} FROM {} WHERE {} = ANY($1)",
                select_list.join(", "),
                quote_ident(&table.name),
                pk
            ),
            params: vec![SqlParam::IntList(ids.to_vec())],
            columns,
            row_id_table: Some(table.name.clone()),
        })
    }

    /// Primary key plus indexed columns of every row, for building embeddings.
    pub fn index_scan(&self, table: &str) -> Result<CompiledQuery> {
        let table = self.table(table)?;
        if table.indexed_columns.is_empty() {
            return Err(NlqError::Catalog(format!("{} has no indexed columns", table.name)));
        }
        let pk = quote_ident(&table.primary_key);
        let select_list = std::iter::once(format!("{}::int8 AS {}", pk, quote_ident(ROW_ID_COLUMN)))
            .chain(
                table
                    .indexed_columns
                    .iter()
                    .map(|c| format!("{}::text AS {}", quote_ident(c), quote_ident(c))),
            )
            .join(", ");
        Ok(CompiledQuery {
            sql: format!(
                "SELECT {} FROM {} ORDER BY {}",
                select_list,
                quote_ident(&table.name),
                pk
            ),
            params: Vec::new(),
            columns: table
                .indexed_columns
                .iter()
                .map(|c| OutputColumn {
                    name: c.clone(),
                    kind: ValueKind::Text,
                })
                .collect(),
            row_id_table: Some(table.name.clone()),
        })
    }

    fn table(&self, name: &str) -> Result<&'a TableSchema> {
        self.schema
            .table(name)
            .ok_or_else(|| NlqError::Catalog(format!("unknown table {}", name)))
    }
}

fn aggregate_expr(aggregate: &Aggregate, scope: &TableScope<'_>) -> Result<(String, ValueKind)> {
    let func = aggregate.func.sql_name();
    let distinct = if aggregate.distinct { "DISTINCT " } else { "" };
    let (arg, column_type) = match &aggregate.arg {
        None => ("*".to_string(), None),
        Some(col) => {
            let (entry, column) = resolve(scope, col)?;
            (column_expr(&entry.qualifier, column), Some(column.data_type))
        }
    };
    let kind = match (aggregate.func, column_type) {
        (AggregateFunc::Count, _) => ValueKind::Integer,
        (AggregateFunc::Avg, _) => ValueKind::Float,
        (AggregateFunc::Sum, Some(ColumnType::Integer)) => ValueKind::Integer,
        (AggregateFunc::Sum, _) => ValueKind::Float,
        (AggregateFunc::Min | AggregateFunc::Max, Some(t)) => output_cast(t).1,
        (AggregateFunc::Min | AggregateFunc::Max, None) => {
            return Err(NlqError::Catalog(format!("{}(*) is not valid", func)))
        }
    };
    // MIN/MAX over dates stay temporal in SQL; render them as text to decode
    let expr = match (aggregate.func, column_type) {
        (
            AggregateFunc::Min | AggregateFunc::Max,
            Some(ColumnType::Date | ColumnType::Timestamp),
        ) => format!("{}({}{})::text", func, distinct, arg),
        _ => format!("{}({}{})", func, distinct, arg),
    };
    Ok((expr, kind))
}

fn table_clause(entry: &ScopeEntry<'_>) -> String {
    if entry.qualifier == entry.table.name {
        quote_ident(&entry.table.name)
    } else {
        format!("{} AS {}", quote_ident(&entry.table.name), quote_ident(&entry.qualifier))
    }
}

fn full_row_select(table: &TableSchema) -> (Vec<String>, Vec<OutputColumn>) {
    let mut names = NameAllocator::default();
    table
        .columns
        .iter()
        .map(|column| {
            let (cast, kind) = output_cast(column.data_type);
            let name = names.allocate(&column.name, &table.name);
            (
                format!("{}{} AS {}", quote_ident(&column.name), cast, quote_ident(&name)),
                OutputColumn { name, kind },
            )
        })
        .unzip()
}

/// ORDER BY a projected column by its output name, otherwise by the column itself.
fn order_column(
    entry: &ScopeEntry<'_>,
    column: &ColumnSchema,
    projected: &HashMap<(String, String), String>,
) -> String {
    match projected.get(&(entry.qualifier.to_lowercase(), column.name.clone())) {
        Some(name) => quote_ident(name),
        None => column_expr(&entry.qualifier, column),
    }
}

fn literal_param(lit: &Literal) -> Result<SqlParam> {
    match lit {
        Literal::Integer(i) => Ok(SqlParam::Int(*i)),
        Literal::Float(f) => Ok(SqlParam::Float(*f)),
        Literal::Text(s) => Ok(SqlParam::Text(s.clone())),
        Literal::Boolean(b) => Ok(SqlParam::Bool(*b)),
        Literal::Null => Err(NlqError::Catalog(
            "NULL cannot be bound as a comparison value".to_string(),
        )),
    }
}

fn render_filter(filter: &Filter, scope: &TableScope<'_>, params: &mut Vec<SqlParam>) -> Result<String> {
    let (items, separator, empty) = match filter {
        Filter::All(items) => (items, " AND ", "TRUE"),
        Filter::Any(items) => (items, " OR ", "FALSE"),
        Filter::Not(inner) => return Ok(format!("NOT ({})", render_filter(inner, scope, params)?)),
        Filter::Compare(predicate) => return render_predicate(predicate, scope, params),
    };
    if items.is_empty() {
        return Ok(empty.to_string());
    }
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(render_filter(item, scope, params)?);
    }
    Ok(format!("({})", parts.join(separator)))
}

fn render_predicate(
    predicate: &Predicate,
    scope: &TableScope<'_>,
    params: &mut Vec<SqlParam>,
) -> Result<String> {
    let (entry, column) = resolve(scope, &predicate.column)?;
    let lhs = column_expr(&entry.qualifier, column);
    let cast = param_cast(column.data_type);
    let bind = |lit: &Literal, params: &mut Vec<SqlParam>| -> Result<String> {
        params.push(literal_param(lit)?);
        Ok(format!("${}{}", params.len(), cast))
    };

    match (&predicate.op, &predicate.value) {
        (CompareOp::IsNull | CompareOp::IsNotNull, _) => {
            Ok(format!("{} {}", lhs, predicate.op.sql()))
        }
        (CompareOp::In | CompareOp::NotIn, Operand::List(items)) => {
            if items.is_empty() {
                let constant = if predicate.op == CompareOp::In { "FALSE" } else { "TRUE" };
                return Ok(constant.to_string());
            }
            let mut placeholders = Vec::with_capacity(items.len());
            for lit in items {
                placeholders.push(bind(lit, params)?);
            }
            Ok(format!("{} {} ({})", lhs, predicate.op.sql(), placeholders.join(", ")))
        }
        (op, Operand::Literal(lit)) => {
            let placeholder = bind(lit, params)?;
            Ok(format!("{} {} {}", lhs, op.sql(), placeholder))
        }
        (op, Operand::Column(other)) => {
            let (other_entry, other_column) = resolve(scope, other)?;
            Ok(format!(
                "{} {} {}",
                lhs,
                op.sql(),
                column_expr(&other_entry.qualifier, other_column)
            ))
        }
        (op, _) => Err(NlqError::Catalog(format!(
            "operator {} has no usable operand",
            op.sql()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::parse_candidate;

    fn compile(sql: &str, limit: u64) -> CompiledQuery {
        let schema = SchemaCatalog::builtin();
        let candidate = parse_candidate("q", sql, &schema).unwrap();
        SqlCompiler::new(&schema).compile(&candidate, limit).unwrap()
    }

    #[test]
    fn test_join_with_text_filter_is_parameterized() {
        let compiled = compile(
            "SELECT e.* FROM employees e JOIN departments d ON e.department_id = d.id \
             WHERE d.name = 'Engineering'",
            50,
        );
        assert_eq!(
            compiled.sql,
            "SELECT \"e\".\"id\"::int8 AS \"__row_id\", \"e\".\"id\"::int8 AS \"id\", \
             \"e\".\"name\"::text AS \"name\", \"e\".\"department_id\"::int8 AS \"department_id\", \
             \"e\".\"email\"::text AS \"email\", \"e\".\"salary\"::float8 AS \"salary\" \
             FROM \"employees\" AS \"e\" JOIN \"departments\" AS \"d\" ON \"e\".\"department_id\" = \"d\".\"id\" \
             WHERE \"d\".\"name\" = $1 LIMIT 50"
        );
        assert_eq!(compiled.params, vec![SqlParam::Text("Engineering".to_string())]);
        assert_eq!(compiled.row_id_table.as_deref(), Some("employees"));
        assert_eq!(compiled.columns.len(), 5);
    }

    #[test]
    fn test_wildcard_over_join_disambiguates_names() {
        let compiled = compile(
            "SELECT * FROM employees e JOIN departments d ON e.department_id = d.id",
            10,
        );
        let names: Vec<&str> = compiled.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["id", "name", "department_id", "email", "salary", "departments_id", "departments_name"]
        );
    }

    #[test]
    fn test_aggregate_query_has_no_row_id() {
        let compiled = compile(
            "SELECT d.name, AVG(e.salary) AS avg_salary FROM employees e \
             JOIN departments d ON e.department_id = d.id GROUP BY d.name ORDER BY avg_salary DESC",
            50,
        );
        assert!(compiled.row_id_table.is_none());
        assert!(compiled.sql.contains("(AVG(\"e\".\"salary\"))::float8 AS \"avg_salary\""));
        assert!(compiled.sql.ends_with("GROUP BY \"d\".\"name\" ORDER BY \"avg_salary\" DESC LIMIT 50"));
        assert_eq!(compiled.columns[1].kind, ValueKind::Float);
    }

    #[test]
    fn test_date_params_are_cast_and_lists_expanded() {
        let compiled = compile(
            "SELECT id FROM orders WHERE order_date >= '2024-01-01' AND employee_id IN (1, 2)",
            5,
        );
        assert!(compiled
            .sql
            .contains("WHERE (\"orders\".\"order_date\" >= $1::date AND \"orders\".\"employee_id\" IN ($2, $3))"));
        assert_eq!(
            compiled.params,
            vec![
                SqlParam::Text("2024-01-01".to_string()),
                SqlParam::Int(1),
                SqlParam::Int(2)
            ]
        );
    }

    #[test]
    fn test_order_by_projected_column_uses_output_name() {
        let compiled = compile("SELECT DISTINCT name FROM products ORDER BY name OFFSET 3", 20);
        assert!(compiled.sql.starts_with("SELECT DISTINCT \"products\".\"name\"::text AS \"name\""));
        assert!(compiled.sql.ends_with("ORDER BY \"name\" LIMIT 20 OFFSET 3"));
    }

    #[test]
    fn test_injection_text_stays_in_parameter() {
        let compiled = compile("SELECT * FROM products WHERE name = 'x\" OR 1=1'", 50);
        assert!(!compiled.sql.contains("1=1"));
        assert_eq!(compiled.params, vec![SqlParam::Text("x\" OR 1=1".to_string())]);
    }

    #[test]
    fn test_fetch_by_ids_and_index_scan() {
        let schema = SchemaCatalog::builtin();
        let compiler = SqlCompiler::new(&schema);

        let fetch = compiler.fetch_by_ids("products", &[3, 1]).unwrap();
        assert_eq!(
            fetch.sql,
            "SELECT \"id\"::int8 AS \"__row_id\", \"id\"::int8 AS \"id\", \"name\"::text AS \"name\", \
             \"price\"::float8 AS \"price\" FROM \"products\" WHERE \"id\" = ANY($1)"
        );
        assert_eq!(fetch.params, vec![SqlParam::IntList(vec![3, 1])]);

        let scan = compiler.index_scan("orders").unwrap();
        assert_eq!(
            scan.sql,
            "SELECT \"id\"::int8 AS \"__row_id\", \"customer_name\"::text AS \"customer_name\" \
             FROM \"orders\" ORDER BY \"id\""
        );
        assert!(compiler.index_scan("nope").is_err());
    }
}
