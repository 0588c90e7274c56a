//! Query Translator
//!
//! Turns a question into a `QueryCandidate`: build a prompt from the
//! catalog, ask the language model for SQL, then parse that SQL into the
//! structured candidate. Only the supported SELECT subset parses; anything
//! else is a translation failure. Statements that are not retrievals
//! become candidates that record only their shape, so the validator can
//! refuse them by rule.

use crate::candidate::{
    Aggregate, AggregateFunc, ColumnRef, CompareOp, Filter, JoinClause, JoinKind, Literal,
    Operand, OrderKey, OrderTarget, Predicate, Projection, QueryCandidate, SemanticHint,
    StatementShape, TableRef,
};
use crate::catalog::SchemaCatalog;
use crate::error::{NlqError, Result};
use crate::llm::{LanguageModel, Prompt};
use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Distinct, Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr,
    JoinConstraint, JoinOperator, ObjectName, Query, SelectItem, SetExpr, Statement,
    TableFactor, UnaryOperator, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

lazy_static::lazy_static! {
    static ref FENCED: Regex = Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").unwrap();
    // Similarity phrases; "like" only counts right after the thing being compared
    static ref FUZZY: Regex = Regex::new(
        r"(?i)\b(similar to|similar|resembling|resembles|something like|anything like|(products?|items?|employees?|people|staff|orders?|departments?|ones|things)\s+like)\b"
    ).unwrap();
}

/// A worked question/SQL pair shown to the model.
#[derive(Debug, Clone)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
}

impl FewShotExample {
    pub fn new(question: &str, sql: &str) -> Self {
        Self {
            question: question.to_string(),
            sql: sql.to_string(),
        }
    }
}

/// Worked examples over the built-in company catalog.
pub fn default_examples() -> Vec<FewShotExample> {
    vec![
        FewShotExample::new(
            "Show all employees in Engineering",
            "SELECT e.* FROM employees e JOIN departments d ON e.department_id = d.id WHERE d.name = 'Engineering' LIMIT 50",
        ),
        FewShotExample::new(
            "What is the average salary by department?",
            "SELECT d.name, AVG(e.salary) AS avg_salary FROM employees e JOIN departments d ON e.department_id = d.id GROUP BY d.name ORDER BY avg_salary DESC LIMIT 50",
        ),
        FewShotExample::new(
            "Show top 5 highest paid employees",
            "SELECT name, salary FROM employees ORDER BY salary DESC LIMIT 5",
        ),
        FewShotExample::new(
            "List recent orders",
            "SELECT * FROM orders ORDER BY order_date DESC LIMIT 10",
        ),
        FewShotExample::new(
            "Find products under $100",
            "SELECT * FROM products WHERE price < 100 ORDER BY price LIMIT 50",
        ),
        FewShotExample::new(
            "Count employees per department",
            "SELECT d.name, COUNT(e.id) AS employee_count FROM departments d LEFT JOIN employees e ON e.department_id = d.id GROUP BY d.name LIMIT 50",
        ),
    ]
}

pub struct QueryTranslator {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    max_rows: u64,
    examples: Vec<FewShotExample>,
}

impl QueryTranslator {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration, max_rows: u64) -> Self {
        Self {
            model,
            timeout,
            max_rows,
            examples: default_examples(),
        }
    }

    pub fn with_examples(mut self, examples: Vec<FewShotExample>) -> Self {
        self.examples = examples;
        self
    }

    pub fn build_prompt(&self, question: &str, schema: &SchemaCatalog) -> Prompt {
        let system = "You are a PostgreSQL expert. You translate questions about a database \
                      into exactly one read-only SQL query."
            .to_string();

        let mut user = format!(
            "Database schema:\n{}\n\
             Rules:\n\
             1. Return only the SQL query, with no explanation and no comments.\n\
             2. Write exactly one SELECT statement. Never modify data or schema.\n\
             3. Join tables only along the relationships listed above.\n\
             4. Use only the tables and columns listed above.\n\
             5. End with LIMIT {} or a smaller limit.\n",
            schema.describe(),
            self.max_rows
        );

        if !self.examples.is_empty() {
            user.push_str("\nExamples:\n");
            for example in &self.examples {
                user.push_str(&format!("Question: {}\nSQL: {}\n\n", example.question, example.sql));
            }
        }
        user.push_str(&format!("Question: {}\nSQL:", question));

        Prompt { system, user }
    }

    pub async fn translate(&self, question: &str, schema: &SchemaCatalog) -> Result<QueryCandidate> {
        let question = question.trim();
        if question.is_empty() {
            return Err(NlqError::TranslationFailure("question is empty".to_string()));
        }

        let prompt = self.build_prompt(question, schema);
        let raw = match tokio::time::timeout(self.timeout, self.model.complete(&prompt)).await {
            Err(_) => {
                return Err(NlqError::TranslationFailure(format!(
                    "model call timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
            Ok(Err(NlqError::TranslationFailure(msg))) => {
                return Err(NlqError::TranslationFailure(msg))
            }
            Ok(Err(other)) => return Err(NlqError::TranslationFailure(other.to_string())),
            Ok(Ok(text)) => text,
        };
        debug!(raw = %raw, "model response");

        let candidate = parse_candidate(question, &raw, schema)?;
        info!(
            "🧭 Translated question: verb={}, statements={}, fuzzy={}",
            candidate.shape.verb, candidate.shape.statements, candidate.semantic.fuzzy
        );
        Ok(candidate)
    }
}

/// Pull the SQL out of the model text: a fenced block if there is one, else the whole text.
pub fn extract_statement(raw: &str) -> String {
    match FENCED.captures(raw).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim().to_string(),
        None => raw.trim().to_string(),
    }
}

pub fn is_fuzzy_question(question: &str) -> bool {
    FUZZY.is_match(question)
}

/// Parse model text into a candidate without calling any model.
pub fn parse_candidate(question: &str, raw: &str, schema: &SchemaCatalog) -> Result<QueryCandidate> {
    let statement_text = extract_statement(raw);
    if statement_text.is_empty() {
        return Err(NlqError::TranslationFailure("model returned no SQL".to_string()));
    }

    let statements = Parser::parse_sql(&PostgreSqlDialect {}, &statement_text).map_err(|e| {
        debug!(error = %e, "model SQL did not parse");
        NlqError::TranslationFailure("model output is not a parseable SQL statement".to_string())
    })?;

    let first = statements.first().ok_or_else(|| {
        NlqError::TranslationFailure("model output contains no statement".to_string())
    })?;

    let shape = StatementShape {
        statements: statements.len(),
        verb: leading_verb(first),
    };

    let query = match first {
        Statement::Query(query) if statements.len() == 1 => query,
        _ => {
            return Ok(QueryCandidate::non_retrieval(
                question,
                shape,
                raw,
                &statement_text,
            ))
        }
    };

    if !query.locks.is_empty() {
        let shape = StatementShape {
            statements: 1,
            verb: "SELECT FOR UPDATE".to_string(),
        };
        return Ok(QueryCandidate::non_retrieval(question, shape, raw, &statement_text));
    }

    let mut candidate = build_select(question, query, raw, &statement_text)?;
    candidate.semantic = SemanticHint {
        fuzzy: is_fuzzy_question(question),
        table: candidate
            .from
            .as_ref()
            .map(|t| {
                schema
                    .table(&t.name)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| t.name.clone())
            })
            .or_else(|| schema.resolve_table_hint(question).map(|t| t.name.clone())),
    };
    Ok(candidate)
}

fn leading_verb(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

fn unsupported(what: &str) -> NlqError {
    NlqError::TranslationFailure(format!("unsupported query construct: {}", what))
}

fn build_select(
    question: &str,
    query: &Query,
    raw: &str,
    statement_text: &str,
) -> Result<QueryCandidate> {
    if query.with.is_some() {
        return Err(unsupported("WITH"));
    }
    if query.fetch.is_some() {
        return Err(unsupported("FETCH"));
    }

    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => return Err(unsupported("set operation or nested query")),
    };

    if select.into.is_some() {
        let shape = StatementShape {
            statements: 1,
            verb: "SELECT INTO".to_string(),
        };
        return Ok(QueryCandidate::non_retrieval(question, shape, raw, statement_text));
    }
    if select.top.is_some() {
        return Err(unsupported("TOP"));
    }
    if select.having.is_some() {
        return Err(unsupported("HAVING"));
    }

    let distinct = match &select.distinct {
        None => false,
        Some(Distinct::Distinct) => true,
        Some(Distinct::On(_)) => return Err(unsupported("DISTINCT ON")),
    };

    let source = match select.from.as_slice() {
        [] => {
            return Err(NlqError::TranslationFailure(
                "query has no FROM clause".to_string(),
            ))
        }
        [single] => single,
        _ => return Err(unsupported("comma-separated FROM list")),
    };

    let from = table_ref(&source.relation)?;
    let mut joins = Vec::with_capacity(source.joins.len());
    for join in &source.joins {
        let (kind, constraint) = match &join.join_operator {
            JoinOperator::Inner(c) => (JoinKind::Inner, c),
            JoinOperator::LeftOuter(c) => (JoinKind::Left, c),
            _ => return Err(unsupported("join type other than INNER or LEFT")),
        };
        let on = match constraint {
            JoinConstraint::On(expr) => join_pairs(expr)?,
            _ => return Err(unsupported("join without ON condition")),
        };
        joins.push(JoinClause {
            kind,
            table: table_ref(&join.relation)?,
            on,
        });
    }

    let mut projection = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        projection.push(match item {
            SelectItem::UnnamedExpr(expr) => projection_item(expr, None)?,
            SelectItem::ExprWithAlias { expr, alias } => {
                projection_item(expr, Some(alias.value.clone()))?
            }
            SelectItem::Wildcard(_) => Projection::Wildcard,
            SelectItem::QualifiedWildcard(name, _) => {
                Projection::QualifiedWildcard(last_part(name)?)
            }
        });
    }

    let filter = select.selection.as_ref().map(filter_expr).transpose()?;

    let group_by = match &select.group_by {
        GroupByExpr::All => return Err(unsupported("GROUP BY ALL")),
        GroupByExpr::Expressions(exprs) => exprs
            .iter()
            .map(|e| column_ref(e).ok_or_else(|| unsupported("GROUP BY expression")))
            .collect::<Result<Vec<_>>>()?,
    };

    let aliases: Vec<String> = projection
        .iter()
        .filter_map(|p| match p {
            Projection::Column { alias, .. } | Projection::Aggregate { alias, .. } => alias.clone(),
            _ => None,
        })
        .collect();

    let mut order_by = Vec::with_capacity(query.order_by.len());
    for key in &query.order_by {
        let target = match (&key.expr, column_ref(&key.expr)) {
            (_, Some(col))
                if col.qualifier.is_none()
                    && aliases.iter().any(|a| a.eq_ignore_ascii_case(&col.column)) =>
            {
                OrderTarget::Alias(col.column)
            }
            (_, Some(col)) => OrderTarget::Column(col),
            (Expr::Function(func), None) => OrderTarget::Aggregate(aggregate(func)?),
            _ => return Err(unsupported("ORDER BY expression")),
        };
        order_by.push(OrderKey {
            target,
            descending: key.asc == Some(false),
        });
    }

    let limit = query.limit.as_ref().map(count_value).transpose()?;
    let offset = query
        .offset
        .as_ref()
        .map(|o| count_value(&o.value))
        .transpose()?;

    Ok(QueryCandidate {
        question: question.to_string(),
        shape: StatementShape::select(),
        from: Some(from),
        joins,
        projection,
        distinct,
        filter,
        group_by,
        order_by,
        limit,
        offset,
        semantic: SemanticHint::default(),
        raw_text: raw.to_string(),
        statement_text: statement_text.to_string(),
    })
}

fn last_part(name: &ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .ok_or_else(|| unsupported("empty name"))
}

fn table_ref(factor: &TableFactor) -> Result<TableRef> {
    match factor {
        TableFactor::Table {
            name, alias, args, ..
        } => {
            if args.is_some() {
                return Err(unsupported("table function"));
            }
            let table = match name.0.as_slice() {
                [table] => table.value.clone(),
                [schema, table] if schema.value.eq_ignore_ascii_case("public") => {
                    table.value.clone()
                }
                _ => return Err(unsupported("schema-qualified table")),
            };
            let alias = match alias {
                Some(a) if !a.columns.is_empty() => {
                    return Err(unsupported("column aliases on a table"))
                }
                Some(a) => Some(a.name.value.clone()),
                None => None,
            };
            Ok(TableRef { name: table, alias })
        }
        _ => Err(unsupported("derived table or table expression")),
    }
}

fn column_ref(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef::new(None, &ident.value)),
        Expr::CompoundIdentifier(parts) => match parts.as_slice() {
            [qualifier, column] => Some(ColumnRef::new(Some(&qualifier.value), &column.value)),
            [schema, qualifier, column] if schema.value.eq_ignore_ascii_case("public") => {
                Some(ColumnRef::new(Some(&qualifier.value), &column.value))
            }
            _ => None,
        },
        Expr::Nested(inner) => column_ref(inner),
        _ => None,
    }
}

fn join_pairs(expr: &Expr) -> Result<Vec<(ColumnRef, ColumnRef)>> {
    match expr {
        Expr::Nested(inner) => join_pairs(inner),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut pairs = join_pairs(left)?;
            pairs.extend(join_pairs(right)?);
            Ok(pairs)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => match (column_ref(left), column_ref(right)) {
            (Some(l), Some(r)) => Ok(vec![(l, r)]),
            _ => Err(unsupported("join condition other than column equality")),
        },
        _ => Err(unsupported("join condition other than column equality")),
    }
}

fn projection_item(expr: &Expr, alias: Option<String>) -> Result<Projection> {
    if let Some(column) = column_ref(expr) {
        return Ok(Projection::Column { column, alias });
    }
    match expr {
        Expr::Function(func) => Ok(Projection::Aggregate {
            aggregate: aggregate(func)?,
            alias,
        }),
        Expr::Nested(inner) => projection_item(inner, alias),
        _ => Err(unsupported("expression in select list")),
    }
}

fn aggregate(func: &Function) -> Result<Aggregate> {
    if func.over.is_some() {
        return Err(unsupported("window function"));
    }
    let name = last_part(&func.name)?;
    let agg = AggregateFunc::from_name(&name)
        .ok_or_else(|| unsupported("function other than COUNT, SUM, AVG, MIN or MAX"))?;

    let arg = match func.args.as_slice() {
        [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] if agg == AggregateFunc::Count => None,
        [FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))] => Some(
            column_ref(expr).ok_or_else(|| unsupported("aggregate over an expression"))?,
        ),
        _ => return Err(unsupported("aggregate arguments")),
    };

    Ok(Aggregate {
        func: agg,
        arg,
        distinct: func.distinct,
    })
}

fn count_value(expr: &Expr) -> Result<u64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n
            .parse()
            .map_err(|_| unsupported("non-integer LIMIT or OFFSET")),
        _ => Err(unsupported("non-literal LIMIT or OFFSET")),
    }
}

fn literal(expr: &Expr) -> Option<Literal> {
    match expr {
        Expr::Value(value) => match value {
            Value::Number(n, _) => n
                .parse::<i64>()
                .map(Literal::Integer)
                .ok()
                .or_else(|| n.parse::<f64>().ok().map(Literal::Float)),
            Value::SingleQuotedString(s) => Some(Literal::Text(s.clone())),
            Value::Boolean(b) => Some(Literal::Boolean(*b)),
            Value::Null => Some(Literal::Null),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Literal::Integer(i) => Some(Literal::Integer(-i)),
            Literal::Float(f) => Some(Literal::Float(-f)),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Plus,
            expr,
        } => match literal(expr)? {
            lit @ (Literal::Integer(_) | Literal::Float(_)) => Some(lit),
            _ => None,
        },
        Expr::TypedString { value, .. } => Some(Literal::Text(value.clone())),
        Expr::Cast { expr, .. } => match literal(expr)? {
            lit @ Literal::Text(_) => Some(lit),
            _ => None,
        },
        Expr::Nested(inner) => literal(inner),
        _ => None,
    }
}

fn compare_op(op: &BinaryOperator) -> Option<CompareOp> {
    match op {
        BinaryOperator::Eq => Some(CompareOp::Eq),
        BinaryOperator::NotEq => Some(CompareOp::NotEq),
        BinaryOperator::Lt => Some(CompareOp::Lt),
        BinaryOperator::LtEq => Some(CompareOp::LtEq),
        BinaryOperator::Gt => Some(CompareOp::Gt),
        BinaryOperator::GtEq => Some(CompareOp::GtEq),
        _ => None,
    }
}

fn predicate(column: ColumnRef, op: CompareOp, value: Operand) -> Filter {
    Filter::Compare(Predicate { column, op, value })
}

fn filter_expr(expr: &Expr) -> Result<Filter> {
    match expr {
        Expr::Nested(inner) => filter_expr(inner),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => Ok(Filter::All(flatten(
            filter_expr(left)?,
            filter_expr(right)?,
            true,
        ))),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => Ok(Filter::Any(flatten(
            filter_expr(left)?,
            filter_expr(right)?,
            false,
        ))),
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(Filter::Not(Box::new(filter_expr(expr)?))),
        Expr::BinaryOp { left, op, right } => {
            let op = compare_op(op).ok_or_else(|| unsupported("operator in WHERE clause"))?;
            match (column_ref(left), column_ref(right)) {
                (Some(l), Some(r)) => Ok(predicate(l, op, Operand::Column(r))),
                (Some(col), None) => {
                    let value = literal(right).ok_or_else(|| unsupported("comparison operand"))?;
                    Ok(predicate(col, op, Operand::Literal(value)))
                }
                (None, Some(col)) => {
                    let value = literal(left).ok_or_else(|| unsupported("comparison operand"))?;
                    Ok(predicate(col, op.flipped(), Operand::Literal(value)))
                }
                (None, None) => Err(unsupported("comparison without a column")),
            }
        }
        Expr::IsNull(inner) => {
            let col = column_ref(inner).ok_or_else(|| unsupported("IS NULL operand"))?;
            Ok(predicate(col, CompareOp::IsNull, Operand::None))
        }
        Expr::IsNotNull(inner) => {
            let col = column_ref(inner).ok_or_else(|| unsupported("IS NOT NULL operand"))?;
            Ok(predicate(col, CompareOp::IsNotNull, Operand::None))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let col = column_ref(expr).ok_or_else(|| unsupported("IN operand"))?;
            let values = list
                .iter()
                .map(|e| literal(e).ok_or_else(|| unsupported("IN list item")))
                .collect::<Result<Vec<_>>>()?;
            let op = if *negated { CompareOp::NotIn } else { CompareOp::In };
            Ok(predicate(col, op, Operand::List(values)))
        }
        Expr::Like {
            negated,
            expr,
            pattern,
            escape_char,
        } => {
            let op = if *negated { CompareOp::NotLike } else { CompareOp::Like };
            pattern_predicate(expr, pattern, escape_char.is_some(), op)
        }
        Expr::ILike {
            negated,
            expr,
            pattern,
            escape_char,
        } => {
            let op = if *negated { CompareOp::NotILike } else { CompareOp::ILike };
            pattern_predicate(expr, pattern, escape_char.is_some(), op)
        }
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let col = column_ref(expr).ok_or_else(|| unsupported("BETWEEN operand"))?;
            let low = literal(low).ok_or_else(|| unsupported("BETWEEN bound"))?;
            let high = literal(high).ok_or_else(|| unsupported("BETWEEN bound"))?;
            let range = Filter::All(vec![
                predicate(col.clone(), CompareOp::GtEq, Operand::Literal(low)),
                predicate(col, CompareOp::LtEq, Operand::Literal(high)),
            ]);
            Ok(if *negated {
                Filter::Not(Box::new(range))
            } else {
                range
            })
        }
        _ => Err(unsupported("expression in WHERE clause")),
    }
}

fn pattern_predicate(expr: &Expr, pattern: &Expr, escaped: bool, op: CompareOp) -> Result<Filter> {
    if escaped {
        return Err(unsupported("ESCAPE clause"));
    }
    let col = column_ref(expr).ok_or_else(|| unsupported("LIKE operand"))?;
    let value = literal(pattern).ok_or_else(|| unsupported("LIKE pattern"))?;
    Ok(predicate(col, op, Operand::Literal(value)))
}

fn flatten(left: Filter, right: Filter, conjunction: bool) -> Vec<Filter> {
    let mut out = Vec::new();
    for side in [left, right] {
        match side {
            Filter::All(items) if conjunction => out.extend(items),
            Filter::Any(items) if !conjunction => out.extend(items),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedModel(String);

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn complete(&self, _prompt: &Prompt) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct SlowModel;

    #[async_trait]
    impl LanguageModel for SlowModel {
        async fn complete(&self, _prompt: &Prompt) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("SELECT * FROM employees".to_string())
        }
    }

    fn parse(sql: &str) -> Result<QueryCandidate> {
        parse_candidate("test question", sql, &SchemaCatalog::builtin())
    }

    #[test]
    fn test_parses_join_with_filter() {
        let candidate = parse(
            "SELECT e.* FROM employees e JOIN departments d ON e.department_id = d.id \
             WHERE d.name = 'Engineering' LIMIT 50",
        )
        .unwrap();

        assert!(candidate.shape.is_single_retrieval());
        assert_eq!(candidate.from.as_ref().unwrap().qualifier(), "e");
        assert_eq!(candidate.joins.len(), 1);
        assert_eq!(candidate.joins[0].kind, JoinKind::Inner);
        assert_eq!(candidate.projection, vec![Projection::QualifiedWildcard("e".to_string())]);
        assert_eq!(
            candidate.filter,
            Some(Filter::Compare(Predicate {
                column: ColumnRef::new(Some("d"), "name"),
                op: CompareOp::Eq,
                value: Operand::Literal(Literal::Text("Engineering".to_string())),
            }))
        );
        assert_eq!(candidate.limit, Some(50));
        assert_eq!(candidate.semantic.table.as_deref(), Some("employees"));
    }

    #[test]
    fn test_extracts_fenced_sql() {
        let raw = "Here you go:\n```sql\nSELECT name FROM products\n```\nEnjoy";
        assert_eq!(extract_statement(raw), "SELECT name FROM products");
        let candidate = parse(raw).unwrap();
        assert_eq!(candidate.raw_text, raw);
        assert_eq!(candidate.statement_text, "SELECT name FROM products");
    }

    #[test]
    fn test_write_statement_records_shape_only() {
        let candidate = parse("DROP TABLE employees;").unwrap();
        assert_eq!(candidate.shape.verb, "DROP");
        assert!(candidate.from.is_none());

        let candidate = parse("delete from employees where id = 1").unwrap();
        assert_eq!(candidate.shape.verb, "DELETE");
    }

    #[test]
    fn test_multiple_statements_are_counted() {
        let candidate = parse("SELECT * FROM employees; DROP TABLE employees;").unwrap();
        assert_eq!(candidate.shape.statements, 2);
        assert!(!candidate.shape.is_single_retrieval());
    }

    #[test]
    fn test_comment_is_invisible_to_structure() {
        let raw = "SELECT * FROM employees -- DROP TABLE employees;";
        let candidate = parse(raw).unwrap();
        assert!(candidate.shape.is_single_retrieval());
        assert!(candidate.raw_text.contains("DROP"));
    }

    #[test]
    fn test_locking_and_into_are_not_retrievals() {
        let candidate = parse("SELECT * FROM employees FOR UPDATE").unwrap();
        assert_eq!(candidate.shape.verb, "SELECT FOR UPDATE");

        let candidate = parse("SELECT * INTO backup FROM employees").unwrap();
        assert_eq!(candidate.shape.verb, "SELECT INTO");
    }

    #[test]
    fn test_unsupported_constructs_fail_translation() {
        for sql in [
            "SELECT * FROM employees WHERE id IN (SELECT employee_id FROM orders)",
            "WITH x AS (SELECT 1) SELECT * FROM x",
            "SELECT name FROM employees UNION SELECT name FROM products",
            "SELECT upper(name) FROM employees",
            "SELECT 1",
            "not sql at all",
        ] {
            let err = parse(sql).unwrap_err();
            assert!(matches!(err, NlqError::TranslationFailure(_)), "{}", sql);
        }
    }

    #[test]
    fn test_literal_on_left_is_flipped() {
        let candidate = parse("SELECT * FROM employees WHERE 50000 < salary").unwrap();
        let filter = candidate.filter.unwrap();
        let predicates = filter.predicates();
        assert_eq!(predicates[0].op, CompareOp::Gt);
        assert_eq!(predicates[0].value, Operand::Literal(Literal::Integer(50000)));
    }

    #[test]
    fn test_between_and_date_literal() {
        let candidate = parse(
            "SELECT * FROM orders WHERE order_date BETWEEN DATE '2024-01-01' AND '2024-03-31' \
             AND order_total > 99.5",
        )
        .unwrap();
        let filter = candidate.filter.unwrap();
        let predicates = filter.predicates();
        assert_eq!(predicates.len(), 3);
        assert_eq!(
            predicates[0].value,
            Operand::Literal(Literal::Text("2024-01-01".to_string()))
        );
        assert_eq!(predicates[2].value, Operand::Literal(Literal::Float(99.5)));
    }

    #[test]
    fn test_aggregates_group_and_alias_ordering() {
        let candidate = parse(
            "SELECT d.name, AVG(e.salary) AS avg_salary FROM employees e \
             JOIN departments d ON e.department_id = d.id GROUP BY d.name ORDER BY avg_salary DESC",
        )
        .unwrap();
        assert!(candidate.has_aggregates());
        assert_eq!(candidate.group_by, vec![ColumnRef::new(Some("d"), "name")]);
        assert_eq!(
            candidate.order_by,
            vec![OrderKey {
                target: OrderTarget::Alias("avg_salary".to_string()),
                descending: true,
            }]
        );
        assert_eq!(candidate.limit, None);
    }

    #[test]
    fn test_count_star() {
        let candidate = parse("SELECT COUNT(*) FROM products").unwrap();
        match &candidate.projection[0] {
            Projection::Aggregate { aggregate, .. } => {
                assert_eq!(aggregate.func, AggregateFunc::Count);
                assert!(aggregate.arg.is_none());
            }
            other => panic!("unexpected projection {:?}", other),
        }
    }

    #[test]
    fn test_fuzzy_detection() {
        assert!(is_fuzzy_question("products like a wireless keyboard"));
        assert!(is_fuzzy_question("find items similar to the office chair"));
        assert!(is_fuzzy_question("orders similar to order 12"));
        assert!(is_fuzzy_question("something like a standing desk"));
        assert!(!is_fuzzy_question("Show all employees in Engineering"));
        assert!(!is_fuzzy_question("I would like a list of all employees in Sales"));
        assert!(!is_fuzzy_question("I'd like the top 5 products"));
        assert!(!is_fuzzy_question("What kind of products do we sell?"));
        assert!(!is_fuzzy_question("Show me orders close to last month"));
        assert!(!is_fuzzy_question("Which products sort of sell best?"));
    }

    #[test]
    fn test_prompt_carries_schema_examples_and_limit() {
        let translator =
            QueryTranslator::new(Arc::new(FixedModel(String::new())), Duration::from_secs(1), 25);
        let prompt = translator.build_prompt("Who earns the most?", &SchemaCatalog::builtin());
        assert!(prompt.user.contains("employees.department_id -> departments.id"));
        assert!(prompt.user.contains("Question: Show all employees in Engineering"));
        assert!(prompt.user.contains("LIMIT 25"));
        assert!(prompt.user.ends_with("Question: Who earns the most?\nSQL:"));
    }

    #[tokio::test]
    async fn test_translate_rejects_empty_question() {
        let translator =
            QueryTranslator::new(Arc::new(FixedModel(String::new())), Duration::from_secs(1), 50);
        let err = translator
            .translate("   ", &SchemaCatalog::builtin())
            .await
            .unwrap_err();
        assert!(matches!(err, NlqError::TranslationFailure(_)));
    }

    #[tokio::test]
    async fn test_translate_times_out() {
        let translator =
            QueryTranslator::new(Arc::new(SlowModel), Duration::from_millis(20), 50);
        let err = translator
            .translate("all employees", &SchemaCatalog::builtin())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_translate_uses_model_output() {
        let model = FixedModel("```sql\nSELECT * FROM products WHERE price < 100\n```".to_string());
        let translator = QueryTranslator::new(Arc::new(model), Duration::from_secs(1), 50);
        let candidate = translator
            .translate("products like a mouse under $100", &SchemaCatalog::builtin())
            .await
            .unwrap();
        assert!(candidate.semantic.fuzzy);
        assert_eq!(candidate.semantic.table.as_deref(), Some("products"));
    }
}
