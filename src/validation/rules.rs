//! Validation rules, one per concern. Each rule sees the candidate on its
//! own and either passes it (optionally with a note) or names what is wrong.

use super::scope::{ScopeError, TableScope};
use crate::candidate::{
    Aggregate, AggregateFunc, ColumnRef, CompareOp, Literal, Operand, OrderTarget, Projection,
    QueryCandidate,
};
use crate::catalog::{ColumnType, SchemaCatalog, TypeCategory};
use crate::error::RejectReason;
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;

pub type RuleResult = std::result::Result<Option<String>, RejectReason>;

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(Some(note))` passes with an observation, `Err` rejects.
    fn check(&self, candidate: &mut QueryCandidate, schema: &SchemaCatalog) -> RuleResult;
}

/// Exactly one plain SELECT with a target table. A failing statement that
/// carries a blocked word (`DROP`, `DELETE`, ...) is reported by that word.
pub struct StatementShapeRule;

impl StatementShapeRule {
    fn shape_error(candidate: &QueryCandidate) -> Option<String> {
        let shape = &candidate.shape;
        if shape.statements != 1 {
            return Some(format!(
                "{} statements where exactly one is allowed",
                shape.statements
            ));
        }
        if !shape.is_single_retrieval() {
            return Some(format!("{} is not a read-only retrieval", shape.verb));
        }
        if candidate.from.is_none() {
            return Some("retrieval without a target table".to_string());
        }
        None
    }
}

impl ValidationRule for StatementShapeRule {
    fn name(&self) -> &'static str {
        "statement_shape"
    }

    fn check(&self, candidate: &mut QueryCandidate, _schema: &SchemaCatalog) -> RuleResult {
        match Self::shape_error(candidate) {
            None => Ok(None),
            Some(detail) => match KeywordBlocklistRule::find_blocked_word(&candidate.raw_text) {
                Some(word) => Err(RejectReason::BlockedKeyword(word)),
                None => Err(RejectReason::UnsafeStatementShape(detail)),
            },
        }
    }
}

/// Tokens that never belong in a read query, checked in this order.
pub const BLOCKED_WORDS: &[&str] = &[
    // data definition
    "DROP", "ALTER", "CREATE", "TRUNCATE", "RENAME", "GRANT", "REVOKE",
    // data modification
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "COPY",
    // transaction control
    "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT",
    // procedures and execution
    "EXEC", "EXECUTE", "CALL", "PREPARE", "DEALLOCATE", "VACUUM",
    // server-side functions with side effects
    "PG_SLEEP", "PG_READ_FILE", "LO_IMPORT", "DBLINK",
];

pub const BLOCKED_SEQUENCES: &[&str] = &["--", "/*", "*/"];

lazy_static::lazy_static! {
    static ref BLOCKED_PATTERNS: Vec<(&'static str, Regex)> = BLOCKED_WORDS
        .iter()
        .map(|word| (*word, Regex::new(&format!(r"(?i)\b{}\b", word)).unwrap()))
        .collect();
}

/// Case-insensitive scan of the raw model text.
pub struct KeywordBlocklistRule;

impl KeywordBlocklistRule {
    /// First blocked token found in `raw` / `statement`, if any.
    pub fn find_blocked(raw: &str, statement: &str) -> Option<String> {
        if let Some(word) = Self::find_blocked_word(raw) {
            return Some(word);
        }
        for seq in BLOCKED_SEQUENCES {
            if raw.contains(seq) {
                return Some(seq.to_string());
            }
        }
        if has_separator_outside_literals(statement) {
            return Some(";".to_string());
        }
        None
    }

    /// First blocked word in `raw`, ignoring the punctuation sequences.
    /// String literals are not masked, so `'Update Kit'` matches `UPDATE`.
    pub fn find_blocked_word(raw: &str) -> Option<String> {
        BLOCKED_PATTERNS
            .iter()
            .find(|(_, pattern)| pattern.is_match(raw))
            .map(|(word, _)| word.to_string())
    }
}

impl ValidationRule for KeywordBlocklistRule {
    fn name(&self) -> &'static str {
        "keyword_blocklist"
    }

    fn check(&self, candidate: &mut QueryCandidate, _schema: &SchemaCatalog) -> RuleResult {
        match Self::find_blocked(&candidate.raw_text, &candidate.statement_text) {
            Some(token) => Err(RejectReason::BlockedKeyword(token)),
            None => Ok(None),
        }
    }
}

/// A `;` outside quotes that is followed by anything but whitespace.
fn has_separator_outside_literals(statement: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    for (idx, ch) in statement.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' if !in_single && !in_double => {
                if !statement[idx + 1..].trim().is_empty() {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn suggest<'s>(name: &str, known: impl IntoIterator<Item = &'s str>) -> Option<String> {
    known
        .into_iter()
        .map(|k| (k, strsim::jaro_winkler(&name.to_lowercase(), &k.to_lowercase())))
        .filter(|(_, score)| *score >= 0.8)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(k, _)| k.to_string())
}

fn scope_rejection(err: ScopeError, scope: Option<&TableScope<'_>>, schema: &SchemaCatalog) -> RejectReason {
    let unknown = |name: String, suggestion: Option<String>| RejectReason::UnknownIdentifier {
        name,
        suggestion,
    };
    match err {
        ScopeError::NoTable => {
            RejectReason::UnsafeStatementShape("retrieval without a target table".to_string())
        }
        ScopeError::UnknownTable(name) => {
            let suggestion = suggest(&name, schema.table_names());
            unknown(name, suggestion)
        }
        ScopeError::DuplicateQualifier(name) => unknown(name, None),
        ScopeError::UnknownQualifier(name) => {
            let suggestion = scope.and_then(|s| suggest(&name, s.qualifiers()));
            unknown(name, suggestion)
        }
        ScopeError::UnknownColumn(name) => {
            let suggestion = scope.and_then(|s| suggest(&name, s.column_names()));
            unknown(name, suggestion)
        }
        ScopeError::AmbiguousColumn { column, example } => unknown(column, Some(example)),
    }
}

/// Every table, alias and column must exist in the catalog.
pub struct SchemaReferenceRule;

impl ValidationRule for SchemaReferenceRule {
    fn name(&self) -> &'static str {
        "schema_reference"
    }

    fn check(&self, candidate: &mut QueryCandidate, schema: &SchemaCatalog) -> RuleResult {
        let scope = TableScope::build(candidate, schema)
            .map_err(|e| scope_rejection(e, None, schema))?;

        for item in &candidate.projection {
            if let Projection::QualifiedWildcard(q) = item {
                if scope.entry(q).is_none() {
                    return Err(scope_rejection(
                        ScopeError::UnknownQualifier(q.clone()),
                        Some(&scope),
                        schema,
                    ));
                }
            }
        }

        for col in candidate.column_refs() {
            scope
                .resolve(col)
                .map_err(|e| scope_rejection(e, Some(&scope), schema))?;
        }

        let aliases = candidate.output_aliases();
        for key in &candidate.order_by {
            if let OrderTarget::Alias(name) = &key.target {
                if !aliases.iter().any(|a| a.eq_ignore_ascii_case(name)) {
                    scope
                        .resolve(&ColumnRef::new(None, name))
                        .map_err(|e| scope_rejection(e, Some(&scope), schema))?;
                }
            }
        }
        Ok(None)
    }
}

/// Predicates, join keys and aggregates must agree with declared column types.
pub struct TypeCheckRule;

impl TypeCheckRule {
    fn category_name(category: TypeCategory) -> String {
        category.to_string()
    }

    fn check_literal(column: &ColumnRef, data_type: ColumnType, lit: &Literal) -> Result<(), RejectReason> {
        let mismatch = |expected: String, actual: &str| RejectReason::TypeMismatch {
            column: column.to_string(),
            expected,
            actual: actual.to_string(),
        };
        let category = data_type.category();
        match (category, lit) {
            (_, Literal::Null) => Err(mismatch(
                format!("{} value (use IS NULL for missing values)", category),
                "null",
            )),
            (TypeCategory::Numeric, Literal::Integer(_) | Literal::Float(_)) => Ok(()),
            (TypeCategory::Text, Literal::Text(_)) => Ok(()),
            (TypeCategory::Boolean, Literal::Boolean(_)) => Ok(()),
            (TypeCategory::Temporal, Literal::Text(s)) => {
                if parses_as(data_type, s) {
                    Ok(())
                } else {
                    let expected = match data_type {
                        ColumnType::Date => "date (YYYY-MM-DD)",
                        _ => "timestamp (YYYY-MM-DD HH:MM:SS)",
                    };
                    Err(mismatch(expected.to_string(), "unparseable text"))
                }
            }
            (category, other) => Err(mismatch(Self::category_name(category), other.kind_name())),
        }
    }

    fn check_aggregate(agg: &Aggregate, scope: &TableScope<'_>) -> Result<(), RejectReason> {
        if !matches!(agg.func, AggregateFunc::Sum | AggregateFunc::Avg) {
            return Ok(());
        }
        if let Some(arg) = &agg.arg {
            let (_, column) = scope
                .resolve(arg)
                .map_err(|_| unknown_column(arg))?;
            let category = column.data_type.category();
            if category != TypeCategory::Numeric {
                return Err(RejectReason::TypeMismatch {
                    column: arg.to_string(),
                    expected: TypeCategory::Numeric.to_string(),
                    actual: category.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn unknown_column(col: &ColumnRef) -> RejectReason {
    RejectReason::UnknownIdentifier {
        name: col.column.clone(),
        suggestion: None,
    }
}

/// Whether `value` is a valid literal for a temporal column type.
pub fn parses_as(data_type: ColumnType, value: &str) -> bool {
    let value = value.trim();
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok();
    match data_type {
        ColumnType::Date => date,
        ColumnType::Timestamp => {
            date || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
                || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
        }
        _ => false,
    }
}

impl ValidationRule for TypeCheckRule {
    fn name(&self) -> &'static str {
        "type_check"
    }

    fn check(&self, candidate: &mut QueryCandidate, schema: &SchemaCatalog) -> RuleResult {
        let scope = TableScope::build(candidate, schema)
            .map_err(|e| scope_rejection(e, None, schema))?;
        let column_type = |col: &ColumnRef| {
            scope
                .resolve(col)
                .map(|(_, c)| c.data_type)
                .map_err(|_| unknown_column(col))
        };

        for join in &candidate.joins {
            for (left, right) in &join.on {
                let (l, r) = (column_type(left)?.category(), column_type(right)?.category());
                if l != r {
                    return Err(RejectReason::TypeMismatch {
                        column: right.to_string(),
                        expected: l.to_string(),
                        actual: r.to_string(),
                    });
                }
            }
        }

        if let Some(filter) = &candidate.filter {
            for predicate in filter.predicates() {
                let data_type = column_type(&predicate.column)?;
                let column = &predicate.column;

                if predicate.op.is_pattern() && data_type.category() != TypeCategory::Text {
                    return Err(RejectReason::TypeMismatch {
                        column: column.to_string(),
                        expected: TypeCategory::Text.to_string(),
                        actual: data_type.category().to_string(),
                    });
                }

                match (&predicate.op, &predicate.value) {
                    (CompareOp::IsNull | CompareOp::IsNotNull, Operand::None) => {}
                    (CompareOp::IsNull | CompareOp::IsNotNull, _) | (_, Operand::None) => {
                        return Err(RejectReason::TypeMismatch {
                            column: column.to_string(),
                            expected: "operand matching operator".to_string(),
                            actual: format!("{} with mismatched operand", predicate.op.sql()),
                        })
                    }
                    (CompareOp::In | CompareOp::NotIn, Operand::List(items)) => {
                        for item in items {
                            Self::check_literal(column, data_type, item)?;
                        }
                    }
                    (CompareOp::In | CompareOp::NotIn, _) | (_, Operand::List(_)) => {
                        return Err(RejectReason::TypeMismatch {
                            column: column.to_string(),
                            expected: "value list for IN".to_string(),
                            actual: format!("{} with mismatched operand", predicate.op.sql()),
                        })
                    }
                    (_, Operand::Literal(lit)) => Self::check_literal(column, data_type, lit)?,
                    (_, Operand::Column(other)) => {
                        let other_type = column_type(other)?;
                        if other_type.category() != data_type.category() {
                            return Err(RejectReason::TypeMismatch {
                                column: other.to_string(),
                                expected: data_type.category().to_string(),
                                actual: other_type.category().to_string(),
                            });
                        }
                    }
                }
            }
        }

        for item in &candidate.projection {
            if let Projection::Aggregate { aggregate, .. } = item {
                Self::check_aggregate(aggregate, &scope)?;
            }
        }
        for key in &candidate.order_by {
            if let OrderTarget::Aggregate(aggregate) = &key.target {
                Self::check_aggregate(aggregate, &scope)?;
            }
        }
        Ok(None)
    }
}

/// Enforces the row ceiling by rewriting the limit; never rejects.
pub struct RowLimitRule {
    pub max_rows: u64,
}

impl ValidationRule for RowLimitRule {
    fn name(&self) -> &'static str {
        "row_limit"
    }

    fn check(&self, candidate: &mut QueryCandidate, _schema: &SchemaCatalog) -> RuleResult {
        let note = match candidate.limit {
            None => {
                candidate.limit = Some(self.max_rows);
                "limit inserted"
            }
            Some(requested) if requested > self.max_rows => {
                candidate.limit = Some(self.max_rows);
                "limit clamped"
            }
            Some(_) => "limit within bound",
        };
        Ok(Some(note.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::parse_candidate;

    fn candidate(sql: &str) -> QueryCandidate {
        parse_candidate("test question", sql, &SchemaCatalog::builtin()).unwrap()
    }

    fn run(rule: &dyn ValidationRule, sql: &str) -> RuleResult {
        rule.check(&mut candidate(sql), &SchemaCatalog::builtin())
    }

    #[test]
    fn test_shape_rule() {
        assert!(run(&StatementShapeRule, "SELECT * FROM employees").is_ok());
        assert!(matches!(
            run(&StatementShapeRule, "SELECT * FROM employees; SELECT * FROM products"),
            Err(RejectReason::UnsafeStatementShape(_))
        ));
        assert!(matches!(
            run(&StatementShapeRule, "EXPLAIN SELECT * FROM employees"),
            Err(RejectReason::UnsafeStatementShape(_))
        ));
    }

    #[test]
    fn test_shape_rule_names_blocked_verb() {
        assert_eq!(
            run(&StatementShapeRule, "UPDATE employees SET salary = 0"),
            Err(RejectReason::BlockedKeyword("UPDATE".to_string()))
        );
        assert_eq!(
            run(&StatementShapeRule, "DROP TABLE employees;"),
            Err(RejectReason::BlockedKeyword("DROP".to_string()))
        );
        assert_eq!(
            run(&StatementShapeRule, "SELECT * FROM employees; DROP TABLE employees;"),
            Err(RejectReason::BlockedKeyword("DROP".to_string()))
        );
    }

    #[test]
    fn test_blocklist_is_case_insensitive_whole_word() {
        assert_eq!(
            KeywordBlocklistRule::find_blocked("select 1 -- dRoP table x", "select 1"),
            Some("DROP".to_string())
        );
        assert_eq!(
            KeywordBlocklistRule::find_blocked(
                "SELECT created_at, is_deleted FROM t",
                "SELECT created_at, is_deleted FROM t"
            ),
            None
        );
        assert_eq!(
            KeywordBlocklistRule::find_blocked("SELECT 1 /* hi */", "SELECT 1 /* hi */"),
            Some("/*".to_string())
        );
    }

    #[test]
    fn test_blocked_word_inside_literal_still_rejects() {
        let sql = "SELECT * FROM products WHERE name = 'Update Kit'";
        assert_eq!(
            KeywordBlocklistRule::find_blocked(sql, sql),
            Some("UPDATE".to_string())
        );
        assert_eq!(
            run(
                &KeywordBlocklistRule,
                "SELECT * FROM employees WHERE name = 'Grace Begin'"
            ),
            Err(RejectReason::BlockedKeyword("BEGIN".to_string()))
        );
    }

    #[test]
    fn test_separator_only_outside_literals() {
        assert!(!has_separator_outside_literals("SELECT * FROM t WHERE name = 'a;b'"));
        assert!(!has_separator_outside_literals("SELECT * FROM t;  "));
        assert!(has_separator_outside_literals("SELECT * FROM t; SELECT 1"));
        assert!(has_separator_outside_literals("SELECT 'it''s'; SELECT 2"));
    }

    #[test]
    fn test_schema_rule_reports_unknown_column_with_suggestion() {
        let err = run(&SchemaReferenceRule, "SELECT name, salary_usd FROM employees").unwrap_err();
        assert_eq!(
            err,
            RejectReason::UnknownIdentifier {
                name: "salary_usd".to_string(),
                suggestion: Some("salary".to_string()),
            }
        );
    }

    #[test]
    fn test_schema_rule_unknown_table_and_alias() {
        let err = run(&SchemaReferenceRule, "SELECT * FROM employee").unwrap_err();
        assert_eq!(
            err,
            RejectReason::UnknownIdentifier {
                name: "employee".to_string(),
                suggestion: Some("employees".to_string()),
            }
        );

        let err = run(&SchemaReferenceRule, "SELECT x.* FROM employees e").unwrap_err();
        assert!(matches!(err, RejectReason::UnknownIdentifier { name, .. } if name == "x"));
    }

    #[test]
    fn test_schema_rule_ambiguous_column() {
        let err = run(
            &SchemaReferenceRule,
            "SELECT name FROM employees e JOIN departments d ON e.department_id = d.id",
        )
        .unwrap_err();
        assert_eq!(
            err,
            RejectReason::UnknownIdentifier {
                name: "name".to_string(),
                suggestion: Some("e.name".to_string()),
            }
        );
    }

    #[test]
    fn test_type_rule_rejects_text_against_numeric() {
        let err = run(&TypeCheckRule, "SELECT * FROM employees WHERE salary = 'high'").unwrap_err();
        assert_eq!(
            err,
            RejectReason::TypeMismatch {
                column: "salary".to_string(),
                expected: "numeric".to_string(),
                actual: "text".to_string(),
            }
        );
    }

    #[test]
    fn test_type_rule_cases() {
        assert!(run(&TypeCheckRule, "SELECT * FROM employees").is_ok());
        assert!(run(&TypeCheckRule, "SELECT * FROM employees WHERE salary > 80000.5").is_ok());
        assert!(run(&TypeCheckRule, "SELECT * FROM orders WHERE order_date >= '2024-01-01'").is_ok());
        assert!(run(&TypeCheckRule, "SELECT * FROM orders WHERE order_date >= 'last week'").is_err());
        assert!(run(&TypeCheckRule, "SELECT * FROM products WHERE price LIKE '1%'").is_err());
        assert!(run(&TypeCheckRule, "SELECT * FROM employees WHERE email = NULL").is_err());
        assert!(run(&TypeCheckRule, "SELECT * FROM employees WHERE email IS NULL").is_ok());
        assert!(run(&TypeCheckRule, "SELECT SUM(name) FROM employees").is_err());
        assert!(run(&TypeCheckRule, "SELECT department_id, AVG(salary) FROM employees GROUP BY department_id").is_ok());
        assert!(run(&TypeCheckRule, "SELECT * FROM employees WHERE id IN (1, 2, 'x')").is_err());
        assert!(run(
            &TypeCheckRule,
            "SELECT * FROM employees e JOIN departments d ON e.name = d.id"
        )
        .is_err());
    }

    #[test]
    fn test_row_limit_rule_inserts_and_clamps() {
        let rule = RowLimitRule { max_rows: 50 };
        let schema = SchemaCatalog::builtin();

        let mut c = candidate("SELECT * FROM employees");
        assert_eq!(rule.check(&mut c, &schema).unwrap().as_deref(), Some("limit inserted"));
        assert_eq!(c.limit, Some(50));

        let mut c = candidate("SELECT * FROM employees LIMIT 1000");
        assert_eq!(rule.check(&mut c, &schema).unwrap().as_deref(), Some("limit clamped"));
        assert_eq!(c.limit, Some(50));

        let mut c = candidate("SELECT * FROM employees LIMIT 5");
        assert_eq!(rule.check(&mut c, &schema).unwrap().as_deref(), Some("limit within bound"));
        assert_eq!(c.limit, Some(5));
    }
}
