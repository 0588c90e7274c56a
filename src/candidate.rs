//! Query Candidate
//!
//! The translator's structured, unexecuted read query. Validation reasons
//! over these fields; the raw model text rides along for auditing only.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the model's text turned out to be at statement level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementShape {
    /// Number of statements in the model text
    pub statements: usize,
    /// Leading verb of the first statement, e.g. `SELECT`, `DROP`, `SELECT INTO`
    pub verb: String,
}

impl StatementShape {
    pub fn select() -> Self {
        Self {
            statements: 1,
            verb: "SELECT".to_string(),
        }
    }

    pub fn is_single_retrieval(&self) -> bool {
        self.statements == 1 && self.verb == "SELECT"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// The name other clauses use to qualify this table's columns.
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub table: TableRef,
    /// Column pairs that must be equal
    pub on: Vec<(ColumnRef, ColumnRef)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn new(qualifier: Option<&str>, column: &str) -> Self {
        Self {
            qualifier: qualifier.map(str::to_string),
            column: column.to_string(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}.{}", q, self.column),
            None => f.write_str(&self.column),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunc::Count),
            "SUM" => Some(AggregateFunc::Sum),
            "AVG" => Some(AggregateFunc::Avg),
            "MIN" => Some(AggregateFunc::Min),
            "MAX" => Some(AggregateFunc::Max),
            _ => None,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub func: AggregateFunc,
    /// `None` means `COUNT(*)`
    pub arg: Option<ColumnRef>,
    pub distinct: bool,
}

impl Aggregate {
    pub fn default_name(&self) -> String {
        match &self.arg {
            Some(col) => format!("{}_{}", self.func.sql_name().to_lowercase(), col.column),
            None => self.func.sql_name().to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// `*`
    Wildcard,
    /// `t.*`
    QualifiedWildcard(String),
    Column {
        column: ColumnRef,
        alias: Option<String>,
    },
    Aggregate {
        aggregate: Aggregate,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Null,
}

impl Literal {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Literal::Integer(_) => "integer",
            Literal::Float(_) => "decimal",
            Literal::Text(_) => "text",
            Literal::Boolean(_) => "boolean",
            Literal::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    NotLike,
    ILike,
    NotILike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
            CompareOp::ILike => "ILIKE",
            CompareOp::NotILike => "NOT ILIKE",
            CompareOp::In => "IN",
            CompareOp::NotIn => "NOT IN",
            CompareOp::IsNull => "IS NULL",
            CompareOp::IsNotNull => "IS NOT NULL",
        }
    }

    /// Operator with its operands swapped (`5 < x` becomes `x > 5`).
    pub fn flipped(&self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
            other => *other,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            CompareOp::Like | CompareOp::NotLike | CompareOp::ILike | CompareOp::NotILike
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    None,
    Literal(Literal),
    List(Vec<Literal>),
    Column(ColumnRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: ColumnRef,
    pub op: CompareOp,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Not(Box<Filter>),
    Compare(Predicate),
}

impl Filter {
    /// Every leaf predicate, left to right.
    pub fn predicates(&self) -> Vec<&Predicate> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Predicate>) {
        match self {
            Filter::All(items) | Filter::Any(items) => {
                for item in items {
                    item.collect(out);
                }
            }
            Filter::Not(inner) => inner.collect(out),
            Filter::Compare(p) => out.push(p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderTarget {
    Column(ColumnRef),
    Aggregate(Aggregate),
    /// A bare name that may refer to an output alias
    Alias(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderKey {
    pub target: OrderTarget,
    pub descending: bool,
}

/// Whether semantic retrieval should run alongside the exact query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticHint {
    pub fuzzy: bool,
    pub table: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCandidate {
    pub question: String,
    pub shape: StatementShape,
    /// Base table; absent for non-retrieval shapes
    pub from: Option<TableRef>,
    pub joins: Vec<JoinClause>,
    pub projection: Vec<Projection>,
    pub distinct: bool,
    pub filter: Option<Filter>,
    pub group_by: Vec<ColumnRef>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub semantic: SemanticHint,
    /// Model output exactly as received
    pub raw_text: String,
    /// The statement text extracted from `raw_text`
    pub statement_text: String,
}

impl QueryCandidate {
    /// A candidate for a statement that is not a retrieval; carries no query parts.
    pub fn non_retrieval(
        question: &str,
        shape: StatementShape,
        raw_text: &str,
        statement_text: &str,
    ) -> Self {
        Self {
            question: question.to_string(),
            shape,
            from: None,
            joins: Vec::new(),
            projection: Vec::new(),
            distinct: false,
            filter: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            semantic: SemanticHint::default(),
            raw_text: raw_text.to_string(),
            statement_text: statement_text.to_string(),
        }
    }

    /// Base table followed by joined tables.
    pub fn tables(&self) -> Vec<&TableRef> {
        self.from
            .iter()
            .chain(self.joins.iter().map(|j| &j.table))
            .collect()
    }

    pub fn has_aggregates(&self) -> bool {
        self.projection
            .iter()
            .any(|p| matches!(p, Projection::Aggregate { .. }))
    }

    /// Every column reference in the query, including join conditions.
    pub fn column_refs(&self) -> Vec<&ColumnRef> {
        let mut refs = Vec::new();
        for join in &self.joins {
            for (left, right) in &join.on {
                refs.push(left);
                refs.push(right);
            }
        }
        for item in &self.projection {
            match item {
                Projection::Column { column, .. } => refs.push(column),
                Projection::Aggregate { aggregate, .. } => {
                    if let Some(arg) = &aggregate.arg {
                        refs.push(arg);
                    }
                }
                Projection::Wildcard | Projection::QualifiedWildcard(_) => {}
            }
        }
        if let Some(filter) = &self.filter {
            for predicate in filter.predicates() {
                refs.push(&predicate.column);
                if let Operand::Column(other) = &predicate.value {
                    refs.push(other);
                }
            }
        }
        refs.extend(self.group_by.iter());
        for key in &self.order_by {
            match &key.target {
                OrderTarget::Column(col) => refs.push(col),
                OrderTarget::Aggregate(agg) => {
                    if let Some(arg) = &agg.arg {
                        refs.push(arg);
                    }
                }
                OrderTarget::Alias(_) => {}
            }
        }
        refs
    }

    /// Output aliases declared in the projection.
    pub fn output_aliases(&self) -> Vec<&str> {
        self.projection
            .iter()
            .filter_map(|p| match p {
                Projection::Column { alias, .. } | Projection::Aggregate { alias, .. } => {
                    alias.as_deref()
                }
                _ => None,
            })
            .collect()
    }
}
