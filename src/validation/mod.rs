//! Query Validator
//!
//! Runs the candidate through an ordered chain of independent rules; the
//! first rejection wins. An accepted candidate comes back as an
//! `AcceptedQuery`, which only this module can construct and which already
//! holds the parameterized SQL the executor will run.

pub mod rules;
pub mod scope;

pub use rules::{
    KeywordBlocklistRule, RowLimitRule, SchemaReferenceRule, StatementShapeRule, TypeCheckRule,
    ValidationRule,
};

use crate::candidate::QueryCandidate;
use crate::catalog::SchemaCatalog;
use crate::error::{NlqError, RejectReason, Rejection, Result};
use crate::sql_compiler::{CompiledQuery, SqlCompiler};
use tracing::{debug, warn};

/// Rule name reported when the compiler refuses a candidate the rules let through.
pub const SERIALIZER_RULE: &str = "allowlist_serializer";

/// A candidate that passed every rule, with its compiled form.
#[derive(Debug, Clone)]
pub struct AcceptedQuery {
    candidate: QueryCandidate,
    compiled: CompiledQuery,
    limit: u64,
    rule: &'static str,
    note: String,
}

impl AcceptedQuery {
    pub fn candidate(&self) -> &QueryCandidate {
        &self.candidate
    }

    pub fn compiled(&self) -> &CompiledQuery {
        &self.compiled
    }

    /// Enforced row ceiling for this request.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Rule that left the last observation, e.g. `row_limit`.
    pub fn rule(&self) -> &'static str {
        self.rule
    }

    /// Observation left on acceptance, e.g. "limit clamped".
    pub fn note(&self) -> &str {
        &self.note
    }
}

#[derive(Debug, Clone)]
pub enum ValidationVerdict {
    Accepted(AcceptedQuery),
    Rejected(Rejection),
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted(_))
    }

    /// Name of the rule that decided the verdict.
    pub fn rule(&self) -> &'static str {
        match self {
            ValidationVerdict::Accepted(q) => q.rule,
            ValidationVerdict::Rejected(r) => r.rule,
        }
    }

    pub fn into_result(self) -> Result<AcceptedQuery> {
        match self {
            ValidationVerdict::Accepted(q) => Ok(q),
            ValidationVerdict::Rejected(r) => Err(NlqError::Rejected(r)),
        }
    }
}

pub struct QueryValidator {
    rules: Vec<Box<dyn ValidationRule>>,
    max_rows: u64,
}

impl QueryValidator {
    /// The standard chain: shape, blocklist, schema references, types, row limit.
    pub fn new(max_rows: u64) -> Self {
        Self {
            rules: vec![
                Box::new(StatementShapeRule),
                Box::new(KeywordBlocklistRule),
                Box::new(SchemaReferenceRule),
                Box::new(TypeCheckRule),
                Box::new(RowLimitRule { max_rows }),
            ],
            max_rows,
        }
    }

    /// Append a rule after the standard chain.
    pub fn with_rule(mut self, rule: Box<dyn ValidationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    pub fn validate(&self, candidate: QueryCandidate, schema: &SchemaCatalog) -> ValidationVerdict {
        let mut candidate = candidate;
        let mut decided_by = "none";
        let mut note = String::from("accepted");

        for rule in &self.rules {
            match rule.check(&mut candidate, schema) {
                Ok(Some(observation)) => {
                    debug!(rule = rule.name(), note = %observation, "rule passed");
                    decided_by = rule.name();
                    note = observation;
                }
                Ok(None) => {}
                Err(reason) => {
                    warn!("🚫 Candidate rejected by {}: {}", rule.name(), reason);
                    return ValidationVerdict::Rejected(Rejection::new(rule.name(), reason));
                }
            }
        }

        // The ceiling holds even if a custom chain left the limit alone
        let limit = candidate
            .limit
            .map(|l| l.min(self.max_rows))
            .unwrap_or(self.max_rows);
        candidate.limit = Some(limit);

        match SqlCompiler::new(schema).compile(&candidate, limit) {
            Ok(compiled) => ValidationVerdict::Accepted(AcceptedQuery {
                candidate,
                compiled,
                limit,
                rule: decided_by,
                note,
            }),
            Err(e) => {
                warn!("🚫 Candidate could not be serialized: {}", e);
                ValidationVerdict::Rejected(Rejection::new(
                    SERIALIZER_RULE,
                    RejectReason::UnsafeStatementShape(
                        "query cannot be expressed with the allowed clauses".to_string(),
                    ),
                ))
            }
        }
    }
}
