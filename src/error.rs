use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Translation failed: {0}")]
    TranslationFailure(String),

    #[error("Query rejected: {0}")]
    Rejected(Rejection),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, NlqError>;

/// Why a candidate was refused, with the rule that refused it.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub rule: &'static str,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    UnsafeStatementShape(String),
    BlockedKeyword(String),
    UnknownIdentifier {
        name: String,
        suggestion: Option<String>,
    },
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },
}

impl Rejection {
    pub fn new(rule: &'static str, reason: RejectReason) -> Self {
        Self { rule, reason }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.reason)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnsafeStatementShape(shape) => {
                write!(f, "unsafe statement shape: {}", shape)
            }
            RejectReason::BlockedKeyword(token) => write!(f, "blocked keyword: {}", token),
            RejectReason::UnknownIdentifier { name, suggestion } => match suggestion {
                Some(s) => write!(f, "unknown identifier: {} (did you mean {}?)", name, s),
                None => write!(f, "unknown identifier: {}", name),
            },
            RejectReason::TypeMismatch {
                column,
                expected,
                actual,
            } => write!(
                f,
                "type mismatch on {}: expected {}, found {}",
                column, expected, actual
            ),
        }
    }
}

impl From<Rejection> for NlqError {
    fn from(rejection: Rejection) -> Self {
        NlqError::Rejected(rejection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display_names_rule_and_token() {
        let rejection = Rejection::new(
            "keyword_blocklist",
            RejectReason::BlockedKeyword("DROP".to_string()),
        );
        let err: NlqError = rejection.into();
        assert_eq!(
            err.to_string(),
            "Query rejected: [keyword_blocklist] blocked keyword: DROP"
        );
    }

    #[test]
    fn test_unknown_identifier_with_suggestion() {
        let reason = RejectReason::UnknownIdentifier {
            name: "salary_usd".to_string(),
            suggestion: Some("salary".to_string()),
        };
        assert_eq!(
            reason.to_string(),
            "unknown identifier: salary_usd (did you mean salary?)"
        );
    }
}
