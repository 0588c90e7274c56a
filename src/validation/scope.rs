//! Table scope of a candidate: which qualifiers are in play and what they point at.

use crate::candidate::{ColumnRef, QueryCandidate};
use crate::catalog::{ColumnSchema, SchemaCatalog, TableSchema};

#[derive(Debug, Clone, PartialEq)]
pub enum ScopeError {
    NoTable,
    UnknownTable(String),
    DuplicateQualifier(String),
    UnknownQualifier(String),
    UnknownColumn(String),
    /// Unqualified column found in several tables; carries one qualified spelling
    AmbiguousColumn { column: String, example: String },
}

#[derive(Debug, Clone)]
pub struct ScopeEntry<'a> {
    pub qualifier: String,
    pub table: &'a TableSchema,
}

#[derive(Debug, Clone)]
pub struct TableScope<'a> {
    entries: Vec<ScopeEntry<'a>>,
}

impl<'a> TableScope<'a> {
    pub fn build(candidate: &QueryCandidate, schema: &'a SchemaCatalog) -> Result<Self, ScopeError> {
        let tables = candidate.tables();
        if tables.is_empty() {
            return Err(ScopeError::NoTable);
        }

        let mut entries: Vec<ScopeEntry<'a>> = Vec::with_capacity(tables.len());
        for table_ref in tables {
            let table = schema
                .table(&table_ref.name)
                .ok_or_else(|| ScopeError::UnknownTable(table_ref.name.clone()))?;
            let qualifier = table_ref.qualifier().to_string();
            if entries
                .iter()
                .any(|e| e.qualifier.eq_ignore_ascii_case(&qualifier))
            {
                return Err(ScopeError::DuplicateQualifier(qualifier));
            }
            entries.push(ScopeEntry { qualifier, table });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ScopeEntry<'a>] {
        &self.entries
    }

    pub fn entry(&self, qualifier: &str) -> Option<&ScopeEntry<'a>> {
        self.entries
            .iter()
            .find(|e| e.qualifier.eq_ignore_ascii_case(qualifier))
    }

    /// Base table of the query.
    pub fn primary(&self) -> &ScopeEntry<'a> {
        &self.entries[0]
    }

    pub fn resolve(&self, col: &ColumnRef) -> Result<(&ScopeEntry<'a>, &'a ColumnSchema), ScopeError> {
        match &col.qualifier {
            Some(q) => {
                let entry = self
                    .entry(q)
                    .ok_or_else(|| ScopeError::UnknownQualifier(q.clone()))?;
                let column = entry
                    .table
                    .column(&col.column)
                    .ok_or_else(|| ScopeError::UnknownColumn(col.column.clone()))?;
                Ok((entry, column))
            }
            None => {
                let mut hits = self
                    .entries
                    .iter()
                    .filter_map(|e| e.table.column(&col.column).map(|c| (e, c)));
                match (hits.next(), hits.next()) {
                    (Some(hit), None) => Ok(hit),
                    (Some((first, column)), Some(_)) => Err(ScopeError::AmbiguousColumn {
                        column: col.column.clone(),
                        example: format!("{}.{}", first.qualifier, column.name),
                    }),
                    (None, _) => Err(ScopeError::UnknownColumn(col.column.clone())),
                }
            }
        }
    }

    /// Column names visible in this scope, for suggestions.
    pub fn column_names(&self) -> Vec<&'a str> {
        self.entries
            .iter()
            .flat_map(|e| e.table.columns.iter().map(|c| c.name.as_str()))
            .collect()
    }

    pub fn qualifiers(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.qualifier.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::parse_candidate;

    #[test]
    fn test_resolves_aliases_and_flags_ambiguity() {
        let schema = SchemaCatalog::builtin();
        let candidate = parse_candidate(
            "q",
            "SELECT e.name FROM employees e JOIN departments d ON e.department_id = d.id",
            &schema,
        )
        .unwrap();
        let scope = TableScope::build(&candidate, &schema).unwrap();

        let (entry, column) = scope.resolve(&ColumnRef::new(Some("D"), "name")).unwrap();
        assert_eq!(entry.table.name, "departments");
        assert_eq!(column.name, "name");

        let (entry, _) = scope.resolve(&ColumnRef::new(None, "salary")).unwrap();
        assert_eq!(entry.qualifier, "e");

        assert_eq!(
            scope.resolve(&ColumnRef::new(None, "name")).unwrap_err(),
            ScopeError::AmbiguousColumn {
                column: "name".to_string(),
                example: "e.name".to_string()
            }
        );
        assert_eq!(
            scope.resolve(&ColumnRef::new(Some("employees"), "name")).unwrap_err(),
            ScopeError::UnknownQualifier("employees".to_string())
        );
    }

    #[test]
    fn test_unknown_table() {
        let schema = SchemaCatalog::builtin();
        let candidate = parse_candidate("q", "SELECT * FROM customers", &schema).unwrap();
        assert_eq!(
            TableScope::build(&candidate, &schema).unwrap_err(),
            ScopeError::UnknownTable("customers".to_string())
        );
    }
}
