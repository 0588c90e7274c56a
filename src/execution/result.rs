//! Result Set
//!
//! Merged rows of one request, each tagged with the path that produced it.

use crate::catalog::RowId;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::path::Path;

/// Column name to scalar value, in select-list order.
pub type EntityRow = Vec<(String, Value)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Exact,
    Semantic,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Exact => write!(f, "exact"),
            Provenance::Semantic => write!(f, "semantic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub provenance: Provenance,
    /// Table the row identifier belongs to, when there is one
    pub table: Option<String>,
    pub row_id: Option<RowId>,
    /// `1 - distance` for semantic rows
    pub similarity: Option<f32>,
    pub values: EntityRow,
}

impl ResultRow {
    pub fn exact(table: Option<String>, row_id: Option<RowId>, values: EntityRow) -> Self {
        Self {
            provenance: Provenance::Exact,
            table,
            row_id,
            similarity: None,
            values,
        }
    }

    pub fn semantic(table: String, row_id: RowId, similarity: f32, values: EntityRow) -> Self {
        Self {
            provenance: Provenance::Semantic,
            table: Some(table),
            row_id: Some(row_id),
            similarity: Some(similarity),
            values,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    pub rows: Vec<ResultRow>,
    /// Row ceiling the set was truncated to
    pub limit: u64,
}

impl ResultSet {
    pub fn new(rows: Vec<ResultRow>, limit: u64) -> Self {
        Self { rows, limit }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn count(&self, provenance: Provenance) -> usize {
        self.rows.iter().filter(|r| r.provenance == provenance).count()
    }

    /// Union of row columns in first-seen order.
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.rows {
            for (name, _) in &row.values {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        columns
    }

    pub fn write_csv_to<W: Write>(&self, writer: W) -> Result<()> {
        let columns = self.columns();
        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut header = vec!["provenance".to_string(), "similarity".to_string()];
        header.extend(columns.iter().cloned());
        csv_writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![
                row.provenance.to_string(),
                row.similarity.map(|s| format!("{:.4}", s)).unwrap_or_default(),
            ];
            record.extend(
                columns
                    .iter()
                    .map(|c| row.get(c).map(cell_text).unwrap_or_default()),
            );
            csv_writer.write_record(&record)?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_csv_to(file)
    }
}

/// Plain text of a scalar: strings unquoted, null empty.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ResultSet {
        ResultSet::new(
            vec![
                ResultRow::exact(
                    Some("products".to_string()),
                    Some(2),
                    vec![
                        ("name".to_string(), json!("Wireless Mouse")),
                        ("price".to_string(), json!(29.99)),
                    ],
                ),
                ResultRow::semantic(
                    "products".to_string(),
                    5,
                    0.8125,
                    vec![
                        ("name".to_string(), json!("Keyboard, \"wireless\"")),
                        ("stock".to_string(), Value::Null),
                    ],
                ),
            ],
            10,
        )
    }

    #[test]
    fn test_counts_and_columns() {
        let set = sample();
        assert_eq!(set.count(Provenance::Exact), 1);
        assert_eq!(set.count(Provenance::Semantic), 1);
        assert_eq!(set.columns(), vec!["name", "price", "stock"]);
    }

    #[test]
    fn test_csv_export() {
        let mut buffer = Vec::new();
        sample().write_csv_to(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "provenance,similarity,name,price,stock");
        assert_eq!(lines[1], "exact,,Wireless Mouse,29.99,");
        assert_eq!(lines[2], "semantic,0.8125,\"Keyboard, \"\"wireless\"\"\",,");
    }

    #[test]
    fn test_provenance_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Provenance::Semantic).unwrap(), "\"semantic\"");
    }
}
