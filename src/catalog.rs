//! Schema Catalog
//!
//! Static description of the tables the engine may query: typed columns,
//! primary and foreign keys, aliases used in questions, and the columns
//! whose text makes up each row's embedding content. Loaded once and
//! shared read-only.

use crate::error::{NlqError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Primary-key value identifying a row within its table.
pub type RowId = i64;

lazy_static::lazy_static! {
    static ref WORD: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Decimal,
    Text,
    Boolean,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Numeric,
    Text,
    Boolean,
    Temporal,
}

impl ColumnType {
    pub fn category(&self) -> TypeCategory {
        match self {
            ColumnType::Integer | ColumnType::Decimal => TypeCategory::Numeric,
            ColumnType::Text => TypeCategory::Text,
            ColumnType::Boolean => TypeCategory::Boolean,
            ColumnType::Date | ColumnType::Timestamp => TypeCategory::Temporal,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "DECIMAL",
            ColumnType::Text => "TEXT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for TypeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeCategory::Numeric => "numeric",
            TypeCategory::Text => "text",
            TypeCategory::Boolean => "boolean",
            TypeCategory::Temporal => "date/time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: ColumnType,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub primary_key: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Columns concatenated into the row's embedding content
    #[serde(default)]
    pub indexed_columns: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    fn mentioned_by(&self, word: &str) -> bool {
        let name = self.name.to_lowercase();
        let singular = name.strip_suffix('s').unwrap_or(&name);
        word == name
            || word == singular
            || self.aliases.iter().any(|alias| {
                let alias = alias.to_lowercase();
                word == alias || word == format!("{}s", alias)
            })
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    tables: Vec<TableSchema>,
}

#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    tables: Vec<TableSchema>,
}

impl SchemaCatalog {
    /// Build a catalog, checking that keys and indexed columns point at real columns.
    pub fn new(tables: Vec<TableSchema>) -> Result<Self> {
        let mut seen = HashSet::new();
        for table in &tables {
            if !seen.insert(table.name.to_lowercase()) {
                return Err(NlqError::Catalog(format!("duplicate table {}", table.name)));
            }
            match table.column(&table.primary_key) {
                None => {
                    return Err(NlqError::Catalog(format!(
                        "primary key {}.{} is not a declared column",
                        table.name, table.primary_key
                    )))
                }
                Some(pk) if pk.data_type != ColumnType::Integer => {
                    return Err(NlqError::Catalog(format!(
                        "primary key {}.{} must be an integer column",
                        table.name, table.primary_key
                    )))
                }
                Some(_) => {}
            }
            for indexed in &table.indexed_columns {
                if table.column(indexed).is_none() {
                    return Err(NlqError::Catalog(format!(
                        "indexed column {}.{} is not a declared column",
                        table.name, indexed
                    )));
                }
            }
        }

        for table in &tables {
            for fk in &table.foreign_keys {
                if table.column(&fk.column).is_none() {
                    return Err(NlqError::Catalog(format!(
                        "foreign key column {}.{} is not a declared column",
                        table.name, fk.column
                    )));
                }
                let target = tables
                    .iter()
                    .find(|t| t.name.eq_ignore_ascii_case(&fk.references_table))
                    .ok_or_else(|| {
                        NlqError::Catalog(format!(
                            "{}.{} references unknown table {}",
                            table.name, fk.column, fk.references_table
                        ))
                    })?;
                if target.column(&fk.references_column).is_none() {
                    return Err(NlqError::Catalog(format!(
                        "{}.{} references unknown column {}.{}",
                        table.name, fk.column, fk.references_table, fk.references_column
                    )));
                }
            }
        }

        Ok(Self { tables })
    }

    /// Load a catalog from a JSON file of the form `{"tables": [...]}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NlqError::Catalog(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let file: CatalogFile = serde_json::from_str(&content).map_err(|e| {
            NlqError::Catalog(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Self::new(file.tables)
    }

    /// The company database: departments, employees, products and orders.
    pub fn builtin() -> Self {
        fn col(name: &str, data_type: ColumnType) -> ColumnSchema {
            ColumnSchema {
                name: name.to_string(),
                data_type,
                description: None,
            }
        }
        fn fk(column: &str, table: &str, target: &str) -> ForeignKey {
            ForeignKey {
                column: column.to_string(),
                references_table: table.to_string(),
                references_column: target.to_string(),
            }
        }
        fn strings(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        let tables = vec![
            TableSchema {
                name: "departments".to_string(),
                description: Some("Company departments".to_string()),
                primary_key: "id".to_string(),
                columns: vec![col("id", ColumnType::Integer), col("name", ColumnType::Text)],
                foreign_keys: vec![],
                aliases: strings(&["department", "dept", "team"]),
                indexed_columns: strings(&["name"]),
            },
            TableSchema {
                name: "employees".to_string(),
                description: Some("Staff members and their salaries".to_string()),
                primary_key: "id".to_string(),
                columns: vec![
                    col("id", ColumnType::Integer),
                    col("name", ColumnType::Text),
                    col("department_id", ColumnType::Integer),
                    col("email", ColumnType::Text),
                    col("salary", ColumnType::Decimal),
                ],
                foreign_keys: vec![fk("department_id", "departments", "id")],
                aliases: strings(&["employee", "staff", "worker", "people"]),
                indexed_columns: strings(&["name"]),
            },
            TableSchema {
                name: "products".to_string(),
                description: Some("Products for sale".to_string()),
                primary_key: "id".to_string(),
                columns: vec![
                    col("id", ColumnType::Integer),
                    col("name", ColumnType::Text),
                    col("price", ColumnType::Decimal),
                ],
                foreign_keys: vec![],
                aliases: strings(&["product", "item"]),
                indexed_columns: strings(&["name"]),
            },
            TableSchema {
                name: "orders".to_string(),
                description: Some("Customer orders handled by employees".to_string()),
                primary_key: "id".to_string(),
                columns: vec![
                    col("id", ColumnType::Integer),
                    col("customer_name", ColumnType::Text),
                    col("employee_id", ColumnType::Integer),
                    col("order_total", ColumnType::Decimal),
                    col("order_date", ColumnType::Date),
                ],
                foreign_keys: vec![fk("employee_id", "employees", "id")],
                aliases: strings(&["order", "sale", "purchase"]),
                indexed_columns: strings(&["customer_name"]),
            },
        ];

        Self { tables }
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Every foreign key as `table.column -> target.column`.
    pub fn relationships(&self) -> Vec<String> {
        self.tables
            .iter()
            .flat_map(|t| {
                t.foreign_keys.iter().map(move |fk| {
                    format!(
                        "{}.{} -> {}.{}",
                        t.name, fk.column, fk.references_table, fk.references_column
                    )
                })
            })
            .collect()
    }

    /// Schema text handed to the language model.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            match &table.description {
                Some(desc) => out.push_str(&format!("Table {} ({})\n", table.name, desc)),
                None => out.push_str(&format!("Table {}\n", table.name)),
            }
            for column in &table.columns {
                let mut line = format!("  - {} {}", column.name, column.data_type.sql_name());
                if column.name.eq_ignore_ascii_case(&table.primary_key) {
                    line.push_str(" PRIMARY KEY");
                }
                if let Some(fk) = table
                    .foreign_keys
                    .iter()
                    .find(|fk| fk.column.eq_ignore_ascii_case(&column.name))
                {
                    line.push_str(&format!(
                        " REFERENCES {}({})",
                        fk.references_table, fk.references_column
                    ));
                }
                out.push_str(&line);
                out.push('\n');
            }
        }

        let relationships = self.relationships();
        if !relationships.is_empty() {
            out.push_str("\nRelationships:\n");
            for rel in relationships {
                out.push_str(&format!("  - {}\n", rel));
            }
        }
        out
    }

    /// The table a piece of text talks about, by earliest mention of its
    /// name, singular form or alias.
    pub fn resolve_table_hint(&self, text: &str) -> Option<&TableSchema> {
        let lowered = text.to_lowercase();
        WORD.find_iter(&lowered)
            .find_map(|word| self.tables.iter().find(|t| t.mentioned_by(word.as_str())))
    }
}
