//! Relational engine boundary
//!
//! `RelationalEngine` runs one compiled read query and hands rows back as
//! JSON scalars. `PgEngine` is the PostgreSQL implementation.

use crate::catalog::RowId;
use crate::error::{NlqError, Result};
use crate::execution::result::EntityRow;
use crate::sql_compiler::{CompiledQuery, SqlParam, ValueKind};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tracing::debug;

/// One decoded row. `row_id` is set when the query carried the hidden
/// primary-key column.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRow {
    pub row_id: Option<RowId>,
    pub values: EntityRow,
}

#[async_trait]
pub trait RelationalEngine: Send + Sync {
    async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<FetchedRow>>;

    /// Round trip to the database without touching any table.
    async fn ping(&self) -> Result<()>;
}

pub struct PgEngine {
    pool: PgPool,
}

impl PgEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Float(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::IntList(v) => query.bind(v.as_slice()),
        };
    }
    query
}

fn decode_value(row: &PgRow, idx: usize, kind: ValueKind) -> std::result::Result<Value, sqlx::Error> {
    let value = match kind {
        ValueKind::Integer => row.try_get::<Option<i64>, _>(idx)?.map(Value::from),
        ValueKind::Float => row.try_get::<Option<f64>, _>(idx)?.map(Value::from),
        ValueKind::Text => row.try_get::<Option<String>, _>(idx)?.map(Value::from),
        ValueKind::Boolean => row.try_get::<Option<bool>, _>(idx)?.map(Value::from),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode_row(row: &PgRow, query: &CompiledQuery) -> std::result::Result<FetchedRow, sqlx::Error> {
    let offset = usize::from(query.row_id_table.is_some());
    let row_id = if offset == 1 {
        Some(row.try_get::<i64, _>(0)?)
    } else {
        None
    };

    let mut values = Vec::with_capacity(query.columns.len());
    for (i, column) in query.columns.iter().enumerate() {
        values.push((column.name.clone(), decode_value(row, i + offset, column.kind)?));
    }
    Ok(FetchedRow { row_id, values })
}

#[async_trait]
impl RelationalEngine for PgEngine {
    async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<FetchedRow>> {
        debug!(sql = %query.sql, params = query.params.len(), "executing query");
        let rows = bind_params(sqlx::query(&query.sql), &query.params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| NlqError::ExecutionFailure(format!("query failed: {}", e)))?;

        rows.iter()
            .map(|row| decode_row(row, query))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NlqError::ExecutionFailure(format!("failed to decode row: {}", e)))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| NlqError::ExecutionFailure(format!("connection check failed: {}", e)))?;
        Ok(())
    }
}
