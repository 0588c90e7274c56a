//! Hybrid Executor
//!
//! Runs the accepted query, then falls back to (or augments with) nearest
//! neighbours from the embedding index when the exact result is empty or
//! the question asked for similar things.

use super::result::{ResultRow, ResultSet};
use crate::catalog::{RowId, SchemaCatalog};
use crate::db::{FetchedRow, RelationalEngine};
use crate::embedding::{EmbeddingIndexStore, Neighbor};
use crate::error::{NlqError, Result};
use crate::sql_compiler::{CompiledQuery, SqlCompiler};
use crate::validation::AcceptedQuery;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct HybridExecutor {
    engine: Arc<dyn RelationalEngine>,
    index: Arc<EmbeddingIndexStore>,
    catalog: Arc<SchemaCatalog>,
    semantic_k: usize,
    query_timeout: Duration,
}

impl HybridExecutor {
    pub fn new(
        engine: Arc<dyn RelationalEngine>,
        index: Arc<EmbeddingIndexStore>,
        catalog: Arc<SchemaCatalog>,
        semantic_k: usize,
        query_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            index,
            catalog,
            semantic_k,
            query_timeout,
        }
    }

    async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<FetchedRow>> {
        match tokio::time::timeout(self.query_timeout, self.engine.fetch(query)).await {
            Ok(result) => result,
            Err(_) => Err(NlqError::ExecutionFailure(format!(
                "query timed out after {:?}",
                self.query_timeout
            ))),
        }
    }

    pub async fn execute(&self, accepted: &AcceptedQuery) -> Result<ResultSet> {
        let compiled = accepted.compiled();
        let candidate = accepted.candidate();
        let limit = accepted.limit();

        let exact: Vec<ResultRow> = self
            .fetch(compiled)
            .await?
            .into_iter()
            .map(|row| ResultRow::exact(compiled.row_id_table.clone(), row.row_id, row.values))
            .collect();
        info!("📊 Exact query returned {} rows", exact.len());

        let wants_semantic = exact.is_empty() || candidate.semantic.fuzzy;
        let semantic = match (&candidate.semantic.table, wants_semantic) {
            (Some(table), true) if (exact.len() as u64) < limit => {
                self.semantic_rows(table, &candidate.question).await
            }
            _ => Vec::new(),
        };
        if !semantic.is_empty() {
            info!("🔍 Semantic lookup contributed {} rows", semantic.len());
        }

        Ok(ResultSet::new(merge_rows(exact, semantic, limit), limit))
    }

    /// Best effort: every failure here, a timeout included, is logged and
    /// yields no rows.
    async fn semantic_rows(&self, table: &str, question: &str) -> Vec<ResultRow> {
        match tokio::time::timeout(self.query_timeout, self.semantic_lookup(table, question)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!("⚠️  Semantic lookup on {} failed: {}", table, e);
                Vec::new()
            }
            Err(_) => {
                warn!(
                    "⚠️  Semantic lookup on {} timed out after {:?}",
                    table, self.query_timeout
                );
                Vec::new()
            }
        }
    }

    async fn semantic_lookup(&self, table: &str, question: &str) -> Result<Vec<ResultRow>> {
        let neighbors = self.index.nearest(table, question, self.semantic_k).await?;
        if neighbors.is_empty() {
            debug!(table, "no semantic neighbours");
            return Ok(Vec::new());
        }
        self.fetch_neighbors(table, &neighbors).await
    }

    async fn fetch_neighbors(&self, table: &str, neighbors: &[Neighbor]) -> Result<Vec<ResultRow>> {
        let ids: Vec<RowId> = neighbors.iter().map(|n| n.row_id).collect();
        let query = SqlCompiler::new(&self.catalog).fetch_by_ids(table, &ids)?;
        let table_name = query.row_id_table.clone().unwrap_or_else(|| table.to_string());

        let mut by_id: HashMap<RowId, FetchedRow> = self
            .fetch(&query)
            .await?
            .into_iter()
            .filter_map(|row| row.row_id.map(|id| (id, row)))
            .collect();

        // Neighbour order, not database order; ids deleted since indexing drop out
        Ok(neighbors
            .iter()
            .filter_map(|n| {
                by_id.remove(&n.row_id).map(|row| {
                    ResultRow::semantic(table_name.clone(), n.row_id, 1.0 - n.distance, row.values)
                })
            })
            .collect())
    }
}

/// Exact rows in their own order, then semantic rows whose identifier is not
/// already present, truncated to `limit`.
pub fn merge_rows(exact: Vec<ResultRow>, semantic: Vec<ResultRow>, limit: u64) -> Vec<ResultRow> {
    let mut seen: HashSet<(String, RowId)> = exact
        .iter()
        .filter_map(|r| Some((r.table.clone()?, r.row_id?)))
        .collect();

    let mut merged = exact;
    for row in semantic {
        let fresh = match (&row.table, row.row_id) {
            (Some(table), Some(id)) => seen.insert((table.clone(), id)),
            _ => true,
        };
        if fresh {
            merged.push(row);
        }
    }
    merged.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::result::Provenance;
    use serde_json::json;

    fn exact(id: RowId) -> ResultRow {
        ResultRow::exact(
            Some("products".to_string()),
            Some(id),
            vec![("id".to_string(), json!(id))],
        )
    }

    fn semantic(id: RowId) -> ResultRow {
        ResultRow::semantic(
            "products".to_string(),
            id,
            0.5,
            vec![("id".to_string(), json!(id))],
        )
    }

    fn ids(rows: &[ResultRow]) -> Vec<(Provenance, RowId)> {
        rows.iter()
            .map(|r| (r.provenance, r.row_id.unwrap_or_default()))
            .collect()
    }

    #[test]
    fn test_merge_keeps_exact_order_and_dedups() {
        let merged = merge_rows(
            vec![exact(3), exact(1)],
            vec![semantic(1), semantic(4), semantic(4), semantic(2)],
            10,
        );
        assert_eq!(
            ids(&merged),
            vec![
                (Provenance::Exact, 3),
                (Provenance::Exact, 1),
                (Provenance::Semantic, 4),
                (Provenance::Semantic, 2),
            ]
        );
    }

    #[test]
    fn test_merge_truncates_to_limit() {
        let merged = merge_rows(vec![exact(1), exact(2)], vec![semantic(3)], 2);
        assert_eq!(ids(&merged), vec![(Provenance::Exact, 1), (Provenance::Exact, 2)]);
    }

    #[test]
    fn test_rows_without_identifier_are_never_deduplicated() {
        let aggregate = ResultRow::exact(None, None, vec![("count".to_string(), json!(3))]);
        let merged = merge_rows(vec![aggregate], vec![semantic(1)], 5);
        assert_eq!(merged.len(), 2);
    }
}
