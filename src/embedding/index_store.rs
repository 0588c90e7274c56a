//! Embedding Index Store
//!
//! One vector index per table, keyed by table name. Writers to a table are
//! serialized by that table's `RwLock`; lookups share the read side.
//! Every index remembers the fingerprint of the embedder that filled it and
//! never accepts vectors from another one.

use super::embedder::Embedder;
use super::vector_store::{Embedding, FlatIndex, Neighbor, VectorIndex};
use crate::catalog::RowId;
use crate::error::{NlqError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Builds an empty index for a new table.
pub type IndexFactory = fn() -> Box<dyn VectorIndex>;

fn flat_index() -> Box<dyn VectorIndex> {
    Box::new(FlatIndex::new())
}

struct TableIndex {
    fingerprint: String,
    index: Box<dyn VectorIndex>,
    built_at: DateTime<Utc>,
}

/// On-disk form of one table's index.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub table: String,
    pub fingerprint: String,
    pub dimension: Option<usize>,
    pub built_at: DateTime<Utc>,
    pub entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub row_id: RowId,
    pub vector: Embedding,
}

pub struct EmbeddingIndexStore {
    embedder: Arc<dyn Embedder>,
    tables: DashMap<String, Arc<RwLock<TableIndex>>>,
    factory: IndexFactory,
}

impl EmbeddingIndexStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self::with_factory(embedder, flat_index)
    }

    pub fn with_factory(embedder: Arc<dyn Embedder>, factory: IndexFactory) -> Self {
        Self {
            embedder,
            tables: DashMap::new(),
            factory,
        }
    }

    pub fn fingerprint(&self) -> String {
        self.embedder.fingerprint()
    }

    fn key(table: &str) -> String {
        table.to_lowercase()
    }

    fn slot(&self, table: &str) -> Option<Arc<RwLock<TableIndex>>> {
        self.tables
            .get(&Self::key(table))
            .map(|entry| entry.value().clone())
    }

    fn fresh(&self) -> TableIndex {
        TableIndex {
            fingerprint: self.embedder.fingerprint(),
            index: (self.factory)(),
            built_at: Utc::now(),
        }
    }

    /// Embed `content` and insert or replace it under `row_id`.
    pub async fn upsert(&self, table: &str, row_id: RowId, content: &str) -> Result<()> {
        let vector = self.embedder.embed(content).await?;
        let slot = self
            .tables
            .entry(Self::key(table))
            .or_insert_with(|| Arc::new(RwLock::new(self.fresh())))
            .value()
            .clone();

        let mut guard = slot.write().await;
        guard.index.upsert(row_id, vector)?;
        debug!(table, row_id, "upserted row embedding");
        Ok(())
    }

    /// Up to `k` rows of `table` closest to `query_text`, ascending by distance.
    /// A table without an index yields no neighbours.
    pub async fn nearest(&self, table: &str, query_text: &str, k: usize) -> Result<Vec<Neighbor>> {
        let slot = match self.slot(table) {
            Some(slot) => slot,
            None => {
                debug!(table, "no embedding index for table");
                return Ok(Vec::new());
            }
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed(query_text).await?;
        let guard = slot.read().await;
        if guard.index.is_empty() {
            return Ok(Vec::new());
        }
        guard.index.search(&query, k)
    }

    /// Replace the index of `table` with embeddings of `rows`.
    pub async fn rebuild(&self, table: &str, rows: Vec<(RowId, String)>) -> Result<usize> {
        let mut fresh = self.fresh();
        for (row_id, content) in &rows {
            let vector = self.embedder.embed(content).await?;
            fresh.index.upsert(*row_id, vector)?;
        }
        let count = fresh.index.len();

        match self.slot(table) {
            Some(slot) => {
                *slot.write().await = fresh;
            }
            None => {
                self.tables
                    .insert(Self::key(table), Arc::new(RwLock::new(fresh)));
            }
        }
        info!("✅ Rebuilt embedding index for {} ({} rows)", table, count);
        Ok(count)
    }

    pub async fn remove(&self, table: &str, row_id: RowId) -> bool {
        match self.slot(table) {
            Some(slot) => slot.write().await.index.remove(row_id),
            None => false,
        }
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(&Self::key(table))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of vectors indexed for `table`.
    pub async fn len(&self, table: &str) -> usize {
        match self.slot(table) {
            Some(slot) => slot.read().await.index.len(),
            None => 0,
        }
    }

    /// Write every table's index to `<dir>/<table>.json`.
    pub async fn save(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        // Clone the handles out first; no map guard is held across an await
        let slots: Vec<(String, Arc<RwLock<TableIndex>>)> = self
            .tables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (table, slot) in &slots {
            let guard = slot.read().await;
            let persisted = PersistedIndex {
                table: table.clone(),
                fingerprint: guard.fingerprint.clone(),
                dimension: guard.index.dimension(),
                built_at: guard.built_at,
                entries: guard
                    .index
                    .entries()
                    .into_iter()
                    .map(|(row_id, vector)| PersistedEntry { row_id, vector })
                    .collect(),
            };
            let encoded = serde_json::to_string(&persisted)?;
            std::fs::write(Self::index_path(dir, table), encoded)?;
        }
        info!("💾 Saved {} embedding indexes to {}", slots.len(), dir.display());
        Ok(slots.len())
    }

    pub fn index_path(dir: &Path, table: &str) -> PathBuf {
        dir.join(format!("{}.json", Self::key(table)))
    }

    /// Load one persisted index. Refused if it was built by another embedder.
    pub fn load_table(&self, path: impl AsRef<Path>) -> Result<String> {
        let encoded = std::fs::read_to_string(path.as_ref())?;
        let persisted: PersistedIndex = serde_json::from_str(&encoded)?;

        let current = self.embedder.fingerprint();
        if persisted.fingerprint != current {
            return Err(NlqError::Embedding(format!(
                "index for {} was built with {}, current embedder is {}; rebuild required",
                persisted.table, persisted.fingerprint, current
            )));
        }

        let mut index = (self.factory)();
        for entry in persisted.entries {
            index.upsert(entry.row_id, entry.vector)?;
        }
        let table = Self::key(&persisted.table);
        self.tables.insert(
            table.clone(),
            Arc::new(RwLock::new(TableIndex {
                fingerprint: persisted.fingerprint,
                index,
                built_at: persisted.built_at,
            })),
        );
        Ok(table)
    }

    /// Load every `*.json` index in `dir`, skipping unreadable or stale ones.
    pub fn load(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        if !dir.exists() {
            debug!("no index directory at {}", dir.display());
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_table(&path) {
                Ok(table) => {
                    debug!(table = %table, "loaded embedding index");
                    loaded += 1;
                }
                Err(e) => warn!("⚠️  Skipping embedding index {}: {}", path.display(), e),
            }
        }
        info!("📚 Loaded {} embedding indexes from {}", loaded, dir.display());
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn store(dim: usize) -> EmbeddingIndexStore {
        EmbeddingIndexStore::new(Arc::new(HashingEmbedder::new(dim)))
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("nlq-index-{}", uuid::Uuid::new_v4()))
    }

    async fn products(store: &EmbeddingIndexStore) {
        store
            .rebuild(
                "products",
                vec![
                    (1, "Laptop Pro 15".to_string()),
                    (2, "Wireless Mouse".to_string()),
                    (3, "Mechanical Keyboard".to_string()),
                    (4, "USB-C Hub".to_string()),
                    (5, "Wireless Keyboard Combo".to_string()),
                ],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_table_yields_no_neighbours() {
        let store = store(64);
        assert!(store.nearest("products", "keyboard", 5).await.unwrap().is_empty());
        assert!(!store.has_table("products"));
    }

    #[tokio::test]
    async fn test_nearest_is_idempotent_and_bounded() {
        let store = store(256);
        products(&store).await;

        let first = store.nearest("products", "wireless keyboard", 3).await.unwrap();
        let second = store.nearest("products", "wireless keyboard", 3).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].row_id, 5);
        assert!(first.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let store = store(64);
        store.upsert("Products", 7, "Desk Lamp").await.unwrap();
        store.upsert("products", 7, "Standing Desk").await.unwrap();
        assert_eq!(store.len("products").await, 1);
        assert!(store.remove("products", 7).await);
        assert_eq!(store.len("products").await, 0);
        assert!(store.nearest("products", "desk", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = temp_dir();
        let original = store(128);
        products(&original).await;
        assert_eq!(original.save(&dir).await.unwrap(), 1);

        let restored = store(128);
        assert_eq!(restored.load(&dir).unwrap(), 1);
        assert_eq!(
            restored.nearest("products", "mouse", 2).await.unwrap(),
            original.nearest("products", "mouse", 2).await.unwrap()
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_index_from_other_embedder_is_refused() {
        let dir = temp_dir();
        let original = store(32);
        products(&original).await;
        original.save(&dir).await.unwrap();

        let other = store(64);
        let err = other
            .load_table(EmbeddingIndexStore::index_path(&dir, "products"))
            .unwrap_err();
        assert!(err.to_string().contains("rebuild required"));
        assert_eq!(other.load(&dir).unwrap(), 0);
        assert!(other.nearest("products", "mouse", 2).await.unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_directory_loads_nothing() {
        assert_eq!(store(16).load(temp_dir()).unwrap(), 0);
    }
}
