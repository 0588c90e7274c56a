//! Embedding Index Store
//!
//! Per-table nearest-neighbour search over row embeddings.

pub mod embedder;
pub mod index_store;
pub mod vector_store;

pub use embedder::{Embedder, HashingEmbedder, OpenAiEmbedder};
pub use index_store::EmbeddingIndexStore;
pub use vector_store::{cosine_distance, Embedding, FlatIndex, Neighbor, VectorIndex};
