//! Row Embedders
//!
//! Turn a row's indexed text into a vector. `OpenAiEmbedder` calls the
//! embeddings API; `HashingEmbedder` is deterministic and works offline.

use super::vector_store::Embedding;
use crate::error::{NlqError, Result};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifies the embedding function. Vectors with different
    /// fingerprints never share an index.
    fn fingerprint(&self) -> String;

    async fn embed(&self, text: &str) -> Result<Embedding>;
}

/// Embedding client using the OpenAI embeddings API
pub struct OpenAiEmbedder {
    api_key: String,
    base_url: String,
    model: String, // e.g., "text-embedding-3-small"
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    /// `timeout` bounds each request, connect through body.
    pub fn new(api_key: String, model: String, base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn fingerprint(&self) -> String {
        format!("openai:{}", self.model)
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::Embedding(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NlqError::Embedding(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            NlqError::Embedding(format!("Failed to parse embedding response: {}", e))
        })?;

        let embedding: Vec<f32> = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|arr| arr.first())
            .and_then(|first| first.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| NlqError::Embedding("No embedding vector in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if embedding.is_empty() {
            return Err(NlqError::Embedding("Empty embedding vector in response".to_string()));
        }
        Ok(embedding)
    }
}

pub const DEFAULT_HASHING_DIM: usize = 256;

/// Feature-hashing embedder over words and character trigrams.
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIM)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let idx = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign * weight;
    }

    pub fn embed_sync(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();

        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut vector, word, 1.0);

            let padded: Vec<char> = format!(" {} ", word).chars().collect();
            for trigram in padded.windows(3) {
                let gram: String = trigram.iter().collect();
                self.add_feature(&mut vector, &format!("#{}", gram), 0.5);
            }
        }

        // Normalize to unit vector (for cosine similarity)
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn fingerprint(&self) -> String {
        format!("hashing-v1:{}", self.dimension)
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::vector_store::cosine_similarity;

    #[test]
    fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(128);
        let a = embedder.embed_sync("Wireless Mouse");
        let b = embedder.embed_sync("wireless mouse");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_words_score_higher() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed_sync("wireless keyboard");
        let keyboard = embedder.embed_sync("Mechanical Keyboard");
        let lamp = embedder.embed_sync("Desk Lamp LED");
        assert!(cosine_similarity(&query, &keyboard) > cosine_similarity(&query, &lamp));
    }

    #[test]
    fn test_empty_text_gives_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        assert!(embedder.embed_sync("  ").iter().all(|v| *v == 0.0));
        assert_eq!(embedder.fingerprint(), "hashing-v1:16");
    }
}
