//! Query Pipeline
//!
//! question → translator → validator → hybrid executor. Each request runs
//! independently inside its own tracing span.

use crate::catalog::SchemaCatalog;
use crate::config::EngineConfig;
use crate::embedding::{Embedder, HashingEmbedder, OpenAiEmbedder};
use crate::error::Result;
use crate::execution::{HybridExecutor, Provenance, ResultSet};
use crate::translator::QueryTranslator;
use crate::validation::QueryValidator;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub request_id: Uuid,
    /// Parameterized SQL that was executed
    pub sql: String,
    /// Rule that left the acceptance note
    pub validation_rule: String,
    pub validation_note: String,
    pub results: ResultSet,
}

pub struct QueryPipeline {
    catalog: Arc<SchemaCatalog>,
    translator: QueryTranslator,
    validator: QueryValidator,
    executor: HybridExecutor,
}

impl QueryPipeline {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        translator: QueryTranslator,
        validator: QueryValidator,
        executor: HybridExecutor,
    ) -> Self {
        Self {
            catalog,
            translator,
            validator,
            executor,
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub async fn ask(&self, question: &str) -> Result<QueryOutcome> {
        let request_id = Uuid::new_v4();
        let span = info_span!("ask", request_id = %request_id);
        self.run(request_id, question).instrument(span).await
    }

    async fn run(&self, request_id: Uuid, question: &str) -> Result<QueryOutcome> {
        info!("❓ Question: {}", question.trim());

        let candidate = self.translator.translate(question, &self.catalog).await?;
        let accepted = self.validator.validate(candidate, &self.catalog).into_result()?;
        info!(
            "✅ Accepted by validator ({}: {})",
            accepted.rule(),
            accepted.note()
        );

        let results = self.executor.execute(&accepted).await?;
        info!(
            "📦 Returning {} rows ({} exact, {} semantic)",
            results.len(),
            results.count(Provenance::Exact),
            results.count(Provenance::Semantic)
        );

        Ok(QueryOutcome {
            request_id,
            sql: accepted.compiled().sql.clone(),
            validation_rule: accepted.rule().to_string(),
            validation_note: accepted.note().to_string(),
            results,
        })
    }
}

/// Catalog from `NLQ_CATALOG` if set, else the built-in one.
pub fn load_catalog(config: &EngineConfig) -> Result<SchemaCatalog> {
    match &config.catalog_path {
        Some(path) => SchemaCatalog::load(path),
        None => Ok(SchemaCatalog::builtin()),
    }
}

/// Embedder selected by `OPENAI_EMBEDDING_MODEL`.
pub fn embedder_for(config: &EngineConfig) -> Result<Arc<dyn Embedder>> {
    if config.uses_hashing_embedder() {
        return Ok(Arc::new(HashingEmbedder::default()));
    }
    let api_key = config.require_api_key()?;
    Ok(Arc::new(OpenAiEmbedder::new(
        api_key.to_string(),
        config.embedding_model.clone(),
        config.base_url.clone(),
        config.query_timeout,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_embedder_needs_no_key() {
        let config = EngineConfig {
            embedding_model: "hashing".to_string(),
            ..EngineConfig::default()
        };
        let embedder = embedder_for(&config).unwrap();
        assert!(embedder.fingerprint().starts_with("hashing-v1"));
    }

    #[test]
    fn test_remote_embedder_requires_key() {
        assert!(embedder_for(&EngineConfig::default()).is_err());
        let config = EngineConfig {
            api_key: Some("sk-test".to_string()),
            ..EngineConfig::default()
        };
        assert_eq!(
            embedder_for(&config).unwrap().fingerprint(),
            "openai:text-embedding-3-small"
        );
    }

    #[test]
    fn test_builtin_catalog_when_unset() {
        let catalog = load_catalog(&EngineConfig::default()).unwrap();
        assert!(catalog.table("employees").is_some());
    }
}
