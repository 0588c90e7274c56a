use nlq_engine::catalog::SchemaCatalog;
use nlq_engine::config::EngineConfig;
use nlq_engine::db::{init_pool, PgEngine, RelationalEngine};
use nlq_engine::embedding::EmbeddingIndexStore;
use nlq_engine::execution::result::cell_text;
use nlq_engine::execution::{HybridExecutor, Provenance, ResultSet};
use nlq_engine::llm::LlmClient;
use nlq_engine::pipeline::{embedder_for, load_catalog, QueryPipeline};
use nlq_engine::sql_compiler::SqlCompiler;
use nlq_engine::translator::{default_examples, QueryTranslator};
use nlq_engine::validation::QueryValidator;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlq")]
#[command(about = "Ask questions of a PostgreSQL database in plain language")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate, validate and run a question
    Ask {
        /// The question in natural language
        question: String,

        /// Also export the result set to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Test the database connection
    Check,
    /// Rebuild and persist embedding indexes from the database
    Reindex {
        /// Only rebuild this table
        #[arg(long)]
        table: Option<String>,
    },
    /// Print the schema description given to the model
    Schema,
    /// List sample questions
    Examples,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nlq_engine=info")),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env()?;

    match args.command {
        Commands::Ask { question, csv } => ask(&config, &question, csv).await,
        Commands::Check => check(&config).await,
        Commands::Reindex { table } => reindex(&config, table).await,
        Commands::Schema => {
            let catalog = load_catalog(&config)?;
            println!("{}", catalog.describe());
            Ok(())
        }
        Commands::Examples => {
            for example in default_examples() {
                println!("• {}", example.question);
            }
            Ok(())
        }
    }
}

async fn connect(config: &EngineConfig) -> Result<Arc<dyn RelationalEngine>> {
    let pool = init_pool(&config.database_url, config.query_timeout)
        .await
        .context("Failed to connect to the database")?;
    Ok(Arc::new(PgEngine::new(pool)))
}

async fn ask(config: &EngineConfig, question: &str, csv: Option<PathBuf>) -> Result<()> {
    let api_key = config.require_api_key()?;
    let catalog = Arc::new(load_catalog(config)?);
    let engine = connect(config).await?;

    let index = Arc::new(EmbeddingIndexStore::new(embedder_for(config)?));
    index.load(&config.index_dir)?;

    let llm = LlmClient::new(api_key.to_string(), config.model.clone(), config.base_url.clone());
    let translator = QueryTranslator::new(Arc::new(llm), config.llm_timeout, config.max_rows);
    let validator = QueryValidator::new(config.max_rows);
    let executor = HybridExecutor::new(
        engine,
        index,
        catalog.clone(),
        config.semantic_k,
        config.query_timeout,
    );
    let pipeline = QueryPipeline::new(catalog, translator, validator, executor);

    let outcome = pipeline.ask(question).await?;

    println!("\n📝 SQL:\n{}\n", outcome.sql);
    println!(
        "🛡️  Validation: {} ({})\n",
        outcome.validation_note, outcome.validation_rule
    );
    print_results(&outcome.results);

    if let Some(path) = csv {
        outcome.results.write_csv(&path)?;
        println!("\n💾 Exported {} rows to {}", outcome.results.len(), path.display());
    }
    Ok(())
}

fn print_results(results: &ResultSet) {
    if results.is_empty() {
        println!("No rows found.");
        return;
    }
    println!(
        "{} rows ({} exact, {} semantic):",
        results.len(),
        results.count(Provenance::Exact),
        results.count(Provenance::Semantic)
    );
    for row in &results.rows {
        let tag = match (row.provenance, row.similarity) {
            (Provenance::Semantic, Some(similarity)) => {
                format!("semantic {:.0}% match", similarity * 100.0)
            }
            (provenance, _) => provenance.to_string(),
        };
        let values = row
            .values
            .iter()
            .map(|(name, value)| format!("{}: {}", name, cell_text(value)))
            .join(", ");
        println!("  [{}] {}", tag, values);
    }
}

async fn check(config: &EngineConfig) -> Result<()> {
    println!("🔌 Testing PostgreSQL connection...");
    let engine = connect(config).await?;
    engine.ping().await?;
    println!("✅ Connected successfully!");
    Ok(())
}

async fn reindex(config: &EngineConfig, table: Option<String>) -> Result<()> {
    let catalog: SchemaCatalog = load_catalog(config)?;
    let engine = connect(config).await?;
    let index = EmbeddingIndexStore::new(embedder_for(config)?);
    index.load(&config.index_dir)?;

    let targets: Vec<String> = match table {
        Some(name) => {
            let schema = catalog
                .table(&name)
                .with_context(|| format!("Unknown table: {}", name))?;
            vec![schema.name.clone()]
        }
        None => catalog
            .tables()
            .iter()
            .filter(|t| !t.indexed_columns.is_empty())
            .map(|t| t.name.clone())
            .collect(),
    };

    let compiler = SqlCompiler::new(&catalog);
    for name in &targets {
        let scan = compiler.index_scan(name)?;
        let rows = engine
            .fetch(&scan)
            .await?
            .into_iter()
            .filter_map(|row| {
                let content = row
                    .values
                    .iter()
                    .map(|(_, v)| cell_text(v))
                    .filter(|s| !s.is_empty())
                    .join(" ");
                row.row_id.map(|id| (id, content))
            })
            .collect();
        let count = index.rebuild(name, rows).await?;
        println!("✅ {}: {} rows indexed", name, count);
    }

    let saved = index.save(&config.index_dir).await?;
    info!("Saved {} indexes to {}", saved, config.index_dir.display());
    Ok(())
}
