use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nlq_engine::config::EngineConfig;
use nlq_engine::execution::SqliteEngine;
use nlq_engine::llm::{LlmClient, TextCompletion, DEFAULT_BASE_URL, DEFAULT_MODEL};
use nlq_engine::metadata::SemanticModel;
use nlq_engine::pipeline::NlqPipeline;
use nlq_engine::schema_rag::InMemoryVectorStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlq")]
#[command(about = "Answer natural-language questions with SQL against a SQLite database")]
struct Args {
    /// SQLite database file
    #[arg(short, long)]
    database: PathBuf,

    /// Semantic model JSON (default: introspect the database)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Engine configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Domain label used for business rules when introspecting
    #[arg(long)]
    domain: Option<String>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question
    Ask {
        question: String,
        /// Print context, matches, generation and attempts too
        #[arg(long)]
        detailed: bool,
    },
    /// Validate SQL against the semantic model
    Validate { sql: String },
    /// Show the engine's query plan
    Explain { sql: String },
    /// Suggest optimizations
    Optimize { sql: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .apply_env()?;

    let engine = SqliteEngine::open(&args.database)?;
    let model = match &args.model {
        Some(path) => SemanticModel::load(path)?,
        None => engine
            .introspect(args.domain.clone())
            .context("Failed to introspect the database")?,
    };

    let timeout = Duration::from_millis(config.completion.timeout_ms);
    let completion: Option<Arc<dyn TextCompletion>> = match args.api_key {
        Some(key) => {
            let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
            let model_name = std::env::var("NLQ_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
            Some(Arc::new(LlmClient::with_options(key, base_url, model_name, timeout)))
        }
        None => LlmClient::from_env(timeout).map(|c| Arc::new(c) as Arc<dyn TextCompletion>),
    };

    let vector_store = Arc::new(InMemoryVectorStore::from_model(&model));
    let pipeline = NlqPipeline::new(config, Arc::new(engine), vector_store, completion)?;
    info!("Loaded {} tables from {}", model.tables.len(), args.database.display());

    let output = match args.command {
        Command::Ask { question, detailed } => {
            let outcome = pipeline.answer_detailed(&question, &model).await;
            if detailed {
                serde_json::to_string_pretty(&outcome)?
            } else {
                serde_json::to_string_pretty(&outcome.result)?
            }
        }
        Command::Validate { sql } => serde_json::to_string_pretty(&pipeline.validate_sql(&sql, &model))?,
        Command::Explain { sql } => pipeline.explain_query(&sql).await?,
        Command::Optimize { sql } => serde_json::to_string_pretty(&pipeline.optimize_query(&sql, &model))?,
    };
    println!("{}", output);

    Ok(())
}
