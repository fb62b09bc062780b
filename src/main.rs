//! knowledge-agent CLI application
//!
//! Command-line interface for the knowledge-agent library.

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use knowledge_agent::api::{self, KnowledgeBase};
use knowledge_agent::ml::build_embedder;
use knowledge_agent::utils::{format_file_size, is_supported_document, truncate_chars};
use knowledge_agent::{Config, KnowledgeAgent};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files ingested concurrently
const INGEST_CONCURRENCY: usize = 4;

#[derive(Parser)]
#[command(name = "knowledge-agent")]
#[command(about = "Ask questions about your documents with a local language model")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add documents (PDF, DOCX, TXT, Markdown) to the knowledge base
    Ingest {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Remove a document and all of its chunks
    Delete { document_id: String },

    /// List ingested documents
    List,

    /// Show knowledge base statistics
    Stats,

    /// Show raw retrieval results for a query
    Search {
        query: String,

        /// Number of results to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Ask a single question
    Ask { question: String },

    /// Interactive chat with your documents
    Chat,

    /// Load the bundled sample company documents
    Seed,

    /// Recreate the vector index from stored embeddings
    RebuildIndex,

    /// Check that the embedder and language model respond
    Health,

    /// Write the default configuration to a file
    InitConfig { path: PathBuf },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => Config::default(),
    }
    .apply_env();
    config.validate()?;
    Ok(config)
}

fn open_knowledge_base(config: &Config) -> anyhow::Result<KnowledgeBase> {
    let embedder = build_embedder(&config.embedding)?;
    KnowledgeBase::open(config, embedder).context("opening knowledge base")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config_path = cli.config;
    let config = || load_config(config_path.as_deref());

    match cli.command {
        Commands::InitConfig { path } => {
            Config::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        Commands::Ingest { inputs } => ingest_command(&config()?, inputs).await?,
        Commands::Delete { document_id } => {
            let kb = open_knowledge_base(&config()?)?;
            let removed = kb.delete_document(&document_id)?;
            println!("Deleted {} ({} chunks)", document_id, removed);
        }
        Commands::List => list_command(&config()?)?,
        Commands::Stats => stats_command(&config()?)?,
        Commands::Search { query, top_k } => search_command(&config()?, &query, top_k).await?,
        Commands::Ask { question } => {
            println!("{}", api::quick_ask(&config()?, &question).await?);
        }
        Commands::Chat => {
            let config = config()?;
            let agent = KnowledgeAgent::from_config(&config)?;
            api::run_chat(&agent, config.conversation.clone()).await?;
        }
        Commands::Seed => {
            let kb = open_knowledge_base(&config()?)?;
            for record in kb.seed_samples().await? {
                println!("Added {} ({} chunks)", record.filename, record.chunk_count);
            }
        }
        Commands::RebuildIndex => {
            let kb = open_knowledge_base(&config()?)?;
            let entries = kb.rebuild_index()?;
            println!("Rebuilt vector index with {} entries", entries);
        }
        Commands::Health => health_command(&config()?).await?,
    }

    Ok(())
}

async fn ingest_command(config: &Config, inputs: Vec<PathBuf>) -> anyhow::Result<()> {
    let kb = open_knowledge_base(config)?;

    let (files, skipped): (Vec<PathBuf>, Vec<PathBuf>) = inputs
        .into_iter()
        .partition(|p| p.is_file() && is_supported_document(p));
    for path in &skipped {
        eprintln!("Skipping {}: not a supported document", path.display());
    }
    if files.is_empty() {
        anyhow::bail!("no supported documents to ingest");
    }

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    let kb = &kb;
    let progress_ref = &progress;
    let results: Vec<_> = stream::iter(files)
        .map(|path| async move {
            let result = kb.ingest_file(&path).await;
            progress_ref.inc(1);
            progress_ref.set_message(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
            (path, result)
        })
        .buffer_unordered(INGEST_CONCURRENCY)
        .collect()
        .await;
    progress.finish_and_clear();

    let mut failures = 0;
    for (path, result) in results {
        match result {
            Ok(record) => println!(
                "Ingested {} as {} ({} chunks)",
                record.filename, record.id, record.chunk_count
            ),
            Err(e) => {
                failures += 1;
                eprintln!("Failed to ingest {}: {}", path.display(), e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} document(s) failed to ingest", failures);
    }
    Ok(())
}

fn list_command(config: &Config) -> anyhow::Result<()> {
    let kb = open_knowledge_base(config)?;
    let documents = kb.list_documents()?;
    if documents.is_empty() {
        println!("The knowledge base is empty. Try `knowledge-agent seed` or `ingest`.");
        return Ok(());
    }
    for doc in documents {
        println!(
            "{}  {:<8} {:>4} chunks  {}  {}",
            doc.id,
            doc.format.as_str(),
            doc.chunk_count,
            doc.upload_timestamp.format("%Y-%m-%d %H:%M"),
            doc.filename
        );
    }
    Ok(())
}

fn stats_command(config: &Config) -> anyhow::Result<()> {
    let kb = open_knowledge_base(config)?;
    let stats = kb.stats()?;
    println!("Documents:       {}", stats.document_count);
    println!("Chunks:          {}", stats.chunk_count);
    println!("Index entries:   {}", stats.index_entries);
    println!("Dimension:       {}", stats.index_dimension);
    println!("Embedding model: {}", stats.embedding_model);
    println!("Database size:   {}", format_file_size(stats.database_size_bytes));
    Ok(())
}

async fn search_command(config: &Config, query: &str, top_k: Option<usize>) -> anyhow::Result<()> {
    let kb = Arc::new(open_knowledge_base(config)?);
    let retriever = api::Retriever::new(kb, config.retrieval.clone());
    let passages = retriever
        .retrieve(
            query,
            top_k.unwrap_or(config.retrieval.top_k),
            config.retrieval.min_score,
        )
        .await?;

    if passages.is_empty() {
        println!("No results above the relevance floor ({:.2})", config.retrieval.min_score);
        return Ok(());
    }
    for (i, passage) in passages.iter().enumerate() {
        println!("{}. Score: {:.3}  {}", i + 1, passage.score, passage.filename);
        println!("   {}", truncate_chars(&passage.chunk.text, 300));
        println!();
    }
    Ok(())
}

async fn health_command(config: &Config) -> anyhow::Result<()> {
    let agent = KnowledgeAgent::from_config(config)?;

    let embedder = agent.knowledge_base().embedder();
    match knowledge_agent::ml::embed_with_timeout(
        embedder.as_ref(),
        "health check",
        agent.knowledge_base().embed_timeout(),
    )
    .await
    {
        Ok(_) => println!("Embedder {}: ok", embedder.model_id()),
        Err(e) => println!("Embedder {}: {}", embedder.model_id(), e),
    }

    match agent.model().health_check().await {
        Ok(()) => println!("Language model {} at {}: ok", agent.model().name(), config.llm.base_url),
        Err(e) => println!("Language model {}: {}", agent.model().name(), e),
    }
    Ok(())
}
