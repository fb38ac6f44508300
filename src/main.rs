#![warn(clippy::all, clippy::pedantic)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use ragline::blob::blob_store_for;
use ragline::config::Config;
use ragline::embedding::create_embedding_provider;
use ragline::llm::{OpenAiCompatibleGenerator, ReliableGenerator};
use ragline::pipeline::{CitationResolver, ContextAssembler, PipelineOptions};
use ragline::{Pipeline, Store, WorkerLoop};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ragline", version, about = "Document-grounded chat worker")]
struct Cli {
    /// Config file path (defaults to the platform config directory).
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker loop (the default).
    Run,
    /// Requeue failed messages so the worker picks them up again.
    Sweep,
    /// Write a default config file and exit.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Init)) {
        let path = match cli.config {
            Some(path) => path,
            None => Config::default_path()?,
        };
        Config::write_default(&path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load_or_init()?,
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Init => unreachable!("handled above"),
        Command::Sweep => sweep(&config).await,
        Command::Run => run(config).await,
    }
}

async fn sweep(config: &Config) -> Result<()> {
    let store = Store::open(&config.database.path).await?;
    let requeued = store.requeue_failed().await?;
    tracing::info!(requeued, "failed messages returned to the queue");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let store = Arc::new(Store::open(&config.database.path).await?);
    let blobs = blob_store_for(&config.storage);

    let generation = &config.generation;
    let api_key = generation.resolve_api_key();
    if api_key.is_none() {
        tracing::warn!("no API key configured; generation requests will go out unauthenticated");
    }
    let timeout = Duration::from_secs(generation.timeout_secs);
    let generator = ReliableGenerator::new(
        Box::new(OpenAiCompatibleGenerator::new(
            &generation.base_url,
            api_key.as_deref(),
            &generation.model,
            generation.temperature,
            timeout,
        )),
        generation.max_retries,
        generation.backoff_ms,
        timeout,
    );

    let embedder: Arc<dyn ragline::embedding::EmbeddingProvider> =
        Arc::from(create_embedding_provider(&config.embedding, api_key.as_deref()));
    let resolver = CitationResolver::new(embedder, generation.top_chunks);

    let pipeline = Arc::new(
        Pipeline::new(
            Arc::clone(&store),
            ContextAssembler::new(Arc::clone(&store), blobs),
            Box::new(generator),
            resolver,
            PipelineOptions {
                history_limit: config.worker.history_limit,
                context_max_chars: generation.context_max_chars,
                system_prompt: generation.system_prompt.clone(),
                generation_attempts: generation.max_retries + 1,
            },
        )
        .await?,
    );

    let feed = Arc::new(ragline::feed::SqliteChangeFeed::new(
        Arc::clone(&store),
        config.worker.batch_size,
    ));
    let worker = WorkerLoop::new(
        feed,
        pipeline,
        Duration::from_millis(config.worker.poll_interval_ms),
        config.worker.concurrency,
    );

    tracing::info!(
        model = config.generation.model,
        concurrency = config.worker.concurrency,
        "worker started"
    );

    tokio::select! {
        () = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}
