//! pipeline-server - holds the speech pipeline and serves copies of it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline_share::defaults::{DEFAULT_HOST, DEFAULT_PORT};
use pipeline_share::pipeline::{
    read_snapshot, write_snapshot, Pipeline, PipelineLoader, DEFAULT_LANG_CODE, DEFAULT_REPO_ID,
};
use pipeline_share::protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PAYLOAD_SIZE};
use pipeline_share::transport::TransferConfig;
use pipeline_share::{Server, ServerConfig, ServerState};

#[derive(Parser)]
#[command(name = "pipeline-server")]
#[command(about = "Build the speech pipeline once and serve it to clients")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the pipeline and serve it until shut down
    Serve {
        #[command(flatten)]
        source: SourceArgs,

        /// Host to bind to
        #[arg(long, env = "PIPELINE_SHARE_HOST", default_value = DEFAULT_HOST)]
        host: String,

        /// Port to listen on
        #[arg(short, long, env = "PIPELINE_SHARE_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Close connections idle for this many seconds (default: never)
        #[arg(long, env = "PIPELINE_SHARE_REQUEST_TIMEOUT")]
        request_timeout: Option<u64>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Build the pipeline from weights and write a cold-start snapshot
    Snapshot {
        /// Model weights file
        #[arg(long, env = "PIPELINE_SHARE_WEIGHTS")]
        weights: PathBuf,

        #[command(flatten)]
        model: ModelArgs,

        /// Snapshot output path
        #[arg(short, long, default_value = "pipeline.snapshot")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Model weights file
    #[arg(
        long,
        env = "PIPELINE_SHARE_WEIGHTS",
        conflicts_with = "snapshot",
        required_unless_present = "snapshot"
    )]
    weights: Option<PathBuf>,

    /// Restore the pipeline from a snapshot instead of loading weights
    #[arg(long, env = "PIPELINE_SHARE_SNAPSHOT")]
    snapshot: Option<PathBuf>,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args)]
struct ModelArgs {
    /// Language code
    #[arg(long, default_value = DEFAULT_LANG_CODE)]
    lang_code: String,

    /// Model repository identifier
    #[arg(long, default_value = DEFAULT_REPO_ID)]
    repo_id: String,
}

#[derive(Args)]
struct TransferArgs {
    /// Directory for staging files (default: system temp dir)
    #[arg(long, env = "PIPELINE_SHARE_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Largest message accepted or sent, in bytes
    #[arg(long, env = "PIPELINE_SHARE_MAX_PAYLOAD", default_value_t = DEFAULT_MAX_PAYLOAD_SIZE)]
    max_payload: u32,

    /// Bytes per socket read/write
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

impl TransferArgs {
    fn into_config(self) -> TransferConfig {
        let config = TransferConfig::default()
            .chunk_size(self.chunk_size)
            .max_payload_size(self.max_payload);
        match self.staging_dir {
            Some(dir) => config.staging_dir(dir),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Serve {
            source,
            host,
            port,
            request_timeout,
            transfer,
        } => {
            let config = ServerConfig::default()
                .host(host)
                .port(port)
                .request_timeout(request_timeout.map(Duration::from_secs))
                .transfer(transfer.into_config());
            cmd_serve(source, config).await
        }
        Commands::Snapshot {
            weights,
            model,
            output,
        } => cmd_snapshot(weights, model, output),
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn build_pipeline(source: &SourceArgs) -> Result<Pipeline> {
    match (&source.snapshot, &source.weights) {
        (Some(snapshot), _) => read_snapshot(snapshot)
            .with_context(|| format!("Failed to read snapshot {}", snapshot.display())),
        (None, Some(weights)) => PipelineLoader::new(weights)
            .lang_code(&source.model.lang_code)
            .repo_id(&source.model.repo_id)
            .load()
            .with_context(|| format!("Failed to load weights {}", weights.display())),
        (None, None) => anyhow::bail!("Either --weights or --snapshot is required"),
    }
}

async fn cmd_serve(source: SourceArgs, config: ServerConfig) -> Result<()> {
    tracing::info!("Initializing pipeline...");
    let pipeline = match build_pipeline(&source) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            // Nothing to serve without the object.
            tracing::error!("Error initializing pipeline: {:#}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Pipeline initialized successfully");

    let state = Arc::new(ServerState::with_object(pipeline));
    let server = Server::bind(config, state)
        .await
        .context("Error starting server")?;

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down server...");
            handle.shutdown();
        }
    });

    server.serve().await?;
    Ok(())
}

fn cmd_snapshot(weights: PathBuf, model: ModelArgs, output: PathBuf) -> Result<()> {
    let pipeline = PipelineLoader::new(&weights)
        .lang_code(model.lang_code)
        .repo_id(model.repo_id)
        .load()
        .with_context(|| format!("Failed to load weights {}", weights.display()))?;

    write_snapshot(&output, &pipeline)
        .with_context(|| format!("Failed to write snapshot {}", output.display()))?;

    println!("Pipeline snapshot saved to {}", output.display());
    Ok(())
}
