//! pipeline-client - fetch the shared pipeline from a running server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use pipeline_share::defaults::{DEFAULT_HOST, DEFAULT_MAX_RETRIES, DEFAULT_PORT};
use pipeline_share::pipeline::Pipeline;
use pipeline_share::transport::TransferConfig;
use pipeline_share::Client;

#[derive(Parser)]
#[command(name = "pipeline-client")]
#[command(about = "Fetch the shared speech pipeline from a running pipeline-server")]
struct Cli {
    /// Server host
    #[arg(long, env = "PIPELINE_SHARE_HOST", default_value = DEFAULT_HOST, global = true)]
    host: String,

    /// Server port
    #[arg(short, long, env = "PIPELINE_SHARE_PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value = "5", value_parser = parse_seconds, global = true)]
    timeout: Duration,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the pipeline and print a summary as JSON
    Fetch {
        /// Attempts before giving up
        #[arg(long, env = "PIPELINE_SHARE_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
        retries: u32,

        /// Seconds to wait between attempts
        #[arg(long, default_value = "1", value_parser = parse_seconds)]
        retry_delay: Duration,

        /// Directory for staging files (default: system temp dir)
        #[arg(long, env = "PIPELINE_SHARE_STAGING_DIR")]
        staging_dir: Option<PathBuf>,
    },

    /// Ask the server to stop accepting connections
    Shutdown,

    /// Check whether the server accepts connections
    Status,
}

fn parse_seconds(s: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("invalid number of seconds: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let builder = Client::builder()
        .host(&cli.host)
        .port(cli.port)
        .connect_timeout(cli.timeout);

    match cli.command {
        Commands::Fetch {
            retries,
            retry_delay,
            staging_dir,
        } => {
            let mut transfer = TransferConfig::default();
            if let Some(dir) = staging_dir {
                transfer = transfer.staging_dir(dir);
            }
            let client = builder
                .max_retries(retries)
                .retry_delay(retry_delay)
                .transfer(transfer)
                .build();
            cmd_fetch(&client).await
        }
        Commands::Shutdown => cmd_shutdown(&builder.build()).await,
        Commands::Status => cmd_status(&cli.host, cli.port, cli.timeout).await,
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn cmd_fetch(client: &Client) -> Result<()> {
    let pipeline: Pipeline = client.fetch_or_exit().await;

    let summary = json!({
        "lang_code": &pipeline.lang_code,
        "repo_id": &pipeline.repo_id,
        "weights_bytes": pipeline.weights_len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_shutdown(client: &Client) -> Result<()> {
    let config = client.config();
    let message = client
        .shutdown_server()
        .await
        .with_context(|| format!("Failed to shut down server at {}:{}", config.host, config.port))?;

    println!("{}", message.unwrap_or_else(|| "Shutdown acknowledged".to_string()));
    Ok(())
}

async fn cmd_status(host: &str, port: u16, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => {
            println!("Server running at {}:{}", host, port);
            Ok(())
        }
        _ => {
            println!("Server not running at {}:{}", host, port);
            std::process::exit(1);
        }
    }
}
