use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use target_clickhouse::{ClickhouseLikeDestination, Target, TargetConfig};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "target-clickhouse")]
#[command(about = "Singer target loading record streams into ClickHouse")]
struct Args {
    /// Config file(s); later files override earlier ones
    #[arg(long)]
    config: Vec<PathBuf>,

    /// Print setting names and defaults as JSON and exit
    #[arg(long)]
    about: bool,

    /// Read messages from this file instead of stdin
    #[arg(long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // stdout carries STATE messages, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.about {
        println!("{}", serde_json::to_string_pretty(&TargetConfig::about())?);
        return Ok(());
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config =
        TargetConfig::load(args.config.as_slice()).context("Failed to load configuration")?;
    let destination = ClickhouseLikeDestination::connect(config.clone())
        .context("Invalid target configuration")?;
    info!(driver = config.driver.as_str(), "Target initialized");

    let mut target = Target::new(config, Arc::new(destination))?;

    let input: Box<dyn AsyncBufRead + Unpin> = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let summary = target.run(input, tokio::io::stdout()).await?;
    info!(
        records = summary.records_written,
        dropped = summary.records_dropped,
        versions = summary.versions_activated,
        "Finished loading"
    );
    Ok(())
}
