//! relaymeter - multi-proxy TCP/UDP forwarder with per-proxy traffic accounting

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relaymeter::{Config, Result, Runtime};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Multi-proxy TCP/UDP forwarder with per-proxy traffic accounting"
)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relaymeter=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    info!(
        "relaymeter v{} starting with {} proxies",
        env!("CARGO_PKG_VERSION"),
        config.proxies.len()
    );

    let mut runtime = Runtime::from_config(&config)?;
    runtime.run().await
}
