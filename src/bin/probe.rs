//! dcchain probe
//!
//! Loads a connection template, prints its description and performs one
//! connection attempt through the configured layer chain.

use anyhow::{Context, Result};
use clap::Parser;
use dcchain::config::{generate_example_config, Config};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Probe a DC through a layered stream chain
#[derive(Parser, Debug)]
#[command(name = "dcchain-probe")]
#[command(about = "Connect to a DC through a configured layer chain")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "dcchain.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// DC identifier (overrides config)
    #[arg(long)]
    dc: Option<String>,

    /// Only print the connection description
    #[arg(long)]
    dry_run: bool,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    // Load configuration
    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    if let Some(dc) = args.dc {
        config.connection.dc = dc;
    }

    // Initialize logging
    let level = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    match config.logging.format.as_str() {
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }

    let mut template = config.build_context().context("Invalid connection template")?;
    println!("{}", template);
    if let Some(proxy) = template.proxy_descriptor() {
        println!("{}", serde_json::to_string(&proxy)?);
    }
    if args.dry_run {
        return Ok(());
    }

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    template.set_read_callback(move |n| {
        counter.fetch_add(n, Ordering::Relaxed);
    });

    let cancel = CancellationToken::new();
    template.set_cancellation_token(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let started = Instant::now();
    match template.connect().await {
        Ok(mut stream) => {
            info!(
                "Connected to DC {} in {:?}",
                template.int_dc(),
                started.elapsed()
            );
            stream.shutdown().await.ok();
            info!("Received {} bytes", received.load(Ordering::Relaxed));
            Ok(())
        }
        Err(e) => {
            error!("Connection failed: {}", e);
            Err(e).context(format!("Failed to connect via {}", template))
        }
    }
}
