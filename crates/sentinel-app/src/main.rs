//! sentinel - entry point

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Market and account data ingestion service
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via SENTINEL_CONFIG)
    #[arg(short, long, env = "SENTINEL_CONFIG", default_value = "config/default.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any wss:// connection.
    sentinel_ws::init_crypto();

    let args = Args::parse();
    sentinel_telemetry::init_logging()?;

    info!("Starting sentinel v{}", env!("CARGO_PKG_VERSION"));
    info!(config_path = %args.config, "Loading configuration");

    let config = sentinel_app::AppConfig::from_file(&args.config)?;
    info!(
        ws_base_url = %config.ws_base_url,
        rest_base_url = %config.rest.base_url,
        symbols = config.symbols.len(),
        "Configuration loaded"
    );

    let app = sentinel_app::Application::new(config)?;
    app.run().await?;

    Ok(())
}
