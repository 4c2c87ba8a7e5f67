use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (IRCDECK_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("IRCDECK_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("ircdeck_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ircdeck_server::config::ServerConfig::parse();
    tracing::info!("Starting ircdeck on {}", config.listen_addr);
    if let Some(ref dir) = config.web_static_dir {
        tracing::info!("Static web client: {dir}");
    }
    ircdeck_server::run(config).await
}
