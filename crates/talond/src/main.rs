use clap::Parser;
use tracing::info;

mod app;
mod handler;

/// OpenTalon host daemon: launches plugins and channels, brokers their
/// sockets, and runs the agent loop for every conversation.
#[derive(Debug, Parser)]
#[command(name = "talond", version, about)]
struct Cli {
    /// Config file path (default: ~/.opentalon/opentalon.toml).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // LOG_LEVEL=debug turns on verbose LLM prompt logging; RUST_LOG still
    // wins when set explicitly.
    let default_filter = match std::env::var("LOG_LEVEL").as_deref() {
        Ok("debug") => "debug",
        Ok("trace") => "trace",
        _ => "talond=info,talon_broker=info,talon_agent=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = talon_core::config::TalonConfig::load(cli.config.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("config load failed ({e}), using defaults");
            talon_core::config::TalonConfig::default()
        });

    let app = app::App::build(config).await?;
    info!("opentalon host running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    app.shutdown().await;

    Ok(())
}
