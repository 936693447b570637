use clap::Parser;
use kaede::{CompletionGateway, GatewayConfig, Kaede};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod models;
mod state;

use crate::state::{AppState, LocalOverrides};

#[derive(Parser, Debug)]
#[command(name = "kaede-server")]
#[command(about = "HTTP API for the Kaede companion backend")]
#[command(version)]
struct Config {
    /// Directory holding the database and settings
    #[arg(long, env = "KAEDE_DATA_DIR", default_value = "./kaede_data")]
    data_dir: PathBuf,

    #[arg(long, env = "KAEDE_BIND", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Credential for the completion provider
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "KAEDE_COMPLETION_URL", default_value = kaede::gateway::DEFAULT_COMPLETION_URL)]
    completion_url: String,

    /// Overrides the Ollama URL from settings
    #[arg(long, env = "OLLAMA_URL")]
    ollama_url: Option<String>,

    /// Overrides the bridge URL from settings
    #[arg(long, env = "KAEDE_BRIDGE_URL")]
    bridge_url: Option<String>,

    /// Leave a fresh database empty instead of creating the tables
    #[arg(long)]
    no_migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,kaede=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    tracing::info!("Opening Kaede data in {}", config.data_dir.display());

    let kaede = Kaede::open(&config.data_dir, !config.no_migrate).await?;
    if !kaede.store().tables_ready().await {
        tracing::warn!("storage tables are missing; run without --no-migrate to create them");
    }

    let gateway = CompletionGateway::new(GatewayConfig {
        endpoint: config.completion_url,
        api_key: config.api_key,
    });
    if !gateway.is_configured() {
        tracing::warn!("OPENAI_API_KEY not configured; chat requests will fail");
    }

    let overrides = LocalOverrides {
        ollama_url: config.ollama_url,
        bridge_url: config.bridge_url,
    };
    let state = AppState::new(kaede, gateway, overrides);
    let app = api::router(state);

    tracing::info!("Kaede server listening on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
