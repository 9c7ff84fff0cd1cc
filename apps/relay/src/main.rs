mod config;
mod registry;
mod websocket;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::registry::Registry;
use crate::websocket::websocket_handler;

#[derive(Parser, Debug)]
#[command(name = "parley-relay", about = "Two-party WebRTC signaling relay")]
struct Cli {
    /// Listen port (overrides PARLEY_RELAY_PORT)
    #[arg(long)]
    port: Option<u16>,
}

async fn health_check() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let registry = Arc::new(Registry::new());

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(registry)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("parley relay listening on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
