use anyhow::Result;
use aviary_server::{api, config, twitter};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

/// Aviary — session-fleet crawler for the platform's internal GraphQL API.
#[derive(Parser, Debug)]
#[command(name = "aviary-server", version, about)]
struct Cli {
    /// Address and port to listen on.
    #[arg(short, long, default_value = "0.0.0.0:8001")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (logs).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aviary_server=debug,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Aviary server"
    );

    let app_config = config::AppConfig::from_env()?;
    info!(accounts = app_config.credentials.len(), "Credentials loaded");

    // Log every account in and probe every endpoint before serving.
    let crawler = Arc::new(twitter::Crawler::new(app_config.credentials).await);
    info!(clients = crawler.client_count(), "Fleet initialized");

    let state = api::AppState { crawler };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!(addr = %cli.listen, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}
