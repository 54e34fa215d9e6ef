//! feedsync - serves and replicates facility-status feeds.

use std::sync::Arc;

use axum::http::Request;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use feedsync::{router, AppState, Config, FeedService, HttpHubClient};

/// Feed replication server.
#[derive(Parser, Debug)]
#[command(name = "feedsync")]
#[command(about = "Serve Atom feeds of facility reports and replicate them through a hub", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();

    let client = Arc::new(HttpHubClient::new(config.hub_timeout)?);
    let service = Arc::new(FeedService::open(&config, client)?);

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let notifier = tokio::spawn(service.notifier().run(async move {
        let _ = stop_rx.changed().await;
    }));

    let app = router(AppState::new(Arc::clone(&service), &config)).layer(
        TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            tracing::span!(
                Level::INFO,
                "http_request",
                method = %request.method(),
                path = %request.uri().path(),
            )
        }),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = stop_tx.send(true);
    notifier.await?;
    service.store().sync()?;
    tracing::info!("shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
