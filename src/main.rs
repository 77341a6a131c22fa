use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talkfloor::{
    api,
    config::ServerConfig,
    coordinator::{Coordinator, CoordinatorConfig, ExitReason},
    identity::IdentityConfig,
    state::AppState,
    stats::{self, StatsConfig},
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talkfloor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting talkfloor...");

    let server_config = ServerConfig::from_env();
    let coordinator_config = CoordinatorConfig::from_env();
    let identity_config = IdentityConfig::from_env();

    let Some(gate) = identity_config.build_gate() else {
        tracing::error!(
            "No identity verifier configured. Set IDENTITY_VERIFY_URL or IDENTITY_DEV_TOKENS=true."
        );
        std::process::exit(1);
    };

    let stats = stats::spawn(StatsConfig::from_env());
    let (coordinator, mut coordinator_task) =
        Coordinator::spawn(coordinator_config, Arc::new(stats.clone()));

    let state = Arc::new(AppState::new(
        coordinator,
        stats,
        gate,
        identity_config.classifier(),
    ));
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));
    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        served = axum::serve(listener, app) => served,
        exit = &mut coordinator_task => {
            match exit {
                Ok(ExitReason::HostAbsent) => {
                    tracing::warn!("Host did not return within the grace period, shutting down");
                }
                Ok(reason) => tracing::warn!(?reason, "Coordinator stopped, shutting down"),
                Err(e) => tracing::error!("Coordinator task failed: {}", e),
            }
            std::process::exit(0);
        }
    }
}
