use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use typerace::{
    auth::{AuthConfig, SignedTokenResolver},
    config::RaceConfig,
    state::AppState,
    store::MemoryStore,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "typerace=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting race coordinator...");

    let config = RaceConfig::from_env();
    let resolver = Arc::new(SignedTokenResolver::new(AuthConfig::from_env()));

    let store = match &config.races_file {
        Some(path) => match MemoryStore::from_json_file(path).await {
            Ok(store) => store,
            Err(e) => {
                tracing::error!("Failed to load races from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("RACES_FILE not set, starting with no races");
            MemoryStore::new()
        }
    };

    let addr = config.bind_addr;
    let reap_interval = config.reap_interval;
    let state = Arc::new(AppState::new(config, Arc::new(store), resolver));

    // Remove finished and abandoned rooms in the background
    state.registry.clone().spawn_reaper(reap_interval);

    let app = typerace::app(state);

    tracing::info!("Listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
