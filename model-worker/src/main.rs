//! Model worker host - runs model workers and serves them to the cluster.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use model_worker::config::Config;
use model_worker::manager::{LocalWorkerManager, WorkerManager};
use model_worker::registry::{EmbeddedRegistry, ModelRegistry, RegistryClient};
use model_worker::worker::DefaultWorkerFactory;
use model_worker::{build_router, AppState};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V and an optional config path
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("model-worker {}", VERSION);
        return Ok(());
    }
    let config_path = args
        .windows(2)
        .find(|w| w[0] == "--config" || w[0] == "-c")
        .map(|w| PathBuf::from(&w[1]));

    // Load configuration
    let config = match &config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .map_err(|e| format!("Failed to load configuration: {}", e))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry: Arc<dyn ModelRegistry> = match &config.controller {
        Some(controller) => {
            tracing::info!("Registering with controller at {}", controller.url);
            Arc::new(RegistryClient::new(controller)?)
        }
        None => {
            tracing::info!("No controller configured, running standalone");
            Arc::new(EmbeddedRegistry::new(
                config.heartbeat.ttl(),
                config.heartbeat.interval(),
            ))
        }
    };
    registry.init().await?;

    let manager = Arc::new(
        LocalWorkerManager::new(
            registry.clone(),
            Arc::new(DefaultWorkerFactory),
            config.heartbeat.clone(),
            config.manager.clone(),
        )
        .with_startup_models(config.startup_requests()),
    );

    let state = Arc::new(AppState::new(config.clone(), manager.clone()));
    let app = build_router(state);

    // Start server before workers so remote managers can reach us while models load
    let addr = format!("{}:{}", config.worker.host, config.worker.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {} (advertised as {})", addr, config.worker.advertised());

    let starter = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = starter.start().await {
            tracing::error!("Worker startup incomplete: {}", e);
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down workers");
    if let Err(e) = tokio::time::timeout(Duration::from_secs(60), manager.stop(true)).await {
        tracing::warn!("Worker shutdown timed out: {}", e);
    }
    registry.shutdown().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
