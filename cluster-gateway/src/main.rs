use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cluster_gateway::{build_router, AppState, Config, ManagerMode};
use model_worker::manager::{LocalWorkerManager, RemoteWorkerManager, WorkerManager};
use model_worker::registry::{EmbeddedRegistry, ModelRegistry, RegistryClient};
use model_worker::worker::DefaultWorkerFactory;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("cluster-gateway {}", env!("CARGO_PKG_VERSION"));
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting cluster gateway");

    // Registry served to worker hosts
    let registry = Arc::new(EmbeddedRegistry::new(
        config.controller.ttl(),
        config.controller.sweep_interval(),
    ));
    if config.controller.enabled {
        registry.init().await?;
        tracing::info!(
            ttl_secs = config.controller.heartbeat_ttl_secs,
            "Controller registry enabled"
        );
    }

    let manager: Arc<dyn WorkerManager> = match config.manager.mode {
        ManagerMode::Remote => {
            let lookup: Arc<dyn ModelRegistry> = match config.manager.controller() {
                Some(controller) => {
                    tracing::info!("Resolving instances via controller at {}", controller.url);
                    Arc::new(RegistryClient::new(&controller)?)
                }
                None => {
                    if !config.controller.enabled {
                        tracing::warn!("No controller enabled or configured, no instances will be found");
                    }
                    registry.clone()
                }
            };
            Arc::new(RemoteWorkerManager::new(
                lookup,
                config.manager.request_timeout(),
                config.manager.generate_timeout(),
                config.manager.retry_policy(),
            )?)
        }
        ManagerMode::Local => {
            tracing::info!(models = config.local.models.len(), "Hosting workers in process");
            Arc::new(
                LocalWorkerManager::new(
                    registry.clone(),
                    Arc::new(DefaultWorkerFactory),
                    config.local.heartbeat.clone(),
                    config.local.manager.clone(),
                )
                .with_startup_models(config.local.startup_requests(config.server.port)),
            )
        }
    };

    let state = Arc::new(AppState::new(
        config.clone(),
        manager.clone(),
        registry.clone(),
    ));
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let starter = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = starter.start().await {
            tracing::error!("Manager startup incomplete: {}", e);
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    if tokio::time::timeout(Duration::from_secs(60), manager.stop(true))
        .await
        .is_err()
    {
        tracing::warn!("Manager shutdown timed out");
    }
    registry.shutdown().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
