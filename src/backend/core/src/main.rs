//! modelsync server - main entry point

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;

use modelsync_core::{
    api::{self, AppState},
    config::Config,
    db::{Database, MemoryDatabase},
    dispatcher::Dispatcher,
    messenger::Messenger,
    model::Hooks,
    observability,
};

#[derive(Parser, Debug)]
#[command(name = "modelsync-server")]
#[command(about = "Reactive model synchronization server", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "MODELSYNC_CONFIG")]
    config: Option<String>,

    /// Override the configured HTTP port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Initialize observability
    observability::init("modelsync-server", &config.observability)?;
    let metrics_handle = observability::install_metrics_recorder()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        entities = ?config.store.entities,
        "Starting modelsync server"
    );

    // Register entity types backed by the in-memory store
    let database = Arc::new(MemoryDatabase::with_entities(config.store.entities.iter().cloned()));
    let mut dispatcher = Dispatcher::new();
    for entity in &config.store.entities {
        let db: Arc<dyn Database> = database.clone();
        dispatcher.register_entity(entity.clone(), db, Hooks::default())?;
    }

    let messenger = Arc::new(Messenger::new(Arc::new(dispatcher), config.messenger.clone()));
    let app_state = AppState::new(messenger).with_metrics(metrics_handle);
    let app = api::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
