// gateway: accepts outbound messages over the control API, hands them to
// per-connection senders, and forwards inbound messages to the configured
// receiver endpoint. All state lives in the embedded store.

use clap::Parser;
use courier_core::Store;
use gateway::{config, control_api, engine};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "courier multi-protocol message gateway")]
struct Args {
    /// Path to the settings file.
    #[arg(short, long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Some(settings_path) = args.settings else {
        eprintln!("\nUsage: gateway --settings=courier.conf\n");
        eprintln!("Example settings file:\n");
        eprintln!("{}", config::sample_settings());
        std::process::exit(1);
    };

    let settings = match config::load_settings(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("FATAL: failed to load settings: {e}");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %settings.db.filename,
        "gateway starting"
    );

    let store = match Store::open(Path::new(&settings.db.filename)) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("FATAL: failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let state = control_api::AppState::new(store, settings.twitter.clone());

    match engine::start_persisted_engines(&state).await {
        Ok(count) => info!(connections = count, "persisted connections started"),
        Err(e) => {
            eprintln!("FATAL: failed to load persisted connections: {e}");
            std::process::exit(1);
        }
    }

    let router = control_api::build_router(state.clone());
    let bind = format!("0.0.0.0:{}", settings.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {bind}: {e}");
            std::process::exit(1);
        }
    };

    info!(addr = %bind, "control API listening");
    info!("  PUT    /connection                    - add a connection");
    info!("  GET    /connection                    - list connections");
    info!("  GET    /connection/[uuid]             - read connection status");
    info!("  DELETE /connection/[uuid]             - delete a connection");
    info!("  PUT    /connection/[uuid]/send        - send a message");
    info!("  GET    /connection/[uuid]/status/[id] - get message status");

    let serve = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        error!(error = %e, "server error");
    }

    engine::stop_all_engines(&state).await;
    info!("shutdown complete");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
