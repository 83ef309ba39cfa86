//! # Kiln Server
//!
//! Worker process: loads configuration, connects the job store and runs
//! every configured queue until Ctrl+C or SIGTERM.

use kiln_config::ConfigLoader;
use kiln_core::{init_tracing, KilnResult};
use kiln_jobs::register_metrics;
use kiln_server::startup::{build_client, print_banner, print_startup_info, run_until};
use kiln_server::tasks::LogMailer;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(code = e.error_code(), "Application error: {}", e);
        eprintln!("kiln-server: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> KilnResult<()> {
    let config_loader = ConfigLoader::from_default_location()?;
    let config = config_loader.get().await;

    init_tracing(&config.telemetry)?;

    print_banner();
    info!("Starting Kiln Server...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    print_startup_info(&config);

    register_metrics();

    let client = build_client(&config, Arc::new(LogMailer)).await?;
    run_until(&client, shutdown_signal(), config.jobs.worker.shutdown_timeout()).await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
