//! Edge node agent
//!
//! Runs pods on the local container engine and reports their status.
//!
//! ## Tasks
//!
//! - **Change tracker**: follows engine events to learn which pods changed
//! - **Status loop**: polls node status and logs pod transitions

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edgelet::backend::DockerBackend;
use edgelet::config::Config;
use edgelet::node::{run_status_loop, NodeInfo};
use edgelet::{Edgelet, EngineSettings, HostedPodManager, ManagerKind, PodEngine, PodManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting edge node agent");
    info!(
        node_name = %config.node_name,
        project = %config.project,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let kind = ManagerKind::detect(Config::hosted());
    let (manager, tracker_handle): (Arc<dyn PodManager>, Option<JoinHandle<()>>) = match kind {
        ManagerKind::LocalEngine => {
            let backend = DockerBackend::new(&config.docker_socket);
            if !backend.socket_exists() {
                warn!(
                    socket = %config.docker_socket.display(),
                    "Container engine socket not found, calls will fail until it appears"
                );
            }

            let engine = PodEngine::new(Arc::new(backend), EngineSettings::from_config(&config));
            let handle = engine.spawn_tracker(shutdown_rx.clone());
            (Arc::new(engine), Some(handle))
        }
        ManagerKind::Hosted => {
            info!("Running under a hosting orchestrator, pod operations are refused");
            (Arc::new(HostedPodManager), None)
        }
    };

    let edgelet = Arc::new(Edgelet::new(manager, NodeInfo::from_config(&config)));

    // Start the status loop
    let status_handle = tokio::spawn(run_status_loop(
        Arc::clone(&edgelet),
        Duration::from_secs(config.status_interval_secs),
        shutdown_rx.clone(),
    ));

    let tracker_exit = async {
        match tracker_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = tracker_exit => {
            match result {
                Ok(()) => info!("Change tracker exited"),
                Err(e) => error!(error = %e, "Change tracker task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if let Err(e) = status_handle.await {
        error!(error = %e, "Status loop task panicked");
    }

    info!("Edge node agent shutdown complete");
    Ok(())
}
