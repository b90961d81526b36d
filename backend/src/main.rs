// main.rs

mod command_queue;
mod config;
mod error;
mod pod_commands;
mod ring_buffer;
mod safety_task;
#[cfg(feature = "testing")]
mod sim_pod;
mod state;
mod stats;
mod telemetry_decode;
mod telemetry_store;
mod telemetry_task;
mod transition_guard;
mod transport;
mod web;

use crate::command_queue::CommandQueue;
use crate::config::{CONFIG_ENV, DEFAULT_CONFIG_PATH, GatewayConfig};
use crate::safety_task::safety_task;
use crate::state::AppState;
use crate::telemetry_store::TelemetryStore;
use crate::telemetry_task::{ListenerStats, TelemetryListener};
use crate::transition_guard::TransitionGuard;
use crate::transport::{CommandTransport, TcpConnector};

use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    // --- Config ---
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load(&config_path)?;

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    #[cfg(feature = "testing")]
    let _sim = {
        let shutdown_rx = shutdown_tx.subscribe();
        let command_addr = config.pod.command_addr.clone();
        let telemetry_bind = config.pod.telemetry_bind.clone();
        tokio::spawn(async move {
            if let Err(e) = sim_pod::sim_pod_task(command_addr, telemetry_bind, shutdown_rx).await {
                warn!("sim pod failed: {e:#}");
            }
        })
    };

    // --- Shared state ---
    let queue = Arc::new(CommandQueue::new(config.queue.capacity, config.queue.overflow));
    let store = Arc::new(TelemetryStore::new(
        config.telemetry.history_capacity,
        config.telemetry.stale_after(),
    ));
    let listener_stats = Arc::new(ListenerStats::default());

    let connector = TcpConnector::new(
        config.pod.command_addr.clone(),
        config.transport.connect_timeout(),
    );
    let (transport, link_rx) =
        CommandTransport::new(connector, Arc::clone(&queue), config.transport.clone());

    let listener = TelemetryListener::bind(
        &config.pod.telemetry_bind,
        Arc::clone(&store),
        Arc::clone(&listener_stats),
        config.telemetry.max_datagram,
    )
    .await
    .with_context(|| format!("cannot bind telemetry socket {}", config.pod.telemetry_bind))?;

    let state = Arc::new(AppState {
        queue,
        store,
        listener_stats,
        link_rx,
        guard: TransitionGuard::new(config.guard.reject_invalid_transitions),
    });

    // --- Background tasks ---
    let tasks: Vec<(&str, JoinHandle<()>)> = vec![
        ("transport", tokio::spawn(transport.run(shutdown_tx.subscribe()))),
        ("telemetry", tokio::spawn(listener.run(shutdown_tx.subscribe()))),
        (
            "safety",
            tokio::spawn(safety_task(
                Arc::clone(&state),
                config.telemetry.watchdog_period(),
                shutdown_tx.subscribe(),
            )),
        ),
    ];

    // --- Webserver ---
    let app: Router = web::router(state);
    let listener = tokio::net::TcpListener::bind(&config.web.bind)
        .await
        .with_context(|| format!("cannot bind web server {}", config.web.bind))?;
    info!(addr = %config.web.bind, "base station listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(());
    for (name, handle) in tasks {
        match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = name, "task panicked: {e}"),
            Err(_) => warn!(task = name, "task did not stop in time"),
        }
    }
    Ok(())
}
