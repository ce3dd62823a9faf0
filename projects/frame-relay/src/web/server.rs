use crate::cli::Args;
use crate::relay::dispatch::DispatchLoop;
use crate::relay::service::{spawn_dispatcher, DispatchHandle};
use crate::relay::worker::ProcessWorker;
use crate::web::api::{get_status, submit_frame_handler};
use crate::web::gateway::ws_handler;
use crate::web::AppState;
use anyhow::Result;
use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub async fn run_server(args: Args) -> Result<()> {
    let listener = bind_listener(args.host, args.port, args.port_attempts)?;

    let (detections, _) = broadcast::channel(args.broadcast_capacity.get());
    let worker = ProcessWorker::new(args.worker_config());
    let dispatch = DispatchLoop::new(worker, args.frame_queue(), args.restart_policy());
    let (dispatch_handle, dispatcher) =
        spawn_dispatcher(dispatch, detections.clone(), args.result_timeout());

    let state = Arc::new(AppState::new(dispatch_handle.clone(), detections));
    let app = build_router(state);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Frame relay server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app)
        .with_graceful_shutdown(shutdown_signal(dispatch_handle.clone()))
        .await?;

    // Covers the server stopping for any reason other than a signal.
    dispatch_handle.shutdown().await;
    dispatcher.await?;

    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/frames", post(submit_frame_handler))
        .route("/status", get(get_status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn bind_listener(host: IpAddr, port: u16, attempts: u16) -> Result<TcpListener> {
    let mut current_port = port;
    let mut remaining = attempts;
    loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Must be non-blocking before it is handed to Tokio
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                return Ok(listener);
            }
            Err(e) => {
                remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
                }
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM, after the worker has been killed.
async fn shutdown_signal(dispatch: DispatchHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
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
                warn!("Failed to listen for SIGTERM: {}", e);
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

    info!("Shutdown signal received");
    dispatch.shutdown().await;
}
