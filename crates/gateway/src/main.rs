mod distribute;
mod encoder;
mod ingest;
mod manager;
mod peer;
mod queue;
mod stats;
#[cfg(test)]
mod testutil;
mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::manager::{PeerHooks, PeerManager};
use crate::peer::PeerSessionConfig;
use crate::web::AppState;

/// Everything — ingest, distribution drain, session closes — must finish
/// inside this window once shutdown starts.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

fn parse_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/prism.toml");

    let mut i = 1;
    while i < args.len() {
        if matches!(args[i].as_str(), "--config" | "-c") && i + 1 < args.len() {
            config_path = PathBuf::from(&args[i + 1]);
            i += 1;
        }
        i += 1;
    }
    config_path
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = parse_args();
    let config = prism_protocol::load_config(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let stats = Arc::new(stats::StreamStats::default());

    let hooks = PeerHooks {
        on_peer_connected: Some(Box::new(|peer_id: &str| {
            tracing::info!(target: "audit", event = "peer_connected", peer_id, "Viewer connected");
        })),
        on_peer_disconnected: Some(Box::new(|peer_id: &str| {
            tracing::info!(target: "audit", event = "peer_disconnected", peer_id, "Viewer disconnected");
        })),
    };

    let manager = PeerManager::new(
        PeerSessionConfig {
            video_codec: config.video.codec,
            max_bitrate_kbps: config.video.max_bitrate_kbps,
            ice_servers: config.session.stun_urls.clone(),
        },
        config.session.max_peers as usize,
        Arc::clone(&stats),
        hooks,
    );

    let (ingest_tx, ingest_rx) = queue::ingest_channel(
        config.ingest.video_queue,
        config.ingest.audio_queue,
        Arc::clone(&stats),
    );
    let (metadata_tx, metadata_rx) = tokio::sync::watch::channel(None);

    let state = Arc::new(AppState {
        manager: Arc::clone(&manager),
        stats: Arc::clone(&stats),
        stream_info: metadata_rx,
        started_at: Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state), &config.server.allowed_origins)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let cancel = CancellationToken::new();

    let ingest_task = tokio::spawn(ingest::run_ingest(
        PathBuf::from(&config.ipc.socket_path),
        ingest_tx,
        Arc::clone(&stats),
        cancel.clone(),
    ));
    let distribution_task = tokio::spawn(distribute::run_distribution(
        ingest_rx,
        Arc::clone(&manager),
        Arc::clone(&stats),
        config.video.default_fps,
        Box::new(encoder::Passthrough),
        metadata_tx,
        cancel.clone(),
    ));
    let stats_task = tokio::spawn(stats::run_stats_loop(
        Arc::clone(&stats),
        Arc::clone(&manager),
        config.server.stats_interval_secs,
        cancel.clone(),
    ));

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen))?;

    tracing::info!("===========================================");
    tracing::info!("  Prism Media Gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Signaling on http://{}", config.server.listen);
    tracing::info!("  Producer socket at {}", config.ipc.socket_path);
    tracing::info!("===========================================");

    let server_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }

    // Ordered teardown: stop ingest (removes the socket file), let the
    // distribution loop drain, close every viewer session, then the server.
    cancel.cancel();
    let shutdown = async {
        match ingest_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Ingest ended with error: {e:#}"),
            Err(e) => tracing::warn!("Ingest task join error: {e}"),
        }
        let _ = distribution_task.await;
        manager.close().await;
        let _ = stats_task.await;
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("HTTP server error: {e}"),
            Err(e) => tracing::warn!("Server task join error: {e}"),
        }
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, shutdown).await.is_err() {
        tracing::warn!("Shutdown budget exceeded, exiting anyway");
    }

    tracing::info!("Gateway shut down cleanly");
    Ok(())
}
