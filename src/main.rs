use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use visitd::clock::SystemClock;
use visitd::config::Config;
use visitd::directory::InMemoryDirectory;
use visitd::engine::Engine;
use visitd::http::{build_router, AppState};
use visitd::notify::{Dispatcher, NotifyHub};
use visitd::ratelimit::RateLimiter;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
    info!("shutdown signal received, draining requests");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    visitd::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let directory = match &config.seed {
        Some(path) => InMemoryDirectory::from_seed_file(path)?,
        None => {
            tracing::warn!("VISITD_SEED not set, directory starts empty");
            InMemoryDirectory::new()
        }
    };
    let hub = Arc::new(NotifyHub::new());
    let clock = Arc::new(SystemClock);
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        Arc::new(directory),
        Dispatcher::in_process(hub),
        clock.clone(),
    )?);

    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        visitd::compactor::run_compactor(compactor_engine, threshold).await;
    });

    let limiter = Arc::new(RateLimiter::new(clock, config.rate_limit_max_keys));

    let app = build_router(AppState {
        engine,
        limiter,
        submit_rate: config.submit_rate,
    });

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("visitd listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  submit rate: {} per {}s",
        config.submit_rate.max_requests, config.submit_rate.window_secs
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("visitd stopped");
    Ok(())
}
