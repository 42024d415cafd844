//! hbt-daemon entry point.
//!
//! This file is intentionally thin: it loads configuration, sets up tracing,
//! builds the shared state, starts the resync loop, wires middleware and
//! serves HTTP. Handlers live in `routes.rs`; shared state in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use hbt_config::{
    load_from_path_list, report_unused_keys, ConfigSurface, EngineSettings, UnusedKeyPolicy,
};
use hbt_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config_paths = std::env::var("HBT_CONFIG").unwrap_or_default();
    let loaded = load_from_path_list(&config_paths).context("load HBT_CONFIG")?;
    let unused = report_unused_keys(
        ConfigSurface::Daemon,
        &loaded.config_json,
        UnusedKeyPolicy::Warn,
    )?;
    for pointer in &unused.unused_leaf_pointers {
        warn!(pointer = %pointer, "config key not consumed by the daemon");
    }
    let settings = EngineSettings::from_config_json(&loaded.config_json)?;
    info!(config_hash = %loaded.config_hash, sources = settings.sources.len(), "config loaded");

    let shared = Arc::new(
        state::AppState::from_settings(&settings)?.with_config_hash(loaded.config_hash.clone()),
    );
    state::spawn_resync_loop(
        Arc::clone(&shared),
        Duration::from_millis(settings.resync_interval_ms),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = match bind_addr_from_env() {
        Some(addr) => addr,
        None => settings
            .daemon_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("CONFIG_INVALID /daemon/addr: '{}'", settings.daemon_addr))?,
    };
    info!("hbt-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("HBT_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
