//! Shared runtime state for hbt-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The engine owns all
//! batch state; this module only carries it plus the resync sources.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use hbt_config::EngineSettings;
use hbt_engine::Engine;
use hbt_sources::{build_sources, RecordSource};

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Sources pulled by `POST /v1/resync` and the background loop.
    pub sources: Arc<Vec<Arc<dyn RecordSource>>>,
    pub source_timeout: Duration,
    pub build: BuildInfo,
    pub config_hash: Option<String>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Arc::new(Engine::default()))
    }
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            sources: Arc::new(Vec::new()),
            source_timeout: Duration::from_millis(EngineSettings::default().source_timeout_ms),
            build: BuildInfo {
                service: "hbt-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            config_hash: None,
        }
    }

    /// Engine, sources and timeouts from typed settings.
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let engine = Arc::new(Engine::from_settings(settings)?);
        let sources = build_sources(&settings.sources)?;
        Ok(Self::new(engine)
            .with_sources(sources, Duration::from_millis(settings.source_timeout_ms)))
    }

    pub fn with_sources(mut self, sources: Vec<Arc<dyn RecordSource>>, timeout: Duration) -> Self {
        self.sources = Arc::new(sources);
        self.source_timeout = timeout;
        self
    }

    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that resyncs every configured source each
/// `interval`. The first pass runs immediately. No sources means no task.
pub fn spawn_resync_loop(state: Arc<AppState>, interval: Duration) -> Option<JoinHandle<()>> {
    if state.sources.is_empty() {
        debug!("no resync sources configured");
        return None;
    }
    info!(
        sources = state.sources.len(),
        interval_ms = interval.as_millis() as u64,
        "resync loop started"
    );
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = state
                .engine
                .resync(state.sources.as_slice(), state.source_timeout)
                .await;
            debug!(?report, "resync tick");
        }
    }))
}
