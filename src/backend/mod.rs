//! Render backend management.
//!
//! [`RenderBackend`] owns one rendering subprocess per worker process and
//! exposes a single operation: [`RenderBackend::convert_to_raster`]. Around
//! that operation it provides the reliability envelope the rest of the
//! pipeline depends on:
//!
//! * a bounded semaphore capping simultaneous subprocess-side work,
//! * a hard per-attempt timeout,
//! * restart-then-retry recovery (a backend that timed out is in an unknown
//!   state, so restart before retry is mandatory, not optional),
//! * an optional restart-after-N-conversions threshold bounding memory
//!   growth of long-lived browser processes.
//!
//! Lock discipline (three independent primitives, never nested):
//! the lifecycle mutex serializes start/stop/restart; the conversion counter
//! has its own mutex so counting never blocks renders; the semaphore gates
//! render slots only. State reads (`is_running`) are lock-free best-effort —
//! a render racing a concurrent restart simply fails fast into its own
//! retry path.

pub mod chromium;
pub mod metrics;
pub mod office;

pub use chromium::ChromiumEngine;
pub use metrics::{BackendMetrics, MetricsSnapshot};
pub use office::OfficeConverter;

use crate::error::{BackendError, EngineError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Lifecycle of the rendering subprocess.
///
/// Transitions: `NotStarted → Running` (start), `Running → Restarting →
/// Running` (restart), `Running → Stopped` (stop). `start()` accepts
/// `NotStarted` and `Stopped` alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    NotStarted = 0,
    Running = 1,
    Restarting = 2,
    Stopped = 3,
}

impl BackendState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BackendState::Running,
            2 => BackendState::Restarting,
            3 => BackendState::Stopped,
            _ => BackendState::NotStarted,
        }
    }
}

/// One rasterisation request: content plus exact viewport pixel dimensions.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// SVG (or other renderable) content bytes.
    pub content: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Device scale factor for this render.
    pub scale_factor: f64,
}

/// A successful rasterisation.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

/// The subprocess seam the manager drives.
///
/// Implementations wrap a concrete renderer ([`ChromiumEngine`] in
/// production, mocks in tests). All reliability logic lives in the manager,
/// none in the engine.
#[async_trait]
pub trait RasterEngine: Send + Sync {
    /// Launch the subprocess. Called under the manager's lifecycle lock.
    async fn launch(&self) -> Result<(), EngineError>;
    /// Tear the subprocess down. Must leave the engine relaunchable even
    /// when individual close operations fail.
    async fn shutdown(&self) -> Result<(), EngineError>;
    /// Live connectivity probe (actual process aliveness, not a cached flag).
    async fn is_connected(&self) -> bool;
    /// Renderer version string, if the subprocess exposes one.
    async fn version(&self) -> Option<String>;
    /// Perform one isolated render.
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, EngineError>;
}

// ── Configuration ────────────────────────────────────────────────────────

/// Tuning knobs for the backend manager.
///
/// Every numeric parameter has a documented valid range; out-of-range
/// values log a warning and fall back to the default rather than failing
/// construction. Bad configuration degrades, it does not crash startup.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Device scale factor for rendering. Range 1.0–10.0, default 1.0.
    pub scale_factor: f64,
    /// Maximum simultaneous renders. Range 1–100, default 10.
    pub max_concurrent_renders: usize,
    /// Restart the subprocess after this many conversions; 0 disables.
    /// Range 0–10000, default 0.
    pub restart_after_renders: u64,
    /// Total attempts per conversion (including the first). Range 1–10,
    /// default 2.
    pub max_render_attempts: u32,
    /// Hard timeout per render attempt. Range 5–300 s, default 30 s.
    pub render_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            max_concurrent_renders: 10,
            restart_after_renders: 0,
            max_render_attempts: 2,
            render_timeout: Duration::from_secs(30),
        }
    }
}

impl BackendConfig {
    /// Clamp every parameter into its documented range, logging a warning
    /// and substituting the default for out-of-range values.
    pub fn validated(self) -> Self {
        let defaults = Self::default();
        let mut cfg = self;

        if !(1.0..=10.0).contains(&cfg.scale_factor) {
            warn!(
                value = cfg.scale_factor,
                "scale_factor must be between 1.0 and 10.0, using default 1.0"
            );
            cfg.scale_factor = defaults.scale_factor;
        }
        if !(1..=100).contains(&cfg.max_concurrent_renders) {
            warn!(
                value = cfg.max_concurrent_renders,
                "max_concurrent_renders must be between 1 and 100, using default 10"
            );
            cfg.max_concurrent_renders = defaults.max_concurrent_renders;
        }
        if cfg.restart_after_renders > 10_000 {
            warn!(
                value = cfg.restart_after_renders,
                "restart_after_renders must be between 0 and 10000, using default 0"
            );
            cfg.restart_after_renders = defaults.restart_after_renders;
        }
        if !(1..=10).contains(&cfg.max_render_attempts) {
            warn!(
                value = cfg.max_render_attempts,
                "max_render_attempts must be between 1 and 10, using default 2"
            );
            cfg.max_render_attempts = defaults.max_render_attempts;
        }
        if !(5..=300).contains(&cfg.render_timeout.as_secs()) {
            warn!(
                value = cfg.render_timeout.as_secs(),
                "render_timeout must be between 5 and 300 seconds, using default 30"
            );
            cfg.render_timeout = defaults.render_timeout;
        }
        cfg
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

/// Manager for one persistent rendering subprocess.
///
/// One instance per worker process, constructed at startup and injected
/// into the pipeline; never shared across worker processes.
pub struct RenderBackend {
    engine: Arc<dyn RasterEngine>,
    config: BackendConfig,
    state: AtomicU8,
    /// Serializes start/stop/restart. Render calls never take this lock.
    lifecycle: Mutex<()>,
    /// Guards the conversion counter only, so counting never blocks renders.
    render_count: Mutex<u64>,
    permits: Semaphore,
    metrics: BackendMetrics,
}

impl RenderBackend {
    /// Create a manager over the given engine. The configuration is
    /// validated (see [`BackendConfig::validated`]).
    pub fn new(engine: Arc<dyn RasterEngine>, config: BackendConfig) -> Self {
        Self::new_unchecked(engine, config.validated())
    }

    fn new_unchecked(engine: Arc<dyn RasterEngine>, config: BackendConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent_renders);
        RenderBackend {
            engine,
            config,
            state: AtomicU8::new(BackendState::NotStarted as u8),
            lifecycle: Mutex::new(()),
            render_count: Mutex::new(0),
            permits,
            metrics: BackendMetrics::default(),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Current lifecycle state (lock-free read).
    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BackendState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Lock-free best-effort liveness flag. A conversion racing a restart
    /// may observe a stale value; the retry path tolerates that.
    pub fn is_running(&self) -> bool {
        self.state() == BackendState::Running
    }

    /// Launch the rendering subprocess. Idempotent: logs and no-ops when
    /// already running.
    pub async fn start(&self) -> Result<(), BackendError> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == BackendState::Running {
            debug!("render backend already running");
            return Ok(());
        }
        info!("starting render backend");
        match self.engine.launch().await {
            Ok(()) => {
                self.set_state(BackendState::Running);
                self.metrics.reset_start_time();
                info!("render backend started");
                Ok(())
            }
            Err(e) => {
                self.set_state(BackendState::NotStarted);
                Err(e.into())
            }
        }
    }

    /// Stop the rendering subprocess. Idempotent; the state is cleared even
    /// when individual close operations fail — cleanup is unconditional.
    pub async fn stop(&self) -> Result<(), BackendError> {
        let _guard = self.lifecycle.lock().await;
        if matches!(self.state(), BackendState::NotStarted | BackendState::Stopped) {
            return Ok(());
        }
        if let Err(e) = self.engine.shutdown().await {
            warn!(error = %e, "error while shutting down render engine");
        }
        self.set_state(BackendState::Stopped);
        info!("render backend stopped");
        Ok(())
    }

    /// Stop and relaunch the subprocess, resetting the conversion counter.
    pub async fn restart(&self) -> Result<(), BackendError> {
        let _guard = self.lifecycle.lock().await;
        self.restart_locked("manual restart").await
    }

    /// Restart while already holding the lifecycle lock.
    ///
    /// Deliberately does NOT drain the render semaphore: in-flight renders
    /// are allowed to fail fast against the mid-restart backend and recover
    /// through their own retry path.
    async fn restart_locked(&self, context: &'static str) -> Result<(), BackendError> {
        info!(context, "restarting render backend");
        self.set_state(BackendState::Restarting);
        if let Err(e) = self.engine.shutdown().await {
            warn!(error = %e, "error while shutting down render engine for restart");
        }
        match self.engine.launch().await {
            Ok(()) => {
                self.set_state(BackendState::Running);
                *self.render_count.lock().await = 0;
                self.metrics.record_restart();
                self.metrics.reset_start_time();
                info!("render backend restarted");
                Ok(())
            }
            Err(source) => {
                self.set_state(BackendState::NotStarted);
                Err(BackendError::RestartFailed { context, source })
            }
        }
    }

    /// Liveness probe that verifies the live subprocess connection, not
    /// just the state flag.
    pub async fn health_check(&self) -> bool {
        let healthy = self.is_running() && self.engine.is_connected().await;
        self.metrics.record_health_check(healthy);
        healthy
    }

    /// Renderer version string, if available.
    pub async fn version(&self) -> Option<String> {
        self.engine.version().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// THE primary operation: rasterise `request.content` at the requested
    /// viewport size.
    ///
    /// Fails immediately with [`BackendError::NotStarted`] when the backend
    /// is not running. Otherwise performs up to `max_render_attempts`
    /// attempts, each bounded by `render_timeout` and gated by the render
    /// semaphore, restarting the backend between attempts.
    pub async fn convert_to_raster(
        &self,
        request: &RenderRequest,
    ) -> Result<RenderedImage, BackendError> {
        if !self.is_running() {
            return Err(BackendError::NotStarted);
        }

        // Count the conversion and check the restart threshold atomically;
        // the restart itself runs outside the counter lock so other
        // conversions keep counting meanwhile.
        let threshold = self.config.restart_after_renders;
        let should_restart = {
            let mut count = self.render_count.lock().await;
            *count += 1;
            if threshold > 0 && *count >= threshold {
                *count = 0;
                true
            } else {
                false
            }
        };
        if should_restart {
            info!(threshold, "conversion count reached threshold, restarting render backend");
            let _guard = self.lifecycle.lock().await;
            self.restart_locked("conversion threshold").await?;
        }

        let max_attempts = self.config.max_render_attempts;
        let mut last_error: Option<BackendError> = None;

        for attempt in 1..=max_attempts {
            let outcome = self.render_once(request).await;
            let failure = match outcome {
                Ok(image) => return Ok(image),
                Err(e) => e,
            };
            warn!(
                attempt,
                max_attempts,
                error = %failure,
                "render attempt failed"
            );
            let context: &'static str = match &failure {
                BackendError::Timeout { .. } => "timeout",
                _ => "conversion error",
            };
            last_error = Some(failure);

            // The backend is in an unknown state after a failure or timeout;
            // restart before retrying is mandatory. Not on the last attempt,
            // where the caller receives the final error instead.
            if attempt < max_attempts {
                let _guard = self.lifecycle.lock().await;
                if let Err(restart_err) = self.restart_locked(context).await {
                    self.metrics.record_failure();
                    return Err(restart_err);
                }
            }
        }

        self.metrics.record_failure();
        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        Err(BackendError::ConversionFailed {
            attempts: max_attempts,
            last,
        })
    }

    /// One semaphore-gated, timeout-bounded render attempt.
    async fn render_once(&self, request: &RenderRequest) -> Result<RenderedImage, BackendError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackendError::Engine(EngineError::NotRunning))?;

        let started = Instant::now();
        match tokio::time::timeout(self.config.render_timeout, self.engine.render(request)).await {
            Ok(Ok(bytes)) => {
                self.metrics.record_success(started.elapsed());
                debug!(
                    bytes = bytes.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "render attempt succeeded"
                );
                Ok(RenderedImage {
                    bytes,
                    mime_type: "image/png",
                })
            }
            Ok(Err(e)) => Err(BackendError::Engine(e)),
            Err(_) => Err(BackendError::Timeout {
                secs: self.config.render_timeout.as_secs(),
            }),
        }
    }
}
