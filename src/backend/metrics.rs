//! Render backend health and performance counters.
//!
//! All counters are atomics so the hot render path never takes a lock to
//! record an outcome. [`BackendMetrics::snapshot`] produces a serialisable
//! view for health endpoints and logs.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct BackendMetrics {
    total_renders: AtomicU64,
    failed_renders: AtomicU64,
    total_restarts: AtomicU64,
    total_render_ms: AtomicU64,
    consecutive_failures: AtomicU64,
    last_health_ok: AtomicBool,
    last_health_at_ms: AtomicU64,
    started_at_ms: AtomicU64,
}

/// Point-in-time view of the backend counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_renders: u64,
    pub failed_renders: u64,
    pub total_restarts: u64,
    pub avg_render_ms: f64,
    pub error_rate_percent: f64,
    pub consecutive_failures: u64,
    pub last_health_ok: bool,
    pub uptime_seconds: f64,
}

impl BackendMetrics {
    pub fn record_success(&self, duration: Duration) {
        self.total_renders.fetch_add(1, Ordering::Relaxed);
        self.total_render_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_renders.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.total_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self, healthy: bool) {
        self.last_health_ok.store(healthy, Ordering::Relaxed);
        self.last_health_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Reset the uptime origin, called when the engine (re)starts.
    pub fn reset_start_time(&self) {
        self.started_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let ok = self.total_renders.load(Ordering::Relaxed);
        let failed = self.failed_renders.load(Ordering::Relaxed);
        let total_ms = self.total_render_ms.load(Ordering::Relaxed);
        let attempts = ok + failed;
        let started = self.started_at_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_renders: ok,
            failed_renders: failed,
            total_restarts: self.total_restarts.load(Ordering::Relaxed),
            avg_render_ms: if ok > 0 { total_ms as f64 / ok as f64 } else { 0.0 },
            error_rate_percent: if attempts > 0 {
                failed as f64 / attempts as f64 * 100.0
            } else {
                0.0
            },
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_health_ok: self.last_health_ok.load(Ordering::Relaxed),
            uptime_seconds: if started > 0 {
                (now_ms().saturating_sub(started)) as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
