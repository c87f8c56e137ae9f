//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every relay connection
//! through `web::Data<AppState>`.
//!
//! ## Contents:
//! - **config**: the live configuration, replaceable through `PUT /api/v1/config`
//! - **metrics**: request counters plus relay gauges and counters
//! - **recent_sessions**: bounded record of finished relay connections
//! - **provider**: the upstream model provider, absent when no credential is set
//!
//! ## Locking:
//! Config and metrics sit behind `Arc<RwLock<T>>`. Handlers clone what they
//! need and release the lock immediately; nothing holds a lock across an
//! `.await`. A poisoned lock is recovered rather than propagated, since every
//! writer leaves the data consistent between statements.

use crate::config::AppConfig;
use crate::relay::provider::LiveProvider;
use crate::relay::recent::RecentSessions;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The state shared by all handlers and relay actors.
///
/// Cloning is cheap: every field is either `Copy` or behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by middleware and relay connections
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Summaries of recently finished relay connections
    pub recent_sessions: Arc<RecentSessions>,

    /// Upstream provider; `None` means every relay connection reports the
    /// missing credential
    pub provider: Option<Arc<dyn LiveProvider>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across requests and relay connections.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Relay connections currently open
    pub active_sessions: u32,

    /// Upstream sessions successfully created
    pub upstream_sessions_opened: u64,

    /// Upstream session creations that failed
    pub upstream_sessions_failed: u64,

    /// Client messages forwarded upstream
    pub frames_forwarded: u64,

    /// Upstream events written back to clients
    pub events_relayed: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create state without an upstream provider.
    pub fn new(config: AppConfig) -> Self {
        let recent = RecentSessions::new(config.relay.recent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            recent_sessions: Arc::new(recent),
            provider: None,
            start_time: Instant::now(),
        }
    }

    /// Attach the upstream provider built at startup.
    pub fn with_provider(mut self, provider: Arc<dyn LiveProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record one request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a relay connection slot.
    ///
    /// Check and increment happen under one write lock, so two concurrent
    /// upgrades cannot both take the last slot.
    pub fn try_acquire_session(&self, max_connections: usize) -> bool {
        let mut metrics = self.metrics_write();
        if metrics.active_sessions as usize >= max_connections {
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Release a relay connection slot. Never goes below zero.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics_write();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    pub fn record_upstream_opened(&self) {
        self.metrics_write().upstream_sessions_opened += 1;
    }

    pub fn record_upstream_failed(&self) {
        self.metrics_write().upstream_sessions_failed += 1;
    }

    pub fn add_frames_forwarded(&self, count: u64) {
        self.metrics_write().frames_forwarded += count;
    }

    pub fn add_events_relayed(&self, count: u64) {
        self.metrics_write().events_relayed += count;
    }

    /// Consistent copy of the metrics for serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Name of the configured provider, for health output.
    pub fn provider_name(&self) -> Option<&'static str> {
        self.provider.as_ref().map(|p| p.name())
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
