//! # Application State Management
//!
//! Shared state every HTTP handler and WebSocket actor can reach.
//!
//! ## What lives here:
//! - **config**: the runtime configuration (read on every `start()`, updatable
//!   through `PUT /api/v1/config`)
//! - **metrics**: per-endpoint request counters filled in by the middleware
//! - **voice**: the one `VoiceSession` this server drives. It is created at
//!   startup and handed out by reference; nothing else owns the microphone
//!
//! ## Key Rust Concepts:
//! - **Arc<RwLock<T>>**: many readers or one writer, shared across worker threads
//! - **Arc<VoiceSession>**: the session does its own locking internally, so it
//!   only needs shared ownership

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::config::AppConfig;
use crate::session::{SessionSettings, VoiceSession};

/// State shared across all request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: cloning copies the `Arc`s, not the data behind them
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// The voice pipeline
    pub voice: Arc<VoiceSession>,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of failed requests since server start
    pub error_count: u64,

    /// UI clients currently connected to `/ws/voice`
    pub ui_connections: u32,

    /// Per-endpoint statistics, keyed by e.g. "POST /api/v1/voice/start"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Counters for one endpoint.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, voice: Arc<VoiceSession>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            voice,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock right away so writers aren't held up.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap() = new_config;
        Ok(())
    }

    /// Settings for the next voice session, from the current configuration
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::from_config(&self.config.read().unwrap())
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record one finished request against its endpoint.
    ///
    /// ## Rust Concepts:
    /// - **.entry().or_default()**: creates the endpoint's counters the first
    ///   time it is seen
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_ui_connections(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.ui_connections += 1;
    }

    /// Saturates at zero so a double disconnect can't underflow.
    pub fn decrement_ui_connections(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.ui_connections = metrics.ui_connections.saturating_sub(1);
    }

    /// Copy of the metrics, so the lock isn't held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
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

    /// Fraction of requests that failed, 0.0 to 1.0
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
