//! # Application State Management
//!
//! Process-wide state shared by every HTTP handler and media stream actor.
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration (`Arc<RwLock<AppConfig>>`)
//! - **metrics**: counters updated by middleware and call actors
//! - **services**: immutable speech service handles built once at startup
//! - **launcher**: outbound call creation
//!
//! Per-call state is NOT kept here. Each media stream owns its
//! `CallSession`; the only cross-call data are the counters below.
//!
//! ## Locking:
//! Locks are held only for the duration of a counter update or a clone.
//! A poisoned lock still holds consistent counters, so readers recover the
//! inner value instead of panicking.

use crate::config::AppConfig;
use crate::pipeline::TurnOutcome;
use crate::services::twilio::CallLauncher;
use crate::services::ServiceHandles;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Shared application state handed to handlers as `web::Data<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters for requests and calls
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Speech service clients shared by all calls
    pub services: ServiceHandles,

    /// Outbound call creation
    pub launcher: Arc<dyn CallLauncher>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since startup.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total HTTP requests processed
    pub request_count: u64,

    /// HTTP requests that ended with a 4xx/5xx status
    pub error_count: u64,

    /// Media streams currently connected
    pub active_calls: u32,

    /// Media streams accepted since startup
    pub calls_total: u64,

    /// Media streams refused because the call limit was reached
    pub calls_rejected: u64,

    /// Inbound media frames across all calls
    pub frames_received: u64,

    pub turns_delivered: u64,
    pub turns_skipped: u64,
    pub turns_failed: u64,

    /// Turns answered with the fallback offer instead of a generated reply
    pub fallback_replies: u64,

    /// Per-route statistics, keyed by "METHOD /pattern"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one route.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, services: ServiceHandles, launcher: Arc<dyn CallLauncher>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            services,
            launcher,
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request against its route.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Admit a new media stream if fewer than `limit` are active.
    ///
    /// Check and increment happen under one write lock, so concurrent
    /// upgrades cannot overshoot the limit.
    pub fn try_open_call(&self, limit: usize) -> bool {
        let mut metrics = self.metrics_mut();
        if metrics.active_calls as usize >= limit {
            metrics.calls_rejected += 1;
            return false;
        }
        metrics.active_calls += 1;
        metrics.calls_total += 1;
        true
    }

    /// Release a slot taken by `try_open_call`.
    pub fn close_call(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_calls = metrics.active_calls.saturating_sub(1);
    }

    pub fn record_frames(&self, count: u64) {
        self.metrics_mut().frames_received += count;
    }

    /// Count a finished turn by outcome.
    pub fn record_turn(&self, outcome: &TurnOutcome, fallback_reply: bool) {
        let mut metrics = self.metrics_mut();
        match outcome {
            TurnOutcome::Delivered { .. } => metrics.turns_delivered += 1,
            TurnOutcome::Skipped(_) => metrics.turns_skipped += 1,
            TurnOutcome::Failed(_) => metrics.turns_failed += 1,
        }
        if fallback_reply {
            metrics.fallback_replies += 1;
        }
    }

    /// Consistent copy of all counters.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
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

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FailReason, SkipReason};
    use crate::testing::app_state as test_state;

    #[test]
    fn test_call_admission_respects_limit() {
        let state = test_state();
        assert!(state.try_open_call(2));
        assert!(state.try_open_call(2));
        assert!(!state.try_open_call(2));

        state.close_call();
        assert!(state.try_open_call(2));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_calls, 2);
        assert_eq!(metrics.calls_total, 3);
        assert_eq!(metrics.calls_rejected, 1);
    }

    #[test]
    fn test_close_call_never_underflows() {
        let state = test_state();
        state.close_call();
        assert_eq!(state.get_metrics_snapshot().active_calls, 0);
    }

    #[test]
    fn test_turn_counters() {
        let state = test_state();
        state.record_turn(&TurnOutcome::Delivered { fallback_audio: false }, true);
        state.record_turn(&TurnOutcome::Skipped(SkipReason::EmptyTranscript), false);
        state.record_turn(&TurnOutcome::Failed(FailReason::TransportClosed), false);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.turns_delivered, 1);
        assert_eq!(metrics.turns_skipped, 1);
        assert_eq!(metrics.turns_failed, 1);
        assert_eq!(metrics.fallback_replies, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert!((health.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((health.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_config_validates() {
        let state = test_state();
        let mut config = state.get_config();
        config.audio.history_limit = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().audio.history_limit, 12);
    }
}
