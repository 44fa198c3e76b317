//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor:
//! the immutable configuration, session admission, and counters for `/metrics`.
//!
//! ## Concurrency:
//! - The configuration is read-only after startup, so a plain `Arc` is enough.
//! - Admission uses an atomic counter so the capacity check and the increment
//!   happen as one step; a [`SessionGuard`] gives the slot back on drop, on
//!   every exit path of a session.
//! - Counters live behind an `RwLock`; they are only touched once per request
//!   or once per session, never per audio chunk.

use crate::config::AppConfig;
use crate::session::{EndReason, SessionReport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    metrics: Arc<RwLock<AppMetrics>>,
    active_sessions: Arc<AtomicUsize>,
    pub start_time: Instant,
}

/// Counters collected since the server started.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,
    /// Requests that ended with a 4xx/5xx status
    pub error_count: u64,
    pub sessions_started: u64,
    /// Connections refused because the server was at capacity
    pub sessions_rejected: u64,
    /// Finished sessions by why they left `ACTIVE`. Clean disconnects and
    /// receive errors are counted apart.
    pub sessions_ended: HashMap<EndReason, u64>,
    pub chunks_received: u64,
    pub events_relayed: u64,
}

/// Holds one admission slot; releases it when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Claim a session slot, or `None` when `max_concurrent_sessions` are
    /// already running.
    pub fn try_open_session(&self) -> Option<SessionGuard> {
        let max = self.config.server.max_concurrent_sessions;
        let admitted = self
            .active_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max).then_some(active + 1)
            })
            .is_ok();

        let mut metrics = self.metrics_mut();
        if admitted {
            metrics.sessions_started += 1;
            Some(SessionGuard { active: self.active_sessions.clone() })
        } else {
            metrics.sessions_rejected += 1;
            None
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn record_session_end(&self, report: &SessionReport) {
        let mut metrics = self.metrics_mut();
        *metrics.sessions_ended.entry(report.reason).or_default() += 1;
        metrics.chunks_received += report.chunks_received as u64;
        metrics.events_relayed += report.events_relayed as u64;
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn metrics_mut(&self) -> std::sync::RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AppMetrics {
    pub fn sessions_ended_by(&self, reason: EndReason) -> u64 {
        self.sessions_ended.get(&reason).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn state_with_capacity(max: usize) -> AppState {
        let mut config = AppConfig::default();
        config.server.max_concurrent_sessions = max;
        AppState::new(config)
    }

    #[test]
    fn test_admission_respects_capacity() {
        let state = state_with_capacity(2);

        let first = state.try_open_session();
        let second = state.try_open_session();
        assert!(first.is_some() && second.is_some());
        assert!(state.try_open_session().is_none());
        assert_eq!(state.active_sessions(), 2);

        drop(first);
        assert_eq!(state.active_sessions(), 1);
        assert!(state.try_open_session().is_some());

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.sessions_started, 3);
        assert_eq!(metrics.sessions_rejected, 1);
    }

    #[test]
    fn test_session_end_is_counted_by_reason() {
        let state = state_with_capacity(4);
        let report = |reason| SessionReport {
            session_id: Uuid::new_v4(),
            reason,
            chunks_received: 3,
            events_relayed: 2,
            relay_outcome: None,
            duration: Duration::from_millis(5),
        };

        state.record_session_end(&report(EndReason::ClientClosed));
        state.record_session_end(&report(EndReason::TransportFault));
        state.record_session_end(&report(EndReason::ClientClosed));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.sessions_ended_by(EndReason::ClientClosed), 2);
        assert_eq!(metrics.sessions_ended_by(EndReason::TransportFault), 1);
        assert_eq!(metrics.sessions_ended_by(EndReason::PipelineFault), 0);
        assert_eq!(metrics.chunks_received, 9);
        assert_eq!(metrics.events_relayed, 6);
    }
}
