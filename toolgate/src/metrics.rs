//! In-memory execution metrics, owned exclusively by one dispatcher.
//!
//! Counters are atomics so concurrent `execute` calls on the same dispatcher
//! interleave without lost updates; `snapshot` is non-blocking.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters and timers mutated during dispatch.
#[derive(Debug)]
pub struct DispatchMetrics {
    dispatcher_id: String,
    user_id: String,
    tools_executed: AtomicU64,
    successful_executions: AtomicU64,
    failed_executions: AtomicU64,
    permission_checks: AtomicU64,
    permission_denials: AtomicU64,
    security_violations: AtomicU64,
    websocket_events_sent: AtomicU64,
    total_execution_time_ms: AtomicU64,
    last_execution_time: Mutex<Option<DateTime<Utc>>>,
}

impl DispatchMetrics {
    /// Create a zeroed metrics collector bound to a dispatcher identity.
    #[must_use]
    pub fn new(dispatcher_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            dispatcher_id: dispatcher_id.into(),
            user_id: user_id.into(),
            tools_executed: AtomicU64::new(0),
            successful_executions: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            permission_checks: AtomicU64::new(0),
            permission_denials: AtomicU64::new(0),
            security_violations: AtomicU64::new(0),
            websocket_events_sent: AtomicU64::new(0),
            total_execution_time_ms: AtomicU64::new(0),
            last_execution_time: Mutex::new(None),
        }
    }

    /// Record a successful tool execution with its measured duration.
    pub fn record_success(&self, execution_time_ms: u64) {
        self.tools_executed.fetch_add(1, Ordering::Relaxed);
        self.successful_executions.fetch_add(1, Ordering::Relaxed);
        self.record_timing(execution_time_ms);
    }

    /// Record a failed tool execution with its measured duration.
    pub fn record_failure(&self, execution_time_ms: u64) {
        self.tools_executed.fetch_add(1, Ordering::Relaxed);
        self.failed_executions.fetch_add(1, Ordering::Relaxed);
        self.record_timing(execution_time_ms);
    }

    /// Record a passed permission check.
    pub fn record_permission_check(&self) {
        self.permission_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a permission denial.
    pub fn record_permission_denial(&self) {
        self.permission_denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a detected security violation (distinct from a denial).
    pub fn record_security_violation(&self) {
        self.security_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered notification event.
    pub fn record_event_sent(&self) {
        self.websocket_events_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_timing(&self, execution_time_ms: u64) {
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
        if let Ok(mut last) = self.last_execution_time.lock() {
            *last = Some(Utc::now());
        }
    }

    /// Take a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatcher_id: self.dispatcher_id.clone(),
            user_id: self.user_id.clone(),
            tools_executed: self.tools_executed.load(Ordering::Relaxed),
            successful_executions: self.successful_executions.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            permission_checks: self.permission_checks.load(Ordering::Relaxed),
            permission_denials: self.permission_denials.load(Ordering::Relaxed),
            security_violations: self.security_violations.load(Ordering::Relaxed),
            websocket_events_sent: self.websocket_events_sent.load(Ordering::Relaxed),
            total_execution_time_ms: self.total_execution_time_ms.load(Ordering::Relaxed),
            last_execution_time: self
                .last_execution_time
                .lock()
                .map(|last| *last)
                .unwrap_or_default(),
        }
    }
}

/// A point-in-time view of a dispatcher's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Identity of the owning dispatcher.
    pub dispatcher_id: String,
    /// User the dispatcher is scoped to.
    pub user_id: String,
    /// Total executions, successful or not.
    pub tools_executed: u64,
    /// Executions that produced a result.
    pub successful_executions: u64,
    /// Executions that failed, timed out, or were cancelled.
    pub failed_executions: u64,
    /// Permission validations that passed.
    pub permission_checks: u64,
    /// Privileged-tool requests denied for lack of standing.
    pub permission_denials: u64,
    /// Missing/tampered identity detections.
    pub security_violations: u64,
    /// Notification events successfully delivered.
    pub websocket_events_sent: u64,
    /// Sum of measured execution durations.
    pub total_execution_time_ms: u64,
    /// Wall-clock time of the most recent execution.
    pub last_execution_time: Option<DateTime<Utc>>,
}
