//! Notification bridge over the real-time event delivery backend.
//!
//! The bridge delivers two lifecycle events per execution — `tool_executing`
//! then `tool_completed` — and never lets delivery failure abort the
//! execution itself. Two backend shapes are normalized once at construction
//! into [`NotificationBackend`]; the engine never branches on shape.
//!
//! Delivery loss is logged at `error!`, not as a routine warning: undetected
//! loss silently degrades the live experience this channel exists to
//! support. When a recovery sink is configured a failed delivery is retried
//! exactly once, with a recovery marker and the original failure reason
//! merged into the payload.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::context::ExecutionContext;
use crate::metrics::DispatchMetrics;

/// Upper bound on a single delivery attempt. A hung backend must never
/// block capability execution.
pub(crate) const NOTIFY_DEADLINE: Duration = Duration::from_secs(2);

/// Event name for the pre-invocation notification.
pub const EVENT_TOOL_EXECUTING: &str = "tool_executing";
/// Event name for the post-invocation notification.
pub const EVENT_TOOL_COMPLETED: &str = "tool_completed";

/// Error produced by a backend sink.
pub type SinkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Delivery outcome from a backend: `Ok(false)` (explicit decline) and
/// `Err(_)` are both failures, tolerated identically.
pub type SinkResult = Result<bool, SinkError>;

/// Generic "send named event" backend shape.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one named event.
    async fn send_event(&self, event_type: &str, data: Value) -> SinkResult;
}

/// Paired tool-lifecycle backend shape.
#[async_trait]
pub trait LifecycleSink: Send + Sync {
    /// Announce that a tool is about to execute.
    async fn notify_tool_executing(
        &self,
        run_id: &str,
        agent_name: &str,
        tool_name: &str,
        parameters: Value,
    ) -> SinkResult;

    /// Announce that a tool finished, with its outcome payload.
    async fn notify_tool_completed(
        &self,
        run_id: &str,
        agent_name: &str,
        tool_name: &str,
        result: Value,
        execution_time_ms: u64,
    ) -> SinkResult;
}

/// A backend normalized to one of the two supported shapes, resolved once
/// at bridge construction.
#[derive(Clone)]
pub enum NotificationBackend {
    /// Generic named-event backend.
    Event(Arc<dyn EventSink>),
    /// Paired executing/completed backend.
    Lifecycle(Arc<dyn LifecycleSink>),
}

impl std::fmt::Debug for NotificationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Event(_) => f.write_str("NotificationBackend::Event"),
            Self::Lifecycle(_) => f.write_str("NotificationBackend::Lifecycle"),
        }
    }
}

/// Outcome carried by the `tool_completed` event.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// The tool produced a result.
    Success(Value),
    /// The tool failed; the stringified error.
    Error(String),
}

impl ToolOutcome {
    fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Error(_) => "error",
        }
    }
}

/// Bridge between one dispatcher and its notification backend.
pub struct NotificationBridge {
    backend: NotificationBackend,
    recovery: Option<Arc<dyn EventSink>>,
    context: Arc<ExecutionContext>,
    dispatcher_id: String,
    delivery_failures: AtomicU64,
}

impl NotificationBridge {
    /// Create a bridge for one dispatcher.
    #[must_use]
    pub fn new(
        backend: NotificationBackend,
        recovery: Option<Arc<dyn EventSink>>,
        context: Arc<ExecutionContext>,
        dispatcher_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            recovery,
            context,
            dispatcher_id: dispatcher_id.into(),
            delivery_failures: AtomicU64::new(0),
        }
    }

    /// Number of failed delivery attempts (primary and recovery combined).
    #[must_use]
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Best-effort `tool_executing` notification. Never fails.
    pub async fn emit_executing(
        &self,
        tool_name: &str,
        parameters: &Value,
        metrics: &DispatchMetrics,
    ) {
        let payload = json!({
            "tool_name": tool_name,
            "parameters": parameters,
            "user_id": self.context.user_id(),
            "run_id": self.context.run_id(),
            "thread_id": self.context.thread_id(),
            "timestamp": Utc::now().to_rfc3339(),
        });

        let attempt = match &self.backend {
            NotificationBackend::Event(sink) => {
                Self::bounded(sink.send_event(EVENT_TOOL_EXECUTING, payload.clone())).await
            }
            NotificationBackend::Lifecycle(sink) => {
                Self::bounded(sink.notify_tool_executing(
                    self.context.run_id(),
                    &self.dispatcher_id,
                    tool_name,
                    parameters.clone(),
                ))
                .await
            }
        };

        self.settle(EVENT_TOOL_EXECUTING, tool_name, payload, attempt, metrics)
            .await;
    }

    /// Best-effort `tool_completed` notification. Never fails.
    pub async fn emit_completed(
        &self,
        tool_name: &str,
        outcome: &ToolOutcome,
        execution_time_ms: u64,
        metrics: &DispatchMetrics,
    ) {
        let mut payload = json!({
            "tool_name": tool_name,
            "status": outcome.status(),
            "execution_time_ms": execution_time_ms,
            "user_id": self.context.user_id(),
            "run_id": self.context.run_id(),
            "thread_id": self.context.thread_id(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(obj) = payload.as_object_mut() {
            match outcome {
                ToolOutcome::Success(result) => {
                    obj.insert("result".to_owned(), result.clone());
                }
                ToolOutcome::Error(err) => {
                    obj.insert("error".to_owned(), Value::String(err.clone()));
                }
            }
        }

        let attempt = match &self.backend {
            NotificationBackend::Event(sink) => {
                Self::bounded(sink.send_event(EVENT_TOOL_COMPLETED, payload.clone())).await
            }
            NotificationBackend::Lifecycle(sink) => {
                // The paired shape takes the bare outcome, not the event
                // envelope.
                let result = match outcome {
                    ToolOutcome::Success(value) => value.clone(),
                    ToolOutcome::Error(err) => Value::String(err.clone()),
                };
                Self::bounded(sink.notify_tool_completed(
                    self.context.run_id(),
                    &self.dispatcher_id,
                    tool_name,
                    result,
                    execution_time_ms,
                ))
                .await
            }
        };

        self.settle(EVENT_TOOL_COMPLETED, tool_name, payload, attempt, metrics)
            .await;
    }

    /// Race a delivery attempt against the notify deadline.
    async fn bounded(fut: impl Future<Output = SinkResult> + Send) -> Result<bool, String> {
        match tokio::time::timeout(NOTIFY_DEADLINE, fut).await {
            Ok(Ok(delivered)) => Ok(delivered),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "delivery deadline exceeded ({}ms)",
                NOTIFY_DEADLINE.as_millis()
            )),
        }
    }

    /// Record the attempt outcome and run the recovery path on failure.
    async fn settle(
        &self,
        event_type: &str,
        tool_name: &str,
        payload: Value,
        attempt: Result<bool, String>,
        metrics: &DispatchMetrics,
    ) {
        let reason = match attempt {
            Ok(true) => {
                metrics.record_event_sent();
                debug!(event = event_type, tool = tool_name, "notification delivered");
                return;
            }
            Ok(false) => "backend declined delivery".to_owned(),
            Err(reason) => reason,
        };

        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        error!(
            event = event_type,
            tool = tool_name,
            dispatcher = %self.dispatcher_id,
            reason = %reason,
            "notification delivery failed; live progress updates are degraded"
        );

        let Some(recovery) = &self.recovery else {
            return;
        };

        let mut recovery_payload = payload;
        if let Some(obj) = recovery_payload.as_object_mut() {
            obj.insert("recovery".to_owned(), Value::Bool(true));
            obj.insert("original_failure".to_owned(), Value::String(reason.clone()));
        }

        match Self::bounded(recovery.send_event(event_type, recovery_payload)).await {
            Ok(true) => {
                metrics.record_event_sent();
                debug!(event = event_type, tool = tool_name, "recovery delivery succeeded");
            }
            Ok(false) => {
                self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    event = event_type,
                    tool = tool_name,
                    dispatcher = %self.dispatcher_id,
                    primary_failure = %reason,
                    recovery_failure = "backend declined delivery",
                    "both primary and recovery notification channels failed; \
                     clients will miss this tool lifecycle event"
                );
            }
            Err(recovery_reason) => {
                self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    event = event_type,
                    tool = tool_name,
                    dispatcher = %self.dispatcher_id,
                    primary_failure = %reason,
                    recovery_failure = %recovery_reason,
                    "both primary and recovery notification channels failed; \
                     clients will miss this tool lifecycle event"
                );
            }
        }
    }
}

impl std::fmt::Debug for NotificationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBridge")
            .field("backend", &self.backend)
            .field("has_recovery", &self.recovery.is_some())
            .field("dispatcher_id", &self.dispatcher_id)
            .field("delivery_failures", &self.delivery_failures())
            .finish()
    }
}
