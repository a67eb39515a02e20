//! The dispatch engine: request-scoped orchestration of permission checks,
//! notifications, bounded tool invocation, and metrics.
//!
//! A [`Dispatcher`] is bound to one [`ExecutionContext`] and moves through
//! exactly two states: constructed (active) and cleaned up (terminal).
//! Construction goes through [`DispatcherFactory`](crate::factory::DispatcherFactory);
//! the direct [`Dispatcher::new`] path always fails.
//!
//! Two error channels are deliberate: typed errors are raised for lifecycle
//! and (in strict mode) permission failures, while capability outcomes —
//! success, tool error, timeout, cancellation — are returned inside a
//! [`DispatchResponse`] and never escape `execute()`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::error::{Error, Result, ToolError};
use crate::factory::ActiveDispatchers;
use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::notify::{NotificationBridge, ToolOutcome};
use crate::permission::PermissionValidator;
use crate::registry::ToolRegistry;
use crate::tool::SharedTool;

/// Default deadline for a single tool invocation.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How a dispatcher resolves privileged capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Ordinary per-user dispatch.
    #[default]
    Standard,
    /// Elevated dispatch created through the admin factory path.
    Privileged,
}

/// An ephemeral dispatch request, consumed by the legacy entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Name of the capability to invoke.
    pub tool_name: String,
    /// JSON parameters passed to the capability.
    #[serde(default)]
    pub parameters: Value,
    /// Optional strategy override carried for observability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DispatchStrategy>,
}

impl DispatchRequest {
    /// Create a request for a tool with parameters.
    #[must_use]
    pub fn new(tool_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            strategy: None,
        }
    }
}

/// Metadata attached to every dispatch response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    /// Measured execution time in milliseconds.
    pub execution_time_ms: u64,
    /// The dispatcher that produced this response.
    pub dispatcher_id: String,
    /// The tool that was requested.
    pub tool_name: String,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
}

/// The structured result of one dispatch. Immutable once produced; a
/// terminal success/error signal is always returned even when the
/// real-time channel is fully down.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    /// Whether the invocation succeeded.
    pub success: bool,
    /// The tool's output on success.
    pub result: Option<Value>,
    /// The stringified failure otherwise.
    pub error: Option<String>,
    /// Execution metadata.
    pub metadata: ResponseMetadata,
}

/// Result of [`Dispatcher::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `"healthy"` or `"degraded"`.
    pub status: String,
    /// Human-readable issues, empty when healthy.
    pub issues: Vec<String>,
    /// Whether the dispatcher can still process agent requests. Stays
    /// `true` after delivery failures; only cleanup flips it.
    pub can_process_agents: bool,
}

/// Result of [`Dispatcher::emergency_shutdown_all_executions`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Number of in-flight executions that were force-terminated.
    pub shutdown_executions: u64,
    /// The dispatcher that was shut down.
    pub dispatcher_id: String,
    /// When the shutdown was signalled.
    pub timestamp: DateTime<Utc>,
}

/// Decrements the in-flight gauge on every exit path.
struct InFlightGuard<'a>(&'a AtomicU64);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A request-scoped tool dispatch engine.
pub struct Dispatcher {
    id: String,
    context: Arc<ExecutionContext>,
    registry: RwLock<ToolRegistry>,
    metrics: Arc<DispatchMetrics>,
    bridge: Option<NotificationBridge>,
    validator: PermissionValidator,
    strategy: DispatchStrategy,
    timeout: Duration,
    active: AtomicBool,
    in_flight: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    created_at: DateTime<Utc>,
    dispatchers: Arc<ActiveDispatchers>,
}

impl Dispatcher {
    /// Direct construction is forbidden; this always fails.
    ///
    /// # Errors
    /// Always returns [`Error::Lifecycle`] naming the sanctioned factory
    /// paths.
    pub fn new() -> Result<Self> {
        Err(Error::lifecycle(
            "Dispatcher cannot be constructed directly; use a sanctioned factory path: \
             DispatcherFactory::create_for_user, DispatcherFactory::create_scoped, \
             DispatcherFactory::create_for_request, DispatcherFactory::create_for_admin, \
             or DispatcherFactory::create_legacy_global",
        ))
    }

    /// The real constructor, reachable only through the factory.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        id: String,
        context: Arc<ExecutionContext>,
        registry: ToolRegistry,
        bridge: Option<NotificationBridge>,
        validator: PermissionValidator,
        strategy: DispatchStrategy,
        timeout: Duration,
        dispatchers: Arc<ActiveDispatchers>,
    ) -> Self {
        let metrics = Arc::new(DispatchMetrics::new(id.clone(), context.user_id()));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id,
            context,
            registry: RwLock::new(registry),
            metrics,
            bridge,
            validator,
            strategy,
            timeout,
            active: AtomicBool::new(true),
            in_flight: AtomicU64::new(0),
            shutdown_tx,
            created_at: Utc::now(),
            dispatchers,
        }
        .into_registry()
    }

    fn into_registry(self) -> Self {
        // Registration happens after the struct exists so the record carries
        // the final id.
        self.dispatchers.add(&self.id, self.context.user_id());
        self
    }

    /// The dispatcher identifier, derived from user and run ids.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The execution identity this dispatcher is scoped to.
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// The dispatch strategy chosen at construction.
    #[must_use]
    pub const fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    /// When this dispatcher was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the dispatcher is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::lifecycle(format!(
                "Dispatcher '{}' has been cleaned up and can no longer be used",
                self.id
            )))
        }
    }

    /// Register a capability on this dispatcher.
    ///
    /// # Errors
    /// [`Error::Lifecycle`] after cleanup, [`Error::Invalid`] on a name
    /// collision.
    pub fn register_tool(&self, tool: SharedTool) -> Result<()> {
        self.ensure_active()?;
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(tool)
    }

    /// Whether a tool is registered.
    #[must_use]
    pub fn has_tool(&self, name: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// The set of registered tool names.
    #[must_use]
    pub fn tool_names(&self) -> BTreeSet<String> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names()
    }

    /// Execute a named capability with JSON parameters.
    ///
    /// Permission denials, unknown tools, capability failures, timeouts,
    /// and cancellations all come back as `success = false` responses.
    ///
    /// # Errors
    /// Only [`Error::Lifecycle`] when the dispatcher has been cleaned up.
    pub async fn execute(&self, tool_name: &str, parameters: Value) -> Result<DispatchResponse> {
        match self.execute_inner(tool_name, parameters).await {
            Ok(response) => Ok(response),
            Err(err @ Error::Lifecycle(_)) => Err(err),
            Err(err) => Ok(self.failure_response(tool_name, err.to_string(), 0)),
        }
    }

    /// Legacy tolerant entry point over [`Dispatcher::execute`].
    ///
    /// # Errors
    /// Only [`Error::Lifecycle`] when the dispatcher has been cleaned up.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse> {
        self.execute(&request.tool_name, request.parameters).await
    }

    /// Legacy strict entry point: permission and authentication failures
    /// are re-raised as typed errors, and any failed structured result is
    /// translated into an error.
    ///
    /// # Errors
    /// [`Error::Lifecycle`], [`Error::SecurityViolation`],
    /// [`Error::Permission`], or [`Error::Tool`] for a failed result.
    pub async fn dispatch_strict(&self, request: DispatchRequest) -> Result<DispatchResponse> {
        let response = self
            .execute_inner(&request.tool_name, request.parameters)
            .await?;
        if response.success {
            Ok(response)
        } else {
            let message = response
                .error
                .unwrap_or_else(|| "tool execution failed".to_owned());
            Err(Error::Tool(ToolError::execution(message)))
        }
    }

    /// The shared pipeline. Typed errors escape for lifecycle and
    /// permission failures; everything downstream of the permission gate is
    /// a structured response.
    async fn execute_inner(&self, tool_name: &str, parameters: Value) -> Result<DispatchResponse> {
        self.ensure_active()?;

        self.validator
            .validate(Some(&self.context), tool_name, &self.metrics)
            .await?;

        // Unknown tool: structured failure, and no notification events.
        let Some(tool) = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool_name)
        else {
            debug!(tool = tool_name, dispatcher = %self.id, "requested tool not found");
            return Ok(self.failure_response(
                tool_name,
                ToolError::not_found(tool_name).to_string(),
                0,
            ));
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        // The executing announcement runs concurrently with the invocation:
        // a hung backend is cut off at the notify deadline and never delays
        // tool start.
        let announce = async {
            if let Some(bridge) = &self.bridge {
                bridge
                    .emit_executing(tool_name, &parameters, &self.metrics)
                    .await;
            }
        };
        let invoke = async {
            let started = Instant::now();
            let result = self
                .invoke_bounded(&tool, tool_name, parameters.clone())
                .await;
            let execution_time_ms =
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            (result, execution_time_ms)
        };
        let ((), (result, execution_time_ms)) = tokio::join!(announce, invoke);

        let (response, outcome) = match result {
            Ok(value) => {
                self.metrics.record_success(execution_time_ms);
                (
                    self.success_response(tool_name, value.clone(), execution_time_ms),
                    ToolOutcome::Success(value),
                )
            }
            Err(err) => {
                self.metrics.record_failure(execution_time_ms);
                let message = err.to_string();
                (
                    self.failure_response(tool_name, message.clone(), execution_time_ms),
                    ToolOutcome::Error(message),
                )
            }
        };

        if let Some(bridge) = &self.bridge {
            bridge
                .emit_completed(tool_name, &outcome, execution_time_ms, &self.metrics)
                .await;
        }

        Ok(response)
    }

    /// Race the invocation against the execution deadline and the
    /// emergency-shutdown signal. Dropping the losing future is the
    /// cooperative interruption.
    async fn invoke_bounded(
        &self,
        tool: &SharedTool,
        tool_name: &str,
        parameters: Value,
    ) -> std::result::Result<Value, ToolError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            result = tool.call_json(parameters) => result,
            () = tokio::time::sleep(self.timeout) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    tool = tool_name,
                    dispatcher = %self.id,
                    timeout_ms,
                    "tool execution exceeded deadline and was interrupted"
                );
                Err(ToolError::timeout(tool_name, timeout_ms))
            }
            _ = shutdown_rx.changed() => {
                warn!(tool = tool_name, dispatcher = %self.id, "tool execution force-terminated");
                Err(ToolError::cancelled(tool_name))
            }
        }
    }

    fn success_response(&self, tool_name: &str, result: Value, execution_time_ms: u64) -> DispatchResponse {
        DispatchResponse {
            success: true,
            result: Some(result),
            error: None,
            metadata: self.response_metadata(tool_name, execution_time_ms),
        }
    }

    fn failure_response(
        &self,
        tool_name: &str,
        error: String,
        execution_time_ms: u64,
    ) -> DispatchResponse {
        DispatchResponse {
            success: false,
            result: None,
            error: Some(error),
            metadata: self.response_metadata(tool_name, execution_time_ms),
        }
    }

    fn response_metadata(&self, tool_name: &str, execution_time_ms: u64) -> ResponseMetadata {
        ResponseMetadata {
            execution_time_ms,
            dispatcher_id: self.id.clone(),
            tool_name: tool_name.to_owned(),
            timestamp: Utc::now(),
        }
    }

    /// Non-blocking metrics snapshot.
    #[must_use]
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Report dispatcher health. Notification delivery loss degrades the
    /// status but never stops agent processing.
    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();
        if !self.is_active() {
            issues.push(format!("dispatcher '{}' has been cleaned up", self.id));
        }
        if let Some(bridge) = &self.bridge {
            let failures = bridge.delivery_failures();
            if failures > 0 {
                issues.push(format!("{failures} notification deliveries failed"));
            }
        }
        HealthReport {
            status: if issues.is_empty() { "healthy" } else { "degraded" }.to_owned(),
            can_process_agents: self.is_active(),
            issues,
        }
    }

    /// Force-terminate every in-flight execution and report how many were
    /// interrupted. Each interrupted invocation surfaces as a failed
    /// response to its caller.
    pub fn emergency_shutdown_all_executions(&self) -> ShutdownReport {
        let shutdown_executions = self.in_flight.load(Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        warn!(
            dispatcher = %self.id,
            shutdown_executions,
            "emergency shutdown signalled to all in-flight executions"
        );
        ShutdownReport {
            shutdown_executions,
            dispatcher_id: self.id.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Transition to the terminal cleaned-up state. Idempotent: repeat
    /// calls are no-ops. The registry is emptied, in-flight executions are
    /// signalled, and the dispatcher is removed from the active registry
    /// exactly once.
    pub fn cleanup(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.dispatchers.remove(&self.id);
        info!(dispatcher = %self.id, user = self.context.user_id(), "dispatcher cleaned up");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("user_id", &self.context.user_id())
            .field("strategy", &self.strategy)
            .field("active", &self.is_active())
            .field("tools", &self.tool_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    use serde_json::json;

    use crate::factory::{ActiveDispatchers, DispatcherFactory, DispatcherOptions};
    use crate::notify::NotificationBackend;
    use crate::test_support::RecordingSink;
    use crate::tool::FnTool;

    fn ctx(user: &str, run: &str) -> ExecutionContext {
        ExecutionContext::new(user, run, "t1")
    }

    fn echo_tool() -> SharedTool {
        FnTool::new("echo", "Echo parameters back", |args| async move { Ok(args) }).shared()
    }

    fn boom_tool() -> SharedTool {
        FnTool::from_sync("boom", "Always fails", |_| {
            Err(ToolError::execution("kaboom"))
        })
        .shared()
    }

    fn isolated_options() -> DispatcherOptions {
        DispatcherOptions::new().with_registry_service(ActiveDispatchers::new())
    }

    #[test]
    fn direct_construction_fails_naming_factories() {
        let err = Dispatcher::new().unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        let msg = err.to_string();
        for path in [
            "create_for_user",
            "create_scoped",
            "create_for_request",
            "create_for_admin",
            "create_legacy_global",
        ] {
            assert!(msg.contains(path), "missing {path} in: {msg}");
        }
    }

    #[tokio::test]
    async fn echo_scenario() {
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options().with_tool(echo_tool()),
        )
        .unwrap();

        let response = dispatcher
            .execute("echo", json!({"x": "hello"}))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.result.unwrap()["x"], "hello");
        assert!(response.error.is_none());
        assert_eq!(response.metadata.tool_name, "echo");
        assert_eq!(response.metadata.dispatcher_id, dispatcher.id());
        assert_eq!(dispatcher.get_metrics().tools_executed, 1);
        assert_eq!(dispatcher.get_metrics().successful_executions, 1);
    }

    #[tokio::test]
    async fn boom_scenario() {
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options().with_tool(boom_tool()),
        )
        .unwrap();

        let response = dispatcher.execute("boom", json!({})).await.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("kaboom"));
        let snap = dispatcher.get_metrics();
        assert_eq!(snap.failed_executions, 1);
        assert_eq!(snap.tools_executed, 1);
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_events() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options().with_backend(NotificationBackend::Event(sink.clone())),
        )
        .unwrap();

        let response = dispatcher.execute("missing", json!({})).await.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("not found"));
        assert!(sink.events.lock().unwrap().is_empty());
        assert_eq!(dispatcher.get_metrics().websocket_events_sent, 0);
    }

    #[tokio::test]
    async fn successful_execution_emits_exactly_two_events() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options()
                .with_tool(echo_tool())
                .with_backend(NotificationBackend::Event(sink.clone())),
        )
        .unwrap();

        dispatcher.execute("echo", json!({"x": 1})).await.unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "tool_executing");
        assert_eq!(events[1].0, "tool_completed");
        assert_eq!(events[1].1["status"], "success");
        drop(events);
        assert_eq!(dispatcher.get_metrics().websocket_events_sent, 2);
    }

    #[tokio::test]
    async fn no_backend_means_zero_events_and_success() {
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options().with_tool(echo_tool()),
        )
        .unwrap();

        let response = dispatcher.execute("echo", json!({})).await.unwrap();
        assert!(response.success);
        assert_eq!(dispatcher.get_metrics().websocket_events_sent, 0);
    }

    #[tokio::test]
    async fn failing_backend_does_not_affect_execution() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options()
                .with_tool(echo_tool())
                .with_backend(NotificationBackend::Event(sink)),
        )
        .unwrap();

        let response = dispatcher.execute("echo", json!({"x": 2})).await.unwrap();
        assert!(response.success);
        let snap = dispatcher.get_metrics();
        assert_eq!(snap.successful_executions, 1);
        assert_eq!(snap.websocket_events_sent, 0);

        let health = dispatcher.health_check();
        assert_eq!(health.status, "degraded");
        assert!(health.can_process_agents);
        assert!(!health.issues.is_empty());
    }

    #[tokio::test]
    async fn concurrent_executions_interleave_safely() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let counting = FnTool::new("count", "Counts invocations", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(json!("ok"))
            }
        })
        .shared();

        let dispatcher = Arc::new(
            DispatcherFactory::create_for_user(
                ctx("u1", "r1"),
                isolated_options().with_tool(counting),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let d = Arc::clone(&dispatcher);
                tokio::spawn(async move { d.execute("count", json!({})).await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        let snap = dispatcher.get_metrics();
        assert_eq!(snap.tools_executed, 20);
        assert_eq!(snap.successful_executions, 20);
        assert_eq!(snap.failed_executions, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_is_interrupted_at_the_deadline() {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        let sleeper = FnTool::new("sleep", "Sleeps far past the deadline", move |_| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(json!("done"))
            }
        })
        .shared();

        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options()
                .with_tool(sleeper)
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let response = dispatcher.execute("sleep", json!({})).await.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("timeout"));
        // The invocation was dropped, not left to finish in the background.
        assert!(!completed.load(Ordering::SeqCst));
        assert_eq!(dispatcher.get_metrics().failed_executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_does_not_delay_tool_start() {
        let invoked_after_ms = Arc::new(AtomicU64::new(u64::MAX));
        let seen = Arc::clone(&invoked_after_ms);
        let start = tokio::time::Instant::now();
        let tool = FnTool::new("echo", "Echo parameters back", move |args| {
            let seen = Arc::clone(&seen);
            async move {
                let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap();
                seen.store(elapsed, Ordering::SeqCst);
                Ok(args)
            }
        })
        .shared();

        let sink = Arc::new(RecordingSink {
            stall: true,
            ..Default::default()
        });
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options()
                .with_tool(tool)
                .with_backend(NotificationBackend::Event(sink.clone())),
        )
        .unwrap();

        let response = dispatcher.execute("echo", json!({"x": 1})).await.unwrap();
        assert!(response.success);
        // The tool started immediately; only the stalled announcement waited
        // out its delivery deadline.
        assert_eq!(invoked_after_ms.load(Ordering::SeqCst), 0);
        assert!(sink.events.lock().unwrap().is_empty());
        assert_eq!(dispatcher.get_metrics().websocket_events_sent, 0);
        assert_eq!(dispatcher.get_metrics().successful_executions, 1);
    }

    #[tokio::test]
    async fn emergency_shutdown_terminates_in_flight_executions() {
        let sleeper = FnTool::new("sleep", "Sleeps until cancelled", |_| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!("done"))
        })
        .shared();

        let dispatcher = Arc::new(
            DispatcherFactory::create_for_user(
                ctx("u1", "r1"),
                isolated_options().with_tool(sleeper),
            )
            .unwrap(),
        );

        let d = Arc::clone(&dispatcher);
        let task = tokio::spawn(async move { d.execute("sleep", json!({})).await.unwrap() });

        // Wait until the execution is actually in flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = dispatcher.emergency_shutdown_all_executions();
        assert_eq!(report.shutdown_executions, 1);
        assert_eq!(report.dispatcher_id, dispatcher.id());

        let response = task.await.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("emergency shutdown"));
        // Bookkeeping returns to baseline and the dispatcher stays usable.
        assert!(dispatcher.health_check().can_process_agents);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_terminal() {
        let registry = ActiveDispatchers::new();
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            DispatcherOptions::new()
                .with_registry_service(Arc::clone(&registry))
                .with_tool(echo_tool()),
        )
        .unwrap();
        assert_eq!(registry.count(), 1);

        dispatcher.cleanup();
        dispatcher.cleanup();
        dispatcher.cleanup();

        assert!(!dispatcher.is_active());
        assert!(dispatcher.tool_names().is_empty());
        assert_eq!(registry.count(), 0);

        let err = dispatcher.execute("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert!(err.to_string().contains("cleaned up"));
        let err = dispatcher.register_tool(echo_tool()).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
    }

    #[tokio::test]
    async fn strict_dispatch_translates_failures_into_errors() {
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options()
                .with_tool(boom_tool())
                .with_privileged_tool("delete_database"),
        )
        .unwrap();

        let err = dispatcher
            .dispatch_strict(DispatchRequest::new("boom", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
        assert!(err.to_string().contains("kaboom"));

        // Permission failures are re-raised, not folded into the response.
        let err = dispatcher
            .dispatch_strict(DispatchRequest::new("delete_database", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
    }

    #[tokio::test]
    async fn tolerant_dispatch_matches_execute() {
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options().with_tool(echo_tool()),
        )
        .unwrap();

        let response = dispatcher
            .dispatch(DispatchRequest::new("echo", json!({"x": 9})))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.result.unwrap()["x"], 9);
    }

    #[tokio::test]
    async fn admin_gate_denies_then_allows() {
        let admin_tool = FnTool::from_sync("delete_database", "Privileged", |_| {
            Ok(json!("dropped"))
        });

        let plain = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options()
                .with_tool(admin_tool.clone().shared())
                .with_privileged_tool("delete_database"),
        )
        .unwrap();

        let response = plain.execute("delete_database", json!({})).await.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("Admin permission"));
        assert_eq!(plain.get_metrics().permission_denials, 1);

        let admin_ctx = ctx("u2", "r2").with_metadata("role", "admin");
        let admin = DispatcherFactory::create_for_user(
            admin_ctx,
            isolated_options()
                .with_tool(admin_tool.shared())
                .with_privileged_tool("delete_database"),
        )
        .unwrap();

        let response = admin.execute("delete_database", json!({})).await.unwrap();
        assert!(response.success);
        assert_eq!(admin.get_metrics().permission_denials, 0);
    }

    #[tokio::test]
    async fn permission_metrics_survive_response_conversion() {
        let dispatcher = DispatcherFactory::create_for_user(
            ctx("u1", "r1"),
            isolated_options().with_privileged_tool("delete_database"),
        )
        .unwrap();

        let response = dispatcher
            .execute("delete_database", json!({}))
            .await
            .unwrap();
        assert!(!response.success);
        let snap = dispatcher.get_metrics();
        // Denial was recorded before the error became a response.
        assert_eq!(snap.permission_denials, 1);
        assert_eq!(snap.tools_executed, 0);
    }

    #[tokio::test]
    async fn health_check_is_healthy_by_default() {
        let dispatcher =
            DispatcherFactory::create_for_user(ctx("u1", "r1"), isolated_options()).unwrap();
        let health = dispatcher.health_check();
        assert_eq!(health.status, "healthy");
        assert!(health.issues.is_empty());
        assert!(health.can_process_agents);
    }
}
