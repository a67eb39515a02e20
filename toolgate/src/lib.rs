//! Toolgate — a request-scoped tool dispatch engine for AI agents.
//!
//! A [`Dispatcher`] lets an agent invoke named tool capabilities on behalf
//! of exactly one user/session, with permission enforcement, best-effort
//! real-time progress notification, bounded-time execution with
//! cancellation, and in-memory metrics. Dispatchers are obtained only
//! through [`DispatcherFactory`] so no two users ever share mutable state.
//!
//! ```rust,ignore
//! use serde_json::json;
//! use toolgate::{DispatcherFactory, DispatcherOptions, ExecutionContext, FnTool};
//!
//! let context = ExecutionContext::new("u1", "r1", "t1");
//! let dispatcher = DispatcherFactory::create_for_user(
//!     context,
//!     DispatcherOptions::new()
//!         .with_tool(FnTool::new("echo", "Echo back", |args| async move { Ok(args) }).shared()),
//! )?;
//!
//! let response = dispatcher.execute("echo", json!({"x": "hello"})).await?;
//! assert!(response.success);
//! dispatcher.cleanup();
//! ```

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod notify;
pub mod permission;
pub mod prelude;
pub mod registry;
pub mod tool;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::ExecutionContext;
pub use dispatcher::{
    DEFAULT_EXECUTION_TIMEOUT, DispatchRequest, DispatchResponse, DispatchStrategy, Dispatcher,
    HealthReport, ResponseMetadata, ShutdownReport,
};
pub use error::{Error, Result, ToolError};
pub use factory::{
    ActiveDispatchers, DispatcherFactory, DispatcherOptions, ScopedDispatcher,
};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use notify::{
    EventSink, LifecycleSink, NotificationBackend, NotificationBridge, SinkError, SinkResult,
    ToolOutcome,
};
pub use permission::{ActingUser, PermissionService, PermissionValidator};
pub use registry::ToolRegistry;
pub use tool::{DynTool, FnTool, SharedTool, Tool, ToolDefinition, ToolResult};
