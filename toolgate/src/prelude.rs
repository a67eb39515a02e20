//! Prelude module for convenient imports.
//!
//! This module re-exports commonly used types and traits for easy access.
//!
//! # Usage
//!
//! ```rust,ignore
//! use toolgate::prelude::*;
//! ```

pub use crate::context::ExecutionContext;
pub use crate::dispatcher::{
    DispatchRequest, DispatchResponse, DispatchStrategy, Dispatcher, HealthReport, ShutdownReport,
};
pub use crate::error::{Error, Result, ToolError};
pub use crate::factory::{
    ActiveDispatchers, DispatcherFactory, DispatcherOptions, ScopedDispatcher,
};
pub use crate::metrics::MetricsSnapshot;
pub use crate::notify::{
    EventSink, LifecycleSink, NotificationBackend, NotificationBridge, SinkError, SinkResult,
    ToolOutcome,
};
pub use crate::permission::{ActingUser, PermissionService, PermissionValidator};
pub use crate::registry::ToolRegistry;
pub use crate::tool::{DynTool, FnTool, SharedTool, Tool, ToolDefinition, ToolResult};
