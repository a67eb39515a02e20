//! Tool trait and adapters for dispatchable capabilities.
//!
//! Tools are the named units of work a dispatcher can invoke for an agent.
//! The typed [`Tool`] trait is what implementors write; the object-safe
//! [`DynTool`] wrapper is what the registry stores. [`FnTool`] adapts plain
//! closures — async or sync — so callers can register capabilities without
//! defining a struct per tool.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// A type alias for `Result<T, ToolError>`.
pub type ToolResult<T> = Result<T, ToolError>;

/// Descriptive metadata for a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name of the tool (snake_case, unique per registry).
    pub name: String,
    /// Description of what the tool does.
    pub description: String,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// The core trait for capabilities the dispatcher can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static name of the tool.
    const NAME: &'static str;

    /// Arguments type for the tool.
    type Args: for<'de> Deserialize<'de> + Send;

    /// Output type of the tool.
    type Output: Serialize + Send;

    /// Error type for tool execution.
    type Error: Into<ToolError> + Send;

    /// Get the name of the tool.
    fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Get the description of the tool.
    fn description(&self) -> String;

    /// Execute the tool with the given arguments.
    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error>;

    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description())
    }

    /// Call the tool with JSON arguments and return JSON output.
    async fn call_json(&self, args: Value) -> ToolResult<Value>
    where
        Self::Output: 'static,
    {
        // Accept both a JSON object and a string-encoded object.
        let typed_args: Self::Args = match &args {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| ToolError::invalid_args(e.to_string()))?
            }
            _ => serde_json::from_value(args)
                .map_err(|e| ToolError::invalid_args(e.to_string()))?,
        };

        let result = self.call(typed_args).await.map_err(Into::into)?;
        serde_json::to_value(result).map_err(|e| ToolError::execution(e.to_string()))
    }
}

/// A shared dynamic tool, cloned out of the registry per invocation so no
/// lock is held across an await point.
pub type SharedTool = Arc<dyn DynTool>;

/// Object-safe version of the [`Tool`] trait for dynamic dispatch.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// Get the name of the tool.
    fn name(&self) -> &str;

    /// Get the description of the tool.
    fn description(&self) -> String;

    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Call the tool with JSON arguments.
    async fn call_json(&self, args: Value) -> ToolResult<Value>;
}

#[async_trait]
impl<T: Tool + 'static> DynTool for T
where
    T::Output: 'static,
{
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn description(&self) -> String {
        Tool::description(self)
    }

    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    async fn call_json(&self, args: Value) -> ToolResult<Value> {
        Tool::call_json(self, args).await
    }
}

type AsyncHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, ToolResult<Value>> + Send + Sync + 'static>;

/// A tool built from a closure over JSON values.
///
/// Covers both invocation shapes: [`FnTool::new`] wraps an async closure,
/// [`FnTool::from_sync`] adapts a plain function.
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    handler: AsyncHandler,
}

impl FnTool {
    /// Create a tool from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            handler: Arc::new(move |args| Box::pin(f(args))),
        }
    }

    /// Create a tool from a synchronous function.
    pub fn from_sync<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> ToolResult<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, description, move |args| {
            let f = Arc::clone(&f);
            async move { f(args) }
        })
    }

    /// Box this tool into a [`SharedTool`] for registration.
    #[must_use]
    pub fn shared(self) -> SharedTool {
        Arc::new(self)
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DynTool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name.clone(), self.description.clone())
    }

    async fn call_json(&self, args: Value) -> ToolResult<Value> {
        (self.handler)(args).await
    }
}
