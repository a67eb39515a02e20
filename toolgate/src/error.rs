//! Unified error types for the toolgate dispatch engine.
//!
//! Two channels are in play: typed errors (this module) are raised for
//! construction, lifecycle, and permission failures, while capability
//! outcomes travel inside [`DispatchResponse`](crate::dispatcher::DispatchResponse)
//! and never escape `execute()`.

/// Result type alias for toolgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the dispatch engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The execution identity is missing or invalid.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The identity lacks privilege for a capability.
    #[error("Admin permission required for tool '{tool}' (user '{user}')")]
    Permission {
        /// The privileged tool that was requested.
        tool: String,
        /// The user that lacks standing.
        user: String,
    },

    /// Detected tampering or a security bypass, distinct from an
    /// ordinary permission denial.
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// API misuse: duplicate registration, missing required argument.
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// Lifecycle misuse: operating on a cleaned-up dispatcher or
    /// constructing one outside the sanctioned factories.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Tool execution error.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an authentication error.
    #[must_use]
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a permission-denied error for a tool/user pair.
    #[must_use]
    pub fn permission(tool: impl Into<String>, user: impl Into<String>) -> Self {
        Self::Permission {
            tool: tool.into(),
            user: user.into(),
        }
    }

    /// Create a security violation error.
    #[must_use]
    pub fn security(msg: impl Into<String>) -> Self {
        Self::SecurityViolation(msg.into())
    }

    /// Create an invalid-argument error.
    #[must_use]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Create a lifecycle error.
    #[must_use]
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }
}

/// Error type for capability execution.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool with the given name is registered.
    #[error("Tool '{0}' not found")]
    NotFound(String),

    /// The arguments could not be deserialized into the tool's input type.
    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// The tool ran and failed.
    #[error("Tool execution failed: {0}")]
    Execution(String),

    /// The tool exceeded its execution deadline and was interrupted.
    #[error("Tool '{tool}' exceeded timeout envelope ({timeout_ms}ms)")]
    Timeout {
        /// Name of the interrupted tool.
        tool: String,
        /// The deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The invocation was force-terminated by an emergency shutdown.
    #[error("Tool '{0}' was cancelled by emergency shutdown")]
    Cancelled(String),
}

impl ToolError {
    /// Create an execution error.
    #[must_use]
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create an invalid arguments error.
    #[must_use]
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    /// Create a not found error.
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(tool: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            tool: tool.into(),
            timeout_ms,
        }
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(tool: impl Into<String>) -> Self {
        Self::Cancelled(tool.into())
    }
}

impl From<String> for ToolError {
    fn from(s: String) -> Self {
        Self::Execution(s)
    }
}

impl From<&str> for ToolError {
    fn from(s: &str) -> Self {
        Self::Execution(s.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    mod error {
        use super::*;

        #[test]
        fn authentication_creates_error() {
            let err = Error::authentication("user context required");
            assert!(matches!(err, Error::Authentication(_)));
            assert!(err.to_string().contains("user context required"));
        }

        #[test]
        fn permission_names_tool_and_user() {
            let err = Error::permission("delete_database", "u1");
            let msg = err.to_string();
            assert!(msg.contains("delete_database"));
            assert!(msg.contains("u1"));
            assert!(msg.contains("Admin permission"));
        }

        #[test]
        fn security_is_distinct_from_permission() {
            let err = Error::security("missing execution context");
            assert!(matches!(err, Error::SecurityViolation(_)));
            assert!(!matches!(err, Error::Permission { .. }));
        }

        #[test]
        fn from_tool_error() {
            let tool_err = ToolError::not_found("my_tool");
            let err: Error = tool_err.into();
            assert!(matches!(err, Error::Tool(_)));
        }

        #[test]
        fn from_json_error() {
            let json_err = serde_json::from_str::<i32>("invalid").unwrap_err();
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }

        #[test]
        fn display_variants() {
            assert!(Error::invalid("msg").to_string().contains("Invalid"));
            assert!(
                Error::lifecycle("d1 has been cleaned up")
                    .to_string()
                    .contains("cleaned up")
            );
        }
    }

    mod tool_error {
        use super::*;

        #[test]
        fn execution_creates_error() {
            let err = ToolError::execution("failed to run");
            assert!(matches!(err, ToolError::Execution(_)));
        }

        #[test]
        fn not_found_names_tool() {
            let err = ToolError::not_found("echo");
            assert!(err.to_string().contains("not found"));
            assert!(err.to_string().contains("echo"));
        }

        #[test]
        fn timeout_names_tool_and_deadline() {
            let err = ToolError::timeout("slow", 50);
            let msg = err.to_string();
            assert!(msg.contains("slow"));
            assert!(msg.contains("50ms"));
        }

        #[test]
        fn from_string() {
            let err: ToolError = "kaboom".into();
            assert!(matches!(err, ToolError::Execution(_)));
            assert!(err.to_string().contains("kaboom"));
        }
    }
}
