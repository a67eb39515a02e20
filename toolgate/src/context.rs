//! Execution identity for request-scoped dispatch.
//!
//! An [`ExecutionContext`] carries the user/run/thread triple (plus arbitrary
//! session metadata) that scopes a dispatcher to one request. The context is
//! owned by the caller and shared with its dispatcher behind an `Arc`; the
//! engine reads it and never mutates it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-request identity bundle.
///
/// # Example
///
/// ```rust,ignore
/// use toolgate::ExecutionContext;
///
/// let ctx = ExecutionContext::new("u1", "r1", "t1")
///     .with_metadata("role", "admin");
/// assert_eq!(ctx.user_id(), "u1");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// The user this request runs on behalf of. Required, non-empty.
    user_id: String,
    /// The agent run identifier.
    run_id: String,
    /// The conversation thread identifier.
    thread_id: String,
    /// Session metadata consulted by the permission validator
    /// (e.g. `role`, `permissions`).
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Create a new execution context for a user/run/thread triple.
    ///
    /// Identity validation happens at the factory boundary, not here: an
    /// empty `user_id` is representable but every sanctioned construction
    /// path rejects it before a dispatcher exists.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        run_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            run_id: run_id.into(),
            thread_id: thread_id.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a session metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the whole metadata map.
    #[must_use]
    pub fn with_metadata_map(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The user identifier.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The thread identifier.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// The session metadata map.
    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Look up a metadata entry.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Whether the identity is usable: a non-empty, non-whitespace user id.
    #[must_use]
    pub fn has_valid_identity(&self) -> bool {
        !self.user_id.trim().is_empty()
    }
}
