//! Permission validation for ordinary and privileged capabilities.
//!
//! The validator checks context presence strictly before privilege: a
//! missing or tampered identity is a security violation, not a denial.
//! Admin standing is resolved first-satisfied-wins through three
//! mechanisms: context metadata, the attached acting user, then a
//! delegated [`PermissionService`] call.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::metrics::DispatchMetrics;

/// Metadata key holding the caller's role.
const ROLE_KEY: &str = "role";
/// Metadata key holding the caller's permission list.
const PERMISSIONS_KEY: &str = "permissions";
/// The role/permission value granting privileged standing.
const ADMIN: &str = "admin";

/// Delegated permission collaborator, typically backed by an external
/// account store.
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Whether the given user holds admin standing.
    async fn is_admin(&self, user_id: &str) -> bool;
}

/// The user an admin dispatcher acts as.
#[derive(Debug, Clone)]
pub struct ActingUser {
    /// The acting user's identifier.
    pub id: String,
    /// Whether the acting user holds admin standing.
    pub is_admin: bool,
}

impl ActingUser {
    /// Create a new acting user.
    #[must_use]
    pub fn new(id: impl Into<String>, is_admin: bool) -> Self {
        Self {
            id: id.into(),
            is_admin,
        }
    }
}

/// Checks an execution identity against the privileged tool set.
#[derive(Default)]
pub struct PermissionValidator {
    privileged: HashSet<String>,
    actor: Option<ActingUser>,
    delegate: Option<Arc<dyn PermissionService>>,
}

impl PermissionValidator {
    /// Create a validator with the given privileged tool names.
    #[must_use]
    pub fn new(privileged: impl IntoIterator<Item = String>) -> Self {
        Self {
            privileged: privileged.into_iter().collect(),
            actor: None,
            delegate: None,
        }
    }

    /// Attach the acting user consulted for admin standing.
    #[must_use]
    pub fn with_actor(mut self, actor: ActingUser) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Attach a delegated permission service.
    #[must_use]
    pub fn with_delegate(mut self, delegate: Arc<dyn PermissionService>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Mark a tool name as privileged.
    pub fn mark_privileged(&mut self, name: impl Into<String>) {
        self.privileged.insert(name.into());
    }

    /// Whether a tool requires admin standing.
    #[must_use]
    pub fn is_privileged(&self, name: &str) -> bool {
        self.privileged.contains(name)
    }

    /// Validate an identity against a capability, recording the outcome.
    ///
    /// # Errors
    /// - [`Error::SecurityViolation`] when the context is absent or its
    ///   identity has been emptied out; checked before any privilege logic.
    /// - [`Error::Permission`] when the tool is privileged and no admin
    ///   standing can be established.
    pub async fn validate(
        &self,
        context: Option<&ExecutionContext>,
        tool_name: &str,
        metrics: &DispatchMetrics,
    ) -> Result<()> {
        let Some(context) = context.filter(|c| c.has_valid_identity()) else {
            metrics.record_security_violation();
            return Err(Error::security(
                "user context required for tool execution",
            ));
        };

        if self.is_privileged(tool_name) && !self.has_admin_standing(context).await {
            metrics.record_permission_denial();
            return Err(Error::permission(tool_name, context.user_id()));
        }

        metrics.record_permission_check();
        debug!(tool = tool_name, user = context.user_id(), "permission check passed");
        Ok(())
    }

    /// Resolve admin standing, first-satisfied-wins.
    async fn has_admin_standing(&self, context: &ExecutionContext) -> bool {
        if Self::context_grants_admin(context) {
            return true;
        }
        if self.actor.as_ref().is_some_and(|a| a.is_admin) {
            return true;
        }
        if let Some(delegate) = &self.delegate {
            return delegate.is_admin(context.user_id()).await;
        }
        false
    }

    fn context_grants_admin(context: &ExecutionContext) -> bool {
        if context
            .metadata_value(ROLE_KEY)
            .and_then(Value::as_str)
            .is_some_and(|role| role == ADMIN)
        {
            return true;
        }
        context
            .metadata_value(PERMISSIONS_KEY)
            .and_then(Value::as_array)
            .is_some_and(|perms| perms.iter().any(|p| p.as_str() == Some(ADMIN)))
    }
}

impl std::fmt::Debug for PermissionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionValidator")
            .field("privileged", &self.privileged)
            .field("actor", &self.actor)
            .field("has_delegate", &self.delegate.is_some())
            .finish()
    }
}
