//! Sanctioned construction paths for dispatchers.
//!
//! Every dispatcher is obtained through [`DispatcherFactory`]; the factory
//! validates the execution identity, wires the notification bridge and
//! permission validator, and registers the new dispatcher in an
//! [`ActiveDispatchers`] service. The service is injectable so tests run
//! against their own instance instead of the process-wide one.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::dispatcher::{DEFAULT_EXECUTION_TIMEOUT, DispatchStrategy, Dispatcher};
use crate::error::{Error, Result};
use crate::notify::{EventSink, NotificationBackend, NotificationBridge};
use crate::permission::{ActingUser, PermissionService, PermissionValidator};
use crate::registry::ToolRegistry;
use crate::tool::SharedTool;

/// Soft per-user limit on concurrently active dispatchers. Overflow is
/// logged, never fatal.
pub const DEFAULT_USER_DISPATCHER_CAP: usize = 10;

/// Record of one live dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherRecord {
    /// The user the dispatcher is scoped to.
    pub user_id: String,
    /// When the dispatcher was constructed.
    pub created_at: DateTime<Utc>,
}

/// Process-wide registry of active dispatchers.
///
/// The only legitimately shared state in the system: additions and removals
/// happen under one mutex so parallel construction never loses updates.
#[derive(Debug)]
pub struct ActiveDispatchers {
    inner: Mutex<HashMap<String, DispatcherRecord>>,
    user_cap: usize,
}

impl Default for ActiveDispatchers {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            user_cap: DEFAULT_USER_DISPATCHER_CAP,
        }
    }
}

impl ActiveDispatchers {
    /// Create a fresh registry service.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a registry with a custom soft per-user cap.
    #[must_use]
    pub fn with_user_cap(user_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            user_cap,
        })
    }

    /// The process-wide default registry.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ActiveDispatchers>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(Self::new))
    }

    pub(crate) fn add(&self, dispatcher_id: &str, user_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.insert(
            dispatcher_id.to_owned(),
            DispatcherRecord {
                user_id: user_id.to_owned(),
                created_at: Utc::now(),
            },
        );
        let for_user = inner
            .values()
            .filter(|record| record.user_id == user_id)
            .count();
        drop(inner);
        if for_user > self.user_cap {
            warn!(
                user = user_id,
                active = for_user,
                cap = self.user_cap,
                "user exceeds the soft dispatcher cap; construction proceeds"
            );
        }
    }

    /// Remove a dispatcher record. Returns whether it was present.
    pub(crate) fn remove(&self, dispatcher_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(dispatcher_id)
            .is_some()
    }

    /// Whether a dispatcher id is currently registered.
    #[must_use]
    pub fn contains(&self, dispatcher_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(dispatcher_id)
    }

    /// Number of active dispatchers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of active dispatchers for one user.
    #[must_use]
    pub fn count_for_user(&self, user_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|record| record.user_id == user_id)
            .count()
    }

    /// Drop every record. Intended for tests.
    pub fn reset(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Wiring options shared by the factory paths.
#[derive(Default)]
pub struct DispatcherOptions {
    tools: Vec<SharedTool>,
    backend: Option<NotificationBackend>,
    recovery: Option<Arc<dyn EventSink>>,
    privileged: Vec<String>,
    timeout: Option<Duration>,
    dispatchers: Option<Arc<ActiveDispatchers>>,
    permission_service: Option<Arc<dyn PermissionService>>,
    enable_admin: bool,
}

impl DispatcherOptions {
    /// Create empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register a tool.
    #[must_use]
    pub fn with_tool(mut self, tool: SharedTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Pre-register several tools.
    #[must_use]
    pub fn with_tools(mut self, tools: impl IntoIterator<Item = SharedTool>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Attach the notification backend.
    #[must_use]
    pub fn with_backend(mut self, backend: NotificationBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Attach the secondary recovery channel.
    #[must_use]
    pub fn with_recovery(mut self, recovery: Arc<dyn EventSink>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Mark a tool name as requiring admin standing.
    #[must_use]
    pub fn with_privileged_tool(mut self, name: impl Into<String>) -> Self {
        self.privileged.push(name.into());
        self
    }

    /// Override the execution deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use a specific active-dispatcher registry instead of the global one.
    #[must_use]
    pub fn with_registry_service(mut self, dispatchers: Arc<ActiveDispatchers>) -> Self {
        self.dispatchers = Some(dispatchers);
        self
    }

    /// Attach a delegated permission service.
    #[must_use]
    pub fn with_permission_service(mut self, service: Arc<dyn PermissionService>) -> Self {
        self.permission_service = Some(service);
        self
    }

    /// Grant the context's own user admin standing on this dispatcher.
    #[must_use]
    pub const fn enable_admin(mut self, enable: bool) -> Self {
        self.enable_admin = enable;
        self
    }
}

impl std::fmt::Debug for DispatcherOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherOptions")
            .field("tools", &self.tools.len())
            .field("has_backend", &self.backend.is_some())
            .field("has_recovery", &self.recovery.is_some())
            .field("privileged", &self.privileged)
            .field("timeout", &self.timeout)
            .field("enable_admin", &self.enable_admin)
            .finish_non_exhaustive()
    }
}

/// The sole sanctioned way to obtain a [`Dispatcher`].
#[derive(Debug, Clone, Copy)]
pub struct DispatcherFactory;

impl DispatcherFactory {
    /// Build a dispatcher scoped to one user request.
    ///
    /// # Errors
    /// [`Error::Authentication`] when the context's `user_id` is empty;
    /// [`Error::Invalid`] when pre-registered tools collide.
    pub fn create_for_user(
        context: ExecutionContext,
        options: DispatcherOptions,
    ) -> Result<Dispatcher> {
        if !context.has_valid_identity() {
            return Err(Error::authentication(
                "execution context with a valid user_id is required",
            ));
        }
        Self::build(context, options, DispatchStrategy::Standard, None)
    }

    /// Build a dispatcher wrapped in a guard that guarantees `cleanup()`
    /// on every exit path of the caller's scope.
    ///
    /// # Errors
    /// Same contract as [`DispatcherFactory::create_for_user`].
    pub fn create_scoped(
        context: ExecutionContext,
        options: DispatcherOptions,
    ) -> Result<ScopedDispatcher> {
        Ok(ScopedDispatcher {
            inner: Self::create_for_user(context, options)?,
        })
    }

    /// Convenience variant for request handlers with an intentionally
    /// looser validation contract, preserved as observed.
    ///
    /// # Errors
    /// [`Error::Invalid`] (not an authentication error) when the context's
    /// `user_id` is empty.
    pub fn create_for_request(
        context: ExecutionContext,
        options: DispatcherOptions,
    ) -> Result<Dispatcher> {
        if !context.has_valid_identity() {
            return Err(Error::invalid("execution context required"));
        }
        Self::build(context, options, DispatchStrategy::Standard, None)
    }

    /// Build an elevated dispatcher acting as `actor`, with an optional
    /// delegated permission service in the options.
    ///
    /// # Errors
    /// [`Error::Authentication`] when the context's `user_id` is empty.
    pub fn create_for_admin(
        context: ExecutionContext,
        actor: ActingUser,
        options: DispatcherOptions,
    ) -> Result<Dispatcher> {
        if !context.has_valid_identity() {
            return Err(Error::authentication(
                "execution context with a valid user_id is required",
            ));
        }
        Self::build(context, options, DispatchStrategy::Privileged, Some(actor))
    }

    /// Build a dispatcher bound to a synthetic shared context. Kept only
    /// for backward compatibility.
    ///
    /// # Errors
    /// [`Error::Invalid`] when two tools share a name.
    pub fn create_legacy_global(tools: Vec<SharedTool>) -> Result<Dispatcher> {
        warn!(
            "create_legacy_global is deprecated: a process-global dispatcher shares tools and \
             metrics across every user on this process; prefer create_for_user for per-request \
             isolation"
        );
        let context = ExecutionContext::new("global", "legacy", "legacy")
            .with_metadata("legacy_global", true);
        Self::build(
            context,
            DispatcherOptions::new().with_tools(tools),
            DispatchStrategy::Standard,
            None,
        )
    }

    fn build(
        context: ExecutionContext,
        options: DispatcherOptions,
        strategy: DispatchStrategy,
        actor: Option<ActingUser>,
    ) -> Result<Dispatcher> {
        let context = Arc::new(context);
        let id = format!(
            "{}_{}_{}",
            context.user_id(),
            context.run_id(),
            Uuid::new_v4().simple()
        );

        let registry = ToolRegistry::from_tools(options.tools)?;

        let mut validator = PermissionValidator::new(options.privileged);
        if let Some(actor) = actor {
            validator = validator.with_actor(actor);
        } else if options.enable_admin {
            validator = validator.with_actor(ActingUser::new(context.user_id(), true));
        }
        if let Some(service) = options.permission_service {
            validator = validator.with_delegate(service);
        }

        let bridge = options.backend.map(|backend| {
            NotificationBridge::new(backend, options.recovery, Arc::clone(&context), id.clone())
        });

        let dispatchers = options.dispatchers.unwrap_or_else(ActiveDispatchers::global);

        debug!(
            dispatcher = %id,
            user = context.user_id(),
            run = context.run_id(),
            ?strategy,
            "dispatcher constructed"
        );

        Ok(Dispatcher::assemble(
            id,
            context,
            registry,
            bridge,
            validator,
            strategy,
            options.timeout.unwrap_or(DEFAULT_EXECUTION_TIMEOUT),
            dispatchers,
        ))
    }
}

/// RAII wrapper guaranteeing [`Dispatcher::cleanup`] when the scope exits,
/// on every path.
#[derive(Debug)]
pub struct ScopedDispatcher {
    inner: Dispatcher,
}

impl Deref for ScopedDispatcher {
    type Target = Dispatcher;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Drop for ScopedDispatcher {
    fn drop(&mut self) {
        self.inner.cleanup();
    }
}
