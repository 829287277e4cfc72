//! Capability surfaces a component type implements.
//!
//! Every loadable object implements [`Component`]. Components that take
//! part in scheduling also expose an [`UpdateHandler`] through
//! [`Component::update_handler`]; the scheduler hands each such handler one
//! [`Transaction`] per attempt and acts on the returned [`TransactionAction`].

use crate::runtime::RuntimeContext;
use crate::transaction::Transaction;
use std::any::Any;

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A component instance owned by a graph node.
///
/// Lifecycle hooks default to no-ops so leaf components only override what
/// they need. `configure` runs before `self_check`, both before the node is
/// attached.
pub trait Component: Any + Send + std::fmt::Debug {
    /// Side-effecting setup, called once after construction.
    fn configure(&mut self, ctx: &RuntimeContext<'_>) {
        let _ = ctx;
    }

    /// Report structural problems. An empty result means the component may
    /// be activated.
    fn self_check(&self, ctx: &RuntimeContext<'_>) -> SelfCheckResult {
        let _ = ctx;
        SelfCheckResult::success()
    }

    /// The update capability, if this component is schedulable.
    fn update_handler(&mut self) -> Option<&mut dyn UpdateHandler> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ---------------------------------------------------------------------------
// Update capability
// ---------------------------------------------------------------------------

/// Handler response to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionAction {
    /// Apply the proposed changes and settle for this round.
    Commit,
    /// Discard the proposed changes and settle for this round.
    Rollback,
    /// Try again later in the same round.
    Delay,
}

/// Receives one transaction per scheduling attempt.
///
/// Implementations must return without waiting on other handlers.
pub trait UpdateHandler {
    fn update(&mut self, tx: &mut Transaction<'_>) -> TransactionAction;
}

// ---------------------------------------------------------------------------
// Self-check result
// ---------------------------------------------------------------------------

/// Errors reported by [`Component::self_check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfCheckResult {
    errors: Vec<String>,
}

impl SelfCheckResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_errors<I, S>(errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            errors: errors.into_iter().map(Into::into).collect(),
        }
    }

    pub fn push(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<String> {
        self.errors
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Builds component instances. Registered in the catalog either under a
/// name (referenced from metadata) or as a type's nested factory.
pub trait ComponentFactory: Send + Sync + std::fmt::Debug {
    fn create(&self, ctx: &RuntimeContext<'_>) -> Box<dyn Component>;
}

/// No-argument constructor registered for a type.
pub type Constructor = fn() -> Box<dyn Component>;

/// Factory wrapping a type's no-argument constructor.
#[derive(Debug, Clone, Copy)]
pub struct ConstructorFactory(pub Constructor);

impl ComponentFactory for ConstructorFactory {
    fn create(&self, _ctx: &RuntimeContext<'_>) -> Box<dyn Component> {
        (self.0)()
    }
}

/// Factory backed by a closure that receives the runtime context.
pub struct FnFactory<F>(pub F);

impl<F> std::fmt::Debug for FnFactory<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnFactory")
    }
}

impl<F> ComponentFactory for FnFactory<F>
where
    F: Fn(&RuntimeContext<'_>) -> Box<dyn Component> + Send + Sync,
{
    fn create(&self, ctx: &RuntimeContext<'_>) -> Box<dyn Component> {
        (self.0)(ctx)
    }
}
