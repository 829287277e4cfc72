//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::catalog::{Catalog, CatalogBuilder};
use crate::component::{Component, SelfCheckResult, TransactionAction, UpdateHandler};
use crate::id::{NodeId, TypeKey};
use crate::metadata::{Access, ComponentMeta, LinkType, TerminalRef};
use crate::round::SchedulerConfig;
use crate::runtime::{Runtime, RuntimeContext};
use crate::transaction::Transaction;
use std::any::Any;
use std::sync::Arc;

macro_rules! component_any {
    () => {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    };
}

// ===========================================================================
// Mock components
// ===========================================================================

/// No update capability.
#[derive(Debug, Default)]
pub struct Passive;

impl Component for Passive {
    component_any!();
}

/// Writes `value` to `terminal` and commits, every time it is scheduled.
#[derive(Debug)]
pub struct Driver {
    pub terminal: String,
    pub value: u64,
    pub updates: u32,
}

impl Driver {
    pub fn new(terminal: &str, value: u64) -> Self {
        Self {
            terminal: terminal.to_string(),
            value,
            updates: 0,
        }
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new("out", 0)
    }
}

impl UpdateHandler for Driver {
    fn update(&mut self, tx: &mut Transaction<'_>) -> TransactionAction {
        self.updates += 1;
        match tx.write(&self.terminal, self.value) {
            Ok(()) => TransactionAction::Commit,
            Err(_) => TransactionAction::Rollback,
        }
    }
}

impl Component for Driver {
    fn update_handler(&mut self) -> Option<&mut dyn UpdateHandler> {
        Some(self)
    }

    component_any!();
}

/// Records what it reads from `terminal` on every update. Setting
/// `broken` makes its self-check fail.
#[derive(Debug)]
pub struct Probe {
    pub terminal: String,
    pub seen: Vec<u64>,
    pub broken: bool,
}

impl Probe {
    pub fn new(terminal: &str) -> Self {
        Self {
            terminal: terminal.to_string(),
            seen: Vec::new(),
            broken: false,
        }
    }
}

impl Default for Probe {
    fn default() -> Self {
        Self::new("in")
    }
}

impl UpdateHandler for Probe {
    fn update(&mut self, tx: &mut Transaction<'_>) -> TransactionAction {
        match tx.read(&self.terminal) {
            Ok(v) => {
                self.seen.push(v);
                TransactionAction::Commit
            }
            Err(_) => TransactionAction::Rollback,
        }
    }
}

impl Component for Probe {
    fn self_check(&self, _ctx: &RuntimeContext<'_>) -> SelfCheckResult {
        if self.broken {
            SelfCheckResult::with_errors([format!("{} disconnected", self.terminal)])
        } else {
            SelfCheckResult::success()
        }
    }

    fn update_handler(&mut self) -> Option<&mut dyn UpdateHandler> {
        Some(self)
    }

    component_any!();
}

/// Always delays.
#[derive(Debug, Default)]
pub struct Staller {
    pub attempts: u32,
}

impl UpdateHandler for Staller {
    fn update(&mut self, _tx: &mut Transaction<'_>) -> TransactionAction {
        self.attempts += 1;
        TransactionAction::Delay
    }
}

impl Component for Staller {
    fn update_handler(&mut self) -> Option<&mut dyn UpdateHandler> {
        Some(self)
    }

    component_any!();
}

/// Proposes all-ones on `out`, then rolls back.
#[derive(Debug, Default)]
pub struct Rollbacker;

impl UpdateHandler for Rollbacker {
    fn update(&mut self, tx: &mut Transaction<'_>) -> TransactionAction {
        let _ = tx.write("out", u64::MAX);
        TransactionAction::Rollback
    }
}

impl Component for Rollbacker {
    fn update_handler(&mut self) -> Option<&mut dyn UpdateHandler> {
        Some(self)
    }

    component_any!();
}

/// Delays while `in` reads zero, then copies `in` to `out` and commits.
#[derive(Debug, Default)]
pub struct Waiter {
    pub delays: u32,
}

impl UpdateHandler for Waiter {
    fn update(&mut self, tx: &mut Transaction<'_>) -> TransactionAction {
        match tx.read("in") {
            Ok(0) => {
                self.delays += 1;
                TransactionAction::Delay
            }
            Ok(v) => match tx.write("out", v) {
                Ok(()) => TransactionAction::Commit,
                Err(_) => TransactionAction::Rollback,
            },
            Err(_) => TransactionAction::Rollback,
        }
    }
}

impl Component for Waiter {
    fn update_handler(&mut self) -> Option<&mut dyn UpdateHandler> {
        Some(self)
    }

    component_any!();
}

/// Self-check always fails.
#[derive(Debug, Default)]
pub struct FailingCheck;

impl Component for FailingCheck {
    fn self_check(&self, ctx: &RuntimeContext<'_>) -> SelfCheckResult {
        SelfCheckResult::with_errors([format!("{} is not wired", ctx.path())])
    }

    component_any!();
}

// ===========================================================================
// Catalog helpers
// ===========================================================================

/// Constructor for any defaultable component.
pub fn construct<T: Component + Default>() -> Box<dyn Component> {
    Box::new(T::default())
}

/// Register `type_name` with `meta` and `T`'s default constructor.
pub fn register<T: Component + Default>(builder: &mut CatalogBuilder, type_name: &str, meta: ComponentMeta) -> TypeKey {
    let key = builder.register_type(type_name, Some(meta));
    builder.set_constructor(key, construct::<T>);
    key
}

pub fn out_meta(width: u32) -> ComponentMeta {
    ComponentMeta::new().terminal("out", width, Access::External)
}

pub fn in_meta(width: u32) -> ComponentMeta {
    ComponentMeta::new().terminal("in", width, Access::External)
}

/// Register the 4-bit mock types:
/// `driver4`, `probe4`, `staller`, `rollbacker4`, `waiter4`, `passive`
/// and `failing`.
pub fn register_mocks(builder: &mut CatalogBuilder) {
    register::<Driver>(builder, "driver4", out_meta(4));
    register::<Probe>(builder, "probe4", in_meta(4));
    register::<Staller>(builder, "staller", ComponentMeta::new());
    register::<Rollbacker>(builder, "rollbacker4", out_meta(4));
    register::<Waiter>(
        builder,
        "waiter4",
        in_meta(4).terminal("out", 4, Access::External),
    );
    register::<Passive>(builder, "passive", ComponentMeta::new());
    register::<FailingCheck>(builder, "failing", ComponentMeta::new());
}

/// Mocks plus `pair`: a board hosting `a: driver4` bridged to `b: probe4`.
pub fn board_catalog() -> Catalog {
    let mut builder = CatalogBuilder::new();
    register_mocks(&mut builder);
    register::<Passive>(
        &mut builder,
        "pair",
        ComponentMeta::new()
            .named("pair")
            .host("a", "driver4")
            .host("b", "probe4")
            .interconnect(
                "a-b",
                TerminalRef::scoped("a", "out"),
                TerminalRef::scoped("b", "in"),
                LinkType::Bridge,
            ),
    );
    // Only reachable through a bug in builder validation.
    match builder.build() {
        Ok(catalog) => catalog,
        Err(e) => panic!("mock catalog is invalid: {e}"),
    }
}

/// A runtime with `pair` loaded as root.
pub fn pair_runtime(config: SchedulerConfig) -> Runtime {
    let mut rt = Runtime::new(Arc::new(board_catalog()), config);
    if let Err(e) = rt.load_root("pair") {
        panic!("pair failed to load: {e}");
    }
    rt
}

/// Set a [`Driver`]'s value and wake it for the next round.
pub fn set_driver(rt: &mut Runtime, node: NodeId, value: u64) {
    if let Some(driver) = rt.graph_mut().component_mut::<Driver>(node) {
        driver.value = value;
    }
    rt.wake(node);
}
