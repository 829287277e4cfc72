//! Adversarial input tests for the K8 runtime.
//!
//! Tests edge cases that should either return errors or be handled gracefully
//! without panics.

use k8_core::bus::BusMask;
use k8_core::catalog::{CatalogBuilder, CatalogError};
use k8_core::graph::GraphError;
use k8_core::link::LinkError;
use k8_core::loader::LoadError;
use k8_core::metadata::{Access, ComponentMeta, LinkType, SignalDecl, TerminalRef};
use k8_core::round::{CancelToken, RunStop, SchedulerConfig};
use k8_core::runtime::Runtime;
use k8_core::scheduler::RoundError;
use k8_core::test_utils::*;
use std::sync::Arc;

fn runtime_with(extra: impl FnOnce(&mut CatalogBuilder)) -> Runtime {
    let mut builder = CatalogBuilder::new();
    register_mocks(&mut builder);
    extra(&mut builder);
    Runtime::new(Arc::new(builder.build().unwrap()), SchedulerConfig::default())
}

/// Stepping an empty runtime is a no-op round.
#[test]
fn step_with_nothing_loaded() {
    let mut rt = runtime_with(|_| {});
    let report = rt.step().unwrap();
    assert_eq!(report.scheduled, 0);
    assert!(report.first_transaction.is_none());
    assert!(!rt.has_pending_work());
}

/// Unknown and abstract types are configuration errors.
#[test]
fn unknown_or_abstract_type() {
    let mut rt = runtime_with(|b| {
        b.register_type("abstract", None);
    });
    assert!(matches!(rt.load_root("nope"), Err(LoadError::Configuration { .. })));
    assert!(matches!(rt.load_root("abstract"), Err(LoadError::Configuration { .. })));
}

/// Metadata without any way to build an instance.
#[test]
fn type_without_constructor() {
    let mut rt = runtime_with(|b| {
        b.register_type("ghost", Some(ComponentMeta::new()));
    });
    assert!(matches!(
        rt.load_root("ghost"),
        Err(LoadError::NotConstructable { type_name }) if type_name == "ghost"
    ));
}

/// A named factory that was never registered is caught when the catalog
/// is frozen.
#[test]
fn dangling_factory_reference() {
    let mut builder = CatalogBuilder::new();
    builder.register_type("orphan", Some(ComponentMeta::new().factory("missing")));
    assert!(matches!(builder.build(), Err(CatalogError::UnknownFactory { .. })));
}

/// Zero-width and over-wide terminals.
#[test]
fn bad_terminal_widths() {
    let mut rt = runtime_with(|b| {
        register::<Passive>(b, "empty", ComponentMeta::new().terminal("x", 0, Access::External));
        register::<Passive>(b, "huge", ComponentMeta::new().terminal("x", 65, Access::External));
    });
    assert!(matches!(rt.load_root("empty"), Err(LoadError::Configuration { .. })));
    assert!(matches!(rt.load_root("huge"), Err(LoadError::Configuration { .. })));
    assert_eq!(rt.graph().node_count(), 0);
}

/// The full 64-bit width is usable.
#[test]
fn widest_terminal_round_trips() {
    let mut rt = runtime_with(|b| {
        register::<Passive>(b, "wide", ComponentMeta::new().terminal("x", 64, Access::External));
    });
    rt.load_root("wide").unwrap();
    let x = rt.terminal_at("~", "x").unwrap();
    rt.drive(x, None, u64::MAX).unwrap();
    rt.step().unwrap();
    assert_eq!(rt.read(x), Some(u64::MAX));
}

/// Signal selecting a bit past the end of its bus.
#[test]
fn signal_select_out_of_range() {
    let mut rt = runtime_with(|b| {
        register::<Passive>(
            b,
            "bad-signal",
            ComponentMeta::new()
                .terminal("status", 4, Access::External)
                .signal(SignalDecl::on_bus("ready", "status", 4, Access::External)),
        );
    });
    assert!(matches!(rt.load_root("bad-signal"), Err(LoadError::Configuration { .. })));
}

/// Interconnect naming a scope that is not hosted.
#[test]
fn unresolved_scope() {
    let mut rt = runtime_with(|b| {
        register::<Passive>(
            b,
            "lost",
            ComponentMeta::new().host("a", "driver4").interconnect(
                "a-x",
                TerminalRef::scoped("a", "out"),
                TerminalRef::scoped("x", "in"),
                LinkType::Bridge,
            ),
        );
    });
    assert!(matches!(
        rt.load_root("lost"),
        Err(LoadError::Link(LinkError::UnresolvedScope { scope, .. })) if scope == "x"
    ));
}

/// Private terminals of a hosted child are not bindable.
#[test]
fn private_terminal_of_child() {
    let mut rt = runtime_with(|b| {
        register::<Passive>(b, "secret", ComponentMeta::new().terminal("key", 4, Access::Private));
        register::<Passive>(
            b,
            "snoop",
            ComponentMeta::new()
                .host("s", "secret")
                .host("p", "probe4")
                .interconnect(
                    "s-p",
                    TerminalRef::scoped("s", "key"),
                    TerminalRef::scoped("p", "in"),
                    LinkType::Bridge,
                ),
        );
    });
    assert!(matches!(
        rt.load_root("snoop"),
        Err(LoadError::Link(LinkError::AccessDenied { depth: 1, .. }))
    ));
}

/// Select past the terminal width.
#[test]
fn interconnect_select_out_of_range() {
    let mut rt = runtime_with(|b| {
        register::<Passive>(
            b,
            "overreach",
            ComponentMeta::new()
                .host("a", "driver4")
                .host("b", "probe4")
                .interconnect(
                    "a-b",
                    TerminalRef::scoped("a", "out").select(2, 4),
                    TerminalRef::scoped("b", "in"),
                    LinkType::Bridge,
                ),
        );
    });
    assert!(matches!(rt.load_root("overreach"), Err(LoadError::Link(LinkError::Range { .. }))));
}

/// Driving outside a terminal's width, or a terminal that is gone.
#[test]
fn bad_stimulus() {
    let mut rt = pair_runtime(SchedulerConfig::default());
    let b_in = rt.terminal_at("~/b", "in").unwrap();
    assert!(matches!(
        rt.drive(b_in, Some(BusMask::new(3, 2)), 1),
        Err(RoundError::Range { width: 4, .. })
    ));
    assert!(matches!(
        rt.drive(b_in, Some(BusMask::new(0, 0)), 1),
        Err(RoundError::Range { .. })
    ));

    let b = rt.graph().resolve_path("~/b").unwrap();
    rt.unload(b).unwrap();
    assert!(matches!(rt.drive(b_in, None, 1), Err(RoundError::UnknownTerminal(_))));
}

/// The root cannot be unloaded; unknown nodes are reported.
#[test]
fn unload_root_and_stale_node() {
    let mut rt = pair_runtime(SchedulerConfig::default());
    let root = rt.graph().root().unwrap();
    assert!(matches!(rt.unload(root), Err(GraphError::CannotDetachRoot)));

    let a = rt.graph().resolve_path("~/a").unwrap();
    rt.unload(a).unwrap();
    assert!(matches!(rt.unload(a), Err(GraphError::NodeNotFound(_))));
    assert!(rt.terminal(a, "out").is_none());
}

/// Loading under a node that was unloaded.
#[test]
fn load_under_stale_parent() {
    let mut rt = pair_runtime(SchedulerConfig::default());
    let a = rt.graph().resolve_path("~/a").unwrap();
    rt.unload(a).unwrap();
    assert!(matches!(
        rt.load("probe4", Some(a)),
        Err(LoadError::Graph(GraphError::NodeNotFound(_)))
    ));
}

/// A name freed by unload can be reused by another type.
#[test]
fn reuse_name_after_unload() {
    let mut rt = pair_runtime(SchedulerConfig::default());
    let root = rt.graph().root().unwrap();
    let b = rt.graph().resolve_path("~/b").unwrap();
    rt.unload(b).unwrap();
    let again = rt.load_named("driver4", Some("b"), Some(root)).unwrap();
    assert_eq!(rt.graph().path(again), Some("~/b"));
}

/// Two mirrors pointing at each other terminate in one round.
#[test]
fn mirror_cycle_terminates() {
    let mut rt = runtime_with(|b| {
        register::<Passive>(
            b,
            "loop2",
            ComponentMeta::new()
                .host("x", "probe4")
                .host("y", "probe4")
                .interconnect(
                    "x-y",
                    TerminalRef::scoped("x", "in"),
                    TerminalRef::scoped("y", "in"),
                    LinkType::Mirror,
                )
                .interconnect(
                    "y-x",
                    TerminalRef::scoped("y", "in"),
                    TerminalRef::scoped("x", "in"),
                    LinkType::Mirror,
                ),
        );
    });
    rt.load_root("loop2").unwrap();
    let x_in = rt.terminal_at("~/x", "in").unwrap();
    let y_in = rt.terminal_at("~/y", "in").unwrap();
    rt.drive(x_in, None, 0b0101).unwrap();
    let report = rt.step().unwrap();
    assert!(report.mirrors_fired <= 2);
    assert_eq!(rt.read(y_in), Some(0b0101));

    let summary = rt.run(10, &CancelToken::new()).unwrap();
    assert_eq!(summary.stop, RunStop::Quiescent);
}

/// Bridging a terminal's low half onto its high half.
#[test]
fn bridge_terminal_to_itself() {
    let mut rt = runtime_with(|_| {});
    rt.load_root("probe4").unwrap();
    let t = rt.terminal_at("~", "in").unwrap();
    rt.link("fold", (t, Some(BusMask::new(0, 2))), (t, Some(BusMask::new(2, 2))), LinkType::Bridge)
        .unwrap();
    rt.drive(t, Some(BusMask::new(0, 2)), 0b01).unwrap();
    rt.step().unwrap();
    assert_eq!(rt.read(t), Some(0b0101));
}

/// A zero attempt budget still evaluates every handler once.
#[test]
fn zero_attempt_budget() {
    let mut rt = pair_runtime(SchedulerConfig {
        max_attempts_per_handler: 0,
        parallel: false,
    });
    let report = rt.step().unwrap();
    assert_eq!(report.attempts, 2);
}

/// A pre-cancelled token runs nothing; zero rounds hits the limit.
#[test]
fn cancelled_and_zero_round_runs() {
    let mut rt = pair_runtime(SchedulerConfig::default());
    let cancel = CancelToken::new();
    cancel.cancel();
    let summary = rt.run(10, &cancel).unwrap();
    assert_eq!(summary.stop, RunStop::Cancelled);
    assert!(summary.rounds.is_empty());

    let summary = rt.run(0, &CancelToken::new()).unwrap();
    assert_eq!(summary.stop, RunStop::RoundLimit);
    assert!(summary.rounds.is_empty());
}

/// Handlers writing out of range roll back instead of panicking.
#[test]
fn rollbacker_on_narrow_terminal() {
    let mut rt = runtime_with(|b| {
        register::<Rollbacker>(b, "narrow", out_meta(1));
    });
    rt.load_root("narrow").unwrap();
    let report = rt.step().unwrap();
    assert_eq!(report.rolled_back.len(), 1);
}

/// Repeated failed rounds do not leak stimulus or advance the round.
#[test]
fn repeated_failures_are_stable() {
    let mut rt = runtime_with(|_| {});
    rt.load_root("staller").unwrap();
    for _ in 0..5 {
        assert!(rt.step().is_err());
    }
    assert_eq!(rt.round().0, 0);
    assert_eq!(rt.scheduler().next_transaction().0, 5 * 8);
}
