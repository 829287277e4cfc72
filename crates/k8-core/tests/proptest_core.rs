//! Property-based tests for the K8 core runtime.
//!
//! Uses proptest to generate random stimulus, mask and load/unload
//! sequences, then verify structural invariants hold.

use k8_core::bus::{BusMask, low_bits};
use k8_core::catalog::CatalogBuilder;
use k8_core::id::NodeId;
use k8_core::metadata::{Access, ComponentMeta};
use k8_core::round::{CancelToken, SchedulerConfig};
use k8_core::runtime::Runtime;
use k8_core::test_utils::*;
use proptest::prelude::*;
use std::sync::Arc;

// ===========================================================================
// Generators
// ===========================================================================

/// A root with a passive 16-bit `bus` terminal, plus the mocks.
fn bus_runtime(config: SchedulerConfig) -> Runtime {
    let mut builder = CatalogBuilder::new();
    register_mocks(&mut builder);
    register::<Passive>(
        &mut builder,
        "bus16",
        ComponentMeta::new().terminal("bus", 16, Access::External),
    );
    let mut rt = Runtime::new(Arc::new(builder.build().unwrap()), config);
    rt.load_root("bus16").unwrap();
    rt
}

fn arb_mask(width: u32) -> impl Strategy<Value = BusMask> {
    (0..width).prop_flat_map(move |offset| (Just(offset), 1..=width - offset)).prop_map(|(o, c)| BusMask::new(o, c))
}

/// Operations on a `bus16` root.
#[derive(Debug, Clone)]
enum Op {
    Drive(BusMask, u64),
    Load(u8),
    Unload(usize),
    Step,
}

fn arb_ops(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            (arb_mask(16), any::<u64>()).prop_map(|(m, v)| Op::Drive(m, v)),
            (0..3u8).prop_map(Op::Load),
            (0..16usize).prop_map(Op::Unload),
            Just(Op::Step),
        ],
        1..=max_ops,
    )
}

/// Apply `ops`, tracking the children loaded by this call. Round failures
/// are impossible with these component types.
fn apply(rt: &mut Runtime, ops: &[Op]) -> Vec<NodeId> {
    let root = rt.graph().root().unwrap();
    let bus = rt.terminal(root, "bus").unwrap();
    let mut children: Vec<NodeId> = Vec::new();
    for op in ops {
        match op {
            Op::Drive(mask, value) => rt.drive(bus, Some(*mask), *value).unwrap(),
            Op::Load(kind) => {
                let type_name = ["driver4", "probe4", "passive"][*kind as usize];
                let mut n = 0;
                while rt.graph().find_child(root, &format!("c{n}")).is_some() {
                    n += 1;
                }
                let name = format!("c{n}");
                children.push(rt.load_named(type_name, Some(&name), Some(root)).unwrap());
            }
            Op::Unload(i) => {
                if !children.is_empty() {
                    let node = children.remove(i % children.len());
                    rt.unload(node).unwrap();
                }
            }
            Op::Step => {
                rt.step().unwrap();
            }
        }
    }
    children
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// A bridged reader sees exactly what the driver committed.
    #[test]
    fn bridge_carries_any_value(value in 0..16u64) {
        let mut rt = pair_runtime(SchedulerConfig::default());
        let a = rt.graph().resolve_path("~/a").unwrap();
        set_driver(&mut rt, a, value);
        rt.step().unwrap();
        let b_in = rt.terminal_at("~/b", "in").unwrap();
        prop_assert_eq!(rt.read(b_in), Some(value));
    }

    /// A masked drive changes exactly the selected bits.
    #[test]
    fn masked_drive_touches_only_selected_bits(
        before in 0..=0xFFFFu64,
        mask in arb_mask(16),
        value in any::<u64>(),
    ) {
        let mut rt = bus_runtime(SchedulerConfig::default());
        let bus = rt.terminal_at("~", "bus").unwrap();
        rt.drive(bus, None, before).unwrap();
        rt.step().unwrap();

        rt.drive(bus, Some(mask), value).unwrap();
        rt.step().unwrap();

        let expected = mask.insert(before, value);
        prop_assert_eq!(rt.read(bus), Some(expected));
        prop_assert_eq!(rt.read_masked(bus, mask), Some(value & low_bits(mask.count)));
    }

    /// A stalled round leaves the committed state exactly as it was.
    #[test]
    fn failed_round_is_atomic(
        seed in arb_ops(10),
        stimulus in proptest::collection::vec((arb_mask(16), any::<u64>()), 1..5),
    ) {
        let mut rt = bus_runtime(SchedulerConfig { max_attempts_per_handler: 3, parallel: false });
        apply(&mut rt, &seed);
        rt.run(16, &CancelToken::new()).unwrap();

        let root = rt.graph().root().unwrap();
        rt.load_named("staller", Some("stall"), Some(root)).unwrap();
        let bus = rt.terminal(root, "bus").unwrap();
        for (mask, value) in &stimulus {
            rt.drive(bus, Some(*mask), *value).unwrap();
        }
        let hash = rt.state_hash();
        let round = rt.round();

        prop_assert!(rt.step().is_err());
        prop_assert_eq!(rt.state_hash(), hash);
        prop_assert_eq!(rt.round(), round);
    }

    /// Same operations, same state.
    #[test]
    fn replay_is_deterministic(ops in arb_ops(30)) {
        let mut a = bus_runtime(SchedulerConfig::default());
        let mut b = bus_runtime(SchedulerConfig::default());
        apply(&mut a, &ops);
        apply(&mut b, &ops);
        prop_assert_eq!(a.state_hash(), b.state_hash());
        prop_assert_eq!(a.round(), b.round());
    }

    /// Registry, graph and terminal bank stay in step through loads and
    /// unloads.
    #[test]
    fn bookkeeping_is_consistent(ops in arb_ops(40)) {
        let mut rt = bus_runtime(SchedulerConfig::default());
        let children = apply(&mut rt, &ops);

        prop_assert_eq!(rt.graph().node_count(), children.len() + 1);
        prop_assert_eq!(rt.registry().len(), rt.graph().node_count());
        let owned: usize = rt.graph().nodes().map(|(n, _)| rt.terminals().owned_by(n).len()).sum();
        prop_assert_eq!(rt.terminals().len(), owned);
        for node in children {
            let path = rt.graph().path(node).unwrap().to_string();
            prop_assert_eq!(rt.graph().resolve_path(&path), Some(node));
        }
    }

    /// Transaction ids never repeat or go backwards across rounds.
    #[test]
    fn transaction_ids_are_monotonic(ops in arb_ops(30)) {
        let mut rt = bus_runtime(SchedulerConfig::default());
        let root = rt.graph().root().unwrap();
        rt.load("driver4", Some(root)).unwrap();
        let mut last = None;
        for chunk in ops.chunks(4) {
            apply(&mut rt, chunk);
            let before = rt.scheduler().next_transaction();
            let report = rt.step().unwrap();
            if let Some(first) = report.first_transaction {
                prop_assert!(first >= before);
                if let Some(prev) = last {
                    prop_assert!(first > prev);
                }
            }
            if report.last_transaction.is_some() {
                last = report.last_transaction;
            }
        }
    }
}
