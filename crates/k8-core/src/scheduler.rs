//! Transactional round scheduler.
//!
//! A round evaluates every schedulable handler whose inputs changed since
//! the last committed round, plus handlers that were never evaluated or
//! were explicitly woken. Handlers run in graph preorder against a private
//! overlay of the committed state: commits land in the overlay and are seen
//! by later handlers in the same round, rollbacks are discarded, delays go
//! to the back of the queue. Nothing reaches committed storage until every
//! handler has settled, so a round that fails to converge leaves the
//! baseline untouched.
//!
//! After the overlay is applied, latched signals whose reset reads high are
//! cleared and Mirror links fire once each, chained in establishment order.
//!
//! With the `parallel` feature and [`SchedulerConfig::parallel`] set,
//! handlers are split into groups that share no net and no Mirror link,
//! and groups are evaluated on the rayon pool. Each handler has its own
//! attempt budget, so the outcome of a group never depends on other groups.

use crate::bus::BusMask;
use crate::component::{Component, TransactionAction};
use crate::dirty::DirtyTracker;
use crate::graph::ComponentGraph;
use crate::id::{NetId, NodeId, RoundId, TerminalId, TransactionId};
use crate::link::Linker;
use crate::round::{RoundReport, RoundState, SchedulerConfig};
use crate::terminal::TerminalBank;
use crate::transaction::{RoundView, Transaction};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Errors surfaced by round stepping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoundError {
    #[error("{round} did not converge: {} still delaying after {attempts} attempt(s)", stalled.join(", "))]
    NonConvergence {
        round: RoundId,
        /// Paths of the handlers that exhausted their attempts.
        stalled: Vec<String>,
        attempts: u32,
    },
    #[error("terminal not found: {0:?}")]
    UnknownTerminal(TerminalId),
    #[error("stimulus mask {mask} exceeds {terminal} (width {width})")]
    Range {
        terminal: String,
        mask: BusMask,
        width: u32,
    },
}

/// Externally driven value, applied at the start of the next round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stimulus {
    terminal: TerminalId,
    mask: BusMask,
    value: u64,
}

/// One scheduled handler handed to a worker: its position in the round's
/// schedule, its node, and its instance.
type Member<'a> = (usize, NodeId, &'a mut dyn Component);

#[derive(Debug, Default)]
struct GroupOutcome {
    committed: Vec<usize>,
    rolled_back: Vec<usize>,
    stalled: Vec<usize>,
    attempts: usize,
    delays: usize,
    writes: BTreeMap<NetId, bool>,
    first_tx: Option<u64>,
    last_tx: Option<u64>,
}

/// Round protocol state: counters, pending work and stimulus.
#[derive(Debug, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
    state: RoundState,
    dirty: DirtyTracker,
    evaluated: HashSet<NodeId>,
    stimulus: Vec<Stimulus>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Id the next round will run under.
    pub fn round(&self) -> RoundId {
        self.state.round
    }

    /// Id the next transaction will receive.
    pub fn next_transaction(&self) -> TransactionId {
        TransactionId(self.state.next_transaction)
    }

    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    /// Record nets changed outside a round (links, unload).
    pub fn note_changed(&mut self, nets: impl IntoIterator<Item = NetId>) {
        self.dirty.mark_nets(nets);
    }

    pub fn wake(&mut self, node: NodeId) {
        self.dirty.wake(node);
    }

    /// Drop per-node state of a detached node.
    pub fn forget(&mut self, node: NodeId) {
        self.evaluated.remove(&node);
        self.dirty.forget_node(node);
    }

    /// Queue a value to be applied at the start of the next round. A later
    /// stimulus on the same bits wins.
    pub fn drive(
        &mut self,
        bank: &TerminalBank,
        terminal: TerminalId,
        mask: Option<BusMask>,
        value: u64,
    ) -> Result<(), RoundError> {
        let t = bank.get(terminal).ok_or(RoundError::UnknownTerminal(terminal))?;
        let mask = mask.unwrap_or(t.full_mask());
        if !mask.fits(t.width) {
            return Err(RoundError::Range {
                terminal: t.name.clone(),
                mask,
                width: t.width,
            });
        }
        self.stimulus.push(Stimulus { terminal, mask, value });
        Ok(())
    }

    /// Whether [`step`](Self::step) would schedule anything or apply any
    /// stimulus.
    pub fn has_pending_work(&self, graph: &ComponentGraph) -> bool {
        self.dirty.is_dirty()
            || !self.stimulus.is_empty()
            || graph
                .nodes()
                .any(|(id, n)| n.is_schedulable() && !self.evaluated.contains(&id))
    }

    fn parallel_enabled(&self) -> bool {
        cfg!(feature = "parallel") && self.config.parallel
    }

    /// Run one round.
    pub fn step(
        &mut self,
        graph: &mut ComponentGraph,
        bank: &mut TerminalBank,
        linker: &Linker,
    ) -> Result<RoundReport, RoundError> {
        let round = self.state.round;
        self.dirty.normalize(bank.nets());

        // Stimulus forms the base overlay every handler reads through.
        let mut base: HashMap<NetId, bool> = HashMap::new();
        for s in &self.stimulus {
            let Some(t) = bank.get(s.terminal) else { continue };
            for (i, &cell) in t.masked_cells(s.mask).iter().enumerate() {
                base.insert(bank.nets().find(cell), (s.value >> i) & 1 == 1);
            }
        }
        base.retain(|&net, value| bank.nets().get(net) != *value);

        let mut trigger: BTreeSet<NetId> = self.dirty.changed_nets().clone();
        trigger.extend(base.keys().copied());

        let order: Vec<NodeId> = graph.attach_order().to_vec();
        let scheduled: Vec<NodeId> = order
            .into_iter()
            .filter(|&node| {
                graph.get(node).is_some_and(|n| n.is_schedulable())
                    && (!self.evaluated.contains(&node)
                        || self.dirty.is_woken(node)
                        || bank
                            .owned_by(node)
                            .iter()
                            .any(|&t| bank.root_nets(t).iter().any(|r| trigger.contains(r))))
            })
            .collect();

        let groups = if self.parallel_enabled() {
            partition(&scheduled, bank, linker)
        } else {
            vec![(0..scheduled.len()).collect()]
        };

        let position: HashMap<NodeId, usize> = scheduled.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let mut slots: Vec<Option<&mut dyn Component>> = (0..scheduled.len()).map(|_| None).collect();
        for (id, node) in graph.nodes_mut() {
            if let Some(&i) = position.get(&id) {
                slots[i] = Some(node.instance_mut());
            }
        }
        let work: Vec<Vec<Member<'_>>> = groups
            .iter()
            .map(|g| {
                g.iter()
                    .filter_map(|&i| slots[i].take().map(|c| (i, scheduled[i], c)))
                    .collect()
            })
            .collect();

        let budget = self.config.attempt_budget();
        let next_tx = AtomicU64::new(self.state.next_transaction);
        let outcomes = dispatch(self.parallel_enabled(), work, round, bank, &base, &next_tx, budget);
        self.state.next_transaction = next_tx.into_inner();

        let mut stalled: Vec<usize> = outcomes.iter().flat_map(|o| o.stalled.iter().copied()).collect();
        if !stalled.is_empty() {
            stalled.sort_unstable();
            let paths: Vec<String> = stalled
                .iter()
                .map(|&i| graph.path(scheduled[i]).unwrap_or("?").to_string())
                .collect();
            tracing::warn!(%round, stalled = ?paths, attempts = budget, "round did not converge, discarded");
            return Err(RoundError::NonConvergence {
                round,
                stalled: paths,
                attempts: budget,
            });
        }

        // Apply: stimulus first, then group writes. Groups never share a net.
        // Handler writes can only set a latched net.
        let mut writes: BTreeMap<NetId, bool> = base.into_iter().collect();
        for o in &outcomes {
            for (&net, &value) in &o.writes {
                let value = value
                    || (bank.is_latched_net(net)
                        && writes.get(&net).copied().unwrap_or_else(|| bank.nets().get(net)));
                writes.insert(net, value);
            }
        }
        let mut changed: BTreeSet<NetId> = BTreeSet::new();
        for (net, value) in writes {
            if bank.nets().get(net) != value {
                bank.set_net(net, value);
                changed.insert(bank.nets().find(net));
            }
        }

        let latches: Vec<(TerminalId, TerminalId)> = bank
            .iter()
            .filter_map(|(id, t)| t.latched_reset().map(|reset| (id, reset)))
            .collect();
        for (latch, reset) in latches {
            if bank.read(reset).unwrap_or(0) != 0 {
                changed.extend(bank.clear_latch(latch));
            }
        }

        let mirrors_fired = linker.propagate_mirrors(bank, &mut changed);

        let mut committed: Vec<usize> = outcomes.iter().flat_map(|o| o.committed.iter().copied()).collect();
        let mut rolled_back: Vec<usize> = outcomes.iter().flat_map(|o| o.rolled_back.iter().copied()).collect();
        committed.sort_unstable();
        rolled_back.sort_unstable();

        let report = RoundReport {
            round,
            scheduled: scheduled.len(),
            committed: committed.into_iter().map(|i| scheduled[i]).collect(),
            rolled_back: rolled_back.into_iter().map(|i| scheduled[i]).collect(),
            attempts: outcomes.iter().map(|o| o.attempts).sum(),
            delays: outcomes.iter().map(|o| o.delays).sum(),
            first_transaction: outcomes.iter().filter_map(|o| o.first_tx).min().map(TransactionId),
            last_transaction: outcomes.iter().filter_map(|o| o.last_tx).max().map(TransactionId),
            changed_nets: changed.len(),
            mirrors_fired,
        };

        self.evaluated.extend(scheduled.iter().copied());
        self.dirty.mark_clean();
        self.dirty.mark_nets(changed);
        self.stimulus.clear();
        self.state.round = RoundId(round.0 + 1);

        tracing::debug!(
            %round,
            scheduled = report.scheduled,
            committed = report.committed.len(),
            rolled_back = report.rolled_back.len(),
            delays = report.delays,
            changed = report.changed_nets,
            "round committed"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn dispatch(
    parallel: bool,
    work: Vec<Vec<Member<'_>>>,
    round: RoundId,
    bank: &TerminalBank,
    base: &HashMap<NetId, bool>,
    next_tx: &AtomicU64,
    budget: u32,
) -> Vec<GroupOutcome> {
    #[cfg(feature = "parallel")]
    if parallel {
        use rayon::prelude::*;
        return work
            .into_par_iter()
            .map(|group| run_group(round, group, bank, base, next_tx, budget))
            .collect();
    }
    #[cfg(not(feature = "parallel"))]
    let _ = parallel;

    work.into_iter()
        .map(|group| run_group(round, group, bank, base, next_tx, budget))
        .collect()
}

/// Evaluate one group to completion against its own overlay.
fn run_group(
    round: RoundId,
    mut members: Vec<Member<'_>>,
    bank: &TerminalBank,
    base: &HashMap<NetId, bool>,
    next_tx: &AtomicU64,
    budget: u32,
) -> GroupOutcome {
    let mut out = GroupOutcome::default();
    let mut local = base.clone();
    let mut tries = vec![0u32; members.len()];
    let mut queue: VecDeque<usize> = (0..members.len()).collect();

    while let Some(k) = queue.pop_front() {
        let (pos, node) = (members[k].0, members[k].1);
        let component = &mut *members[k].2;
        tries[k] += 1;
        out.attempts += 1;

        let tx_id = next_tx.fetch_add(1, Ordering::Relaxed);
        out.first_tx = Some(out.first_tx.map_or(tx_id, |f| f.min(tx_id)));
        out.last_tx = Some(out.last_tx.map_or(tx_id, |l| l.max(tx_id)));

        let mut tx = Transaction::new(TransactionId(tx_id), round, node, RoundView::new(bank, &local));
        let action = match component.update_handler() {
            Some(handler) => handler.update(&mut tx),
            None => TransactionAction::Rollback,
        };

        match action {
            TransactionAction::Commit => {
                let proposed = tx.into_net_writes();
                for (net, value) in proposed {
                    let current = local.get(&net).copied().unwrap_or_else(|| bank.nets().get(net));
                    if current != value {
                        local.insert(net, value);
                        out.writes.insert(net, value);
                    }
                }
                out.committed.push(pos);
            }
            TransactionAction::Rollback => out.rolled_back.push(pos),
            TransactionAction::Delay => {
                out.delays += 1;
                if tries[k] < budget {
                    queue.push_back(k);
                } else {
                    out.stalled.push(pos);
                }
            }
        }
    }
    out
}

/// Split scheduled handlers into groups that share no net and no Mirror
/// link. Groups come out ordered by their first member.
fn partition(scheduled: &[NodeId], bank: &TerminalBank, linker: &Linker) -> Vec<Vec<usize>> {
    let mut sets = DisjointSets::new(scheduled.len());
    let position: HashMap<NodeId, usize> = scheduled.iter().enumerate().map(|(i, &n)| (n, i)).collect();

    let mut net_owner: HashMap<NetId, usize> = HashMap::new();
    for (i, &node) in scheduled.iter().enumerate() {
        for &t in bank.owned_by(node) {
            for root in bank.root_nets(t) {
                match net_owner.get(&root) {
                    Some(&j) => sets.union(i, j),
                    None => {
                        net_owner.insert(root, i);
                    }
                }
            }
        }
    }

    let owner_pos = |t: TerminalId| bank.get(t).and_then(|t| position.get(&t.owner).copied());
    for (_, l) in linker.mirrors() {
        if let (Some(a), Some(b)) = (owner_pos(l.source), owner_pos(l.target)) {
            sets.union(a, b);
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..scheduled.len() {
        let root = sets.find(i);
        groups.entry(root).or_default().push(i);
    }
    groups.into_values().collect()
}

/// Union-find over schedule positions. The root of a set is its smallest
/// member.
struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}
