//! The runtime facade: catalog, registry, graph, terminals, links and
//! scheduler behind one explicit context object.

use crate::bus::BusMask;
use crate::catalog::Catalog;
use crate::graph::{ComponentGraph, GraphError};
use crate::id::{ComponentId, LinkId, NodeId, RoundId, TerminalId};
use crate::link::{LinkError, Linker};
use crate::loader::{LoadError, Loader, PlannedLink, Prepared, Staged, plan_links};
use crate::metadata::LinkType;
use crate::registry::{ComponentRegistry, Scope};
use crate::round::{CancelToken, RoundReport, RunStop, RunSummary, SchedulerConfig, StateHash};
use crate::scheduler::{RoundError, Scheduler};
use crate::terminal::TerminalBank;
use crate::validation::{self, SelfCheckReport};
use std::collections::HashSet;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Context passed to component hooks
// ---------------------------------------------------------------------------

/// Read-only view of the runtime handed to factories and lifecycle hooks.
#[derive(Clone, Copy)]
pub struct RuntimeContext<'a> {
    catalog: &'a Catalog,
    registry: &'a ComponentRegistry,
    graph: &'a ComponentGraph,
    path: &'a str,
    type_name: &'a str,
}

impl<'a> RuntimeContext<'a> {
    pub(crate) fn new(
        catalog: &'a Catalog,
        registry: &'a ComponentRegistry,
        graph: &'a ComponentGraph,
        path: &'a str,
        type_name: &'a str,
    ) -> Self {
        Self {
            catalog,
            registry,
            graph,
            path,
            type_name,
        }
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    pub fn registry(&self) -> &'a ComponentRegistry {
        self.registry
    }

    pub fn graph(&self) -> &'a ComponentGraph {
        self.graph
    }

    /// Path the component is (or will be) attached at.
    pub fn path(&self) -> &'a str {
        self.path
    }

    /// Catalog type name of the component.
    pub fn type_name(&self) -> &'a str {
        self.type_name
    }
}

impl std::fmt::Debug for RuntimeContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("path", &self.path)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Owns one assembled component tree and drives it round by round.
///
/// There is no process-wide state: every operation goes through a
/// `Runtime` value.
#[derive(Debug)]
pub struct Runtime {
    catalog: Arc<Catalog>,
    registry: ComponentRegistry,
    graph: ComponentGraph,
    terminals: TerminalBank,
    linker: Linker,
    scheduler: Scheduler,
}

impl Runtime {
    pub fn new(catalog: Arc<Catalog>, config: SchedulerConfig) -> Self {
        Self {
            catalog,
            registry: ComponentRegistry::new(),
            graph: ComponentGraph::new(),
            terminals: TerminalBank::new(),
            linker: Linker::new(),
            scheduler: Scheduler::new(config),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &ComponentGraph {
        &self.graph
    }

    /// Mutable graph access, for reaching component instances between
    /// rounds.
    pub fn graph_mut(&mut self) -> &mut ComponentGraph {
        &mut self.graph
    }

    pub fn terminals(&self) -> &TerminalBank {
        &self.terminals
    }

    pub fn linker(&self) -> &Linker {
        &self.linker
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.scheduler.config()
    }

    /// Id of the next round.
    pub fn round(&self) -> RoundId {
        self.scheduler.round()
    }

    /// Context for a node, as its hooks would see it.
    pub fn context(&self, node: NodeId) -> Option<RuntimeContext<'_>> {
        let n = self.graph.get(node)?;
        let path = self.graph.path(node)?;
        let type_name = self
            .catalog
            .get(n.descriptor().type_key)
            .map(|t| t.type_name.as_str())
            .unwrap_or("");
        Some(RuntimeContext::new(&self.catalog, &self.registry, &self.graph, path, type_name))
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Load `type_name` as the root of the tree.
    pub fn load_root(&mut self, type_name: &str) -> Result<NodeId, LoadError> {
        self.load_named(type_name, None, None)
    }

    /// Load `type_name` under `parent`, or as the root when `parent` is
    /// `None`.
    pub fn load(&mut self, type_name: &str, parent: Option<NodeId>) -> Result<NodeId, LoadError> {
        self.load_named(type_name, None, parent)
    }

    /// Load with an explicit name, overriding the metadata name.
    ///
    /// Either the whole subtree is attached and its declared interconnects
    /// established, or nothing changes. Loading a type that is already
    /// attached under the same name and scope returns the existing node.
    pub fn load_named(
        &mut self,
        type_name: &str,
        name: Option<&str>,
        parent: Option<NodeId>,
    ) -> Result<NodeId, LoadError> {
        let prepared = Loader::new(&self.catalog, &self.registry, &self.graph).prepare(type_name, name, parent);
        let staged = match prepared {
            Ok(Prepared::Existing(node)) => {
                tracing::debug!(type_name, ?node, "already attached");
                return Ok(node);
            }
            Ok(Prepared::New(staged)) => staged,
            Err(e) => {
                tracing::warn!(type_name, error = %e, "load rejected");
                return Err(e);
            }
        };
        let plan = match plan_links(&staged) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(type_name, error = %e, "load rejected");
                return Err(e);
            }
        };

        let path = staged.path.clone();
        let mut nodes = Vec::with_capacity(staged.subtree_len());
        let top = self.commit(staged, parent, &mut nodes)?;
        for link in &plan {
            self.establish(link, &nodes)?;
        }

        tracing::debug!(%path, components = nodes.len(), links = plan.len(), "subtree attached");
        Ok(top)
    }

    /// Attach a staged subtree, pushing its nodes in preorder.
    fn commit(&mut self, staged: Staged, parent: Option<NodeId>, nodes: &mut Vec<NodeId>) -> Result<NodeId, LoadError> {
        let Staged {
            type_key,
            name,
            display_name,
            description,
            instance,
            layout,
            children,
            ..
        } = staged;

        let scope = match parent {
            None => Scope::Root,
            Some(p) => Scope::Component(self.graph.get(p).ok_or(GraphError::NodeNotFound(p))?.id()),
        };
        let descriptor = self.registry.define_descriptor(
            &name,
            scope,
            type_key,
            display_name.as_deref(),
            description.as_deref(),
        )?;
        let node = match parent {
            None => self.graph.add_root(descriptor, instance)?,
            Some(p) => self.graph.add_child(p, descriptor, instance)?,
        };
        self.terminals.allocate(node, &layout);
        nodes.push(node);

        for child in children {
            self.commit(child, Some(node), nodes)?;
        }
        Ok(node)
    }

    fn establish(&mut self, link: &PlannedLink, nodes: &[NodeId]) -> Result<LinkId, LoadError> {
        let source = self.planned_terminal(link, nodes, &link.source.terminal, link.source.node)?;
        let target = self.planned_terminal(link, nodes, &link.target.terminal, link.target.node)?;
        let (id, changed) = self.linker.link(
            &mut self.terminals,
            &link.name,
            source,
            link.source.mask,
            target,
            link.target.mask,
            link.link_type,
        )?;
        self.scheduler.note_changed(changed);
        Ok(id)
    }

    fn planned_terminal(
        &self,
        link: &PlannedLink,
        nodes: &[NodeId],
        terminal: &str,
        index: usize,
    ) -> Result<TerminalId, LoadError> {
        nodes
            .get(index)
            .and_then(|&n| self.terminals.lookup(n, terminal))
            .ok_or_else(|| {
                LinkError::UnknownTerminalName {
                    link: link.name.clone(),
                    declared_in: String::new(),
                    scope: nodes
                        .get(index)
                        .and_then(|&n| self.graph.path(n))
                        .unwrap_or("?")
                        .to_string(),
                    terminal: terminal.to_string(),
                }
                .into()
            })
    }

    /// Detach `node` and its subtree. Links touching any removed terminal
    /// are dropped and handlers on their far side are woken. Returns the
    /// retired component ids in preorder.
    pub fn unload(&mut self, node: NodeId) -> Result<Vec<ComponentId>, GraphError> {
        let removed = self.graph.detach(node)?;

        let mut terminals: HashSet<TerminalId> = HashSet::new();
        for (id, _) in &removed {
            terminals.extend(self.terminals.owned_by(*id).iter().copied());
        }

        let survivors: Vec<NodeId> = self
            .linker
            .iter()
            .filter(|(_, l)| terminals.contains(&l.source) || terminals.contains(&l.target))
            .flat_map(|(_, l)| [l.source, l.target])
            .filter(|t| !terminals.contains(t))
            .filter_map(|t| self.terminals.get(t).map(|t| t.owner))
            .collect();
        let dropped = self.linker.remove_touching(&mut self.terminals, &terminals);

        let mut retired = Vec::with_capacity(removed.len());
        for (id, descriptor) in removed {
            self.terminals.remove_owner(id);
            self.registry.remove(descriptor.id);
            self.scheduler.forget(id);
            retired.push(descriptor.id);
        }
        for owner in survivors {
            self.scheduler.wake(owner);
        }

        tracing::debug!(?node, components = retired.len(), links = dropped.len(), "subtree detached");
        Ok(retired)
    }

    // -----------------------------------------------------------------------
    // Terminals and links
    // -----------------------------------------------------------------------

    /// Terminal `name` of `node`.
    pub fn terminal(&self, node: NodeId, name: &str) -> Option<TerminalId> {
        self.terminals.lookup(node, name)
    }

    /// Terminal by graph path and name, e.g. `("~/cpu", "data")`.
    pub fn terminal_at(&self, path: &str, name: &str) -> Option<TerminalId> {
        self.terminal(self.graph.resolve_path(path)?, name)
    }

    /// Committed value of a whole terminal.
    pub fn read(&self, terminal: TerminalId) -> Option<u64> {
        self.terminals.read(terminal)
    }

    pub fn read_masked(&self, terminal: TerminalId, mask: BusMask) -> Option<u64> {
        self.terminals.read_masked(terminal, mask)
    }

    /// Establish a link between two attached terminals. `None` masks select
    /// the whole terminal.
    pub fn link(
        &mut self,
        name: &str,
        source: (TerminalId, Option<BusMask>),
        target: (TerminalId, Option<BusMask>),
        link_type: LinkType,
    ) -> Result<LinkId, LinkError> {
        let full = |bank: &TerminalBank, (id, mask): (TerminalId, Option<BusMask>)| {
            bank.get(id)
                .map(|t| mask.unwrap_or(t.full_mask()))
                .ok_or(LinkError::UnknownTerminal(id))
        };
        let source_mask = full(&self.terminals, source)?;
        let target_mask = full(&self.terminals, target)?;
        let (id, changed) = self.linker.link(
            &mut self.terminals,
            name,
            source.0,
            source_mask,
            target.0,
            target_mask,
            link_type,
        )?;
        self.scheduler.note_changed(changed);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Rounds
    // -----------------------------------------------------------------------

    /// Queue an externally driven value for the start of the next round.
    pub fn drive(&mut self, terminal: TerminalId, mask: Option<BusMask>, value: u64) -> Result<(), RoundError> {
        self.scheduler.drive(&self.terminals, terminal, mask, value)
    }

    /// Schedule `node`'s handler in the next round regardless of inputs.
    pub fn wake(&mut self, node: NodeId) {
        if self.graph.contains(node) {
            self.scheduler.wake(node);
        }
    }

    pub fn has_pending_work(&self) -> bool {
        self.scheduler.has_pending_work(&self.graph)
    }

    /// Run one round.
    pub fn step(&mut self) -> Result<RoundReport, RoundError> {
        self.scheduler.step(&mut self.graph, &mut self.terminals, &self.linker)
    }

    /// Run rounds until nothing is pending, `max_rounds` rounds have run,
    /// or `cancel` is set. Stops at the first failed round.
    pub fn run(&mut self, max_rounds: usize, cancel: &CancelToken) -> Result<RunSummary, RoundError> {
        let mut rounds = Vec::new();
        let stop = loop {
            if cancel.is_cancelled() {
                break RunStop::Cancelled;
            }
            if !self.has_pending_work() {
                break RunStop::Quiescent;
            }
            if rounds.len() >= max_rounds {
                break RunStop::RoundLimit;
            }
            rounds.push(self.step()?);
        };
        tracing::debug!(rounds = rounds.len(), ?stop, "run finished");
        Ok(RunSummary { rounds, stop })
    }

    /// Hash of the committed terminal state, walked in attach order.
    pub fn state_hash(&self) -> u64 {
        let mut h = StateHash::new();
        let order = self.graph.root().map(|r| self.graph.descendants(r)).unwrap_or_default();
        for node in order {
            h.write_str(self.graph.path(node).unwrap_or(""));
            for &t in self.terminals.owned_by(node) {
                if let Some(term) = self.terminals.get(t) {
                    h.write_str(&term.name);
                    h.write_u32(term.width);
                    h.write_u64(self.terminals.read(t).unwrap_or(0));
                }
            }
        }
        h.finish()
    }

    /// Re-run every attached component's self-check and report bridge
    /// hazards.
    pub fn self_check(&self) -> SelfCheckReport {
        validation::check_system(self)
    }
}
