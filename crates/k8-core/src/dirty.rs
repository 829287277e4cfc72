use crate::id::{NetId, NodeId};
use crate::terminal::NetStore;
use std::collections::BTreeSet;

/// Tracks which nets changed and which handlers were explicitly woken since
/// the last committed round.
///
/// The scheduler reads this at the start of a round to decide which
/// handlers to evaluate, and resets it only when the round commits, so a
/// failed round leaves the same work pending.
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    changed_nets: BTreeSet<NetId>,
    woken: BTreeSet<NodeId>,
}

impl DirtyTracker {
    /// Create a new tracker with nothing dirty.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_net(&mut self, net: NetId) {
        self.changed_nets.insert(net);
    }

    pub fn mark_nets(&mut self, nets: impl IntoIterator<Item = NetId>) {
        self.changed_nets.extend(nets);
    }

    /// Schedule a handler for the next round regardless of its inputs.
    pub fn wake(&mut self, node: NodeId) {
        self.woken.insert(node);
    }

    pub fn is_dirty(&self) -> bool {
        !self.changed_nets.is_empty() || !self.woken.is_empty()
    }

    pub fn is_woken(&self, node: NodeId) -> bool {
        self.woken.contains(&node)
    }

    pub fn changed_nets(&self) -> &BTreeSet<NetId> {
        &self.changed_nets
    }

    /// Re-key changed nets by their current roots. Links established since
    /// the nets were marked may have merged them.
    pub fn normalize(&mut self, nets: &NetStore) {
        self.changed_nets = self.changed_nets.iter().map(|&n| nets.find(n)).collect();
    }

    pub fn forget_node(&mut self, node: NodeId) {
        self.woken.remove(&node);
    }

    /// Reset all flags. Called after a round commits.
    pub fn mark_clean(&mut self) {
        self.changed_nets.clear();
        self.woken.clear();
    }
}
