use crate::component::Component;
use crate::id::{ComponentId, NodeId};
use crate::registry::ComponentDescriptor;
use slotmap::SlotMap;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("graph already has a root")]
    RootAlreadySet,
    #[error("component {0} is already attached")]
    AlreadyAttached(ComponentId),
    #[error("the root node cannot be detached")]
    CannotDetachRoot,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '/';

/// Path of the root node.
pub const ROOT_PATH: &str = "~";

/// A node wrapping one component instance.
#[derive(Debug)]
pub struct ComponentNode {
    descriptor: Arc<ComponentDescriptor>,
    instance: Box<dyn Component>,
    parent: Option<NodeId>,
    root: NodeId,
    /// Ordered by attach time.
    children: Vec<NodeId>,
    depth: usize,
    /// Whether the instance exposes the update capability.
    schedulable: bool,
    /// Computed on first access, then frozen.
    path: OnceLock<String>,
}

impl ComponentNode {
    pub fn descriptor(&self) -> &Arc<ComponentDescriptor> {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn id(&self) -> ComponentId {
        self.descriptor.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_schedulable(&self) -> bool {
        self.schedulable
    }

    pub fn instance(&self) -> &dyn Component {
        self.instance.as_ref()
    }

    pub fn instance_mut(&mut self) -> &mut dyn Component {
        self.instance.as_mut()
    }
}

// ---------------------------------------------------------------------------
// ComponentGraph
// ---------------------------------------------------------------------------

/// Single-rooted tree of attached components.
///
/// Children keep their attach order, and the cached preorder walk of the
/// tree is the deterministic order the scheduler evaluates handlers in.
#[derive(Debug, Default)]
pub struct ComponentGraph {
    nodes: SlotMap<NodeId, ComponentNode>,
    root: Option<NodeId>,
    by_component: HashMap<ComponentId, NodeId>,

    /// Cached preorder (attach order). Recomputed lazily when `dirty`.
    order_cache: Vec<NodeId>,
    dirty: bool,
}

impl ComponentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the root component.
    pub fn add_root(
        &mut self,
        descriptor: Arc<ComponentDescriptor>,
        mut instance: Box<dyn Component>,
    ) -> Result<NodeId, GraphError> {
        if self.root.is_some() {
            return Err(GraphError::RootAlreadySet);
        }
        if self.by_component.contains_key(&descriptor.id) {
            return Err(GraphError::AlreadyAttached(descriptor.id));
        }
        let id = descriptor.id;
        let schedulable = instance.update_handler().is_some();
        let node = self.nodes.insert_with_key(|key| ComponentNode {
            descriptor,
            instance,
            parent: None,
            root: key,
            children: Vec::new(),
            depth: 0,
            schedulable,
            path: OnceLock::new(),
        });
        self.root = Some(node);
        self.by_component.insert(id, node);
        self.dirty = true;
        Ok(node)
    }

    /// Attach a child under `parent`, after its existing children.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        descriptor: Arc<ComponentDescriptor>,
        mut instance: Box<dyn Component>,
    ) -> Result<NodeId, GraphError> {
        let (root, depth) = {
            let p = self
                .nodes
                .get(parent)
                .ok_or(GraphError::NodeNotFound(parent))?;
            (p.root, p.depth + 1)
        };
        if self.by_component.contains_key(&descriptor.id) {
            return Err(GraphError::AlreadyAttached(descriptor.id));
        }
        let id = descriptor.id;
        let schedulable = instance.update_handler().is_some();
        let node = self.nodes.insert(ComponentNode {
            descriptor,
            instance,
            parent: Some(parent),
            root,
            children: Vec::new(),
            depth,
            schedulable,
            path: OnceLock::new(),
        });
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(node);
        }
        self.by_component.insert(id, node);
        self.dirty = true;
        Ok(node)
    }

    /// Remove `node` and its whole subtree. Returns the removed descriptors
    /// in preorder.
    pub fn detach(&mut self, node: NodeId) -> Result<Vec<(NodeId, Arc<ComponentDescriptor>)>, GraphError> {
        let parent = self
            .nodes
            .get(node)
            .ok_or(GraphError::NodeNotFound(node))?
            .parent
            .ok_or(GraphError::CannotDetachRoot)?;

        let subtree = self.descendants(node);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.retain(|&c| c != node);
        }

        let mut removed = Vec::with_capacity(subtree.len());
        for id in subtree {
            if let Some(n) = self.nodes.remove(id) {
                self.by_component.remove(&n.descriptor.id);
                removed.push((id, n.descriptor));
            }
        }
        self.dirty = true;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn get(&self, node: NodeId) -> Option<&ComponentNode> {
        self.nodes.get(node)
    }

    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut ComponentNode> {
        self.nodes.get_mut(node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_of(&self, component: ComponentId) -> Option<NodeId> {
        self.by_component.get(&component).copied()
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node).and_then(|n| n.parent)
    }

    /// O(1) root lookup from any node.
    pub fn root_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node).map(|n| n.root)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&c| self.nodes.get(c).is_some_and(|n| n.name() == name))
    }

    /// `"~"` for the root, otherwise the parent's path, `/`, and the node's
    /// name. Computed once per node and cached.
    pub fn path(&self, node: NodeId) -> Option<&str> {
        let n = self.nodes.get(node)?;
        if let Some(path) = n.path.get() {
            return Some(path.as_str());
        }
        let path = match n.parent {
            None => ROOT_PATH.to_string(),
            Some(parent) => {
                let base = self.path(parent)?;
                let mut path = String::with_capacity(base.len() + n.name().len() + 1);
                path.push_str(base);
                path.push(PATH_SEPARATOR);
                path.push_str(n.name());
                path
            }
        };
        Some(n.path.get_or_init(|| path).as_str())
    }

    /// Resolve a path produced by [`path`](Self::path).
    pub fn resolve_path(&self, path: &str) -> Option<NodeId> {
        let mut segments = path.split(PATH_SEPARATOR);
        if segments.next()? != ROOT_PATH {
            return None;
        }
        let mut current = self.root?;
        for segment in segments.filter(|s| !s.is_empty()) {
            current = self.find_child(current, segment)?;
        }
        Some(current)
    }

    /// Preorder walk of the subtree at `node`, children in attach order.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if !self.nodes.contains_key(node) {
            return out;
        }
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            out.push(current);
            if let Some(n) = self.nodes.get(current) {
                stack.extend(n.children.iter().rev().copied());
            }
        }
        out
    }

    /// Cached preorder of the whole tree.
    pub fn attach_order(&mut self) -> &[NodeId] {
        if self.dirty {
            self.order_cache = match self.root {
                Some(root) => self.descendants(root),
                None => Vec::new(),
            };
            self.dirty = false;
        }
        &self.order_cache
    }

    /// Downcast a node's instance.
    pub fn component<T: Component>(&self, node: NodeId) -> Option<&T> {
        self.nodes
            .get(node)
            .and_then(|n| n.instance.as_any().downcast_ref::<T>())
    }

    pub fn component_mut<T: Component>(&mut self, node: NodeId) -> Option<&mut T> {
        self.nodes
            .get_mut(node)
            .and_then(|n| n.instance.as_any_mut().downcast_mut::<T>())
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ComponentNode)> {
        self.nodes.iter()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut ComponentNode)> {
        self.nodes.iter_mut()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
