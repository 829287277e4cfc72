//! Metadata-driven construction of component subtrees.
//!
//! Loading happens in two steps. Staging resolves the whole subtree in
//! memory: each component is constructed, configured and self-checked, its
//! terminal layout validated and its declared interconnects resolved,
//! without touching the registry or the graph. Only a fully staged subtree
//! is committed, so a failure anywhere leaves the runtime exactly as it
//! was.

use crate::bus::BusMask;
use crate::catalog::{Catalog, ComponentType};
use crate::component::Component;
use crate::graph::{ComponentGraph, GraphError, PATH_SEPARATOR, ROOT_PATH};
use crate::id::{NodeId, TypeKey};
use crate::link::LinkError;
use crate::metadata::{ComponentMeta, InterconnectDecl, LinkType, TerminalRef};
use crate::registry::{ComponentRegistry, RegistryError, Scope};
use crate::round::StateHash;
use crate::runtime::RuntimeContext;
use crate::terminal::TerminalLayout;
use std::collections::HashSet;

/// Errors raised while loading a component subtree.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Required metadata is missing or malformed.
    #[error("configuration error in {type_name}: {reason}")]
    Configuration { type_name: String, reason: String },

    /// No named factory, nested factory, or constructor is available.
    #[error("{type_name} is not constructable: no factory or constructor registered")]
    NotConstructable { type_name: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Two hosted children of one component share a name.
    #[error("duplicate name {name:?} under {parent}")]
    DuplicateName { parent: String, name: String },

    /// Self-check reported errors.
    #[error("{path} failed self-check: {}", errors.join("; "))]
    Activation { path: String, errors: Vec<String> },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Staged subtree
// ---------------------------------------------------------------------------

/// A constructed, checked component that is not attached yet.
#[derive(Debug)]
pub(crate) struct Staged {
    pub type_key: TypeKey,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub path: String,
    pub instance: Box<dyn Component>,
    pub layout: TerminalLayout,
    pub interconnects: Vec<InterconnectDecl>,
    pub children: Vec<Staged>,
}

impl Staged {
    /// Nodes in this subtree, self included.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(Staged::subtree_len).sum::<usize>()
    }
}

/// Outcome of [`Loader::prepare`].
#[derive(Debug)]
pub(crate) enum Prepared {
    /// The same type is already attached under the same name and scope.
    Existing(NodeId),
    New(Staged),
}

/// One end of a planned interconnect. `node` is a preorder index into the
/// staged subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub node: usize,
    pub terminal: String,
    pub mask: BusMask,
}

/// An interconnect that resolved and validated against the staged subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedLink {
    pub name: String,
    pub source: Endpoint,
    pub target: Endpoint,
    pub link_type: LinkType,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Read-only staging pass over the current runtime state.
pub(crate) struct Loader<'a> {
    catalog: &'a Catalog,
    registry: &'a ComponentRegistry,
    graph: &'a ComponentGraph,
}

impl<'a> Loader<'a> {
    pub fn new(catalog: &'a Catalog, registry: &'a ComponentRegistry, graph: &'a ComponentGraph) -> Self {
        Self {
            catalog,
            registry,
            graph,
        }
    }

    /// Stage `type_name` for attachment under `parent` (or as the root).
    /// `name` overrides the metadata name.
    pub fn prepare(&self, type_name: &str, name: Option<&str>, parent: Option<NodeId>) -> Result<Prepared, LoadError> {
        let ty = self.component_type(type_name)?;
        let meta = require_meta(ty)?;

        let (scope, parent_path) = match parent {
            None => (Scope::Root, None),
            Some(p) => {
                let node = self.graph.get(p).ok_or(GraphError::NodeNotFound(p))?;
                let path = self.graph.path(p).ok_or(GraphError::NodeNotFound(p))?;
                (Scope::Component(node.id()), Some(path))
            }
        };

        let name = match name.or(meta.name.as_deref()) {
            Some(n) => n.to_string(),
            None => generated_name(&ty.type_name, parent_path.unwrap_or("")),
        };

        if let Some(existing) = self.registry.check(&name, scope, ty.key)? {
            if let Some(node) = self.graph.node_of(existing) {
                return Ok(Prepared::Existing(node));
            }
        }
        if parent.is_none() && self.graph.root().is_some() {
            return Err(GraphError::RootAlreadySet.into());
        }

        let path = match parent_path {
            None => ROOT_PATH.to_string(),
            Some(base) => format!("{base}{PATH_SEPARATOR}{name}"),
        };
        let mut ancestors = Vec::new();
        self.stage(ty, meta, name, path, &mut ancestors).map(Prepared::New)
    }

    fn component_type(&self, type_name: &str) -> Result<&'a ComponentType, LoadError> {
        self.catalog
            .by_name(type_name)
            .ok_or_else(|| LoadError::Configuration {
                type_name: type_name.to_string(),
                reason: "type is not registered".to_string(),
            })
    }

    fn stage(
        &self,
        ty: &'a ComponentType,
        meta: &'a ComponentMeta,
        name: String,
        path: String,
        ancestors: &mut Vec<TypeKey>,
    ) -> Result<Staged, LoadError> {
        if ancestors.contains(&ty.key) {
            return Err(LoadError::Configuration {
                type_name: ty.type_name.clone(),
                reason: format!("hosts itself at {path}"),
            });
        }

        let ctx = RuntimeContext::new(self.catalog, self.registry, self.graph, &path, &ty.type_name);
        let mut instance = self.construct(ty, meta, &ctx)?;

        let layout = TerminalLayout::from_meta(meta).map_err(|e| LoadError::Configuration {
            type_name: ty.type_name.clone(),
            reason: e.to_string(),
        })?;

        instance.configure(&ctx);
        let check = instance.self_check(&ctx);
        if check.has_errors() {
            return Err(LoadError::Activation {
                path,
                errors: check.into_errors(),
            });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut children = Vec::with_capacity(meta.hosts.len());
        ancestors.push(ty.key);
        for host in &meta.hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(LoadError::DuplicateName {
                    parent: path,
                    name: host.name.clone(),
                });
            }
            let child_ty = self.component_type(&host.component)?;
            let child_meta = require_meta(child_ty)?;
            let child_path = format!("{path}{PATH_SEPARATOR}{}", host.name);
            children.push(self.stage(child_ty, child_meta, host.name.clone(), child_path, ancestors)?);
        }
        ancestors.pop();

        tracing::debug!(%path, type_name = %ty.type_name, children = children.len(), "component staged");
        Ok(Staged {
            type_key: ty.key,
            name,
            display_name: meta.display_name.clone(),
            description: meta.description.clone(),
            path,
            instance,
            layout,
            interconnects: meta.interconnects.clone(),
            children,
        })
    }

    /// Explicit named factory, then the type's nested factory, then its
    /// constructor.
    fn construct(
        &self,
        ty: &ComponentType,
        meta: &ComponentMeta,
        ctx: &RuntimeContext<'_>,
    ) -> Result<Box<dyn Component>, LoadError> {
        let not_constructable = || LoadError::NotConstructable {
            type_name: ty.type_name.clone(),
        };
        if let Some(factory) = &meta.factory {
            let factory = self.catalog.factory(&factory.0).ok_or_else(not_constructable)?;
            return Ok(factory.create(ctx));
        }
        if let Some(factory) = ty.nested_factory() {
            return Ok(factory.create(ctx));
        }
        ty.constructor().map(|c| c()).ok_or_else(not_constructable)
    }
}

fn require_meta(ty: &ComponentType) -> Result<&ComponentMeta, LoadError> {
    ty.meta.as_ref().ok_or_else(|| LoadError::Configuration {
        type_name: ty.type_name.clone(),
        reason: "no component metadata".to_string(),
    })
}

/// Deterministic name for a component whose metadata names none.
pub fn generated_name(type_name: &str, parent_path: &str) -> String {
    let mut h = StateHash::new();
    h.write_str(type_name);
    h.write_str(parent_path);
    format!("{type_name}::{:016x}", h.finish())
}

// ---------------------------------------------------------------------------
// Interconnect planning
// ---------------------------------------------------------------------------

/// Resolve and validate every interconnect declared in the staged subtree.
pub(crate) fn plan_links(root: &Staged) -> Result<Vec<PlannedLink>, LoadError> {
    let mut out = Vec::new();
    plan_node(root, 0, &mut out)?;
    Ok(out)
}

fn plan_node(node: &Staged, index: usize, out: &mut Vec<PlannedLink>) -> Result<(), LoadError> {
    for decl in &node.interconnects {
        let source = resolve_endpoint(node, index, &decl.name, &decl.source)?;
        let target = resolve_endpoint(node, index, &decl.name, &decl.target)?;
        if source.mask.count != target.mask.count {
            return Err(LinkError::WidthMismatch {
                link: decl.name.clone(),
                source_count: source.mask.count,
                target_count: target.mask.count,
            }
            .into());
        }
        out.push(PlannedLink {
            name: decl.name.clone(),
            source,
            target,
            link_type: decl.link_type,
        });
    }
    let mut child_index = index + 1;
    for child in &node.children {
        plan_node(child, child_index, out)?;
        child_index += child.subtree_len();
    }
    Ok(())
}

/// Walk `r`'s scope down from the declaring component and check the named
/// terminal is visible from there.
fn resolve_endpoint(declaring: &Staged, index: usize, link: &str, r: &TerminalRef) -> Result<Endpoint, LoadError> {
    let mut current = declaring;
    let mut current_index = index;
    let mut depth = 0usize;

    for segment in r.scope_segments() {
        let mut offset = current_index + 1;
        let mut found = None;
        for child in &current.children {
            if child.name == segment {
                found = Some(child);
                break;
            }
            offset += child.subtree_len();
        }
        let Some(child) = found else {
            return Err(LinkError::UnresolvedScope {
                link: link.to_string(),
                declared_in: declaring.path.clone(),
                scope: r.scope.clone().unwrap_or_default(),
            }
            .into());
        };
        current = child;
        current_index = offset;
        depth += 1;
    }

    let entry = current
        .layout
        .entries
        .iter()
        .find(|e| e.name == r.terminal)
        .ok_or_else(|| LinkError::UnknownTerminalName {
            link: link.to_string(),
            declared_in: declaring.path.clone(),
            scope: current.path.clone(),
            terminal: r.terminal.clone(),
        })?;
    if !entry.access.visible_at(depth) {
        return Err(LinkError::AccessDenied {
            link: link.to_string(),
            declared_in: declaring.path.clone(),
            terminal: format!("{}{PATH_SEPARATOR}{}", current.path, entry.name),
            depth,
        }
        .into());
    }

    let mask = r.select.unwrap_or(BusMask::full(entry.width));
    if !mask.fits(entry.width) {
        return Err(LinkError::Range {
            link: link.to_string(),
            terminal: entry.name.clone(),
            mask,
            width: entry.width,
        }
        .into());
    }
    Ok(Endpoint {
        node: current_index,
        terminal: entry.name.clone(),
        mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogBuilder;
    use crate::metadata::Access;
    use crate::test_utils::{FailingCheck, Passive, construct};

    fn catalog() -> Catalog {
        let mut b = CatalogBuilder::new();
        let leaf = b.register_type(
            "leaf",
            Some(
                ComponentMeta::new()
                    .terminal("pub", 4, Access::External)
                    .terminal("int", 4, Access::Internal)
                    .terminal("priv", 4, Access::Private),
            ),
        );
        b.set_constructor(leaf, construct::<Passive>);
        let mid = b.register_type("mid", Some(ComponentMeta::new().host("leaf", "leaf")));
        b.set_constructor(mid, construct::<Passive>);
        let bad = b.register_type("bad", Some(ComponentMeta::new()));
        b.set_constructor(bad, construct::<FailingCheck>);
        b.register_type("bare", None);
        b.register_type("abstract", Some(ComponentMeta::new()));
        b.build().unwrap()
    }

    fn prepare(catalog: &Catalog, type_name: &str) -> Result<Prepared, LoadError> {
        let registry = ComponentRegistry::new();
        let graph = ComponentGraph::new();
        Loader::new(catalog, &registry, &graph).prepare(type_name, None, None)
    }

    fn staged(p: Prepared) -> Staged {
        match p {
            Prepared::New(s) => s,
            Prepared::Existing(_) => panic!("expected a new subtree"),
        }
    }

    #[test]
    fn missing_meta_is_configuration_error() {
        let c = catalog();
        assert!(matches!(prepare(&c, "bare"), Err(LoadError::Configuration { .. })));
        assert!(matches!(prepare(&c, "nope"), Err(LoadError::Configuration { .. })));
    }

    #[test]
    fn no_factory_is_not_constructable() {
        let c = catalog();
        assert!(matches!(
            prepare(&c, "abstract"),
            Err(LoadError::NotConstructable { type_name }) if type_name == "abstract"
        ));
    }

    #[test]
    fn failing_self_check_is_activation_error() {
        let c = catalog();
        match prepare(&c, "bad") {
            Err(LoadError::Activation { path, errors }) => {
                assert_eq!(path, "~");
                assert!(!errors.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn staging_builds_paths_and_generated_names() {
        let c = catalog();
        let s = staged(prepare(&c, "mid").unwrap());
        assert_eq!(s.path, "~");
        assert!(s.name.starts_with("mid::"));
        assert_eq!(s.children.len(), 1);
        assert_eq!(s.children[0].path, "~/leaf");
        assert_eq!(s.subtree_len(), 2);
    }

    #[test]
    fn generated_names_are_deterministic() {
        assert_eq!(generated_name("cpu", "~"), generated_name("cpu", "~"));
        assert_ne!(generated_name("cpu", "~"), generated_name("cpu", "~/a"));
    }

    #[test]
    fn access_rules_apply_by_depth() {
        let c = catalog();
        let mut s = staged(prepare(&c, "mid").unwrap());

        s.interconnects = vec![InterconnectDecl {
            name: "ok".into(),
            source: TerminalRef::scoped("leaf", "pub"),
            target: TerminalRef::scoped("leaf", "int"),
            link_type: LinkType::Bridge,
        }];
        let plan = plan_links(&s).unwrap();
        assert_eq!(plan[0].source.node, 1);
        assert_eq!(plan[0].source.mask, BusMask::full(4));

        s.interconnects = vec![InterconnectDecl {
            name: "hidden".into(),
            source: TerminalRef::scoped("leaf", "priv"),
            target: TerminalRef::scoped("leaf", "pub"),
            link_type: LinkType::Bridge,
        }];
        assert!(matches!(plan_links(&s), Err(LoadError::Link(LinkError::AccessDenied { .. }))));
    }

    #[test]
    fn width_mismatch_and_range_are_rejected() {
        let c = catalog();
        let mut s = staged(prepare(&c, "mid").unwrap());
        s.interconnects = vec![InterconnectDecl {
            name: "narrow".into(),
            source: TerminalRef::scoped("leaf", "pub").select(0, 2),
            target: TerminalRef::scoped("leaf", "int"),
            link_type: LinkType::Mirror,
        }];
        assert!(matches!(plan_links(&s), Err(LoadError::Link(LinkError::WidthMismatch { .. }))));

        s.interconnects = vec![InterconnectDecl {
            name: "wide".into(),
            source: TerminalRef::scoped("leaf", "pub").select(2, 4),
            target: TerminalRef::scoped("leaf", "int"),
            link_type: LinkType::Mirror,
        }];
        assert!(matches!(plan_links(&s), Err(LoadError::Link(LinkError::Range { .. }))));

        s.interconnects = vec![InterconnectDecl {
            name: "lost".into(),
            source: TerminalRef::scoped("nobody", "pub"),
            target: TerminalRef::scoped("leaf", "int"),
            link_type: LinkType::Mirror,
        }];
        assert!(matches!(plan_links(&s), Err(LoadError::Link(LinkError::UnresolvedScope { .. }))));
    }
}
