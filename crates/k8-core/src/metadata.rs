//! Declarative component metadata.
//!
//! This is the data a component author attaches to a component type: name
//! overrides, the factory to build it with, the child components it hosts,
//! the terminals and signals it exposes, and the interconnects it declares
//! between its own terminals and those of its descendants. The core only
//! ever reads it.

use crate::bus::BusMask;
use serde::{Deserialize, Serialize};

/// Visibility of a terminal to scopes outside its owning component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Access {
    /// Visible to the owner and its direct parent.
    #[default]
    Internal,
    /// Visible only to the owning component's own declarations.
    Private,
    /// Visible to every ancestor.
    External,
}

impl Access {
    /// Whether a declaration made `depth` levels above the owner may bind
    /// this terminal. Depth 0 is the owner itself.
    pub fn visible_at(self, depth: usize) -> bool {
        match (self, depth) {
            (_, 0) => true,
            (Access::Private, _) => false,
            (Access::Internal, 1) => true,
            (Access::Internal, _) => false,
            (Access::External, _) => true,
        }
    }
}

/// Propagation semantic of an interconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// Bidirectional alias of the masked bits.
    Bridge,
    /// Source to target copy at the end of every round the source changed.
    Mirror,
    /// One-time snapshot copy at link time.
    Copy,
}

/// Reference to a factory registered by name in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactoryRef(pub String);

/// `Host(name)`: a child component bound under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDecl {
    pub name: String,
    /// Catalog type name of the hosted component.
    pub component: String,
}

/// A bus terminal of a declared width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDecl {
    pub name: String,
    pub width: u32,
    #[serde(default)]
    pub access: Access,
}

/// `Signal(name, selectBit)`: a single-bit terminal, optionally an alias
/// of one bit of a bus terminal of the same component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDecl {
    pub name: String,
    /// Bus terminal this signal selects a bit from. `None` gives the signal
    /// its own storage bit.
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default)]
    pub select_bit: u32,
    /// `Latched(resetSignal)`.
    #[serde(default)]
    pub latched: Option<String>,
    #[serde(default)]
    pub access: Access,
}

/// `Bind(name, scope)` plus an optional `Select(offset, count)`.
///
/// `scope` is a `/`-separated path of host names relative to the declaring
/// component; `None` binds the declaring component's own terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalRef {
    #[serde(default)]
    pub scope: Option<String>,
    pub terminal: String,
    #[serde(default)]
    pub select: Option<BusMask>,
}

impl TerminalRef {
    pub fn local(terminal: &str) -> Self {
        Self {
            scope: None,
            terminal: terminal.to_string(),
            select: None,
        }
    }

    pub fn scoped(scope: &str, terminal: &str) -> Self {
        Self {
            scope: Some(scope.to_string()),
            terminal: terminal.to_string(),
            select: None,
        }
    }

    pub fn select(mut self, offset: u32, count: u32) -> Self {
        self.select = Some(BusMask::new(offset, count));
        self
    }

    /// Host names to walk from the declaring component.
    pub fn scope_segments(&self) -> impl Iterator<Item = &str> {
        self.scope
            .as_deref()
            .unwrap_or("")
            .split('/')
            .filter(|s| !s.is_empty())
    }
}

impl std::fmt::Display for TerminalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{scope}.{}", self.terminal)?,
            None => write!(f, "{}", self.terminal)?,
        }
        if let Some(mask) = self.select {
            write!(f, "{mask}")?;
        }
        Ok(())
    }
}

/// `Interconnect(name)`: a link between two bound terminals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterconnectDecl {
    pub name: String,
    pub source: TerminalRef,
    pub target: TerminalRef,
    pub link_type: LinkType,
}

/// Component-level metadata. Required for every loadable type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub factory: Option<FactoryRef>,
    #[serde(default)]
    pub hosts: Vec<HostDecl>,
    #[serde(default)]
    pub terminals: Vec<TerminalDecl>,
    #[serde(default)]
    pub signals: Vec<SignalDecl>,
    #[serde(default)]
    pub interconnects: Vec<InterconnectDecl>,
}

impl ComponentMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn display_name(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn factory(mut self, factory: &str) -> Self {
        self.factory = Some(FactoryRef(factory.to_string()));
        self
    }

    pub fn host(mut self, name: &str, component: &str) -> Self {
        self.hosts.push(HostDecl {
            name: name.to_string(),
            component: component.to_string(),
        });
        self
    }

    pub fn terminal(mut self, name: &str, width: u32, access: Access) -> Self {
        self.terminals.push(TerminalDecl {
            name: name.to_string(),
            width,
            access,
        });
        self
    }

    pub fn signal(mut self, decl: SignalDecl) -> Self {
        self.signals.push(decl);
        self
    }

    pub fn interconnect(
        mut self,
        name: &str,
        source: TerminalRef,
        target: TerminalRef,
        link_type: LinkType,
    ) -> Self {
        self.interconnects.push(InterconnectDecl {
            name: name.to_string(),
            source,
            target,
            link_type,
        });
        self
    }
}

impl SignalDecl {
    /// A free-standing signal with its own storage bit.
    pub fn standalone(name: &str, access: Access) -> Self {
        Self {
            name: name.to_string(),
            bus: None,
            select_bit: 0,
            latched: None,
            access,
        }
    }

    /// A signal selecting one bit of a bus terminal.
    pub fn on_bus(name: &str, bus: &str, select_bit: u32, access: Access) -> Self {
        Self {
            name: name.to_string(),
            bus: Some(bus.to_string()),
            select_bit,
            latched: None,
            access,
        }
    }

    pub fn latched(mut self, reset_signal: &str) -> Self {
        self.latched = Some(reset_signal.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_visibility_by_depth() {
        assert!(Access::Private.visible_at(0));
        assert!(!Access::Private.visible_at(1));
        assert!(Access::Internal.visible_at(1));
        assert!(!Access::Internal.visible_at(2));
        assert!(Access::External.visible_at(5));
    }

    #[test]
    fn scope_segments_skip_empty_parts() {
        let r = TerminalRef::scoped("cpu//alu/", "flags");
        let segs: Vec<&str> = r.scope_segments().collect();
        assert_eq!(segs, vec!["cpu", "alu"]);
        assert_eq!(TerminalRef::local("q").scope_segments().count(), 0);
    }

    #[test]
    fn terminal_ref_display() {
        let r = TerminalRef::scoped("ram", "data").select(0, 4);
        assert_eq!(r.to_string(), "ram.data[0..4)");
    }

    #[test]
    fn builder_accumulates_declarations() {
        let meta = ComponentMeta::new()
            .named("board")
            .host("cpu", "Cpu")
            .terminal("data", 8, Access::External)
            .signal(SignalDecl::on_bus("d0", "data", 0, Access::Internal));
        assert_eq!(meta.name.as_deref(), Some("board"));
        assert_eq!(meta.hosts.len(), 1);
        assert_eq!(meta.terminals[0].width, 8);
        assert_eq!(meta.signals[0].bus.as_deref(), Some("data"));
    }
}
