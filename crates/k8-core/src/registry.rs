use crate::id::{ComponentId, TypeKey};
use std::collections::HashMap;
use std::sync::Arc;

/// Namespace a component name must be unique in: the enclosing parent
/// component, or the root scope for the top-level component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Root,
    Component(ComponentId),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Root => f.write_str("root"),
            Scope::Component(id) => write!(f, "component {id}"),
        }
    }
}

/// Identity of a registered component. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    pub id: ComponentId,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub type_key: TypeKey,
    pub scope: Scope,
}

/// Allocates stable ids for named components within a scope.
///
/// Ids come from a monotonically increasing counter and are never handed out
/// twice, even after the component they named has been removed.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    descriptors: HashMap<ComponentId, Arc<ComponentDescriptor>>,
    by_name: HashMap<(Scope, String), ComponentId>,
    next_id: u32,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `name` can be defined in `scope` for `type_key`
    /// without mutating anything. Returns the existing id when the same
    /// type is already registered there.
    pub fn check(
        &self,
        name: &str,
        scope: Scope,
        type_key: TypeKey,
    ) -> Result<Option<ComponentId>, RegistryError> {
        let Some(&existing) = self.by_name.get(&(scope, name.to_string())) else {
            return Ok(None);
        };
        match self.descriptors.get(&existing) {
            Some(desc) if desc.type_key == type_key => Ok(Some(existing)),
            _ => Err(RegistryError::DuplicateName {
                name: name.to_string(),
                scope,
                existing,
            }),
        }
    }

    /// Define `name` in `scope`. Idempotent for the same type.
    pub fn define(
        &mut self,
        name: &str,
        scope: Scope,
        type_key: TypeKey,
    ) -> Result<ComponentId, RegistryError> {
        self.define_descriptor(name, scope, type_key, None, None)
            .map(|desc| desc.id)
    }

    /// Define `name` in `scope` with display metadata. Repeated calls for the
    /// same `(type, scope, name)` return the descriptor created first.
    pub fn define_descriptor(
        &mut self,
        name: &str,
        scope: Scope,
        type_key: TypeKey,
        display_name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Arc<ComponentDescriptor>, RegistryError> {
        if let Some(existing) = self.check(name, scope, type_key)? {
            return self
                .descriptors
                .get(&existing)
                .cloned()
                .ok_or(RegistryError::NotFound(existing));
        }

        let id = ComponentId(self.next_id);
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or(RegistryError::Exhausted)?;

        let descriptor = Arc::new(ComponentDescriptor {
            id,
            name: name.to_string(),
            display_name: display_name.unwrap_or(name).to_string(),
            description: description.map(str::to_string),
            type_key,
            scope,
        });
        self.descriptors.insert(id, Arc::clone(&descriptor));
        self.by_name.insert((scope, name.to_string()), id);
        Ok(descriptor)
    }

    /// Reverse lookup.
    pub fn descriptor(&self, id: ComponentId) -> Option<&Arc<ComponentDescriptor>> {
        self.descriptors.get(&id)
    }

    pub fn lookup(&self, name: &str, scope: Scope) -> Option<ComponentId> {
        self.by_name.get(&(scope, name.to_string())).copied()
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.descriptors.contains_key(&id)
    }

    /// Forget a component. Its id is retired, not recycled.
    pub fn remove(&mut self, id: ComponentId) -> Option<Arc<ComponentDescriptor>> {
        let desc = self.descriptors.remove(&id)?;
        self.by_name.remove(&(desc.scope, desc.name.clone()));
        Some(desc)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate name {name:?} in {scope} (already registered as {existing})")]
    DuplicateName {
        name: String,
        scope: Scope,
        existing: ComponentId,
    },
    #[error("component not found: {0}")]
    NotFound(ComponentId),
    #[error("component id space exhausted")]
    Exhausted,
}
