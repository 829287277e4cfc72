use crate::component::{ComponentFactory, Constructor};
use crate::id::TypeKey;
use crate::metadata::ComponentMeta;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered component type: its metadata and the ways it can be built.
#[derive(Debug, Clone)]
pub struct ComponentType {
    pub key: TypeKey,
    pub type_name: String,
    /// Component-level metadata. Loading a type without it is a
    /// configuration error.
    pub meta: Option<ComponentMeta>,
    pub(crate) constructor: Option<Constructor>,
    pub(crate) nested_factory: Option<Arc<dyn ComponentFactory>>,
}

impl ComponentType {
    pub fn constructor(&self) -> Option<Constructor> {
        self.constructor
    }

    pub fn nested_factory(&self) -> Option<&Arc<dyn ComponentFactory>> {
        self.nested_factory.as_ref()
    }
}

/// Builder for constructing an immutable [`Catalog`].
/// Three-phase lifecycle: registration -> mutation -> finalization.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    types: Vec<ComponentType>,
    type_name_to_key: HashMap<String, TypeKey>,
    factories: HashMap<String, Arc<dyn ComponentFactory>>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: Register a component type. Re-registering a name replaces
    /// its metadata and keeps its key.
    pub fn register_type(&mut self, type_name: &str, meta: Option<ComponentMeta>) -> TypeKey {
        if let Some(&key) = self.type_name_to_key.get(type_name) {
            self.types[key.0 as usize].meta = meta;
            return key;
        }
        let key = TypeKey(self.types.len() as u32);
        self.types.push(ComponentType {
            key,
            type_name: type_name.to_string(),
            meta,
            constructor: None,
            nested_factory: None,
        });
        self.type_name_to_key.insert(type_name.to_string(), key);
        key
    }

    /// Phase 1: Attach a no-argument constructor to a registered type.
    pub fn set_constructor(&mut self, key: TypeKey, constructor: Constructor) {
        if let Some(ty) = self.types.get_mut(key.0 as usize) {
            ty.constructor = Some(constructor);
        }
    }

    /// Phase 1: Attach the type's own factory, preferred over its
    /// constructor. A type that is itself a factory is registered this way,
    /// with a factory that builds instances of the type.
    pub fn set_nested_factory(&mut self, key: TypeKey, factory: Arc<dyn ComponentFactory>) {
        if let Some(ty) = self.types.get_mut(key.0 as usize) {
            ty.nested_factory = Some(factory);
        }
    }

    /// Phase 1: Register a factory that metadata can reference by name.
    pub fn register_factory(&mut self, name: &str, factory: Arc<dyn ComponentFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Phase 2: Mutate the metadata of an existing type by name.
    pub fn mutate_meta<F>(&mut self, type_name: &str, f: F) -> Result<(), CatalogError>
    where
        F: FnOnce(&mut Option<ComponentMeta>),
    {
        let key = self
            .type_name_to_key
            .get(type_name)
            .ok_or_else(|| CatalogError::NotFound(type_name.to_string()))?;
        f(&mut self.types[key.0 as usize].meta);
        Ok(())
    }

    pub fn type_key(&self, type_name: &str) -> Option<TypeKey> {
        self.type_name_to_key.get(type_name).copied()
    }

    /// Phase 3: Finalize. Every factory reference and hosted type named in
    /// metadata must resolve.
    pub fn build(self) -> Result<Catalog, CatalogError> {
        for ty in &self.types {
            let Some(meta) = &ty.meta else { continue };
            if let Some(factory) = &meta.factory {
                if !self.factories.contains_key(&factory.0) {
                    return Err(CatalogError::UnknownFactory {
                        type_name: ty.type_name.clone(),
                        factory: factory.0.clone(),
                    });
                }
            }
            for host in &meta.hosts {
                if !self.type_name_to_key.contains_key(&host.component) {
                    return Err(CatalogError::UnknownHostedType {
                        type_name: ty.type_name.clone(),
                        host: host.name.clone(),
                        component: host.component.clone(),
                    });
                }
            }
        }

        Ok(Catalog {
            types: self.types,
            type_name_to_key: self.type_name_to_key,
            factories: self.factories,
        })
    }
}

/// Immutable catalog of component types. Frozen after `build()`.
#[derive(Debug)]
pub struct Catalog {
    types: Vec<ComponentType>,
    type_name_to_key: HashMap<String, TypeKey>,
    factories: HashMap<String, Arc<dyn ComponentFactory>>,
}

impl Catalog {
    pub fn get(&self, key: TypeKey) -> Option<&ComponentType> {
        self.types.get(key.0 as usize)
    }

    pub fn type_key(&self, type_name: &str) -> Option<TypeKey> {
        self.type_name_to_key.get(type_name).copied()
    }

    pub fn by_name(&self, type_name: &str) -> Option<&ComponentType> {
        self.type_key(type_name).and_then(|key| self.get(key))
    }

    pub fn factory(&self, name: &str) -> Option<&Arc<dyn ComponentFactory>> {
        self.factories.get(name)
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("type not found: {0}")]
    NotFound(String),
    #[error("type {type_name} references unknown factory {factory}")]
    UnknownFactory { type_name: String, factory: String },
    #[error("type {type_name} hosts {host} of unknown type {component}")]
    UnknownHostedType {
        type_name: String,
        host: String,
        component: String,
    },
}
