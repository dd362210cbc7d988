//! Plugin registry: the static table of available plugins, keyed by id.
//!
//! Built once at startup from a fixed list of factories. Registration
//! validates each descriptor, so an ambiguous or malformed plugin fails
//! the whole startup.

use std::collections::BTreeMap;

use super::trait_def::{PluginDescriptor, PluginFactory};
use crate::entity::schema::{self, SchemaError};

/// Why a plugin could not be registered.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate plugin id {0:?}")]
    Duplicate(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// A registered plugin: its descriptor (cached at registration) and
/// factory.
pub struct RegisteredPlugin {
    descriptor: PluginDescriptor,
    factory: Box<dyn PluginFactory>,
}

impl RegisteredPlugin {
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn factory(&self) -> &dyn PluginFactory {
        self.factory.as_ref()
    }
}

/// Registered plugins, iterated in id order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, RegisteredPlugin>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of factories.
    pub fn discover(
        factories: impl IntoIterator<Item = Box<dyn PluginFactory>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for factory in factories {
            registry.register_boxed(factory)?;
        }
        Ok(registry)
    }

    /// Register a plugin factory under the id of its descriptor.
    ///
    /// Fails if the descriptor is invalid or the id is already taken;
    /// the existing registration is left untouched.
    pub fn register(&mut self, factory: impl PluginFactory + 'static) -> Result<(), RegistryError> {
        self.register_boxed(Box::new(factory))
    }

    pub fn register_boxed(&mut self, factory: Box<dyn PluginFactory>) -> Result<(), RegistryError> {
        let descriptor = factory.descriptor();
        schema::validate(&descriptor)?;
        if self.plugins.contains_key(&descriptor.id) {
            return Err(RegistryError::Duplicate(descriptor.id));
        }
        tracing::debug!(plugin_id = %descriptor.id, "registered plugin");
        self.plugins.insert(
            descriptor.id.clone(),
            RegisteredPlugin {
                descriptor,
                factory,
            },
        );
        Ok(())
    }

    /// Look up a plugin by id.
    pub fn get(&self, id: &str) -> Option<&RegisteredPlugin> {
        self.plugins.get(id)
    }

    pub fn descriptor(&self, id: &str) -> Option<&PluginDescriptor> {
        self.get(id).map(RegisteredPlugin::descriptor)
    }

    /// Descriptors of every registered plugin, in id order.
    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.values().map(RegisteredPlugin::descriptor)
    }

    /// Ids of all registered plugins, in id order.
    pub fn list(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    /// Return the number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Return `true` if no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}
