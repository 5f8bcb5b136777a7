//! Name-keyed registries for protocol and authenticator modules.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

/// Modules registered under a name and looked up by it.
pub struct PluginRegistry<T: ?Sized> {
    modules: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> PluginRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Register a module, replacing any module with the same name.
    ///
    /// Returns the replaced module.
    pub fn register(&self, name: impl Into<String>, module: Arc<T>) -> Option<Arc<T>> {
        let name = name.into();
        tracing::debug!(module = %name, "registering module");
        self.modules.write().insert(name, module)
    }

    /// Look a module up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.modules.read().get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl<T: ?Sized> Default for PluginRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for PluginRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("modules", &self.names())
            .finish()
    }
}
