//! [`ModuleRegistry`] – engine name → loaded module.
//!
//! The registry key and the engine's own name must agree; [`register`]
//! refuses a module whose name differs from the key it is filed under.
//!
//! [`register`]: ModuleRegistry::register

use std::collections::HashMap;

use crate::capability::LoadedModule;
use crate::error::LinkError;

#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, LoadedModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File `module` under `key`, replacing (and dropping) any previous
    /// module with that key.
    ///
    /// # Errors
    ///
    /// [`LinkError::Fatal`] when the module's name is not `key`.
    pub fn register(&mut self, key: &str, module: LoadedModule) -> Result<(), LinkError> {
        if module.name() != key {
            return Err(LinkError::Fatal(format!(
                "entry point for '{key}' reports name '{}'",
                module.name()
            )));
        }
        self.modules.insert(key.to_string(), module);
        Ok(())
    }

    /// Drop the module filed under `key`. Returns whether one was present.
    pub fn unload(&mut self, key: &str) -> bool {
        self.modules.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.modules.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut LoadedModule> {
        self.modules.get_mut(key)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
