//! Registry of processor declarations keyed by processor type name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::binder::ProcessorDeclaration;
use crate::ValidationError;

/// Thread-safe store of validated [`ProcessorDeclaration`]s.
///
/// Owned by whoever builds it; there is no process-wide instance.
#[derive(Debug, Clone, Default)]
pub struct ProcessorRegistry {
    declarations: Arc<RwLock<HashMap<String, Arc<ProcessorDeclaration>>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores `declaration`, replacing any previous one.
    pub fn register(
        &self,
        declaration: ProcessorDeclaration,
    ) -> Result<Arc<ProcessorDeclaration>, ValidationError> {
        declaration.validate()?;
        let declaration = Arc::new(declaration);
        self.write()
            .insert(declaration.name.clone(), Arc::clone(&declaration));
        debug!(processor = %declaration.name, "registered processor declaration");
        Ok(declaration)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcessorDeclaration>> {
        self.read().get(name).cloned()
    }

    /// Returns the stored declaration, building and registering it on first use.
    pub fn get_or_register<F>(
        &self,
        name: &str,
        build: F,
    ) -> Result<Arc<ProcessorDeclaration>, ValidationError>
    where
        F: FnOnce() -> ProcessorDeclaration,
    {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let declaration = build();
        if declaration.name != name {
            return Err(ValidationError::InvalidDeclaration {
                processor: name.to_owned(),
                reason: format!("builder produced declaration named '{}'", declaration.name),
            });
        }
        declaration.validate()?;

        let mut declarations = self.write();
        let stored = declarations
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(declaration));
        Ok(Arc::clone(stored))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ProcessorDeclaration>> {
        self.write().remove(name)
    }

    /// Registered processor names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ProcessorDeclaration>>> {
        self.declarations
            .read()
            .expect("processor registry lock should not be poisoned")
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ProcessorDeclaration>>> {
        self.declarations
            .write()
            .expect("processor registry lock should not be poisoned")
    }
}
