//! Driver registry for dynamic backend resolution.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::provider::Storage;
use stowage_common::{Error, Result};

/// Generic per-disk options handed to a factory.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// Factory function type for creating backends.
pub type DriverFactory = Arc<dyn Fn(&Options) -> Result<Arc<dyn Storage>> + Send + Sync>;

static GLOBAL: Lazy<Arc<DriverRegistry>> =
    Lazy::new(|| Arc::new(DriverRegistry::with_builtin_drivers()));

/// Registry for storage driver factories.
///
/// Maps driver names to factories. The registry only stores factories;
/// backends are constructed by whoever calls [`DriverRegistry::open`] or
/// invokes a looked-up factory. Lookups vastly outnumber registrations, so
/// the table sits behind a reader/writer lock.
pub struct DriverRegistry {
    factories: RwLock<HashMap<String, DriverFactory>>,
}

impl DriverRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with the built-in `local` and `memory` drivers.
    pub fn with_builtin_drivers() -> Self {
        let registry = Self::new();
        registry.insert("local", Arc::new(crate::local::open));
        registry.insert("memory", Arc::new(crate::memory::open));
        registry
    }

    /// Process-wide registry, created with the built-in drivers on first use.
    ///
    /// Adapter crates register their drivers here during startup; managers
    /// built with `Manager::new` resolve against it.
    pub fn global() -> Arc<DriverRegistry> {
        GLOBAL.clone()
    }

    /// Register a driver factory.
    ///
    /// # Errors
    /// - `InvalidArgument` if `name` is empty
    /// - `DuplicateDriver` if `name` is already registered; the existing
    ///   factory is kept
    pub fn register(&self, name: impl Into<String>, factory: DriverFactory) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("driver name cannot be empty".to_string()));
        }

        let mut factories = self.factories.write();
        if factories.contains_key(&name) {
            return Err(Error::DuplicateDriver(name));
        }
        factories.insert(name.clone(), factory);
        drop(factories);

        info!(driver = %name, "storage driver registered");
        Ok(())
    }

    fn insert(&self, name: &str, factory: DriverFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    /// Look up a factory by name.
    ///
    /// # Errors
    /// - `UnknownDriver` if no factory is registered under `name`
    pub fn lookup(&self, name: &str) -> Result<DriverFactory> {
        self.factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDriver(name.to_string()))
    }

    /// Construct a backend with the named driver.
    ///
    /// The factory runs outside the registry lock.
    pub fn open(&self, name: &str, options: &Options) -> Result<Arc<dyn Storage>> {
        let factory = self.lookup(name)?;
        debug!(driver = %name, "opening storage backend");
        factory(options)
    }

    /// Registered driver names.
    pub fn names(&self) -> BTreeSet<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Check if a driver is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use serde_json::json;
    use stowage_common::ErrorKind;

    fn memory_factory() -> DriverFactory {
        Arc::new(|_: &Options| Ok(Arc::new(MemoryStorage::new()) as Arc<dyn Storage>))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = DriverRegistry::new();
        let factory = memory_factory();

        registry.register("test", factory.clone()).unwrap();

        let found = registry.lookup("test").unwrap();
        assert!(Arc::ptr_eq(&found, &factory));

        let backend = found(&Options::new()).unwrap();
        assert_eq!(backend.driver(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = DriverRegistry::new();
        let original = memory_factory();

        registry.register("test", original.clone()).unwrap();

        let err = registry.register("test", memory_factory()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateDriver);

        // The first factory stays bound.
        assert!(Arc::ptr_eq(&registry.lookup("test").unwrap(), &original));
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = DriverRegistry::new();
        let err = registry.register("  ", memory_factory()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_lookup_unknown_fails() {
        let registry = DriverRegistry::new();
        let err = registry.lookup("unknown").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UnknownDriver);
    }

    #[test]
    fn test_names() {
        let registry = DriverRegistry::new();
        registry.register("a", memory_factory()).unwrap();
        registry.register("b", memory_factory()).unwrap();

        let names = registry.names();
        assert!(names.contains("a"));
        assert!(names.contains("b"));
        assert_eq!(names.len(), 2);
        assert!(registry.contains("a"));
        assert!(!registry.contains("c"));
    }

    #[test]
    fn test_builtin_drivers() {
        let registry = DriverRegistry::with_builtin_drivers();
        assert!(registry.contains("local"));
        assert!(registry.contains("memory"));

        let err = registry.register("local", memory_factory()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateDriver);

        let temp = tempfile::TempDir::new().unwrap();
        let options = json!({ "root": temp.path() });
        let backend = registry.open("local", options.as_object().unwrap()).unwrap();
        assert_eq!(backend.driver(), "local");
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        let registry = Arc::new(DriverRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register("race", memory_factory()).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_global_registry_is_shared() {
        let a = DriverRegistry::global();
        let b = DriverRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.contains("local"));
    }
}
