//! Multi-disk manager with lazy backend construction.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use stowage_common::{Error, Result};
use stowage_storage::{DriverRegistry, Instrumented, Storage};

/// Manager for the disks of one configuration.
///
/// Backends are constructed on first use and cached until [`Manager::close`].
/// Concurrent first requests for the same disk construct it once.
pub struct Manager {
    config: ResolvedConfig,
    registry: Arc<DriverRegistry>,
    disks: RwLock<HashMap<String, Arc<dyn Storage>>>,
}

impl Manager {
    /// Create a manager resolving drivers through the global registry.
    pub fn new(config: ResolvedConfig) -> Self {
        Self::with_registry(config, DriverRegistry::global())
    }

    /// Create with custom registry.
    pub fn with_registry(config: ResolvedConfig, registry: Arc<DriverRegistry>) -> Self {
        Self {
            config,
            registry,
            disks: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Get the driver registry.
    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Names of the disks constructed so far, sorted.
    pub fn cached_disks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.disks.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Backend of the default disk.
    pub fn default_disk(&self) -> Result<Arc<dyn Storage>> {
        self.disk("")
    }

    /// Get a disk by name, constructing it on first use.
    ///
    /// An empty `name` selects the configured default.
    ///
    /// # Errors
    /// - `NoDefaultConfigured` if `name` is empty and no default is set
    /// - `DiskNotConfigured` if the disk is absent from the configuration
    /// - `UnknownDriver` if the disk's driver was never registered
    /// - `DiskInit` if the driver factory fails; nothing is cached and the
    ///   next call tries again
    pub fn disk(&self, name: &str) -> Result<Arc<dyn Storage>> {
        let name = if name.is_empty() {
            self.config.default.as_str()
        } else {
            name
        };
        if name.is_empty() {
            return Err(Error::NoDefaultConfigured);
        }

        if let Some(storage) = self.disks.read().get(name) {
            return Ok(storage.clone());
        }

        let mut disks = self.disks.write();
        // Another caller may have won the race for the write lock.
        if let Some(storage) = disks.get(name) {
            return Ok(storage.clone());
        }

        let disk = self
            .config
            .disk(name)
            .ok_or_else(|| Error::DiskNotConfigured(name.to_string()))?;
        let factory = self.registry.lookup(&disk.driver)?;

        debug!(disk = %name, driver = %disk.driver, "constructing disk");
        let backend = factory(&disk.options).map_err(|source| {
            warn!(disk = %name, driver = %disk.driver, error = %source, "disk construction failed");
            Error::DiskInit {
                disk: name.to_string(),
                source: Box::new(source),
            }
        })?;

        let storage: Arc<dyn Storage> = Arc::new(Instrumented::new(name, backend));
        disks.insert(name.to_string(), storage.clone());
        info!(disk = %name, driver = %disk.driver, "disk ready");

        Ok(storage)
    }

    /// Close every constructed disk and empty the cache.
    ///
    /// Every disk is attempted even if some fail; all failures are reported
    /// together. Closing an empty manager is a no-op, and later `disk` calls
    /// construct fresh backends.
    pub async fn close(&self) -> Result<()> {
        let mut drained: Vec<(String, Arc<dyn Storage>)> = self.disks.write().drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        let mut failures = Vec::new();
        for (name, storage) in drained {
            match storage.close().await {
                Ok(()) => debug!(disk = %name, "disk closed"),
                Err(err) => {
                    warn!(disk = %name, error = %err, "failed to close disk");
                    failures.push((name, err));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Close { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use stowage_common::ErrorKind;
    use stowage_storage::{
        ByteStream, DriverFactory, MemoryStorage, Options, UploadOptions, UploadResult,
    };

    fn config() -> ResolvedConfig {
        ResolvedConfig::new("main")
            .with_disk("main", DiskConfig::new("memory"))
            .with_disk("other", DiskConfig::new("memory"))
            .with_disk("ghost", DiskConfig::new("unregistered"))
    }

    fn counting_registry(calls: Arc<AtomicUsize>) -> Arc<DriverRegistry> {
        let registry = DriverRegistry::new();
        let factory: DriverFactory = Arc::new(move |_: &Options| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            Ok(Arc::new(MemoryStorage::new()) as Arc<dyn Storage>)
        });
        registry.register("memory", factory).unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_disk_resolution_errors() {
        let manager = Manager::with_registry(config(), counting_registry(Default::default()));

        let err = manager.disk("missing").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::DiskNotConfigured);

        let err = manager.disk("ghost").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UnknownDriver);

        let manager = Manager::with_registry(
            ResolvedConfig::new("").with_disk("main", DiskConfig::new("memory")),
            counting_registry(Default::default()),
        );
        let err = manager.default_disk().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NoDefaultConfigured);
    }

    #[test]
    fn test_unknown_default_reported_lazily() {
        let manager = Manager::with_registry(
            ResolvedConfig::new("nope"),
            counting_registry(Default::default()),
        );
        let err = manager.disk("").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::DiskNotConfigured);
    }

    #[test]
    fn test_empty_name_is_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = Manager::with_registry(config(), counting_registry(calls.clone()));

        let a = manager.disk("").unwrap();
        let b = manager.disk("main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cached_disks(), vec!["main".to_string()]);
    }

    #[test]
    fn test_concurrent_first_use_constructs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(Manager::with_registry(
            config(),
            counting_registry(calls.clone()),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.disk("other").unwrap())
            })
            .collect();
        let disks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(disks.iter().all(|d| Arc::ptr_eq(d, &disks[0])));
    }

    #[test]
    fn test_factory_failure_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let registry = DriverRegistry::new();
        let factory: DriverFactory = Arc::new(move |_: &Options| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::InvalidArgument("bucket required".to_string()))
            } else {
                Ok(Arc::new(MemoryStorage::new()) as Arc<dyn Storage>)
            }
        });
        registry.register("flaky", factory).unwrap();

        let config = ResolvedConfig::new("d").with_disk("d", DiskConfig::new("flaky"));
        let manager = Manager::with_registry(config, Arc::new(registry));

        let err = manager.disk("d").err().unwrap();
        assert!(matches!(err, Error::DiskInit { ref disk, .. } if disk == "d"));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(manager.cached_disks().is_empty());

        assert!(manager.disk("d").is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disks_are_instrumented() {
        let manager = Manager::with_registry(config(), counting_registry(Default::default()));
        let disk = manager.disk("main").unwrap();

        assert_eq!(disk.driver(), "memory");
        assert!(disk.advanced().is_some());

        let err = disk.download("absent").await.err().unwrap();
        assert!(err.is_not_found());
        assert!(matches!(err, Error::Backend { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_resets_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = Manager::with_registry(config(), counting_registry(calls.clone()));

        let first = manager.disk("main").unwrap();
        manager.disk("other").unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();
        assert!(manager.cached_disks().is_empty());

        let err = first.exists("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);

        let second = manager.disk("main").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct FailingClose;

    #[async_trait]
    impl Storage for FailingClose {
        fn driver(&self) -> &str {
            "failing"
        }

        async fn upload(
            &self,
            key: &str,
            _data: ByteStream,
            _options: UploadOptions,
        ) -> Result<UploadResult> {
            Err(Error::NotImplemented(key.to_string()))
        }

        async fn download(&self, key: &str) -> Result<ByteStream> {
            Err(Error::NotFound(key.to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn exists(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn public_url(&self, key: &str) -> Result<String> {
            Err(Error::NotImplemented(key.to_string()))
        }

        async fn close(&self) -> Result<()> {
            Err(Error::Storage("connection pool stuck".to_string()))
        }
    }

    #[tokio::test]
    async fn test_close_attempts_every_disk() {
        let registry = DriverRegistry::with_builtin_drivers();
        let factory: DriverFactory =
            Arc::new(|_: &Options| Ok(Arc::new(FailingClose) as Arc<dyn Storage>));
        registry.register("failing", factory).unwrap();

        let config = ResolvedConfig::new("ok")
            .with_disk("ok", DiskConfig::new("memory"))
            .with_disk("bad1", DiskConfig::new("failing"))
            .with_disk("bad2", DiskConfig::new("failing"));
        let manager = Manager::with_registry(config, Arc::new(registry));

        let ok = manager.disk("ok").unwrap();
        manager.disk("bad1").unwrap();
        manager.disk("bad2").unwrap();

        let err = manager.close().await.unwrap_err();
        match &err {
            Error::Close { failures } => {
                let names: Vec<_> = failures.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["bad1", "bad2"]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("bad1"));

        // The healthy disk was closed despite the failures.
        let err = ok.exists("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert!(manager.cached_disks().is_empty());
    }
}
