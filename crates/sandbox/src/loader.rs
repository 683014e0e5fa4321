//! Resolving entry points to plugin instances.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use enclave_plugin::{Failure, Plugin, PluginInfo};

use crate::error::{LoadFailure, panic_message};

/// Instantiates plugins for a worker session.
pub trait PluginLoader: Send + Sync + 'static {
    /// Create a fresh instance for `info`.
    fn load(&self, info: &PluginInfo) -> Result<Arc<dyn Plugin>, LoadFailure>;
}

type Factory = Arc<dyn Fn(&PluginInfo) -> Result<Arc<dyn Plugin>, Failure> + Send + Sync>;

/// Loader backed by in-memory factories and an archive store.
///
/// Every archive named in a load request must be in the store, and a
/// declared checksum must match the stored one (case-insensitive).
///
/// ```
/// # use enclave_sandbox::FactoryLoader;
/// # struct Echo;
/// # #[async_trait::async_trait]
/// # impl enclave_plugin::Plugin for Echo {
/// #     async fn execute(&self, r: enclave_plugin::ExecuteRequest, _: &enclave_plugin::PluginContext)
/// #         -> Result<enclave_plugin::Payload, enclave_plugin::Failure> { Ok(r.input) }
/// # }
/// let loader = FactoryLoader::new()
///     .with_plugin("echo", || Echo)
///     .with_archive("model.bin", "9a0364b9");
/// assert!(loader.has_entry_point("echo"));
/// ```
#[derive(Default)]
pub struct FactoryLoader {
    factories: HashMap<String, Factory>,
    archives: HashMap<String, String>,
}

impl FactoryLoader {
    /// Empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fallible factory for `entry_point`.
    pub fn with_factory<F, P>(mut self, entry_point: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginInfo) -> Result<P, Failure> + Send + Sync + 'static,
        P: Plugin,
    {
        let factory: Factory =
            Arc::new(move |info| factory(info).map(|p| Arc::new(p) as Arc<dyn Plugin>));
        self.factories.insert(entry_point.into(), factory);
        self
    }

    /// Register an infallible constructor for `entry_point`.
    pub fn with_plugin<F, P>(self, entry_point: impl Into<String>, make: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin,
    {
        self.with_factory(entry_point, move |_| Ok(make()))
    }

    /// Add an archive to the store.
    pub fn with_archive(mut self, id: impl Into<String>, checksum: impl Into<String>) -> Self {
        self.archives.insert(id.into(), checksum.into());
        self
    }

    /// Whether a factory exists for `entry_point`.
    pub fn has_entry_point(&self, entry_point: &str) -> bool {
        self.factories.contains_key(entry_point)
    }

    fn verify_archives(&self, info: &PluginInfo) -> Result<(), LoadFailure> {
        for archive in &info.archives {
            let stored = self
                .archives
                .get(&archive.id)
                .ok_or_else(|| LoadFailure::MissingArchive(archive.id.clone()))?;
            if let Some(expected) = &archive.checksum
                && !expected.eq_ignore_ascii_case(stored)
            {
                return Err(LoadFailure::ChecksumMismatch {
                    archive: archive.id.clone(),
                    expected: expected.clone(),
                    actual: stored.clone(),
                });
            }
        }
        Ok(())
    }
}

impl PluginLoader for FactoryLoader {
    fn load(&self, info: &PluginInfo) -> Result<Arc<dyn Plugin>, LoadFailure> {
        let factory = self
            .factories
            .get(&info.entry_point)
            .ok_or_else(|| LoadFailure::UnknownEntryPoint(info.entry_point.clone()))?;

        self.verify_archives(info)?;

        match catch_unwind(AssertUnwindSafe(|| factory(info))) {
            Ok(Ok(plugin)) => Ok(plugin),
            Ok(Err(failure)) => Err(LoadFailure::Factory(failure)),
            Err(panic) => Err(LoadFailure::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

impl std::fmt::Debug for FactoryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entry_points: Vec<_> = self.factories.keys().collect();
        entry_points.sort();
        f.debug_struct("FactoryLoader")
            .field("entry_points", &entry_points)
            .field("archives", &self.archives.len())
            .finish()
    }
}
