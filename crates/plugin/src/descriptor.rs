//! Worker descriptors and load requests.

use serde::{Deserialize, Serialize};

use crate::{DescriptorError, Payload};

/// An auxiliary archive loaded alongside the worker's entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Archive identifier.
    pub id: String,
    /// Expected checksum, verified by the loader when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ArchiveInfo {
    /// Archive without a declared checksum.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            checksum: None,
        }
    }

    /// Declare the expected checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Logical identity of a worker.
///
/// Immutable once built:
///
/// ```
/// use enclave_plugin::{ArchiveInfo, WorkerDescriptor};
///
/// let descriptor = WorkerDescriptor::builder("w1", "echo")
///     .archive(ArchiveInfo::new("model.bin").with_checksum("9a0364b9"))
///     .build()
///     .unwrap();
///
/// assert_eq!(descriptor.worker_id(), "w1");
/// assert_eq!(descriptor.archives().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    worker_id: String,
    entry_point: String,
    #[serde(default)]
    archives: Vec<ArchiveInfo>,
    #[serde(default)]
    init_data: Payload,
}

impl WorkerDescriptor {
    /// Start building a descriptor.
    pub fn builder(
        worker_id: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> WorkerDescriptorBuilder {
        WorkerDescriptorBuilder {
            worker_id: worker_id.into(),
            entry_point: entry_point.into(),
            archives: Vec::new(),
            init_data: Payload::new(),
        }
    }

    /// Identity used for endpoint resolution.
    #[inline]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Implementation the session instantiates on load.
    #[inline]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Auxiliary archives, in load order.
    #[inline]
    pub fn archives(&self) -> &[ArchiveInfo] {
        &self.archives
    }

    /// Data handed to every plugin context created for this worker.
    #[inline]
    pub fn init_data(&self) -> &Payload {
        &self.init_data
    }

    /// Load request for a plugin instance named `name`.
    pub fn plugin_info(&self, name: impl Into<String>) -> PluginInfo {
        PluginInfo {
            name: name.into(),
            entry_point: self.entry_point.clone(),
            archives: self.archives.clone(),
            init_data: self.init_data.clone(),
        }
    }
}

/// Builder for [`WorkerDescriptor`].
#[derive(Debug)]
pub struct WorkerDescriptorBuilder {
    worker_id: String,
    entry_point: String,
    archives: Vec<ArchiveInfo>,
    init_data: Payload,
}

impl WorkerDescriptorBuilder {
    /// Append an auxiliary archive.
    pub fn archive(mut self, archive: ArchiveInfo) -> Self {
        self.archives.push(archive);
        self
    }

    /// Set the init data.
    pub fn init_data(mut self, init_data: Payload) -> Self {
        self.init_data = init_data;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<WorkerDescriptor, DescriptorError> {
        if self.worker_id.trim().is_empty() {
            return Err(DescriptorError::MissingField { field: "worker_id" });
        }
        if self.entry_point.trim().is_empty() {
            return Err(DescriptorError::MissingField {
                field: "entry_point",
            });
        }
        for (i, archive) in self.archives.iter().enumerate() {
            if archive.id.is_empty() {
                return Err(DescriptorError::MissingField { field: "archive.id" });
            }
            if self.archives[..i].iter().any(|a| a.id == archive.id) {
                return Err(DescriptorError::DuplicateArchive(archive.id.clone()));
            }
        }

        Ok(WorkerDescriptor {
            worker_id: self.worker_id,
            entry_point: self.entry_point,
            archives: self.archives,
            init_data: self.init_data,
        })
    }
}

/// Load request: which implementation to instantiate, under which name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Instance name used by execute/unload/check_state.
    pub name: String,
    /// Implementation to instantiate.
    pub entry_point: String,
    /// Auxiliary archives.
    #[serde(default)]
    pub archives: Vec<ArchiveInfo>,
    /// Read-only data exposed through the plugin context.
    #[serde(default)]
    pub init_data: Payload,
}
