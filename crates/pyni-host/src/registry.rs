use std::collections::btree_map::{BTreeMap, Entry};
#[cfg(feature = "dynamic")]
use std::path::Path;
use std::sync::Arc;

use pyni_core::{ErrorInfo, LayoutKind, PyniError};
use pyni_runtime::{EntryPointFn, ExtensionDescriptor, LoadedExtension, Runtime};
use serde::{Deserialize, Serialize};

use crate::hash::compute_descriptor_hash;
use crate::loader::read_entry_descriptor;
use crate::manifest::ExtensionManifest;
use crate::serde::to_canonical_json_bytes;

/// Registry record of one loaded extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub version: String,
    pub license: String,
    pub layout: LayoutKind,
    pub requested_vtable_version: u32,
    pub negotiated_vtable_version: u32,
    /// Whether calls go through the debug interception layer.
    pub checked: bool,
    pub descriptor_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_hash: Option<String>,
}

struct Registered {
    entry: RegistryEntry,
    extension: Arc<LoadedExtension>,
    // Dropped after `extension`: the library's code must outlive every pointer into it.
    #[cfg(feature = "dynamic")]
    _library: Option<libloading::Library>,
}

fn registry_error(code: &str, message: impl Into<String>, name: &str) -> PyniError {
    PyniError::Load(ErrorInfo::new(code, message).with_context("extension", name))
}

/// Extensions loaded into one runtime, keyed by name.
pub struct ExtensionRegistry {
    runtime: Runtime,
    loaded: BTreeMap<String, Registered>,
}

impl ExtensionRegistry {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            loaded: BTreeMap::new(),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Loads an extension linked into the host binary.
    pub fn register(
        &mut self,
        manifest: &ExtensionManifest,
        descriptor: ExtensionDescriptor,
    ) -> Result<RegistryEntry, PyniError> {
        self.insert(manifest, descriptor, None, |_| {})
    }

    /// Loads an extension through its entry point.
    ///
    /// # Safety
    ///
    /// `entry` must return null or a descriptor whose function pointers stay valid while the
    /// extension is registered.
    pub unsafe fn register_entry(
        &mut self,
        manifest: &ExtensionManifest,
        entry: EntryPointFn,
    ) -> Result<RegistryEntry, PyniError> {
        let descriptor = read_entry_descriptor(entry)?;
        self.register(manifest, descriptor)
    }

    /// Reads `extension.toml` at `manifest_path`, opens the library it names and registers it.
    ///
    /// # Safety
    ///
    /// The library runs its initialisers on load and must be a PyNI extension.
    #[cfg(feature = "dynamic")]
    pub unsafe fn load_library(&mut self, manifest_path: &Path) -> Result<RegistryEntry, PyniError> {
        use crate::hash::compute_library_hash;
        use crate::loader::{load_extension_manifest, open_library, resolve_library_path};

        let manifest = load_extension_manifest(manifest_path)?;
        self.ensure_vacant(&manifest.name)?;
        let path = resolve_library_path(manifest_path, &manifest);
        let bytes = std::fs::read(&path).map_err(|err| {
            PyniError::Serde(
                ErrorInfo::new("pyni_host.read_library", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        let library_hash = compute_library_hash(&bytes);
        let opened = open_library(&path)?;
        let descriptor = read_entry_descriptor(opened.entry)?;
        let library = opened.library;
        self.insert(&manifest, descriptor, Some(library_hash), move |registered| {
            registered._library = Some(library);
        })
    }

    fn ensure_vacant(&self, name: &str) -> Result<(), PyniError> {
        if self.loaded.contains_key(name) {
            return Err(registry_error(
                "pyni_host.duplicate_extension",
                format!("extension `{name}` is already loaded"),
                name,
            ));
        }
        Ok(())
    }

    fn insert(
        &mut self,
        manifest: &ExtensionManifest,
        descriptor: ExtensionDescriptor,
        library_hash: Option<String>,
        attach: impl FnOnce(&mut Registered),
    ) -> Result<RegistryEntry, PyniError> {
        manifest.validate()?;
        self.ensure_vacant(&manifest.name)?;
        manifest.check_descriptor(&descriptor)?;
        let descriptor_hash = compute_descriptor_hash(&descriptor)?;
        let extension = self.runtime.load(descriptor)?;
        let negotiated = extension.negotiated();
        let entry = RegistryEntry {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            license: manifest.license.clone(),
            layout: negotiated.layout,
            requested_vtable_version: negotiated.requested,
            negotiated_vtable_version: negotiated.version,
            checked: extension.is_checked(),
            descriptor_hash,
            library_hash,
        };
        let mut registered = Registered {
            entry: entry.clone(),
            extension,
            #[cfg(feature = "dynamic")]
            _library: None,
        };
        attach(&mut registered);
        tracing::info!(
            extension = %entry.name,
            version = %entry.version,
            negotiated = entry.negotiated_vtable_version,
            hash = %entry.descriptor_hash,
            "extension registered"
        );
        self.loaded.insert(manifest.name.clone(), registered);
        Ok(entry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedExtension>> {
        self.loaded
            .get(name)
            .map(|registered| Arc::clone(&registered.extension))
    }

    pub fn entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.loaded.get(name).map(|registered| &registered.entry)
    }

    /// Entries sorted by name.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.loaded
            .values()
            .map(|registered| registered.entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    /// Removes an extension and releases its module state. Fails while anyone else still holds
    /// the loaded extension.
    pub fn unload(&mut self, name: &str) -> Result<RegistryEntry, PyniError> {
        let Entry::Occupied(slot) = self.loaded.entry(name.to_string()) else {
            return Err(registry_error(
                "pyni_host.unknown_extension",
                format!("extension `{name}` is not loaded"),
                name,
            ));
        };
        if Arc::strong_count(&slot.get().extension) > 1 {
            return Err(registry_error(
                "pyni_host.extension_in_use",
                format!("extension `{name}` is still referenced"),
                name,
            ));
        }
        let registered = slot.remove();
        self.runtime.unload(&registered.extension);
        Ok(registered.entry)
    }

    /// Canonical JSON array of all entries.
    pub fn snapshot_json(&self) -> Result<Vec<u8>, PyniError> {
        to_canonical_json_bytes(&self.entries())
    }
}
