use std::fs;
use std::path::{Path, PathBuf};

use pyni_core::{ErrorInfo, PyniError};
use pyni_runtime::{EntryPointFn, ExtensionDescriptor};

use crate::manifest::ExtensionManifest;

pub fn load_extension_manifest(path: &Path) -> Result<ExtensionManifest, PyniError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        PyniError::Serde(
            ErrorInfo::new(
                "pyni_host.read_manifest",
                format!("failed to read manifest: {err}"),
            )
            .with_context("path", path.display().to_string()),
        )
    })?;
    let manifest: ExtensionManifest = toml::from_str(&contents).map_err(|err| {
        PyniError::Serde(
            ErrorInfo::new("pyni_host.parse_manifest", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })?;
    manifest
        .validate()
        .map_err(|err| err.with_context("path", path.display().to_string()))?;
    Ok(manifest)
}

/// Library path of `manifest`, relative paths taken from the manifest's directory.
pub fn resolve_library_path(manifest_path: &Path, manifest: &ExtensionManifest) -> PathBuf {
    if manifest.library.is_absolute() {
        return manifest.library.clone();
    }
    manifest_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(&manifest.library)
}

/// Calls an extension entry point and copies out its descriptor.
///
/// # Safety
///
/// `entry` must return null or a descriptor valid for the duration of the call.
pub unsafe fn read_entry_descriptor(entry: EntryPointFn) -> Result<ExtensionDescriptor, PyniError> {
    ExtensionDescriptor::from_raw(entry())
}

#[cfg(feature = "dynamic")]
pub(crate) struct OpenedLibrary {
    pub library: libloading::Library,
    pub entry: EntryPointFn,
}

/// Opens a shared library and resolves its entry symbol.
///
/// # Safety
///
/// Loading a library runs its initialisers; the library must be a PyNI extension.
#[cfg(feature = "dynamic")]
pub(crate) unsafe fn open_library(path: &Path) -> Result<OpenedLibrary, PyniError> {
    use pyni_runtime::ENTRY_SYMBOL;

    let library = libloading::Library::new(path).map_err(|err| {
        PyniError::Load(
            ErrorInfo::new("pyni_host.open_library", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })?;
    let entry = {
        let symbol: libloading::Symbol<EntryPointFn> =
            library.get(ENTRY_SYMBOL).map_err(|err| {
                PyniError::Load(
                    ErrorInfo::new("pyni_host.missing_entry", err.to_string())
                        .with_context("path", path.display().to_string())
                        .with_hint("extensions export `pyni_extension_entry`"),
                )
            })?;
        *symbol
    };
    tracing::debug!(path = %path.display(), "extension library opened");
    Ok(OpenedLibrary { library, entry })
}
