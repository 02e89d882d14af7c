use std::path::PathBuf;

use pyni_core::{ErrorInfo, LayoutKind, PyniError};
use pyni_runtime::ExtensionDescriptor;
use serde::{Deserialize, Serialize};

fn default_layout() -> LayoutKind {
    LayoutKind::Universal
}

/// `extension.toml` shipped next to an extension library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub name: String,
    pub version: String,
    /// Shared library, relative to the manifest's directory unless absolute.
    pub library: PathBuf,
    pub requested_vtable_version: u32,
    #[serde(default = "default_layout")]
    pub layout: LayoutKind,
    pub license: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn manifest_error(code: &str, message: impl Into<String>) -> PyniError {
    PyniError::Load(ErrorInfo::new(code, message))
}

impl ExtensionManifest {
    pub fn validate(&self) -> Result<(), PyniError> {
        if self.name.trim().is_empty() {
            return Err(manifest_error(
                "pyni_host.manifest_name",
                "extension manifest missing name",
            ));
        }
        if self.version.trim().is_empty() {
            return Err(manifest_error(
                "pyni_host.manifest_version",
                "extension manifest missing version",
            )
            .with_context("extension", self.name.clone()));
        }
        if self.library.as_os_str().is_empty() {
            return Err(manifest_error(
                "pyni_host.manifest_library",
                "extension manifest missing library path",
            )
            .with_context("extension", self.name.clone()));
        }
        if self.requested_vtable_version == 0 {
            return Err(manifest_error(
                "pyni_host.manifest_vtable_version",
                "requested_vtable_version must be at least 1",
            )
            .with_context("extension", self.name.clone()));
        }
        if self.license.trim().is_empty() {
            return Err(manifest_error(
                "pyni_host.manifest_license",
                "extension manifest missing license",
            )
            .with_context("extension", self.name.clone()));
        }
        Ok(())
    }

    /// Fails when the library's own descriptor disagrees with what the manifest promised.
    pub fn check_descriptor(&self, descriptor: &ExtensionDescriptor) -> Result<(), PyniError> {
        let disagree = |field: &str, manifest: String, library: String| {
            manifest_error(
                "pyni_host.manifest_mismatch",
                format!("manifest and library disagree on {field}"),
            )
            .with_context("extension", self.name.clone())
            .with_context("manifest", manifest)
            .with_context("library", library)
        };
        if descriptor.name != self.name {
            return Err(disagree("name", self.name.clone(), descriptor.name.clone()));
        }
        if descriptor.requested_vtable_version != self.requested_vtable_version {
            return Err(disagree(
                "requested_vtable_version",
                self.requested_vtable_version.to_string(),
                descriptor.requested_vtable_version.to_string(),
            ));
        }
        if descriptor.layout != self.layout {
            return Err(disagree(
                "layout",
                format!("{:?}", self.layout),
                format!("{:?}", descriptor.layout),
            ));
        }
        Ok(())
    }
}
