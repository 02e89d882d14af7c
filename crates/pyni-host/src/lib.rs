//! Extension manifests, dynamic loading and the loaded-extension registry of a PyNI host.

mod hash;
mod loader;
mod manifest;
mod registry;
mod serde;

pub use hash::{compute_descriptor_hash, compute_library_hash, compute_manifest_hash};
pub use loader::{load_extension_manifest, read_entry_descriptor, resolve_library_path};
pub use manifest::ExtensionManifest;
pub use registry::{ExtensionRegistry, RegistryEntry};
pub use serde::{from_json_slice, to_canonical_json_bytes};
