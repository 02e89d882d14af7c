use pyni_core::PyniError;
use pyni_runtime::ExtensionDescriptor;
use sha2::{Digest, Sha256};

use crate::manifest::ExtensionManifest;
use crate::serde::to_canonical_json_bytes;

/// SHA-256 over the canonical JSON of the descriptor summary.
///
/// Function pointers are not part of the summary, so the same extension built twice hashes the
/// same.
pub fn compute_descriptor_hash(descriptor: &ExtensionDescriptor) -> Result<String, PyniError> {
    let bytes = to_canonical_json_bytes(&descriptor.summary())?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

pub fn compute_manifest_hash(manifest: &ExtensionManifest) -> Result<String, PyniError> {
    let bytes = to_canonical_json_bytes(manifest)?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

pub fn compute_library_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
