//! Load-time ABI version negotiation.

use std::collections::BTreeSet;

use pyni_core::{AbiWindow, LayoutKind, PyniError};
use serde::{Deserialize, Serialize};

use crate::descriptor::ExtensionDescriptor;
use crate::vtable::{slot_count, LATEST_VERSION};

/// Build tag a version-specific extension must have been compiled against.
pub const HOST_ABI_TAG: u64 = host_tag(env!("CARGO_PKG_VERSION").as_bytes(), LATEST_VERSION);

const fn host_tag(bytes: &[u8], version: u32) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash ^ version as u64
}

/// What a host is able to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOffer {
    pub window: AbiWindow,
    pub versions: BTreeSet<u32>,
    pub max_struct_version: u32,
    pub host_tag: u64,
}

/// Outcome of a successful negotiation; fixed for the lifetime of the loaded extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NegotiatedVTable {
    pub version: u32,
    pub requested: u32,
    pub slot_count: usize,
    pub layout: LayoutKind,
}

fn reject(descriptor: &ExtensionDescriptor, reason: String) -> PyniError {
    PyniError::incompatible_abi(reason)
        .with_context("extension", descriptor.name.clone())
        .with_context(
            "requested_vtable_version",
            descriptor.requested_vtable_version.to_string(),
        )
}

/// Picks the table version an extension will see, or rejects the extension.
///
/// The requested version is served exactly when offered; otherwise the lowest offered version
/// that extends it additively is chosen.
pub fn negotiate(
    offer: &HostOffer,
    descriptor: &ExtensionDescriptor,
) -> Result<NegotiatedVTable, PyniError> {
    if descriptor.struct_version == 0 || descriptor.struct_version > offer.max_struct_version {
        return Err(reject(
            descriptor,
            format!(
                "descriptor struct version {} is not understood (host reads up to {})",
                descriptor.struct_version, offer.max_struct_version
            ),
        ));
    }
    if !offer.window.serves(descriptor.window) {
        return Err(reject(
            descriptor,
            format!(
                "extension built for ABI {} cannot be served by host ABI {}",
                descriptor.window, offer.window
            ),
        ));
    }
    let requested = descriptor.requested_vtable_version;
    let highest = offer.versions.iter().next_back().copied().unwrap_or(0);
    if requested == 0 || requested > highest {
        return Err(reject(
            descriptor,
            format!("requested table version {requested} is not offered (highest {highest})"),
        ));
    }
    let wanted_slots = slot_count(requested);
    let version = match descriptor.layout {
        LayoutKind::VersionSpecific => {
            if descriptor.host_tag != offer.host_tag {
                return Err(reject(
                    descriptor,
                    format!(
                        "version-specific extension was built for host tag {:#x}, this host is {:#x}",
                        descriptor.host_tag, offer.host_tag
                    ),
                ));
            }
            if !offer.versions.contains(&requested) || requested != LATEST_VERSION {
                return Err(reject(
                    descriptor,
                    format!("version-specific extension needs exactly table version {requested}"),
                ));
            }
            requested
        }
        LayoutKind::Universal => offer
            .versions
            .range(requested..)
            .copied()
            .find(|candidate| slot_count(*candidate) >= wanted_slots)
            .ok_or_else(|| {
                reject(
                    descriptor,
                    format!("no offered table version extends version {requested}"),
                )
            })?,
    };
    Ok(NegotiatedVTable {
        version,
        requested,
        slot_count: slot_count(version),
        layout: descriptor.layout,
    })
}
