//! Version descriptors used by ABI negotiation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Major/minor compatibility window shared by a host and the extensions it can serve.
///
/// Extensions built against the same major and an equal or older minor are servable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AbiWindow {
    /// Incremented for incompatible changes of the table shape.
    pub major: u16,
    /// Incremented for additive changes.
    pub minor: u16,
}

impl AbiWindow {
    /// Creates a new window descriptor.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether a host exposing `self` can serve an extension built against `requested`.
    pub fn serves(&self, requested: AbiWindow) -> bool {
        self.major == requested.major && requested.minor <= self.minor
    }
}

impl Default for AbiWindow {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl fmt::Display for AbiWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Which binary layout an extension was compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Calls indirect through the context's VTable; portable across hosts.
    Universal,
    /// Calls bound at build time to one host build; the context is inert.
    VersionSpecific,
}

impl LayoutKind {
    /// Raw tag used in `#[repr(C)]` descriptors.
    pub fn as_raw(self) -> u32 {
        match self {
            LayoutKind::Universal => 0,
            LayoutKind::VersionSpecific => 1,
        }
    }

    /// Decodes the raw descriptor tag.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(LayoutKind::Universal),
            1 => Some(LayoutKind::VersionSpecific),
            _ => None,
        }
    }
}
