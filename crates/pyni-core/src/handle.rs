//! Opaque handle values exchanged across the ABI boundary.
//!
//! A handle is a single `u64`. Bit 63 carries the kind (set for heap handles), bits 32..63 carry
//! a generation that is never zero, and the low 32 bits carry a slot index. The all-zero value is
//! [`Handle::NULL`] and signals failure at the C boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

const KIND_BIT: u64 = 1 << 63;
const GENERATION_MASK: u64 = 0x7FFF_FFFF;
const INDEX_MASK: u64 = 0xFFFF_FFFF;

/// Largest generation value representable in a handle.
pub const MAX_GENERATION: u32 = GENERATION_MASK as u32;

/// Scope family of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    /// Valid for the duration of one call frame.
    Local,
    /// Bound to host-managed storage, independent of any frame.
    Heap,
}

/// Opaque reference to a host-managed object.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    /// The failure sentinel.
    pub const NULL: Handle = Handle(0);

    /// Packs a handle from its components. `generation` must be non-zero.
    pub fn pack(kind: HandleKind, generation: u32, index: u32) -> Self {
        debug_assert!(generation != 0 && generation <= MAX_GENERATION);
        let kind_bit = match kind {
            HandleKind::Local => 0,
            HandleKind::Heap => KIND_BIT,
        };
        Handle(kind_bit | ((generation as u64 & GENERATION_MASK) << 32) | index as u64)
    }

    /// Rebuilds a handle from the raw value seen by native code.
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Returns the raw value passed across the boundary.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Whether this is the failure sentinel.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Scope family encoded in the handle.
    pub fn kind(self) -> HandleKind {
        if self.0 & KIND_BIT != 0 {
            HandleKind::Heap
        } else {
            HandleKind::Local
        }
    }

    /// Generation encoded in the handle.
    pub fn generation(self) -> u32 {
        ((self.0 >> 32) & GENERATION_MASK) as u32
    }

    /// Slot index encoded in the handle.
    pub fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Handle(NULL)");
        }
        write!(
            f,
            "Handle({:?} g{} #{})",
            self.kind(),
            self.generation(),
            self.index()
        )
    }
}

/// A local handle already known to reference a built-in list.
///
/// Produced by the list conversion; a failed conversion is an ordinary `None`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListHandle(Handle);

impl ListHandle {
    /// Wraps a handle that has been checked to reference a list.
    pub fn assume_list(handle: Handle) -> Self {
        ListHandle(handle)
    }

    /// Returns the generic handle.
    pub fn handle(self) -> Handle {
        self.0
    }
}

/// Advances a generation counter, skipping zero and wrapping within the encodable range.
pub fn next_generation(current: u32) -> u32 {
    if current >= MAX_GENERATION {
        1
    } else {
        current + 1
    }
}
