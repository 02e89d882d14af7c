//! Narrow interface to the host object model.
//!
//! The runtime never owns objects. It holds one reference per open handle scope through
//! [`ObjectSpace::retain`] and gives it back through [`ObjectSpace::release`]; whether those are
//! reference-count updates, root registrations for a tracing collector, or no-ops is the object
//! model's business.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Direct reference to a host object, as understood by the object model.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef(u64);

impl ObjectRef {
    /// Creates a reference from its raw representation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw representation.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// Legacy direct object reference used by the old calling convention.
///
/// Carries the same bits as an [`ObjectRef`]; `0` is the legacy failure value.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LegacyRef(u64);

impl LegacyRef {
    /// The legacy failure value.
    pub const NULL: LegacyRef = LegacyRef(0);

    /// Wraps an object reference for legacy code.
    pub const fn from_object(obj: ObjectRef) -> Self {
        Self(obj.as_raw())
    }

    /// Returns the object reference, or `None` for the failure value.
    pub fn object(self) -> Option<ObjectRef> {
        (self.0 != 0).then_some(ObjectRef::from_raw(self.0))
    }

    /// Whether this is the failure value.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Built-in object kinds the runtime can convert to specialised handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// The none singleton.
    None,
    /// Integer object.
    Int,
    /// Floating point object.
    Float,
    /// Built-in list.
    List,
    /// Immutable byte string.
    Bytes,
    /// Anything the runtime has no specialised handling for.
    Other,
}

/// Object model collaborator consumed by the runtime.
///
/// Constructors return a new reference owned by the caller. Accessors that return objects
/// (`list_item`) also return a new reference.
pub trait ObjectSpace: Send + Sync {
    /// Adds one reference to `obj`.
    fn retain(&self, obj: ObjectRef);

    /// Drops one reference to `obj`.
    fn release(&self, obj: ObjectRef);

    /// Returns the built-in kind of `obj`, or `None` if the reference is dead.
    fn kind(&self, obj: ObjectRef) -> Option<ObjectKind>;

    /// Returns a new reference to the none singleton.
    fn none(&self) -> ObjectRef;

    /// Allocates an integer.
    fn new_int(&self, value: i64) -> ObjectRef;

    /// Allocates a float.
    fn new_float(&self, value: f64) -> ObjectRef;

    /// Allocates an empty list.
    fn new_list(&self) -> ObjectRef;

    /// Allocates a byte string holding a copy of `data`.
    fn new_bytes(&self, data: &[u8]) -> ObjectRef;

    /// Reads an integer value.
    fn int_value(&self, obj: ObjectRef) -> Option<i64>;

    /// Reads a float value. Integers are not coerced.
    fn float_value(&self, obj: ObjectRef) -> Option<f64>;

    /// Appends `item` to `list`, taking an additional reference to `item`.
    fn list_append(&self, list: ObjectRef, item: ObjectRef) -> bool;

    /// Returns the length of a list.
    fn list_len(&self, list: ObjectRef) -> Option<usize>;

    /// Returns a new reference to the item at `index`.
    fn list_item(&self, list: ObjectRef, index: usize) -> Option<ObjectRef>;

    /// Returns the shared contents of a byte string.
    fn bytes_data(&self, obj: ObjectRef) -> Option<Arc<[u8]>>;
}
