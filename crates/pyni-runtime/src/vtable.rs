//! Versioned dispatch table.
//!
//! Slot order is part of the ABI: new functions are only ever appended, each tagged with the
//! table version that introduced it. A table built for version `N` fills the slots introduced at
//! or before `N` and leaves the rest empty.

use pyni_core::{Handle, LegacyRef};
use serde::{Deserialize, Serialize};

use crate::buffer::RawBuffer;
use crate::context::ContextPtr;
use crate::thunks::{direct, universal};

/// Newest table version this build can construct.
pub const LATEST_VERSION: u32 = 3;

pub type DupFn = unsafe extern "C" fn(ContextPtr, Handle) -> Handle;
pub type CloseFn = unsafe extern "C" fn(ContextPtr, Handle) -> i32;
pub type GetNoneFn = unsafe extern "C" fn(ContextPtr) -> Handle;
pub type LongFromI64Fn = unsafe extern "C" fn(ContextPtr, i64) -> Handle;
pub type LongAsI64Fn = unsafe extern "C" fn(ContextPtr, Handle) -> i64;
pub type FloatFromF64Fn = unsafe extern "C" fn(ContextPtr, f64) -> Handle;
pub type FloatAsF64Fn = unsafe extern "C" fn(ContextPtr, Handle) -> f64;
pub type ErrOccurredFn = unsafe extern "C" fn(ContextPtr) -> i32;
pub type ErrClearFn = unsafe extern "C" fn(ContextPtr);
pub type ErrSetMessageFn = unsafe extern "C" fn(ContextPtr, *const u8, usize);
pub type FromLegacyFn = unsafe extern "C" fn(ContextPtr, LegacyRef) -> Handle;
pub type AsLegacyFn = unsafe extern "C" fn(ContextPtr, Handle) -> LegacyRef;
pub type ListNewFn = unsafe extern "C" fn(ContextPtr) -> Handle;
pub type ListAppendFn = unsafe extern "C" fn(ContextPtr, Handle, Handle) -> i32;
pub type ListCheckFn = unsafe extern "C" fn(ContextPtr, Handle) -> i32;
pub type ListLenFn = unsafe extern "C" fn(ContextPtr, Handle) -> isize;
pub type ListGetItemFn = unsafe extern "C" fn(ContextPtr, Handle, isize) -> Handle;
pub type FieldStoreFn = unsafe extern "C" fn(ContextPtr, Handle, u32, Handle) -> Handle;
pub type FieldLoadFn = unsafe extern "C" fn(ContextPtr, Handle) -> Handle;
pub type BytesFromSliceFn = unsafe extern "C" fn(ContextPtr, *const u8, usize) -> Handle;
pub type BufferAcquireFn = unsafe extern "C" fn(ContextPtr, Handle, *mut RawBuffer) -> i32;
pub type BufferReleaseFn = unsafe extern "C" fn(ContextPtr, *mut RawBuffer) -> i32;
pub type BytesFromBufferFn = unsafe extern "C" fn(ContextPtr, *const RawBuffer) -> Handle;

/// API functions in slot order.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionId {
    Dup,
    Close,
    GetNone,
    LongFromI64,
    LongAsI64,
    FloatFromF64,
    FloatAsF64,
    ErrOccurred,
    ErrClear,
    ErrSetMessage,
    FromLegacy,
    AsLegacy,
    ListNew,
    ListAppend,
    ListCheck,
    ListLen,
    ListGetItem,
    FieldStore,
    FieldLoad,
    BytesFromSlice,
    BufferAcquire,
    BufferRelease,
    BytesFromBuffer,
}

impl FunctionId {
    pub const ALL: [FunctionId; 23] = [
        FunctionId::Dup,
        FunctionId::Close,
        FunctionId::GetNone,
        FunctionId::LongFromI64,
        FunctionId::LongAsI64,
        FunctionId::FloatFromF64,
        FunctionId::FloatAsF64,
        FunctionId::ErrOccurred,
        FunctionId::ErrClear,
        FunctionId::ErrSetMessage,
        FunctionId::FromLegacy,
        FunctionId::AsLegacy,
        FunctionId::ListNew,
        FunctionId::ListAppend,
        FunctionId::ListCheck,
        FunctionId::ListLen,
        FunctionId::ListGetItem,
        FunctionId::FieldStore,
        FunctionId::FieldLoad,
        FunctionId::BytesFromSlice,
        FunctionId::BufferAcquire,
        FunctionId::BufferRelease,
        FunctionId::BytesFromBuffer,
    ];

    pub fn slot(self) -> usize {
        self as usize
    }

    /// Table version that appended this slot.
    pub fn introduced_in(self) -> u32 {
        match self {
            FunctionId::Dup
            | FunctionId::Close
            | FunctionId::GetNone
            | FunctionId::LongFromI64
            | FunctionId::LongAsI64
            | FunctionId::FloatFromF64
            | FunctionId::FloatAsF64
            | FunctionId::ErrOccurred
            | FunctionId::ErrClear
            | FunctionId::ErrSetMessage
            | FunctionId::FromLegacy
            | FunctionId::AsLegacy => 1,
            FunctionId::ListNew
            | FunctionId::ListAppend
            | FunctionId::ListCheck
            | FunctionId::ListLen
            | FunctionId::ListGetItem
            | FunctionId::FieldStore
            | FunctionId::FieldLoad => 2,
            FunctionId::BytesFromSlice
            | FunctionId::BufferAcquire
            | FunctionId::BufferRelease
            | FunctionId::BytesFromBuffer => 3,
        }
    }
}

/// Number of slots a table of `version` exposes.
pub fn slot_count(version: u32) -> usize {
    FunctionId::ALL
        .iter()
        .filter(|id| id.introduced_in() <= version)
        .count()
}

/// Untyped function pointer produced by [`VTable::resolve`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFn(*const ());

impl RawFn {
    pub fn as_ptr(self) -> *const () {
        self.0
    }
}

/// Ordered table of API entry points.
#[repr(C)]
#[derive(Debug)]
pub struct VTable {
    pub version: u32,
    pub slot_count: u32,
    pub dup: Option<DupFn>,
    pub close: Option<CloseFn>,
    pub get_none: Option<GetNoneFn>,
    pub long_from_i64: Option<LongFromI64Fn>,
    pub long_as_i64: Option<LongAsI64Fn>,
    pub float_from_f64: Option<FloatFromF64Fn>,
    pub float_as_f64: Option<FloatAsF64Fn>,
    pub err_occurred: Option<ErrOccurredFn>,
    pub err_clear: Option<ErrClearFn>,
    pub err_set_message: Option<ErrSetMessageFn>,
    pub from_legacy: Option<FromLegacyFn>,
    pub as_legacy: Option<AsLegacyFn>,
    pub list_new: Option<ListNewFn>,
    pub list_append: Option<ListAppendFn>,
    pub list_check: Option<ListCheckFn>,
    pub list_len: Option<ListLenFn>,
    pub list_get_item: Option<ListGetItemFn>,
    pub field_store: Option<FieldStoreFn>,
    pub field_load: Option<FieldLoadFn>,
    pub bytes_from_slice: Option<BytesFromSliceFn>,
    pub buffer_acquire: Option<BufferAcquireFn>,
    pub buffer_release: Option<BufferReleaseFn>,
    pub bytes_from_buffer: Option<BytesFromBufferFn>,
}

fn gate<F>(version: u32, id: FunctionId, f: F) -> Option<F> {
    (id.introduced_in() <= version).then_some(f)
}

impl VTable {
    /// Table whose entries validate the context they are called with.
    pub(crate) fn universal(version: u32) -> Self {
        use FunctionId as F;
        Self {
            version,
            slot_count: slot_count(version) as u32,
            dup: gate(version, F::Dup, universal::dup as DupFn),
            close: gate(version, F::Close, universal::close as CloseFn),
            get_none: gate(version, F::GetNone, universal::get_none as GetNoneFn),
            long_from_i64: gate(
                version,
                F::LongFromI64,
                universal::long_from_i64 as LongFromI64Fn,
            ),
            long_as_i64: gate(version, F::LongAsI64, universal::long_as_i64 as LongAsI64Fn),
            float_from_f64: gate(
                version,
                F::FloatFromF64,
                universal::float_from_f64 as FloatFromF64Fn,
            ),
            float_as_f64: gate(
                version,
                F::FloatAsF64,
                universal::float_as_f64 as FloatAsF64Fn,
            ),
            err_occurred: gate(
                version,
                F::ErrOccurred,
                universal::err_occurred as ErrOccurredFn,
            ),
            err_clear: gate(version, F::ErrClear, universal::err_clear as ErrClearFn),
            err_set_message: gate(
                version,
                F::ErrSetMessage,
                universal::err_set_message as ErrSetMessageFn,
            ),
            from_legacy: gate(version, F::FromLegacy, universal::from_legacy as FromLegacyFn),
            as_legacy: gate(version, F::AsLegacy, universal::as_legacy as AsLegacyFn),
            list_new: gate(version, F::ListNew, universal::list_new as ListNewFn),
            list_append: gate(version, F::ListAppend, universal::list_append as ListAppendFn),
            list_check: gate(version, F::ListCheck, universal::list_check as ListCheckFn),
            list_len: gate(version, F::ListLen, universal::list_len as ListLenFn),
            list_get_item: gate(
                version,
                F::ListGetItem,
                universal::list_get_item as ListGetItemFn,
            ),
            field_store: gate(version, F::FieldStore, universal::field_store as FieldStoreFn),
            field_load: gate(version, F::FieldLoad, universal::field_load as FieldLoadFn),
            bytes_from_slice: gate(
                version,
                F::BytesFromSlice,
                universal::bytes_from_slice as BytesFromSliceFn,
            ),
            buffer_acquire: gate(
                version,
                F::BufferAcquire,
                universal::buffer_acquire as BufferAcquireFn,
            ),
            buffer_release: gate(
                version,
                F::BufferRelease,
                universal::buffer_release as BufferReleaseFn,
            ),
            bytes_from_buffer: gate(
                version,
                F::BytesFromBuffer,
                universal::bytes_from_buffer as BytesFromBufferFn,
            ),
        }
    }

    pub fn is_empty(&self, id: FunctionId) -> bool {
        self.resolve(id).is_none()
    }

    /// Entry point for `id`, or `None` when the table predates it.
    pub fn resolve(&self, id: FunctionId) -> Option<RawFn> {
        macro_rules! raw {
            ($slot:expr) => {
                $slot.map(|f| RawFn(f as *const ()))
            };
        }
        match id {
            FunctionId::Dup => raw!(self.dup),
            FunctionId::Close => raw!(self.close),
            FunctionId::GetNone => raw!(self.get_none),
            FunctionId::LongFromI64 => raw!(self.long_from_i64),
            FunctionId::LongAsI64 => raw!(self.long_as_i64),
            FunctionId::FloatFromF64 => raw!(self.float_from_f64),
            FunctionId::FloatAsF64 => raw!(self.float_as_f64),
            FunctionId::ErrOccurred => raw!(self.err_occurred),
            FunctionId::ErrClear => raw!(self.err_clear),
            FunctionId::ErrSetMessage => raw!(self.err_set_message),
            FunctionId::FromLegacy => raw!(self.from_legacy),
            FunctionId::AsLegacy => raw!(self.as_legacy),
            FunctionId::ListNew => raw!(self.list_new),
            FunctionId::ListAppend => raw!(self.list_append),
            FunctionId::ListCheck => raw!(self.list_check),
            FunctionId::ListLen => raw!(self.list_len),
            FunctionId::ListGetItem => raw!(self.list_get_item),
            FunctionId::FieldStore => raw!(self.field_store),
            FunctionId::FieldLoad => raw!(self.field_load),
            FunctionId::BytesFromSlice => raw!(self.bytes_from_slice),
            FunctionId::BufferAcquire => raw!(self.buffer_acquire),
            FunctionId::BufferRelease => raw!(self.buffer_release),
            FunctionId::BytesFromBuffer => raw!(self.bytes_from_buffer),
        }
    }
}

/// Entry points bound directly to this host build, used by the version-specific layout.
///
/// They reach the calling session through thread-local state and never look at the context.
pub(crate) static DIRECT: VTable = VTable {
    version: LATEST_VERSION,
    slot_count: FunctionId::ALL.len() as u32,
    dup: Some(direct::dup),
    close: Some(direct::close),
    get_none: Some(direct::get_none),
    long_from_i64: Some(direct::long_from_i64),
    long_as_i64: Some(direct::long_as_i64),
    float_from_f64: Some(direct::float_from_f64),
    float_as_f64: Some(direct::float_as_f64),
    err_occurred: Some(direct::err_occurred),
    err_clear: Some(direct::err_clear),
    err_set_message: Some(direct::err_set_message),
    from_legacy: Some(direct::from_legacy),
    as_legacy: Some(direct::as_legacy),
    list_new: Some(direct::list_new),
    list_append: Some(direct::list_append),
    list_check: Some(direct::list_check),
    list_len: Some(direct::list_len),
    list_get_item: Some(direct::list_get_item),
    field_store: Some(direct::field_store),
    field_load: Some(direct::field_load),
    bytes_from_slice: Some(direct::bytes_from_slice),
    buffer_acquire: Some(direct::buffer_acquire),
    buffer_release: Some(direct::buffer_release),
    bytes_from_buffer: Some(direct::bytes_from_buffer),
};
