//! Extension-facing API over both binary layouts.
//!
//! Extension code calls `Api::<L>::…` with the context it received. With the universal layout
//! every call indirects through the table reachable from the context; with the
//! version-specific layout calls are bound to this build's entry points and the context is
//! never read. The `universal-abi` feature picks [`ActiveLayout`].

use std::marker::PhantomData;

use pyni_core::{Handle, LayoutKind, LegacyRef, ListHandle};

use crate::buffer::RawBuffer;
use crate::context::ContextPtr;
use crate::vtable::{FunctionId, RawFn, VTable, DIRECT};

pub trait AbiLayout {
    const KIND: LayoutKind;

    /// Table to resolve through.
    ///
    /// # Safety
    ///
    /// `ctx` must be null or a context handed out by the host.
    unsafe fn table<'a>(ctx: ContextPtr) -> Option<&'a VTable>;
}

pub struct Universal;

pub struct VersionSpecific;

impl AbiLayout for Universal {
    const KIND: LayoutKind = LayoutKind::Universal;

    unsafe fn table<'a>(ctx: ContextPtr) -> Option<&'a VTable> {
        ctx.as_ref()?.vtable_ptr().as_ref()
    }
}

impl AbiLayout for VersionSpecific {
    const KIND: LayoutKind = LayoutKind::VersionSpecific;

    unsafe fn table<'a>(_ctx: ContextPtr) -> Option<&'a VTable> {
        Some(&DIRECT)
    }
}

#[cfg(feature = "universal-abi")]
pub type ActiveLayout = Universal;
#[cfg(not(feature = "universal-abi"))]
pub type ActiveLayout = VersionSpecific;

pub type ActiveApi = Api<ActiveLayout>;

/// Resolves one API function for a context.
///
/// # Safety
///
/// `ctx` must be null or a context handed out by the host.
pub unsafe fn resolve<L: AbiLayout>(ctx: ContextPtr, id: FunctionId) -> Option<RawFn> {
    L::table(ctx)?.resolve(id)
}

/// Typed API calls. Each returns the documented failure sentinel when the function is missing
/// from the context's table.
pub struct Api<L>(PhantomData<L>);

macro_rules! forward {
    ($ctx:ident, $slot:ident, $fail:expr $(, $arg:expr)*) => {
        match L::table($ctx).and_then(|table| table.$slot) {
            Some(f) => f($ctx $(, $arg)*),
            None => $fail,
        }
    };
}

#[allow(clippy::missing_safety_doc)]
impl<L: AbiLayout> Api<L> {
    pub unsafe fn dup(ctx: ContextPtr, handle: Handle) -> Handle {
        forward!(ctx, dup, Handle::NULL, handle)
    }

    /// `0` on success, `-1` on failure.
    pub unsafe fn close(ctx: ContextPtr, handle: Handle) -> i32 {
        forward!(ctx, close, -1, handle)
    }

    pub unsafe fn none(ctx: ContextPtr) -> Handle {
        forward!(ctx, get_none, Handle::NULL)
    }

    pub unsafe fn long_from_i64(ctx: ContextPtr, value: i64) -> Handle {
        forward!(ctx, long_from_i64, Handle::NULL, value)
    }

    /// `-1` with the error set on failure.
    pub unsafe fn long_as_i64(ctx: ContextPtr, handle: Handle) -> i64 {
        forward!(ctx, long_as_i64, -1, handle)
    }

    pub unsafe fn float_from_f64(ctx: ContextPtr, value: f64) -> Handle {
        forward!(ctx, float_from_f64, Handle::NULL, value)
    }

    /// `-1.0` with the error set on failure. Integers are converted.
    pub unsafe fn float_as_f64(ctx: ContextPtr, handle: Handle) -> f64 {
        forward!(ctx, float_as_f64, -1.0, handle)
    }

    pub unsafe fn err_occurred(ctx: ContextPtr) -> bool {
        let status = forward!(ctx, err_occurred, -1);
        status != 0
    }

    pub unsafe fn err_clear(ctx: ContextPtr) {
        forward!(ctx, err_clear, ())
    }

    pub unsafe fn err_set_message(ctx: ContextPtr, message: &str) {
        forward!(ctx, err_set_message, (), message.as_ptr(), message.len())
    }

    pub unsafe fn from_legacy(ctx: ContextPtr, reference: LegacyRef) -> Handle {
        forward!(ctx, from_legacy, Handle::NULL, reference)
    }

    /// The returned reference is borrowed from `handle`.
    pub unsafe fn as_legacy(ctx: ContextPtr, handle: Handle) -> LegacyRef {
        forward!(ctx, as_legacy, LegacyRef::NULL, handle)
    }

    pub unsafe fn list_new(ctx: ContextPtr) -> Handle {
        forward!(ctx, list_new, Handle::NULL)
    }

    pub unsafe fn list_append(ctx: ContextPtr, list: ListHandle, item: Handle) -> i32 {
        forward!(ctx, list_append, -1, list.handle(), item)
    }

    /// `None` when the object is not a list. A failed check leaves the error set.
    pub unsafe fn as_list(ctx: ContextPtr, handle: Handle) -> Option<ListHandle> {
        let is_list = forward!(ctx, list_check, -1, handle);
        (is_list == 1).then(|| ListHandle::assume_list(handle))
    }

    pub unsafe fn list_len(ctx: ContextPtr, list: ListHandle) -> isize {
        forward!(ctx, list_len, -1, list.handle())
    }

    /// New local handle for the item; `NULL` with the error set when out of range.
    pub unsafe fn list_get_item(ctx: ContextPtr, list: ListHandle, index: isize) -> Handle {
        forward!(ctx, list_get_item, Handle::NULL, list.handle(), index)
    }

    /// Stores `value` in slot `slot` of `owner` and returns a heap handle for it.
    pub unsafe fn field_store(ctx: ContextPtr, owner: Handle, slot: u32, value: Handle) -> Handle {
        forward!(ctx, field_store, Handle::NULL, owner, slot, value)
    }

    /// New local handle for the value behind a heap handle.
    pub unsafe fn field_load(ctx: ContextPtr, heap: Handle) -> Handle {
        forward!(ctx, field_load, Handle::NULL, heap)
    }

    pub unsafe fn bytes_from_slice(ctx: ContextPtr, data: &[u8]) -> Handle {
        forward!(ctx, bytes_from_slice, Handle::NULL, data.as_ptr(), data.len())
    }

    pub unsafe fn buffer_acquire(ctx: ContextPtr, handle: Handle) -> Option<RawBuffer> {
        let mut buffer = RawBuffer::EMPTY;
        let status = forward!(ctx, buffer_acquire, -1, handle, &mut buffer as *mut RawBuffer);
        (status == 0).then_some(buffer)
    }

    /// Releases a buffer and clears it. Its contents must not be read afterwards.
    pub unsafe fn buffer_release(ctx: ContextPtr, buffer: &mut RawBuffer) -> i32 {
        forward!(ctx, buffer_release, -1, buffer as *mut RawBuffer)
    }

    pub unsafe fn bytes_from_buffer(ctx: ContextPtr, buffer: &RawBuffer) -> Handle {
        forward!(ctx, bytes_from_buffer, Handle::NULL, buffer as *const RawBuffer)
    }
}
