//! `extern "C"` entry points stored in the tables.
//!
//! Every API function exists twice. The universal flavour recovers the session from the context
//! cell and validates the context before doing anything else. The direct flavour is what a
//! version-specific build is bound to: it ignores the context and reaches the session that is
//! currently calling out on this thread. Both funnel into the same [`HostApi`] method; failures
//! are parked as the session's pending error and the documented sentinel is returned.

use std::cell::Cell;
use std::ptr;

use pyni_core::{Handle, LegacyRef, PyniError, ViolationKind};

use crate::buffer::RawBuffer;
use crate::context::{ContextCell, ContextPtr};
use crate::dispatch::HostApi;
use crate::session::SessionCell;
use crate::vtable::FunctionId;

thread_local! {
    static CURRENT: Cell<*const SessionCell> = const { Cell::new(ptr::null()) };
}

/// Marks a session as the one calling out on this thread until dropped.
pub(crate) struct CurrentSession {
    previous: *const SessionCell,
}

impl CurrentSession {
    pub(crate) fn enter(session: &SessionCell) -> Self {
        let previous = CURRENT.with(|current| current.replace(session as *const SessionCell));
        Self { previous }
    }
}

impl Drop for CurrentSession {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
    }
}

unsafe fn enter_universal<R>(
    ctx: ContextPtr,
    id: FunctionId,
    fail: R,
    op: impl FnOnce(&mut dyn HostApi) -> Result<R, PyniError>,
) -> R {
    let Some(cell) = ContextCell::from_public(ctx) else {
        return fail;
    };
    if !cell.owned_by_current_thread() {
        cell.report_unroutable(&PyniError::violation(
            ViolationKind::InvalidContext,
            format!("{id:?} called with a context owned by another thread"),
        ));
        return fail;
    }
    let session = cell.session();
    if session.is_null() {
        cell.report_unroutable(&PyniError::violation(
            ViolationKind::UseAfterRelease,
            format!("{id:?} called with a context whose session has ended"),
        ));
        return fail;
    }
    // SAFETY: the owning session clears this pointer before it is dropped, and we are on the
    // session's thread.
    let session = &*session;
    let Ok(mut api) = session.api.try_borrow_mut() else {
        return fail;
    };
    if let Err(err) = api.check_context(cell.view(), id) {
        api.set_error(err);
        return fail;
    }
    match op(&mut **api) {
        Ok(value) => value,
        Err(err) => {
            api.set_error(err);
            fail
        }
    }
}

fn enter_direct<R>(
    id: FunctionId,
    fail: R,
    op: impl FnOnce(&mut dyn HostApi) -> Result<R, PyniError>,
) -> R {
    let session = CURRENT.with(Cell::get);
    if session.is_null() {
        tracing::warn!(function = ?id, "direct entry called outside of any host call");
        return fail;
    }
    // SAFETY: CURRENT only holds a session for the extent of one of its calls on this thread.
    let session = unsafe { &*session };
    let Ok(mut api) = session.api.try_borrow_mut() else {
        return fail;
    };
    match op(&mut **api) {
        Ok(value) => value,
        Err(err) => {
            api.set_error(err);
            fail
        }
    }
}

macro_rules! entry_points {
    ($(
        $id:ident => fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty,
            fail = $fail:expr, |$api:ident| $body:block
    )*) => {
        pub(crate) mod universal {
            use super::*;
            $(
                pub(crate) unsafe extern "C" fn $name(ctx: ContextPtr $(, $arg: $ty)*) -> $ret {
                    enter_universal(ctx, FunctionId::$id, $fail, |$api| $body)
                }
            )*
        }

        pub(crate) mod direct {
            use super::*;
            $(
                pub(crate) unsafe extern "C" fn $name(_ctx: ContextPtr $(, $arg: $ty)*) -> $ret {
                    enter_direct(FunctionId::$id, $fail, |$api| $body)
                }
            )*
        }
    };
}

fn null_pointer(what: &str) -> PyniError {
    PyniError::invalid_handle(format!("{what} must not be null"))
}

entry_points! {
    Dup => fn dup(handle: Handle) -> Handle, fail = Handle::NULL, |api| {
        api.dup(handle)
    }
    Close => fn close(handle: Handle) -> i32, fail = -1, |api| {
        api.close(handle).map(|()| 0)
    }
    GetNone => fn get_none() -> Handle, fail = Handle::NULL, |api| {
        api.none()
    }
    LongFromI64 => fn long_from_i64(value: i64) -> Handle, fail = Handle::NULL, |api| {
        api.long_from_i64(value)
    }
    LongAsI64 => fn long_as_i64(handle: Handle) -> i64, fail = -1, |api| {
        api.long_as_i64(handle)
    }
    FloatFromF64 => fn float_from_f64(value: f64) -> Handle, fail = Handle::NULL, |api| {
        api.float_from_f64(value)
    }
    FloatAsF64 => fn float_as_f64(handle: Handle) -> f64, fail = -1.0, |api| {
        api.float_as_f64(handle)
    }
    ErrOccurred => fn err_occurred() -> i32, fail = -1, |api| {
        Ok(i32::from(api.err_occurred()))
    }
    ErrClear => fn err_clear() -> (), fail = (), |api| {
        api.err_clear();
        Ok(())
    }
    ErrSetMessage => fn err_set_message(message: *const u8, len: usize) -> (), fail = (), |api| {
        let text = if message.is_null() || len == 0 {
            String::new()
        } else {
            let bytes = unsafe { std::slice::from_raw_parts(message, len) };
            String::from_utf8_lossy(bytes).into_owned()
        };
        api.err_set_message(&text);
        Ok(())
    }
    FromLegacy => fn from_legacy(reference: LegacyRef) -> Handle, fail = Handle::NULL, |api| {
        api.from_legacy(reference)
    }
    AsLegacy => fn as_legacy(handle: Handle) -> LegacyRef, fail = LegacyRef::NULL, |api| {
        api.as_legacy(handle)
    }
    ListNew => fn list_new() -> Handle, fail = Handle::NULL, |api| {
        api.list_new()
    }
    ListAppend => fn list_append(list: Handle, item: Handle) -> i32, fail = -1, |api| {
        api.list_append(list, item).map(|()| 0)
    }
    ListCheck => fn list_check(handle: Handle) -> i32, fail = -1, |api| {
        api.list_check(handle).map(i32::from)
    }
    ListLen => fn list_len(list: Handle) -> isize, fail = -1, |api| {
        let len = api.list_len(list)?;
        isize::try_from(len).map_err(|_| PyniError::invalid_handle("list length overflows isize"))
    }
    ListGetItem => fn list_get_item(list: Handle, index: isize) -> Handle, fail = Handle::NULL, |api| {
        api.list_get_item(list, index)
    }
    FieldStore => fn field_store(owner: Handle, slot: u32, value: Handle) -> Handle, fail = Handle::NULL, |api| {
        api.field_store(owner, slot, value)
    }
    FieldLoad => fn field_load(heap: Handle) -> Handle, fail = Handle::NULL, |api| {
        api.field_load(heap)
    }
    BytesFromSlice => fn bytes_from_slice(data: *const u8, len: usize) -> Handle, fail = Handle::NULL, |api| {
        if data.is_null() {
            if len != 0 {
                return Err(null_pointer("byte slice"));
            }
            return api.bytes_from_slice(&[]);
        }
        let bytes = unsafe { std::slice::from_raw_parts(data, len) };
        api.bytes_from_slice(bytes)
    }
    BufferAcquire => fn buffer_acquire(handle: Handle, out: *mut RawBuffer) -> i32, fail = -1, |api| {
        if out.is_null() {
            return Err(null_pointer("buffer out-pointer"));
        }
        let buffer = api.buffer_acquire(handle)?;
        unsafe { out.write(buffer) };
        Ok(0)
    }
    BufferRelease => fn buffer_release(buffer: *mut RawBuffer) -> i32, fail = -1, |api| {
        if buffer.is_null() {
            return Err(null_pointer("buffer"));
        }
        let token = unsafe { (*buffer).token };
        api.buffer_release(token)?;
        unsafe { buffer.write(RawBuffer::EMPTY) };
        Ok(0)
    }
    BytesFromBuffer => fn bytes_from_buffer(buffer: *const RawBuffer) -> Handle, fail = Handle::NULL, |api| {
        if buffer.is_null() {
            return Err(null_pointer("buffer"));
        }
        let token = unsafe { (*buffer).token };
        api.bytes_from_buffer(token)
    }
}
