//! Host side of every API function.
//!
//! [`HostApi`] is the seam between the `extern "C"` entry points and the runtime state of one
//! session. [`ReleaseApi`] implements it directly on the handle table and the object model;
//! [`DebugApi`](crate::debug::DebugApi) wraps any implementation to add contract checks.

use std::collections::HashMap;
use std::sync::Arc;

use pyni_core::{
    ErrorInfo, Handle, LayoutKind, LegacyRef, ObjectKind, ObjectRef, ObjectSpace, PyniError,
    ViolationKind,
};

use crate::buffer::RawBuffer;
use crate::context::{ContextState, ContextView};
use crate::handles::{FrameId, FrameReport, HandleTable, Origin};
use crate::heap::{HeapStore, StorageSite};
use crate::vtable::FunctionId;

/// Who is executing inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLabel {
    pub extension: Arc<str>,
    pub function: Arc<str>,
    /// Whether debug checks apply to this frame.
    pub checked: bool,
}

impl FrameLabel {
    pub fn new(extension: Arc<str>, function: Arc<str>, checked: bool) -> Self {
        Self {
            extension,
            function,
            checked,
        }
    }
}

/// How long an inherited context stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPolicy {
    /// A fresh context per call, retired when the call returns.
    PerCall,
    /// One context per session and table, valid until the session ends.
    PerSession,
}

/// Classification of a buffer token against the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLookup {
    Held,
    /// Issued by this session and released since.
    Released,
    /// Zero or never issued.
    Unknown,
}

fn api_error(code: &str, message: impl Into<String>) -> PyniError {
    PyniError::Api(ErrorInfo::new(code, message))
}

pub(crate) fn type_error(expected: &str, found: Option<ObjectKind>) -> PyniError {
    let found = found.map_or_else(|| "dead object".to_string(), |kind| format!("{kind:?}"));
    api_error("pyni.type_error", format!("expected {expected}, found {found}"))
        .with_context("expected", expected)
}

pub trait HostApi {
    fn enter_frame(&mut self, label: FrameLabel) -> Result<FrameId, PyniError>;
    fn exit_frame(&mut self, frame: FrameId) -> Result<FrameReport, PyniError>;
    /// Opens a borrowed argument handle; the host keeps its own reference.
    fn open_argument(&mut self, obj: ObjectRef) -> Result<Handle, PyniError>;
    /// Takes a returned handle; the caller now owns its reference.
    fn take_result(&mut self, handle: Handle) -> Result<ObjectRef, PyniError>;

    fn context_policy(&self, layout: LayoutKind) -> ContextPolicy;
    fn check_context(&mut self, view: ContextView, id: FunctionId) -> Result<(), PyniError>;
    /// Offered every contract failure the host detects outside API functions.
    fn observe_violation(&mut self, err: &PyniError);

    fn handles(&self) -> &HandleTable;
    fn space(&self) -> &Arc<dyn ObjectSpace>;

    fn set_error(&mut self, err: PyniError);
    fn take_error(&mut self) -> Option<PyniError>;
    fn err_occurred(&self) -> bool;
    fn err_clear(&mut self);
    fn err_set_message(&mut self, message: &str);

    fn dup(&mut self, handle: Handle) -> Result<Handle, PyniError>;
    fn close(&mut self, handle: Handle) -> Result<(), PyniError>;
    fn none(&mut self) -> Result<Handle, PyniError>;
    fn long_from_i64(&mut self, value: i64) -> Result<Handle, PyniError>;
    fn long_as_i64(&mut self, handle: Handle) -> Result<i64, PyniError>;
    fn float_from_f64(&mut self, value: f64) -> Result<Handle, PyniError>;
    fn float_as_f64(&mut self, handle: Handle) -> Result<f64, PyniError>;
    fn from_legacy(&mut self, reference: LegacyRef) -> Result<Handle, PyniError>;
    fn as_legacy(&mut self, handle: Handle) -> Result<LegacyRef, PyniError>;

    fn list_new(&mut self) -> Result<Handle, PyniError>;
    fn list_append(&mut self, list: Handle, item: Handle) -> Result<(), PyniError>;
    fn list_check(&mut self, handle: Handle) -> Result<bool, PyniError>;
    fn list_len(&mut self, list: Handle) -> Result<usize, PyniError>;
    fn list_get_item(&mut self, list: Handle, index: isize) -> Result<Handle, PyniError>;

    fn promote_to_heap(&mut self, local: Handle, site: StorageSite) -> Result<Handle, PyniError>;
    fn local_for_heap(&mut self, heap: Handle) -> Result<Handle, PyniError>;
    fn field_store(&mut self, owner: Handle, slot: u32, value: Handle)
        -> Result<Handle, PyniError>;
    fn field_load(&mut self, heap: Handle) -> Result<Handle, PyniError>;

    fn bytes_from_slice(&mut self, data: &[u8]) -> Result<Handle, PyniError>;
    fn buffer_acquire(&mut self, handle: Handle) -> Result<RawBuffer, PyniError>;
    fn buffer_release(&mut self, token: u64) -> Result<(), PyniError>;
    fn bytes_from_buffer(&mut self, token: u64) -> Result<Handle, PyniError>;
    fn buffer_lookup(&self, token: u64) -> BufferLookup;
}

#[derive(Debug)]
struct HeldBuffer {
    data: Arc<[u8]>,
    owner: ObjectRef,
}

/// Unchecked dispatch over one session's handle table.
pub struct ReleaseApi {
    space: Arc<dyn ObjectSpace>,
    heap: Arc<HeapStore>,
    table: HandleTable,
    buffers: HashMap<u64, HeldBuffer>,
    last_token: u64,
    pending: Option<PyniError>,
}

impl ReleaseApi {
    pub fn new(space: Arc<dyn ObjectSpace>, heap: Arc<HeapStore>) -> Self {
        Self {
            space,
            heap,
            table: HandleTable::new(),
            buffers: HashMap::new(),
            last_token: 0,
            pending: None,
        }
    }

    /// Opens a scope over a reference the caller already owns; releases it on failure.
    fn open_owned(&mut self, obj: ObjectRef, origin: Origin) -> Result<Handle, PyniError> {
        self.table.open(obj, origin).map_err(|err| {
            self.space.release(obj);
            err
        })
    }

    fn open_borrowed(&mut self, obj: ObjectRef, origin: Origin) -> Result<Handle, PyniError> {
        self.space.retain(obj);
        self.open_owned(obj, origin)
    }

    pub fn outstanding_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn heap(&self) -> &Arc<HeapStore> {
        &self.heap
    }
}

impl HostApi for ReleaseApi {
    fn enter_frame(&mut self, label: FrameLabel) -> Result<FrameId, PyniError> {
        let frame = self.table.enter_frame();
        tracing::trace!(
            frame = frame.as_raw(),
            extension = %label.extension,
            function = %label.function,
            "frame entered"
        );
        Ok(frame)
    }

    fn exit_frame(&mut self, frame: FrameId) -> Result<FrameReport, PyniError> {
        let report = self.table.exit_frame(frame)?;
        for backing in &report.released {
            self.space.release(*backing);
        }
        if !report.leaked.is_empty() {
            tracing::debug!(
                frame = frame.as_raw(),
                leaked = report.leaked.len(),
                "frame exited with open scopes"
            );
        }
        Ok(report)
    }

    fn open_argument(&mut self, obj: ObjectRef) -> Result<Handle, PyniError> {
        self.open_borrowed(obj, Origin::Argument)
    }

    fn take_result(&mut self, handle: Handle) -> Result<ObjectRef, PyniError> {
        self.table.transfer(handle)
    }

    fn context_policy(&self, _layout: LayoutKind) -> ContextPolicy {
        ContextPolicy::PerSession
    }

    fn check_context(&mut self, view: ContextView, id: FunctionId) -> Result<(), PyniError> {
        if view.state == ContextState::Live {
            return Ok(());
        }
        Err(PyniError::violation(
            ViolationKind::UseAfterRelease,
            format!("{id:?} called through a {:?} context", view.state),
        ))
    }

    fn observe_violation(&mut self, _err: &PyniError) {}

    fn handles(&self) -> &HandleTable {
        &self.table
    }

    fn space(&self) -> &Arc<dyn ObjectSpace> {
        &self.space
    }

    fn set_error(&mut self, err: PyniError) {
        self.pending = Some(err);
    }

    fn take_error(&mut self) -> Option<PyniError> {
        self.pending.take()
    }

    fn err_occurred(&self) -> bool {
        self.pending.is_some()
    }

    fn err_clear(&mut self) {
        self.pending = None;
    }

    fn err_set_message(&mut self, message: &str) {
        self.pending = Some(api_error("pyni.extension_error", message));
    }

    fn dup(&mut self, handle: Handle) -> Result<Handle, PyniError> {
        let dup = self.table.duplicate(handle)?;
        self.space.retain(self.table.backing(dup)?);
        Ok(dup)
    }

    fn close(&mut self, handle: Handle) -> Result<(), PyniError> {
        let backing = self.table.close(handle)?;
        self.space.release(backing);
        Ok(())
    }

    fn none(&mut self) -> Result<Handle, PyniError> {
        let none = self.space.none();
        self.open_owned(none, Origin::Opened)
    }

    fn long_from_i64(&mut self, value: i64) -> Result<Handle, PyniError> {
        let obj = self.space.new_int(value);
        self.open_owned(obj, Origin::Opened)
    }

    fn long_as_i64(&mut self, handle: Handle) -> Result<i64, PyniError> {
        let backing = self.table.backing(handle)?;
        self.space
            .int_value(backing)
            .ok_or_else(|| type_error("int", self.space.kind(backing)))
    }

    fn float_from_f64(&mut self, value: f64) -> Result<Handle, PyniError> {
        let obj = self.space.new_float(value);
        self.open_owned(obj, Origin::Opened)
    }

    fn float_as_f64(&mut self, handle: Handle) -> Result<f64, PyniError> {
        let backing = self.table.backing(handle)?;
        self.space
            .float_value(backing)
            .or_else(|| self.space.int_value(backing).map(|v| v as f64))
            .ok_or_else(|| type_error("float", self.space.kind(backing)))
    }

    fn from_legacy(&mut self, reference: LegacyRef) -> Result<Handle, PyniError> {
        let obj = reference
            .object()
            .filter(|obj| self.space.kind(*obj).is_some())
            .ok_or_else(|| PyniError::invalid_handle("legacy reference is null or dead"))?;
        self.open_borrowed(obj, Origin::Legacy)
    }

    fn as_legacy(&mut self, handle: Handle) -> Result<LegacyRef, PyniError> {
        Ok(LegacyRef::from_object(self.table.backing(handle)?))
    }

    fn list_new(&mut self) -> Result<Handle, PyniError> {
        let list = self.space.new_list();
        self.open_owned(list, Origin::Opened)
    }

    fn list_append(&mut self, list: Handle, item: Handle) -> Result<(), PyniError> {
        let list = self.table.backing(list)?;
        let item = self.table.backing(item)?;
        if self.space.list_append(list, item) {
            Ok(())
        } else {
            Err(type_error("list", self.space.kind(list)))
        }
    }

    fn list_check(&mut self, handle: Handle) -> Result<bool, PyniError> {
        let backing = self.table.backing(handle)?;
        Ok(self.space.kind(backing) == Some(ObjectKind::List))
    }

    fn list_len(&mut self, list: Handle) -> Result<usize, PyniError> {
        let backing = self.table.backing(list)?;
        self.space
            .list_len(backing)
            .ok_or_else(|| type_error("list", self.space.kind(backing)))
    }

    fn list_get_item(&mut self, list: Handle, index: isize) -> Result<Handle, PyniError> {
        let backing = self.table.backing(list)?;
        let len = self
            .space
            .list_len(backing)
            .ok_or_else(|| type_error("list", self.space.kind(backing)))?;
        let item = usize::try_from(index)
            .ok()
            .filter(|idx| *idx < len)
            .and_then(|idx| self.space.list_item(backing, idx))
            .ok_or_else(|| {
                api_error("pyni.index_error", format!("index {index} out of range"))
                    .with_context("len", len.to_string())
            })?;
        self.open_owned(item, Origin::Opened)
    }

    fn promote_to_heap(&mut self, local: Handle, site: StorageSite) -> Result<Handle, PyniError> {
        let backing = self.table.backing(local)?;
        self.space.retain(backing);
        let stored = self.heap.store(site, backing).map_err(|err| {
            self.space.release(backing);
            err
        })?;
        if let Some(previous) = stored.replaced {
            self.space.release(previous);
        }
        Ok(stored.handle)
    }

    fn local_for_heap(&mut self, heap: Handle) -> Result<Handle, PyniError> {
        let backing = self.heap.load(heap)?;
        self.open_borrowed(backing, Origin::HeapLoad)
    }

    fn field_store(
        &mut self,
        owner: Handle,
        slot: u32,
        value: Handle,
    ) -> Result<Handle, PyniError> {
        let owner = self.table.backing(owner)?;
        self.promote_to_heap(value, StorageSite::Field { owner, slot })
    }

    fn field_load(&mut self, heap: Handle) -> Result<Handle, PyniError> {
        self.local_for_heap(heap)
    }

    fn bytes_from_slice(&mut self, data: &[u8]) -> Result<Handle, PyniError> {
        let obj = self.space.new_bytes(data);
        self.open_owned(obj, Origin::Opened)
    }

    fn buffer_acquire(&mut self, handle: Handle) -> Result<RawBuffer, PyniError> {
        let owner = self.table.backing(handle)?;
        let data = self
            .space
            .bytes_data(owner)
            .ok_or_else(|| type_error("bytes", self.space.kind(owner)))?;
        self.space.retain(owner);
        self.last_token += 1;
        let token = self.last_token;
        let buffer = RawBuffer {
            ptr: data.as_ptr(),
            len: data.len(),
            token,
        };
        self.buffers.insert(token, HeldBuffer { data, owner });
        Ok(buffer)
    }

    fn buffer_release(&mut self, token: u64) -> Result<(), PyniError> {
        let held = self.buffers.remove(&token).ok_or_else(|| {
            PyniError::invalid_handle(format!("buffer {token} is not held"))
        })?;
        self.space.release(held.owner);
        Ok(())
    }

    fn bytes_from_buffer(&mut self, token: u64) -> Result<Handle, PyniError> {
        let data = self
            .buffers
            .get(&token)
            .map(|held| Arc::clone(&held.data))
            .ok_or_else(|| PyniError::invalid_handle(format!("buffer {token} is not held")))?;
        let obj = self.space.new_bytes(&data);
        self.open_owned(obj, Origin::Opened)
    }

    fn buffer_lookup(&self, token: u64) -> BufferLookup {
        // Tokens count up from 1, so anything issued and no longer held was released.
        if self.buffers.contains_key(&token) {
            BufferLookup::Held
        } else if token != 0 && token <= self.last_token {
            BufferLookup::Released
        } else {
            BufferLookup::Unknown
        }
    }
}

impl Drop for ReleaseApi {
    fn drop(&mut self) {
        for (_, held) in self.buffers.drain() {
            self.space.release(held.owner);
        }
    }
}
