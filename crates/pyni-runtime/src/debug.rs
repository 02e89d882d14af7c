//! Debug interception layer.
//!
//! [`DebugApi`] decorates another [`HostApi`] and classifies every handle, context and buffer
//! before delegating. Violations are reported on the diagnostic channel and the call then
//! proceeds exactly as the wrapped implementation would have handled it, so a conforming call
//! produces the same result with or without the layer.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use pyni_core::{
    DiagnosticSink, Handle, LayoutKind, LegacyRef, ObjectRef, ObjectSpace, PyniError, Violation,
    ViolationKind,
};

use crate::buffer::{RawBuffer, POISON};
use crate::context::{ContextState, ContextView};
use crate::dispatch::{BufferLookup, ContextPolicy, FrameLabel, HostApi};
use crate::handles::{FrameId, FrameReport, HandleTable, Lookup};
use crate::heap::StorageSite;
use crate::vtable::FunctionId;

/// The operation a checked handle was passed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caller {
    Slot(FunctionId),
    /// Host-side promotion with no table slot of its own.
    PromoteToHeap,
}

impl From<FunctionId> for Caller {
    fn from(id: FunctionId) -> Self {
        Caller::Slot(id)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Slot(id) => write!(f, "{id:?}"),
            Caller::PromoteToHeap => f.write_str("PromoteToHeap"),
        }
    }
}

pub struct DebugApi<A> {
    inner: A,
    sink: Arc<dyn DiagnosticSink>,
    frames: Vec<FrameLabel>,
    shadows: HashMap<u64, Box<[u8]>>,
    quarantine: VecDeque<Box<[u8]>>,
    quarantine_limit: usize,
}

impl<A: HostApi> DebugApi<A> {
    pub fn new(inner: A, sink: Arc<dyn DiagnosticSink>, quarantine_limit: usize) -> Self {
        Self {
            inner,
            sink,
            frames: Vec::new(),
            shadows: HashMap::new(),
            quarantine: VecDeque::new(),
            quarantine_limit,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn checking(&self) -> bool {
        self.frames.last().map_or(true, |label| label.checked)
    }

    fn report(&self, kind: ViolationKind, message: String, subject: Option<u64>) {
        let mut violation = Violation::new(kind, message);
        if let Some(label) = self.frames.last() {
            violation = violation.in_call(&*label.extension, &*label.function);
        }
        if let Some(subject) = subject {
            violation = violation.with_subject(subject);
        }
        self.sink.report(violation);
    }

    fn reject(&self, kind: ViolationKind, message: String, subject: Option<u64>) -> PyniError {
        let err = PyniError::violation(kind, message.clone());
        self.report(kind, message, subject);
        err
    }

    /// Rejects handles whose scope has ended or whose frame has exited.
    fn check_handle(&self, handle: Handle, caller: impl Into<Caller>) -> Result<(), PyniError> {
        if !self.checking() {
            return Ok(());
        }
        let caller = caller.into();
        match self.inner.handles().lookup(handle) {
            Lookup::Stale => Err(self.reject(
                ViolationKind::StaleHandleUse,
                format!("{caller} received {handle:?} from a frame that already exited"),
                Some(handle.as_raw()),
            )),
            Lookup::Closed(_) => Err(self.reject(
                ViolationKind::UseAfterRelease,
                format!("{caller} received {handle:?} after it was closed"),
                Some(handle.as_raw()),
            )),
            Lookup::Open(_) | Lookup::Invalid => Ok(()),
        }
    }

    /// Rejects buffers released earlier in the session, whether or not their shadow is still
    /// quarantined.
    fn check_token(&self, token: u64, id: FunctionId) -> Result<(), PyniError> {
        if self.checking() && self.inner.buffer_lookup(token) == BufferLookup::Released {
            return Err(self.reject(
                ViolationKind::UseAfterRelease,
                format!("{id:?} received buffer {token} after it was released"),
                Some(token),
            ));
        }
        Ok(())
    }

    fn park_released(&mut self, mut shadow: Box<[u8]>) {
        shadow.fill(POISON);
        self.quarantine.push_back(shadow);
        while self.quarantine.len() > self.quarantine_limit {
            self.quarantine.pop_front();
        }
    }

    /// Number of released buffers whose poisoned shadows are still held.
    pub fn quarantined_buffers(&self) -> usize {
        self.quarantine.len()
    }
}

impl<A: HostApi> HostApi for DebugApi<A> {
    fn enter_frame(&mut self, label: FrameLabel) -> Result<FrameId, PyniError> {
        let frame = self.inner.enter_frame(label.clone())?;
        self.frames.push(label);
        Ok(frame)
    }

    fn exit_frame(&mut self, frame: FrameId) -> Result<FrameReport, PyniError> {
        let report = match self.inner.exit_frame(frame) {
            Ok(report) => report,
            Err(err) => {
                self.observe_violation(&err);
                return Err(err);
            }
        };
        if self.checking() {
            for leak in &report.leaked {
                self.report(
                    ViolationKind::LeakedHandle,
                    format!(
                        "{:?} ({:?}) still open when its frame exited",
                        leak.handle, leak.origin
                    ),
                    Some(leak.handle.as_raw()),
                );
            }
        }
        self.frames.pop();
        Ok(report)
    }

    fn open_argument(&mut self, obj: ObjectRef) -> Result<Handle, PyniError> {
        self.inner.open_argument(obj)
    }

    fn take_result(&mut self, handle: Handle) -> Result<ObjectRef, PyniError> {
        if self.checking() {
            match self.inner.handles().lookup(handle) {
                Lookup::Stale => {
                    return Err(self.reject(
                        ViolationKind::StaleHandleUse,
                        format!("returned {handle:?} belongs to a frame that already exited"),
                        Some(handle.as_raw()),
                    ))
                }
                Lookup::Closed(_) => {
                    return Err(self.reject(
                        ViolationKind::UseAfterRelease,
                        format!("returned {handle:?} was already closed"),
                        Some(handle.as_raw()),
                    ))
                }
                Lookup::Open(_) | Lookup::Invalid => {}
            }
        }
        self.inner.take_result(handle)
    }

    fn context_policy(&self, layout: LayoutKind) -> ContextPolicy {
        match layout {
            LayoutKind::Universal => ContextPolicy::PerCall,
            LayoutKind::VersionSpecific => self.inner.context_policy(layout),
        }
    }

    fn check_context(&mut self, view: ContextView, id: FunctionId) -> Result<(), PyniError> {
        if view.state != ContextState::Live {
            return Err(self.reject(
                ViolationKind::UseAfterRelease,
                format!(
                    "{id:?} called through {:?} context #{} after its release point",
                    view.origin, view.serial
                ),
                Some(view.serial),
            ));
        }
        if id.introduced_in() > view.version {
            return Err(self.reject(
                ViolationKind::InvalidContext,
                format!(
                    "{id:?} is not part of table version {} this context was built for",
                    view.version
                ),
                Some(view.serial),
            ));
        }
        self.inner.check_context(view, id)
    }

    fn observe_violation(&mut self, err: &PyniError) {
        if let Some(kind) = err.violation_kind() {
            self.report(kind, err.info().message.clone(), None);
        }
        self.inner.observe_violation(err);
    }

    fn handles(&self) -> &HandleTable {
        self.inner.handles()
    }

    fn space(&self) -> &Arc<dyn ObjectSpace> {
        self.inner.space()
    }

    fn set_error(&mut self, err: PyniError) {
        self.inner.set_error(err);
    }

    fn take_error(&mut self) -> Option<PyniError> {
        self.inner.take_error()
    }

    fn err_occurred(&self) -> bool {
        self.inner.err_occurred()
    }

    fn err_clear(&mut self) {
        self.inner.err_clear();
    }

    fn err_set_message(&mut self, message: &str) {
        self.inner.err_set_message(message);
    }

    fn dup(&mut self, handle: Handle) -> Result<Handle, PyniError> {
        self.check_handle(handle, FunctionId::Dup)?;
        self.inner.dup(handle)
    }

    fn close(&mut self, handle: Handle) -> Result<(), PyniError> {
        if self.checking() {
            match self.inner.handles().lookup(handle) {
                Lookup::Closed(_) => {
                    return Err(self.reject(
                        ViolationKind::DoubleClose,
                        format!("{handle:?} closed twice"),
                        Some(handle.as_raw()),
                    ))
                }
                Lookup::Stale => {
                    return Err(self.reject(
                        ViolationKind::StaleHandleUse,
                        format!("Close received {handle:?} from a frame that already exited"),
                        Some(handle.as_raw()),
                    ))
                }
                Lookup::Open(_) | Lookup::Invalid => {}
            }
        }
        self.inner.close(handle)
    }

    fn none(&mut self) -> Result<Handle, PyniError> {
        self.inner.none()
    }

    fn long_from_i64(&mut self, value: i64) -> Result<Handle, PyniError> {
        self.inner.long_from_i64(value)
    }

    fn long_as_i64(&mut self, handle: Handle) -> Result<i64, PyniError> {
        self.check_handle(handle, FunctionId::LongAsI64)?;
        self.inner.long_as_i64(handle)
    }

    fn float_from_f64(&mut self, value: f64) -> Result<Handle, PyniError> {
        self.inner.float_from_f64(value)
    }

    fn float_as_f64(&mut self, handle: Handle) -> Result<f64, PyniError> {
        self.check_handle(handle, FunctionId::FloatAsF64)?;
        self.inner.float_as_f64(handle)
    }

    fn from_legacy(&mut self, reference: LegacyRef) -> Result<Handle, PyniError> {
        self.inner.from_legacy(reference)
    }

    fn as_legacy(&mut self, handle: Handle) -> Result<LegacyRef, PyniError> {
        self.check_handle(handle, FunctionId::AsLegacy)?;
        self.inner.as_legacy(handle)
    }

    fn list_new(&mut self) -> Result<Handle, PyniError> {
        self.inner.list_new()
    }

    fn list_append(&mut self, list: Handle, item: Handle) -> Result<(), PyniError> {
        self.check_handle(list, FunctionId::ListAppend)?;
        self.check_handle(item, FunctionId::ListAppend)?;
        self.inner.list_append(list, item)
    }

    fn list_check(&mut self, handle: Handle) -> Result<bool, PyniError> {
        self.check_handle(handle, FunctionId::ListCheck)?;
        self.inner.list_check(handle)
    }

    fn list_len(&mut self, list: Handle) -> Result<usize, PyniError> {
        self.check_handle(list, FunctionId::ListLen)?;
        self.inner.list_len(list)
    }

    fn list_get_item(&mut self, list: Handle, index: isize) -> Result<Handle, PyniError> {
        self.check_handle(list, FunctionId::ListGetItem)?;
        self.inner.list_get_item(list, index)
    }

    fn promote_to_heap(&mut self, local: Handle, site: StorageSite) -> Result<Handle, PyniError> {
        self.check_handle(local, Caller::PromoteToHeap)?;
        self.inner.promote_to_heap(local, site)
    }

    fn local_for_heap(&mut self, heap: Handle) -> Result<Handle, PyniError> {
        self.inner.local_for_heap(heap)
    }

    fn field_store(
        &mut self,
        owner: Handle,
        slot: u32,
        value: Handle,
    ) -> Result<Handle, PyniError> {
        self.check_handle(owner, FunctionId::FieldStore)?;
        self.check_handle(value, FunctionId::FieldStore)?;
        self.inner.field_store(owner, slot, value)
    }

    fn field_load(&mut self, heap: Handle) -> Result<Handle, PyniError> {
        self.inner.field_load(heap)
    }

    fn bytes_from_slice(&mut self, data: &[u8]) -> Result<Handle, PyniError> {
        self.inner.bytes_from_slice(data)
    }

    fn buffer_acquire(&mut self, handle: Handle) -> Result<RawBuffer, PyniError> {
        self.check_handle(handle, FunctionId::BufferAcquire)?;
        let mut buffer = self.inner.buffer_acquire(handle)?;
        if self.checking() {
            // SAFETY: the inner layer just handed out this view and still holds its owner.
            let shadow: Box<[u8]> = unsafe { buffer.as_slice() }.into();
            buffer.ptr = shadow.as_ptr();
            self.shadows.insert(buffer.token, shadow);
        }
        Ok(buffer)
    }

    fn buffer_release(&mut self, token: u64) -> Result<(), PyniError> {
        self.check_token(token, FunctionId::BufferRelease)?;
        self.inner.buffer_release(token)?;
        if let Some(shadow) = self.shadows.remove(&token) {
            self.park_released(shadow);
        }
        Ok(())
    }

    fn bytes_from_buffer(&mut self, token: u64) -> Result<Handle, PyniError> {
        self.check_token(token, FunctionId::BytesFromBuffer)?;
        self.inner.bytes_from_buffer(token)
    }

    fn buffer_lookup(&self, token: u64) -> BufferLookup {
        self.inner.buffer_lookup(token)
    }
}
