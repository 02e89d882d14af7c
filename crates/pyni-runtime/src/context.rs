//! Contexts and the host-private cells behind them.
//!
//! The value an extension sees is a pointer to the public [`Context`]. It is the tail of a
//! [`ContextCell`] whose prefix holds host bookkeeping; the host walks back from the public
//! pointer to reach it. Cells are boxed and owned by the runtime's [`ContextPool`] until the
//! runtime drops, so a context value an extension kept around can always be inspected safely.

use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pyni_core::{DiagnosticSink, LayoutKind, PyniError, Violation, ViolationKind};
use serde::{Deserialize, Serialize};

use crate::handles::FrameId;
use crate::session::SessionCell;
use crate::vtable::VTable;

/// Public part of a context.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    abi_version: u32,
    vtable: *const VTable,
}

impl Context {
    /// Table version this context was built for.
    pub fn abi_version(&self) -> u32 {
        self.abi_version
    }

    /// The wrapped table; null for version-specific placeholders.
    pub fn vtable_ptr(&self) -> *const VTable {
        self.vtable
    }
}

/// Opaque context value passed to every extension-visible function.
pub type ContextPtr = *const Context;

/// Lifecycle state of a context cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Parked in the pool, not handed out.
    Free,
    /// Valid for calls.
    Live,
    /// Inherited context whose call returned.
    Released,
    /// Synthesized context closed by its creator.
    Closed,
    /// Owning session is gone.
    Detached,
}

impl ContextState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ContextState::Live,
            2 => ContextState::Released,
            3 => ContextState::Closed,
            4 => ContextState::Detached,
            _ => ContextState::Free,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            ContextState::Free => 0,
            ContextState::Live => 1,
            ContextState::Released => 2,
            ContextState::Closed => 3,
            ContextState::Detached => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextOrigin {
    /// Passed in by the host for one call.
    Inherited,
    /// Created through `Session::create_context`; its creator must close it.
    Synthesized,
}

/// Snapshot of a cell handed to the dispatch layer on every API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextView {
    pub serial: u64,
    pub state: ContextState,
    pub origin: ContextOrigin,
    pub version: u32,
    pub layout: LayoutKind,
}

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn current_thread_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

struct ContextPrivate {
    index: usize,
    sink: Arc<dyn DiagnosticSink>,
    serial: AtomicU64,
    state: AtomicU8,
    synthesized: AtomicBool,
    debug: AtomicBool,
    thread: AtomicU64,
    frame: AtomicU32,
    session: AtomicPtr<SessionCell>,
}

#[repr(C)]
pub(crate) struct ContextCell {
    private: ContextPrivate,
    public: Context,
}

// SAFETY: the public part is immutable after construction and only ever read; every mutable
// field in the private prefix is atomic. The session pointer is dereferenced only on the thread
// recorded in `thread`.
unsafe impl Send for ContextCell {}
unsafe impl Sync for ContextCell {}

impl ContextCell {
    /// Walks back from a context value to its cell.
    ///
    /// # Safety
    ///
    /// `ctx` must be null or a value produced by [`ContextCell::public_ptr`] of a runtime that
    /// is still alive.
    pub(crate) unsafe fn from_public<'a>(ctx: ContextPtr) -> Option<&'a ContextCell> {
        if ctx.is_null() {
            return None;
        }
        let offset = std::mem::offset_of!(ContextCell, public);
        let cell = (ctx as *const u8).sub(offset) as *const ContextCell;
        Some(&*cell)
    }

    pub(crate) fn public_ptr(&self) -> ContextPtr {
        &self.public as *const Context
    }

    pub(crate) fn state(&self) -> ContextState {
        ContextState::from_raw(self.private.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ContextState) {
        self.private.state.store(state.as_raw(), Ordering::SeqCst);
    }

    pub(crate) fn origin(&self) -> ContextOrigin {
        if self.private.synthesized.load(Ordering::SeqCst) {
            ContextOrigin::Synthesized
        } else {
            ContextOrigin::Inherited
        }
    }

    pub(crate) fn frame(&self) -> Option<FrameId> {
        FrameId::from_raw(self.private.frame.load(Ordering::SeqCst))
    }

    pub(crate) fn session(&self) -> *const SessionCell {
        self.private.session.load(Ordering::SeqCst)
    }

    pub(crate) fn owned_by_current_thread(&self) -> bool {
        self.private.thread.load(Ordering::SeqCst) == current_thread_tag()
    }

    pub(crate) fn view(&self) -> ContextView {
        ContextView {
            serial: self.private.serial.load(Ordering::SeqCst),
            state: self.state(),
            origin: self.origin(),
            version: self.public.abi_version,
            layout: if self.public.vtable.is_null() {
                LayoutKind::VersionSpecific
            } else {
                LayoutKind::Universal
            },
        }
    }

    /// Reports a misuse that cannot be routed through the owning session.
    pub(crate) fn report_unroutable(&self, err: &PyniError) {
        if !self.private.debug.load(Ordering::SeqCst) {
            return;
        }
        if let Some(kind) = err.violation_kind() {
            self.private.sink.report(
                Violation::new(kind, err.info().message.clone())
                    .with_subject(self.public_ptr() as u64),
            );
        }
    }
}

/// Parameters for handing out a context.
pub(crate) struct ContextRequest {
    pub version: u32,
    pub vtable: *const VTable,
    pub origin: ContextOrigin,
    pub debug: bool,
    pub session: *const SessionCell,
    pub frame: Option<FrameId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    version: u32,
    vtable: usize,
}

#[derive(Default)]
struct PoolInner {
    cells: Vec<Box<ContextCell>>,
    free: HashMap<PoolKey, Vec<usize>>,
    quarantine: VecDeque<usize>,
    next_serial: u64,
}

impl PoolInner {
    fn park(&mut self, index: usize, quarantine_limit: usize) {
        self.quarantine.push_back(index);
        while self.quarantine.len() > quarantine_limit {
            let Some(oldest) = self.quarantine.pop_front() else {
                break;
            };
            let cell = &self.cells[oldest];
            cell.set_state(ContextState::Free);
            cell.private
                .session
                .store(ptr::null_mut(), Ordering::SeqCst);
            let key = PoolKey {
                version: cell.public.abi_version,
                vtable: cell.public.vtable as usize,
            };
            self.free.entry(key).or_default().push(oldest);
        }
    }
}

/// Owner of every context cell a runtime ever handed out.
///
/// Released cells sit in a bounded quarantine before they become reusable, and are only reused
/// for the same version and table so the public part never changes.
pub(crate) struct ContextPool {
    inner: Mutex<PoolInner>,
    quarantine_limit: usize,
    sink: Arc<dyn DiagnosticSink>,
}

impl ContextPool {
    pub(crate) fn new(quarantine_limit: usize, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            quarantine_limit,
            sink,
        }
    }

    fn cell_ref<'a>(&'a self, cell: &ContextCell) -> &'a ContextCell {
        // SAFETY: cells are boxed and never dropped before the pool itself.
        unsafe { &*(cell as *const ContextCell) }
    }

    pub(crate) fn acquire(&self, request: ContextRequest) -> &ContextCell {
        let mut inner = self.inner.lock();
        inner.next_serial += 1;
        let serial = inner.next_serial;
        let key = PoolKey {
            version: request.version,
            vtable: request.vtable as usize,
        };
        let reused = inner.free.get_mut(&key).and_then(Vec::pop);
        let index = match reused {
            Some(index) => index,
            None => {
                let index = inner.cells.len();
                inner.cells.push(Box::new(ContextCell {
                    private: ContextPrivate {
                        index,
                        sink: Arc::clone(&self.sink),
                        serial: AtomicU64::new(0),
                        state: AtomicU8::new(ContextState::Free.as_raw()),
                        synthesized: AtomicBool::new(false),
                        debug: AtomicBool::new(false),
                        thread: AtomicU64::new(0),
                        frame: AtomicU32::new(0),
                        session: AtomicPtr::new(ptr::null_mut()),
                    },
                    public: Context {
                        abi_version: request.version,
                        vtable: request.vtable,
                    },
                }));
                index
            }
        };
        let cell = &inner.cells[index];
        let private = &cell.private;
        private.serial.store(serial, Ordering::SeqCst);
        private.synthesized.store(
            request.origin == ContextOrigin::Synthesized,
            Ordering::SeqCst,
        );
        private.debug.store(request.debug, Ordering::SeqCst);
        private
            .thread
            .store(current_thread_tag(), Ordering::SeqCst);
        private.frame.store(
            request.frame.map_or(0, FrameId::as_raw),
            Ordering::SeqCst,
        );
        private
            .session
            .store(request.session as *mut SessionCell, Ordering::SeqCst);
        cell.set_state(ContextState::Live);
        tracing::debug!(
            serial,
            version = request.version,
            origin = ?request.origin,
            "context handed out"
        );
        self.cell_ref(cell)
    }

    /// Ends a live context and parks it in quarantine.
    pub(crate) fn retire(&self, cell: &ContextCell, state: ContextState) {
        let mut inner = self.inner.lock();
        if cell.state() != ContextState::Live {
            return;
        }
        cell.set_state(state);
        inner.park(cell.private.index, self.quarantine_limit);
    }

    /// Detaches every cell of a session that is going away.
    pub(crate) fn detach_session(&self, session: *const SessionCell) {
        let mut inner = self.inner.lock();
        let owned: Vec<usize> = inner
            .cells
            .iter()
            .filter(|cell| cell.session() == session)
            .map(|cell| cell.private.index)
            .collect();
        for index in owned {
            let cell = &inner.cells[index];
            cell.private
                .session
                .store(ptr::null_mut(), Ordering::SeqCst);
            if cell.state() == ContextState::Live {
                cell.set_state(ContextState::Detached);
                inner.park(index, self.quarantine_limit);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().cells.len()
    }
}

/// Builds the error raised when a context is closed by someone other than its creator.
pub(crate) fn invalid_close(reason: &str) -> PyniError {
    PyniError::violation(
        ViolationKind::InvalidContext,
        format!("context cannot be closed: {reason}"),
    )
}
