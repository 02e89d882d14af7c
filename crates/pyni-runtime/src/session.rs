//! Per-thread call state and the host side of a call.

use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

use pyni_core::{
    DiagnosticSink, ErrorInfo, LayoutKind, LegacyRef, ObjectRef, PyniError, ViolationKind,
};

use crate::callconv::{
    box_return, select, unbox_args, CallSiteInfo, Entry, EntryPoint, LegacyFn, LoadedFunction,
    OptimizedFn, PrimitiveValue, Signature, StandardFn,
};
use crate::context::{
    invalid_close, ContextCell, ContextOrigin, ContextPtr, ContextRequest, ContextState,
};
use crate::debug::DebugApi;
use crate::dispatch::{ContextPolicy, FrameLabel, HostApi, ReleaseApi};
use crate::handles::FrameReport;
use crate::runtime::{LoadedExtension, RuntimeShared};
use crate::thunks::CurrentSession;
use crate::vtable::VTable;

const HOST_LABEL: &str = "<host>";

pub(crate) struct SessionCell {
    pub(crate) api: RefCell<Box<dyn HostApi>>,
}

struct CallContext<'a> {
    cell: &'a ContextCell,
    per_call: bool,
}

fn call_error(code: &str, message: impl Into<String>) -> PyniError {
    PyniError::Api(ErrorInfo::new(code, message))
}

/// Call state of one thread: its handle table, pending error, buffers and contexts.
///
/// Not `Send`; create one per thread from a shared [`Runtime`](crate::Runtime).
pub struct Session {
    shared: Arc<RuntimeShared>,
    cell: Box<SessionCell>,
    cached: RefCell<HashMap<(u32, LayoutKind), *const ContextCell>>,
    synthesized: RefCell<Vec<*const ContextCell>>,
}

impl Session {
    pub(crate) fn new(shared: Arc<RuntimeShared>) -> Self {
        let release = ReleaseApi::new(Arc::clone(&shared.space), Arc::clone(&shared.heap));
        let api: Box<dyn HostApi> = if shared.config.debug {
            let sink: Arc<dyn DiagnosticSink> = shared.diagnostics.clone();
            Box::new(DebugApi::new(release, sink, shared.config.buffer_quarantine))
        } else {
            Box::new(release)
        };
        Self {
            shared,
            cell: Box::new(SessionCell {
                api: RefCell::new(api),
            }),
            cached: RefCell::new(HashMap::new()),
            synthesized: RefCell::new(Vec::new()),
        }
    }

    fn api(&self) -> Result<RefMut<'_, Box<dyn HostApi>>, PyniError> {
        self.cell.api.try_borrow_mut().map_err(|_| {
            call_error("pyni.session_busy", "session is already dispatching a call")
        })
    }

    fn cell_ptr(&self) -> *const SessionCell {
        &*self.cell as *const SessionCell
    }

    /// Calls `function`, choosing the entry point from the argument objects.
    pub fn call(
        &self,
        extension: &LoadedExtension,
        function: &str,
        args: &[ObjectRef],
    ) -> Result<ObjectRef, PyniError> {
        let site = CallSiteInfo::inspect(self.shared.space.as_ref(), args);
        self.call_with(extension, function, args, &site)
    }

    /// Calls `function` with caller-provided knowledge about the arguments.
    pub fn call_with(
        &self,
        extension: &LoadedExtension,
        function: &str,
        args: &[ObjectRef],
        site: &CallSiteInfo,
    ) -> Result<ObjectRef, PyniError> {
        let loaded = extension.function(function).ok_or_else(|| {
            call_error(
                "pyni.unknown_function",
                format!("extension `{}` exports no `{function}`", extension.name()),
            )
        })?;
        let entry = select(loaded, site);
        self.invoke(extension, loaded, entry, args)
    }

    /// Runs one host→extension call on an already selected entry point.
    ///
    /// `args` stay owned by the caller; the returned reference is owned by the caller.
    pub fn invoke(
        &self,
        extension: &LoadedExtension,
        function: &LoadedFunction,
        entry: EntryPoint<'_>,
        args: &[ObjectRef],
    ) -> Result<ObjectRef, PyniError> {
        if !function.arity.accepts(args.len()) {
            return Err(call_error(
                "pyni.arity",
                format!(
                    "`{}` takes {:?} arguments, {} given",
                    function.name,
                    function.arity,
                    args.len()
                ),
            ));
        }
        let ctx = self.context_for(extension)?;
        let label = FrameLabel::new(
            Arc::clone(extension.label()),
            Arc::clone(&function.name),
            extension.is_checked(),
        );
        let frame = match self.api().and_then(|mut api| api.enter_frame(label)) {
            Ok(frame) => frame,
            Err(err) => {
                self.finish_context(ctx);
                return Err(err);
            }
        };
        let outcome = {
            let _current = CurrentSession::enter(&self.cell);
            let public = ctx.cell.public_ptr();
            match entry {
                EntryPoint::Standard(func) => self.run_standard(public, func, args),
                EntryPoint::Optimized { func, signature } => {
                    match unbox_args(self.shared.space.as_ref(), signature, args) {
                        Some(values) => self.run_optimized(public, func, signature, values),
                        None => self.run_fallback(public, function, signature, args),
                    }
                }
                EntryPoint::Legacy(func) => self.run_legacy(func, args),
            }
        };
        let exit = self.api().and_then(|mut api| api.exit_frame(frame));
        self.finish_context(ctx);
        match (outcome, exit) {
            (Ok(result), Ok(_)) => Ok(result),
            (Ok(result), Err(err)) => {
                self.shared.space.release(result);
                Err(err)
            }
            (Err(err), _) => Err(err),
        }
    }

    fn run_standard(
        &self,
        ctx: ContextPtr,
        func: StandardFn,
        args: &[ObjectRef],
    ) -> Result<ObjectRef, PyniError> {
        let argv = {
            let mut api = self.api()?;
            args.iter()
                .map(|obj| api.open_argument(*obj))
                .collect::<Result<Vec<_>, _>>()?
        };
        // SAFETY: `argv` outlives the call and `ctx` is live until the frame exits.
        let result = unsafe { func(ctx, argv.as_ptr(), argv.len()) };
        let mut api = self.api()?;
        if let Some(err) = api.take_error() {
            if !result.is_null() {
                if let Ok(obj) = api.take_result(result) {
                    self.shared.space.release(obj);
                }
            }
            return Err(err);
        }
        if result.is_null() {
            return Err(call_error(
                "pyni.null_result",
                "function returned NULL without setting an error",
            ));
        }
        api.take_result(result)
    }

    fn run_optimized(
        &self,
        ctx: ContextPtr,
        func: OptimizedFn,
        signature: &Signature,
        values: Vec<PrimitiveValue>,
    ) -> Result<ObjectRef, PyniError> {
        let space = self.shared.space.as_ref();
        let mut out = PrimitiveValue::int(0);
        // SAFETY: `values` and `out` outlive the call and `ctx` is live until the frame exits.
        let status = unsafe { func(ctx, values.as_ptr(), values.len(), &mut out) };
        if let Some(err) = self.api()?.take_error() {
            return Err(err);
        }
        if status != 0 {
            return Err(call_error(
                "pyni.optimized_failed",
                format!("optimized entry returned status {status} without setting an error"),
            ));
        }
        Ok(box_return(space, signature.ret, out))
    }

    /// Declared kinds that turn out wrong send the call down the standard entry instead.
    fn run_fallback(
        &self,
        ctx: ContextPtr,
        function: &LoadedFunction,
        signature: &Signature,
        args: &[ObjectRef],
    ) -> Result<ObjectRef, PyniError> {
        let Entry::Standard(func) = function.entry else {
            return Err(call_error(
                "pyni.type_error",
                format!("arguments do not match signature `{signature}`"),
            ));
        };
        tracing::debug!(
            function = %function.name,
            signature = %signature,
            "arguments do not fit the optimized signature"
        );
        self.run_standard(ctx, func, args)
    }

    fn run_legacy(&self, func: LegacyFn, args: &[ObjectRef]) -> Result<ObjectRef, PyniError> {
        let refs: Vec<LegacyRef> = args.iter().map(|obj| LegacyRef::from_object(*obj)).collect();
        // SAFETY: the host keeps every argument alive for the duration of the call.
        let out = unsafe { func(refs.as_ptr(), refs.len()) };
        if let Some(err) = self.api()?.take_error() {
            return Err(err);
        }
        let space = &self.shared.space;
        let obj = out
            .object()
            .filter(|obj| space.kind(*obj).is_some())
            .ok_or_else(|| call_error("pyni.null_result", "legacy function returned NULL"))?;
        space.retain(obj);
        Ok(obj)
    }

    fn context_for(&self, extension: &LoadedExtension) -> Result<CallContext<'_>, PyniError> {
        let negotiated = extension.negotiated();
        let vtable: *const VTable = match negotiated.layout {
            LayoutKind::Universal => self
                .shared
                .table(negotiated.version)
                .map(|table| table as *const VTable)
                .ok_or_else(|| {
                    PyniError::violation(
                        ViolationKind::InvalidContext,
                        format!("table version {} is not offered", negotiated.version),
                    )
                })?,
            LayoutKind::VersionSpecific => ptr::null(),
        };
        let request = ContextRequest {
            version: negotiated.version,
            vtable,
            origin: ContextOrigin::Inherited,
            debug: extension.is_checked(),
            session: self.cell_ptr(),
            frame: None,
        };
        let policy = self.api()?.context_policy(negotiated.layout);
        match policy {
            ContextPolicy::PerCall => Ok(CallContext {
                cell: self.shared.contexts.acquire(request),
                per_call: true,
            }),
            ContextPolicy::PerSession => {
                let key = (negotiated.version, negotiated.layout);
                if let Some(cell) = self.cached.borrow().get(&key) {
                    // SAFETY: cells live as long as the runtime, which this session keeps alive.
                    let cell = unsafe { &**cell };
                    return Ok(CallContext {
                        cell,
                        per_call: false,
                    });
                }
                let cell = self.shared.contexts.acquire(request);
                self.cached
                    .borrow_mut()
                    .insert(key, cell as *const ContextCell);
                Ok(CallContext {
                    cell,
                    per_call: false,
                })
            }
        }
    }

    fn finish_context(&self, ctx: CallContext<'_>) {
        if ctx.per_call {
            self.shared
                .contexts
                .retire(ctx.cell, ContextState::Released);
        }
    }

    /// Synthesizes a context for `version`. It opens its own frame and must be closed with
    /// [`Session::close_context`], innermost first.
    pub fn create_context(&self, version: u32) -> Result<ContextPtr, PyniError> {
        let table = self.shared.table(version).ok_or_else(|| {
            PyniError::violation(
                ViolationKind::InvalidContext,
                format!("table version {version} is not offered"),
            )
        })?;
        let checked = self.shared.config.debug;
        let label = FrameLabel::new(Arc::from(HOST_LABEL), Arc::from("<synthesized>"), checked);
        let frame = self.api()?.enter_frame(label)?;
        let cell = self.shared.contexts.acquire(ContextRequest {
            version,
            vtable: table as *const VTable,
            origin: ContextOrigin::Synthesized,
            debug: checked,
            session: self.cell_ptr(),
            frame: Some(frame),
        });
        self.synthesized
            .borrow_mut()
            .push(cell as *const ContextCell);
        tracing::debug!(version, "synthesized context created");
        Ok(cell.public_ptr())
    }

    /// Closes a context created by [`Session::create_context`] on this session.
    pub fn close_context(&self, ctx: ContextPtr) -> Result<(), PyniError> {
        let cell = match self.closable(ctx) {
            Ok(cell) => cell,
            Err(err) => {
                if let Ok(mut api) = self.api() {
                    api.observe_violation(&err);
                }
                return Err(err);
            }
        };
        if let Some(frame) = cell.frame() {
            self.api()?.exit_frame(frame)?;
        }
        self.shared.contexts.retire(cell, ContextState::Closed);
        self.synthesized
            .borrow_mut()
            .retain(|synthesized| *synthesized != cell as *const ContextCell);
        Ok(())
    }

    fn closable(&self, ctx: ContextPtr) -> Result<&ContextCell, PyniError> {
        // SAFETY: context values originate from this runtime's pool, whose cells outlive every
        // session of the runtime.
        let cell = unsafe { ContextCell::from_public(ctx) }
            .ok_or_else(|| invalid_close("the context is null"))?;
        if cell.origin() == ContextOrigin::Inherited {
            return Err(invalid_close("it was inherited from a call"));
        }
        if cell.state() != ContextState::Live {
            return Err(invalid_close("it is already closed"));
        }
        if cell.session() != self.cell_ptr() || !cell.owned_by_current_thread() {
            return Err(invalid_close("it was created by another session"));
        }
        Ok(cell)
    }

    /// Runs host code inside a fresh frame with direct access to the dispatch layer.
    pub fn scoped<R>(
        &self,
        f: impl FnOnce(&mut dyn HostApi) -> Result<R, PyniError>,
    ) -> Result<(R, FrameReport), PyniError> {
        let checked = self.shared.config.debug;
        let label = FrameLabel::new(Arc::from(HOST_LABEL), Arc::from("<scoped>"), checked);
        let mut api = self.api()?;
        let frame = api.enter_frame(label)?;
        let outcome = f(&mut **api);
        let report = api.exit_frame(frame)?;
        outcome.map(|value| (value, report))
    }

    /// Number of open local scopes across this session's active frames.
    pub fn open_handles(&self) -> Result<usize, PyniError> {
        Ok(self.api()?.handles().open_count())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let pending: Vec<*const ContextCell> =
            self.synthesized.get_mut().drain(..).rev().collect();
        if let Ok(mut api) = self.cell.api.try_borrow_mut() {
            for cell in pending {
                // SAFETY: the runtime, and with it every cell, outlives this session.
                let cell = unsafe { &*cell };
                api.observe_violation(&PyniError::violation(
                    ViolationKind::InvalidContext,
                    "synthesized context was never closed",
                ));
                if let Some(frame) = cell.frame() {
                    if let Err(err) = api.exit_frame(frame) {
                        tracing::debug!(error = %err, "unwinding synthesized frame failed");
                    }
                }
            }
        }
        self.shared.contexts.detach_session(self.cell_ptr());
    }
}
