//! Process-wide runtime: offered tables, loaded extensions, heap storage and contexts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use pyni_core::{Diagnostics, Handle, LayoutKind, ObjectRef, ObjectSpace, PyniError};

use crate::callconv::LoadedFunction;
use crate::config::RuntimeConfig;
use crate::context::{ContextCell, ContextPool, ContextPtr, ContextView};
use crate::descriptor::{EntryPointFn, ExtensionDescriptor};
use crate::heap::{HeapStore, StorageSite};
use crate::negotiate::{negotiate, HostOffer, NegotiatedVTable};
use crate::session::Session;
use crate::vtable::VTable;

pub(crate) struct RuntimeShared {
    pub(crate) config: RuntimeConfig,
    pub(crate) offer: HostOffer,
    pub(crate) space: Arc<dyn ObjectSpace>,
    pub(crate) heap: Arc<HeapStore>,
    pub(crate) diagnostics: Arc<Diagnostics>,
    pub(crate) contexts: ContextPool,
    tables: BTreeMap<u32, Box<VTable>>,
    next_extension: AtomicU32,
}

impl RuntimeShared {
    pub(crate) fn table(&self, version: u32) -> Option<&VTable> {
        self.tables.get(&version).map(|table| &**table)
    }
}

impl Drop for RuntimeShared {
    fn drop(&mut self) {
        for backing in self.heap.drain() {
            self.space.release(backing);
        }
    }
}

/// An extension that passed validation and negotiation.
#[derive(Debug)]
pub struct LoadedExtension {
    id: u32,
    label: Arc<str>,
    descriptor: ExtensionDescriptor,
    negotiated: NegotiatedVTable,
    functions: Vec<LoadedFunction>,
    checked: bool,
}

impl LoadedExtension {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn label(&self) -> &Arc<str> {
        &self.label
    }

    pub fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }

    /// Table version every context handed to this extension is built for.
    pub fn negotiated(&self) -> NegotiatedVTable {
        self.negotiated
    }

    pub fn functions(&self) -> &[LoadedFunction] {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&LoadedFunction> {
        self.functions.iter().find(|f| &*f.name == name)
    }

    /// Whether debug checks apply to calls into this extension.
    pub fn is_checked(&self) -> bool {
        self.checked
    }
}

/// Shared runtime handle. Cheap to clone; open one [`Session`] per calling thread.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, space: Arc<dyn ObjectSpace>) -> Result<Self, PyniError> {
        config.validate()?;
        let diagnostics = Arc::new(Diagnostics::with_limit(config.diagnostics_limit));
        let tables = config
            .offered_versions
            .iter()
            .map(|version| (*version, Box::new(VTable::universal(*version))))
            .collect();
        let contexts = ContextPool::new(config.context_quarantine, diagnostics.clone());
        tracing::info!(
            debug = config.debug,
            versions = ?config.offered_versions,
            window = %config.abi_window,
            "runtime created"
        );
        Ok(Self {
            shared: Arc::new(RuntimeShared {
                offer: config.offer(),
                config,
                space,
                heap: Arc::new(HeapStore::new()),
                diagnostics,
                contexts,
                tables,
                next_extension: AtomicU32::new(1),
            }),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn offer(&self) -> &HostOffer {
        &self.shared.offer
    }

    pub fn space(&self) -> &Arc<dyn ObjectSpace> {
        &self.shared.space
    }

    pub fn heap(&self) -> &HeapStore {
        &self.shared.heap
    }

    /// Violations recorded by the debug layer.
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }

    /// Table served for `version`, if offered.
    pub fn vtable(&self, version: u32) -> Option<&VTable> {
        self.shared.table(version)
    }

    /// Number of context cells allocated so far.
    pub fn context_cells(&self) -> usize {
        self.shared.contexts.len()
    }

    /// Host-side state of a context value.
    ///
    /// # Safety
    ///
    /// `ctx` must be null or a context handed out by this runtime.
    pub unsafe fn context_view(&self, ctx: ContextPtr) -> Option<ContextView> {
        ContextCell::from_public(ctx).map(ContextCell::view)
    }

    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.shared))
    }

    /// Validates signatures, negotiates a table version and returns the loaded extension.
    /// Nothing is retained on failure.
    pub fn load(&self, descriptor: ExtensionDescriptor) -> Result<Arc<LoadedExtension>, PyniError> {
        let functions = descriptor
            .validate_functions()
            .map_err(|err| err.with_context("extension", descriptor.name.clone()))?;
        let negotiated = negotiate(&self.shared.offer, &descriptor)?;
        let debug = self.shared.config.debug;
        let checked = debug && negotiated.layout == LayoutKind::Universal;
        if debug && !checked {
            tracing::warn!(
                extension = %descriptor.name,
                "debug mode needs the universal layout; extension runs without checks"
            );
        }
        let id = self.shared.next_extension.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            extension = %descriptor.name,
            id,
            requested = negotiated.requested,
            negotiated = negotiated.version,
            layout = ?negotiated.layout,
            functions = functions.len(),
            "extension loaded"
        );
        Ok(Arc::new(LoadedExtension {
            id,
            label: Arc::from(descriptor.name.as_str()),
            descriptor,
            negotiated,
            functions,
            checked,
        }))
    }

    /// Calls an entry point and loads the descriptor it returns.
    ///
    /// # Safety
    ///
    /// `entry` must return null or a descriptor that stays valid for the duration of the call.
    pub unsafe fn load_entry(&self, entry: EntryPointFn) -> Result<Arc<LoadedExtension>, PyniError> {
        let raw = entry();
        let descriptor = ExtensionDescriptor::from_raw(raw)?;
        self.load(descriptor)
    }

    /// Binds `obj` to module state slot `slot` of `extension`. The caller keeps its reference.
    pub fn store_module_state(
        &self,
        extension: &LoadedExtension,
        slot: u32,
        obj: ObjectRef,
    ) -> Result<Handle, PyniError> {
        let site = StorageSite::Module {
            extension: extension.id,
            slot,
        };
        self.shared.space.retain(obj);
        let stored = self.shared.heap.store(site, obj).map_err(|err| {
            self.shared.space.release(obj);
            err
        })?;
        if let Some(previous) = stored.replaced {
            self.shared.space.release(previous);
        }
        Ok(stored.handle)
    }

    /// Borrowed reference to a module state slot.
    pub fn module_state(&self, extension: &LoadedExtension, slot: u32) -> Option<ObjectRef> {
        self.shared
            .heap
            .lookup_site(StorageSite::Module {
                extension: extension.id,
                slot,
            })
            .map(|(_, obj)| obj)
    }

    pub fn clear_module_state(&self, extension: &LoadedExtension, slot: u32) -> bool {
        let site = StorageSite::Module {
            extension: extension.id,
            slot,
        };
        match self.shared.heap.clear(site) {
            Some(previous) => {
                self.shared.space.release(previous);
                true
            }
            None => false,
        }
    }

    /// Releases every module state slot of `extension`. Returns how many were bound.
    pub fn unload(&self, extension: &LoadedExtension) -> usize {
        let released = self.shared.heap.release_extension(extension.id);
        for obj in &released {
            self.shared.space.release(*obj);
        }
        tracing::info!(
            extension = %extension.label,
            id = extension.id,
            module_state = released.len(),
            "extension unloaded"
        );
        released.len()
    }

    /// Drops every field stored on `owner`; the object model calls this when `owner` dies.
    pub fn release_storage_owner(&self, owner: ObjectRef) -> usize {
        let released = self.shared.heap.release_owner(owner);
        for obj in &released {
            self.shared.space.release(*obj);
        }
        released.len()
    }
}
