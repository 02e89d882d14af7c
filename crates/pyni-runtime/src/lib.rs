//! Host runtime for PyNI extensions: handle tables, versioned function tables, context
//! lifecycle, load-time ABI negotiation, calling-convention selection and the debug layer.

pub mod buffer;
pub mod callconv;
pub mod config;
mod context;
mod debug;
pub mod descriptor;
mod dispatch;
pub mod handles;
pub mod heap;
pub mod layout;
mod negotiate;
mod objspace;
mod runtime;
mod session;
mod thunks;
pub mod vtable;

pub use buffer::RawBuffer;
pub use callconv::{
    select, Arity, CallSiteInfo, EntryPoint, LoadedFunction, PrimitiveKind, PrimitiveValue,
    Signature,
};
pub use config::{RuntimeConfig, DEBUG_ENV};
pub use context::{Context, ContextOrigin, ContextPtr, ContextState, ContextView};
pub use debug::DebugApi;
pub use descriptor::{
    DescriptorSummary, EntryPointFn, ExtensionDescriptor, FunctionDef, RawDescriptor,
    DESCRIPTOR_STRUCT_VERSION, ENTRY_SYMBOL,
};
pub use dispatch::{BufferLookup, ContextPolicy, FrameLabel, HostApi, ReleaseApi};
pub use handles::{FrameId, FrameReport, HandleTable, Lookup, Origin};
pub use heap::{HeapStore, StorageSite};
pub use layout::{AbiLayout, ActiveApi, ActiveLayout, Api, Universal, VersionSpecific};
pub use negotiate::{negotiate, HostOffer, NegotiatedVTable, HOST_ABI_TAG};
pub use objspace::RcHeap;
pub use runtime::{LoadedExtension, Runtime};
pub use session::Session;
pub use vtable::{FunctionId, VTable, LATEST_VERSION};

pub use pyni_core::{
    AbiWindow, Diagnostics, ErrorInfo, Handle, HandleKind, LayoutKind, LegacyRef, ListHandle,
    ObjectKind, ObjectRef, ObjectSpace, PyniError, Violation, ViolationKind,
};
