#![deny(missing_docs)]
#![doc = "Core handle, object-model, version and error types for the PyNI universal ABI."]

pub mod diagnostics;
pub mod errors;
pub mod handle;
pub mod object;
pub mod version;

pub use diagnostics::{DiagnosticSink, Diagnostics, Violation};
pub use errors::{ErrorInfo, PyniError, ViolationKind};
pub use handle::{Handle, HandleKind, ListHandle};
pub use object::{LegacyRef, ObjectKind, ObjectRef, ObjectSpace};
pub use version::{AbiWindow, LayoutKind};
