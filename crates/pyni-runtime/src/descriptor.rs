//! Extension descriptors: the `#[repr(C)]` form returned by an entry point and the owned form
//! the runtime works with.

use std::collections::BTreeSet;
use std::ffi::c_char;
use std::sync::Arc;

use pyni_core::{AbiWindow, ErrorInfo, LayoutKind, PyniError};
use serde::{Deserialize, Serialize};

use crate::callconv::{
    Arity, Entry, LegacyFn, LoadedFunction, OptimizedEntry, OptimizedFn, Signature, StandardFn,
};

/// Symbol every extension library exports.
pub const ENTRY_SYMBOL: &[u8] = b"pyni_extension_entry\0";

/// Newest descriptor layout this build understands.
pub const DESCRIPTOR_STRUCT_VERSION: u32 = 1;

/// Signature of the entry point. It receives no context and must not call the API.
pub type EntryPointFn = unsafe extern "C" fn() -> *const RawDescriptor;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiString {
    pub ptr: *const c_char,
    pub len: usize,
}

// SAFETY: descriptors are immutable static data owned by the extension library.
unsafe impl Send for AbiString {}
unsafe impl Sync for AbiString {}

impl AbiString {
    pub const EMPTY: AbiString = AbiString {
        ptr: std::ptr::null(),
        len: 0,
    };

    pub const fn from_static(text: &'static str) -> Self {
        AbiString {
            ptr: text.as_ptr() as *const c_char,
            len: text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.len == 0
    }

    /// # Safety
    ///
    /// `ptr` must be null or point to `len` readable bytes that outlive `'a`.
    pub unsafe fn as_str<'a>(&self) -> Result<&'a str, PyniError> {
        if self.is_empty() {
            return Ok("");
        }
        let bytes = std::slice::from_raw_parts(self.ptr as *const u8, self.len);
        std::str::from_utf8(bytes).map_err(|err| {
            PyniError::Load(ErrorInfo::new(
                "pyni.descriptor_utf8",
                format!("descriptor string is not valid UTF-8: {err}"),
            ))
        })
    }
}

/// Raw calling convention tags.
pub const CONVENTION_STANDARD: u32 = 0;
pub const CONVENTION_LEGACY: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawFunctionDef {
    pub name: AbiString,
    pub convention: u32,
    /// Declared argument count, `-1` for variadic.
    pub arity: i32,
    pub standard: Option<StandardFn>,
    pub legacy: Option<LegacyFn>,
    pub optimized: Option<OptimizedFn>,
    pub signature: AbiString,
}

unsafe impl Send for RawFunctionDef {}
unsafe impl Sync for RawFunctionDef {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDescriptor {
    /// Oldest host descriptor layout able to interpret this struct.
    pub struct_version: u32,
    pub abi_major: u16,
    pub abi_minor: u16,
    pub requested_vtable_version: u32,
    pub layout: u32,
    /// Build tag of the host a version-specific extension was compiled against.
    pub host_tag: u64,
    pub name: AbiString,
    pub functions: *const RawFunctionDef,
    pub function_count: usize,
}

unsafe impl Send for RawDescriptor {}
unsafe impl Sync for RawDescriptor {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Convention {
    Standard,
    Legacy,
}

/// One exported function as declared by the extension.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub convention: Convention,
    pub arity: Arity,
    pub standard: Option<StandardFn>,
    pub legacy: Option<LegacyFn>,
    pub optimized: Option<OptimizedFn>,
    pub signature: Option<String>,
}

impl FunctionDef {
    pub fn standard(name: impl Into<String>, arity: Arity, func: StandardFn) -> Self {
        Self {
            name: name.into(),
            convention: Convention::Standard,
            arity,
            standard: Some(func),
            legacy: None,
            optimized: None,
            signature: None,
        }
    }

    pub fn legacy(name: impl Into<String>, arity: Arity, func: LegacyFn) -> Self {
        Self {
            name: name.into(),
            convention: Convention::Legacy,
            arity,
            standard: None,
            legacy: Some(func),
            optimized: None,
            signature: None,
        }
    }

    pub fn with_optimized(mut self, signature: impl Into<String>, func: OptimizedFn) -> Self {
        self.signature = Some(signature.into());
        self.optimized = Some(func);
        self
    }

    /// Checks the calling-convention metadata and produces the runtime's view of the function.
    pub fn validate(&self) -> Result<LoadedFunction, PyniError> {
        let mismatch = |reason: &str| {
            PyniError::signature_mismatch(format!("function `{}` {reason}", self.name))
                .with_context("function", self.name.clone())
        };
        if self.name.is_empty() {
            return Err(PyniError::signature_mismatch("function with an empty name"));
        }
        let entry = match (self.convention, self.standard, self.legacy) {
            (Convention::Standard, Some(func), None) => Entry::Standard(func),
            (Convention::Legacy, None, Some(func)) => Entry::Legacy(func),
            (Convention::Standard, None, _) | (Convention::Legacy, _, None) => {
                return Err(mismatch("has no entry point for its calling convention"))
            }
            _ => return Err(mismatch("declares entry points for both calling conventions")),
        };
        let optimized = match (&self.signature, self.optimized) {
            (None, None) => None,
            (Some(_), None) => return Err(mismatch("has a signature but no optimized entry")),
            (None, Some(_)) => return Err(mismatch("has an optimized entry without a signature")),
            (Some(text), Some(func)) => {
                if matches!(entry, Entry::Legacy(_)) {
                    return Err(mismatch("uses the legacy convention with an optimized entry"));
                }
                let signature = Signature::parse(text)
                    .map_err(|err| err.with_context("function", self.name.clone()))?;
                match self.arity {
                    Arity::Variadic => {
                        return Err(mismatch("is variadic but declares an optimized entry"))
                    }
                    Arity::Fixed(n) if n != signature.arity() => {
                        return Err(mismatch(&format!(
                            "takes {n} arguments but its signature `{text}` declares {}",
                            signature.arity()
                        )))
                    }
                    Arity::Fixed(_) => {}
                }
                Some(OptimizedEntry { signature, func })
            }
        };
        Ok(LoadedFunction {
            name: Arc::from(self.name.as_str()),
            arity: self.arity,
            entry,
            optimized,
        })
    }
}

/// Owned descriptor of an extension.
#[derive(Debug, Clone)]
pub struct ExtensionDescriptor {
    pub struct_version: u32,
    pub window: AbiWindow,
    pub requested_vtable_version: u32,
    pub layout: LayoutKind,
    pub host_tag: u64,
    pub name: String,
    pub functions: Vec<FunctionDef>,
}

impl ExtensionDescriptor {
    /// Descriptor for a universal-layout extension built against the default window.
    pub fn universal(name: impl Into<String>, requested_vtable_version: u32) -> Self {
        Self {
            struct_version: DESCRIPTOR_STRUCT_VERSION,
            window: AbiWindow::default(),
            requested_vtable_version,
            layout: LayoutKind::Universal,
            host_tag: 0,
            name: name.into(),
            functions: Vec::new(),
        }
    }

    /// Descriptor for an extension bound to one host build.
    pub fn version_specific(
        name: impl Into<String>,
        requested_vtable_version: u32,
        host_tag: u64,
    ) -> Self {
        Self {
            layout: LayoutKind::VersionSpecific,
            host_tag,
            ..Self::universal(name, requested_vtable_version)
        }
    }

    pub fn with_window(mut self, window: AbiWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_function(mut self, function: FunctionDef) -> Self {
        self.functions.push(function);
        self
    }

    /// Validates every function; fails on the first bad one or on duplicate names.
    pub fn validate_functions(&self) -> Result<Vec<LoadedFunction>, PyniError> {
        let mut seen = BTreeSet::new();
        let mut loaded = Vec::with_capacity(self.functions.len());
        for function in &self.functions {
            if !seen.insert(function.name.as_str()) {
                return Err(PyniError::Load(
                    ErrorInfo::new(
                        "pyni.duplicate_function",
                        format!("function `{}` is exported twice", function.name),
                    )
                    .with_context("extension", self.name.clone()),
                ));
            }
            loaded.push(function.validate()?);
        }
        Ok(loaded)
    }

    /// Copies a raw descriptor into owned form.
    ///
    /// # Safety
    ///
    /// `raw` must be null or point to a descriptor whose strings and function array are valid
    /// for the duration of the call.
    pub unsafe fn from_raw(raw: *const RawDescriptor) -> Result<Self, PyniError> {
        let raw = raw.as_ref().ok_or_else(|| {
            PyniError::Load(ErrorInfo::new(
                "pyni.null_descriptor",
                "entry point returned a null descriptor",
            ))
        })?;
        let layout = LayoutKind::from_raw(raw.layout).ok_or_else(|| {
            PyniError::incompatible_abi(format!("unknown layout tag {}", raw.layout))
        })?;
        let name = raw.name.as_str()?.to_string();
        let defs: &[RawFunctionDef] = if raw.functions.is_null() || raw.function_count == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(raw.functions, raw.function_count)
        };
        let functions = defs
            .iter()
            .map(|def| -> Result<FunctionDef, PyniError> {
                let name = def.name.as_str()?.to_string();
                let convention = match def.convention {
                    CONVENTION_STANDARD => Convention::Standard,
                    CONVENTION_LEGACY => Convention::Legacy,
                    other => {
                        return Err(PyniError::signature_mismatch(format!(
                            "function `{name}` uses unknown calling convention {other}"
                        )))
                    }
                };
                let arity = Arity::from_raw(def.arity).ok_or_else(|| {
                    PyniError::signature_mismatch(format!(
                        "function `{name}` declares invalid arity {}",
                        def.arity
                    ))
                })?;
                let signature = if def.signature.is_empty() {
                    None
                } else {
                    Some(def.signature.as_str()?.to_string())
                };
                Ok(FunctionDef {
                    name,
                    convention,
                    arity,
                    standard: def.standard,
                    legacy: def.legacy,
                    optimized: def.optimized,
                    signature,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            struct_version: raw.struct_version,
            window: AbiWindow::new(raw.abi_major, raw.abi_minor),
            requested_vtable_version: raw.requested_vtable_version,
            layout,
            host_tag: raw.host_tag,
            name,
            functions,
        })
    }

    /// Pointer-free summary used for hashing and registry snapshots.
    pub fn summary(&self) -> DescriptorSummary {
        DescriptorSummary {
            name: self.name.clone(),
            struct_version: self.struct_version,
            window: self.window,
            requested_vtable_version: self.requested_vtable_version,
            layout: self.layout,
            functions: self
                .functions
                .iter()
                .map(|f| FunctionSummary {
                    name: f.name.clone(),
                    convention: f.convention,
                    arity: f.arity,
                    signature: f.signature.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSummary {
    pub name: String,
    pub convention: Convention,
    pub arity: Arity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorSummary {
    pub name: String,
    pub struct_version: u32,
    pub window: AbiWindow,
    pub requested_vtable_version: u32,
    pub layout: LayoutKind,
    pub functions: Vec<FunctionSummary>,
}
