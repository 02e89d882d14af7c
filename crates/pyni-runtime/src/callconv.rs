//! Calling conventions and entry-point selection.
//!
//! A function always has a generic entry point (the handle-vector one, or a legacy one taking
//! direct references). It may add an optimized entry that takes unboxed primitives, described by
//! a signature string such as `"id->d"`. The optimized path is only taken when every argument is
//! guaranteed to have the declared primitive kind.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use pyni_core::{Handle, LegacyRef, ObjectKind, ObjectRef, ObjectSpace, PyniError};
use serde::{Deserialize, Serialize};

use crate::context::ContextPtr;

/// Most parameters an optimized signature may declare.
pub const MAX_PRIMITIVE_PARAMS: usize = 8;

pub type StandardFn = unsafe extern "C" fn(ContextPtr, *const Handle, usize) -> Handle;
/// Returns `0` on success, `-1` with the session error set on failure.
pub type OptimizedFn =
    unsafe extern "C" fn(ContextPtr, *const PrimitiveValue, usize, *mut PrimitiveValue) -> i32;
/// The returned reference is borrowed; the host takes its own reference.
pub type LegacyFn = unsafe extern "C" fn(*const LegacyRef, usize) -> LegacyRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    /// `i`: 64-bit signed integer.
    Int,
    /// `n`: pointer-sized signed integer.
    PtrSized,
    /// `d`: double.
    Float,
}

impl PrimitiveKind {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'i' => Some(PrimitiveKind::Int),
            'n' => Some(PrimitiveKind::PtrSized),
            'd' => Some(PrimitiveKind::Float),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            PrimitiveKind::Int => 'i',
            PrimitiveKind::PtrSized => 'n',
            PrimitiveKind::Float => 'd',
        }
    }
}

/// Parsed optimized-entry signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<PrimitiveKind>,
    pub ret: PrimitiveKind,
}

impl Signature {
    pub fn parse(text: &str) -> Result<Self, PyniError> {
        let malformed = |reason: &str| {
            PyniError::signature_mismatch(format!("signature `{text}` {reason}"))
                .with_context("signature", text)
        };
        let (params, ret) = text
            .split_once("->")
            .ok_or_else(|| malformed("has no `->`"))?;
        let params = params
            .chars()
            .map(|code| PrimitiveKind::from_code(code).ok_or_else(|| malformed("has an unknown parameter kind")))
            .collect::<Result<Vec<_>, _>>()?;
        if params.len() > MAX_PRIMITIVE_PARAMS {
            return Err(malformed("declares too many parameters"));
        }
        let mut ret_codes = ret.chars();
        let ret = match (ret_codes.next(), ret_codes.next()) {
            (Some(code), None) => {
                PrimitiveKind::from_code(code).ok_or_else(|| malformed("has an unknown return kind"))?
            }
            _ => return Err(malformed("must declare exactly one return kind")),
        };
        Ok(Self { params, ret })
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl FromStr for Signature {
    type Err = PyniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signature::parse(s)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kind in &self.params {
            write!(f, "{}", kind.code())?;
        }
        write!(f, "->{}", self.ret.code())
    }
}

/// One unboxed argument or return value; the signature says which field is live.
#[repr(C)]
#[derive(Clone, Copy)]
pub union PrimitiveValue {
    pub i: i64,
    pub n: isize,
    pub d: f64,
}

impl PrimitiveValue {
    pub fn int(value: i64) -> Self {
        PrimitiveValue { i: value }
    }

    pub fn ptr_sized(value: isize) -> Self {
        PrimitiveValue { n: value }
    }

    pub fn float(value: f64) -> Self {
        PrimitiveValue { d: value }
    }
}

impl fmt::Debug for PrimitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: every field is plain data of the same size; reading the bits is always defined.
        write!(f, "PrimitiveValue({:#x})", unsafe { self.i })
    }
}

/// Declared arity of the generic entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arity {
    Fixed(usize),
    Variadic,
}

impl Arity {
    /// Decodes the raw descriptor encoding, where `-1` means variadic.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            -1 => Some(Arity::Variadic),
            n if n >= 0 => Some(Arity::Fixed(n as usize)),
            _ => None,
        }
    }

    pub fn accepts(self, nargs: usize) -> bool {
        match self {
            Arity::Fixed(n) => n == nargs,
            Arity::Variadic => true,
        }
    }
}

/// What is known about one argument at a call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgInfo {
    Unknown,
    /// Declared kind, e.g. from a typed call site.
    Declared(PrimitiveKind),
    /// Integer object observed at call time.
    Int(i64),
    /// Float object observed at call time.
    Float,
}

impl ArgInfo {
    pub fn satisfies(self, kind: PrimitiveKind) -> bool {
        match (self, kind) {
            (ArgInfo::Declared(declared), wanted) => declared == wanted,
            (ArgInfo::Int(_), PrimitiveKind::Int) => true,
            (ArgInfo::Int(value), PrimitiveKind::PtrSized) => isize::try_from(value).is_ok(),
            (ArgInfo::Float, PrimitiveKind::Float) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallSiteInfo {
    pub args: Vec<ArgInfo>,
}

impl CallSiteInfo {
    /// Call site with statically declared argument kinds.
    pub fn declared(kinds: &[PrimitiveKind]) -> Self {
        Self {
            args: kinds.iter().copied().map(ArgInfo::Declared).collect(),
        }
    }

    /// Call site whose kinds nothing is known about.
    pub fn unknown(nargs: usize) -> Self {
        Self {
            args: vec![ArgInfo::Unknown; nargs],
        }
    }

    /// Inspects argument objects at call time.
    pub fn inspect(space: &dyn ObjectSpace, args: &[ObjectRef]) -> Self {
        let args = args
            .iter()
            .map(|obj| match space.kind(*obj) {
                Some(ObjectKind::Int) => space
                    .int_value(*obj)
                    .map_or(ArgInfo::Unknown, ArgInfo::Int),
                Some(ObjectKind::Float) => ArgInfo::Float,
                _ => ArgInfo::Unknown,
            })
            .collect();
        Self { args }
    }

    pub fn matches(&self, signature: &Signature) -> bool {
        self.args.len() == signature.arity()
            && self
                .args
                .iter()
                .zip(&signature.params)
                .all(|(arg, kind)| arg.satisfies(*kind))
    }
}

/// Generic entry point of a loaded function.
#[derive(Debug, Clone, Copy)]
pub enum Entry {
    Standard(StandardFn),
    Legacy(LegacyFn),
}

#[derive(Debug, Clone)]
pub struct OptimizedEntry {
    pub signature: Signature,
    pub func: OptimizedFn,
}

/// A function that passed load-time validation.
#[derive(Debug, Clone)]
pub struct LoadedFunction {
    pub name: Arc<str>,
    pub arity: Arity,
    pub entry: Entry,
    pub optimized: Option<OptimizedEntry>,
}

/// The entry point chosen for one call.
#[derive(Debug, Clone, Copy)]
pub enum EntryPoint<'a> {
    Standard(StandardFn),
    Optimized {
        func: OptimizedFn,
        signature: &'a Signature,
    },
    Legacy(LegacyFn),
}

impl EntryPoint<'_> {
    pub fn is_optimized(&self) -> bool {
        matches!(self, EntryPoint::Optimized { .. })
    }
}

/// Picks the optimized entry only when the call site guarantees its argument kinds.
pub fn select<'a>(function: &'a LoadedFunction, site: &CallSiteInfo) -> EntryPoint<'a> {
    match function.entry {
        Entry::Legacy(func) => EntryPoint::Legacy(func),
        Entry::Standard(func) => match &function.optimized {
            Some(optimized) if site.matches(&optimized.signature) => EntryPoint::Optimized {
                func: optimized.func,
                signature: &optimized.signature,
            },
            _ => EntryPoint::Standard(func),
        },
    }
}

/// Unboxes arguments for an optimized call. `None` if any argument does not fit its kind.
pub fn unbox_args(
    space: &dyn ObjectSpace,
    signature: &Signature,
    args: &[ObjectRef],
) -> Option<Vec<PrimitiveValue>> {
    if args.len() != signature.arity() {
        return None;
    }
    args.iter()
        .zip(&signature.params)
        .map(|(obj, kind)| match kind {
            PrimitiveKind::Int => space.int_value(*obj).map(PrimitiveValue::int),
            PrimitiveKind::PtrSized => space
                .int_value(*obj)
                .and_then(|v| isize::try_from(v).ok())
                .map(PrimitiveValue::ptr_sized),
            PrimitiveKind::Float => space.float_value(*obj).map(PrimitiveValue::float),
        })
        .collect()
}

/// Boxes an optimized return value into a new object reference.
pub fn box_return(space: &dyn ObjectSpace, kind: PrimitiveKind, value: PrimitiveValue) -> ObjectRef {
    // SAFETY: the signature names the live field; all fields are plain data.
    unsafe {
        match kind {
            PrimitiveKind::Int => space.new_int(value.i),
            PrimitiveKind::PtrSized => space.new_int(value.n as i64),
            PrimitiveKind::Float => space.new_float(value.d),
        }
    }
}
