//! Structured error types shared across PyNI crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`PyniError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (handles, versions, function names, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

/// Stable code for a descriptor whose ABI cannot be served by the host.
pub const INCOMPATIBLE_ABI: &str = "pyni.incompatible_abi";
/// Stable code for a malformed or inconsistent optimized-entry signature.
pub const SIGNATURE_MISMATCH: &str = "pyni.signature_mismatch";
/// Stable code for a handle that is not open in any live frame or slot.
pub const INVALID_HANDLE: &str = "pyni.invalid_handle";

/// Contract violations the debug layer reports on the diagnostic channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A local handle was used outside the frame that created it.
    StaleHandleUse,
    /// A context, handle or buffer was used after its release point.
    UseAfterRelease,
    /// An ownership scope was still open when its frame was torn down.
    LeakedHandle,
    /// A handle scope was closed twice.
    DoubleClose,
    /// A context was closed by a non-owner, closed twice, or used off its thread.
    InvalidContext,
}

impl ViolationKind {
    /// Every violation kind, in declaration order.
    pub const ALL: [ViolationKind; 5] = [
        ViolationKind::StaleHandleUse,
        ViolationKind::UseAfterRelease,
        ViolationKind::LeakedHandle,
        ViolationKind::DoubleClose,
        ViolationKind::InvalidContext,
    ];

    /// Returns the stable error code used for this violation.
    pub fn code(self) -> &'static str {
        match self {
            ViolationKind::StaleHandleUse => "pyni.stale_handle",
            ViolationKind::UseAfterRelease => "pyni.use_after_release",
            ViolationKind::LeakedHandle => "pyni.leaked_handle",
            ViolationKind::DoubleClose => "pyni.double_close",
            ViolationKind::InvalidContext => "pyni.invalid_context",
        }
    }

    /// Maps a stable error code back to its violation kind.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::StaleHandleUse => "StaleHandleUse",
            ViolationKind::UseAfterRelease => "UseAfterRelease",
            ViolationKind::LeakedHandle => "LeakedHandle",
            ViolationKind::DoubleClose => "DoubleClose",
            ViolationKind::InvalidContext => "InvalidContext",
        };
        f.write_str(name)
    }
}

/// Canonical error type for the PyNI runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum PyniError {
    /// Load-time failures; the extension is not loaded.
    #[error("load error: {0}")]
    Load(ErrorInfo),
    /// Handle, context and buffer contract violations.
    #[error("contract error: {0}")]
    Contract(ErrorInfo),
    /// Failures raised by an API function on behalf of the object model.
    #[error("api error: {0}")]
    Api(ErrorInfo),
    /// Invalid runtime or manifest configuration.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Serialization and I/O errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
}

impl PyniError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            PyniError::Load(info)
            | PyniError::Contract(info)
            | PyniError::Api(info)
            | PyniError::Config(info)
            | PyniError::Serde(info) => info,
        }
    }

    /// Builds a contract error for the given violation kind.
    pub fn violation(kind: ViolationKind, message: impl Into<String>) -> Self {
        PyniError::Contract(ErrorInfo::new(kind.code(), message))
    }

    /// Builds the load-time error raised when negotiation fails.
    pub fn incompatible_abi(message: impl Into<String>) -> Self {
        PyniError::Load(ErrorInfo::new(INCOMPATIBLE_ABI, message))
    }

    /// Builds the load-time error raised for inconsistent signature descriptors.
    pub fn signature_mismatch(message: impl Into<String>) -> Self {
        PyniError::Load(ErrorInfo::new(SIGNATURE_MISMATCH, message))
    }

    /// Builds the error raised for handles that are not open.
    pub fn invalid_handle(message: impl Into<String>) -> Self {
        PyniError::Contract(ErrorInfo::new(INVALID_HANDLE, message))
    }

    /// Returns the violation kind if this is a reportable contract violation.
    pub fn violation_kind(&self) -> Option<ViolationKind> {
        match self {
            PyniError::Contract(info) => ViolationKind::from_code(&info.code),
            _ => None,
        }
    }

    /// Adds a context entry to the wrapped payload.
    pub fn with_context(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match self {
            PyniError::Load(info) => PyniError::Load(info.with_context(key, value)),
            PyniError::Contract(info) => PyniError::Contract(info.with_context(key, value)),
            PyniError::Api(info) => PyniError::Api(info.with_context(key, value)),
            PyniError::Config(info) => PyniError::Config(info.with_context(key, value)),
            PyniError::Serde(info) => PyniError::Serde(info.with_context(key, value)),
        }
    }
}
