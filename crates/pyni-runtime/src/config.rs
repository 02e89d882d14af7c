//! Runtime configuration.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use pyni_core::diagnostics::DEFAULT_DIAGNOSTICS_LIMIT;
use pyni_core::{AbiWindow, ErrorInfo, PyniError};
use serde::{Deserialize, Serialize};

use crate::descriptor::DESCRIPTOR_STRUCT_VERSION;
use crate::negotiate::{HostOffer, HOST_ABI_TAG};
use crate::vtable::LATEST_VERSION;

/// Environment variable that overrides [`RuntimeConfig::debug`].
pub const DEBUG_ENV: &str = "PYNI_DEBUG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Route every call through the debug interception layer.
    pub debug: bool,
    pub abi_window: AbiWindow,
    pub offered_versions: Vec<u32>,
    pub max_struct_version: u32,
    /// Released contexts kept poisoned before reuse.
    pub context_quarantine: usize,
    /// Released debug buffers kept poisoned before being freed.
    pub buffer_quarantine: usize,
    /// Violation records kept on the diagnostic channel; older ones are evicted.
    pub diagnostics_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            abi_window: AbiWindow::default(),
            offered_versions: (1..=LATEST_VERSION).collect(),
            max_struct_version: DESCRIPTOR_STRUCT_VERSION,
            context_quarantine: 64,
            buffer_quarantine: 64,
            diagnostics_limit: DEFAULT_DIAGNOSTICS_LIMIT,
        }
    }
}

fn config_error(code: &str, message: impl Into<String>) -> PyniError {
    PyniError::Config(ErrorInfo::new(code, message))
}

impl RuntimeConfig {
    pub fn debug() -> Self {
        Self {
            debug: true,
            ..Self::default()
        }
    }

    pub fn with_offered_versions(mut self, versions: impl IntoIterator<Item = u32>) -> Self {
        self.offered_versions = versions.into_iter().collect();
        self
    }

    pub fn from_toml_str(input: &str) -> Result<Self, PyniError> {
        let config: RuntimeConfig = toml::from_str(input)
            .map_err(|err| config_error("pyni.config_parse", err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PyniError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            PyniError::Serde(
                ErrorInfo::new("pyni.config_io", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        Self::from_toml_str(&text).map_err(|err| err.with_context("path", path.display().to_string()))
    }

    /// Applies `PYNI_DEBUG` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        let value = std::env::var(DEBUG_ENV).ok();
        self.apply_debug_override(value.as_deref())
    }

    /// Applies a `PYNI_DEBUG`-style value. Unrecognised values are ignored with a warning.
    pub fn apply_debug_override(mut self, value: Option<&str>) -> Self {
        let Some(value) = value else {
            return self;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => self.debug = true,
            "0" | "false" | "no" | "off" | "" => self.debug = false,
            other => tracing::warn!(value = other, "ignoring unrecognised {DEBUG_ENV} value"),
        }
        self
    }

    pub fn validate(&self) -> Result<(), PyniError> {
        if self.offered_versions.is_empty() {
            return Err(config_error(
                "pyni.config_invalid",
                "offered_versions must not be empty",
            ));
        }
        if let Some(bad) = self
            .offered_versions
            .iter()
            .find(|v| **v == 0 || **v > LATEST_VERSION)
        {
            return Err(config_error(
                "pyni.config_invalid",
                format!("table version {bad} cannot be built (latest is {LATEST_VERSION})"),
            )
            .with_context("field", "offered_versions"));
        }
        if self.max_struct_version == 0 || self.max_struct_version > DESCRIPTOR_STRUCT_VERSION {
            return Err(config_error(
                "pyni.config_invalid",
                format!(
                    "max_struct_version must be between 1 and {DESCRIPTOR_STRUCT_VERSION}"
                ),
            )
            .with_context("field", "max_struct_version"));
        }
        if self.context_quarantine == 0 {
            return Err(config_error(
                "pyni.config_invalid",
                "context_quarantine must be at least 1",
            ));
        }
        if self.buffer_quarantine == 0 {
            return Err(config_error(
                "pyni.config_invalid",
                "buffer_quarantine must be at least 1",
            ));
        }
        if self.diagnostics_limit == 0 {
            return Err(config_error(
                "pyni.config_invalid",
                "diagnostics_limit must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn offer(&self) -> HostOffer {
        HostOffer {
            window: self.abi_window,
            versions: self.offered_versions.iter().copied().collect::<BTreeSet<_>>(),
            max_struct_version: self.max_struct_version,
            host_tag: HOST_ABI_TAG,
        }
    }
}
