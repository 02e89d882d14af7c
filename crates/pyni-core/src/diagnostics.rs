//! Diagnostic channel for contract violations detected in debug mode.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::ViolationKind;

/// One detected contract violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// What went wrong.
    pub kind: ViolationKind,
    /// Human readable description.
    pub message: String,
    /// Extension executing when the violation was detected, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Extension function executing when the violation was detected, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Raw handle or context value involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<u64>,
}

impl Violation {
    /// Creates a violation record with no call attribution.
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            extension: None,
            function: None,
            subject: None,
        }
    }

    /// Attributes the violation to an extension function.
    pub fn in_call(mut self, extension: impl Into<String>, function: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self.function = Some(function.into());
        self
    }

    /// Records the raw value involved.
    pub fn with_subject(mut self, subject: u64) -> Self {
        self.subject = Some(subject);
        self
    }
}

/// Receiver for violations.
pub trait DiagnosticSink: Send + Sync {
    /// Records a violation. Must not panic.
    fn report(&self, violation: Violation);
}

/// Violations kept by a [`Diagnostics`] built with [`Diagnostics::new`].
pub const DEFAULT_DIAGNOSTICS_LIMIT: usize = 4096;

#[derive(Debug, Default)]
struct Recorded {
    kept: VecDeque<Violation>,
    totals: BTreeMap<ViolationKind, usize>,
    dropped: usize,
}

/// Default sink: logs every violation through `tracing` and keeps the most recent ones for
/// inspection.
///
/// Counts cover every report since the last [`Diagnostics::drain`]; only the records themselves
/// are bounded, oldest evicted first.
#[derive(Debug)]
pub struct Diagnostics {
    records: Mutex<Recorded>,
    limit: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_limit(DEFAULT_DIAGNOSTICS_LIMIT)
    }
}

impl Diagnostics {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty sink keeping at most `limit` records (at least one).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            records: Mutex::new(Recorded::default()),
            limit: limit.max(1),
        }
    }

    /// Returns a copy of every retained violation, oldest first.
    pub fn snapshot(&self) -> Vec<Violation> {
        self.records.lock().kept.iter().cloned().collect()
    }

    /// Removes and returns every retained violation and resets the counts.
    pub fn drain(&self) -> Vec<Violation> {
        let recorded = std::mem::take(&mut *self.records.lock());
        recorded.kept.into()
    }

    /// Number of violations of the given kind reported since the last drain.
    pub fn count(&self, kind: ViolationKind) -> usize {
        self.records.lock().totals.get(&kind).copied().unwrap_or(0)
    }

    /// Number of reported violations per kind.
    pub fn summary(&self) -> BTreeMap<ViolationKind, usize> {
        self.records.lock().totals.clone()
    }

    /// Records evicted to stay within the limit.
    pub fn dropped(&self) -> usize {
        self.records.lock().dropped
    }

    /// Whether nothing has been reported.
    pub fn is_clean(&self) -> bool {
        self.records.lock().totals.is_empty()
    }
}

impl DiagnosticSink for Diagnostics {
    fn report(&self, violation: Violation) {
        tracing::warn!(
            kind = %violation.kind,
            extension = violation.extension.as_deref().unwrap_or("-"),
            function = violation.function.as_deref().unwrap_or("-"),
            subject = violation.subject.unwrap_or(0),
            "{}",
            violation.message
        );
        let mut records = self.records.lock();
        *records.totals.entry(violation.kind).or_insert(0) += 1;
        records.kept.push_back(violation);
        while records.kept.len() > self.limit {
            records.kept.pop_front();
            records.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_bounded_but_counts_are_not() {
        let diagnostics = Diagnostics::with_limit(2);
        for subject in 0..5 {
            diagnostics.report(
                Violation::new(ViolationKind::LeakedHandle, "leak").with_subject(subject),
            );
        }
        diagnostics.report(Violation::new(ViolationKind::DoubleClose, "twice"));

        let kept = diagnostics.snapshot();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].subject, Some(4));
        assert_eq!(kept[1].kind, ViolationKind::DoubleClose);
        assert_eq!(diagnostics.count(ViolationKind::LeakedHandle), 5);
        assert_eq!(diagnostics.dropped(), 4);

        assert_eq!(diagnostics.drain().len(), 2);
        assert!(diagnostics.is_clean());
        assert_eq!(diagnostics.dropped(), 0);
    }
}
