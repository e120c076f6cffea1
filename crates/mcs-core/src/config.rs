#![forbid(unsafe_code)]

//! Per-container configuration.
//!
//! Every field has a sensible default, so most code calls
//! `ObservableValue::new(..)` and never sees this type. Builders follow the
//! `with_*` convention; [`StorageConfig::from_env`] layers `MCS_*` environment
//! overrides on top of the defaults.
//!
//! | Variable           | Values                     | Field                 |
//! |--------------------|----------------------------|-----------------------|
//! | `MCS_AFFINITY`     | `context`, `thread`        | `affinity`            |
//! | `MCS_CALL_SITES`   | `1/true/yes/on`, otherwise | `record_call_sites`   |
//! | `MCS_TRACE_NOTIFY` | `1/true/yes/on`, otherwise | `trace_notifications` |

use crate::affinity::AffinityMode;

/// Configuration shared by the observable containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Name used in spans and log events.
    pub label: &'static str,
    /// How the affinity token compares contexts.
    pub affinity: AffinityMode,
    /// Record the source location of each registration for diagnostics.
    pub record_call_sites: bool,
    /// Emit a `trace!` event for every listener visit.
    pub trace_notifications: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            label: "storage",
            affinity: AffinityMode::Context,
            record_call_sites: cfg!(debug_assertions),
            trace_notifications: false,
        }
    }
}

impl StorageConfig {
    /// Defaults with the given label.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    #[must_use]
    pub fn with_affinity(mut self, affinity: AffinityMode) -> Self {
        self.affinity = affinity;
        self
    }

    #[must_use]
    pub fn with_call_sites(mut self, record: bool) -> Self {
        self.record_call_sites = record;
        self
    }

    #[must_use]
    pub fn with_trace_notifications(mut self, trace: bool) -> Self {
        self.trace_notifications = trace;
        self
    }

    /// Defaults overridden by `MCS_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unknown values leave the
    /// field untouched.
    #[must_use]
    pub fn with_overrides<F>(mut self, get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = get_env("MCS_AFFINITY").as_deref().and_then(parse_affinity) {
            self.affinity = mode;
        }
        if let Some(value) = get_env("MCS_CALL_SITES") {
            self.record_call_sites = env_flag(&value);
        }
        if let Some(value) = get_env("MCS_TRACE_NOTIFY") {
            self.trace_notifications = env_flag(&value);
        }
        self
    }
}

#[inline]
fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_affinity(value: &str) -> Option<AffinityMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "context" | "queue" => Some(AffinityMode::Context),
        "thread" | "thread-only" => Some(AffinityMode::ThreadOnly),
        _ => None,
    }
}
