#![forbid(unsafe_code)]

//! Usage violations and the fatal path they take.
//!
//! Every check in this crate guards a *programmer* error: touching a container
//! from the wrong context, mutating it from inside its own notification,
//! forgetting to deregister a listener. None of them is recoverable, so none of
//! them is surfaced as a `Result`. A violation is logged with
//! `tracing::error!` and then panics with the rendered [`UsageError`]; release
//! profiles build with `panic = "abort"`, which turns that into a process
//! abort.
//!
//! # Checked builds
//!
//! [`CHECKS_ENABLED`] is true when `debug_assertions` is on or the
//! `release-checks` feature is enabled. With checks off the [`ensure!`] macro
//! compiles to nothing and misuse yields unspecified notification semantics.
//! The containers never use `unsafe`, so unspecified here never means memory
//! unsafety.

use std::fmt;
use std::ops::Range;

use crate::affinity::ContextId;
use crate::registry::{CallSite, ListenerKey};

/// Whether usage checks are compiled into this build.
pub const CHECKS_ENABLED: bool = cfg!(any(debug_assertions, feature = "release-checks"));

/// A misuse of a container, always fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// Operation invoked from a context other than the one the container is
    /// bound to.
    AffinityViolation {
        operation: &'static str,
        expected: ContextId,
        actual: ContextId,
    },
    /// Any other broken contract.
    InvariantViolation(Invariant),
}

/// The contract that an [`UsageError::InvariantViolation`] broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invariant {
    /// A second operation started while another one was still running.
    OverlappingAccess { operation: &'static str },
    /// A mutating operation was issued from inside a notification pass.
    MutationDuringNotification { operation: &'static str },
    /// A deferred (`queue_*`) entry point was used outside a notification pass.
    QueuedOutsideNotification { operation: &'static str },
    /// The key is already registered.
    DuplicateRegistration {
        key: ListenerKey,
        registered_at: Option<CallSite>,
    },
    /// The key is not registered.
    MissingRegistration { key: ListenerKey },
    /// The key is already queued for registration in this pass.
    DuplicateQueuedRegistration { key: ListenerKey },
    /// The key is already queued for deregistration in this pass.
    DuplicateQueuedDeregistration { key: ListenerKey },
    /// A registered listener was dropped without being deregistered.
    DanglingListener {
        key: ListenerKey,
        registered_at: Option<CallSite>,
    },
    /// A container or registry was dropped while listeners were still registered.
    ListenersOutlivedContainer {
        count: usize,
        registered_at: Option<CallSite>,
    },
    /// Insert position past the end of the sequence.
    IndexOutOfBounds { index: usize, len: usize },
    /// Range malformed or not contained in the sequence.
    RangeOutOfBounds { range: Range<usize>, len: usize },
    /// Replacement element count differs from the replaced range length.
    LengthMismatch { expected: usize, actual: usize },
    /// `cast` called on a completion queue that was already cast.
    CastTwice,
    /// `enqueue` called after the completion queue finished casting.
    EnqueueAfterCast,
    /// A completion queue was dropped without ever being cast.
    DroppedBeforeCast { pending: usize },
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AffinityViolation {
                operation,
                expected,
                actual,
            } => write!(
                f,
                "affinity violation: `{operation}` called from {actual}, container is bound to {expected}"
            ),
            Self::InvariantViolation(invariant) => write!(f, "invariant violation: {invariant}"),
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverlappingAccess { operation } => write!(
                f,
                "`{operation}` overlaps another operation on the same container"
            ),
            Self::MutationDuringNotification { operation } => write!(
                f,
                "`{operation}` cannot run while a notification is being cast"
            ),
            Self::QueuedOutsideNotification { operation } => write!(
                f,
                "`{operation}` is only valid from inside a notification handler"
            ),
            Self::DuplicateRegistration { key, registered_at } => {
                write!(f, "listener {key:?} is already registered")?;
                write_site(f, *registered_at)
            }
            Self::MissingRegistration { key } => {
                write!(f, "listener {key:?} is not registered")
            }
            Self::DuplicateQueuedRegistration { key } => {
                write!(f, "listener {key:?} is already queued for registration")
            }
            Self::DuplicateQueuedDeregistration { key } => {
                write!(f, "listener {key:?} is already queued for deregistration")
            }
            Self::DanglingListener { key, registered_at } => {
                write!(f, "listener {key:?} was dropped before being deregistered")?;
                write_site(f, *registered_at)
            }
            Self::ListenersOutlivedContainer {
                count,
                registered_at,
            } => {
                write!(
                    f,
                    "{count} listener(s) still registered when the container was dropped"
                )?;
                write_site(f, *registered_at)
            }
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds (length {len})")
            }
            Self::RangeOutOfBounds { range, len } => {
                write!(f, "range {range:?} out of bounds (length {len})")
            }
            Self::LengthMismatch { expected, actual } => write!(
                f,
                "length mismatch: range covers {expected} element(s), got {actual}"
            ),
            Self::CastTwice => write!(f, "completion queue cast twice"),
            Self::EnqueueAfterCast => write!(f, "enqueue on a completion queue that was already cast"),
            Self::DroppedBeforeCast { pending } => write!(
                f,
                "completion queue dropped before cast ({pending} callback(s) never ran)"
            ),
        }
    }
}

fn write_site(f: &mut fmt::Formatter<'_>, site: Option<CallSite>) -> fmt::Result {
    match site {
        Some(site) => write!(f, " (registered at {site})"),
        None => Ok(()),
    }
}

impl std::error::Error for UsageError {}

impl From<Invariant> for UsageError {
    fn from(invariant: Invariant) -> Self {
        Self::InvariantViolation(invariant)
    }
}

/// Report a usage violation and terminate.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(error: impl Into<UsageError>) -> ! {
    let error = error.into();
    let location = std::panic::Location::caller();
    tracing::error!(%error, at = %location, "usage violation");
    panic!("{error}");
}

/// Abort with a [`UsageError`] unless `cond` holds.
///
/// Compiles to nothing when [`CHECKS_ENABLED`] is false; the error expression
/// is only evaluated on failure.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if $crate::violation::CHECKS_ENABLED && !$cond {
            $crate::violation::fatal($err)
        }
    };
}
