#![forbid(unsafe_code)]

//! Reentrancy guard: the `{busy, notifying-as}` state machine.
//!
//! ```text
//!            run_guarded            notify_pass          visiting(k)
//!   Idle ───────────────▶ Busy ───────────────▶ Pass ───────────────▶ Pass(k)
//!    ▲                     │  ◀─────────────────  │  ◀─────────────────  │
//!    └─────────────────────┘       (restore)            (restore)
//! ```
//!
//! `busy` catches overlapping operations. `notifying` catches mutation from
//! inside a handler and remembers which listener is currently running, so
//! the one legitimate reentrant call, a listener deregistering itself, can
//! be let through without weakening the general rule.
//!
//! The guard reports violations through [`fatal`](crate::violation::fatal);
//! it never returns an error to the caller.

use std::cell::Cell;

use crate::registry::ListenerKey;
use crate::violation::{CHECKS_ENABLED, Invariant, fatal};

/// Notification state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Notifying {
    /// No pass in progress.
    #[default]
    Idle,
    /// A pass is in progress; `current` is the listener being visited, if any.
    Pass { current: Option<ListenerKey> },
}

/// Per-container reentrancy state.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    busy: Cell<bool>,
    reading: Cell<bool>,
    notifying: Cell<Notifying>,
}

impl ReentrancyGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    #[must_use]
    pub fn is_notifying(&self) -> bool {
        self.notifying.get() != Notifying::Idle
    }

    #[must_use]
    pub fn state(&self) -> Notifying {
        self.notifying.get()
    }

    /// Listener currently being visited by the in-progress pass.
    #[must_use]
    pub fn current_listener(&self) -> Option<ListenerKey> {
        match self.notifying.get() {
            Notifying::Pass { current } => current,
            Notifying::Idle => None,
        }
    }

    /// Run `body` as one exclusive operation.
    ///
    /// `self_key` names the listener on whose behalf the call is made. When it
    /// matches the listener currently being notified, the call is the
    /// self-deregistration exception and runs inside the outer operation.
    #[track_caller]
    pub fn run_guarded<R>(
        &self,
        operation: &'static str,
        self_key: Option<ListenerKey>,
        body: impl FnOnce() -> R,
    ) -> R {
        if self_key.is_some() && self_key == self.current_listener() {
            return body();
        }
        if CHECKS_ENABLED {
            if self.is_notifying() {
                fatal(Invariant::MutationDuringNotification { operation });
            }
            if self.busy.get() {
                fatal(Invariant::OverlappingAccess { operation });
            }
        }

        let saved = (self.busy.get(), self.notifying.get());
        self.busy.set(true);
        let out = body();
        self.busy.set(saved.0);
        self.notifying.set(saved.1);
        out
    }

    /// Whether the operation holding `busy` is a read.
    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.reading.get()
    }

    /// Run `body` for a read-only operation.
    ///
    /// Reading is allowed while a pass is in progress and from inside another
    /// read. Otherwise the read holds `busy`, so a mutation attempted from
    /// inside `body` is reported as an overlap instead of corrupting the
    /// borrow.
    #[track_caller]
    pub fn run_read<R>(&self, operation: &'static str, body: impl FnOnce() -> R) -> R {
        if self.is_notifying() || self.reading.get() {
            return body();
        }
        self.run_guarded(operation, None, || {
            self.reading.set(true);
            let out = body();
            self.reading.set(false);
            out
        })
    }

    /// Mark a notification pass for the duration of `body`.
    ///
    /// Must be called from inside [`run_guarded`](Self::run_guarded).
    #[track_caller]
    pub fn notify_pass<R>(&self, body: impl FnOnce() -> R) -> R {
        debug_assert!(self.busy.get(), "notify_pass outside run_guarded");
        let saved = self.notifying.replace(Notifying::Pass { current: None });
        let out = body();
        self.notifying.set(saved);
        out
    }

    /// Record `key` as the listener being visited while `body` runs.
    pub fn visiting<R>(&self, key: ListenerKey, body: impl FnOnce() -> R) -> R {
        let saved = self.notifying.replace(Notifying::Pass { current: Some(key) });
        let out = body();
        self.notifying.set(saved);
        out
    }

    /// Terminate unless a pass is in progress. Used by the deferred entry
    /// points.
    #[track_caller]
    pub fn require_notifying(&self, operation: &'static str) {
        crate::ensure!(
            self.is_notifying(),
            Invariant::QueuedOutsideNotification { operation }
        );
    }

    /// Terminate unless the guard is fully idle. Used by destructors.
    #[track_caller]
    pub fn require_idle(&self, operation: &'static str) {
        crate::ensure!(
            !self.is_notifying(),
            Invariant::MutationDuringNotification { operation }
        );
        crate::ensure!(!self.busy.get(), Invariant::OverlappingAccess { operation });
    }
}
