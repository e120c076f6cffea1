#![forbid(unsafe_code)]

//! Execution-context identity and the affinity token bound to it.
//!
//! A container captures an [`AffinityToken`] when it is built and checks it on
//! every public operation. The "current context" is the serial queue entered on
//! this thread, if any, and the OS thread otherwise:
//!
//! ```text
//! thread T ──────────────────────────────────────────────▶
//!            │ ContextScope::enter(q7)        drop │
//!            ▼                                     ▼
//! current:   Thread(T)  │  Queue(q7)  ...  Queue(q7)  │  Thread(T)
//! ```
//!
//! This is a debugging aid, not a lock. It never provides mutual exclusion;
//! it only reports that the single-context discipline was broken.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crate::violation::{UsageError, fatal};

/// Identity of a serial work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl QueueId {
    /// Allocate a process-unique queue identity.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw identifier. Intended for tests and foreign executors that
    /// allocate their own ids.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Comparable identity of a logical execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    /// Plain OS thread with no serial queue entered.
    Thread(ThreadId),
    /// A serial queue entered on the current thread.
    Queue(QueueId),
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(id) => write!(f, "thread {id:?}"),
            Self::Queue(id) => write!(f, "queue#{}", id.0),
        }
    }
}

thread_local! {
    static ENTERED_QUEUE: Cell<Option<QueueId>> = const { Cell::new(None) };
}

/// The context the caller is running on right now.
#[must_use]
pub fn current_context() -> ContextId {
    ENTERED_QUEUE
        .with(Cell::get)
        .map_or_else(|| ContextId::Thread(thread::current().id()), ContextId::Queue)
}

/// RAII guard marking a serial queue as the current context on this thread.
///
/// Scopes nest; dropping one restores whatever was current before it. The
/// guard is `!Send` because it describes the thread it was created on.
#[must_use = "the queue context ends when the scope is dropped"]
pub struct ContextScope {
    previous: Option<QueueId>,
    _not_send: PhantomData<*const ()>,
}

impl ContextScope {
    /// Enter `queue` on the current thread.
    pub fn enter(queue: QueueId) -> Self {
        let previous = ENTERED_QUEUE.with(|cell| cell.replace(Some(queue)));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        ENTERED_QUEUE.with(|cell| cell.set(self.previous));
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("previous", &self.previous)
            .finish()
    }
}

/// How strictly an [`AffinityToken`] compares contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityMode {
    /// Compare the full [`ContextId`]: the serial queue when one is entered,
    /// the thread otherwise.
    #[default]
    Context,
    /// Compare thread identity only. Two queues hosted on the same thread are
    /// indistinguishable in this mode.
    ThreadOnly,
}

/// Permanent binding to the context that created a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityToken {
    bound: ContextId,
    thread: ThreadId,
    mode: AffinityMode,
}

impl AffinityToken {
    /// Bind to the current context using [`AffinityMode::Context`].
    #[must_use]
    pub fn capture() -> Self {
        Self::capture_with(AffinityMode::default())
    }

    /// Bind to the current context with an explicit comparison mode.
    #[must_use]
    pub fn capture_with(mode: AffinityMode) -> Self {
        let thread = thread::current().id();
        let bound = match mode {
            AffinityMode::Context => current_context(),
            AffinityMode::ThreadOnly => ContextId::Thread(thread),
        };
        Self {
            bound,
            thread,
            mode,
        }
    }

    /// Whether the caller runs on the bound context. Pure; callable anywhere.
    #[must_use]
    pub fn check_current_context(&self) -> bool {
        match self.mode {
            AffinityMode::Context => current_context() == self.bound,
            AffinityMode::ThreadOnly => thread::current().id() == self.thread,
        }
    }

    /// The context this token is bound to.
    #[must_use]
    pub fn bound_context(&self) -> ContextId {
        self.bound
    }

    #[must_use]
    pub fn mode(&self) -> AffinityMode {
        self.mode
    }

    /// Terminate with [`UsageError::AffinityViolation`] unless the caller runs
    /// on the bound context.
    #[track_caller]
    pub fn assert_current(&self, operation: &'static str) {
        if crate::violation::CHECKS_ENABLED && !self.check_current_context() {
            let actual = match self.mode {
                AffinityMode::Context => current_context(),
                AffinityMode::ThreadOnly => ContextId::Thread(thread::current().id()),
            };
            fatal(UsageError::AffinityViolation {
                operation,
                expected: self.bound,
                actual,
            });
        }
    }
}
