#![forbid(unsafe_code)]

//! One-shot completion queue.
//!
//! Producers [`enqueue`](CompletionQueue::enqueue) callbacks while some piece
//! of work is in flight; the owner [`cast`](CompletionQueue::cast)s the result
//! exactly once, which runs every callback in FIFO order and empties the queue.
//!
//! ```text
//! Pending ──cast(v)──▶ Casting ──last callback returns──▶ Cast
//!   │ enqueue ok         │ enqueue accepted, never run     │ enqueue fatal
//! ```
//!
//! Callbacks enqueued while the cast is running are accepted but dropped
//! unrun; a `warn!` event reports how many. Dropping a queue that was never
//! cast is fatal, since its callbacks would silently never fire.

use std::cell::{Cell, RefCell};
use std::fmt;

use mcs_core::{AffinityToken, Invariant, StorageConfig, ensure};
use tracing::{debug_span, warn};

type Callback<T> = Box<dyn FnOnce(&T)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CastState {
    Pending,
    Casting,
    Cast,
}

/// Ordered, single-use list of callbacks taking `&T`.
pub struct CompletionQueue<T> {
    label: &'static str,
    affinity: AffinityToken,
    state: Cell<CastState>,
    callbacks: RefCell<Vec<Callback<T>>>,
}

impl<T> CompletionQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&StorageConfig::new("completion"))
    }

    #[must_use]
    pub fn with_config(config: &StorageConfig) -> Self {
        Self {
            label: config.label,
            affinity: AffinityToken::capture_with(config.affinity),
            state: Cell::new(CastState::Pending),
            callbacks: RefCell::new(Vec::new()),
        }
    }

    /// Append a callback.
    ///
    /// # Panics
    ///
    /// Fatal once [`cast`](Self::cast) has returned.
    #[track_caller]
    pub fn enqueue(&self, callback: impl FnOnce(&T) + 'static) {
        self.affinity.assert_current("enqueue");
        ensure!(
            self.state.get() != CastState::Cast,
            Invariant::EnqueueAfterCast
        );
        self.callbacks.borrow_mut().push(Box::new(callback));
    }

    /// Run every queued callback with `&value`, in the order they were
    /// enqueued.
    ///
    /// # Panics
    ///
    /// Fatal if the queue was already cast (or is casting).
    #[track_caller]
    pub fn cast(&self, value: T) {
        self.affinity.assert_current("cast");
        ensure!(self.state.get() == CastState::Pending, Invariant::CastTwice);
        self.state.set(CastState::Casting);

        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        let _span = debug_span!(
            "completion_cast",
            storage = self.label,
            callbacks = callbacks.len()
        )
        .entered();
        for callback in callbacks {
            callback(&value);
        }

        self.state.set(CastState::Cast);
        let late = std::mem::take(&mut *self.callbacks.borrow_mut());
        if !late.is_empty() {
            warn!(
                storage = self.label,
                dropped = late.len(),
                "callbacks enqueued during cast will never run"
            );
        }
    }

    #[must_use]
    pub fn is_cast(&self) -> bool {
        self.state.get() != CastState::Pending
    }

    /// Callbacks waiting for the cast.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue-only view for producers.
    #[must_use]
    pub fn channel(&self) -> CompletionChannel<'_, T> {
        CompletionChannel { queue: self }
    }
}

impl<T> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompletionQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("label", &self.label)
            .field("state", &self.state.get())
            .field("pending", &self.callbacks.borrow().len())
            .finish()
    }
}

impl<T> Drop for CompletionQueue<T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let pending = self.callbacks.get_mut().len();
        ensure!(
            self.state.get() != CastState::Pending,
            Invariant::DroppedBeforeCast { pending }
        );
    }
}

/// Borrowed handle that can add callbacks but not cast them.
#[derive(Clone, Copy)]
pub struct CompletionChannel<'a, T> {
    queue: &'a CompletionQueue<T>,
}

impl<T> CompletionChannel<'_, T> {
    #[track_caller]
    pub fn enqueue(&self, callback: impl FnOnce(&T) + 'static) {
        self.queue.enqueue(callback);
    }
}

impl<T> fmt::Debug for CompletionChannel<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompletionChannel")
            .field(&self.queue.label)
            .finish()
    }
}
