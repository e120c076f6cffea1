#![forbid(unsafe_code)]

//! Observable ordered sequence with range-level change notification.
//!
//! Each mutation is bracketed by a `will_*` and a `did_*` event carrying the
//! half-open index range it touches:
//!
//! | Mutation                  | Range reported            | `will_*` sees | `did_*` sees |
//! |---------------------------|---------------------------|---------------|--------------|
//! | `insert(new, at: i)`      | `i..i + new.len()`        | old contents  | new contents |
//! | `update(r, with: new)`    | `r`                       | old contents  | new contents |
//! | `delete(r)`               | `r`                       | old contents  | new contents |
//!
//! Ranges are always expressed in the coordinates that make sense for the
//! event: an insert range indexes into the *new* sequence, a delete range
//! into the *old* one. Listener bookkeeping follows the same protocol as
//! [`ObservableValue`](crate::ObservableValue).

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Range;
use std::rc::{Rc, Weak};

use mcs_core::{
    AffinityToken, Invariant, ListenerKey, Multicast, ReentrancyGuard, StorageConfig, ensure,
};
use tracing::debug_span;

/// Receiver of sequence-change notifications.
///
/// All six methods default to no-ops.
pub trait SequenceListener {
    fn will_insert_range(&self, _range: Range<usize>) {}
    fn did_insert_range(&self, _range: Range<usize>) {}

    fn will_update_range(&self, _range: Range<usize>) {}
    fn did_update_range(&self, _range: Range<usize>) {}

    fn will_delete_range(&self, _range: Range<usize>) {}
    fn did_delete_range(&self, _range: Range<usize>) {}
}

struct SequenceInner<T> {
    config: StorageConfig,
    affinity: AffinityToken,
    guard: ReentrancyGuard,
    elements: RefCell<Vec<T>>,
    version: Cell<u64>,
    listeners: Multicast<dyn SequenceListener>,
}

impl<T> Drop for SequenceInner<T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.listeners.clear();
            return;
        }
        self.affinity.assert_current("drop");
        self.guard.require_idle("drop");
    }
}

/// A shared sequence that notifies listeners around every range mutation.
///
/// Cloning creates another handle to the same sequence and listeners.
pub struct ObservableSequence<T> {
    inner: Rc<SequenceInner<T>>,
}

impl<T> Clone for ObservableSequence<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableSequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &*self.inner;
        let mut dbg = f.debug_struct("ObservableSequence");
        dbg.field("label", &inner.config.label);
        match inner.elements.try_borrow() {
            Ok(elements) => dbg.field("elements", &*elements),
            Err(_) => dbg.field("elements", &"<being mutated>"),
        };
        dbg.field("version", &inner.version.get())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl<T> ObservableSequence<T> {
    #[must_use]
    pub fn new(initial: Vec<T>) -> Self {
        Self::with_config(initial, StorageConfig::new("sequence"))
    }

    #[must_use]
    pub fn with_config(initial: Vec<T>, config: StorageConfig) -> Self {
        Self {
            inner: Rc::new(SequenceInner {
                affinity: AffinityToken::capture_with(config.affinity),
                guard: ReentrancyGuard::new(),
                elements: RefCell::new(initial),
                version: Cell::new(0),
                listeners: Multicast::new("sequence", &config),
                config,
            }),
        }
    }

    /// Full snapshot of the current contents.
    #[must_use]
    #[track_caller]
    pub fn read(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.with(<[T]>::to_vec)
    }

    /// Borrow the contents without cloning.
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let inner = &*self.inner;
        inner.affinity.assert_current("read");
        inner
            .guard
            .run_read("read", || f(inner.elements.borrow().as_slice()))
    }

    #[must_use]
    #[track_caller]
    pub fn get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        self.with(|elements| elements.get(index).cloned())
    }

    #[must_use]
    #[track_caller]
    pub fn len(&self) -> usize {
        self.with(<[T]>::len)
    }

    #[must_use]
    #[track_caller]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completed mutations.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Insert `new_elements` so the first lands at `index`.
    ///
    /// # Panics
    ///
    /// Fatal if `index > len`, off-context, or from inside a handler.
    #[track_caller]
    pub fn insert(&self, new_elements: impl IntoIterator<Item = T>, index: usize) {
        let inner = &*self.inner;
        inner.affinity.assert_current("insert");
        let new_elements: Vec<T> = new_elements.into_iter().collect();
        inner.guard.run_guarded("insert", None, || {
            let len = inner.elements.borrow().len();
            ensure!(index <= len, Invariant::IndexOutOfBounds { index, len });
            let range = index..index + new_elements.len();
            let _span = debug_span!(
                "sequence_insert",
                storage = inner.config.label,
                start = range.start,
                end = range.end
            )
            .entered();

            inner
                .listeners
                .cast(&inner.guard, |l| l.will_insert_range(range.clone()));
            {
                let mut elements = inner.elements.borrow_mut();
                let tail = elements.split_off(index);
                elements.extend(new_elements);
                elements.extend(tail);
            }
            self.bump();
            inner
                .listeners
                .cast(&inner.guard, |l| l.did_insert_range(range.clone()));
            inner.listeners.drain();
        });
    }

    /// Replace the elements in `range` with an equal number of new ones.
    ///
    /// # Panics
    ///
    /// Fatal if `range` is out of bounds or its length differs from the
    /// number of `new_elements`.
    #[track_caller]
    pub fn update(&self, range: Range<usize>, new_elements: impl IntoIterator<Item = T>) {
        let inner = &*self.inner;
        inner.affinity.assert_current("update");
        let new_elements: Vec<T> = new_elements.into_iter().collect();
        inner.guard.run_guarded("update", None, || {
            self.check_range(&range);
            ensure!(
                new_elements.len() == range.len(),
                Invariant::LengthMismatch {
                    expected: range.len(),
                    actual: new_elements.len(),
                }
            );
            let _span = debug_span!(
                "sequence_update",
                storage = inner.config.label,
                start = range.start,
                end = range.end
            )
            .entered();

            inner
                .listeners
                .cast(&inner.guard, |l| l.will_update_range(range.clone()));
            drop(
                inner
                    .elements
                    .borrow_mut()
                    .splice(range.clone(), new_elements),
            );
            self.bump();
            inner
                .listeners
                .cast(&inner.guard, |l| l.did_update_range(range.clone()));
            inner.listeners.drain();
        });
    }

    /// Remove the elements in `range`.
    ///
    /// # Panics
    ///
    /// Fatal if `range` is out of bounds.
    #[track_caller]
    pub fn delete(&self, range: Range<usize>) {
        let inner = &*self.inner;
        inner.affinity.assert_current("delete");
        inner.guard.run_guarded("delete", None, || {
            self.check_range(&range);
            let _span = debug_span!(
                "sequence_delete",
                storage = inner.config.label,
                start = range.start,
                end = range.end
            )
            .entered();

            inner
                .listeners
                .cast(&inner.guard, |l| l.will_delete_range(range.clone()));
            inner.elements.borrow_mut().drain(range.clone());
            self.bump();
            inner
                .listeners
                .cast(&inner.guard, |l| l.did_delete_range(range.clone()));
            inner.listeners.drain();
        });
    }

    /// Register `listener`. Deferred automatically when called from a
    /// handler.
    ///
    /// You are responsible for keeping `listener` alive until it is
    /// deregistered.
    #[track_caller]
    pub fn register<L: SequenceListener + 'static>(&self, listener: &Rc<L>) -> ListenerKey {
        let inner = &*self.inner;
        inner.affinity.assert_current("register");
        let weak: Weak<dyn SequenceListener> = Rc::<L>::downgrade(listener);
        inner
            .listeners
            .register(&inner.guard, inner.listeners.entry(weak))
    }

    /// Remove a listener. From inside a handler, only the listener being
    /// notified may remove itself this way.
    #[track_caller]
    pub fn deregister(&self, key: ListenerKey) {
        let inner = &*self.inner;
        inner.affinity.assert_current("deregister");
        inner.listeners.deregister(&inner.guard, key);
    }

    /// Stage a registration from inside a handler.
    #[track_caller]
    pub fn queue_register<L: SequenceListener + 'static>(&self, listener: &Rc<L>) -> ListenerKey {
        let inner = &*self.inner;
        inner.affinity.assert_current("queue_register");
        let weak: Weak<dyn SequenceListener> = Rc::<L>::downgrade(listener);
        inner
            .listeners
            .queue_register(&inner.guard, inner.listeners.entry(weak))
    }

    /// Stage a deregistration from inside a handler.
    #[track_caller]
    pub fn queue_deregister(&self, key: ListenerKey) {
        let inner = &*self.inner;
        inner.affinity.assert_current("queue_deregister");
        inner.listeners.queue_deregister(&inner.guard, key);
    }

    #[track_caller]
    fn check_range(&self, range: &Range<usize>) {
        let len = self.inner.elements.borrow().len();
        ensure!(
            range.start <= range.end && range.end <= len,
            Invariant::RangeOutOfBounds {
                range: range.clone(),
                len,
            }
        );
    }

    fn bump(&self) {
        self.inner.version.set(self.inner.version.get() + 1);
    }
}
