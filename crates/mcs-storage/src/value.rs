#![forbid(unsafe_code)]

//! Observable scalar value with will-set / did-set notification.
//!
//! # Design
//!
//! [`ObservableValue<T>`] wraps a value of type `T` in shared,
//! reference-counted storage. Every [`write`](ObservableValue::write) casts
//! to two independent listener sets:
//!
//! ```text
//! write(v) ─▶ will_set pass ─▶ value = v ─▶ did_set pass ─▶ drain deferred
//!             (reads old)                   (reads new)
//! ```
//!
//! Listeners are held weakly; the caller keeps them alive and must
//! deregister them before dropping them or the container.
//!
//! # Performance
//!
//! | Operation      | Complexity                       |
//! |----------------|----------------------------------|
//! | `read()`       | O(1) + clone of `T`              |
//! | `write()`      | O(W + D), W/D = listener counts  |
//! | `register_*()` | O(n) duplicate scan              |
//!
//! # Failure Modes
//!
//! - **Re-entrant write**: calling `write()` or `update()` from a handler is
//!   fatal. Read the value instead, or schedule the write elsewhere.
//! - **Registry change from a handler**: `register_*` is deferred
//!   automatically; `deregister_*` of another listener must go through
//!   `queue_deregister_*`. A listener may always deregister itself directly.
//! - **Dangling listener**: a listener dropped while still registered is
//!   reported at the next write.
//! - **Leaked registration**: dropping the last handle while listeners are
//!   registered is fatal.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use mcs_core::{
    AffinityToken, ListenerKey, Multicast, ReentrancyGuard, StorageConfig,
};
use tracing::debug_span;

/// Receiver of value-change notifications.
///
/// Both methods default to no-ops, so a listener only implements what it
/// needs. Plain `Fn()` closures implement both by calling themselves; which
/// one fires depends on the set the closure was registered in.
pub trait ValueListener {
    /// Called before the value is replaced. `read()` still returns the old
    /// value.
    fn will_set(&self) {}
    /// Called after the value is replaced. `read()` returns the new value.
    fn did_set(&self) {}
}

impl<F: Fn()> ValueListener for F {
    fn will_set(&self) {
        self();
    }

    fn did_set(&self) {
        self();
    }
}

/// Which of the two listener sets an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValuePhase {
    WillSet,
    DidSet,
}

/// Shared interior for [`ObservableValue<T>`].
struct ValueInner<T> {
    config: StorageConfig,
    affinity: AffinityToken,
    guard: ReentrancyGuard,
    value: RefCell<T>,
    version: Cell<u64>,
    will_set: Multicast<dyn ValueListener>,
    did_set: Multicast<dyn ValueListener>,
}

impl<T> ValueInner<T> {
    fn channel(&self, phase: ValuePhase) -> &Multicast<dyn ValueListener> {
        match phase {
            ValuePhase::WillSet => &self.will_set,
            ValuePhase::DidSet => &self.did_set,
        }
    }
}

impl<T> Drop for ValueInner<T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.will_set.clear();
            self.did_set.clear();
            return;
        }
        self.affinity.assert_current("drop");
        self.guard.require_idle("drop");
    }
}

/// A shared scalar value that notifies listeners around every write.
///
/// Cloning an `ObservableValue` creates a new handle to the **same** inner
/// state: both handles see the same value and share listeners.
///
/// # Invariants
///
/// 1. Will-set listeners run before the value changes, did-set listeners
///    after, deferred registration changes after both.
/// 2. `version` increments by exactly 1 per completed write or update.
/// 3. Listeners are notified in registration order (not part of the
///    contract; do not rely on it outside tests).
/// 4. Every operation runs on the context that created the value.
pub struct ObservableValue<T> {
    inner: Rc<ValueInner<T>>,
}

// Manual Clone: shares the same Rc.
impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &*self.inner;
        let mut dbg = f.debug_struct("ObservableValue");
        dbg.field("label", &inner.config.label);
        match inner.value.try_borrow() {
            Ok(value) => dbg.field("value", &*value),
            Err(_) => dbg.field("value", &"<being replaced>"),
        };
        dbg.field("version", &inner.version.get())
            .field("will_set", &inner.will_set.len())
            .field("did_set", &inner.did_set.len())
            .finish()
    }
}

impl<T> ObservableValue<T> {
    /// Create a value bound to the current context with default
    /// configuration.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_config(value, StorageConfig::new("value"))
    }

    /// Create a value bound to the current context.
    #[must_use]
    pub fn with_config(value: T, config: StorageConfig) -> Self {
        Self {
            inner: Rc::new(ValueInner {
                affinity: AffinityToken::capture_with(config.affinity),
                guard: ReentrancyGuard::new(),
                value: RefCell::new(value),
                version: Cell::new(0),
                will_set: Multicast::new("will_set", &config),
                did_set: Multicast::new("did_set", &config),
                config,
            }),
        }
    }

    /// Get a clone of the current value.
    ///
    /// Allowed from inside a handler: will-set handlers see the old value,
    /// did-set handlers the new one.
    #[must_use]
    #[track_caller]
    pub fn read(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Access the current value by reference without cloning.
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let inner = &*self.inner;
        inner.affinity.assert_current("read");
        inner.guard.run_read("read", || f(&*inner.value.borrow()))
    }

    /// Replace the value, notifying will-set listeners before and did-set
    /// listeners after.
    ///
    /// # Panics
    ///
    /// Fatal when called off-context or from inside a handler of this value.
    #[track_caller]
    pub fn write(&self, value: T) {
        let inner = &*self.inner;
        inner.affinity.assert_current("write");
        inner.guard.run_guarded("write", None, || {
            let _span = debug_span!("value_write", storage = inner.config.label).entered();
            inner.will_set.cast(&inner.guard, |l| l.will_set());
            *inner.value.borrow_mut() = value;
            inner.version.set(inner.version.get() + 1);
            inner.did_set.cast(&inner.guard, |l| l.did_set());
            self.drain_deferred();
        });
    }

    /// Modify the value in place under the same will/did bracket as
    /// [`write`](Self::write).
    #[track_caller]
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let inner = &*self.inner;
        inner.affinity.assert_current("update");
        inner.guard.run_guarded("update", None, || {
            let _span = debug_span!("value_update", storage = inner.config.label).entered();
            inner.will_set.cast(&inner.guard, |l| l.will_set());
            f(&mut *inner.value.borrow_mut());
            inner.version.set(inner.version.get() + 1);
            inner.did_set.cast(&inner.guard, |l| l.did_set());
            self.drain_deferred();
        });
    }

    /// Number of completed writes and updates.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn will_set_count(&self) -> usize {
        self.inner.will_set.len()
    }

    #[must_use]
    pub fn did_set_count(&self) -> usize {
        self.inner.did_set.len()
    }

    /// Register `listener` for will-set notifications.
    ///
    /// From inside a handler the registration is deferred until the current
    /// write finishes.
    #[track_caller]
    pub fn register_will_set<L: ValueListener + 'static>(&self, listener: &Rc<L>) -> ListenerKey {
        self.register_in(ValuePhase::WillSet, listener)
    }

    /// Register `listener` for did-set notifications.
    #[track_caller]
    pub fn register_did_set<L: ValueListener + 'static>(&self, listener: &Rc<L>) -> ListenerKey {
        self.register_in(ValuePhase::DidSet, listener)
    }

    /// Remove a will-set listener. From inside a handler, only the listener
    /// being notified may remove itself this way.
    #[track_caller]
    pub fn deregister_will_set(&self, key: ListenerKey) {
        self.deregister_in(ValuePhase::WillSet, key);
    }

    /// Remove a did-set listener. From inside a handler, only the listener
    /// being notified may remove itself this way.
    #[track_caller]
    pub fn deregister_did_set(&self, key: ListenerKey) {
        self.deregister_in(ValuePhase::DidSet, key);
    }

    /// Stage a will-set registration from inside a handler.
    #[track_caller]
    pub fn queue_register_will_set<L: ValueListener + 'static>(
        &self,
        listener: &Rc<L>,
    ) -> ListenerKey {
        self.queue_register_in(ValuePhase::WillSet, listener)
    }

    /// Stage a did-set registration from inside a handler.
    #[track_caller]
    pub fn queue_register_did_set<L: ValueListener + 'static>(
        &self,
        listener: &Rc<L>,
    ) -> ListenerKey {
        self.queue_register_in(ValuePhase::DidSet, listener)
    }

    /// Stage a will-set deregistration from inside a handler.
    #[track_caller]
    pub fn queue_deregister_will_set(&self, key: ListenerKey) {
        self.queue_deregister_in(ValuePhase::WillSet, key);
    }

    /// Stage a did-set deregistration from inside a handler.
    #[track_caller]
    pub fn queue_deregister_did_set(&self, key: ListenerKey) {
        self.queue_deregister_in(ValuePhase::DidSet, key);
    }

    /// Register `listener` in both sets.
    ///
    /// You are responsible for keeping `listener` alive until it is
    /// deregistered.
    #[track_caller]
    pub fn register<L: ValueListener + 'static>(&self, listener: &Rc<L>) -> ListenerKey {
        self.register_in(ValuePhase::WillSet, listener);
        self.register_in(ValuePhase::DidSet, listener)
    }

    /// Remove a listener from both sets.
    #[track_caller]
    pub fn deregister(&self, key: ListenerKey) {
        self.deregister_in(ValuePhase::WillSet, key);
        self.deregister_in(ValuePhase::DidSet, key);
    }

    #[track_caller]
    fn register_in<L: ValueListener + 'static>(
        &self,
        phase: ValuePhase,
        listener: &Rc<L>,
    ) -> ListenerKey {
        let inner = &*self.inner;
        inner.affinity.assert_current("register");
        let weak: Weak<dyn ValueListener> = Rc::<L>::downgrade(listener);
        let channel = inner.channel(phase);
        channel.register(&inner.guard, channel.entry(weak))
    }

    #[track_caller]
    fn deregister_in(&self, phase: ValuePhase, key: ListenerKey) {
        let inner = &*self.inner;
        inner.affinity.assert_current("deregister");
        inner.channel(phase).deregister(&inner.guard, key);
    }

    #[track_caller]
    fn queue_register_in<L: ValueListener + 'static>(
        &self,
        phase: ValuePhase,
        listener: &Rc<L>,
    ) -> ListenerKey {
        let inner = &*self.inner;
        inner.affinity.assert_current("queue_register");
        let weak: Weak<dyn ValueListener> = Rc::<L>::downgrade(listener);
        let channel = inner.channel(phase);
        channel.queue_register(&inner.guard, channel.entry(weak))
    }

    #[track_caller]
    fn queue_deregister_in(&self, phase: ValuePhase, key: ListenerKey) {
        let inner = &*self.inner;
        inner.affinity.assert_current("queue_deregister");
        inner.channel(phase).queue_deregister(&inner.guard, key);
    }

    fn drain_deferred(&self) {
        self.inner.will_set.drain();
        self.inner.did_set.drain();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
