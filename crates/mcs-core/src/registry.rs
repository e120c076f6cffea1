#![forbid(unsafe_code)]

//! Insertion-ordered registry of weakly held listeners.
//!
//! # Design
//!
//! Entries pair a [`ListenerKey`] (the listener's address, i.e. its identity,
//! not its contents) with a `Weak` handle. The registry never keeps a listener
//! alive; the owner is responsible for deregistering before dropping it.
//! Liveness is checked lazily, when a notification pass resolves each handle,
//! so a forgotten deregistration is reported at the first pass that would
//! have used the dead listener.
//!
//! # Invariants
//!
//! 1. At most one entry per key.
//! 2. Entries are visited in insertion order.
//! 3. A pass works on a [`Snapshot`] taken before the first listener runs, so
//!    removals and additions during the pass never skip, repeat or include an
//!    entry.
//! 4. The registry is empty when dropped.

use std::fmt;
use std::panic::Location;
use std::rc::{Rc, Weak};

use crate::violation::{CHECKS_ENABLED, Invariant, fatal};

/// Identity of a listener, derived from its address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey(usize);

impl ListenerKey {
    /// Key of the listener owned by `listener`.
    #[must_use]
    pub fn of<L: ?Sized>(listener: &Rc<L>) -> Self {
        Self(Rc::as_ptr(listener).cast::<()>() as usize)
    }

    /// Key of a listener seen through a plain reference. Inside a handler,
    /// `ListenerKey::of_ref(self)` equals the key produced by
    /// [`ListenerKey::of`] for the `Rc` it was registered with.
    #[must_use]
    pub fn of_ref<L: ?Sized>(listener: &L) -> Self {
        Self(std::ptr::from_ref(listener).cast::<()>() as usize)
    }

    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerKey({:#x})", self.0)
    }
}

/// Source location of a registration.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallSite(&'static Location<'static>);

impl CallSite {
    /// The caller's location (propagated through `#[track_caller]` frames).
    #[must_use]
    #[track_caller]
    pub fn here() -> Self {
        Self(Location::caller())
    }

    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0.file(), self.0.line(), self.0.column())
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallSite({self})")
    }
}

/// One registered listener.
pub struct ListenerEntry<L: ?Sized> {
    key: ListenerKey,
    listener: Weak<L>,
    registered_at: Option<CallSite>,
}

impl<L: ?Sized> ListenerEntry<L> {
    /// Entry for `listener`, keyed by its identity.
    #[must_use]
    pub fn new(listener: Weak<L>, registered_at: Option<CallSite>) -> Self {
        let key = ListenerKey(listener.as_ptr().cast::<()>() as usize);
        Self {
            key,
            listener,
            registered_at,
        }
    }

    /// Entry under an explicit key. The key must stay unique for as long as
    /// the entry is registered.
    #[must_use]
    pub fn with_key(key: ListenerKey, listener: Weak<L>, registered_at: Option<CallSite>) -> Self {
        Self {
            key,
            listener,
            registered_at,
        }
    }

    #[must_use]
    pub fn key(&self) -> ListenerKey {
        self.key
    }

    #[must_use]
    pub fn registered_at(&self) -> Option<CallSite> {
        self.registered_at
    }

    /// Resolve the weak handle, terminating if the listener is gone.
    #[track_caller]
    #[must_use]
    pub fn resolve(&self) -> Rc<L> {
        match self.listener.upgrade() {
            Some(listener) => listener,
            None => fatal(Invariant::DanglingListener {
                key: self.key,
                registered_at: self.registered_at,
            }),
        }
    }

    fn is_alive(&self) -> bool {
        self.listener.strong_count() > 0
    }
}

impl<L: ?Sized> Clone for ListenerEntry<L> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            listener: Weak::clone(&self.listener),
            registered_at: self.registered_at,
        }
    }
}

impl<L: ?Sized> fmt::Debug for ListenerEntry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("key", &self.key)
            .field("alive", &self.is_alive())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Ordered collection of weakly held listeners.
pub struct WeakListenerRegistry<L: ?Sized> {
    entries: Vec<ListenerEntry<L>>,
}

impl<L: ?Sized> Default for WeakListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> WeakListenerRegistry<L> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: ListenerKey) -> bool {
        self.position(key).is_some()
    }

    /// Keys in visiting order.
    pub fn keys(&self) -> impl Iterator<Item = ListenerKey> + '_ {
        self.entries.iter().map(ListenerEntry::key)
    }

    /// Register `listener` under its identity, recording the caller.
    #[track_caller]
    pub fn register(&mut self, listener: Weak<L>) -> ListenerKey {
        let entry = ListenerEntry::new(listener, Some(CallSite::here()));
        let key = entry.key();
        self.insert(entry);
        key
    }

    /// Append a prepared entry. Fatal if its key is already present.
    #[track_caller]
    pub fn insert(&mut self, entry: ListenerEntry<L>) {
        self.ensure_absent(entry.key);
        self.entries.push(entry);
    }

    /// Terminate with [`Invariant::DuplicateRegistration`] if `key` is
    /// registered.
    #[track_caller]
    pub fn ensure_absent(&self, key: ListenerKey) {
        if CHECKS_ENABLED {
            if let Some(existing) = self.position(key).map(|idx| &self.entries[idx]) {
                fatal(Invariant::DuplicateRegistration {
                    key,
                    registered_at: existing.registered_at,
                });
            }
        }
    }

    /// Remove the entry for `key`. Fatal if absent.
    #[track_caller]
    pub fn deregister(&mut self, key: ListenerKey) {
        match self.position(key) {
            Some(idx) => {
                self.entries.remove(idx);
            }
            None => {
                crate::ensure!(false, Invariant::MissingRegistration { key });
            }
        }
    }

    /// Immutable copy of the current entries for one notification pass.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot<L> {
        Snapshot {
            entries: self.entries.clone(),
        }
    }

    /// Visit every listener in a snapshot taken now.
    #[track_caller]
    pub fn notify_all(&self, visit: impl FnMut(ListenerKey, &L)) {
        self.snapshot().for_each(visit);
    }

    /// Earliest registration site among the remaining entries.
    #[must_use]
    pub fn first_call_site(&self) -> Option<CallSite> {
        self.entries.iter().find_map(ListenerEntry::registered_at)
    }

    /// Drop every entry without the emptiness check. Used when a container is
    /// torn down during unwinding.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, key: ListenerKey) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }
}

impl<L: ?Sized> Drop for WeakListenerRegistry<L> {
    fn drop(&mut self) {
        if std::thread::panicking() || self.entries.is_empty() {
            return;
        }
        crate::ensure!(
            false,
            Invariant::ListenersOutlivedContainer {
                count: self.entries.len(),
                registered_at: self.first_call_site(),
            }
        );
    }
}

impl<L: ?Sized> fmt::Debug for WeakListenerRegistry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

/// Entries frozen at the start of a notification pass.
pub struct Snapshot<L: ?Sized> {
    entries: Vec<ListenerEntry<L>>,
}

impl<L: ?Sized> Snapshot<L> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve and visit each entry in order. A dead entry is fatal.
    #[track_caller]
    pub fn for_each(self, mut visit: impl FnMut(ListenerKey, &L)) {
        for entry in &self.entries {
            let listener = entry.resolve();
            visit(entry.key, &listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    trait Named {
        fn name(&self) -> char;
    }

    struct Tag(char);

    impl Named for Tag {
        fn name(&self) -> char {
            self.0
        }
    }

    fn weak(tag: &Rc<Tag>) -> Weak<dyn Named> {
        let weak: Weak<dyn Named> = Rc::<Tag>::downgrade(tag);
        weak
    }

    fn drain_all(registry: &mut WeakListenerRegistry<dyn Named>) {
        let keys: Vec<_> = registry.keys().collect();
        for key in keys {
            registry.deregister(key);
        }
    }

    #[test]
    fn register_then_notify_in_insertion_order() {
        let a = Rc::new(Tag('A'));
        let b = Rc::new(Tag('B'));
        let c = Rc::new(Tag('C'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        registry.register(weak(&a));
        registry.register(weak(&b));
        registry.register(weak(&c));

        let mut seen = Vec::new();
        registry.notify_all(|_, listener| seen.push(listener.name()));
        assert_eq!(seen, vec!['A', 'B', 'C']);
        drain_all(&mut registry);
    }

    #[test]
    fn key_matches_rc_identity() {
        let a = Rc::new(Tag('A'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        let key = registry.register(weak(&a));
        assert_eq!(key, ListenerKey::of(&a));
        assert_eq!(key, ListenerKey::of_ref(&*a));
        assert!(registry.contains(key));
        registry.deregister(key);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_changes() {
        let a = Rc::new(Tag('A'));
        let b = Rc::new(Tag('B'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        registry.register(weak(&a));
        let snapshot = registry.snapshot();
        registry.register(weak(&b));
        registry.deregister(ListenerKey::of(&a));

        let mut seen = Vec::new();
        snapshot.for_each(|_, listener| seen.push(listener.name()));
        assert_eq!(seen, vec!['A']);
        drain_all(&mut registry);
    }

    #[test]
    fn registry_does_not_extend_lifetime() {
        let a = Rc::new(Tag('A'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        registry.register(weak(&a));
        assert_eq!(Rc::strong_count(&a), 1);
        registry.deregister(ListenerKey::of(&a));
    }

    #[test]
    fn debug_lists_liveness() {
        let a = Rc::new(Tag('A'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        registry.register(weak(&a));
        let dbg = format!("{registry:?}");
        assert!(dbg.contains("alive: true"));
        drain_all(&mut registry);
    }

    #[test]
    fn call_site_points_at_registration() {
        let a = Rc::new(Tag('A'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        registry.register(weak(&a));
        let site = registry.first_call_site().unwrap();
        assert!(site.file().ends_with("registry.rs"));
        drain_all(&mut registry);
    }

    #[test]
    #[should_panic(expected = "is already registered")]
    fn duplicate_registration_is_fatal() {
        let a = Rc::new(Tag('A'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        registry.register(weak(&a));
        registry.register(weak(&a));
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn missing_deregistration_is_fatal() {
        let a = Rc::new(Tag('A'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        registry.deregister(ListenerKey::of(&a));
    }

    #[test]
    #[should_panic(expected = "was dropped before being deregistered")]
    fn dangling_listener_is_fatal_at_notification() {
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        {
            let a = Rc::new(Tag('A'));
            registry.register(weak(&a));
        }
        registry.notify_all(|_, _| {});
    }

    #[test]
    #[should_panic(expected = "still registered when the container was dropped")]
    fn dropping_non_empty_registry_is_fatal() {
        let a = Rc::new(Tag('A'));
        let mut registry = WeakListenerRegistry::<dyn Named>::new();
        registry.register(weak(&a));
        drop(registry);
    }

    #[test]
    fn deregistering_during_snapshot_visit_does_not_skip() {
        let a = Rc::new(Tag('A'));
        let b = Rc::new(Tag('B'));
        let registry = RefCell::new(WeakListenerRegistry::<dyn Named>::new());
        registry.borrow_mut().register(weak(&a));
        registry.borrow_mut().register(weak(&b));

        let mut seen = Vec::new();
        let snapshot = registry.borrow().snapshot();
        snapshot.for_each(|key, listener| {
            seen.push(listener.name());
            registry.borrow_mut().deregister(key);
        });
        assert_eq!(seen, vec!['A', 'B']);
        assert!(registry.borrow().is_empty());
    }
}
