#![forbid(unsafe_code)]

//! One listener channel: registry, deferred queue and the pass that casts to
//! them.
//!
//! A container owns one [`ReentrancyGuard`] and one `Multicast` per listener
//! set (a scalar value has two: will-set and did-set). The guard is passed in
//! on each call so several channels of one container share the same
//! `{busy, notifying-as}` state.
//!
//! # Entry points
//!
//! | Call                 | Idle                | During a pass                          |
//! |----------------------|---------------------|----------------------------------------|
//! | `register`           | direct              | staged (fatal if already registered)   |
//! | `deregister`         | direct              | direct for the running listener, fatal otherwise |
//! | `queue_register`     | fatal               | staged                                 |
//! | `queue_deregister`   | fatal               | staged                                 |
//!
//! Staged changes are applied by [`Multicast::drain`], which the container
//! calls once per mutation after every pass has ended.

use std::cell::RefCell;
use std::fmt;
use std::rc::Weak;

use tracing::{debug, trace};

use crate::config::StorageConfig;
use crate::deferred::DeferredMutationQueue;
use crate::guard::ReentrancyGuard;
use crate::registry::{CallSite, ListenerEntry, ListenerKey, WeakListenerRegistry};

/// Registry plus deferred queue for one kind of notification.
pub struct Multicast<L: ?Sized> {
    label: &'static str,
    channel: &'static str,
    record_call_sites: bool,
    trace_notifications: bool,
    registry: RefCell<WeakListenerRegistry<L>>,
    deferred: RefCell<DeferredMutationQueue<L>>,
}

impl<L: ?Sized> Multicast<L> {
    /// Empty channel named `channel`, configured from `config`.
    #[must_use]
    pub fn new(channel: &'static str, config: &StorageConfig) -> Self {
        Self {
            label: config.label,
            channel,
            record_call_sites: config.record_call_sites,
            trace_notifications: config.trace_notifications,
            registry: RefCell::new(WeakListenerRegistry::new()),
            deferred: RefCell::new(DeferredMutationQueue::new()),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &'static str {
        self.channel
    }

    /// Number of registered listeners (staged changes excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.borrow().is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: ListenerKey) -> bool {
        self.registry.borrow().contains(key)
    }

    /// Build an entry for `listener`, recording the caller if configured.
    #[track_caller]
    #[must_use]
    pub fn entry(&self, listener: Weak<L>) -> ListenerEntry<L> {
        let site = if self.record_call_sites {
            Some(CallSite::here())
        } else {
            None
        };
        ListenerEntry::new(listener, site)
    }

    /// Register directly, or stage the registration if a pass is running.
    #[track_caller]
    pub fn register(&self, guard: &ReentrancyGuard, entry: ListenerEntry<L>) -> ListenerKey {
        let key = entry.key();
        if guard.is_notifying() {
            self.registry.borrow().ensure_absent(key);
            debug!(
                storage = self.label,
                channel = self.channel,
                ?key,
                "registration deferred until the pass ends"
            );
            self.deferred.borrow_mut().queue_register(entry);
        } else {
            guard.run_guarded("register", None, || {
                self.registry.borrow_mut().insert(entry);
            });
        }
        key
    }

    /// Deregister directly. While a pass is running only the listener being
    /// notified may remove itself this way.
    #[track_caller]
    pub fn deregister(&self, guard: &ReentrancyGuard, key: ListenerKey) {
        guard.run_guarded("deregister", Some(key), || {
            self.registry.borrow_mut().deregister(key);
        });
    }

    /// Stage a registration. Only valid during a pass.
    #[track_caller]
    pub fn queue_register(&self, guard: &ReentrancyGuard, entry: ListenerEntry<L>) -> ListenerKey {
        guard.require_notifying("queue_register");
        let key = entry.key();
        self.registry.borrow().ensure_absent(key);
        self.deferred.borrow_mut().queue_register(entry);
        key
    }

    /// Stage a deregistration. Only valid during a pass.
    #[track_caller]
    pub fn queue_deregister(&self, guard: &ReentrancyGuard, key: ListenerKey) {
        guard.require_notifying("queue_deregister");
        self.deferred.borrow_mut().queue_deregister(key);
    }

    /// Run one notification pass over a snapshot of the registry.
    ///
    /// Must be called from inside [`ReentrancyGuard::run_guarded`].
    #[track_caller]
    pub fn cast(&self, guard: &ReentrancyGuard, mut visit: impl FnMut(&L)) {
        let snapshot = self.registry.borrow().snapshot();
        if snapshot.is_empty() {
            return;
        }
        guard.notify_pass(|| {
            snapshot.for_each(|key, listener| {
                if self.trace_notifications {
                    trace!(storage = self.label, channel = self.channel, ?key, "notify");
                }
                guard.visiting(key, || visit(listener));
            });
        });
    }

    /// Apply staged changes. Call once per mutation, after the passes.
    #[track_caller]
    pub fn drain(&self) -> usize {
        let mut deferred = self.deferred.borrow_mut();
        if deferred.is_empty() {
            return 0;
        }
        let applied = deferred.drain(&mut self.registry.borrow_mut());
        debug!(
            storage = self.label,
            channel = self.channel,
            applied,
            "applied deferred listener changes"
        );
        applied
    }

    /// Forget every listener without the emptiness check.
    pub fn clear(&self) {
        self.registry.borrow_mut().clear();
    }
}

impl<L: ?Sized> fmt::Debug for Multicast<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multicast")
            .field("channel", &self.channel)
            .field("listeners", &self.registry.borrow().len())
            .field("deferred", &!self.deferred.borrow().is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    trait Ping {
        fn ping(&self);
    }

    struct Recorder {
        name: char,
        log: Rc<StdRefCell<Vec<char>>>,
    }

    impl Ping for Recorder {
        fn ping(&self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    fn recorder(name: char, log: &Rc<StdRefCell<Vec<char>>>) -> Rc<Recorder> {
        Rc::new(Recorder {
            name,
            log: Rc::clone(log),
        })
    }

    fn weak(listener: &Rc<Recorder>) -> Weak<dyn Ping> {
        let weak: Weak<dyn Ping> = Rc::<Recorder>::downgrade(listener);
        weak
    }

    fn channel() -> Multicast<dyn Ping> {
        Multicast::new("ping", &StorageConfig::new("test"))
    }

    #[test]
    fn cast_visits_every_listener() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let a = recorder('A', &log);
        let b = recorder('B', &log);
        let guard = ReentrancyGuard::new();
        let multicast = channel();
        multicast.register(&guard, multicast.entry(weak(&a)));
        multicast.register(&guard, multicast.entry(weak(&b)));

        guard.run_guarded("write", None, || multicast.cast(&guard, |l| l.ping()));
        assert_eq!(*log.borrow(), vec!['A', 'B']);

        multicast.deregister(&guard, ListenerKey::of(&a));
        multicast.deregister(&guard, ListenerKey::of(&b));
        assert!(multicast.is_empty());
    }

    #[test]
    fn registration_during_pass_is_deferred() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let a = recorder('A', &log);
        let b = recorder('B', &log);
        let guard = ReentrancyGuard::new();
        let multicast = channel();
        multicast.register(&guard, multicast.entry(weak(&a)));

        guard.run_guarded("write", None, || {
            multicast.cast(&guard, |l| {
                l.ping();
                if !multicast.contains(ListenerKey::of(&b)) {
                    multicast.register(&guard, multicast.entry(weak(&b)));
                }
            });
            assert_eq!(multicast.len(), 1);
            assert_eq!(multicast.drain(), 1);
        });
        assert_eq!(*log.borrow(), vec!['A']);
        assert_eq!(multicast.len(), 2);

        multicast.deregister(&guard, ListenerKey::of(&a));
        multicast.deregister(&guard, ListenerKey::of(&b));
    }

    #[test]
    fn running_listener_may_remove_itself() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let a = recorder('A', &log);
        let guard = ReentrancyGuard::new();
        let multicast = channel();
        multicast.register(&guard, multicast.entry(weak(&a)));

        guard.run_guarded("write", None, || {
            multicast.cast(&guard, |l| {
                l.ping();
                multicast.deregister(&guard, ListenerKey::of_ref(l));
            });
        });
        assert!(multicast.is_empty());
    }

    #[test]
    #[should_panic(expected = "cannot run while a notification is being cast")]
    fn removing_another_listener_directly_is_fatal() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let a = recorder('A', &log);
        let b = recorder('B', &log);
        let guard = ReentrancyGuard::new();
        let multicast = channel();
        multicast.register(&guard, multicast.entry(weak(&a)));
        multicast.register(&guard, multicast.entry(weak(&b)));

        guard.run_guarded("write", None, || {
            multicast.cast(&guard, |_| multicast.deregister(&guard, ListenerKey::of(&b)));
        });
    }

    #[test]
    #[should_panic(expected = "only valid from inside a notification handler")]
    fn queue_register_outside_pass_is_fatal() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let a = recorder('A', &log);
        let guard = ReentrancyGuard::new();
        let multicast = channel();
        multicast.queue_register(&guard, multicast.entry(weak(&a)));
    }

    #[test]
    #[should_panic(expected = "is already registered")]
    fn registering_a_registered_listener_during_pass_fails_at_the_call() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let a = recorder('A', &log);
        let guard = ReentrancyGuard::new();
        let multicast = channel();
        multicast.register(&guard, multicast.entry(weak(&a)));

        guard.run_guarded("write", None, || {
            multicast.cast(&guard, |_| {
                multicast.register(&guard, multicast.entry(weak(&a)));
            });
        });
    }

    #[test]
    #[should_panic(expected = "is already registered")]
    fn queueing_a_registered_listener_fails_at_the_call() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let a = recorder('A', &log);
        let guard = ReentrancyGuard::new();
        let multicast = channel();
        multicast.register(&guard, multicast.entry(weak(&a)));

        guard.run_guarded("write", None, || {
            multicast.cast(&guard, |_| {
                multicast.queue_register(&guard, multicast.entry(weak(&a)));
            });
        });
    }

    #[test]
    fn entry_records_call_site_when_enabled() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let a = recorder('A', &log);
        let multicast: Multicast<dyn Ping> =
            Multicast::new("ping", &StorageConfig::new("t").with_call_sites(true));
        let entry = multicast.entry(weak(&a));
        assert!(entry.registered_at().is_some());

        let quiet: Multicast<dyn Ping> =
            Multicast::new("ping", &StorageConfig::new("t").with_call_sites(false));
        assert!(quiet.entry(weak(&a)).registered_at().is_none());
    }
}
