#![forbid(unsafe_code)]

//! Registration changes requested while a notification pass is running.
//!
//! Handlers may not touch the registry of the pass that is calling them
//! (apart from deregistering themselves). They stage changes here instead,
//! and the owner applies them with [`DeferredMutationQueue::drain`] once the
//! pass has ended: all registrations first, then all deregistrations.
//!
//! Registering and deregistering the same key in one pass is therefore a net
//! no-op, while deregistering a listener and registering it again in one pass
//! is reported as a duplicate registration at drain time.

use std::fmt;

use crate::registry::{ListenerEntry, ListenerKey, WeakListenerRegistry};
use crate::violation::{CHECKS_ENABLED, Invariant, fatal};

/// Staged registrations and deregistrations for one registry.
pub struct DeferredMutationQueue<L: ?Sized> {
    registrations: Vec<ListenerEntry<L>>,
    deregistrations: Vec<ListenerKey>,
}

impl<L: ?Sized> Default for DeferredMutationQueue<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> DeferredMutationQueue<L> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            deregistrations: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty() && self.deregistrations.is_empty()
    }

    #[must_use]
    pub fn pending_registrations(&self) -> usize {
        self.registrations.len()
    }

    #[must_use]
    pub fn pending_deregistrations(&self) -> usize {
        self.deregistrations.len()
    }

    /// Stage a registration. Fatal if the key is already staged.
    #[track_caller]
    pub fn queue_register(&mut self, entry: ListenerEntry<L>) {
        if CHECKS_ENABLED && self.registrations.iter().any(|e| e.key() == entry.key()) {
            fatal(Invariant::DuplicateQueuedRegistration { key: entry.key() });
        }
        self.registrations.push(entry);
    }

    /// Stage a deregistration. Fatal if the key is already staged.
    #[track_caller]
    pub fn queue_deregister(&mut self, key: ListenerKey) {
        if CHECKS_ENABLED && self.deregistrations.contains(&key) {
            fatal(Invariant::DuplicateQueuedDeregistration { key });
        }
        self.deregistrations.push(key);
    }

    /// Apply every staged change to `onto`, registrations first, and clear
    /// both sub-queues. Returns the number of changes applied.
    #[track_caller]
    pub fn drain(&mut self, onto: &mut WeakListenerRegistry<L>) -> usize {
        let applied = self.registrations.len() + self.deregistrations.len();
        for entry in self.registrations.drain(..) {
            onto.insert(entry);
        }
        for key in self.deregistrations.drain(..) {
            onto.deregister(key);
        }
        applied
    }
}

impl<L: ?Sized> fmt::Debug for DeferredMutationQueue<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredMutationQueue")
            .field("registrations", &self.registrations)
            .field("deregistrations", &self.deregistrations)
            .finish()
    }
}
