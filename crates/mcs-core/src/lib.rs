#![forbid(unsafe_code)]

//! Core: the notification-safety protocol behind multicasting storage.
//!
//! # Role in mcs
//! `mcs-core` holds the primitives every observable container composes. It
//! has no container of its own; `mcs-storage` builds `ObservableValue` and
//! `ObservableSequence` on top of it.
//!
//! # Primary responsibilities
//! - **AffinityToken**: binds a container to the thread or serial queue that
//!   created it.
//! - **ReentrancyGuard**: the `{busy, notifying-as}` state machine that
//!   rejects overlapping and reentrant mutation.
//! - **WeakListenerRegistry**: insertion-ordered weak listeners keyed by
//!   identity, with lazy dangling-listener detection.
//! - **DeferredMutationQueue**: registration changes requested from inside a
//!   handler, applied after the pass.
//! - **Multicast**: one listener channel wiring the registry, the deferred
//!   queue and the guard together.
//!
//! # Failure model
//! All misuse is fatal; see [`violation`]. Nothing here returns a recoverable
//! error for a broken contract.

pub mod affinity;
pub mod config;
pub mod deferred;
pub mod guard;
pub mod multicast;
pub mod registry;
pub mod violation;

pub use affinity::{AffinityMode, AffinityToken, ContextId, ContextScope, QueueId, current_context};
pub use config::StorageConfig;
pub use deferred::DeferredMutationQueue;
pub use guard::{Notifying, ReentrancyGuard};
pub use multicast::Multicast;
pub use registry::{CallSite, ListenerEntry, ListenerKey, Snapshot, WeakListenerRegistry};
pub use violation::{CHECKS_ENABLED, Invariant, UsageError, fatal};
