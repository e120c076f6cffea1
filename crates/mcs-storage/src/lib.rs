#![forbid(unsafe_code)]

//! Observable containers with checked change notification.
//!
//! - [`ObservableValue`]: a shared scalar with will-set / did-set listener
//!   sets.
//! - [`ObservableSequence`]: a shared ordered sequence reporting the index
//!   range of every insert, update and delete.
//! - [`CompletionQueue`]: a one-shot FIFO list of callbacks fired by a single
//!   `cast`.
//! - [`SerialQueue`]: a worker thread that runs jobs under its own context
//!   identity, for containers bound to a queue instead of a thread.
//!
//! # Architecture
//!
//! Containers are `Rc`-backed clone handles, so they never leave the thread
//! that built them. Listeners are held as `Weak` trait objects keyed by
//! address; the caller owns them and deregisters them explicitly. The
//! protocol machinery (affinity, reentrancy guard, registry, deferred queue)
//! lives in `mcs-core`.
//!
//! # Invariants
//!
//! 1. Within one mutation: will-notifications, then the change, then
//!    did-notifications, then deferred registry changes.
//! 2. A handler may read the container but never mutate it.
//! 3. A handler may deregister itself directly; any other registry change it
//!    makes is staged until the pass ends.
//! 4. Every operation runs on the context (thread or serial queue) that
//!    created the container.
//! 5. Listeners must be deregistered before they or the container are
//!    dropped.
//!
//! Breaking any of these is fatal; see `mcs_core::violation`.

pub mod completion;
pub mod sequence;
pub mod serial_queue;
pub mod value;

pub use completion::{CompletionChannel, CompletionQueue};
pub use mcs_core::{
    AffinityMode, ContextId, ContextScope, ListenerKey, QueueId, StorageConfig, UsageError,
    current_context,
};
pub use sequence::{ObservableSequence, SequenceListener};
pub use serial_queue::{QueueClosed, SerialQueue};
pub use value::{ObservableValue, ValueListener, ValuePhase};
