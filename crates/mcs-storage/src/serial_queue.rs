#![forbid(unsafe_code)]

//! Serial work queue backed by a dedicated worker thread.
//!
//! Every job runs on the worker with the queue's [`QueueId`] entered as the
//! current context, so a container created inside a job binds to the queue
//! rather than to the worker's OS thread. Jobs run one at a time in dispatch
//! order.
//!
//! # Error Propagation
//!
//! A queue whose worker has exited (after [`SerialQueue::shutdown`] or a
//! panicking job) reports [`QueueClosed`] from `dispatch` and
//! `dispatch_sync`.

use std::fmt;
use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use mcs_core::{ContextId, ContextScope, QueueId, current_context};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Msg {
    Run(Job),
    Shutdown,
}

/// The worker behind a [`SerialQueue`] is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed {
    pub queue: QueueId,
}

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "serial queue#{} is closed", self.queue.as_raw())
    }
}

impl std::error::Error for QueueClosed {}

pub struct SerialQueue {
    id: QueueId,
    name: String,
    sender: mpsc::Sender<Msg>,
    handle: Option<JoinHandle<()>>,
}

impl SerialQueue {
    /// Start a queue whose worker thread is called `name`.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let id = QueueId::next();
        let (tx, rx) = mpsc::channel::<Msg>();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(id, &rx))?;
        debug!(queue = id.as_raw(), name = %name, "serial queue started");

        Ok(Self {
            id,
            name,
            sender: tx,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context identity jobs on this queue observe.
    #[must_use]
    pub fn context(&self) -> ContextId {
        ContextId::Queue(self.id)
    }

    /// Queue `job` without waiting for it.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> Result<(), QueueClosed> {
        self.sender
            .send(Msg::Run(Box::new(job)))
            .map_err(|_| QueueClosed { queue: self.id })
    }

    /// Run `job` on the queue and wait for its result.
    ///
    /// Called from a job already running on this queue, `job` runs inline
    /// instead of deadlocking.
    pub fn dispatch_sync<R, F>(&self, job: F) -> Result<R, QueueClosed>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if current_context() == self.context() {
            return Ok(job());
        }
        let (result_tx, result_rx) = mpsc::sync_channel::<R>(1);
        self.dispatch(move || {
            let _ = result_tx.send(job());
        })?;
        result_rx.recv().map_err(|_| QueueClosed { queue: self.id })
    }

    /// Run the jobs already queued, then stop the worker and join it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!(queue = self.id.as_raw(), "serial queue stopped");
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn worker_loop(id: QueueId, rx: &mpsc::Receiver<Msg>) {
    let _scope = ContextScope::enter(id);
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Run(job) => {
                trace!(queue = id.as_raw(), "run job");
                job();
            }
            Msg::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn jobs_run_in_dispatch_order() {
        let queue = SerialQueue::spawn("mcs-test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            queue.dispatch(move || seen.lock().unwrap().push(i)).unwrap();
        }
        queue.dispatch_sync(|| ()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn jobs_observe_queue_context() {
        let queue = SerialQueue::spawn("mcs-test-context").unwrap();
        let expected = queue.context();
        let seen = queue.dispatch_sync(current_context).unwrap();
        assert_eq!(seen, expected);
        assert_ne!(current_context(), expected);
    }

    #[test]
    fn dispatch_sync_returns_value() {
        let queue = SerialQueue::spawn("mcs-test-sync").unwrap();
        assert_eq!(queue.dispatch_sync(|| 6 * 7).unwrap(), 42);
    }

    #[test]
    fn shutdown_drains_pending_jobs() {
        let queue = SerialQueue::spawn("mcs-test-shutdown").unwrap();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        queue.dispatch(move || *sink.lock().unwrap() += 1).unwrap();
        queue.shutdown();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn closed_queue_reports_error() {
        let mut queue = SerialQueue::spawn("mcs-test-closed").unwrap();
        queue.stop();
        let err = queue.dispatch(|| {}).unwrap_err();
        assert_eq!(err.queue, queue.id());
        assert!(err.to_string().contains("is closed"));
    }
}
