//! Background reclamation of expensive values.
//!
//! Values whose reclamation effort passes the configured threshold are
//! not dropped on the main thread. Ownership moves through a channel to
//! a worker thread that drops them and keeps a process-visible count of
//! jobs still pending. Whole databases travel the same road when they
//! are flushed asynchronously.
//!
//! The handoff channel is the only structure shared between the main
//! thread and the worker; once a value is enqueued the main thread
//! holds no reference to it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use slog::{debug, Logger};

use crate::dict::Dict;
use crate::object::Object;

pub(crate) enum Job {
    Value(Object),
    Database {
        dict: Dict<Bytes, Object>,
        expires: Dict<Bytes, i64>,
        keys: usize,
    },
}

/// Handle to the reclamation worker. Dropping the handle closes the
/// queue and joins the thread after it drains.
pub struct LazyFree {
    pending: Arc<AtomicUsize>,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl LazyFree {
    pub fn spawn(log: Logger) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pending);
        let worker = std::thread::Builder::new()
            .name("lazyfree".to_string())
            .spawn(move || run_worker(receiver, counter, log))
            .expect("spawn lazyfree worker");
        LazyFree {
            pending,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Number of reclamation jobs not yet finished by the worker.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Hands one value to the worker. The pending count is raised before
    /// the value leaves the main thread, so a caller polling the count
    /// never observes a gap.
    pub(crate) fn queue_value(&self, value: Object) {
        self.pending.fetch_add(1, Ordering::Release);
        self.sender
            .as_ref()
            .expect("reclaimer running")
            .send(Job::Value(value))
            .expect("reclaimer alive");
    }

    /// Hands a whole database (value table plus expiry table) to the
    /// worker, accounted as one unit per stored key.
    pub(crate) fn queue_database(&self, dict: Dict<Bytes, Object>, expires: Dict<Bytes, i64>) {
        let keys = dict.len();
        self.pending.fetch_add(keys, Ordering::Release);
        self.sender
            .as_ref()
            .expect("reclaimer running")
            .send(Job::Database {
                dict,
                expires,
                keys,
            })
            .expect("reclaimer alive");
    }
}

impl Drop for LazyFree {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(receiver: Receiver<Job>, pending: Arc<AtomicUsize>, log: Logger) {
    for job in receiver {
        match job {
            Job::Value(value) => {
                drop(value);
                pending.fetch_sub(1, Ordering::Release);
            }
            Job::Database {
                dict,
                expires,
                keys,
            } => {
                debug!(log, "reclaiming database"; "keys" => keys);
                drop(dict);
                drop(expires);
                pending.fetch_sub(keys, Ordering::Release);
            }
        }
    }
}
