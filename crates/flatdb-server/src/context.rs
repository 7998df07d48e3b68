//! `ExecutionContext` — one OS thread, one FIFO job queue.
//!
//! A context owns the backends of every partition assigned to it. Jobs
//! run one at a time in submission order, so a backend is never
//! touched by two threads and sees its calls in the order they were
//! submitted. Different contexts run in parallel.
//!
//! Backend futures are driven to completion on the context thread with
//! `block_on`; a backend that wants to overlap its own I/O does so
//! behind its future.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tracing::{debug, error};

use flatdb_core::{Backend, PartitionId};

/// Backends owned by one context, keyed by partition.
#[derive(Default)]
pub struct BackendSet {
    backends: HashMap<PartitionId, Box<dyn Backend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition: PartitionId, backend: Box<dyn Backend>) {
        self.backends.insert(partition, backend);
    }

    pub fn get_mut(&mut self, partition: PartitionId) -> Option<&mut Box<dyn Backend>> {
        self.backends.get_mut(&partition)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

pub type Job = Box<dyn FnOnce(&mut BackendSet) + Send>;

struct ContextInner {
    jobs: SegQueue<Job>,
    shutdown: AtomicBool,
    executed: AtomicU64,
}

pub struct ExecutionContext {
    id: usize,
    inner: Arc<ContextInner>,
    thread: Thread,
    handle: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    /// Spawn the context thread, moving `backends` onto it.
    pub fn spawn(id: usize, backends: BackendSet) -> io::Result<Self> {
        let inner = Arc::new(ContextInner {
            jobs: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            executed: AtomicU64::new(0),
        });
        let loop_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("flatdb-ctx-{}", id))
            .spawn(move || context_loop(loop_inner, backends, id))?;
        Ok(Self {
            id,
            thread: handle.thread().clone(),
            inner,
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue `job` behind everything already submitted.
    ///
    /// On a closed context the job is dropped unrun and `false` is
    /// returned; anything it captured is dropped with it.
    pub fn submit(&self, job: Job) -> bool {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.inner.jobs.push(job);
        self.thread.unpark();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Jobs run so far.
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Refuse new jobs, finish queued ones, and join the thread.
    /// Backends are dropped on the context thread.
    pub fn shutdown(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.thread.unpark();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(context = self.id, "execution context thread panicked");
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn context_loop(inner: Arc<ContextInner>, mut backends: BackendSet, id: usize) {
    debug!(context = id, partitions = backends.len(), "execution context started");
    loop {
        match inner.jobs.pop() {
            Some(job) => {
                // A panicking job drops its captures during unwind, which
                // resolves any waiter as abandoned.
                if panic::catch_unwind(AssertUnwindSafe(|| job(&mut backends))).is_err() {
                    error!(context = id, "job panicked");
                }
                inner.executed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    // Drain anything pushed between the pop and the flag.
                    if inner.jobs.is_empty() {
                        break;
                    }
                    continue;
                }
                thread::park_timeout(Duration::from_millis(50));
            }
        }
    }
    debug!(context = id, "execution context stopped");
}
