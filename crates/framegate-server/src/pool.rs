//! Round-robin worker pool.
//!
//! Dead workers stay in the list as lazy-respawn slots; the cursor skips
//! them, and the list is never compacted on the dispatch path. If every
//! worker is dead, dispatch revives one in place before using it, so a pool
//! only reports [`GateError::NoWorkers`] when it is empty or fully draining.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use framegate_common::{GateError, RequestPayload, ResponsePayload, Result};

use crate::sink::StreamSink;
use crate::worker::{Worker, WorkerConfig};

/// Worker counts as reported by [`WorkerPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub dead_workers: usize,
}

struct PoolInner {
    workers: Vec<Arc<Worker>>,
    next: usize,
}

/// A fixed-size (but rescalable) set of workers with round-robin selection.
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    /// Spawns `count` workers, each configured identically.
    pub fn new(count: usize, config: WorkerConfig) -> Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            workers.push(Arc::new(Worker::spawn(config.clone())?));
        }
        Ok(Self::from_workers(workers))
    }

    pub(crate) fn from_workers(workers: Vec<Arc<Worker>>) -> Self {
        Self {
            inner: Mutex::new(PoolInner { workers, next: 0 }),
        }
    }

    /// The next live worker by round-robin, skipping dead and draining
    /// slots. Examines at most one full cycle of the list.
    ///
    /// The pool lock is released before the worker is used.
    pub fn next_worker(&self) -> Option<Arc<Worker>> {
        let mut inner = self.inner.lock();
        let n = inner.workers.len();
        if n == 0 {
            return None;
        }

        for _ in 0..n {
            let idx = inner.next;
            inner.next = (inner.next + 1) % n;
            let worker = &inner.workers[idx];
            if !worker.is_dead() && !worker.is_draining() {
                return Some(Arc::clone(worker));
            }
        }
        None
    }

    /// A dead slot eligible for lazy revival. Draining workers are not
    /// candidates until their drain completes.
    fn next_dead_slot(&self) -> Option<Arc<Worker>> {
        let inner = self.inner.lock();
        inner.workers.iter().find(|w| w.is_dead()).map(Arc::clone)
    }

    async fn select(&self) -> Result<Arc<Worker>> {
        if let Some(worker) = self.next_worker() {
            return Ok(worker);
        }
        let worker = self.next_dead_slot().ok_or(GateError::NoWorkers)?;
        worker.revive().await?;
        Ok(worker)
    }

    /// Sends a unary request to the next available worker.
    pub async fn dispatch(&self, payload: &RequestPayload) -> Result<ResponsePayload> {
        self.select().await?.handle(payload).await
    }

    /// Streams a request through the next available worker into `sink`.
    pub async fn dispatch_stream(
        &self,
        payload: &RequestPayload,
        sink: &mut dyn StreamSink,
    ) -> Result<()> {
        self.select().await?.stream(payload, sink).await
    }

    /// Closes admission on every live worker. Each becomes dead once its
    /// in-flight work completes and respawns on next use.
    pub fn drain_all(&self) {
        let inner = self.inner.lock();
        for worker in &inner.workers {
            if !worker.is_dead() {
                worker.start_draining();
            }
        }
    }

    /// Marks every worker dead so it is recycled on next use. Driven by
    /// external code-change watchers.
    pub fn mark_all_dead(&self) {
        let inner = self.inner.lock();
        for worker in &inner.workers {
            worker.mark_dead();
        }
    }

    /// Grows or shrinks the pool to `new_size`.
    ///
    /// Shrinking marks the workers past the new length as draining and
    /// truncates the list; growing appends workers produced by `factory`.
    /// A factory error aborts the grow, keeping the workers appended so far.
    pub fn scale_to<F>(&self, new_size: usize, mut factory: F) -> Result<()>
    where
        F: FnMut() -> Result<Worker>,
    {
        let mut inner = self.inner.lock();
        let current = inner.workers.len();

        if new_size == current {
            return Ok(());
        }

        if new_size < current {
            for worker in &inner.workers[new_size..] {
                worker.start_draining();
            }
            inner.workers.truncate(new_size);
            if inner.next >= new_size {
                inner.next = 0;
            }
            return Ok(());
        }

        for _ in current..new_size {
            let worker = factory()?;
            inner.workers.push(Arc::new(worker));
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            workers: inner.workers.len(),
            dead_workers: inner.workers.iter().filter(|w| w.is_dead()).count(),
        }
    }
}
