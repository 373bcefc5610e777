//! Fast/slow multi-pool front.
//!
//! Incoming requests are classified by an injected predicate and routed to
//! one of two independent pools. There is no cross-pool fallback: a slow
//! request waits on the slow pool even when the fast pool is idle.

use serde::Serialize;

use framegate_common::{RequestPayload, ResponsePayload, Result};

use crate::pool::{PoolStats, WorkerPool};
use crate::sink::StreamSink;
use crate::worker::WorkerConfig;

/// Request classifier: `true` routes to the slow pool.
pub type Classifier = dyn Fn(&RequestPayload) -> bool + Send + Sync;

/// Worker counts for both pools, as served by the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub fast: PoolStats,
    pub slow: PoolStats,
}

/// The default slow-request heuristics: explicit slow routes (reports,
/// analytics), big uploads, and the typically heavier PUT/DELETE verbs.
pub fn is_slow_request(payload: &RequestPayload) -> bool {
    if payload.path.starts_with("/reports/") {
        return true;
    }
    if payload.path.starts_with("/admin/analytics") {
        return true;
    }
    if payload.body.len() > 2_000_000 {
        return true;
    }
    payload.method == "PUT" || payload.method == "DELETE"
}

/// Routes requests to a fast or a slow worker pool.
pub struct Dispatcher {
    fast_pool: WorkerPool,
    slow_pool: WorkerPool,
    classifier: Box<Classifier>,
}

impl Dispatcher {
    /// Spawns `fast_count` + `slow_count` workers and installs the default
    /// classifier.
    pub fn new(fast_count: usize, slow_count: usize, config: WorkerConfig) -> Result<Self> {
        Ok(Self::from_pools(
            WorkerPool::new(fast_count, config.clone())?,
            WorkerPool::new(slow_count, config)?,
        ))
    }

    pub(crate) fn from_pools(fast_pool: WorkerPool, slow_pool: WorkerPool) -> Self {
        Self {
            fast_pool,
            slow_pool,
            classifier: Box::new(is_slow_request),
        }
    }

    /// Replaces the slow-request classifier. Tests use this to drive routing
    /// deterministically.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&RequestPayload) -> bool + Send + Sync + 'static,
    {
        self.classifier = Box::new(classifier);
        self
    }

    fn pool_for(&self, payload: &RequestPayload) -> &WorkerPool {
        if (self.classifier)(payload) {
            &self.slow_pool
        } else {
            &self.fast_pool
        }
    }

    /// Classifies and dispatches a unary request.
    pub async fn dispatch(&self, payload: &RequestPayload) -> Result<ResponsePayload> {
        self.pool_for(payload).dispatch(payload).await
    }

    /// Classifies and dispatches a streaming request into `sink`.
    pub async fn dispatch_stream(
        &self,
        payload: &RequestPayload,
        sink: &mut dyn StreamSink,
    ) -> Result<()> {
        self.pool_for(payload).dispatch_stream(payload, sink).await
    }

    /// Marks every worker in both pools dead so they respawn lazily.
    /// External file-change watchers call this to pick up new code.
    pub fn mark_all_workers_dead(&self) {
        self.fast_pool.mark_all_dead();
        self.slow_pool.mark_all_dead();
    }

    /// Closes admission on both pools; in-flight work finishes first.
    pub fn drain_all(&self) {
        self.fast_pool.drain_all();
        self.slow_pool.drain_all();
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            fast: self.fast_pool.stats(),
            slow: self.slow_pool.stats(),
        }
    }

    pub fn fast_pool(&self) -> &WorkerPool {
        &self.fast_pool
    }

    pub fn slow_pool(&self) -> &WorkerPool {
        &self.slow_pool
    }
}
