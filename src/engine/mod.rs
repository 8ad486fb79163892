//! In-process compute engine.
//!
//! The evaluation context only ever talks to the engine through [`Session`] and
//! [`Dataset`]: distribute a local sequence, derive a new dataset with `map`,
//! then `cache`, `count` or `collect` it. This module provides a small
//! reference implementation of that capability backed by a rayon thread pool.
//! Datasets are lazy lineages, partitions are computed in parallel, and a
//! dataset is recomputed on every action unless it was marked as cached.
mod dataset;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rayon::ThreadPool;

use crate::config::SessionConfig;
use crate::error::EngineError;

pub use crate::engine::dataset::{Dataset, DatasetMetrics, Partitions};

/// A running engine session.
///
/// Cheap to clone, every clone refers to the same worker pool.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    pool: ThreadPool,
    partitions: usize,
    next_id: AtomicUsize,
    stopped: AtomicBool,
}

impl Session {
    /// Starts a session, building its worker pool.
    pub fn new(config: SessionConfig) -> Result<Self, EngineError> {
        let master = config.master()?;
        let partitions = config.partitions()?;
        let app = config.app_name.clone();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(master.threads())
            .thread_name(move |i| format!("{app}-worker-{i}"))
            .build()?;

        tracing::info!(
            app = %config.app_name,
            master = %config.master,
            partitions,
            "engine session started"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                pool,
                partitions,
                next_id: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Starts a session with the default single-threaded local config.
    pub fn local() -> Result<Self, EngineError> {
        Self::new(SessionConfig::default())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Splits `values` into partitions and wraps them in a dataset.
    ///
    /// Element order is preserved across partitions, so collecting the
    /// result yields `values` in their original order.
    pub fn parallelize<T>(&self, values: Vec<T>) -> Dataset<T>
    where
        T: Send + Sync + 'static,
    {
        let size = values.len().div_ceil(self.inner.partitions).max(1);
        let mut partitions = Vec::with_capacity(self.inner.partitions);
        let mut iter = values.into_iter().peekable();

        while iter.peek().is_some() {
            partitions.push(iter.by_ref().take(size).collect::<Vec<_>>());
        }

        let partitions: Partitions<T> = Arc::new(partitions);
        tracing::trace!(partitions = partitions.len(), "parallelized local sequence");

        Dataset::from_lineage(self.clone(), move || Ok(partitions.clone()))
    }

    /// Stops the session. Datasets created from it must not be used afterwards.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!(app = %self.inner.config.app_name, "engine session stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn next_id(&self) -> usize {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.inner.pool.install(op)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.inner.config)
            .field("partitions", &self.inner.partitions)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
