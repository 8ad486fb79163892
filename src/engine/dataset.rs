use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::engine::Session;
use crate::error::EngineError;

/// The computed partitions of a dataset, shared between readers.
pub type Partitions<T> = Arc<Vec<Vec<T>>>;

type Lineage<T> = Box<dyn Fn() -> Result<Partitions<T>, EngineError> + Send + Sync>;

/// Counters for the actions invoked on a single dataset.
#[derive(Debug, Default)]
pub struct DatasetMetrics {
    cache_calls: AtomicUsize,
    count_calls: AtomicUsize,
    collect_calls: AtomicUsize,
    computations: AtomicUsize,
}

impl DatasetMetrics {
    /// How many times [`Dataset::cache`] was called.
    pub fn cache_calls(&self) -> usize {
        self.cache_calls.load(Ordering::Relaxed)
    }

    /// How many times [`Dataset::count`] was called.
    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::Relaxed)
    }

    /// How many times [`Dataset::collect`] was called.
    pub fn collect_calls(&self) -> usize {
        self.collect_calls.load(Ordering::Relaxed)
    }

    /// How many times the lineage of this dataset actually ran.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}

/// A lazily computed, partitioned collection of `T`.
///
/// Cloning a `Dataset` clones the handle, not the data: both clones refer to
/// the same lineage, name, cache flag and metrics.
pub struct Dataset<T> {
    inner: Arc<DatasetInner<T>>,
}

struct DatasetInner<T> {
    id: usize,
    session: Session,
    name: OnceLock<String>,
    cached: AtomicBool,
    memo: Mutex<Option<Partitions<T>>>,
    lineage: Lineage<T>,
    metrics: DatasetMetrics,
}

impl<T> Clone for Dataset<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Dataset<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn from_lineage<F>(session: Session, lineage: F) -> Self
    where
        F: Fn() -> Result<Partitions<T>, EngineError> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DatasetInner {
                id: session.next_id(),
                session,
                name: OnceLock::new(),
                cached: AtomicBool::new(false),
                memo: Mutex::new(None),
                lineage: Box::new(lineage),
                metrics: DatasetMetrics::default(),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.get().map(String::as_str)
    }

    /// Names the dataset. A name can only be assigned once.
    pub fn set_name(&self, name: impl Into<String>) -> Result<(), EngineError> {
        self.inner
            .name
            .set(name.into())
            .map_err(|_| EngineError::NameImmutable {
                id: self.inner.id,
                name: self.name().unwrap_or_default().to_string(),
            })
    }

    /// Marks the dataset for caching: the next computation is kept in memory
    /// and reused by every later action.
    pub fn cache(&self) {
        self.inner.metrics.cache_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.cached.store(true, Ordering::SeqCst);
    }

    pub fn is_cached(&self) -> bool {
        self.inner.cached.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &DatasetMetrics {
        &self.inner.metrics
    }

    /// Whether both handles refer to the same dataset.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Computes the partitions, or returns the cached ones.
    pub fn partitions(&self) -> Result<Partitions<T>, EngineError> {
        if !self.is_cached() {
            return self.compute();
        }

        let mut memo = self
            .inner
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(partitions) = memo.as_ref() {
            return Ok(partitions.clone());
        }

        let partitions = self.compute()?;
        *memo = Some(partitions.clone());
        Ok(partitions)
    }

    fn compute(&self) -> Result<Partitions<T>, EngineError> {
        self.inner.metrics.computations.fetch_add(1, Ordering::Relaxed);
        (self.inner.lineage)()
    }

    /// Derives a dataset by applying `f` to every element.
    pub fn map<U, F>(&self, f: F) -> Dataset<U>
    where
        U: Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.try_map(move |item| Ok::<_, EngineError>(f(item)))
    }

    /// Derives a dataset by applying a fallible `f` to every element. The
    /// first failure aborts the computation of the derived dataset.
    pub fn try_map<U, E, F>(&self, f: F) -> Dataset<U>
    where
        U: Send + Sync + 'static,
        E: Into<EngineError>,
        F: Fn(&T) -> Result<U, E> + Send + Sync + 'static,
    {
        let parent = self.clone();
        let session = self.inner.session.clone();

        Dataset::from_lineage(session.clone(), move || {
            let input = parent.partitions()?;

            let output = session.install(|| {
                input
                    .par_iter()
                    .map(|partition| {
                        partition
                            .iter()
                            .map(|item| f(item).map_err(Into::into))
                            .collect::<Result<Vec<U>, EngineError>>()
                    })
                    .collect::<Result<Vec<_>, EngineError>>()
            })?;

            Ok(Arc::new(output))
        })
    }

    /// Forces evaluation and returns the number of elements.
    pub fn count(&self) -> Result<usize, EngineError> {
        self.inner.metrics.count_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.partitions()?.iter().map(Vec::len).sum())
    }

    /// Forces evaluation and brings every element to the caller, in
    /// partition order.
    pub fn collect(&self) -> Result<Vec<T>, EngineError>
    where
        T: Clone,
    {
        self.inner.metrics.collect_calls.fetch_add(1, Ordering::Relaxed);
        let partitions = self.partitions()?;
        Ok(partitions.iter().flatten().cloned().collect())
    }
}

impl<T> std::fmt::Debug for Dataset<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name.get())
            .field("cached", &self.inner.cached.load(Ordering::Relaxed))
            .finish()
    }
}
