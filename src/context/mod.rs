//! Per-run evaluation state.
//!
//! The [`EvaluationContext`] sits between the logical [`Pipeline`] and the
//! compute [`Session`]. It maps every collection handle to a deferred cell,
//! tracks which cells nobody has read yet (leaves) and which were read more
//! than once, and answers result queries once the run is over.

mod cell;

use std::any::type_name;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::codec::SharedCodec;
use crate::core::{Dynamic, PipelineState};
use crate::engine::{Dataset, Session};
use crate::error::{EvaluationError, ResolutionError};
use crate::graph::{PCollection, PCollectionView, Pipeline, TransformId, ValueId};
use crate::runtime::{Aggregator, AggregatorValues, RuntimeContext};
use crate::utils::progress_style;

use self::cell::{DeferredCell, ErasedCell};
pub use self::cell::LocalValues;

type Cells = HashMap<ValueId, Box<dyn ErasedCell>>;

/// Everything a pipeline run knows about its collections.
pub struct EvaluationContext {
    session: Session,
    pub(crate) pipeline: Arc<Pipeline>,
    runtime: Arc<RuntimeContext>,
    collections: Cells,
    /// Collections registered but never read by a downstream transform.
    leaves: BTreeSet<ValueId>,
    /// Collections read at least once.
    multireads: HashSet<ValueId>,
    resolved: HashMap<ValueId, Dynamic>,
    views: HashMap<ValueId, Dynamic>,
    current: Option<TransformId>,
}

impl EvaluationContext {
    pub fn new(session: Session, pipeline: Arc<Pipeline>) -> Self {
        let runtime = Arc::new(RuntimeContext::new(session.clone()));
        Self::with_runtime(session, pipeline, runtime)
    }

    /// Creates a context sharing an existing runtime, e.g. one with
    /// aggregators registered up front.
    pub fn with_runtime(
        session: Session,
        pipeline: Arc<Pipeline>,
        runtime: Arc<RuntimeContext>,
    ) -> Self {
        Self {
            session,
            pipeline,
            runtime,
            collections: HashMap::new(),
            leaves: BTreeSet::new(),
            multireads: HashSet::new(),
            resolved: HashMap::new(),
            views: HashMap::new(),
            current: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn set_current_transform(&mut self, transform: TransformId) {
        self.current = Some(transform);
    }

    pub fn clear_current_transform(&mut self) {
        self.current = None;
    }

    pub fn current_transform(&self) -> Option<TransformId> {
        self.current
    }

    /// Makes `transform` current until the returned guard is dropped.
    pub fn step(&mut self, transform: TransformId) -> Step<'_> {
        self.set_current_transform(transform);
        Step {
            ctx: self,
            transform,
        }
    }

    fn transform_name(&self, transform: TransformId) -> &str {
        self.pipeline
            .transform(transform)
            .map(|applied| applied.name())
            .unwrap_or("?")
    }

    fn check_current(&self, transform: TransformId) -> Result<(), EvaluationError> {
        if self.current == Some(transform) {
            return Ok(());
        }

        Err(EvaluationError::InvalidState {
            requested: self.transform_name(transform).to_string(),
            current: match self.current {
                Some(current) => format!("'{}'", self.transform_name(current)),
                None => "none".to_string(),
            },
        })
    }

    /// Declared inputs of the current transform.
    pub fn get_inputs(&self, transform: TransformId) -> Result<&[ValueId], EvaluationError> {
        self.check_current(transform)?;
        Ok(self
            .pipeline
            .transform(transform)
            .map(|applied| applied.inputs())
            .unwrap_or_default())
    }

    /// Declared outputs of the current transform.
    pub fn get_outputs(&self, transform: TransformId) -> Result<&[ValueId], EvaluationError> {
        self.check_current(transform)?;
        Ok(self
            .pipeline
            .transform(transform)
            .map(|applied| applied.outputs())
            .unwrap_or_default())
    }

    /// The single input of the current transform.
    pub fn get_input(&self, transform: TransformId) -> Result<ValueId, EvaluationError> {
        let inputs = self.get_inputs(transform)?;
        self.only(transform, "input", inputs)
    }

    /// The single output of the current transform.
    pub fn get_output(&self, transform: TransformId) -> Result<ValueId, EvaluationError> {
        let outputs = self.get_outputs(transform)?;
        self.only(transform, "output", outputs)
    }

    fn only(
        &self,
        transform: TransformId,
        role: &'static str,
        ids: &[ValueId],
    ) -> Result<ValueId, EvaluationError> {
        match ids {
            [id] => Ok(*id),
            _ => Err(EvaluationError::Arity {
                name: self.transform_name(transform).to_string(),
                role,
                count: ids.len(),
            }),
        }
    }

    /// Reads the dataset behind the current transform's single input.
    pub fn get_input_rdd<T>(&mut self, transform: TransformId) -> Result<Dataset<T>, EvaluationError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let input = self.get_input(transform)?;
        let handle = self.pipeline.collection_handle::<T>(input)?;
        self.get_rdd(handle)
    }

    /// Registers `dataset` as the current transform's single output.
    pub fn set_output_rdd<T>(
        &mut self,
        transform: TransformId,
        dataset: Dataset<T>,
    ) -> Result<(), EvaluationError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let output = self.get_output(transform)?;
        let handle = self.pipeline.collection_handle::<T>(output)?;
        self.set_rdd(handle, dataset);
        Ok(())
    }

    /// Registers local values as the current transform's single output. The
    /// values are only distributed if a downstream transform reads them as a
    /// dataset.
    pub fn set_output_from_values<T>(
        &mut self,
        transform: TransformId,
        values: Vec<T>,
        codec: SharedCodec<T>,
    ) -> Result<(), EvaluationError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let output = self.get_output(transform)?;
        let handle = self.pipeline.collection_handle::<T>(output)?;

        tracing::trace!(
            collection = self.pipeline.name_of(output),
            count = values.len(),
            "registered local values"
        );

        self.collections
            .insert(handle.id(), Box::new(DeferredCell::from_values(values, codec)));
        self.leaves.insert(handle.id());
        Ok(())
    }

    /// Registers `dataset` under `handle` and marks it as a leaf.
    pub fn set_rdd<T>(&mut self, handle: PCollection<T>, dataset: Dataset<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let name = self.pipeline.name_of(handle.id());

        if let Err(err) = dataset.set_name(name) {
            tracing::trace!(collection = name, "dataset keeps its name: {err}");
        }

        self.collections
            .insert(handle.id(), Box::new(DeferredCell::from_dataset(dataset)));
        self.leaves.insert(handle.id());
    }

    /// Reads the dataset behind `handle`, distributing local values if
    /// needed.
    ///
    /// A read makes the collection a non-leaf. Reading the same collection a
    /// second time marks its dataset for caching.
    pub fn get_rdd<T>(&mut self, handle: PCollection<T>) -> Result<Dataset<T>, EvaluationError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = handle.id();
        let dataset = cell_mut::<T>(&mut self.collections, &self.pipeline, id)?.materialize(&self.session)?;

        self.leaves.remove(&id);

        if !self.multireads.insert(id) {
            tracing::trace!(collection = self.pipeline.name_of(id), "read again, caching");
            dataset.cache();
        }

        Ok(dataset)
    }

    /// Resolves a collection expected to hold exactly one element.
    ///
    /// The element is collected once and remembered; later calls return the
    /// remembered value.
    pub fn get<T>(&mut self, handle: PCollection<T>) -> Result<T, EvaluationError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = handle.id();

        if let Some(value) = self.resolved.get(&id) {
            return downcast_value(&self.pipeline, id, value);
        }

        let cell = cell_mut::<T>(&mut self.collections, &self.pipeline, id)?;
        let mut values = cell.materialize(&self.session)?.collect()?;

        let value = match values.len() {
            1 => values.remove(0),
            count => {
                return Err(ResolutionError::NotSingleton {
                    name: self.pipeline.name_of(id).to_string(),
                    count,
                }
                .into());
            }
        };

        self.resolved.insert(id, Arc::new(value.clone()));
        Ok(value)
    }

    /// All values of a collection, decoded with its currently declared codec.
    pub fn get_values<T>(&mut self, handle: PCollection<T>) -> Result<LocalValues<T>, EvaluationError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = handle.id();
        let codec = self
            .pipeline
            .codec(handle)
            .ok_or_else(|| ResolutionError::Unknown(self.pipeline.name_of(id).to_string()))?;

        let cell = cell_mut::<T>(&mut self.collections, &self.pipeline, id)?;
        Ok(cell.local_values(codec)?)
    }

    /// Stores the contents of a view.
    pub fn set_view<T>(&mut self, view: PCollectionView<T>, values: Vec<T>)
    where
        T: Send + Sync + 'static,
    {
        let values: Arc<[T]> = values.into();
        self.views.insert(view.id(), Arc::new(values));
    }

    /// The contents of a view, if they were stored.
    pub fn get_view<T>(&self, view: PCollectionView<T>) -> Option<Arc<[T]>>
    where
        T: Send + Sync + 'static,
    {
        self.views
            .get(&view.id())?
            .downcast_ref::<Arc<[T]>>()
            .cloned()
    }

    pub fn get_aggregator_value<T: 'static>(&self, name: &str) -> Result<T, EvaluationError> {
        Ok(self.runtime.get_aggregator_value(name)?)
    }

    pub fn get_aggregator_values<I, O>(
        &self,
        aggregator: &Aggregator<I, O>,
    ) -> Result<AggregatorValues<O>, EvaluationError> {
        Ok(self.runtime.get_aggregator_values(aggregator)?)
    }

    /// Whether a collection is registered and was never read as a dataset.
    pub fn is_leaf(&self, id: impl Into<ValueId>) -> bool {
        self.leaves.contains(&id.into())
    }

    /// Forces every leaf: the dataset is cached, so later reads are cheap, and
    /// then counted. Each leaf is forced once, even across repeated calls.
    pub fn compute_outputs(&mut self) -> Result<(), EvaluationError> {
        let leaves: Vec<ValueId> = self.leaves.iter().copied().collect();

        let span = tracing::info_span!("compute_outputs", leaves = leaves.len());
        span.pb_set_style(&progress_style());
        span.pb_set_length(leaves.len() as u64);
        span.pb_set_message("Forcing leaves");
        let _enter = span.enter();

        for id in leaves {
            let name = self.pipeline.name_of(id);
            if let Some(cell) = self.collections.get_mut(&id) {
                let count = cell.force(&self.session)?;
                tracing::debug!(collection = name, count, "forced leaf");
            }

            self.leaves.remove(&id);
            span.pb_inc(1);
        }

        Ok(())
    }

    /// Stops the engine session.
    pub fn close(self) {
        tracing::info!(app = self.runtime.app_name(), "closing session");
        self.session.stop();
    }

    /// Evaluation is blocking, so a context handed back is always done.
    pub fn state(&self) -> PipelineState {
        PipelineState::Done
    }
}

impl std::fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("session", &self.session)
            .field("collections", &self.collections.len())
            .field("leaves", &self.leaves)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

fn cell_mut<'a, T>(
    collections: &'a mut Cells,
    pipeline: &Pipeline,
    id: ValueId,
) -> Result<&'a mut DeferredCell<T>, EvaluationError>
where
    T: Clone + Send + Sync + 'static,
{
    let cell = collections
        .get_mut(&id)
        .ok_or_else(|| ResolutionError::Unknown(pipeline.name_of(id).to_string()))?;

    let found = cell.element_type();
    cell.as_any_mut()
        .downcast_mut::<DeferredCell<T>>()
        .ok_or_else(|| EvaluationError::TypeMismatch {
            name: pipeline.name_of(id).to_string(),
            expected: type_name::<T>(),
            found,
        })
}

fn downcast_value<T>(pipeline: &Pipeline, id: ValueId, value: &Dynamic) -> Result<T, EvaluationError>
where
    T: Clone + 'static,
{
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| EvaluationError::TypeMismatch {
            name: pipeline.name_of(id).to_string(),
            expected: type_name::<T>(),
            found: "resolved value",
        })
}

/// Marks a transform as current for as long as it lives.
///
/// Derefs to the [`EvaluationContext`], so evaluators receive it wherever a
/// context is expected.
pub struct Step<'a> {
    ctx: &'a mut EvaluationContext,
    transform: TransformId,
}

impl Step<'_> {
    pub fn transform(&self) -> TransformId {
        self.transform
    }
}

impl Deref for Step<'_> {
    type Target = EvaluationContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for Step<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for Step<'_> {
    fn drop(&mut self) {
        self.ctx.clear_current_transform();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CborCodec, JsonCodec};
    use crate::error::AggregatorError;
    use crate::runtime::Sum;

    fn noop(_: TransformId, _: &mut EvaluationContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn cbor<T>() -> SharedCodec<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + 'static,
    {
        Arc::new(CborCodec::new())
    }

    struct Fixture {
        pipeline: Pipeline,
        a: PCollection<i64>,
        b: PCollection<i64>,
        t1: TransformId,
        t2: TransformId,
    }

    fn fixture() -> Fixture {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection("a", CborCodec::new());
        let b = pipeline.collection("b", CborCodec::new());
        let t1 = pipeline.apply_fn("t1", [], [a.id()], noop).unwrap();
        let t2 = pipeline.apply_fn("t2", [a.id()], [b.id()], noop).unwrap();

        Fixture { pipeline, a, b, t1, t2 }
    }

    fn context(pipeline: Pipeline) -> EvaluationContext {
        EvaluationContext::new(Session::local().unwrap(), Arc::new(pipeline))
    }

    #[test]
    fn test_io_requires_current_transform() {
        let Fixture { pipeline, t1, t2, .. } = fixture();
        let mut ctx = context(pipeline);

        let err = ctx.get_output(t1).unwrap_err();
        assert!(matches!(&err, EvaluationError::InvalidState { current, .. } if current == "none"));

        ctx.set_current_transform(t1);
        assert!(ctx.get_output(t1).is_ok());

        let err = ctx.get_input(t2).unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::InvalidState { requested, current } if requested == "t2" && current == "'t1'"
        ));
    }

    #[test]
    fn test_step_guard_clears() {
        let Fixture { pipeline, a, t2, .. } = fixture();
        let mut ctx = context(pipeline);

        {
            let step = ctx.step(t2);
            assert_eq!(step.transform(), t2);
            assert_eq!(step.get_input(t2).unwrap(), a.id());
        }

        assert_eq!(ctx.current_transform(), None);
        assert!(ctx.get_input(t2).is_err());
    }

    #[test]
    fn test_arity() {
        let Fixture { pipeline, t1, .. } = fixture();
        let mut ctx = context(pipeline);
        let step = ctx.step(t1);

        let err = step.get_input(t1).unwrap_err();
        assert!(matches!(err, EvaluationError::Arity { role: "input", count: 0, .. }));
        assert!(step.get_inputs(t1).unwrap().is_empty());
    }

    #[test]
    fn test_values_round_trip() {
        let Fixture { pipeline, a, t1, .. } = fixture();
        let mut ctx = context(pipeline);

        ctx.step(t1)
            .set_output_from_values(t1, vec![1i64, 2, 3], cbor())
            .unwrap();

        assert!(ctx.is_leaf(a));
        assert_eq!(ctx.get_values(a).unwrap().to_vec().unwrap(), vec![1, 2, 3]);
        assert_eq!(ctx.get_rdd(a).unwrap().collect().unwrap(), vec![1, 2, 3]);
        assert!(!ctx.is_leaf(a));
    }

    #[test]
    fn test_values_leaf_is_forced() {
        let Fixture { pipeline, a, t1, .. } = fixture();
        let mut ctx = context(pipeline);

        ctx.step(t1)
            .set_output_from_values(t1, vec![1i64, 2, 3], cbor())
            .unwrap();
        ctx.compute_outputs().unwrap();
        assert!(!ctx.is_leaf(a));

        // materialized by the force, so reading returns that same dataset
        let dataset = ctx.get_rdd(a).unwrap();
        assert!(dataset.is_cached());
        assert_eq!(dataset.metrics().count_calls(), 1);
        assert_eq!(dataset.metrics().cache_calls(), 1);
    }

    #[test]
    fn test_failed_force_keeps_remaining_leaves() {
        let mut pipeline = Pipeline::new();
        let first = pipeline.collection::<i64, _>("first", CborCodec::new());
        let broken = pipeline.collection::<i64, _>("broken", CborCodec::new());
        let last = pipeline.collection::<i64, _>("last", CborCodec::new());
        let mut ctx = context(pipeline);

        let failing = ctx.session().parallelize(vec![1i64]).try_map(|_| {
            Err::<i64, _>(crate::error::CodecError::Decode {
                codec: "test",
                reason: "broken".into(),
            })
        });
        ctx.set_rdd(first, ctx.session().parallelize(vec![1i64]));
        ctx.set_rdd(broken, failing);
        ctx.set_rdd(last, ctx.session().parallelize(vec![3i64]));

        assert!(ctx.compute_outputs().is_err());
        assert!(!ctx.is_leaf(first));
        assert!(ctx.is_leaf(broken));
        assert!(ctx.is_leaf(last));
    }

    #[test]
    fn test_second_read_caches() {
        let Fixture { pipeline, a, .. } = fixture();
        let mut ctx = context(pipeline);
        let dataset = ctx.session().parallelize(vec![1i64, 2]);
        ctx.set_rdd(a, dataset.clone());

        let first = ctx.get_rdd(a).unwrap();
        assert!(first.ptr_eq(&dataset));
        assert_eq!(dataset.metrics().cache_calls(), 0);

        ctx.get_rdd(a).unwrap();
        ctx.get_rdd(a).unwrap();
        assert!(dataset.is_cached());
        assert_eq!(dataset.metrics().cache_calls(), 2);
    }

    #[test]
    fn test_set_rdd_names_once() {
        let Fixture { pipeline, a, b, .. } = fixture();
        let mut ctx = context(pipeline);
        let dataset = ctx.session().parallelize(vec![0i64]);

        ctx.set_rdd(a, dataset.clone());
        ctx.set_rdd(b, dataset.clone());

        assert_eq!(dataset.name(), Some("a"));
        assert!(ctx.is_leaf(a) && ctx.is_leaf(b));
    }

    #[test]
    fn test_get_singleton() {
        let mut pipeline = Pipeline::new();
        let status = pipeline.collection::<String, _>("status", CborCodec::new());
        let mut ctx = context(pipeline);
        let dataset = ctx.session().parallelize(vec!["done".to_string()]);
        ctx.set_rdd(status, dataset.clone());

        assert_eq!(ctx.get(status).unwrap(), "done");
        assert_eq!(ctx.get(status).unwrap(), "done");
        assert_eq!(dataset.metrics().collect_calls(), 1);
    }

    #[test]
    fn test_get_not_singleton() {
        let Fixture { pipeline, a, b, .. } = fixture();
        let mut ctx = context(pipeline);
        let empty = ctx.session().parallelize(Vec::<i64>::new());
        let pair = ctx.session().parallelize(vec![1i64, 2]);
        ctx.set_rdd(a, empty);
        ctx.set_rdd(b, pair);

        assert!(matches!(
            ctx.get(a),
            Err(EvaluationError::Resolution(ResolutionError::NotSingleton { count: 0, .. }))
        ));
        assert!(matches!(
            ctx.get(b),
            Err(EvaluationError::Resolution(ResolutionError::NotSingleton { count: 2, .. }))
        ));
    }

    #[test]
    fn test_get_unknown() {
        let Fixture { pipeline, a, .. } = fixture();
        let mut ctx = context(pipeline);

        let err = ctx.get(a).unwrap_err();
        assert!(matches!(err, EvaluationError::Resolution(ResolutionError::Unknown(name)) if name == "a"));
    }

    #[test]
    fn test_get_values_follows_declared_codec() {
        let mut pipeline = Pipeline::new();
        let words = pipeline.collection::<String, _>("words", CborCodec::new());
        pipeline.set_codec(words, JsonCodec::new());
        let mut ctx = context(pipeline);

        let dataset = ctx.session().parallelize(vec!["x".to_string(), "y".to_string()]);
        ctx.set_rdd(words, dataset);

        let values = ctx.get_values(words).unwrap();
        assert!(values.is_encoded());
        assert_eq!(values.to_vec().unwrap(), vec!["x", "y"]);
    }

    #[test]
    fn test_compute_outputs_forces_leaves_once() {
        let Fixture { pipeline, a, b, .. } = fixture();
        let mut ctx = context(pipeline);
        let read = ctx.session().parallelize(vec![1i64]);
        let leaf = read.map(|x| x + 1);
        ctx.set_rdd(a, read.clone());
        ctx.set_rdd(b, leaf.clone());
        ctx.get_rdd(a).unwrap();

        ctx.compute_outputs().unwrap();
        ctx.compute_outputs().unwrap();

        assert_eq!(leaf.metrics().count_calls(), 1);
        assert!(leaf.is_cached());
        assert_eq!(read.metrics().count_calls(), 0);
    }

    #[test]
    fn test_views() {
        let mut pipeline = Pipeline::new();
        let view = pipeline.view::<u8>("lookup");
        let mut ctx = context(pipeline);

        assert!(ctx.get_view(view).is_none());
        ctx.set_view(view, vec![1, 2]);
        assert_eq!(ctx.get_view(view).unwrap().as_ref(), &[1, 2]);
    }

    #[test]
    fn test_aggregators_and_state() {
        let ctx = context(Pipeline::new());
        let total: Aggregator<i64, i64> = ctx.runtime().create_aggregator("s", "total", Sum).unwrap();
        total.add(5);

        assert_eq!(ctx.get_aggregator_value::<i64>("total").unwrap(), 5);
        assert!(matches!(
            ctx.get_aggregator_value::<i64>("nope"),
            Err(EvaluationError::Aggregator(AggregatorError::NotFound(_)))
        ));
        assert_eq!(ctx.state(), PipelineState::Done);

        let session = ctx.session().clone();
        ctx.close();
        assert!(session.is_stopped());
    }
}
