//! A handful of ready-made transforms.
//!
//! Each transform is a plain [`TransformEvaluator`] plus a method on
//! [`Pipeline`] that declares its output and applies it.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;

use crate::codec::Codec;
use crate::context::EvaluationContext;
use crate::error::PipelineError;
use crate::graph::{PCollection, PCollectionView, Pipeline, TransformEvaluator, TransformId};

/// Introduces local values as a collection.
///
/// The values stay in the local process until a downstream transform reads
/// the collection as a dataset.
pub struct Create<T> {
    values: Vec<T>,
}

impl<T> Create<T> {
    pub fn new(values: Vec<T>) -> Self {
        Self { values }
    }
}

impl<T> TransformEvaluator for Create<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn evaluate(&self, transform: TransformId, ctx: &mut EvaluationContext) -> anyhow::Result<()> {
        let output = ctx.get_output(transform)?;
        let handle = ctx.pipeline().collection_handle::<T>(output)?;
        let codec = ctx
            .pipeline()
            .codec(handle)
            .with_context(|| format!("no codec declared for '{}'", ctx.pipeline().name_of(output)))?;

        ctx.set_output_from_values(transform, self.values.clone(), codec)?;
        Ok(())
    }
}

/// Applies a function to every element of a collection.
pub struct Map<T, U, F> {
    f: Arc<F>,
    _phantom: PhantomData<fn(&T) -> U>,
}

impl<T, U, F> Map<T, U, F> {
    pub fn new(f: F) -> Self {
        Self {
            f: Arc::new(f),
            _phantom: PhantomData,
        }
    }
}

impl<T, U, F> TransformEvaluator for Map<T, U, F>
where
    T: Clone + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
    F: Fn(&T) -> U + Send + Sync + 'static,
{
    fn evaluate(&self, transform: TransformId, ctx: &mut EvaluationContext) -> anyhow::Result<()> {
        let input = ctx.get_input_rdd::<T>(transform)?;
        let f = self.f.clone();

        ctx.set_output_rdd(transform, input.map(move |item| f(item)))?;
        Ok(())
    }
}

/// Passes a collection through unchanged, calling a function on every element
/// once the output is computed.
pub struct Inspect<T, F> {
    f: Arc<F>,
    _phantom: PhantomData<fn(&T)>,
}

impl<T, F> Inspect<T, F> {
    pub fn new(f: F) -> Self {
        Self {
            f: Arc::new(f),
            _phantom: PhantomData,
        }
    }
}

impl<T, F> TransformEvaluator for Inspect<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    fn evaluate(&self, transform: TransformId, ctx: &mut EvaluationContext) -> anyhow::Result<()> {
        let input = ctx.get_input_rdd::<T>(transform)?;
        let f = self.f.clone();

        let output = input.map(move |item| {
            f(item);
            item.clone()
        });

        ctx.set_output_rdd(transform, output)?;
        Ok(())
    }
}

/// Brings a collection into the local process and publishes it as a view.
pub struct CreateView<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> CreateView<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for CreateView<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TransformEvaluator for CreateView<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn evaluate(&self, transform: TransformId, ctx: &mut EvaluationContext) -> anyhow::Result<()> {
        let input = ctx.get_input(transform)?;
        let output = ctx.get_output(transform)?;
        let collection = ctx.pipeline().collection_handle::<T>(input)?;
        let view = ctx.pipeline().view_handle::<T>(output)?;

        let values = ctx.get_values(collection)?.to_vec()?;
        tracing::debug!(view = ctx.pipeline().name_of(output), count = values.len(), "created view");

        ctx.set_view(view, values);
        Ok(())
    }
}

impl Pipeline {
    /// Declares a collection holding `values`.
    pub fn create<T, C>(
        &mut self,
        name: impl Into<String>,
        values: Vec<T>,
        codec: C,
    ) -> Result<PCollection<T>, PipelineError>
    where
        T: Clone + Send + Sync + 'static,
        C: Codec<T> + 'static,
    {
        let name = name.into();
        let output = self.collection(name.clone(), codec);
        self.apply(name, [], [output.id()], Create::new(values))?;
        Ok(output)
    }

    /// Declares a collection with `f` applied to every element of `input`.
    pub fn map<T, U, C, F>(
        &mut self,
        name: impl Into<String>,
        input: PCollection<T>,
        codec: C,
        f: F,
    ) -> Result<PCollection<U>, PipelineError>
    where
        T: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        C: Codec<U> + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let name = name.into();
        let output = self.collection(name.clone(), codec);
        self.apply(name, [input.id()], [output.id()], Map::new(f))?;
        Ok(output)
    }

    /// Declares a pass-through of `input` that calls `f` on every element.
    /// The output shares the codec of `input`.
    pub fn inspect<T, F>(
        &mut self,
        name: impl Into<String>,
        input: PCollection<T>,
        f: F,
    ) -> Result<PCollection<T>, PipelineError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let codec = self
            .codec(input)
            .ok_or(PipelineError::UnknownValue(input.id().index()))?;

        let name = name.into();
        let output = self.add_collection(name.clone(), codec);
        self.apply(name, [input.id()], [output.id()], Inspect::new(f))?;
        Ok(output)
    }

    /// Declares a view over the contents of `input`.
    pub fn create_view<T>(
        &mut self,
        name: impl Into<String>,
        input: PCollection<T>,
    ) -> Result<PCollectionView<T>, PipelineError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let name = name.into();
        let view = self.view(name.clone());
        self.apply(name, [input.id()], [view.id()], CreateView::<T>::new())?;
        Ok(view)
    }
}
