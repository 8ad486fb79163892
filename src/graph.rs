//! The logical dataflow graph.
//!
//! A [`Pipeline`] is a bipartite directed graph: value nodes are named
//! collections, transform nodes consume and produce them. Edges point from a
//! collection to the transforms reading it, and from a transform to the
//! collections it produces.
//!
//! ## Phantom handles
//!
//! Under the hood the graph is type-erased. A [`ValueId`] is just a node index
//! and is what the evaluation context uses as its map key: two handles are the
//! same collection exactly when they point at the same node, never because
//! their contents look alike.
//!
//! * **Compile-time**: [`PCollection<T>`] and [`PCollectionView<T>`] carry no
//!   data but hold `T` in `PhantomData`, so the compiler checks that a
//!   transform reading a collection expects the element type it was declared
//!   with.
//! * **Runtime**: every value node records the `TypeId` of its element type,
//!   and turning an untyped [`ValueId`] back into a typed handle checks it.

use std::any::{TypeId, type_name};
use std::marker::PhantomData;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::codec::{Codec, SharedCodec};
use crate::context::EvaluationContext;
use crate::core::Dynamic;
use crate::error::{EvaluationError, PipelineError, ResolutionError};

/// Identity of a collection or view in a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) NodeIndex);

impl ValueId {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// Identity of an applied transform in a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransformId(pub(crate) NodeIndex);

impl TransformId {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// A typed handle to a collection of `T`.
#[derive(Debug)]
pub struct PCollection<T> {
    id: ValueId,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> PCollection<T> {
    pub(crate) fn new(id: ValueId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> ValueId {
        self.id
    }
}

impl<T> Clone for PCollection<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PCollection<T> {}

impl<T> PartialEq for PCollection<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for PCollection<T> {}

impl<T> std::hash::Hash for PCollection<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> From<PCollection<T>> for ValueId {
    fn from(handle: PCollection<T>) -> Self {
        handle.id
    }
}

/// A typed handle to a view: the materialized contents of a collection,
/// made available to other transforms as a side input.
#[derive(Debug)]
pub struct PCollectionView<T> {
    id: ValueId,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> PCollectionView<T> {
    pub(crate) fn new(id: ValueId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> ValueId {
        self.id
    }
}

impl<T> Clone for PCollectionView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PCollectionView<T> {}

impl<T> From<PCollectionView<T>> for ValueId {
    fn from(handle: PCollectionView<T>) -> Self {
        handle.id
    }
}

/// Evaluates one applied transform.
///
/// The evaluator reads its declared inputs from the context and registers its
/// declared outputs there. It is only ever called while `transform` is the
/// current transform of `ctx`.
pub trait TransformEvaluator: Send + Sync {
    fn evaluate(&self, transform: TransformId, ctx: &mut EvaluationContext) -> anyhow::Result<()>;
}

impl<F> TransformEvaluator for F
where
    F: Fn(TransformId, &mut EvaluationContext) -> anyhow::Result<()> + Send + Sync,
{
    fn evaluate(&self, transform: TransformId, ctx: &mut EvaluationContext) -> anyhow::Result<()> {
        self(transform, ctx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Collection,
    View,
}

pub(crate) struct ValueNode {
    pub name: String,
    pub kind: ValueKind,
    pub type_id: TypeId,
    pub type_name: &'static str,
    /// `SharedCodec<T>` for collections, `None` for views.
    pub codec: Option<Dynamic>,
}

/// A transform applied to declared inputs and outputs.
pub struct AppliedTransform {
    name: String,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    pub(crate) evaluator: Arc<dyn TransformEvaluator>,
}

impl AppliedTransform {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }
}

pub(crate) enum Node {
    Value(ValueNode),
    Transform(AppliedTransform),
}

/// The logical pipeline: named collections and the transforms between them.
///
/// # Example
///
/// ```rust,no_run
/// use flowbridge::{CborCodec, Pipeline, Session};
///
/// let mut pipeline = Pipeline::new();
/// let numbers = pipeline.create("numbers", vec![1i64, 2, 3], CborCodec::new())?;
/// let squares = pipeline.map("squares", numbers, CborCodec::new(), |x: &i64| x * x)?;
///
/// let mut ctx = pipeline.run(Session::local()?)?;
/// let values = ctx.get_values(squares)?.to_vec()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Pipeline {
    pub(crate) graph: Graph<Node, ()>,
    transforms: Vec<TransformId>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            transforms: Vec::new(),
        }
    }

    /// Declares a collection of `T` encoded with `codec`.
    pub fn collection<T, C>(&mut self, name: impl Into<String>, codec: C) -> PCollection<T>
    where
        T: 'static,
        C: Codec<T> + 'static,
    {
        self.add_collection(name.into(), Arc::new(codec))
    }

    pub(crate) fn add_collection<T>(&mut self, name: String, codec: SharedCodec<T>) -> PCollection<T>
    where
        T: 'static,
    {
        let codec: Dynamic = Arc::new(codec);
        let index = self.graph.add_node(Node::Value(ValueNode {
            name,
            kind: ValueKind::Collection,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            codec: Some(codec),
        }));

        PCollection::new(ValueId(index))
    }

    /// Declares a view over values of `T`.
    pub fn view<T>(&mut self, name: impl Into<String>) -> PCollectionView<T>
    where
        T: 'static,
    {
        let index = self.graph.add_node(Node::Value(ValueNode {
            name: name.into(),
            kind: ValueKind::View,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            codec: None,
        }));

        PCollectionView::new(ValueId(index))
    }

    /// Replaces the declared codec of a collection. Values read back from the
    /// collection afterwards are decoded with the new codec.
    pub fn set_codec<T, C>(&mut self, handle: PCollection<T>, codec: C)
    where
        T: 'static,
        C: Codec<T> + 'static,
    {
        let codec: SharedCodec<T> = Arc::new(codec);
        if let Some(Node::Value(node)) = self.graph.node_weight_mut(handle.id.0) {
            node.codec = Some(Arc::new(codec));
        }
    }

    /// The codec currently declared for a collection.
    pub fn codec<T>(&self, handle: PCollection<T>) -> Option<SharedCodec<T>>
    where
        T: 'static,
    {
        self.value(handle.id)?
            .codec
            .as_ref()?
            .downcast_ref::<SharedCodec<T>>()
            .cloned()
    }

    /// Applies a transform reading `inputs` and producing `outputs`.
    ///
    /// Every collection can be produced by at most one transform.
    pub fn apply<E>(
        &mut self,
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = ValueId>,
        outputs: impl IntoIterator<Item = ValueId>,
        evaluator: E,
    ) -> Result<TransformId, PipelineError>
    where
        E: TransformEvaluator + 'static,
    {
        let inputs: Vec<ValueId> = inputs.into_iter().collect();
        let outputs: Vec<ValueId> = outputs.into_iter().collect();

        for &id in inputs.iter().chain(&outputs) {
            if self.value(id).is_none() {
                return Err(PipelineError::UnknownValue(id.index()));
            }
        }

        for (i, &id) in outputs.iter().enumerate() {
            if self.producer(id).is_some() || outputs[..i].contains(&id) {
                return Err(PipelineError::AlreadyProduced(self.name_of(id).to_string()));
            }
        }

        let index = self.graph.add_node(Node::Transform(AppliedTransform {
            name: name.into(),
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            evaluator: Arc::new(evaluator),
        }));

        for input in inputs {
            self.graph.add_edge(input.0, index, ());
        }

        for output in outputs {
            self.graph.add_edge(index, output.0, ());
        }

        let id = TransformId(index);
        self.transforms.push(id);
        Ok(id)
    }

    /// Like [`apply`](Self::apply), for a closure evaluator.
    pub fn apply_fn<F>(
        &mut self,
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = ValueId>,
        outputs: impl IntoIterator<Item = ValueId>,
        evaluator: F,
    ) -> Result<TransformId, PipelineError>
    where
        F: Fn(TransformId, &mut EvaluationContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.apply(name, inputs, outputs, evaluator)
    }

    /// Applied transforms in the order they were added.
    pub fn transforms(&self) -> &[TransformId] {
        &self.transforms
    }

    pub fn transform(&self, id: TransformId) -> Option<&AppliedTransform> {
        match self.graph.node_weight(id.0)? {
            Node::Transform(transform) => Some(transform),
            Node::Value(_) => None,
        }
    }

    /// The transform producing a collection, if any.
    pub fn producer(&self, id: ValueId) -> Option<TransformId> {
        self.graph
            .neighbors_directed(id.0, Direction::Incoming)
            .next()
            .map(TransformId)
    }

    /// The transforms reading a collection.
    pub fn consumers(&self, id: ValueId) -> Vec<TransformId> {
        let mut consumers: Vec<_> = self
            .graph
            .neighbors_directed(id.0, Direction::Outgoing)
            .map(TransformId)
            .collect();
        consumers.sort();
        consumers.dedup();
        consumers
    }

    /// The declared name of a value, or `"?"` for a foreign handle.
    pub fn name_of(&self, id: ValueId) -> &str {
        self.value(id).map(|node| node.name.as_str()).unwrap_or("?")
    }

    pub(crate) fn value(&self, id: ValueId) -> Option<&ValueNode> {
        match self.graph.node_weight(id.0)? {
            Node::Value(node) => Some(node),
            Node::Transform(_) => None,
        }
    }

    fn typed<T: 'static>(&self, id: ValueId, kind: ValueKind) -> Result<(), EvaluationError> {
        let node = self
            .value(id)
            .ok_or_else(|| ResolutionError::Unknown(format!("#{}", id.index())))?;

        if node.kind != kind || node.type_id != TypeId::of::<T>() {
            return Err(EvaluationError::TypeMismatch {
                name: node.name.clone(),
                expected: type_name::<T>(),
                found: match node.kind {
                    ValueKind::Collection => node.type_name,
                    ValueKind::View => "view",
                },
            });
        }

        Ok(())
    }

    /// Recovers a typed collection handle, checking the declared element type.
    pub fn collection_handle<T: 'static>(&self, id: ValueId) -> Result<PCollection<T>, EvaluationError> {
        self.typed::<T>(id, ValueKind::Collection)?;
        Ok(PCollection::new(id))
    }

    /// Recovers a typed view handle, checking the declared element type.
    pub fn view_handle<T: 'static>(&self, id: ValueId) -> Result<PCollectionView<T>, EvaluationError> {
        self.typed::<T>(id, ValueKind::View)?;
        Ok(PCollectionView::new(id))
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let (label, shape) = match &self.graph[index] {
                Node::Transform(transform) => (transform.name.as_str(), ("[\"", "\"]")),
                Node::Value(value) => (value.name.as_str(), ("([\"", "\"])")),
            };
            let label = label.replace('"', "\\\"");
            writeln!(f, "    {}{}{}{}", index.index(), shape.0, label, shape.1)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CborCodec, JsonCodec};

    fn noop(_: TransformId, _: &mut EvaluationContext) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_handles_compare_by_identity() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection::<i32, _>("same", CborCodec::new());
        let b = pipeline.collection::<i32, _>("same", CborCodec::new());

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(pipeline.name_of(a.id()), pipeline.name_of(b.id()));
    }

    #[test]
    fn test_apply_records_edges() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection::<i32, _>("a", CborCodec::new());
        let b = pipeline.collection::<i32, _>("b", CborCodec::new());

        let t = pipeline.apply_fn("t", [a.id()], [b.id()], noop).unwrap();
        let applied = pipeline.transform(t).unwrap();

        assert_eq!(applied.name(), "t");
        assert_eq!(applied.inputs(), &[a.id()]);
        assert_eq!(applied.outputs(), &[b.id()]);
        assert_eq!(pipeline.producer(b.id()), Some(t));
        assert_eq!(pipeline.producer(a.id()), None);
        assert_eq!(pipeline.consumers(a.id()), vec![t]);
    }

    #[test]
    fn test_single_producer() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection::<i32, _>("a", CborCodec::new());

        pipeline.apply_fn("first", [], [a.id()], noop).unwrap();
        let err = pipeline.apply_fn("second", [], [a.id()], noop).unwrap_err();

        assert!(matches!(err, PipelineError::AlreadyProduced(name) if name == "a"));
    }

    #[test]
    fn test_typed_handle_checks_type() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection::<i32, _>("a", CborCodec::new());
        let v = pipeline.view::<i32>("v");

        assert!(pipeline.collection_handle::<i32>(a.id()).is_ok());
        assert!(matches!(
            pipeline.collection_handle::<String>(a.id()),
            Err(EvaluationError::TypeMismatch { found: "i32", .. })
        ));
        assert!(pipeline.view_handle::<i32>(v.id()).is_ok());
        assert!(pipeline.collection_handle::<i32>(v.id()).is_err());
    }

    #[test]
    fn test_set_codec_replaces_declared() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection::<String, _>("a", CborCodec::new());
        assert_eq!(pipeline.codec(a).unwrap().name(), "cbor");

        pipeline.set_codec(a, JsonCodec::new());
        assert_eq!(pipeline.codec(a).unwrap().name(), "json");
    }

    #[test]
    fn test_display_mermaid() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection::<i32, _>("a", CborCodec::new());
        pipeline.apply_fn("make", [], [a.id()], noop).unwrap();

        let text = pipeline.to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains(r#"0(["a"])"#));
        assert!(text.contains(r#"1["make"]"#));
        assert!(text.contains("1 --> 0"));
    }
}
