//! Evaluating a [`Pipeline`] against an engine session.

use std::sync::Arc;

use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::EvaluationContext;
use crate::engine::Session;
use crate::error::PipelineError;
use crate::graph::{Node, Pipeline, TransformId};
use crate::runtime::RuntimeContext;
use crate::utils::{progress_style, step_style};

impl Pipeline {
    /// Evaluates every transform in dependency order, then forces all leaf
    /// collections.
    ///
    /// Evaluation is blocking. The returned context holds the results and
    /// reports [`PipelineState::Done`](crate::PipelineState::Done).
    pub fn run(self, session: Session) -> Result<EvaluationContext, PipelineError> {
        let runtime = Arc::new(RuntimeContext::new(session.clone()));
        self.run_with(session, runtime)
    }

    /// Like [`run`](Self::run), sharing a runtime whose aggregators may have
    /// been registered before the run.
    pub fn run_with(
        self,
        session: Session,
        runtime: Arc<RuntimeContext>,
    ) -> Result<EvaluationContext, PipelineError> {
        let order = self.evaluation_order()?;
        let mut ctx = EvaluationContext::with_runtime(session, Arc::new(self), runtime);

        evaluate(&mut ctx, &order)?;
        ctx.compute_outputs()?;

        Ok(ctx)
    }

    /// Transforms in topological order.
    fn evaluation_order(&self) -> Result<Vec<TransformId>, PipelineError> {
        let sorted = petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| PipelineError::Cycle(self.node_name(cycle.node_id()).to_string()))?;

        Ok(sorted
            .into_iter()
            .filter(|&index| matches!(self.graph[index], Node::Transform(_)))
            .map(TransformId)
            .collect())
    }

    fn node_name(&self, index: NodeIndex) -> &str {
        match &self.graph[index] {
            Node::Transform(transform) => transform.name(),
            Node::Value(value) => &value.name,
        }
    }
}

fn evaluate(ctx: &mut EvaluationContext, order: &[TransformId]) -> Result<(), PipelineError> {
    let root_span = tracing::span!(Level::INFO, "evaluating_pipeline");
    root_span.pb_set_length(order.len() as u64);
    root_span.pb_set_style(&progress_style());
    root_span.pb_set_message("Evaluating transforms...");
    let _enter = root_span.enter();

    let pipeline = ctx.pipeline.clone();
    let step_style = step_style();

    for &id in order {
        let Some(transform) = pipeline.transform(id) else {
            continue;
        };

        let span = tracing::span!(Level::INFO, "transform", name = transform.name());
        span.pb_set_style(&step_style);
        span.pb_set_message(&format!("Evaluating {}", transform.name()));
        let _enter = span.enter();

        let mut step = ctx.step(id);
        transform
            .evaluator
            .evaluate(id, &mut step)
            .map_err(|err| PipelineError::Transform(transform.name().to_string(), err))?;

        tracing::debug!("evaluated");
        root_span.pb_inc(1);
    }

    tracing::info!(transforms = order.len(), "pipeline evaluated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CborCodec;

    #[test]
    fn test_order_follows_dependencies() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection::<i32, _>("a", CborCodec::new());
        let b = pipeline.collection::<i32, _>("b", CborCodec::new());

        let second = pipeline.apply_fn("second", [a.id()], [b.id()], |_, _| Ok(())).unwrap();
        let first = pipeline.apply_fn("first", [], [a.id()], |_, _| Ok(())).unwrap();

        assert_eq!(pipeline.evaluation_order().unwrap(), vec![first, second]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.collection::<i32, _>("a", CborCodec::new());
        let b = pipeline.collection::<i32, _>("b", CborCodec::new());

        pipeline.apply_fn("ab", [a.id()], [b.id()], |_, _| Ok(())).unwrap();
        pipeline.apply_fn("ba", [b.id()], [a.id()], |_, _| Ok(())).unwrap();

        let err = pipeline.run(Session::local().unwrap()).unwrap_err();
        assert!(matches!(err, PipelineError::Cycle(_)));
    }

    #[test]
    fn test_failure_names_transform() {
        let mut pipeline = Pipeline::new();
        pipeline
            .apply_fn("broken", [], [], |_, _| anyhow::bail!("boom"))
            .unwrap();

        let err = pipeline.run(Session::local().unwrap()).unwrap_err();
        assert!(matches!(&err, PipelineError::Transform(name, _) if name == "broken"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_step_cleared_after_run() {
        let mut pipeline = Pipeline::new();
        pipeline
            .apply_fn("check", [], [], |id, ctx: &mut EvaluationContext| {
                anyhow::ensure!(ctx.current_transform() == Some(id));
                Ok(())
            })
            .unwrap();

        let ctx = pipeline.run(Session::local().unwrap()).unwrap();
        assert_eq!(ctx.current_transform(), None);
    }
}
