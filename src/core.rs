use std::any::Any;
use std::sync::Arc;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// The state reported by a finished evaluation.
///
/// Evaluation is synchronous and runs to completion before the caller gets
/// the context back, so there are no intermediate states to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Every transform has been evaluated and every leaf forced.
    Done,
}
