#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod codec;
mod config;
mod context;
mod core;
pub mod engine;
mod error;
mod graph;
mod runner;
mod runtime;
mod transforms;
mod utils;

pub use crate::codec::{CborCodec, Codec, JsonCodec, SharedCodec, from_byte_arrays, to_byte_arrays};
pub use crate::config::{Master, SessionConfig};
pub use crate::context::{EvaluationContext, LocalValues, Step};
pub use crate::core::PipelineState;
pub use crate::engine::{Dataset, Session};
pub use crate::error::*;
pub use crate::graph::{
    AppliedTransform, PCollection, PCollectionView, Pipeline, TransformEvaluator, TransformId, ValueId,
};
pub use crate::runtime::{Aggregator, AggregatorValues, CombineFn, Max, Min, RuntimeContext, Sum};
pub use crate::transforms::{Create, CreateView, Inspect, Map};

/// Installs a global subscriber printing events to stderr, with progress bars
/// for long running spans. The filter is read from `RUST_LOG` and defaults to
/// `info`.
///
/// Fails if a global subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
