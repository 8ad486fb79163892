use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Couldn't encode value with the {codec} codec.\n{reason}")]
    Encode { codec: &'static str, reason: String },

    #[error("Couldn't decode value with the {codec} codec.\n{reason}")]
    Decode { codec: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unsupported master '{0}', expected one of: local, local[N], local[*]")]
    UnsupportedMaster(String),

    #[error("Master '{0}' requests zero worker threads")]
    ZeroParallelism(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Couldn't parse session config.\n{0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Dataset {id} is already named '{name}'")]
    NameImmutable { id: usize, name: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Task failed:\n{0}")]
    Task(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("Aggregator '{0}' not found")]
    NotFound(String),

    #[error("Aggregator '{0}' was not registered for this run")]
    NotRegistered(String),

    #[error("Aggregator '{name}' holds `{found}`, requested `{expected}`")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Cannot resolve unknown value '{0}'")]
    Unknown(String),

    #[error("Value '{name}' is not resolvable: expected exactly one element, found {count}")]
    NotSingleton { name: String, count: usize },
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Can only be called with the current transform: requested '{requested}', current {current}")]
    InvalidState { requested: String, current: String },

    #[error("Transform '{name}' declares {count} {role}s, expected exactly one")]
    Arity {
        name: String,
        role: &'static str,
        count: usize,
    },

    #[error("Collection '{name}' holds `{found}`, requested `{expected}`")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cycle detected in pipeline graph at '{0}'")]
    Cycle(String),

    #[error("Collection '{0}' already has a producing transform")]
    AlreadyProduced(String),

    #[error("Node {0} is not a value of this pipeline")]
    UnknownValue(usize),

    #[error("Transform '{0}':\n{1}")]
    Transform(String, anyhow::Error),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}
