use thiserror::Error;

use drover_queue::QueueError;

use crate::priority::QueueTier;

/// Errors raised by a session cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unknown cache: {0}")]
    Unknown(String),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache value error: {0}")]
    Value(#[from] serde_json::Error),
}

/// Misconfigured function registration. Raised at load time.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task function registered twice: {0}")]
    Duplicate(String),
}

/// Dispatch failures. The first two indicate a deployment defect, not bad data.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no task function registered as '{0}'")]
    UnknownHandler(String),

    #[error("task function '{0}' is not dispatch-eligible")]
    NotDispatchable(String),

    #[error("malformed queue message: {0}")]
    Malformed(String),

    #[error("corrupt session {key}: {reason}")]
    CorruptSession { key: String, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Spool(#[from] SpoolError),
}

/// Error returned by a task function.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Infrastructure hiccup; the standard wrapper retries once.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Business failure; recorded as output and treated as done.
    #[error("task failed: {0}")]
    Failed(String),
}

impl From<CacheError> for TaskError {
    fn from(e: CacheError) -> Self {
        TaskError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::Failed(e.to_string())
    }
}

impl From<EngineError> for TaskError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Cache(e) => e.into(),
            EngineError::Queue(e) => TaskError::Transient(e.to_string()),
            other => TaskError::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AccumulateError {
    #[error("cannot accumulate {new} into {old}")]
    Incompatible {
        old: &'static str,
        new: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spool record error: {0}")]
    Record(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Invalid(String),
}

/// Umbrella error for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Spool(#[from] SpoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Accumulate(#[from] AccumulateError),

    #[error("no queue configured for tier {0}")]
    NoQueue(QueueTier),

    #[error("message body error: {0}")]
    Body(#[from] serde_json::Error),
}
