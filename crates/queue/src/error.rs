use thiserror::Error;

/// Failures talking to a durable queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Client setup or credentials.
    #[error("queue connection failed: {0}")]
    Connection(String),

    #[error("queue '{0}' does not exist")]
    NotFound(String),

    #[error("unreadable message from provider: {0}")]
    Parse(String),

    #[error("send rejected: {0}")]
    Send(String),

    /// Delete or visibility change refused, usually a stale receipt handle.
    #[error("receipt rejected: {0}")]
    Ack(String),

    #[error("{0}")]
    Provider(String),
}
