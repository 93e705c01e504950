use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures that leave the consume loop. Per-message problems (undecodable payloads, rejected
/// rows) are not errors at this level, they are skipped and committed.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    /// Source or Sink unreachable.
    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    /// Transient write failures outlasted the retry budget. The offset of the record is not
    /// committed.
    #[error("Sink unavailable for record {id} after {attempts} attempts - {reason}")]
    SinkUnavailable {
        id: String,
        attempts: usize,
        reason: String,
    },

    /// Shutdown arrived while a write was waiting to be retried, or its commit was.
    #[error("Cancelled while processing {0}")]
    Cancelled(String),

    #[error("metrics Error - {0}")]
    Metrics(String),

    #[error("Worker Error - {0}")]
    Worker(String),
}
