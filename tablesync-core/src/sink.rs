//! Writing records into the target table.

use thiserror::Error;

use crate::message::WriteCommand;

pub(crate) mod postgres;

#[cfg(test)]
pub(crate) mod test_utils;

/// How a single write failed. The driver decides between skipping, retrying and stopping on this
/// classification alone.
#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum SinkError {
    /// The row was rejected. Writing it again cannot succeed.
    #[error("constraint violation - {0}")]
    ConstraintViolation(String),

    /// The same write may succeed later.
    #[error("transient failure - {0}")]
    Transient(String),

    /// The store is unusable until it is reconfigured.
    #[error("connection failure - {0}")]
    Connection(String),
}

/// A write that reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ack {
    pub(crate) rows_affected: u64,
}

/// Applies write commands to the store. Writes are idempotent: applying the same command twice
/// leaves the store as applying it once.
#[trait_variant::make(Sink: Send)]
#[allow(dead_code)]
pub(crate) trait LocalSink {
    fn name(&self) -> &'static str;

    async fn write(&mut self, command: &WriteCommand) -> Result<Ack, SinkError>;
}
