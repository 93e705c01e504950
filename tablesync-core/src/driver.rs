//! Per-message processing: decode the payload, build the write and apply it with bounded retries.
//!
//! The outcome decides whether the offset may be committed:
//!
//! | result of the step                         | outcome                        |
//! |--------------------------------------------|--------------------------------|
//! | payload cannot be decoded                  | skipped, committed             |
//! | store rejects the row                      | skipped, committed             |
//! | write succeeds (possibly after retries)    | written, committed             |
//! | transient failures outlast the retries     | [Error::SinkUnavailable]       |
//! | store unusable                             | [Error::Connection]            |
//! | shutdown while waiting to retry            | [Error::Cancelled]             |
//!
//! Every error leaves the offset uncommitted so that the message is redelivered.

use std::time::{Duration, Instant};

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::decode::Decoder;
use crate::message::{RawMessage, WriteCommand};
use crate::metrics::{partition_labels, skip_labels, sync_metrics};
use crate::retry::RetryConfig;
use crate::sink::{Sink, SinkError};
use crate::source::{Handler, Outcome, SkipReason};
use crate::{Error, Result};

pub(crate) struct Driver<S> {
    decoder: Decoder,
    sink: S,
    retry: RetryConfig,
    write_timeout: Duration,
    cancel: CancellationToken,
}

impl<S> Driver<S>
where
    S: Sink,
{
    pub(crate) fn new(
        decoder: Decoder,
        sink: S,
        retry: RetryConfig,
        write_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            decoder,
            sink,
            retry,
            write_timeout,
            cancel,
        }
    }

    pub(crate) async fn process(&mut self, message: &RawMessage) -> Result<Outcome> {
        trace!(
            offset = %message.position(),
            key = ?message.key,
            headers = ?message.headers,
            timestamp = ?message.timestamp,
            "Received message"
        );

        let record = match self.decoder.decode(&message.payload) {
            Ok(record) => record,
            Err(e) => {
                let id = e.identifier().map(ToString::to_string);
                warn!(
                    id,
                    topic = message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    reason = %e,
                    "DecodeError: skipping message"
                );
                let reason = SkipReason::Decode(e);
                sync_metrics()
                    .skipped_total
                    .get_or_create(&skip_labels(message.partition, reason.label()))
                    .inc();
                return Ok(Outcome::Skipped(reason));
            }
        };

        self.write_with_retry(message, WriteCommand::from(record))
            .await
    }

    async fn write_with_retry(
        &mut self,
        message: &RawMessage,
        command: WriteCommand,
    ) -> Result<Outcome> {
        let id = command.key.to_string();
        let labels = partition_labels(message.partition);
        let mut backoff = self.retry.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let start = Instant::now();
            let result = match time::timeout(self.write_timeout, self.sink.write(&command)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Transient(format!(
                    "write did not complete within {:?}",
                    self.write_timeout
                ))),
            };

            let reason = match result {
                Ok(ack) => {
                    let metrics = sync_metrics();
                    metrics.write_total.get_or_create(&labels).inc();
                    metrics
                        .write_time
                        .get_or_create(&labels)
                        .observe(start.elapsed().as_micros() as f64);
                    info!(
                        id,
                        topic = message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        attempt,
                        rows_affected = ack.rows_affected,
                        "Record synced"
                    );
                    return Ok(Outcome::Written);
                }
                Err(SinkError::ConstraintViolation(reason)) => {
                    warn!(
                        id,
                        topic = message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        reason,
                        "ConstraintViolation: skipping message"
                    );
                    let reason = SkipReason::Constraint(reason);
                    sync_metrics()
                        .skipped_total
                        .get_or_create(&skip_labels(message.partition, reason.label()))
                        .inc();
                    return Ok(Outcome::Skipped(reason));
                }
                Err(SinkError::Connection(reason)) => {
                    return Err(Error::Connection(format!(
                        "{} rejected the write of record {id} - {reason}",
                        self.sink.name()
                    )));
                }
                Err(SinkError::Transient(reason)) => reason,
            };

            let Some(delay) = backoff.next() else {
                error!(id, attempts = attempt, reason, "Retries exhausted");
                return Err(Error::SinkUnavailable {
                    id,
                    attempts: attempt,
                    reason,
                });
            };
            warn!(id, attempt, ?delay, reason, "TransientError: retrying write");
            sync_metrics().retry_total.get_or_create(&labels).inc();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled(format!(
                        "record {id} at {} while waiting to retry",
                        message.position()
                    )));
                }
                _ = time::sleep(delay) => {}
            }
        }
    }
}

impl<S> Handler for Driver<S>
where
    S: Sink + Send,
{
    async fn handle(&mut self, message: &RawMessage) -> Result<Outcome> {
        self.process(message).await
    }
}
