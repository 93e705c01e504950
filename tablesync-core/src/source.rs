//! Reading from the stream and committing progress.
//!
//! [StreamSource] owns the consume loop. A dispatcher reads batches and routes every message to
//! the worker owning its partition (`partition mod workers`), so messages of one partition are
//! processed one at a time and in stream order while different partitions proceed in parallel.
//! A worker commits the offset of a message only after its [Handler] returned an [Outcome], which
//! means the record was written or was deliberately skipped. Transient commit failures are
//! retried with backoff. A commit rejected by a group rebalance is dropped, because the
//! partition's new owner resumes from the last committed offset.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::decode::DecodeError;
use crate::message::{Offset, RawMessage};
use crate::metrics::{partition_labels, sync_metrics};
use crate::retry::RetryConfig;
use crate::{Error, Result};

pub(crate) mod kafka;

#[cfg(test)]
pub(crate) mod test_utils;

/// Reads messages from the stream.
#[trait_variant::make(SourceReader: Send)]
#[allow(dead_code)]
pub(crate) trait LocalSourceReader {
    /// Name of the source.
    fn name(&self) -> &'static str;

    /// Next batch of messages, possibly empty. `None` once the stream has ended or the source
    /// was shut down.
    async fn read(&mut self) -> Result<Option<Vec<RawMessage>>>;
}

/// Why an offset could not be committed.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub(crate) enum CommitError {
    /// The partition was reassigned. Its new owner resumes from the last committed offset and
    /// replays the message.
    #[error("Partition reassigned - {0}")]
    Rebalanced(String),

    #[error("Transient commit failure - {0}")]
    Transient(String),

    #[error("Commit failed - {0}")]
    Fatal(String),
}

/// Commits processed offsets for the consumer group.
#[trait_variant::make(SourceAcker: Send)]
#[allow(dead_code)]
pub(crate) trait LocalSourceAcker {
    /// Marks `offset` as processed. The next session of the group resumes after it.
    async fn commit(&mut self, offset: Offset) -> std::result::Result<(), CommitError>;
}

/// Reports how far the consumer group is behind the stream.
#[trait_variant::make(LagReader: Send)]
#[allow(dead_code)]
pub(crate) trait LocalLagReader {
    /// Messages not yet committed by the group, None if unknown.
    async fn pending(&mut self) -> Result<Option<usize>>;
}

/// Processes one message to completion.
#[trait_variant::make(Handler: Send)]
#[allow(dead_code)]
pub(crate) trait LocalHandler {
    /// Ok means the offset of `message` may be committed. Any error leaves it uncommitted.
    async fn handle(&mut self, message: &RawMessage) -> Result<Outcome>;
}

/// Why a message was committed without being written.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SkipReason {
    Decode(DecodeError),
    /// The store rejected the row.
    Constraint(String),
}

impl SkipReason {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            SkipReason::Decode(_) => "decode",
            SkipReason::Constraint(_) => "constraint",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Written,
    Skipped(SkipReason),
}

/// Highest offset committed per partition by this process. It only shadows the commits made in
/// this session, the group's persisted position is applied by the broker on assignment. Commits
/// never move a partition backwards.
#[derive(Debug, Default)]
pub(crate) struct OffsetCursor {
    committed: HashMap<(String, i32), i64>,
}

impl OffsetCursor {
    /// True if committing `offset` would move its partition forward.
    pub(crate) fn is_ahead(&self, offset: &Offset) -> bool {
        self.position(&offset.topic, offset.partition)
            .is_none_or(|committed| offset.offset > committed)
    }

    /// Records `offset` as committed, returns false if it was not ahead.
    pub(crate) fn advance(&mut self, offset: &Offset) -> bool {
        if !self.is_ahead(offset) {
            return false;
        }
        self.committed
            .insert((offset.topic.clone(), offset.partition), offset.offset);
        true
    }

    pub(crate) fn position(&self, topic: &str, partition: i32) -> Option<i64> {
        self.committed
            .get(&(topic.to_string(), partition))
            .copied()
    }
}

/// The reading end of the pipeline.
pub(crate) struct StreamSource<R, A> {
    reader: R,
    acker: A,
    cursor: Arc<Mutex<OffsetCursor>>,
    commit_retry: RetryConfig,
}

impl<R, A> StreamSource<R, A>
where
    R: SourceReader,
    A: SourceAcker + Clone + Send + 'static,
{
    pub(crate) fn new(reader: R, acker: A) -> Self {
        Self {
            reader,
            acker,
            cursor: Arc::new(Mutex::new(OffsetCursor::default())),
            commit_retry: RetryConfig::default(),
        }
    }

    /// Backoff for commits failing with [CommitError::Transient].
    pub(crate) fn commit_retry(mut self, commit_retry: RetryConfig) -> Self {
        self.commit_retry = commit_retry;
        self
    }

    /// Consumes until the stream ends, the token is cancelled or a worker hits a fatal error.
    /// One worker is started per handler. A fatal error cancels the token so that every other
    /// worker stops too, messages still queued for a worker are left uncommitted.
    pub(crate) async fn consume<H>(
        mut self,
        handlers: Vec<H>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        H: Handler + Send + 'static,
    {
        if handlers.is_empty() {
            return Err(Error::Config("at least one worker is required".to_string()));
        }
        let workers = handlers.len();
        info!(source = self.reader.name(), workers, "Starting to consume");

        let mut senders = Vec::with_capacity(workers);
        let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(workers);
        for (id, handler) in handlers.into_iter().enumerate() {
            // one in flight per worker, the dispatcher waits for a busy partition
            let (tx, rx) = mpsc::channel(1);
            senders.push(tx);
            let worker = PartitionWorker {
                id,
                handler,
                acker: self.acker.clone(),
                cursor: Arc::clone(&self.cursor),
                retry: self.commit_retry.clone(),
                messages: rx,
                cancel: cancel.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        let dispatched = self.dispatch(&senders, &cancel).await;
        // workers drain what is queued and stop once their channel closes
        drop(senders);

        let mut result = dispatched;
        for task in tasks {
            let worker_result = task
                .await
                .map_err(|e| Error::Worker(format!("partition worker panicked: {e:?}")))
                .and_then(|r| r);
            if let Err(e) = worker_result
                && result.is_ok()
            {
                result = Err(e);
            }
        }
        info!(source = self.reader.name(), "Stopped consuming");
        result
    }

    async fn dispatch(
        &mut self,
        senders: &[mpsc::Sender<RawMessage>],
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                batch = self.reader.read() => batch,
            };

            let messages = match batch {
                Ok(Some(messages)) => messages,
                Ok(None) => {
                    info!("Stream ended");
                    return Ok(());
                }
                Err(e) => {
                    error!(?e, "Failed to read from the stream");
                    cancel.cancel();
                    return Err(e);
                }
            };

            for message in messages {
                sync_metrics()
                    .read_total
                    .get_or_create(&partition_labels(message.partition))
                    .inc();
                let worker = message.partition.rem_euclid(senders.len() as i32) as usize;
                let Some(sender) = senders.get(worker) else {
                    return Err(Error::Worker(format!("no worker with index {worker}")));
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = sender.send(message) => {
                        // a worker only goes away after a fatal error, which cancels the token
                        if sent.is_err() {
                            warn!(worker, "Partition worker is gone, stopping dispatch");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

struct PartitionWorker<H, A> {
    id: usize,
    handler: H,
    acker: A,
    cursor: Arc<Mutex<OffsetCursor>>,
    retry: RetryConfig,
    messages: mpsc::Receiver<RawMessage>,
    cancel: CancellationToken,
}

impl<H, A> PartitionWorker<H, A>
where
    H: Handler,
    A: SourceAcker,
{
    async fn run(mut self) -> Result<()> {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let offset = message.position();

            let outcome = match self.handler.handle(&message).await {
                Ok(outcome) => outcome,
                Err(Error::Cancelled(reason)) => {
                    info!(worker = self.id, %offset, reason, "Shut down mid-write, offset left uncommitted");
                    break;
                }
                Err(e) => {
                    error!(worker = self.id, %offset, error = %e, "Fatal: halting partition");
                    self.cancel.cancel();
                    return Err(e);
                }
            };
            trace!(worker = self.id, %offset, ?outcome, "Processed message");

            match self.commit(&offset).await {
                Ok(()) => {}
                Err(Error::Cancelled(reason)) => {
                    info!(worker = self.id, %offset, reason, "Shut down while committing, offset left uncommitted");
                    break;
                }
                Err(e) => {
                    error!(worker = self.id, %offset, error = %e, "Fatal: offset commit failed");
                    self.cancel.cancel();
                    return Err(e);
                }
            }
        }
        debug!(worker = self.id, "Partition worker stopped");
        Ok(())
    }

    async fn commit(&mut self, offset: &Offset) -> Result<()> {
        if !self.cursor.lock().is_ahead(offset) {
            debug!(%offset, "Offset already committed");
            return Ok(());
        }
        let mut backoff = self.retry.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let reason = match self.acker.commit(offset.clone()).await {
                Ok(()) => break,
                Err(CommitError::Rebalanced(reason)) => {
                    warn!(worker = self.id, %offset, reason, "Partition reassigned, offset left to its new owner");
                    return Ok(());
                }
                Err(CommitError::Fatal(reason)) => return Err(Error::Source(reason)),
                Err(CommitError::Transient(reason)) => reason,
            };

            let Some(delay) = backoff.next() else {
                return Err(Error::Source(format!(
                    "commit of {offset} failed after {attempt} attempts - {reason}"
                )));
            };
            warn!(worker = self.id, %offset, attempt, ?delay, reason, "Commit failed, retrying");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("commit of {offset}")));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.cursor.lock().advance(offset);
        sync_metrics()
            .commit_total
            .get_or_create(&partition_labels(offset.partition))
            .inc();
        debug!(%offset, "Committed offset");
        Ok(())
    }
}
