use chrono::DateTime;
use tablesync_kafka::{KafkaMessage, KafkaOffset, KafkaSource};
use tokio_util::sync::CancellationToken;

use crate::config::components::source::SourceConfig;
use crate::error::Error;
use crate::message::{Offset, RawMessage};
use crate::source;
use crate::source::CommitError;

impl From<KafkaMessage> for RawMessage {
    fn from(message: KafkaMessage) -> Self {
        RawMessage {
            topic: message.topic,
            partition: message.partition,
            offset: message.offset,
            timestamp: message.timestamp.and_then(DateTime::from_timestamp_millis),
            key: message.key,
            headers: message.headers,
            payload: message.value,
        }
    }
}

impl From<Offset> for KafkaOffset {
    fn from(offset: Offset) -> Self {
        KafkaOffset {
            topic: offset.topic,
            partition: offset.partition,
            offset: offset.offset,
        }
    }
}

impl From<tablesync_kafka::Error> for Error {
    fn from(value: tablesync_kafka::Error) -> Self {
        match value {
            tablesync_kafka::Error::Connection { server, error } => {
                Error::Connection(format!("Failed to connect to Kafka {server} - {error}"))
            }
            tablesync_kafka::Error::Kafka(e)
            | tablesync_kafka::Error::Rebalanced(e)
            | tablesync_kafka::Error::CommitRetriable(e)
            | tablesync_kafka::Error::Other(e) => Error::Source(e),
        }
    }
}

pub(crate) async fn new_kafka_source(
    config: SourceConfig,
    cancel: CancellationToken,
) -> crate::Result<KafkaSource> {
    Ok(KafkaSource::connect(
        config.kafka,
        config.read_batch_size,
        config.read_timeout,
        cancel,
    )
    .await?)
}

impl source::SourceReader for KafkaSource {
    fn name(&self) -> &'static str {
        "Kafka"
    }

    async fn read(&mut self) -> crate::Result<Option<Vec<RawMessage>>> {
        Ok(self
            .read_messages()
            .await?
            .map(|messages| messages.into_iter().map(RawMessage::from).collect()))
    }
}

impl From<tablesync_kafka::Error> for CommitError {
    fn from(value: tablesync_kafka::Error) -> Self {
        match value {
            tablesync_kafka::Error::Rebalanced(e) => CommitError::Rebalanced(e),
            tablesync_kafka::Error::CommitRetriable(e) => CommitError::Transient(e),
            other => CommitError::Fatal(other.to_string()),
        }
    }
}

impl source::SourceAcker for KafkaSource {
    async fn commit(&mut self, offset: Offset) -> Result<(), CommitError> {
        Ok(self.commit_offset(offset.into()).await?)
    }
}

impl source::LagReader for KafkaSource {
    async fn pending(&mut self) -> crate::Result<Option<usize>> {
        Ok(self.pending_messages().await?)
    }
}
