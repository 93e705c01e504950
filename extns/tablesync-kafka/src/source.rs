use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{Error, KafkaSaslAuth, Result, StartPosition, TlsConfig};

/// Consecutive failed receives tolerated before a read gives up.
const MAX_RECV_FAILURES: usize = 10;
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Bound on the metadata, watermark and committed offset queries behind the lag.
const LAG_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic to consume messages from.
    pub topic: String,
    /// The consumer group whose committed offsets are advanced.
    pub consumer_group: String,
    /// Client identity reported to the brokers.
    pub client_id: String,
    /// Where a group without committed offsets starts.
    pub start_position: StartPosition,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

impl KafkaSourceConfig {
    fn servers(&self) -> String {
        self.brokers.join(",")
    }

    /// librdkafka settings for the consumer. Raw overrides are applied first so that they can
    /// never re-enable auto commit or move the consumer to another group.
    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", self.start_position.auto_offset_reset());

        if !self.kafka_raw_config.is_empty() {
            let overrides: Vec<String> = self
                .kafka_raw_config
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            info!(overrides = overrides.join(", "), "Applying raw kafka config");
            for (key, value) in &self.kafka_raw_config {
                client_config.set(key, value);
            }
        }

        client_config
            .set("group.id", &self.consumer_group)
            .set("client.id", &self.client_id)
            .set("bootstrap.servers", self.servers())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        crate::update_auth_config(&mut client_config, self.tls.clone(), self.auth.clone());
        client_config
    }
}

/// A message read from Kafka, owned by the caller until it has been processed.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub topic: String,
    /// The user payload. Empty if the record carried no payload.
    pub value: Bytes,
    pub key: Option<String>,
    pub partition: i32,
    pub offset: i64,
    pub headers: HashMap<String, String>,
    /// Milliseconds since epoch, None if the broker did not provide one.
    pub timestamp: Option<i64>,
}

impl From<&BorrowedMessage<'_>> for KafkaMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| {
                        let value = h.value.map(String::from_utf8_lossy).unwrap_or_default();
                        (h.key.to_string(), value.into_owned())
                    })
                    .collect()
            })
            .unwrap_or_default();

        KafkaMessage {
            topic: message.topic().to_string(),
            value: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            partition: message.partition(),
            offset: message.offset(),
            headers,
            timestamp: message.timestamp().to_millis(),
        }
    }
}

/// Position of a processed message. Committing it moves the group to `offset + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Logs group membership changes and commit results reported by librdkafka.
struct SyncContext;

impl ClientContext for SyncContext {}

impl ConsumerContext for SyncContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(?rebalance, "Partitions about to be rebalanced");
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(?rebalance, "Partitions rebalanced");
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(?offsets, "Committed offsets"),
            Err(e) => warn!(?e, ?offsets, "Offset commit failed"),
        }
    }
}

type SyncConsumer = StreamConsumer<SyncContext>;

enum Request {
    Read(oneshot::Sender<Option<Result<Vec<KafkaMessage>>>>),
    Commit(KafkaOffset, oneshot::Sender<Result<()>>),
    Pending(oneshot::Sender<Result<usize>>),
}

/// Owns the consumer. Requests are served one at a time in arrival order.
struct ConsumerActor {
    consumer: Arc<SyncConsumer>,
    topic: String,
    batch_size: usize,
    read_timeout: Duration,
    requests: mpsc::Receiver<Request>,
    cancel: CancellationToken,
}

impl ConsumerActor {
    async fn run(mut self) {
        info!(topic = self.topic, "Kafka consumer started");
        while let Some(request) = self.requests.recv().await {
            // a requester that stopped waiting (shutdown) has dropped its receiver
            let delivered = match request {
                Request::Read(reply) => reply.send(self.read_batch().await).is_ok(),
                Request::Commit(offset, reply) => reply.send(self.commit(offset).await).is_ok(),
                Request::Pending(reply) => reply.send(self.lag().await).is_ok(),
            };
            if !delivered {
                debug!("Requester went away before the reply was sent");
            }
        }
        info!(topic = self.topic, "Kafka consumer stopped");
    }

    /// Up to `batch_size` messages, whatever arrived before the read timeout. None once
    /// cancelled.
    async fn read_batch(&mut self) -> Option<Result<Vec<KafkaMessage>>> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let deadline = Instant::now() + self.read_timeout;
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut failures = 0;
        while batch.len() < self.batch_size {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                received = self.consumer.recv() => received,
            };

            match received {
                Ok(message) => {
                    failures = 0;
                    batch.push(KafkaMessage::from(&message));
                }
                Err(e) if failures < MAX_RECV_FAILURES => {
                    failures += 1;
                    error!(?e, failures, "Failed to receive from Kafka, retrying");
                    tokio::time::sleep(RECV_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Some(Err(Error::Kafka(format!(
                        "Receiving failed {} times in a row: {e}",
                        failures + 1
                    ))));
                }
            }
        }
        trace!(count = batch.len(), "Read batch from Kafka");
        Some(Ok(batch))
    }

    async fn commit(&mut self, offset: KafkaOffset) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        // the group stores the next offset to read
        tpl.add_partition_offset(
            &offset.topic,
            offset.partition,
            Offset::Offset(offset.offset + 1),
        )
        .map_err(|e| Error::Kafka(format!("Building commit for {offset:?}: {e}")))?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| Error::Other(format!("Commit task failed: {e:?}")))?
            .map_err(|e| commit_error(e, &offset))
    }

    async fn lag(&mut self) -> Result<usize> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || consumer_lag(&consumer, &topic))
            .await
            .map_err(|e| Error::Other(format!("Lag task failed: {e:?}")))?
    }
}

/// Sorts a failed commit by what the caller can do about it.
fn commit_error(err: KafkaError, offset: &KafkaOffset) -> Error {
    let message = format!("Committing {}/{}@{}: {err}", offset.topic, offset.partition, offset.offset);
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::UnknownMemberId
            | RDKafkaErrorCode::AssignmentLost
            | RDKafkaErrorCode::StaleMemberEpoch
            | RDKafkaErrorCode::FencedInstanceId,
        ) => Error::Rebalanced(message),
        Some(
            RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown,
        ) => Error::CommitRetriable(message),
        _ => Error::Kafka(message),
    }
}

/// Sum over the topic's partitions of high watermark minus the group's committed offset. A
/// partition without a committed offset counts from its low watermark.
fn consumer_lag(consumer: &SyncConsumer, topic: &str) -> Result<usize> {
    let metadata = consumer
        .fetch_metadata(Some(topic), LAG_QUERY_TIMEOUT)
        .map_err(|e| Error::Kafka(format!("Fetching metadata of {topic}: {e}")))?;
    let Some(topic_metadata) = metadata.topics().first() else {
        warn!(topic, "Topic has no metadata");
        return Ok(0);
    };

    let mut partitions = TopicPartitionList::new();
    for partition in topic_metadata.partitions() {
        partitions.add_partition(topic, partition.id());
    }
    let committed = consumer
        .committed_offsets(partitions, LAG_QUERY_TIMEOUT)
        .map_err(|e| Error::Kafka(format!("Fetching committed offsets of {topic}: {e}")))?;

    let mut lag = 0;
    for element in committed.elements_for_topic(topic) {
        let (low, high) = consumer
            .fetch_watermarks(topic, element.partition(), LAG_QUERY_TIMEOUT)
            .map_err(|e| Error::Kafka(format!("Fetching watermarks of {topic}: {e}")))?;
        let position = match element.offset() {
            Offset::Offset(offset) => offset,
            _ => low,
        };
        lag += usize::try_from(high - position).unwrap_or(0);
    }
    Ok(lag)
}

/// Cloneable handle to the consumer actor. Reads and commits are serialized through the actor,
/// so a commit waits at most one read timeout.
#[derive(Clone)]
pub struct KafkaSource {
    requests: mpsc::Sender<Request>,
}

impl KafkaSource {
    /// Creates the consumer, subscribes it and verifies the brokers are reachable.
    pub async fn connect(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let servers = config.servers();
        let consumer: SyncConsumer = config
            .client_config()
            .create_with_context(SyncContext)
            .map_err(|e| Error::Connection {
                server: servers.clone(),
                error: e.to_string(),
            })?;
        // a missing topic does not fail here, it shows up on read
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| Error::Kafka(format!("Subscribing to {}: {e}", config.topic)))?;

        let (tx, rx) = mpsc::channel(10);
        let mut actor = ConsumerActor {
            consumer: Arc::new(consumer),
            topic: config.topic,
            batch_size,
            read_timeout,
            requests: rx,
            cancel,
        };

        // subscribe() succeeds with bad credentials or unreachable brokers, a lag query does not
        actor.lag().await.map_err(|e| Error::Connection {
            server: servers,
            error: format!("probing consumer lag: {e}"),
        })?;

        // ends once every handle has been dropped
        tokio::spawn(actor.run());
        Ok(Self { requests: tx })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| Error::Other("Kafka consumer actor terminated".into()))?;
        rx.await
            .map_err(|_| Error::Other("Kafka consumer actor dropped the request".into()))
    }

    /// Reads up to `batch_size` messages, returning early on the read timeout. `None` once the
    /// source has been cancelled.
    pub async fn read_messages(&self) -> Result<Option<Vec<KafkaMessage>>> {
        self.request(Request::Read).await?.transpose()
    }

    /// Commits the group offset past `offset`.
    pub async fn commit_offset(&self, offset: KafkaOffset) -> Result<()> {
        self.request(|reply| Request::Commit(offset, reply)).await?
    }

    pub async fn pending_messages(&self) -> Result<Option<usize>> {
        self.request(Request::Pending).await?.map(Some)
    }
}

#[cfg(feature = "kafka-tests-utils")]
pub mod test_utils {
    use std::time::Duration;

    use rdkafka::ClientConfig;
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::producer::{FutureProducer, FutureRecord};

    const TEST_BROKER: &str = "localhost:9092";

    /// Creates a fresh single partition topic on the local broker.
    pub async fn create_topic() -> (FutureProducer, String) {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", TEST_BROKER);

        let topic = format!("tablesync_test_{}", uuid::Uuid::new_v4().simple());
        let admin: AdminClient<_> = client_config.create().expect("admin client");
        admin
            .create_topics(
                &[NewTopic::new(&topic, 1, TopicReplication::Fixed(1))],
                &AdminOptions::new(),
            )
            .await
            .expect("create topic");

        let producer: FutureProducer = client_config.create().expect("producer");
        (producer, topic)
    }

    /// Produces `{"id": "<i>", "valor": <i>}` for i in 0..count.
    pub async fn produce_records(producer: &FutureProducer, topic: &str, count: usize) {
        for i in 0..count {
            let payload = format!(r#"{{"id": "{i}", "valor": {i}}}"#);
            let key = i.to_string();
            producer
                .send(
                    FutureRecord::to(topic).payload(&payload).key(&key),
                    Duration::from_secs(5),
                )
                .await
                .expect("produce record");
        }
    }
}
